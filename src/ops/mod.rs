//! Operations and observability.
//!
//! - `telemetry` - Tracing subscriber setup

pub mod telemetry;

pub use telemetry::init_tracing;
