//! Core infrastructure.
//!
//! - `config` - Settings parsing and validation
//! - `cancel` - Cancellation token for provisioning attempts

pub mod cancel;
pub mod config;

pub use cancel::{CancelSource, CancelToken};
pub use config::{Config, LogFormat, Settings, TelemetryConfig};
