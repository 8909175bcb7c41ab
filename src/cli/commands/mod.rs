//! CLI command implementations.

mod identity;
mod provision;

pub use identity::run_identity;
pub use provision::run_provision;
