//! fleetprov CLI.
//!
//! - `fleetprov provision` - Run the fleet provisioning flow
//! - `fleetprov identity` - Check a certificate/key pair

mod args;
pub mod commands;

pub use args::{Cli, Commands, IdentityArgs, ProvisionArgs};
