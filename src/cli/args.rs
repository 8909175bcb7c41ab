//! CLI argument definitions using clap.

use crate::config::LogFormat;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// fleetprov - exchange a claim certificate for a permanent device identity.
#[derive(Parser)]
#[command(name = "fleetprov")]
#[command(version)]
#[command(about = "Fleet provisioning bootstrap agent")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the provisioning flow with the claim certificate
    Provision(ProvisionArgs),

    /// Load a certificate and private key pair and describe it
    Identity(IdentityArgs),
}

// -----------------------------------------------------------------------------
// Provision command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct ProvisionArgs {
    /// Path to configuration file (defaults to FLEETPROV_CONFIG, then config/provisioning.toml)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log filter directive, overrides telemetry.log_level
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log output format, overrides telemetry.log_format
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,
}

// -----------------------------------------------------------------------------
// Identity command
// -----------------------------------------------------------------------------

#[derive(Args)]
pub struct IdentityArgs {
    /// Directory holding the certificate and key
    #[arg(short, long)]
    pub dir: PathBuf,

    /// Certificate file name inside the directory
    #[arg(long)]
    pub cert: String,

    /// Private key file name inside the directory
    #[arg(long)]
    pub key: String,
}
