//! fleetprov - CLI entrypoint.
//!
//! Usage:
//!   fleetprov provision --config config/provisioning.toml
//!   fleetprov identity --dir /certs --cert bootstrap-certificate.pem.crt --key bootstrap-private.pem.key

use anyhow::Result;
use clap::Parser;
use fleetprov::cli::commands::{run_identity, run_provision};
use fleetprov::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Provision(args) => run_provision(args).await,
        Commands::Identity(args) => run_identity(args),
    }
}
