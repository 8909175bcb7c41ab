//! CLI argument parsing tests.
//!
//! # Manual Verification Instructions
//!
//! ```shell
//! # Check a credential pair before deploying it
//! fleetprov identity --dir /etc/fleetprov/certs \
//!   --cert bootstrap-certificate.pem.crt --key bootstrap-private.pem.key
//!
//! # Provision against the configured endpoint
//! fleetprov provision --config config/provisioning.toml --log-level info
//!
//! # Re-run on a provisioned device (claim removed): prints the benign notice, exits 0
//! fleetprov provision --config config/provisioning.toml
//! ```

use clap::Parser;
use fleetprov::cli::{Cli, Commands};
use fleetprov::config::{Config, LogFormat};
use std::path::PathBuf;

#[test]
fn provision_defaults() {
    let cli = Cli::try_parse_from(["fleetprov", "provision"]).unwrap();
    let Commands::Provision(args) = cli.command else {
        panic!("expected provision command");
    };
    assert!(args.config.is_none());
    assert!(args.log_level.is_none());
    assert!(args.log_format.is_none());
}

#[test]
fn provision_overrides() {
    let cli = Cli::try_parse_from([
        "fleetprov",
        "provision",
        "--config",
        "/etc/fleetprov/provisioning.toml",
        "--log-level",
        "fleetprov=debug",
        "--log-format",
        "json",
    ])
    .unwrap();
    let Commands::Provision(args) = cli.command else {
        panic!("expected provision command");
    };
    assert_eq!(
        args.config,
        Some(PathBuf::from("/etc/fleetprov/provisioning.toml"))
    );
    assert_eq!(args.log_level.as_deref(), Some("fleetprov=debug"));
    assert_eq!(args.log_format, Some(LogFormat::Json));
}

#[test]
fn provision_rejects_unknown_log_format() {
    assert!(Cli::try_parse_from(["fleetprov", "provision", "--log-format", "xml"]).is_err());
}

#[test]
fn identity_requires_all_three_arguments() {
    let cli = Cli::try_parse_from([
        "fleetprov",
        "identity",
        "--dir",
        "/certs",
        "--cert",
        "device.crt",
        "--key",
        "device.key",
    ])
    .unwrap();
    let Commands::Identity(args) = cli.command else {
        panic!("expected identity command");
    };
    assert_eq!(args.dir, PathBuf::from("/certs"));
    assert_eq!(args.cert, "device.crt");
    assert_eq!(args.key, "device.key");

    assert!(Cli::try_parse_from(["fleetprov", "identity", "--dir", "/certs"]).is_err());
}

#[test]
fn shipped_sample_config_is_valid() {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config/provisioning.toml");
    let config = Config::load(&path).unwrap();
    config.validate().unwrap();
    assert_eq!(config.settings.settle_delay_ms, 500);
    assert_eq!(config.telemetry.log_format, LogFormat::Text);
}
