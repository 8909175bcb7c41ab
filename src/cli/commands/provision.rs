//! Provision command - runs the claim -> permanent identity flow once.

use crate::cancel::{CancelSource, CancelToken};
use crate::cli::args::ProvisionArgs;
use crate::config::Config;
use crate::mqtt::MqttConnector;
use crate::ops::telemetry;
use crate::provisioning::{ConsoleNotices, Provisioner};
use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

pub async fn run_provision(args: ProvisionArgs) -> Result<()> {
    let config = Config::load_with_overrides(args.config.as_deref())?;
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.telemetry.log_level);
    telemetry::init_tracing(
        Some(log_level),
        args.log_format.unwrap_or(config.telemetry.log_format),
    )?;
    config.validate()?;

    let source = CancelSource::new();
    let token = source.token();
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(sig) => {
                warn!("received {sig}, cancelling provisioning");
                source.cancel();
            }
            Err(err) => warn!(error = %err, "signal handlers unavailable"),
        }
    });

    provision(config, token).await
}

async fn provision(config: Config, cancel: CancelToken) -> Result<()> {
    let provisioner = Provisioner::new(config.settings, MqttConnector, ConsoleNotices);
    let result = provisioner
        .run(cancel, |completion| {
            println!("{}", completion.payload_str());
            println!("provisioned thing '{}'", completion.thing_name);
        })
        .await;

    match result {
        Ok(completion) => {
            info!(
                thing_name = %completion.thing_name,
                certificate = %completion.certificate.display(),
                "provisioning finished"
            );
            Ok(())
        }
        Err(err) if err.is_benign() => {
            println!("bootstrap certificate not present; device may already be provisioned");
            info!(error = %err, "skipping provisioning");
            Ok(())
        }
        Err(err) => Err(err).context("provisioning failed"),
    }
}

async fn shutdown_signal() -> std::io::Result<&'static str> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    })
}
