use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Top-level configuration for the provisioning agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub settings: Settings,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Provisioning settings. The six path/endpoint keys are required and have no defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Directory holding the root CA, the claim credentials and, after a
    /// successful run, the permanent credentials.
    pub secure_cert_path: PathBuf,
    pub root_cert: String,
    pub claim_cert: String,
    pub claim_key: String,
    pub iot_endpoint: String,
    pub provisioning_template: String,
    #[serde(default = "Settings::default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Pause between subscribing to and publishing on the verification topic.
    #[serde(default = "Settings::default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Extra parameters sent to the provisioning template alongside `SerialNumber`.
    #[serde(default)]
    pub template_parameters: BTreeMap<String, serde_json::Value>,
}

impl Settings {
    const fn default_connect_timeout_ms() -> u64 {
        10_000
    }

    const fn default_settle_delay_ms() -> u64 {
        500
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Path of the claim certificate inside the secure directory.
    pub fn claim_cert_path(&self) -> PathBuf {
        self.secure_cert_path.join(&self.claim_cert)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "warn".into()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => bail!("invalid telemetry.log_format {}", other),
        }
    }
}

impl Config {
    /// Load configuration from an explicit path, or from FLEETPROV_CONFIG, or
    /// from `config/provisioning.toml`, then apply environment overrides.
    pub fn load_with_overrides(path: Option<&Path>) -> Result<Self> {
        let path = path.map_or_else(env_config_path, Path::to_path_buf);
        let mut cfg = Self::load(&path)?;
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    /// Load configuration from a specific file (TOML or JSON based on extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        if is_json(path_ref) {
            Ok(serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path_ref.display()))?)
        } else {
            Ok(toml::from_str(&data)
                .with_context(|| format!("invalid TOML config {}", path_ref.display()))?)
        }
    }

    /// Validate schema-level invariants before any network activity.
    pub fn validate(&self) -> Result<()> {
        let s = &self.settings;
        if s.secure_cert_path.as_os_str().is_empty() {
            bail!("settings.secure_cert_path must be non-empty");
        }
        for (key, value) in [
            ("root_cert", &s.root_cert),
            ("claim_cert", &s.claim_cert),
            ("claim_key", &s.claim_key),
            ("iot_endpoint", &s.iot_endpoint),
            ("provisioning_template", &s.provisioning_template),
        ] {
            if value.trim().is_empty() {
                bail!("settings.{key} must be non-empty");
            }
        }
        if s
            .provisioning_template
            .contains(|c| matches!(c, '+' | '#' | '/'))
        {
            bail!(
                "settings.provisioning_template {:?} must not contain '+', '#' or '/'",
                s.provisioning_template
            );
        }
        if s.connect_timeout_ms == 0 {
            bail!("settings.connect_timeout_ms must be > 0");
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(endpoint) = std::env::var("FLEETPROV_ENDPOINT") {
            self.settings.iot_endpoint = endpoint;
        }
        if let Ok(template) = std::env::var("FLEETPROV_TEMPLATE") {
            self.settings.provisioning_template = template;
        }
        if let Ok(format) = std::env::var("FLEETPROV_LOG_FORMAT") {
            self.telemetry.log_format = LogFormat::from_str(&format)?;
        }
        Ok(())
    }
}

fn env_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("FLEETPROV_CONFIG") {
        PathBuf::from(path)
    } else {
        PathBuf::from("config/provisioning.toml")
    }
}

fn is_json(path: &Path) -> bool {
    matches!(path.extension().and_then(|s| s.to_str()), Some("json"))
}
