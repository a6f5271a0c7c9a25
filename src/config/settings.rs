/*
* Balancer Configuration
* ----------------------
* One typed record for everything a pass needs. Layers, lowest priority first:
*
* 1. Built-in defaults (Settings::default)
* 2. <config dir>/default.toml
* 3. <config dir>/local.toml
* 4. Environment variables, APP__SECTION__FIELD (e.g. APP__BALANCING__BALANCINESS=10)
* 5. Persisted overrides saved through the API (<config dir>/balancer_overrides.json)
* 6. Per-request overrides (BalancingOverrides sent with an execute call)
*
* Layers 1-4 are merged by the config crate; 5 and 6 only touch the balancing
* section and are applied with BalancingOverrides::merge / apply.
*/

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::balancing::{BalancingConfig, BalancingOverrides};
use crate::core::resources::Resource;
use crate::errors::ConfigurationError;
use crate::monitoring::pressure::MAX_WINDOW_SECS;

pub const OVERRIDES_FILE: &str = "balancer_overrides.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub collector: CollectorSettings,
    pub balancing: BalancingConfig,
    pub pressure: PressureSettings,
    pub relocation: RelocationSettings,
    pub ledger: LedgerSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub api_prefix: String,
    pub body_limit_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            api_prefix: "/api/v1".to_string(),
            body_limit_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorSettings {
    /// Directory holding one `<cluster>.json` inventory per cluster.
    pub inventory_dir: PathBuf,
    pub default_cluster: String,
    pub retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            inventory_dir: PathBuf::from("inventory"),
            default_cluster: "default".to_string(),
            retries: 2,
            retry_backoff_ms: 500,
        }
    }
}

/// Hot-detection thresholds for one resource, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSpec {
    pub some: f64,
    pub full: f64,
    pub spike: f64,
}

impl Default for ThresholdSpec {
    fn default() -> Self {
        Self {
            some: 20.0,
            full: 10.0,
            spike: 30.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureThresholds {
    pub cpu: ThresholdSpec,
    pub memory: ThresholdSpec,
    pub disk: ThresholdSpec,
}

impl PressureThresholds {
    pub fn get(&self, resource: Resource) -> ThresholdSpec {
        match resource {
            Resource::Cpu => self.cpu,
            Resource::Memory => self.memory,
            Resource::Disk => self.disk,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PressureSettings {
    pub window_secs: u64,
    pub spike_samples: usize,
    pub thresholds: PressureThresholds,
}

impl Default for PressureSettings {
    fn default() -> Self {
        Self {
            window_secs: 3600,
            spike_samples: 6,
            thresholds: PressureThresholds::default(),
        }
    }
}

/// Command templates for the platform CLI. `{id}`, `{source}` and `{target}` are substituted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelocationSettings {
    pub poll_interval_ms: u64,
    pub vm_command: Vec<String>,
    pub ct_command: Vec<String>,
    pub vm_live_args: Vec<String>,
    pub ct_live_args: Vec<String>,
    pub vm_status_command: Vec<String>,
    pub ct_status_command: Vec<String>,
    /// Exits non-zero when `{target}` cannot take guests; empty skips the check.
    pub node_status_command: Vec<String>,
}

fn words(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for RelocationSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            vm_command: words(&["ssh", "root@{source}", "qm", "migrate", "{id}", "{target}"]),
            ct_command: words(&["ssh", "root@{source}", "pct", "migrate", "{id}", "{target}"]),
            vm_live_args: words(&["--online"]),
            ct_live_args: words(&["--restart"]),
            vm_status_command: words(&["ssh", "root@{source}", "qm", "status", "{id}"]),
            ct_status_command: words(&["ssh", "root@{source}", "pct", "status", "{id}"]),
            node_status_command: words(&["ssh", "root@{target}", "pvesh", "get", "/nodes/{target}/status"]),
        }
    }
}

impl RelocationSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    /// JSON-lines journal; history is kept in memory only when unset.
    pub journal_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Loads settings from `$CONFIG_PATH` (default `config`).
    pub fn new() -> Result<Self, ConfigurationError> {
        let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());
        Self::from_dir(Path::new(&config_path))
    }

    /// Defaults, files and environment, without persisted overrides.
    pub fn layered(dir: &Path) -> Result<Self, ConfigurationError> {
        info!("Loading configuration from path: {}", dir.display());

        let config = Config::builder()
            .add_source(Config::try_from(&Settings::default())?)
            .add_source(File::from(dir.join("default")).required(false))
            .add_source(File::from(dir.join("local")).required(false))
            .add_source(Environment::with_prefix("APP").prefix_separator("__").separator("__"))
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Every file-based layer, persisted overrides included.
    pub fn from_dir(dir: &Path) -> Result<Self, ConfigurationError> {
        let mut settings = Self::layered(dir)?;
        let saved = OverrideStore::new(dir).load_blocking()?;
        settings.balancing = saved.apply(&settings.balancing);
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.balancing.validate()?;
        if !self.server.api_prefix.starts_with('/') {
            return Err(ConfigurationError::invalid("server.api_prefix", "must start with '/'"));
        }
        if self.pressure.window_secs == 0 || self.pressure.window_secs > MAX_WINDOW_SECS {
            return Err(ConfigurationError::invalid(
                "pressure.window_secs",
                format!("must be between 1 and {}", MAX_WINDOW_SECS),
            ));
        }
        if self.relocation.poll_interval_ms == 0 {
            return Err(ConfigurationError::invalid("relocation.poll_interval_ms", "must be positive"));
        }
        if self.pressure.spike_samples == 0 {
            return Err(ConfigurationError::invalid("pressure.spike_samples", "must be positive"));
        }
        let commands = [
            ("relocation.vm_command", &self.relocation.vm_command),
            ("relocation.ct_command", &self.relocation.ct_command),
            ("relocation.vm_status_command", &self.relocation.vm_status_command),
            ("relocation.ct_status_command", &self.relocation.ct_status_command),
        ];
        for (field, command) in commands {
            if command.is_empty() {
                return Err(ConfigurationError::invalid(field, "command template is empty"));
            }
        }
        Ok(())
    }
}

/// Persisted balancing overrides, written by `POST /balancer/config`.
#[derive(Debug, Clone)]
pub struct OverrideStore {
    path: PathBuf,
}

impl OverrideStore {
    pub fn new(config_dir: &Path) -> Self {
        Self {
            path: config_dir.join(OVERRIDES_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parse(&self, raw: &str) -> Result<BalancingOverrides, ConfigurationError> {
        serde_json::from_str(raw).map_err(|e| {
            ConfigurationError::invalid(&self.path.display().to_string(), e.to_string())
        })
    }

    pub fn load_blocking(&self) -> Result<BalancingOverrides, ConfigurationError> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => self.parse(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BalancingOverrides::default()),
            Err(e) => Err(ConfigurationError::Persist(e.to_string())),
        }
    }

    pub async fn load(&self) -> Result<BalancingOverrides, ConfigurationError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => self.parse(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BalancingOverrides::default()),
            Err(e) => Err(ConfigurationError::Persist(e.to_string())),
        }
    }

    pub async fn save(&self, overrides: &BalancingOverrides) -> Result<(), ConfigurationError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ConfigurationError::Persist(e.to_string()))?;
        }
        let body = serde_json::to_string_pretty(overrides)
            .map_err(|e| ConfigurationError::Persist(e.to_string()))?;
        tokio::fs::write(&self.path, body)
            .await
            .map_err(|e| ConfigurationError::Persist(e.to_string()))?;
        warn!(path = %self.path.display(), "Persisted balancing overrides");
        Ok(())
    }
}

pub fn generate_default_config() -> Settings {
    Settings::default()
}
