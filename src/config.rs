use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::usage::{ModelPricing, PricingTable};
use crate::watch::WatchOptions;

const APP_NAME: &str = "token-monitor";
const CONFIG_NAME: &str = "config";

pub const ENV_CLAUDE_DIR: &str = "TOKEN_MONITOR_CLAUDE_DIR";
pub const ENV_DATABASE: &str = "TOKEN_MONITOR_DATABASE";
pub const ENV_PORT: &str = "TOKEN_MONITOR_PORT";
pub const ENV_LOG_LEVEL: &str = "TOKEN_MONITOR_LOG_LEVEL";

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// CLI data directory holding the stats cache and history log
    pub claude_dir: String,
    pub database_path: String,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub watch: WatchConfig,
    pub hub: HubConfig,
    pub snapshots: SnapshotConfig,
    pub analytics: AnalyticsConfig,
    /// Per-model price overrides, keyed by model name
    pub pricing: HashMap<String, ModelPricing>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub debounce_ms: u64,
    pub extensions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub heartbeat_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub interval_secs: u64,
    pub retention_days: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub trend_period_days: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            claude_dir: "~/.claude".to_string(),
            database_path: default_database_path(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            watch: WatchConfig::default(),
            hub: HubConfig::default(),
            snapshots: SnapshotConfig::default(),
            analytics: AnalyticsConfig::default(),
            pricing: HashMap::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 51888,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        let defaults = WatchOptions::default();
        Self {
            debounce_ms: defaults.debounce.as_millis() as u64,
            extensions: defaults.extensions,
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self { heartbeat_secs: 30 }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            retention_days: 90,
        }
    }
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self { trend_period_days: 7 }
    }
}

fn default_database_path() -> String {
    dirs::data_dir()
        .map(|dir| dir.join(APP_NAME).join("monitor.db").to_string_lossy().to_string())
        .unwrap_or_else(|| format!("~/.{}/monitor.db", APP_NAME))
}

fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).to_string())
}

impl Config {
    pub fn claude_dir_path(&self) -> PathBuf {
        expand_path(&self.claude_dir)
    }

    pub fn database_file(&self) -> PathBuf {
        expand_path(&self.database_path)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            debounce: Duration::from_millis(self.watch.debounce_ms),
            extensions: self.watch.extensions.clone(),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.hub.heartbeat_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshots.interval_secs)
    }

    pub fn pricing_table(&self) -> Result<PricingTable> {
        PricingTable::with_overrides(&self.pricing).context("Invalid pricing override")
    }

    /// Apply `TOKEN_MONITOR_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(dir) = lookup(ENV_CLAUDE_DIR) {
            self.claude_dir = dir;
        }
        if let Some(path) = lookup(ENV_DATABASE) {
            self.database_path = path;
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.server.port = port
                .trim()
                .parse()
                .with_context(|| format!("{} must be a port number, got '{}'", ENV_PORT, port))?;
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.logging.level = level.trim().to_lowercase();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port < 1024 {
            bail!("server.port must be between 1024 and 65535, got {}", self.server.port);
        }
        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            bail!(
                "logging.level must be one of {}, got '{}'",
                LOG_LEVELS.join(", "),
                self.logging.level
            );
        }
        if self.watch.debounce_ms == 0 {
            bail!("watch.debounce_ms must be greater than 0");
        }
        if self.hub.heartbeat_secs == 0 {
            bail!("hub.heartbeat_secs must be greater than 0");
        }
        if self.snapshots.interval_secs == 0 {
            bail!("snapshots.interval_secs must be greater than 0");
        }
        if self.analytics.trend_period_days == 0 {
            bail!("analytics.trend_period_days must be greater than 0");
        }
        self.pricing_table()?;
        Ok(())
    }
}

/// Location of the default config file
pub fn config_path() -> Result<PathBuf> {
    confy::get_configuration_file_path(APP_NAME, CONFIG_NAME).context("Failed to resolve config path")
}

/// Load config from the default location, apply env overrides and validate
pub fn load_config() -> Result<Config> {
    let config: Config = confy::load(APP_NAME, CONFIG_NAME).context("Failed to load config")?;
    finish_loading(config)
}

/// Like [`load_config`], reading an explicit file (created with defaults if missing)
pub fn load_config_from(path: &Path) -> Result<Config> {
    let config: Config = confy::load_path(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    finish_loading(config)
}

fn finish_loading(mut config: Config) -> Result<Config> {
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

pub fn save_config(config: &Config) -> Result<()> {
    confy::store(APP_NAME, CONFIG_NAME, config).context("Failed to save config")?;
    Ok(())
}

pub fn save_config_to(path: &Path, config: &Config) -> Result<()> {
    confy::store_path(path, config)
        .with_context(|| format!("Failed to save config to {}", path.display()))?;
    Ok(())
}
