use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::DEFAULT_CONSUL_ADDRESS;

/// Blocking query wait range honored by Consul. Zero means the agent default.
const MIN_WAIT_SECS: u64 = 1;
const MAX_WAIT_SECS: u64 = 600;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub consul: ConsulConfig,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Handlers run on every update cycle, started in this order
    #[serde(default)]
    pub on_update: Vec<HandlerConfig>,
    /// Handler run once all on-update handlers succeeded
    #[serde(default)]
    pub after_update: Option<HandlerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsulConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub datacenter: Option<String>,
    /// Upper bound a blocking query is held open by the server
    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,
    /// Only report instances whose health checks are passing
    #[serde(default = "default_passing_only")]
    pub passing_only: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Keep a rerun requested during a failed cycle instead of dropping it
    #[serde(default)]
    pub retain_rerun_on_failure: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Full,
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandlerConfig {
    /// Render the catalog to a file
    Render {
        path: PathBuf,
        #[serde(default)]
        format: RenderFormat,
        /// Only services carrying every one of these tags are rendered
        #[serde(default)]
        tags: Vec<String>,
    },
    /// Run a program, failing the handler on a non-zero exit status
    Command {
        command: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderFormat {
    #[default]
    Text,
    Json,
}

fn default_address() -> String {
    DEFAULT_CONSUL_ADDRESS.to_string()
}

fn default_wait_secs() -> u64 {
    300
}

fn default_passing_only() -> bool {
    true
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_log_filter() -> String {
    "catalog_mirrord=info".to_string()
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            token: None,
            datacenter: None,
            wait_secs: default_wait_secs(),
            passing_only: default_passing_only(),
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            retain_rerun_on_failure: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: LogFormat::default(),
        }
    }
}

impl ConsulConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }
}

impl UpdateConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;

        anyhow::ensure!(
            (MIN_WAIT_SECS..=MAX_WAIT_SECS).contains(&config.consul.wait_secs),
            "consul wait_secs must be between {} and {}, got {}",
            MIN_WAIT_SECS,
            MAX_WAIT_SECS,
            config.consul.wait_secs
        );

        if let Some(HandlerConfig::Command { command }) = &config.after_update {
            anyhow::ensure!(!command.is_empty(), "after_update command must not be empty");
        }
        for handler in &config.on_update {
            if let HandlerConfig::Command { command } = handler {
                anyhow::ensure!(!command.is_empty(), "on_update command must not be empty");
            }
        }

        Ok(config)
    }
}
