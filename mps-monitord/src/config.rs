use std::path::Path;
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::MPS_PORTAL_SERVICE_TYPE;
use crate::poll::PollSettings;
use crate::record::RecordSettings;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_service_types")]
    pub service_types: Vec<String>,
    /// Browse on this interface only; all interfaces when unset
    pub interface: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_refreshes: usize,
    /// 0 disables the per-fetch timeout
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectionConfig {
    #[serde(default = "default_observer_capacity")]
    pub observer_capacity: usize,
}

fn default_service_types() -> Vec<String> {
    vec![MPS_PORTAL_SERVICE_TYPE.to_string()]
}

fn default_interval() -> u64 {
    10
}

fn default_max_concurrent() -> usize {
    1
}

fn default_fetch_timeout() -> u64 {
    15
}

fn default_listen() -> String {
    "[::]:8054".to_string()
}

fn default_observer_capacity() -> usize {
    256
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_types: default_service_types(),
            interface: None,
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            max_concurrent_refreshes: default_max_concurrent(),
            fetch_timeout_secs: default_fetch_timeout(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            observer_capacity: default_observer_capacity(),
        }
    }
}

impl PollConfig {
    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_secs(self.interval_secs.max(1)),
            max_concurrent: self.max_concurrent_refreshes.max(1),
        }
    }

    pub fn record_settings(&self) -> RecordSettings {
        RecordSettings {
            fetch_timeout: (self.fetch_timeout_secs > 0).then(|| Duration::from_secs(self.fetch_timeout_secs)),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }
}
