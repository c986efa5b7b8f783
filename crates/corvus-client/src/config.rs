// Client-side defaults and configuration helpers.
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::{Error, Result};

pub(crate) const DEFAULT_BATCHING_SIZE: usize = 5;
pub(crate) const DEFAULT_STOP_TIMEOUT_MS: u64 = 1_000;
pub(crate) const DEFAULT_TERMINATION_TIMEOUT_MS: u64 = 10_000;

/// Tunables shared by every session and consumer of a connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Max undelivered responses the synchronous receive buffer pre-fetches
    /// on one subscription.
    pub batching_size: usize,
    /// How long a connection stop waits for in-flight receives to drain.
    pub stop_timeout: Duration,
    /// How long an orderly listener stop waits for an in-flight callback.
    pub termination_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            batching_size: DEFAULT_BATCHING_SIZE,
            stop_timeout: Duration::from_millis(DEFAULT_STOP_TIMEOUT_MS),
            termination_timeout: Duration::from_millis(DEFAULT_TERMINATION_TIMEOUT_MS),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ClientConfigOverride {
    batching_size: Option<usize>,
    stop_timeout_ms: Option<u64>,
    termination_timeout_ms: Option<u64>,
}

impl ClientConfig {
    /// Defaults with `CORVUS_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = read_usize_env("CORVUS_BATCHING_SIZE") {
            config.batching_size = value;
        }
        if let Some(value) = read_u64_env("CORVUS_STOP_TIMEOUT_MS") {
            config.stop_timeout = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("CORVUS_TERMINATION_TIMEOUT_MS") {
            config.termination_timeout = Duration::from_millis(value);
        }
        config
    }

    /// Like [`ClientConfig::from_env`], then overlaid with a YAML file when
    /// `config_path` or `CORVUS_CLIENT_CONFIG` names one.
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("CORVUS_CLIENT_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents = fs::read_to_string(path)
                .map_err(|err| Error::Config(format!("read client config {path}: {err}")))?;
            let override_cfg: ClientConfigOverride = serde_yaml::from_str(&contents)
                .map_err(|err| Error::Config(format!("parse client config {path}: {err}")))?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }
}

impl ClientConfigOverride {
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(value) = self.batching_size {
            if value > 0 {
                config.batching_size = value;
            }
        }
        if let Some(value) = self.stop_timeout_ms {
            config.stop_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.termination_timeout_ms {
            config.termination_timeout = Duration::from_millis(value);
        }
    }
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}
