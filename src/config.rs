use crate::error::error_chain_fmt;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// What the batch writer does when the sink refuses to open a new batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenFailurePolicy {
    /// log and keep consuming, records are reported as failed until the sink recovers
    #[default]
    Continue,
    /// stop the writer and close the status stream
    Terminate,
}

impl FromStr for OpenFailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "continue" => Ok(OpenFailurePolicy::Continue),
            "terminate" => Ok(OpenFailurePolicy::Terminate),
            _ => Err(ConfigError::Invalid(format!(
                "unknown open failure policy: {s}"
            ))),
        }
    }
}

/// Settings shared by the delivery adapter, the batch writer and the pipeline wiring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// maximum time an open batch may accumulate before a flush is attempted
    pub write_interval_ms: u64,
    /// upper bound on how long the subscription stays open, `None` means until the source closes
    pub subscription_deadline_ms: Option<u64>,
    /// table, topic or prefix the batches are written to
    pub target: String,
    pub on_open_failure: OpenFailurePolicy,
    pub input_buffer: usize,
    pub status_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            write_interval_ms: 1000,
            subscription_deadline_ms: None,
            target: "events".to_string(),
            on_open_failure: OpenFailurePolicy::Continue,
            input_buffer: 1,
            status_buffer: 1,
        }
    }
}

pub const ENV_WRITE_INTERVAL_MS: &str = "CONNECTOR_WRITE_INTERVAL_MS";
pub const ENV_SUBSCRIPTION_DEADLINE_MS: &str = "CONNECTOR_SUBSCRIPTION_DEADLINE_MS";
pub const ENV_TARGET: &str = "CONNECTOR_TARGET";
pub const ENV_ON_OPEN_FAILURE: &str = "CONNECTOR_ON_OPEN_FAILURE";

impl PipelineConfig {
    pub fn write_interval(&self) -> Duration {
        Duration::from_millis(self.write_interval_ms)
    }

    pub fn subscription_deadline(&self) -> Option<Duration> {
        self.subscription_deadline_ms.map(Duration::from_millis)
    }

    pub fn with_write_interval(mut self, interval: Duration) -> Self {
        self.write_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_subscription_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.subscription_deadline_ms = deadline.map(|d| d.as_millis() as u64);
        self
    }

    pub fn with_target(mut self, target: &str) -> Self {
        self.target = target.to_string();
        self
    }

    pub fn with_open_failure_policy(mut self, policy: OpenFailurePolicy) -> Self {
        self.on_open_failure = policy;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = serde_json::from_str(json).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
        Self::from_json_str(&content)
    }

    /// applies `CONNECTOR_*` environment variables on top of the current values
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = lookup(ENV_WRITE_INTERVAL_MS) {
            self.write_interval_ms = parse_env(ENV_WRITE_INTERVAL_MS, &value)?;
        }
        if let Some(value) = lookup(ENV_SUBSCRIPTION_DEADLINE_MS) {
            self.subscription_deadline_ms = match value.trim() {
                "" | "none" => None,
                v => Some(parse_env(ENV_SUBSCRIPTION_DEADLINE_MS, v)?),
            };
        }
        if let Some(value) = lookup(ENV_TARGET) {
            self.target = value;
        }
        if let Some(value) = lookup(ENV_ON_OPEN_FAILURE) {
            self.on_open_failure = value.parse()?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.write_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "write_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.target.trim().is_empty() {
            return Err(ConfigError::Invalid("target cannot be empty".to_string()));
        }
        if self.input_buffer == 0 || self.status_buffer == 0 {
            return Err(ConfigError::Invalid(
                "channel buffers must hold at least one element".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Failed to read configuration file")]
    Read(#[source] std::io::Error),
    #[error("Failed to parse configuration")]
    Parse(#[source] serde_json::Error),
    #[error("Invalid value {value:?} for environment variable {key}")]
    Env { key: String, value: String },
}

impl std::fmt::Debug for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
