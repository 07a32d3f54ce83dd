//! Daemon configuration
//!
//! Every field has a default so an empty (or missing) TOML file yields a
//! working single-host setup.

use mcp_shared::defaults;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// An in-process simulated robot registered at start-up
#[derive(Debug, Clone, Deserialize)]
pub struct SimRobotConfig {
    pub robot_id: String,
    #[serde(default)]
    pub robot_type: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Simulated execution latency per primitive
    #[serde(default = "default_sim_latency_ms")]
    pub latency_ms: u64,
}

fn default_sim_latency_ms() -> u64 {
    50
}

/// Configuration for the mediation layer
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    /// Address the caller intake server listens on
    pub intake_addr: String,
    /// Address robots connect to
    pub robot_link_addr: String,
    /// Size of the worker pool draining the queue
    pub workers: usize,
    /// Max in-flight commands per robot
    pub max_in_flight_per_robot: usize,
    /// Attempts per command, first attempt included
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Missed-heartbeat window before a binding turns unhealthy
    pub heartbeat_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    /// Bound on the emergency stop acknowledgement
    pub estop_ack_timeout_ms: u64,
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
    /// Retention of terminal records (idempotency window)
    pub retention_ms: u64,
    pub sweep_interval_ms: u64,
    /// Issue an emergency stop when a robot reports a safety violation
    pub estop_on_safety_violation: bool,
    pub simulated_robots: Vec<SimRobotConfig>,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            intake_addr: "127.0.0.1:7400".into(),
            robot_link_addr: "0.0.0.0:7401".into(),
            workers: 4,
            max_in_flight_per_robot: 1,
            max_attempts: defaults::COMMAND_MAX_ATTEMPTS,
            backoff_base_ms: defaults::RETRY_BACKOFF_BASE_MS,
            backoff_max_ms: defaults::RETRY_BACKOFF_MAX_MS,
            heartbeat_timeout_ms: defaults::HEARTBEAT_TIMEOUT_MS,
            health_check_interval_ms: defaults::HEARTBEAT_INTERVAL_MS,
            estop_ack_timeout_ms: defaults::ESTOP_ACK_TIMEOUT_MS,
            min_timeout_ms: defaults::MIN_COMMAND_TIMEOUT_MS,
            max_timeout_ms: defaults::MAX_COMMAND_TIMEOUT_MS,
            retention_ms: defaults::RECORD_RETENTION_MS,
            sweep_interval_ms: 1000,
            estop_on_safety_violation: true,
            simulated_robots: Vec::new(),
        }
    }
}

impl McpConfig {
    /// Parse a config from TOML text
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: McpConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file; a missing file yields the defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Reject settings that would break the executor's guarantees
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.max_in_flight_per_robot == 0 {
            return Err(ConfigError::Invalid(
                "max_in_flight_per_robot must be at least 1".into(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if self.min_timeout_ms == 0 || self.min_timeout_ms > self.max_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "timeout bounds {}..={} are inconsistent",
                self.min_timeout_ms, self.max_timeout_ms
            )));
        }
        if self.estop_ack_timeout_ms == 0 || self.estop_ack_timeout_ms >= self.min_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "estop_ack_timeout_ms ({}) must be positive and below min_timeout_ms ({})",
                self.estop_ack_timeout_ms, self.min_timeout_ms
            )));
        }
        Ok(())
    }

    /// Backoff before the retry that follows `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.backoff_base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.backoff_max_ms))
    }

    pub fn estop_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.estop_ack_timeout_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = McpConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_in_flight_per_robot, 1);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = McpConfig::from_toml(
            r#"
            workers = 8
            max_attempts = 5

            [[simulated_robots]]
            robot_id = "quad-1"
            robot_type = "quad"
            capabilities = ["camera"]
            "#,
        )
        .unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.intake_addr, "127.0.0.1:7400");
        assert_eq!(config.simulated_robots.len(), 1);
        assert_eq!(config.simulated_robots[0].latency_ms, 50);
    }

    #[test]
    fn test_estop_bound_must_be_shorter() {
        let err = McpConfig::from_toml("estop_ack_timeout_ms = 2000\nmin_timeout_ms = 1000").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let config = McpConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 350,
            ..Default::default()
        };
        assert_eq!(config.backoff_for(1), Duration::from_millis(100));
        assert_eq!(config.backoff_for(2), Duration::from_millis(200));
        assert_eq!(config.backoff_for(3), Duration::from_millis(350));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = McpConfig::load("/nonexistent/robot-mcp.toml").unwrap();
        assert_eq!(config.workers, 4);
    }
}
