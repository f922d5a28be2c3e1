//! Bridge configuration.
//!
//! Every field has a default, so an empty or missing file is valid. The
//! binary loads an optional TOML file and then applies command-line
//! overrides on top.
//!
//! ```toml
//! [device]
//! name_prefix = "MATCHBOX"
//!
//! [server]
//! host = "0.0.0.0"
//! port = 8080
//!
//! [gate]
//! min_interval_ms = 100
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::gate::GatePolicy;
use crate::session::{HeartbeatPolicy, SessionConfig};
use crate::supervisor::{BackoffPolicy, SupervisorConfig, DEFAULT_NAME_PREFIX};

/// Bridge configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which peripheral to connect to.
    pub device: DeviceConfig,
    /// WebSocket server.
    pub server: ServerConfig,
    /// Command pacing.
    pub gate: GateConfig,
    /// Reconnection timing.
    pub reconnect: ReconnectConfig,
    /// Keep-alive timing.
    pub heartbeat: HeartbeatConfig,
}

/// Peripheral selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Advertised name prefix.
    pub name_prefix: String,
    /// Length of each scan.
    pub scan_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            scan_timeout_ms: 5_000,
        }
    }
}

/// WebSocket server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    /// `host:port` to bind.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Command gate settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Minimum time between writes.
    pub min_interval_ms: u64,
    /// Lock hold after a successful write.
    pub settle_delay_ms: u64,
    /// Lock hold after a failed write.
    pub failure_penalty_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 100,
            settle_delay_ms: 1_000,
            failure_penalty_ms: 2_000,
        }
    }
}

impl From<&GateConfig> for GatePolicy {
    fn from(config: &GateConfig) -> Self {
        Self {
            min_interval: Duration::from_millis(config.min_interval_ms),
            settle_delay: Duration::from_millis(config.settle_delay_ms),
            failure_penalty: Duration::from_millis(config.failure_penalty_ms),
        }
    }
}

/// Reconnection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Backoff with no failures.
    pub base_delay_ms: u64,
    /// Upper bound on backoff.
    pub max_delay_ms: u64,
    /// Growth factor per failure.
    pub multiplier: f64,
    /// Failures beyond this no longer grow the delay.
    pub exponent_cap: u32,
    /// Consecutive failures before the cool-down.
    pub max_failures: u32,
    /// Cool-down length.
    pub cooldown_ms: u64,
    /// Wait before rescanning when nothing matched.
    pub not_found_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 5_000,
            max_delay_ms: 60_000,
            multiplier: 1.5,
            exponent_cap: 10,
            max_failures: 5,
            cooldown_ms: 60_000,
            not_found_delay_ms: 10_000,
        }
    }
}

/// Keep-alive settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// How often the heartbeat wakes.
    pub interval_ms: u64,
    /// Idle time before a keep-alive is sent.
    pub idle_threshold_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 15_000,
            idle_threshold_ms: 20_000,
        }
    }
}

impl From<&HeartbeatConfig> for HeartbeatPolicy {
    fn from(config: &HeartbeatConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.interval_ms),
            idle_threshold: Duration::from_millis(config.idle_threshold_ms),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file cannot be read or parsed, or
    /// fails [`Config::validate`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| Error::Config {
            reason: format!("failed to read {}: {}", path.display(), e),
        })?;
        let config = Self::from_toml(&content).map_err(|e| Error::Config {
            reason: format!("{}: {}", path.display(), e),
        })?;
        Ok(config)
    }

    /// Parse configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on a syntax error or invalid values.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that would make the bridge misbehave.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(Error::Config {
                reason: reason.to_string(),
            })
        };

        if self.device.name_prefix.is_empty() {
            return invalid("device.name_prefix cannot be empty");
        }
        if self.device.scan_timeout_ms == 0 {
            return invalid("device.scan_timeout_ms must be positive");
        }
        if self.server.host.is_empty() {
            return invalid("server.host cannot be empty");
        }
        if !self.reconnect.multiplier.is_finite() || self.reconnect.multiplier < 1.0 {
            return invalid("reconnect.multiplier must be at least 1.0");
        }
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return invalid("reconnect.max_delay_ms must not be below base_delay_ms");
        }
        if self.reconnect.max_failures == 0 {
            return invalid("reconnect.max_failures must be positive");
        }
        if self.heartbeat.interval_ms == 0 {
            return invalid("heartbeat.interval_ms must be positive");
        }

        Ok(())
    }

    /// Reconnection timing.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        let reconnect = &self.reconnect;
        BackoffPolicy {
            base: Duration::from_millis(reconnect.base_delay_ms),
            multiplier: reconnect.multiplier,
            exponent_cap: reconnect.exponent_cap,
            cap: Duration::from_millis(reconnect.max_delay_ms),
            max_failures: reconnect.max_failures,
            cooldown: Duration::from_millis(reconnect.cooldown_ms),
            not_found_delay: Duration::from_millis(reconnect.not_found_delay_ms),
            scan_timeout: Duration::from_millis(self.device.scan_timeout_ms),
        }
    }

    /// Settings for the supervisor and its sessions.
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            name_prefix: self.device.name_prefix.clone(),
            backoff: self.backoff_policy(),
            session: SessionConfig {
                gate: GatePolicy::from(&self.gate),
                heartbeat: HeartbeatPolicy::from(&self.heartbeat),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_match_runtime_defaults() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.supervisor_config(), SupervisorConfig::default());
        assert_eq!(config.server.bind_address(), "localhost:8080");
    }

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[test]
    fn test_partial_file() {
        let config = Config::from_toml(
            r#"
            [device]
            name_prefix = "MATCHBOX-LAB"

            [server]
            port = 9000

            [gate]
            min_interval_ms = 1000
            "#,
        )
        .unwrap();

        assert_eq!(config.device.name_prefix, "MATCHBOX-LAB");
        assert_eq!(config.device.scan_timeout_ms, 5_000);
        assert_eq!(config.server.bind_address(), "localhost:9000");

        let supervisor = config.supervisor_config();
        assert_eq!(supervisor.session.gate.min_interval, Duration::from_secs(1));
        assert_eq!(supervisor.session.gate.settle_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            Config::from_toml("[reconnect]\nmultiplier = 0.5"),
            Err(Error::Config { .. })
        ));
        assert!(Config::from_toml("[device]\nname_prefix = \"\"").is_err());
        assert!(Config::from_toml("[server]\nport = \"eighty\"").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/matchbox-bridge.toml").unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}
