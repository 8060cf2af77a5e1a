//! Configuration for the streaming core
//!
//! Every section deserializes from camelCase JSON and falls back to
//! defaults for missing fields, so a config file only needs to name
//! the values it overrides.

use crate::error::{StreamError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamConfig {
    pub session: SessionConfig,
    pub broker: BrokerConfig,
    pub breaker: BreakerConfig,
    pub queue: QueueConfig,
    pub shutdown: ShutdownConfig,
}

impl StreamConfig {
    /// Parse a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| StreamError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file on disk
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            StreamError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config = Self::from_json_str(&json)?;
        tracing::debug!(path = %path.display(), "Config loaded");
        Ok(config)
    }

    /// Reject values that would disable a safety mechanism outright
    pub fn validate(&self) -> Result<()> {
        if self.breaker.failure_threshold == 0 {
            return Err(StreamError::Config(
                "breaker.failureThreshold must be >= 1".to_string(),
            ));
        }
        if self.breaker.recovery_timeout_ms == 0 {
            return Err(StreamError::Config(
                "breaker.recoveryTimeoutMs must be > 0".to_string(),
            ));
        }
        if self.queue.default_attempts == 0 {
            return Err(StreamError::Config(
                "queue.defaultAttempts must be >= 1".to_string(),
            ));
        }
        if self.broker.heartbeat_interval_secs == 0 {
            return Err(StreamError::Config(
                "broker.heartbeatIntervalSecs must be > 0".to_string(),
            ));
        }
        if self.shutdown.drain_poll_ms == 0 {
            return Err(StreamError::Config(
                "shutdown.drainPollMs must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Session registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// How long a completed session stays queryable (ms)
    pub complete_grace_ms: u64,
    /// How long an errored session stays queryable (ms)
    pub error_grace_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            complete_grace_ms: 5_000,
            error_grace_ms: 1_000,
        }
    }
}

impl SessionConfig {
    pub fn complete_grace(&self) -> Duration {
        Duration::from_millis(self.complete_grace_ms)
    }

    pub fn error_grace(&self) -> Duration {
        Duration::from_millis(self.error_grace_ms)
    }
}

/// Connection broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerConfig {
    /// Identifier of this process on the shared broker
    ///
    /// Messages published by this node are ignored when they come back
    /// through the wildcard subscription.
    pub node_id: String,

    /// Channel prefix; session channels are `<prefix>.<sessionId>`
    pub channel_prefix: String,

    /// Interval between liveness sweeps (seconds)
    pub heartbeat_interval_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            node_id: format!("node-{}", uuid::Uuid::new_v4()),
            channel_prefix: "session".to_string(),
            heartbeat_interval_secs: 30,
        }
    }
}

impl BrokerConfig {
    /// Channel name for a session
    pub fn session_channel(&self, session_id: &str) -> String {
        format!("{}.{}", self.channel_prefix, session_id)
    }

    /// Wildcard pattern covering every session channel
    pub fn session_pattern(&self) -> String {
        format!("{}.>", self.channel_prefix)
    }

    /// Extract the session id from a session channel name
    pub fn session_from_channel<'a>(&self, channel: &'a str) -> Option<&'a str> {
        channel
            .strip_prefix(self.channel_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
            .filter(|id| !id.is_empty())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

/// Circuit breaker defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerConfig {
    /// Consecutive expected failures that trip the breaker
    pub failure_threshold: u32,

    /// Time spent OPEN before a probe is allowed (ms)
    pub recovery_timeout_ms: u64,

    /// Error kinds / codes / message fragments that count toward tripping
    pub expected_errors: Vec<String>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
            expected_errors: [
                "TimeoutError",
                "NetworkError",
                "ECONNRESET",
                "ENOTFOUND",
                "TimedOut",
                "ConnectionReset",
                "ConnectionRefused",
                "ConnectionAborted",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Background job queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    /// Attempts per job when the producer does not specify one
    pub default_attempts: u32,

    /// Base delay for exponential backoff (ms)
    pub backoff_base_ms: u64,

    /// Completed jobs retained for inspection
    pub keep_completed: usize,

    /// Failed jobs retained for inspection
    pub keep_failed: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_attempts: 3,
            backoff_base_ms: 2_000,
            keep_completed: 100,
            keep_failed: 50,
        }
    }
}

/// Shutdown coordinator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShutdownConfig {
    /// Timeout applied to steps registered without one (ms)
    pub default_step_timeout_ms: u64,

    /// Maximum time to wait for active sessions to finish (ms)
    pub drain_max_wait_ms: u64,

    /// Poll interval while draining sessions (ms)
    pub drain_poll_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_ms: 30_000,
            drain_max_wait_ms: 45_000,
            drain_poll_ms: 1_000,
        }
    }
}

impl ShutdownConfig {
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_millis(self.default_step_timeout_ms)
    }

    pub fn drain_max_wait(&self) -> Duration {
        Duration::from_millis(self.drain_max_wait_ms)
    }

    pub fn drain_poll(&self) -> Duration {
        Duration::from_millis(self.drain_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StreamConfig::default();
        assert_eq!(config.session.complete_grace_ms, 5_000);
        assert_eq!(config.session.error_grace_ms, 1_000);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.queue.default_attempts, 3);
        assert_eq!(config.broker.channel_prefix, "session");
        assert!(config.broker.node_id.starts_with("node-"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = StreamConfig::from_json_str(
            r#"{"breaker": {"failureThreshold": 2}, "session": {"errorGraceMs": 250}}"#,
        )
        .unwrap();

        assert_eq!(config.breaker.failure_threshold, 2);
        assert_eq!(config.breaker.recovery_timeout_ms, 60_000);
        assert_eq!(config.session.error_grace_ms, 250);
        assert_eq!(config.session.complete_grace_ms, 5_000);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let result = StreamConfig::from_json_str(r#"{"breaker": {"failureThreshold": 0}}"#);
        assert!(matches!(result, Err(StreamError::Config(_))));
    }

    #[test]
    fn test_malformed_json_rejected() {
        let result = StreamConfig::from_json_str("{not json");
        assert!(matches!(result, Err(StreamError::Config(_))));
    }

    #[test]
    fn test_session_channel_naming() {
        let broker = BrokerConfig::default();
        assert_eq!(broker.session_channel("abc"), "session.abc");
        assert_eq!(broker.session_pattern(), "session.>");
        assert_eq!(broker.session_from_channel("session.abc"), Some("abc"));
        assert_eq!(broker.session_from_channel("session.a.b"), Some("a.b"));
        assert_eq!(broker.session_from_channel("other.abc"), None);
        assert_eq!(broker.session_from_channel("session."), None);
    }

    #[test]
    fn test_from_file() {
        let dir = std::env::temp_dir().join(format!("a3s-stream-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("stream.json");
        std::fs::write(&path, r#"{"queue": {"keepFailed": 5}}"#).unwrap();

        let config = StreamConfig::from_file(&path).unwrap();
        assert_eq!(config.queue.keep_failed, 5);
        assert_eq!(config.queue.keep_completed, 100);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_from_missing_file() {
        let result = StreamConfig::from_file("/tmp/nonexistent-a3s-stream-config.json");
        assert!(matches!(result, Err(StreamError::Config(_))));
    }
}
