//! NATS connection configuration

use serde::{Deserialize, Serialize};

/// Configuration for connecting to a NATS server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NatsConfig {
    /// Server URL (e.g. `nats://127.0.0.1:4222`)
    pub url: String,

    /// Optional auth token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,

    /// Request/flush timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            token: None,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NatsConfig::default();
        assert_eq!(config.url, "nats://127.0.0.1:4222");
        assert!(config.token.is_none());
        assert_eq!(config.connect_timeout_secs, 5);
    }

    #[test]
    fn test_token_not_serialized_when_absent() {
        let json = serde_json::to_string(&NatsConfig::default()).unwrap();
        assert!(!json.contains("token"));
        assert!(json.contains("\"connectTimeoutSecs\":5"));
    }
}
