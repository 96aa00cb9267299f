// realtime-hub/src/config.rs

//! Startup configuration for the hub.
//!
//! Every field has a default, so an empty JSON object (`{}`) is a valid
//! configuration for a single-instance deployment.

use crate::ws::types::SessionId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating a [`HubConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which pub/sub backend the hub runs on. Chosen once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// In-process fan-out for a single instance.
    #[default]
    Local,
    /// Redis Pub/Sub, for several instances sharing load.
    Redis { url: String },
}

/// Configuration for [`Hub`](crate::ws::service::Hub).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub backend: BackendConfig,
    /// Worker field of every ID this instance mints. Must be unique per instance.
    pub snowflake_worker_id: u64,
    /// Capacity of each connection's local-delivery queue.
    pub local_queue_capacity: usize,
    /// How often a keepalive ping is written.
    #[serde(with = "millis")]
    pub ping_interval: Duration,
    /// How long the read side waits for any frame before giving up on the peer.
    #[serde(with = "millis")]
    pub pong_wait: Duration,
    /// Deadline for a single frame write.
    #[serde(with = "millis")]
    pub write_wait: Duration,
    /// Deadline for broker connects and subscription changes.
    #[serde(with = "millis")]
    pub broker_timeout: Duration,
    /// Name of the cookie carrying the session ID.
    pub session_cookie: String,
    /// Whether the session cookie is marked `Secure`.
    pub secure_cookie: bool,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::Local,
            snowflake_worker_id: 0,
            local_queue_capacity: 256,
            ping_interval: Duration::from_secs(54),
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
            broker_timeout: Duration::from_secs(5),
            session_cookie: "session".to_string(),
            secure_cookie: true,
        }
    }
}

impl HubConfig {
    /// Loads and validates a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Parses and validates a JSON config document.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: HubConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the relationships between fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.local_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "local_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.write_wait.is_zero() || self.broker_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "write_wait and broker_timeout must be non-zero".to_string(),
            ));
        }
        if self.ping_interval.is_zero() || self.ping_interval >= self.pong_wait {
            return Err(ConfigError::Invalid(format!(
                "ping_interval ({:?}) must be non-zero and shorter than pong_wait ({:?})",
                self.ping_interval, self.pong_wait
            )));
        }
        if self.session_cookie.is_empty()
            || !self
                .session_cookie
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(ConfigError::Invalid(format!(
                "session_cookie {:?} is not a valid cookie name",
                self.session_cookie
            )));
        }
        Ok(())
    }

    /// The `Set-Cookie` value that hands `session_id` to the client.
    pub fn session_cookie_header(&self, session_id: SessionId) -> String {
        let mut cookie = format!(
            "{}={}; Path=/; HttpOnly; SameSite=Lax",
            self.session_cookie, session_id
        );
        if self.secure_cookie {
            cookie.push_str("; Secure");
        }
        cookie
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = HubConfig::from_json_str("{}").unwrap();
        assert_eq!(config.backend, BackendConfig::Local);
        assert_eq!(config.ping_interval, Duration::from_secs(54));
        assert_eq!(config.pong_wait, Duration::from_secs(60));
        assert_eq!(config.session_cookie, "session");
    }

    #[test]
    fn test_redis_backend_and_millis() {
        let config = HubConfig::from_json_str(
            r#"{
                "backend": { "kind": "redis", "url": "redis://127.0.0.1/" },
                "snowflake_worker_id": 12,
                "ping_interval": 500,
                "pong_wait": 1500
            }"#,
        )
        .unwrap();
        assert_eq!(
            config.backend,
            BackendConfig::Redis {
                url: "redis://127.0.0.1/".to_string()
            }
        );
        assert_eq!(config.snowflake_worker_id, 12);
        assert_eq!(config.ping_interval, Duration::from_millis(500));
        assert_eq!(config.pong_wait, Duration::from_millis(1500));
    }

    #[test]
    fn test_ping_must_be_shorter_than_pong_wait() {
        let err = HubConfig::from_json_str(r#"{ "ping_interval": 60000, "pong_wait": 60000 }"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_zero_queue() {
        let err = HubConfig::from_json_str(r#"{ "local_queue_capacity": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_zero_deadlines() {
        let err = HubConfig::from_json_str(r#"{ "write_wait": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let err = HubConfig::from_json_str(r#"{ "broker_timeout": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_session_cookie_header() {
        let mut config = HubConfig::default();
        assert_eq!(
            config.session_cookie_header(99),
            "session=99; Path=/; HttpOnly; SameSite=Lax; Secure"
        );
        config.secure_cookie = false;
        assert_eq!(
            config.session_cookie_header(99),
            "session=99; Path=/; HttpOnly; SameSite=Lax"
        );
    }
}
