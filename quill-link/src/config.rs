//! Connection configuration and environment lookup.
//!
//! Environment variables read by [`LinkConfig::from_env`] and the relay:
//!
//! | Variable                       | Meaning                                   |
//! |--------------------------------|-------------------------------------------|
//! | `QUILL_WS_HOST`                | listen host (default `0.0.0.0`)           |
//! | `QUILL_WS_PORT`                | listen port (default `8080`)              |
//! | `QUILL_TARGET_HOST`            | upstream completion server URL (required) |
//! | `QUILL_IDLE_TIMEOUT_MILLIS`    | idle close; `0` disables, negative = 5min |
//! | `QUILL_REQUEST_TIMEOUT_MILLIS` | per-request timeout (default 60s)         |
//! | `QUILL_HEARTBEAT_SECS`         | server heartbeat period (default 30s)     |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::error::LinkError;

pub const ENV_WS_HOST: &str = "QUILL_WS_HOST";
pub const ENV_WS_PORT: &str = "QUILL_WS_PORT";
pub const ENV_TARGET_HOST: &str = "QUILL_TARGET_HOST";
pub const ENV_IDLE_TIMEOUT_MILLIS: &str = "QUILL_IDLE_TIMEOUT_MILLIS";
pub const ENV_REQUEST_TIMEOUT_MILLIS: &str = "QUILL_REQUEST_TIMEOUT_MILLIS";
pub const ENV_HEARTBEAT_SECS: &str = "QUILL_HEARTBEAT_SECS";

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Invalid or missing environment configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{name} has invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Settings for one client [`Connection`](crate::Connection).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// `ws://` or `wss://` endpoint.
    pub url: String,
    /// Close after this long without a sent or received message.
    pub idle_timeout: Option<Duration>,
    /// Default deadline for [`Connection::send`](crate::Connection::send).
    pub request_timeout: Duration,
    /// How long a forwarder waits for `sessionInfo` before giving up.
    pub session_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080".to_string(),
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
        }
    }
}

impl LinkConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Upstream configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let url = lookup(ENV_TARGET_HOST).ok_or(ConfigError::Missing(ENV_TARGET_HOST))?;
        validate_url(&url)?;

        let idle_timeout = match parse_var::<i64>(&lookup, ENV_IDLE_TIMEOUT_MILLIS)? {
            None => Some(DEFAULT_IDLE_TIMEOUT),
            Some(ms) if ms < 0 => Some(DEFAULT_IDLE_TIMEOUT),
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms.unsigned_abs())),
        };

        let request_timeout = match parse_var::<u64>(&lookup, ENV_REQUEST_TIMEOUT_MILLIS)? {
            None => DEFAULT_REQUEST_TIMEOUT,
            Some(0) => {
                return Err(ConfigError::Invalid {
                    name: ENV_REQUEST_TIMEOUT_MILLIS,
                    value: "0".into(),
                })
            }
            Some(ms) => Duration::from_millis(ms),
        };

        Ok(Self {
            url,
            idle_timeout,
            request_timeout,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
        })
    }
}

/// Reject anything that is not a `ws://` or `wss://` URL with a host.
pub fn validate_url(url: &str) -> Result<(), LinkError> {
    let rest = url
        .strip_prefix("ws://")
        .or_else(|| url.strip_prefix("wss://"))
        .ok_or_else(|| LinkError::InvalidUrl(url.to_string()))?;
    if rest.is_empty() || rest.starts_with('/') {
        return Err(LinkError::InvalidUrl(url.to_string()));
    }
    Ok(())
}

/// Parse an optional variable. Unset and blank are both `None`.
pub(crate) fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_target_host_required() {
        assert_eq!(
            LinkConfig::from_lookup(env(&[])),
            Err(ConfigError::Missing(ENV_TARGET_HOST))
        );
    }

    #[test]
    fn test_defaults_from_env() {
        let config = LinkConfig::from_lookup(env(&[(ENV_TARGET_HOST, "ws://backend:9000")])).unwrap();
        assert_eq!(config.url, "ws://backend:9000");
        assert_eq!(config.idle_timeout, Some(DEFAULT_IDLE_TIMEOUT));
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
    }

    #[test]
    fn test_idle_timeout_semantics() {
        let idle = |value: &str| {
            LinkConfig::from_lookup(env(&[
                (ENV_TARGET_HOST, "ws://h"),
                (ENV_IDLE_TIMEOUT_MILLIS, value),
            ]))
            .map(|c| c.idle_timeout)
        };
        assert_eq!(idle("0"), Ok(None));
        assert_eq!(idle("-1"), Ok(Some(DEFAULT_IDLE_TIMEOUT)));
        assert_eq!(idle("1500"), Ok(Some(Duration::from_millis(1500))));
        assert!(matches!(idle("soon"), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_zero_request_timeout_rejected() {
        let result = LinkConfig::from_lookup(env(&[
            (ENV_TARGET_HOST, "ws://h"),
            (ENV_REQUEST_TIMEOUT_MILLIS, "0"),
        ]));
        assert!(matches!(result, Err(ConfigError::Invalid { name, .. }) if name == ENV_REQUEST_TIMEOUT_MILLIS));
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("ws://localhost:8080").is_ok());
        assert!(validate_url("wss://example.com/ws").is_ok());
        assert!(validate_url("http://example.com").is_err());
        assert!(validate_url("ws://").is_err());
        assert!(validate_url("").is_err());
    }
}
