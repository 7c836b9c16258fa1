//! Construction-time configuration.
//!
//! Loading flow:
//! 1. Start with compiled [`RxRpcSettings::default()`]
//! 2. If a JSON settings file is given and exists, merge it over the defaults
//! 3. Apply `RXRPC_`-prefixed environment variables (highest priority),
//!    nested with `__`, e.g. `RXRPC_POLLING__POLLING_PERIOD_MS=250`
//!
//! Values are fixed once a component is constructed; nothing here is
//! re-read at runtime.

use std::path::Path;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::retry::RetryPolicy;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "RXRPC_";

/// Errors that can occur when loading settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// A provider failed or a value had the wrong shape.
    #[error("failed to load settings: {0}")]
    Load(#[from] Box<figment::Error>),
}

/// All rxrpc settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RxRpcSettings {
    /// Server settings.
    pub server: ServerConfig,
    /// Polling transport settings.
    pub polling: PollingConfig,
    /// Polling listener settings.
    pub listener: ListenerConfig,
    /// Client settings.
    pub client: ClientConfig,
}

/// Configuration for the RPC server.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Maximum concurrently open sessions (`0` = unlimited).
    pub max_sessions: usize,
}

/// Configuration for the polling duplex transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Time between poll requests in ms.
    pub polling_period_ms: u64,
    /// Delay before the first poll retry in ms; doubles per retry.
    pub retry_initial_delay_ms: u64,
    /// Retries allowed per poll before the transport is considered dead.
    pub retry_max_count: u32,
    /// Cap on a single retry delay in ms.
    pub retry_max_delay_ms: u64,
    /// Timeout for each HTTP request in seconds.
    pub request_timeout_secs: u64,
    /// Fail the incoming stream when an outgoing message cannot be sent.
    pub propagate_send_errors: bool,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            polling_period_ms: 500,
            retry_initial_delay_ms: 500,
            retry_max_count: 5,
            retry_max_delay_ms: 30_000,
            request_timeout_secs: 30,
            propagate_send_errors: false,
        }
    }
}

impl PollingConfig {
    /// Poll period as a `Duration`.
    pub fn polling_period(&self) -> Duration {
        Duration::from_millis(self.polling_period_ms)
    }

    /// Request timeout as a `Duration`.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Retry policy applied to each poll.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry_max_count,
            initial_delay_ms: self.retry_initial_delay_ms,
            max_delay_ms: self.retry_max_delay_ms,
        }
    }
}

/// Configuration for the HTTP polling listener.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Evict a client that has not polled or sent for this long, in ms
    /// (`0` keeps clients until they are gone).
    pub idle_timeout_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 30_000,
        }
    }
}

impl ListenerConfig {
    /// Idle timeout, if eviction is enabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }
}

/// Configuration for the invocation client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Interval between keep-alive messages in ms (`0` disables them).
    pub keep_alive_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval_ms: 30_000,
        }
    }
}

impl ClientConfig {
    /// Keep-alive interval, if enabled.
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        (self.keep_alive_interval_ms > 0).then(|| Duration::from_millis(self.keep_alive_interval_ms))
    }
}

/// Load settings from defaults and environment only.
pub fn load_settings() -> Result<RxRpcSettings, SettingsError> {
    extract(base_figment())
}

/// Load settings with a JSON file layered between defaults and environment.
///
/// A missing file is not an error; defaults are used.
pub fn load_settings_from_path(path: &Path) -> Result<RxRpcSettings, SettingsError> {
    if path.exists() {
        debug!(?path, "loading settings from file");
    } else {
        debug!(?path, "settings file not found, using defaults");
    }
    let figment = Figment::from(Serialized::defaults(RxRpcSettings::default()))
        .merge(Json::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"));
    extract(figment)
}

fn base_figment() -> Figment {
    Figment::from(Serialized::defaults(RxRpcSettings::default()))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

fn extract(figment: Figment) -> Result<RxRpcSettings, SettingsError> {
    figment.extract().map_err(|e| SettingsError::Load(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn polling_defaults() {
        let cfg = PollingConfig::default();
        assert_eq!(cfg.polling_period(), Duration::from_millis(500));
        assert_eq!(cfg.retry_max_count, 5);
        assert!(!cfg.propagate_send_errors);
    }

    #[test]
    fn retry_policy_mirrors_polling_fields() {
        let cfg = PollingConfig {
            retry_initial_delay_ms: 10,
            retry_max_count: 3,
            ..PollingConfig::default()
        };
        let policy = cfg.retry_policy();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_delay_ms, 10);
    }

    #[test]
    fn keep_alive_zero_disables() {
        let cfg = ClientConfig {
            keep_alive_interval_ms: 0,
        };
        assert!(cfg.keep_alive_interval().is_none());
        assert_eq!(
            ClientConfig::default().keep_alive_interval(),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn listener_idle_timeout() {
        assert_eq!(
            ListenerConfig::default().idle_timeout(),
            Some(Duration::from_secs(30))
        );
        let disabled = ListenerConfig { idle_timeout_ms: 0 };
        assert!(disabled.idle_timeout().is_none());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: RxRpcSettings =
            serde_json::from_str(r#"{"polling": {"retry_max_count": 1}}"#).unwrap();
        assert_eq!(cfg.polling.retry_max_count, 1);
        assert_eq!(cfg.polling.polling_period_ms, 500);
        assert_eq!(cfg.server, ServerConfig::default());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_settings_from_path(&dir.path().join("absent.json")).unwrap();
        assert_eq!(cfg.polling, PollingConfig::default());
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"{{"server": {{"max_sessions": 7}}, "polling": {{"polling_period_ms": 50}}}}"#
        )
        .unwrap();

        let cfg = load_settings_from_path(&path).unwrap();
        assert_eq!(cfg.server.max_sessions, 7);
        assert_eq!(cfg.polling.polling_period_ms, 50);
        assert_eq!(cfg.polling.retry_max_count, 5);
    }

    #[test]
    fn wrong_type_in_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"max_sessions": "many"}}"#).unwrap();

        let err = load_settings_from_path(&path).unwrap_err();
        assert!(err.to_string().contains("failed to load settings"));
    }
}
