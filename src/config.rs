//! Monitor configuration.
//!
//! All values have defaults; only the developer token must be provided
//! before `connect()`.

use std::time::Duration;

use crate::error::ConfigurationError;

/// Realtime host used when neither the delegate nor the config names one.
pub const DEFAULT_REALTIME_HOST: &str = "realtime-api.bringg.com";

/// Staleness bound: a live connection silent for longer than this is suspect.
pub const MAX_WITHOUT_REALTIME: Duration = Duration::from_secs(240);

/// Environment variable names read by [`MonitorConfig::from_env`].
pub mod env {
    /// Developer token.
    pub const DEVELOPER_TOKEN: &str = "TRACKMON_DEVELOPER_TOKEN";
    /// `true`/`false`, `1`/`0`.
    pub const USE_SSL: &str = "TRACKMON_USE_SSL";
    /// Custom realtime host.
    pub const HOST: &str = "TRACKMON_HOST";
    /// Acknowledgement timeout in milliseconds.
    pub const ACK_TIMEOUT_MS: &str = "TRACKMON_ACK_TIMEOUT_MS";
    /// Staleness threshold in seconds.
    pub const STALENESS_SECS: &str = "TRACKMON_STALENESS_SECS";
}

/// Monitor settings. Start from `Default` or [`MonitorConfig::from_env`].
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Developer token used in the channel handshake.
    pub developer_token: Option<String>,
    /// Connect over TLS. Default: true.
    pub use_ssl: bool,
    /// Custom realtime host. The connection delegate can still override it.
    pub host: Option<String>,
    /// Bound on waiting for a watch acknowledgement, measured from emission.
    pub ack_timeout: Duration,
    /// Silence after which a live connection counts as stale.
    pub staleness_threshold: Duration,
    /// Poll interval of the connectivity watcher.
    pub reachability_poll_interval: Duration,
    /// Max queued ack-timer control messages.
    pub timer_queue_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            developer_token: None,
            use_ssl: true,
            host: None,
            ack_timeout: Duration::from_secs(15),
            staleness_threshold: MAX_WITHOUT_REALTIME,
            reachability_poll_interval: Duration::from_secs(5),
            timer_queue_capacity: 1024,
        }
    }
}

impl MonitorConfig {
    /// Sets the developer token.
    #[must_use]
    pub fn with_developer_token(mut self, token: impl Into<String>) -> Self {
        self.developer_token = Some(token.into());
        self
    }

    /// Enables or disables TLS.
    #[must_use]
    pub const fn with_ssl(mut self, use_ssl: bool) -> Self {
        self.use_ssl = use_ssl;
        self
    }

    /// Sets a custom host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the acknowledgement timeout.
    #[must_use]
    pub const fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Sets the staleness threshold.
    #[must_use]
    pub const fn with_staleness_threshold(mut self, threshold: Duration) -> Self {
        self.staleness_threshold = threshold;
        self
    }

    /// Builds a config from `TRACKMON_*` environment variables on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidValue` for unparsable values.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidValue` for unparsable values.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(token) = lookup(env::DEVELOPER_TOKEN) {
            cfg.developer_token = Some(token);
        }
        if let Some(raw) = lookup(env::USE_SSL) {
            cfg.use_ssl = parse_bool(env::USE_SSL, &raw)?;
        }
        if let Some(host) = lookup(env::HOST) {
            let host = host.trim().to_string();
            if !host.is_empty() {
                cfg.host = Some(host);
            }
        }
        if let Some(raw) = lookup(env::ACK_TIMEOUT_MS) {
            cfg.ack_timeout = Duration::from_millis(parse_positive(env::ACK_TIMEOUT_MS, &raw)?);
        }
        if let Some(raw) = lookup(env::STALENESS_SECS) {
            cfg.staleness_threshold = Duration::from_secs(parse_positive(env::STALENESS_SECS, &raw)?);
        }

        Ok(cfg)
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigurationError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigurationError::InvalidValue {
            key: key.to_string(),
            reason: format!("expected a boolean, got '{other}'"),
        }),
    }
}

fn parse_positive(key: &str, raw: &str) -> Result<u64, ConfigurationError> {
    let value: u64 = raw.trim().parse().map_err(|_| ConfigurationError::InvalidValue {
        key: key.to_string(),
        reason: format!("expected an integer, got '{raw}'"),
    })?;
    if value == 0 {
        return Err(ConfigurationError::InvalidValue {
            key: key.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults() {
        let cfg = MonitorConfig::default();
        assert!(cfg.use_ssl);
        assert!(cfg.developer_token.is_none());
        assert_eq!(cfg.staleness_threshold, Duration::from_secs(240));
    }

    #[test]
    fn test_from_lookup() {
        let cfg = MonitorConfig::from_lookup(lookup(&[
            (env::DEVELOPER_TOKEN, "T1"),
            (env::USE_SSL, "false"),
            (env::HOST, " rt.local:3030 "),
            (env::ACK_TIMEOUT_MS, "2500"),
            (env::STALENESS_SECS, "60"),
        ]))
        .unwrap();

        assert_eq!(cfg.developer_token.as_deref(), Some("T1"));
        assert!(!cfg.use_ssl);
        assert_eq!(cfg.host.as_deref(), Some("rt.local:3030"));
        assert_eq!(cfg.ack_timeout, Duration::from_millis(2500));
        assert_eq!(cfg.staleness_threshold, Duration::from_secs(60));
    }

    #[test]
    fn test_from_lookup_rejects_bad_bool() {
        let err = MonitorConfig::from_lookup(lookup(&[(env::USE_SSL, "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidValue { .. }));
    }

    #[test]
    fn test_from_lookup_rejects_zero_timeout() {
        assert!(MonitorConfig::from_lookup(lookup(&[(env::ACK_TIMEOUT_MS, "0")])).is_err());
        assert!(MonitorConfig::from_lookup(lookup(&[(env::STALENESS_SECS, "x")])).is_err());
    }

    #[test]
    fn test_builder_methods() {
        let cfg = MonitorConfig::default()
            .with_developer_token("T")
            .with_ssl(false)
            .with_host("h")
            .with_ack_timeout(Duration::from_millis(5))
            .with_staleness_threshold(Duration::from_secs(1));
        assert_eq!(cfg.developer_token.as_deref(), Some("T"));
        assert!(!cfg.use_ssl);
        assert_eq!(cfg.host.as_deref(), Some("h"));
        assert_eq!(cfg.ack_timeout, Duration::from_millis(5));
        assert_eq!(cfg.staleness_threshold, Duration::from_secs(1));
    }
}
