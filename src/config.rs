use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::channel::retry::{ExponentialBackoff, NeverReconnect, ReconnectPolicy};
use crate::error::ConfigError;
use crate::events::LogCapacity;

pub const METRICS_PATH: &str = "/realtime/data/facialmetrics";
pub const NOTIFICATIONS_PATH: &str = "/realtime/notification/drowsiness";
pub const RAW_FEED_PATH: &str = "/realtime/video/raw";
pub const PROCESSED_FEED_PATH: &str = "/realtime/video/processed";
pub const EVENTS_PATH: &str = "/drowsinessevent";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectMode {
    Off,
    Backoff,
}

impl ReconnectMode {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "backoff" | "on" | "1" | "true" => ReconnectMode::Backoff,
            _ => ReconnectMode::Off,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_base: String,
    pub ws_base: String,
    pub metric_capacity: usize,
    /// Zero keeps every event.
    pub event_log_capacity: usize,
    pub feed_refresh_ms: u64,
    pub feed_probe_ms: u64,
    pub feed_probe_timeout_ms: u64,
    pub feed_fallback: String,
    pub reconnect: ReconnectMode,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_max_attempts: Option<u32>,
    pub snapshot_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let api_base = "http://localhost:8000".to_string();
        Self {
            ws_base: derive_ws_base(&api_base),
            api_base,
            metric_capacity: crate::buffer::DEFAULT_CAPACITY,
            event_log_capacity: 0,
            feed_refresh_ms: 5000,
            feed_probe_ms: 5000,
            feed_probe_timeout_ms: 3000,
            feed_fallback: "assets/stream-unavailable.png".to_string(),
            reconnect: ReconnectMode::Off,
            reconnect_base_ms: 500,
            reconnect_max_ms: 30_000,
            reconnect_max_attempts: None,
            snapshot_secs: 5,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        let api_base = std::env::var("DASH_API_BASE").unwrap_or(d.api_base);
        Self {
            ws_base: std::env::var("DASH_WS_BASE").unwrap_or_else(|_| derive_ws_base(&api_base)),
            api_base,
            metric_capacity: std::env::var("METRIC_CAPACITY").ok().and_then(|v| v.parse().ok()).unwrap_or(d.metric_capacity),
            event_log_capacity: std::env::var("EVENT_LOG_CAPACITY").ok().and_then(|v| v.parse().ok()).unwrap_or(d.event_log_capacity),
            feed_refresh_ms: std::env::var("FEED_REFRESH_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.feed_refresh_ms),
            feed_probe_ms: std::env::var("FEED_PROBE_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.feed_probe_ms),
            feed_probe_timeout_ms: std::env::var("FEED_PROBE_TIMEOUT_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.feed_probe_timeout_ms),
            feed_fallback: std::env::var("FEED_FALLBACK").unwrap_or(d.feed_fallback),
            reconnect: std::env::var("RECONNECT").map(|v| ReconnectMode::parse(&v)).unwrap_or(d.reconnect),
            reconnect_base_ms: std::env::var("RECONNECT_BASE_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.reconnect_base_ms),
            reconnect_max_ms: std::env::var("RECONNECT_MAX_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.reconnect_max_ms),
            reconnect_max_attempts: std::env::var("RECONNECT_MAX_ATTEMPTS").ok().and_then(|v| v.parse().ok()),
            snapshot_secs: std::env::var("SNAPSHOT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(d.snapshot_secs),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_scheme("DASH_API_BASE", &self.api_base, &["http", "https"])?;
        check_scheme("DASH_WS_BASE", &self.ws_base, &["ws", "wss"])?;
        for (key, value) in [
            ("METRIC_CAPACITY", self.metric_capacity as u64),
            ("FEED_REFRESH_MS", self.feed_refresh_ms),
            ("FEED_PROBE_MS", self.feed_probe_ms),
            ("FEED_PROBE_TIMEOUT_MS", self.feed_probe_timeout_ms),
            ("SNAPSHOT_SECS", self.snapshot_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(key));
            }
        }
        Ok(())
    }

    pub fn metrics_endpoint(&self) -> Result<Url, ConfigError> {
        join("DASH_WS_BASE", &self.ws_base, METRICS_PATH)
    }

    pub fn notifications_endpoint(&self) -> Result<Url, ConfigError> {
        join("DASH_WS_BASE", &self.ws_base, NOTIFICATIONS_PATH)
    }

    pub fn raw_feed_url(&self) -> Result<Url, ConfigError> {
        join("DASH_API_BASE", &self.api_base, RAW_FEED_PATH)
    }

    pub fn processed_feed_url(&self) -> Result<Url, ConfigError> {
        join("DASH_API_BASE", &self.api_base, PROCESSED_FEED_PATH)
    }

    pub fn events_url(&self) -> Result<Url, ConfigError> {
        join("DASH_API_BASE", &self.api_base, EVENTS_PATH)
    }

    pub fn log_capacity(&self) -> LogCapacity {
        match self.event_log_capacity {
            0 => LogCapacity::Unbounded,
            k => LogCapacity::MostRecent(k),
        }
    }

    pub fn feed_refresh(&self) -> Duration {
        Duration::from_millis(self.feed_refresh_ms)
    }

    pub fn feed_probe(&self) -> Duration {
        Duration::from_millis(self.feed_probe_ms)
    }

    pub fn feed_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.feed_probe_timeout_ms)
    }

    pub fn reconnect_policy(&self) -> Arc<dyn ReconnectPolicy> {
        match self.reconnect {
            ReconnectMode::Off => Arc::new(NeverReconnect),
            ReconnectMode::Backoff => Arc::new(ExponentialBackoff {
                base_delay_ms: self.reconnect_base_ms,
                max_delay_ms: self.reconnect_max_ms,
                max_attempts: self.reconnect_max_attempts,
                ..Default::default()
            }),
        }
    }
}

/// `http://host` → `ws://host`, `https://host` → `wss://host`.
pub fn derive_ws_base(api_base: &str) -> String {
    if let Some(rest) = api_base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = api_base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        api_base.to_string()
    }
}

fn join(key: &'static str, base: &str, path: &str) -> Result<Url, ConfigError> {
    let raw = format!("{}{}", base.trim_end_matches('/'), path);
    Url::parse(&raw).map_err(|source| ConfigError::Url { key, source })
}

fn check_scheme(key: &'static str, raw: &str, allowed: &[&str]) -> Result<(), ConfigError> {
    let url = Url::parse(raw).map_err(|source| ConfigError::Url { key, source })?;
    if allowed.contains(&url.scheme()) {
        Ok(())
    } else {
        Err(ConfigError::Scheme {
            key,
            scheme: url.scheme().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.ws_base, "ws://localhost:8000");
        assert_eq!(cfg.log_capacity(), LogCapacity::Unbounded);
    }

    #[test]
    fn test_ws_base_derivation() {
        assert_eq!(derive_ws_base("https://rig.local"), "wss://rig.local");
        assert_eq!(derive_ws_base("http://10.0.0.2:8000"), "ws://10.0.0.2:8000");
    }

    #[test]
    fn test_endpoints_keep_base_path() {
        let cfg = Config {
            api_base: "http://rig.local/api/".to_string(),
            ws_base: "ws://rig.local/api".to_string(),
            ..Default::default()
        };
        assert_eq!(
            cfg.metrics_endpoint().unwrap().as_str(),
            "ws://rig.local/api/realtime/data/facialmetrics"
        );
        assert_eq!(
            cfg.raw_feed_url().unwrap().as_str(),
            "http://rig.local/api/realtime/video/raw"
        );
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cfg = Config {
            ws_base: "http://localhost:8000".to_string(),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Scheme { .. })));

        let cfg = Config {
            feed_probe_ms: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Zero("FEED_PROBE_MS"))));
    }

    #[test]
    fn test_bounded_log_capacity() {
        let cfg = Config {
            event_log_capacity: 20,
            ..Default::default()
        };
        assert_eq!(cfg.log_capacity(), LogCapacity::MostRecent(20));
    }

    #[test]
    fn test_reconnect_mode_parse() {
        assert_eq!(ReconnectMode::parse("backoff"), ReconnectMode::Backoff);
        assert_eq!(ReconnectMode::parse("off"), ReconnectMode::Off);
        assert_eq!(ReconnectMode::parse("garbage"), ReconnectMode::Off);
    }
}
