use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::NotifyError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotificatorConfig {
    /// Capacity of each consumer queue
    pub queue_size: usize,
    /// First reconnect delay after losing the upstream connection
    pub min_reconnect_interval_ms: u64,
    /// Reconnect delay ceiling
    pub max_reconnect_interval_ms: u64,
}

impl Default for NotificatorConfig {
    fn default() -> Self {
        Self {
            queue_size: 100,
            min_reconnect_interval_ms: 200,
            max_reconnect_interval_ms: 20_000,
        }
    }
}

impl NotificatorConfig {
    /// Defaults overridden by `SB_NOTIFICATION_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            queue_size: env_or_parse("SB_NOTIFICATION_QUEUE_SIZE", defaults.queue_size),
            min_reconnect_interval_ms: env_or_parse(
                "SB_NOTIFICATION_MIN_RECONNECT_MS",
                defaults.min_reconnect_interval_ms,
            ),
            max_reconnect_interval_ms: env_or_parse(
                "SB_NOTIFICATION_MAX_RECONNECT_MS",
                defaults.max_reconnect_interval_ms,
            ),
        }
    }

    pub fn validate(&self) -> Result<(), NotifyError> {
        if self.min_reconnect_interval_ms == 0 {
            return Err(NotifyError::Config(
                "min reconnect interval must be greater than zero".to_string(),
            ));
        }
        if self.min_reconnect_interval_ms > self.max_reconnect_interval_ms {
            return Err(NotifyError::Config(format!(
                "min reconnect interval ({}ms) exceeds max reconnect interval ({}ms)",
                self.min_reconnect_interval_ms, self.max_reconnect_interval_ms
            )));
        }
        Ok(())
    }

    pub fn min_reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.min_reconnect_interval_ms)
    }

    pub fn max_reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_interval_ms)
    }
}

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NotificatorConfig::default();
        assert_eq!(config.queue_size, 100);
        assert_eq!(config.min_reconnect_interval(), Duration::from_millis(200));
        assert_eq!(config.max_reconnect_interval(), Duration::from_secs(20));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_intervals() {
        let config = NotificatorConfig {
            min_reconnect_interval_ms: 5000,
            max_reconnect_interval_ms: 1000,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(NotifyError::Config(_))));

        let config = NotificatorConfig {
            min_reconnect_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: NotificatorConfig = serde_json::from_str(r#"{"queue_size": 5}"#).unwrap();
        assert_eq!(config.queue_size, 5);
        assert_eq!(config.max_reconnect_interval_ms, 20_000);
    }

    #[test]
    fn test_from_env_overrides() {
        std::env::set_var("SB_NOTIFICATION_QUEUE_SIZE", "7");
        std::env::set_var("SB_NOTIFICATION_MAX_RECONNECT_MS", "not-a-number");
        let config = NotificatorConfig::from_env();
        std::env::remove_var("SB_NOTIFICATION_QUEUE_SIZE");
        std::env::remove_var("SB_NOTIFICATION_MAX_RECONNECT_MS");

        assert_eq!(config.queue_size, 7);
        assert_eq!(config.max_reconnect_interval_ms, 20_000);
    }
}
