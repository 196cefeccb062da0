//! Service configuration
//!
//! A [`DeliveryConfig`] is read from RON, for example:
//!
//! ```ron
//! (
//!     queue: (workers: 8, max_queue_size: 50000),
//!     router: (default_channel: "relay"),
//!     channels: [
//!         (name: "relay", provider: "smtp", settings: {"host": "mail.example.org"}),
//!         (name: "bulk", provider: "sendgrid", rate_limit: (strategy: token_bucket)),
//!     ],
//! )
//! ```

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use courier_common::logging::LoggingConfig;
use serde::{Deserialize, Serialize};

use crate::{channel::ChannelConfig, error::SystemError, queue::QueueConfig, router::RouterConfig};

const CONFIG_ENV: &str = "COURIER_CONFIG";
const DEFAULT_PATHS: [&str; 2] = ["./courier.config.ron", "/etc/courier/courier.config.ron"];

const fn default_stats_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub channels: Vec<ChannelConfig>,

    /// Passed to [`courier_common::logging::init`] by whoever owns the process
    #[serde(default)]
    pub logging: LoggingConfig,

    /// How often the service logs queue and router counters, in seconds
    ///
    /// Default: 60
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            router: RouterConfig::default(),
            channels: Vec::new(),
            logging: LoggingConfig::default(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

impl DeliveryConfig {
    /// Parse and validate a RON document
    ///
    /// Optional fields may be written without `Some(..)`.
    pub fn from_ron_str(config: &str) -> Result<Self, SystemError> {
        let config: Self = ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .from_str(config)
            .map_err(|err| SystemError::Configuration(err.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SystemError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        Self::from_ron_str(&content).map_err(|err| match err {
            SystemError::Configuration(reason) => {
                SystemError::Configuration(format!("{}: {reason}", path.display()))
            }
            other => other,
        })
    }

    /// Check the cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<(), SystemError> {
        if self.queue.workers == 0 {
            return Err(invalid("queue.workers must be at least 1"));
        }

        if self.queue.batch_size == 0 {
            return Err(invalid("queue.batch_size must be at least 1"));
        }

        if self.queue.max_queue_size == 0 {
            return Err(invalid("queue.max_queue_size must be at least 1"));
        }

        let mut names = HashSet::with_capacity(self.channels.len());
        for channel in &self.channels {
            if channel.name.is_empty() {
                return Err(invalid("channel names cannot be empty"));
            }

            if !names.insert(channel.name.as_str()) {
                return Err(invalid(format!(
                    "channel '{}' is defined more than once",
                    channel.name
                )));
            }

            if let Some(limits) = &channel.rate_limit
                && limits.window_size_ms == 0
            {
                return Err(invalid(format!(
                    "channel '{}' has a zero rate limit window",
                    channel.name
                )));
            }
        }

        if let Some(default) = &self.router.default_channel
            && !names.contains(default.as_str())
        {
            return Err(invalid(format!(
                "router.default_channel '{default}' is not a configured channel"
            )));
        }

        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> SystemError {
    SystemError::Configuration(reason.into())
}

/// Find the configuration file using the following precedence:
/// 1. `COURIER_CONFIG` environment variable
/// 2. ./courier.config.ron (current working directory)
/// 3. /etc/courier/courier.config.ron (system-wide config)
pub fn find_config_file() -> Result<PathBuf, SystemError> {
    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }

        return Err(invalid(format!(
            "{CONFIG_ENV} points to non-existent file: {}",
            path.display()
        )));
    }

    if let Some(path) = DEFAULT_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
    {
        return Ok(path);
    }

    let paths_tried = DEFAULT_PATHS
        .iter()
        .map(|path| format!("  - {path}"))
        .collect::<Vec<_>>()
        .join("\n");

    Err(invalid(format!(
        "No configuration file found. Tried:\n  - {CONFIG_ENV} environment variable\n{paths_tried}"
    )))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{channel::Provider, rate_limiter::RateLimitStrategy};

    const CONFIG: &str = r#"(
        queue: (
            workers: 8,
            max_queue_size: 500,
            retry: (max_retries: 5, base_retry_delay_secs: 30),
        ),
        router: (default_channel: "relay"),
        channels: [
            (
                name: "relay",
                provider: "smtp",
                settings: {"host": "mail.example.org", "port": "587"},
            ),
            (
                name: "bulk",
                provider: "SendGrid",
                enabled: false,
                rate_limit: (strategy: token_bucket, max_requests_per_second: 20),
            ),
        ],
    )"#;

    #[test]
    fn test_parse() {
        let config = DeliveryConfig::from_ron_str(CONFIG).unwrap();

        assert_eq!(config.queue.workers, 8);
        assert_eq!(config.queue.max_queue_size, 500);
        assert_eq!(config.queue.batch_size, 10);
        assert_eq!(config.queue.retry.max_retries, 5);
        assert_eq!(config.queue.retry.base_retry_delay_secs, 30);
        assert_eq!(config.router.default_channel.as_deref(), Some("relay"));
        assert!(config.router.enable_fallback);
        assert_eq!(config.stats_interval_secs, 60);

        let relay = &config.channels[0];
        assert_eq!(relay.provider, Provider::Smtp);
        assert!(relay.enabled);
        assert_eq!(relay.require("host").unwrap(), "mail.example.org");
        assert!(relay.rate_limit.is_none());

        let bulk = &config.channels[1];
        assert_eq!(bulk.provider, Provider::SendGrid);
        assert!(!bulk.enabled);
        let limits = bulk.rate_limit();
        assert_eq!(limits.strategy, RateLimitStrategy::TokenBucket);
        assert_eq!(limits.max_requests_per_second, 20);
        assert_eq!(limits.max_requests_per_minute, 600);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = DeliveryConfig::from_ron_str("()").unwrap();
        assert_eq!(config.queue, QueueConfig::default());
        assert_eq!(config.router, RouterConfig::default());
        assert!(config.channels.is_empty());
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let err = DeliveryConfig::from_ron_str(
            r#"(channels: [(name: "pigeon", provider: "carrier_pigeon")])"#,
        )
        .unwrap_err();
        assert!(matches!(err, SystemError::Configuration(_)));
        assert!(err.to_string().contains("carrier_pigeon"));
    }

    #[test]
    fn test_validation() {
        let cases = [
            ("(queue: (workers: 0))", "workers"),
            ("(queue: (batch_size: 0))", "batch_size"),
            ("(queue: (max_queue_size: 0))", "max_queue_size"),
            (
                r#"(channels: [(name: "a", provider: "smtp"), (name: "a", provider: "mailgun")])"#,
                "more than once",
            ),
            (r#"(router: (default_channel: "missing"))"#, "missing"),
            (
                r#"(channels: [(name: "a", provider: "smtp", rate_limit: (window_size_ms: 0))])"#,
                "zero rate limit window",
            ),
        ];

        for (config, expected) in cases {
            let err = DeliveryConfig::from_ron_str(config).unwrap_err();
            assert!(
                err.to_string().contains(expected),
                "{config} should fail mentioning {expected}, got {err}"
            );
        }
    }

    #[test]
    fn test_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();

        let config = DeliveryConfig::load(file.path()).unwrap();
        assert_eq!(config.channels.len(), 2);

        let missing = DeliveryConfig::load(file.path().with_extension("missing")).unwrap_err();
        assert!(matches!(missing, SystemError::Io(_)));
    }

    #[test]
    fn test_load_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"(queue: (workers: 0))").unwrap();

        let err = DeliveryConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }
}
