use std::sync::Arc;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use super::{Channel, Provider};
use crate::{error::PermanentError, rate_limiter::RateLimitConfig};

/// Builds a channel from its configuration
pub type ChannelBuilder =
    Arc<dyn Fn(&ChannelConfig) -> Result<Arc<dyn Channel>, PermanentError> + Send + Sync>;

/// Configuration for a single named channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub provider: Provider,

    /// Disabled channels are skipped when building the router
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Rate limits for this channel, defaults to [`RateLimitConfig::for_provider`]
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,

    /// Provider specific settings (hosts, API keys, regions, ...)
    #[serde(default)]
    pub settings: AHashMap<String, String>,
}

const fn default_enabled() -> bool {
    true
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>, provider: Provider) -> Self {
        Self {
            name: name.into(),
            provider,
            enabled: default_enabled(),
            rate_limit: None,
            settings: AHashMap::default(),
        }
    }

    #[must_use]
    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    /// The configured rate limit, or the provider's default
    pub fn rate_limit(&self) -> RateLimitConfig {
        self.rate_limit
            .clone()
            .unwrap_or_else(|| RateLimitConfig::for_provider(self.provider))
    }

    /// Look up a setting that a channel cannot work without
    ///
    /// # Errors
    ///
    /// Returns [`PermanentError::Configuration`] when the setting is missing or empty.
    pub fn require(&self, key: &str) -> Result<&str, PermanentError> {
        self.settings
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| {
                PermanentError::Configuration(format!(
                    "Channel '{}' is missing required setting '{key}'",
                    self.name
                ))
            })
    }
}

/// Registry of channel builders keyed by provider
///
/// Concrete transports register themselves here; building a channel for a
/// provider nobody registered is a configuration error.
#[derive(Default, Clone)]
pub struct ChannelFactory {
    builders: AHashMap<Provider, ChannelBuilder>,
}

impl ChannelFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the builder for `provider`, replacing any previous one
    pub fn register<F>(&mut self, provider: Provider, builder: F)
    where
        F: Fn(&ChannelConfig) -> Result<Arc<dyn Channel>, PermanentError> + Send + Sync + 'static,
    {
        tracing::debug!(%provider, "Registering channel builder");
        self.builders.insert(provider, Arc::new(builder));
    }

    pub fn unregister(&mut self, provider: Provider) -> bool {
        self.builders.remove(&provider).is_some()
    }

    #[must_use]
    pub fn is_registered(&self, provider: Provider) -> bool {
        self.builders.contains_key(&provider)
    }

    /// Providers that can currently be built, in declaration order
    #[must_use]
    pub fn supported_providers(&self) -> Vec<Provider> {
        Provider::ALL
            .into_iter()
            .filter(|provider| self.builders.contains_key(provider))
            .collect()
    }

    /// Build the channel described by `config`
    ///
    /// # Errors
    ///
    /// Returns [`PermanentError::Configuration`] if no builder is registered for
    /// the provider, or whatever the builder itself rejects.
    pub fn create(&self, config: &ChannelConfig) -> Result<Arc<dyn Channel>, PermanentError> {
        let builder = self.builders.get(&config.provider).ok_or_else(|| {
            PermanentError::Configuration(format!(
                "Provider '{}' is not supported (channel '{}')",
                config.provider, config.name
            ))
        })?;

        builder(config)
    }
}

impl core::fmt::Debug for ChannelFactory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChannelFactory")
            .field("providers", &self.supported_providers())
            .finish()
    }
}
