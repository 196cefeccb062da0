//! Channel routing and failover
//!
//! The router owns every registered channel together with its rate limiter. For
//! each message it picks a channel (named by the caller, the configured default,
//! or the [`SelectionStrategy`]), waits for that channel's limiter, sends, and
//! classifies the outcome. A channel-related failure gets one attempt on another
//! valid channel when fallback is enabled.

mod stats;

use std::{collections::BTreeMap, panic::AssertUnwindSafe, sync::Arc};

use async_trait::async_trait;
use courier_common::{Message, outgoing};
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::Span;

pub use self::stats::RouterStats;
use crate::{
    channel::{Channel, SendReceipt},
    error::{DeliveryError, PermanentError, SystemError, TemporaryError, panic_message},
    policy::{FirstAvailable, SelectionStrategy},
    queue::{Dispatcher, QueueEntry},
    rate_limiter::{RateLimitConfig, RateLimitStatus, RateLimiter},
    types::DeliveryReport,
};

const fn default_enable_fallback() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Channel used by [`Router::send`] when the caller does not name one
    #[serde(default)]
    pub default_channel: Option<String>,

    /// Try another channel after a channel-related failure
    ///
    /// Default: `true`
    #[serde(default = "default_enable_fallback")]
    pub enable_fallback: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_channel: None,
            enable_fallback: default_enable_fallback(),
        }
    }
}

/// A registered channel and its rate limiter
pub struct ChannelDescriptor {
    name: String,
    channel: Arc<dyn Channel>,
    limiter: RateLimiter,
}

impl ChannelDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub const fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn is_valid(&self) -> bool {
        self.channel.is_valid()
    }
}

impl core::fmt::Debug for ChannelDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChannelDescriptor")
            .field("name", &self.name)
            .field("provider", &self.channel.provider())
            .field("limiter", &self.limiter)
            .finish()
    }
}

pub struct Router {
    enable_fallback: bool,
    default_channel: RwLock<Option<String>>,
    /// Registration order
    channels: RwLock<Vec<Arc<ChannelDescriptor>>>,
    selection: Box<dyn SelectionStrategy>,
    stats: RouterStats,
    span: Span,
}

impl Default for Router {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

impl Router {
    #[must_use]
    pub fn new(config: RouterConfig) -> Self {
        Self {
            enable_fallback: config.enable_fallback,
            default_channel: RwLock::new(config.default_channel),
            channels: RwLock::new(Vec::new()),
            selection: Box::new(FirstAvailable),
            stats: RouterStats::default(),
            span: Span::none(),
        }
    }

    /// Emit routing events under `span`
    ///
    /// Channels registered afterwards get a child span each.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    #[must_use]
    pub fn with_selection(mut self, selection: impl SelectionStrategy + 'static) -> Self {
        self.selection = Box::new(selection);
        self
    }

    /// Register `channel` under its own name
    ///
    /// # Errors
    ///
    /// [`PermanentError::Configuration`] if a channel with that name exists.
    pub fn add_channel(
        &self,
        channel: Arc<dyn Channel>,
        rate_limit: RateLimitConfig,
    ) -> Result<(), PermanentError> {
        let name = channel.name().to_string();
        let provider = channel.provider();

        let mut channels = self.channels.write();
        if channels.iter().any(|existing| existing.name == name) {
            return Err(PermanentError::Configuration(format!(
                "Channel '{name}' is already registered"
            )));
        }

        let span = tracing::info_span!(parent: &self.span, "channel", %name, %provider);
        channels.push(Arc::new(ChannelDescriptor {
            limiter: RateLimiter::new(rate_limit).with_span(span),
            name: name.clone(),
            channel,
        }));
        drop(channels);

        tracing::debug!(parent: &self.span, %name, %provider, "Channel registered");
        Ok(())
    }

    pub fn remove_channel(&self, name: &str) -> bool {
        let mut channels = self.channels.write();
        let before = channels.len();
        channels.retain(|descriptor| descriptor.name != name);
        before != channels.len()
    }

    pub fn set_default_channel(&self, name: Option<String>) {
        *self.default_channel.write() = name;
    }

    pub fn default_channel(&self) -> Option<String> {
        self.default_channel.read().clone()
    }

    pub fn channel(&self, name: &str) -> Option<Arc<ChannelDescriptor>> {
        self.channels
            .read()
            .iter()
            .find(|descriptor| descriptor.name == name)
            .cloned()
    }

    /// Names of the channels that are currently valid, in registration order
    pub fn available_channels(&self) -> Vec<String> {
        self.channels
            .read()
            .iter()
            .filter(|descriptor| descriptor.is_valid())
            .map(|descriptor| descriptor.name.clone())
            .collect()
    }

    pub fn is_channel_available(&self, name: &str) -> bool {
        self.channel(name)
            .is_some_and(|descriptor| descriptor.is_valid())
    }

    pub fn rate_limit_status(&self, name: &str) -> Option<RateLimitStatus> {
        self.channel(name)
            .map(|descriptor| descriptor.limiter.status())
    }

    /// Check that a channel's transport is reachable
    pub async fn test_connection(&self, name: &str) -> bool {
        let Some(descriptor) = self.channel(name) else {
            return false;
        };

        let reachable = descriptor.channel.test_connection().await;
        tracing::debug!(parent: &self.span, %name, reachable, "Connection test");
        reachable
    }

    /// Send through `channel`, or the default channel, or whichever channel the
    /// selection strategy picks
    pub async fn send(&self, message: &Message, channel: Option<&str>) -> DeliveryReport {
        let started = Instant::now();
        let primary = match channel {
            Some(name) => self
                .channel(name)
                .ok_or_else(|| PermanentError::ChannelNotFound(name.to_string())),
            None => self.default_or_selected(message),
        };

        let mut report = self.route(message, primary).await;
        report.elapsed = started.elapsed();
        report
    }

    /// Send through whichever channel the selection strategy picks
    pub async fn send_auto(&self, message: &Message) -> DeliveryReport {
        let started = Instant::now();
        let primary = self.select(message, None);

        let mut report = self.route(message, primary).await;
        report.elapsed = started.elapsed();
        report
    }

    /// Send each message in turn
    pub async fn send_batch(
        &self,
        messages: &[Message],
        channel: Option<&str>,
    ) -> Vec<DeliveryReport> {
        let mut reports = Vec::with_capacity(messages.len());
        for message in messages {
            reports.push(self.send(message, channel).await);
        }
        reports
    }

    pub fn statistics(&self) -> BTreeMap<String, u64> {
        self.stats.snapshot()
    }

    pub fn reset_statistics(&self) {
        self.stats.reset();
    }

    fn default_or_selected(
        &self,
        message: &Message,
    ) -> Result<Arc<ChannelDescriptor>, PermanentError> {
        if let Some(name) = self.default_channel() {
            if let Some(descriptor) = self.channel(&name) {
                return Ok(descriptor);
            }
            tracing::warn!(parent: &self.span, %name, "Default channel is not registered");
        }

        self.select(message, None)
    }

    /// Ask the selection strategy for a valid channel other than `excluding`
    fn select(
        &self,
        message: &Message,
        excluding: Option<&str>,
    ) -> Result<Arc<ChannelDescriptor>, PermanentError> {
        let channels = self.channels.read();
        let candidates: Vec<&Arc<ChannelDescriptor>> = channels
            .iter()
            .filter(|descriptor| Some(descriptor.name.as_str()) != excluding)
            .filter(|descriptor| descriptor.is_valid())
            .collect();
        let handles: Vec<&dyn Channel> = candidates
            .iter()
            .map(|descriptor| descriptor.channel.as_ref())
            .collect();

        self.selection
            .select(message, &handles)
            .and_then(|index| candidates.get(index))
            .map(|&descriptor| Arc::clone(descriptor))
            .ok_or(PermanentError::NoChannelAvailable)
    }

    async fn route(
        &self,
        message: &Message,
        primary: Result<Arc<ChannelDescriptor>, PermanentError>,
    ) -> DeliveryReport {
        let id = message.id;
        let primary = match primary {
            Ok(primary) => primary,
            Err(err) => {
                tracing::warn!(parent: &self.span, %id, %err, "No channel to send through");
                return DeliveryReport::failed(id, None, err);
            }
        };

        let error = match self.attempt(message, &primary).await {
            Ok(receipt) => return DeliveryReport::sent(id, &primary.name, receipt),
            Err(error) => error,
        };

        if self.enable_fallback
            && error.is_channel_related()
            && let Ok(fallback) = self.select(message, Some(&primary.name))
        {
            self.stats.fallback();
            tracing::warn!(
                parent: &self.span,
                %id,
                from = %primary.name,
                to = %fallback.name,
                %error,
                "Falling back to another channel"
            );

            let mut report = match self.attempt(message, &fallback).await {
                Ok(receipt) => DeliveryReport::sent(id, &fallback.name, receipt),
                Err(error) => DeliveryReport::failed(id, Some(&fallback.name), error),
            };
            report.fell_back = true;
            report.retry_count = 1;
            return report;
        }

        DeliveryReport::failed(id, Some(&primary.name), error)
    }

    /// One attempt on one channel, gated by its rate limiter
    async fn attempt(
        &self,
        message: &Message,
        descriptor: &ChannelDescriptor,
    ) -> Result<SendReceipt, DeliveryError> {
        let name = descriptor.name.as_str();
        let id = message.id;

        if !descriptor.is_valid() {
            self.stats.failure(name);
            return Err(PermanentError::Configuration(format!(
                "Channel '{name}' is not configured for sending"
            ))
            .into());
        }

        if !descriptor.limiter.wait_if_limited().await {
            self.stats.failure(name);
            return Err(TemporaryError::RateLimited(format!(
                "Channel '{name}' is still rate limited after {:?}",
                descriptor.limiter.config().max_wait()
            ))
            .into());
        }

        outgoing!(
            "Sending {id} from {} to {} recipient(s) via {name}",
            message.sender,
            message.recipients.len()
        );

        match AssertUnwindSafe(descriptor.channel.send(message))
            .catch_unwind()
            .await
        {
            Ok(Ok(receipt)) => {
                descriptor.limiter.record_success();
                self.stats.success(name);
                tracing::debug!(
                    parent: &self.span,
                    %id,
                    channel = name,
                    provider_id = receipt.provider_message_id.as_deref().unwrap_or_default(),
                    "Message accepted"
                );
                Ok(receipt)
            }
            Ok(Err(err)) => {
                let error = DeliveryError::from(err);
                if matches!(
                    error,
                    DeliveryError::Temporary(TemporaryError::RateLimited(_))
                ) {
                    descriptor.limiter.record_failure();
                }
                self.stats.failure(name);
                tracing::debug!(parent: &self.span, %id, channel = name, %error, "Channel attempt failed");
                Err(error)
            }
            Err(panic) => {
                let panic = panic_message(panic.as_ref());
                self.stats.failure(name);
                tracing::error!(parent: &self.span, %id, channel = name, %panic, "Channel panicked");
                Err(SystemError::Internal(format!("Channel '{name}' panicked: {panic}")).into())
            }
        }
    }
}

#[async_trait]
impl Dispatcher for Router {
    async fn dispatch(&self, entry: &QueueEntry) -> DeliveryReport {
        if entry.retry_count > 0 {
            self.stats.retry();
        }

        self.send(&entry.message, entry.channel.as_deref()).await
    }
}

impl core::fmt::Debug for Router {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Router")
            .field("enable_fallback", &self.enable_fallback)
            .field("default_channel", &self.default_channel())
            .field("channels", &*self.channels.read())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        channel::Provider,
        error::{ChannelError, ErrorCategory},
        policy::RoundRobin,
    };

    type Outcome = Result<SendReceipt, ChannelError>;

    /// Plays back scripted outcomes, succeeding once the script runs out
    struct Scripted {
        name: &'static str,
        valid: bool,
        outcomes: Mutex<VecDeque<Outcome>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(name: &'static str, outcomes: Vec<Outcome>) -> Arc<Self> {
            Arc::new(Self {
                name,
                valid: true,
                outcomes: Mutex::new(outcomes.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn invalid(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                valid: false,
                outcomes: Mutex::new(VecDeque::new()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Channel for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn provider(&self) -> Provider {
            Provider::Custom
        }

        async fn send(&self, _message: &Message) -> Result<SendReceipt, ChannelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.outcomes.lock().pop_front();
            next.unwrap_or_else(|| Ok(SendReceipt::new(format!("{}-id", self.name))))
        }

        fn is_valid(&self) -> bool {
            self.valid
        }
    }

    struct Panics;

    #[async_trait]
    impl Channel for Panics {
        fn name(&self) -> &str {
            "panics"
        }

        fn provider(&self) -> Provider {
            Provider::Custom
        }

        #[allow(clippy::panic)]
        async fn send(&self, _message: &Message) -> Result<SendReceipt, ChannelError> {
            panic!("provider client exploded");
        }
    }

    fn message() -> Message {
        Message::new(
            "sender@example.org",
            vec!["rcpt@example.com".to_string()],
            "Subject",
            "Body",
        )
    }

    fn router(config: RouterConfig, channels: &[Arc<dyn Channel>]) -> Router {
        let router = Router::new(config);
        for channel in channels {
            router
                .add_channel(Arc::clone(channel), RateLimitConfig::default())
                .unwrap();
        }
        router
    }

    fn timeout() -> Outcome {
        Err(ChannelError::new(ErrorCategory::Timeout, "timed out"))
    }

    #[tokio::test]
    async fn test_send_first_available() {
        let a = Scripted::new("a", vec![]);
        let b = Scripted::new("b", vec![]);
        let router = router(RouterConfig::default(), &[a.clone(), b.clone()]);

        let report = router.send(&message(), None).await;
        assert!(report.is_success());
        assert_eq!(report.channel.as_deref(), Some("a"));
        assert_eq!(report.provider_message_id.as_deref(), Some("a-id"));
        assert!(!report.fell_back);
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn test_send_explicit_and_default() {
        let a = Scripted::new("a", vec![]);
        let b = Scripted::new("b", vec![]);
        let router = router(
            RouterConfig {
                default_channel: Some("b".to_string()),
                ..RouterConfig::default()
            },
            &[a.clone(), b.clone()],
        );

        assert_eq!(router.send(&message(), None).await.channel.as_deref(), Some("b"));
        assert_eq!(router.send(&message(), Some("a")).await.channel.as_deref(), Some("a"));
        // send_auto ignores the default
        assert_eq!(router.send_auto(&message()).await.channel.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_unknown_explicit_channel() {
        let router = router(RouterConfig::default(), &[Scripted::new("a", vec![])]);

        let report = router.send(&message(), Some("nope")).await;
        assert!(matches!(
            report.error,
            Some(DeliveryError::Permanent(PermanentError::ChannelNotFound(_)))
        ));
        assert!(report.channel.is_none());
    }

    #[tokio::test]
    async fn test_no_channel_available() {
        let router = router(RouterConfig::default(), &[Scripted::invalid("a")]);

        let report = router.send(&message(), None).await;
        assert!(matches!(
            report.error,
            Some(DeliveryError::Permanent(PermanentError::NoChannelAvailable))
        ));
        assert!(router.available_channels().is_empty());
    }

    #[tokio::test]
    async fn test_fallback_after_transient_failure() {
        let a = Scripted::new("a", vec![timeout()]);
        let b = Scripted::new("b", vec![]);
        let router = router(RouterConfig::default(), &[a.clone(), b.clone()]);

        let report = router.send(&message(), None).await;
        assert!(report.is_success());
        assert!(report.fell_back);
        assert_eq!(report.retry_count, 1);
        assert_eq!(report.channel.as_deref(), Some("b"));

        let stats = router.statistics();
        assert_eq!(stats.get("a_failure"), Some(&1));
        assert_eq!(stats.get("b_success"), Some(&1));
        assert_eq!(stats.get("fallbacks"), Some(&1));
    }

    #[tokio::test]
    async fn test_no_fallback_for_recipient_errors() {
        let a = Scripted::new(
            "a",
            vec![Err(ChannelError::uncategorised(
                "550 5.1.1 Requested action not taken: mailbox unavailable",
            ))],
        );
        let b = Scripted::new("b", vec![]);
        let router = router(RouterConfig::default(), &[a.clone(), b.clone()]);

        let report = router.send(&message(), None).await;
        assert!(!report.is_success());
        assert!(!report.fell_back);
        assert!(!report.is_retryable());
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn test_fallback_disabled() {
        let a = Scripted::new("a", vec![timeout()]);
        let b = Scripted::new("b", vec![]);
        let router = router(
            RouterConfig {
                enable_fallback: false,
                ..RouterConfig::default()
            },
            &[a.clone(), b.clone()],
        );

        let report = router.send(&message(), None).await;
        assert!(report.is_retryable());
        assert_eq!(report.channel.as_deref(), Some("a"));
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_explicit_channel_falls_back() {
        let a = Scripted::invalid("a");
        let b = Scripted::new("b", vec![]);
        let router = router(RouterConfig::default(), &[a.clone(), b.clone()]);

        let report = router.send(&message(), Some("a")).await;
        assert!(report.is_success());
        assert!(report.fell_back);
        assert_eq!(report.channel.as_deref(), Some("b"));
        assert_eq!(a.calls(), 0);
    }

    #[tokio::test]
    async fn test_uncategorised_error_is_classified_from_text() {
        let a = Scripted::new(
            "a",
            vec![Err(ChannelError::uncategorised("429: Rate limit exceeded"))],
        );
        let router = router(RouterConfig::default(), &[a.clone()]);

        let report = router.send(&message(), None).await;
        assert!(matches!(
            report.error,
            Some(DeliveryError::Temporary(TemporaryError::RateLimited(_)))
        ));

        let status = router.rate_limit_status("a").unwrap();
        assert_eq!(status.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_panicking_channel_is_contained() {
        let router = router(RouterConfig::default(), &[Arc::new(Panics)]);

        let report = router.send(&message(), None).await;
        let error = report.error.expect("panic should surface as an error");
        assert!(error.is_system());
        assert!(error.to_string().contains("provider client exploded"));
    }

    #[tokio::test]
    async fn test_rate_limit_denial_skips_channel() {
        let a = Scripted::new("a", vec![]);
        let router = Router::default();
        router
            .add_channel(
                a.clone(),
                RateLimitConfig {
                    max_requests_per_second: 1,
                    max_wait_ms: 0,
                    ..RateLimitConfig::default()
                },
            )
            .unwrap();

        assert!(router.send(&message(), None).await.is_success());

        let report = router.send(&message(), None).await;
        assert!(matches!(
            report.error,
            Some(DeliveryError::Temporary(TemporaryError::RateLimited(_)))
        ));
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test]
    async fn test_send_batch() {
        let a = Scripted::new("a", vec![Ok(SendReceipt::default()), timeout()]);
        let router = router(
            RouterConfig {
                enable_fallback: false,
                ..RouterConfig::default()
            },
            &[a.clone()],
        );

        let reports = router
            .send_batch(&[message(), message(), message()], None)
            .await;
        let outcomes: Vec<_> = reports.iter().map(DeliveryReport::is_success).collect();
        assert_eq!(outcomes, [true, false, true]);
    }

    #[tokio::test]
    async fn test_registry_management() {
        let a = Scripted::new("a", vec![]);
        let router = router(RouterConfig::default(), &[a.clone()]);

        assert!(matches!(
            router.add_channel(a.clone(), RateLimitConfig::default()),
            Err(PermanentError::Configuration(_))
        ));

        assert!(router.is_channel_available("a"));
        assert!(router.test_connection("a").await);
        assert!(!router.test_connection("b").await);

        router.set_default_channel(Some("a".to_string()));
        assert_eq!(router.default_channel().as_deref(), Some("a"));

        assert!(router.remove_channel("a"));
        assert!(!router.remove_channel("a"));
        assert!(!router.is_channel_available("a"));
    }

    #[tokio::test]
    async fn test_round_robin_selection() {
        let a = Scripted::new("a", vec![]);
        let b = Scripted::new("b", vec![]);
        let router = Router::default().with_selection(RoundRobin::default());
        router.add_channel(a.clone(), RateLimitConfig::default()).unwrap();
        router.add_channel(b.clone(), RateLimitConfig::default()).unwrap();

        for _ in 0..4 {
            router.send_auto(&message()).await;
        }
        assert_eq!((a.calls(), b.calls()), (2, 2));
    }
}
