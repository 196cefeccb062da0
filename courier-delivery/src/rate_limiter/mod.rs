//! Per-channel rate limiting
//!
//! Each channel owns one [`RateLimiter`]. Admission is decided by one of four
//! strategies (see [`RateLimitStrategy`]) and every decision happens under a
//! single mutex, so a check and the request it admits are recorded together.
//!
//! # Waiting
//!
//! [`RateLimiter::wait_if_limited`] retries admission with exponential backoff:
//!
//! ```text
//! sleep = min(backoff_base * 2^(failures - 1), max_backoff)
//! ```
//!
//! further capped by the strategy's own estimate of when room frees up and by
//! whatever is left of `max_wait`.

mod strategy;

use std::{collections::BTreeMap, time::Duration};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::Span;

use self::strategy::State;
pub use self::strategy::{RateLimitStrategy, Usage};
use crate::{channel::Provider, queue::retry::backoff_delay};

/// Configuration for a single channel's rate limiter
///
/// The window strategies check every non-zero per-second, per-minute and
/// per-hour limit. The bucket strategies use `max_requests_per_second` as their
/// rate and `burst_limit` as their capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub strategy: RateLimitStrategy,

    /// Requests per `window_size` (per second with the default window)
    #[serde(default = "default_per_second")]
    pub max_requests_per_second: u32,

    #[serde(default = "default_per_minute")]
    pub max_requests_per_minute: u32,

    #[serde(default = "default_per_hour")]
    pub max_requests_per_hour: u32,

    /// Bucket capacity
    #[serde(default = "default_burst_limit")]
    pub burst_limit: u32,

    #[serde(default = "default_window_size")]
    pub window_size_ms: u64,

    /// First sleep after a denial
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Longest single sleep
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Total time `wait_if_limited` may spend before giving up
    #[serde(default = "default_max_wait")]
    pub max_wait_ms: u64,
}

const fn default_per_second() -> u32 {
    10
}

const fn default_per_minute() -> u32 {
    600
}

const fn default_per_hour() -> u32 {
    36_000
}

const fn default_burst_limit() -> u32 {
    100
}

const fn default_window_size() -> u64 {
    1000
}

const fn default_backoff_base() -> u64 {
    100
}

const fn default_max_backoff() -> u64 {
    5000
}

const fn default_max_wait() -> u64 {
    30_000
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            strategy: RateLimitStrategy::default(),
            max_requests_per_second: default_per_second(),
            max_requests_per_minute: default_per_minute(),
            max_requests_per_hour: default_per_hour(),
            burst_limit: default_burst_limit(),
            window_size_ms: default_window_size(),
            backoff_base_ms: default_backoff_base(),
            max_backoff_ms: default_max_backoff(),
            max_wait_ms: default_max_wait(),
        }
    }
}

impl RateLimitConfig {
    fn limits(
        strategy: RateLimitStrategy,
        per_second: u32,
        per_minute: u32,
        per_hour: u32,
        burst: u32,
    ) -> Self {
        Self {
            strategy,
            max_requests_per_second: per_second,
            max_requests_per_minute: per_minute,
            max_requests_per_hour: per_hour,
            burst_limit: burst,
            ..Self::default()
        }
    }

    /// Conservative defaults for a provider
    ///
    /// API providers get bucket strategies sized around their published sending
    /// rates; SMTP and the mailbox providers get tight window limits.
    #[must_use]
    pub fn for_provider(provider: Provider) -> Self {
        use RateLimitStrategy::{FixedWindow, LeakyBucket, SlidingWindow, TokenBucket};

        match provider {
            Provider::Smtp => Self::limits(FixedWindow, 5, 300, 10_000, 5),
            Provider::SendGrid | Provider::SparkPost => {
                Self::limits(TokenBucket, 100, 6000, 360_000, 200)
            }
            Provider::Mailgun => Self::limits(TokenBucket, 50, 3000, 180_000, 100),
            Provider::AmazonSes => Self::limits(TokenBucket, 14, 840, 50_400, 14),
            Provider::Postmark => Self::limits(SlidingWindow, 50, 3000, 180_000, 50),
            Provider::Mailjet => Self::limits(LeakyBucket, 30, 1800, 108_000, 60),
            Provider::ProtonMail | Provider::ZohoMail | Provider::Fastmail => {
                Self::limits(SlidingWindow, 2, 60, 500, 2)
            }
            Provider::Custom => Self::default(),
        }
    }

    #[must_use]
    pub const fn window_size(&self) -> Duration {
        Duration::from_millis(self.window_size_ms)
    }

    #[must_use]
    pub const fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    #[must_use]
    pub const fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    #[must_use]
    pub const fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// Snapshot of a limiter's counters
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitStatus {
    pub strategy: RateLimitStrategy,
    pub usage: Usage,
    /// Requests recorded since creation or the last reset
    pub total_requests: u64,
    pub consecutive_failures: u32,
    pub last_failure: Option<Instant>,
}

impl RateLimitStatus {
    /// Flatten into named counters
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "Bucket levels are clamped to [0, capacity]"
    )]
    #[must_use]
    pub fn as_counters(&self) -> BTreeMap<String, u64> {
        let mut counters = BTreeMap::new();
        counters.insert("total_requests".to_string(), self.total_requests);
        counters.insert(
            "consecutive_failures".to_string(),
            u64::from(self.consecutive_failures),
        );

        match self.usage {
            Usage::Windows {
                window,
                minute,
                hour,
            } => {
                counters.insert("requests_this_window".to_string(), u64::from(window));
                counters.insert("requests_this_minute".to_string(), u64::from(minute));
                counters.insert("requests_this_hour".to_string(), u64::from(hour));
            }
            Usage::Bucket { level, capacity } => {
                counters.insert("bucket_level".to_string(), level.floor() as u64);
                counters.insert("bucket_capacity".to_string(), capacity as u64);
            }
        }

        counters
    }
}

#[derive(Debug)]
struct Inner {
    config: RateLimitConfig,
    state: State,
    total_requests: u64,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    /// Set by [`RateLimiter::record_failure`], no admission before this
    cooldown_until: Option<Instant>,
}

impl Inner {
    fn new(config: RateLimitConfig, now: Instant) -> Self {
        Self {
            state: State::new(&config, now),
            config,
            total_requests: 0,
            consecutive_failures: 0,
            last_failure: None,
            cooldown_until: None,
        }
    }

    fn record(&mut self, now: Instant) {
        self.state.record(&self.config, now);
        self.total_requests = self.total_requests.saturating_add(1);
    }

    fn admit(&mut self, now: Instant) -> bool {
        if self.state.allows(&self.config, now) {
            self.record(now);
            self.consecutive_failures = 0;
            true
        } else {
            false
        }
    }

    fn backoff(&self) -> Duration {
        backoff_delay(
            self.consecutive_failures,
            self.config.backoff_base(),
            self.config.max_backoff(),
        )
    }

    /// Remaining provider imposed cooldown, clearing it once it has passed
    fn cooldown(&mut self, now: Instant) -> Option<Duration> {
        match self.cooldown_until {
            Some(until) if until > now => Some(until - now),
            Some(_) => {
                self.cooldown_until = None;
                None
            }
            None => None,
        }
    }
}

enum Decision {
    Admitted,
    Wait(Duration),
}

/// Rate limiter for a single channel
#[derive(Debug)]
pub struct RateLimiter {
    inner: Mutex<Inner>,
    span: Span,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::new(config, Instant::now())),
            span: Span::none(),
        }
    }

    /// Emit this limiter's events under `span`
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> RateLimitConfig {
        self.inner.lock().config.clone()
    }

    /// Would a request be admitted right now? Records nothing.
    pub fn would_allow(&self) -> bool {
        self.would_allow_at(Instant::now())
    }

    pub fn would_allow_at(&self, now: Instant) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.state.allows(&inner.config, now)
    }

    /// Admit a request if the limits allow it, recording it when they do
    ///
    /// The check and the record happen under one lock, so concurrent callers
    /// can never overshoot a limit. Do not follow a successful call with
    /// [`record_request`](Self::record_request): the request is already
    /// counted. Use [`would_allow`](Self::would_allow) to look without
    /// recording.
    pub fn is_allowed(&self) -> bool {
        self.is_allowed_at(Instant::now())
    }

    pub fn is_allowed_at(&self, now: Instant) -> bool {
        self.inner.lock().admit(now)
    }

    /// Record a request that was made without going through admission
    ///
    /// Only for requests that skipped [`is_allowed`](Self::is_allowed) and
    /// [`wait_if_limited`](Self::wait_if_limited), which record on their own.
    pub fn record_request(&self) {
        self.record_request_at(Instant::now());
    }

    pub fn record_request_at(&self, now: Instant) {
        self.inner.lock().record(now);
    }

    /// Estimated time until a request would be admitted
    ///
    /// `None` when the limiter cannot tell, e.g. a bucket with a zero rate.
    pub fn time_until_available(&self) -> Option<Duration> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.state.time_until_available(&inner.config, Instant::now())
    }

    /// Wait until a request is admitted, backing off between attempts
    ///
    /// Returns `true` once admitted (the request is recorded), or `false` if
    /// `max_wait` elapsed first.
    pub async fn wait_if_limited(&self) -> bool {
        let started = Instant::now();
        let max_wait = self.inner.lock().config.max_wait();
        let deadline = started + max_wait;

        loop {
            let now = Instant::now();
            let decision = {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                if let Some(cooldown) = inner.cooldown(now) {
                    Decision::Wait(cooldown)
                } else if inner.admit(now) {
                    Decision::Admitted
                } else {
                    inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
                    inner.last_failure = Some(now);

                    let backoff = inner.backoff();
                    let hint = inner.state.time_until_available(&inner.config, now);
                    Decision::Wait(hint.map_or(backoff, |hint| hint.min(backoff)))
                }
            };

            let delay = match decision {
                Decision::Admitted => {
                    if now > started {
                        tracing::debug!(
                            parent: &self.span,
                            waited = ?(now - started),
                            "Rate limit cleared"
                        );
                    }
                    return true;
                }
                Decision::Wait(delay) => delay,
            };

            let remaining = deadline.saturating_duration_since(now);
            if remaining.is_zero() {
                tracing::warn!(
                    parent: &self.span,
                    ?max_wait,
                    "Gave up waiting for rate limit"
                );
                return false;
            }

            let delay = delay.max(Duration::from_millis(1)).min(remaining);
            tracing::trace!(
                parent: &self.span,
                ?delay,
                "Rate limited, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Note a throttling failure reported by the provider
    ///
    /// Admission is held back for the current backoff delay.
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(now);
        inner.cooldown_until = Some(now + inner.backoff());
        let failures = inner.consecutive_failures;
        drop(inner);

        tracing::debug!(parent: &self.span, failures, "Provider throttled request");
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.cooldown_until = None;
    }

    pub fn status(&self) -> RateLimitStatus {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        RateLimitStatus {
            strategy: inner.config.strategy,
            usage: inner.state.usage(&inner.config, now),
            total_requests: inner.total_requests,
            consecutive_failures: inner.consecutive_failures,
            last_failure: inner.last_failure,
        }
    }

    /// Clear all counters and backoff state
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let config = inner.config.clone();
        *inner = Inner::new(config, Instant::now());
    }

    /// Swap in a new configuration, starting from clean state
    pub fn update_config(&self, config: RateLimitConfig) {
        tracing::debug!(
            parent: &self.span,
            strategy = ?config.strategy,
            per_second = config.max_requests_per_second,
            "Rate limit configuration updated"
        );
        *self.inner.lock() = Inner::new(config, Instant::now());
    }
}
