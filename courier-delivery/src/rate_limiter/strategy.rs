//! Admission state for each rate limiting strategy
//!
//! Every method takes the current instant so the arithmetic can be exercised
//! without sleeping. A limit of zero on any window disables that window.

use std::{collections::VecDeque, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::RateLimitConfig;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStrategy {
    /// Counters that reset at the end of each window
    #[default]
    FixedWindow,
    /// Timestamps of recent requests counted over trailing windows
    SlidingWindow,
    /// Tokens refilled continuously, one consumed per request
    TokenBucket,
    /// A virtual queue that drains at a constant rate
    LeakyBucket,
}

/// Point-in-time usage, shaped by the strategy in use
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Usage {
    /// Requests counted in the current (or trailing) window, minute and hour
    Windows { window: u32, minute: u32, hour: u32 },
    /// Fill level of a bucket; tokens left for a token bucket, queued
    /// requests for a leaky bucket
    Bucket { level: f64, capacity: f64 },
}

#[derive(Debug)]
pub(super) enum State {
    FixedWindow(FixedWindow),
    SlidingWindow(SlidingWindow),
    TokenBucket(Bucket),
    LeakyBucket(Bucket),
}

impl State {
    pub(super) fn new(config: &RateLimitConfig, now: Instant) -> Self {
        match config.strategy {
            RateLimitStrategy::FixedWindow => Self::FixedWindow(FixedWindow::new(now)),
            RateLimitStrategy::SlidingWindow => Self::SlidingWindow(SlidingWindow::default()),
            RateLimitStrategy::TokenBucket => Self::TokenBucket(Bucket {
                // Start with a full bucket
                level: f64::from(config.burst_limit),
                last_update: now,
            }),
            RateLimitStrategy::LeakyBucket => Self::LeakyBucket(Bucket {
                level: 0.0,
                last_update: now,
            }),
        }
    }

    /// Whether a request starting at `now` would be admitted
    pub(super) fn allows(&mut self, config: &RateLimitConfig, now: Instant) -> bool {
        match self {
            Self::FixedWindow(window) => window.allows(config, now),
            Self::SlidingWindow(window) => window.allows(config, now),
            Self::TokenBucket(bucket) => {
                bucket.refill(config, now);
                bucket.level >= 1.0
            }
            Self::LeakyBucket(bucket) => {
                bucket.leak(config, now);
                bucket.level + 1.0 <= f64::from(config.burst_limit)
            }
        }
    }

    pub(super) fn record(&mut self, config: &RateLimitConfig, now: Instant) {
        match self {
            Self::FixedWindow(window) => window.record(config, now),
            Self::SlidingWindow(window) => window.record(now),
            Self::TokenBucket(bucket) => {
                bucket.refill(config, now);
                bucket.level = (bucket.level - 1.0).max(0.0);
            }
            Self::LeakyBucket(bucket) => {
                bucket.leak(config, now);
                bucket.level += 1.0;
            }
        }
    }

    /// How long until a request would be admitted, if that can be known
    pub(super) fn time_until_available(
        &mut self,
        config: &RateLimitConfig,
        now: Instant,
    ) -> Option<Duration> {
        if self.allows(config, now) {
            return Some(Duration::ZERO);
        }

        let rate = f64::from(config.max_requests_per_second);
        match self {
            Self::FixedWindow(window) => window.time_until_available(config, now),
            Self::SlidingWindow(window) => window.time_until_available(config, now),
            Self::TokenBucket(bucket) if rate > 0.0 => {
                Some(Duration::from_secs_f64((1.0 - bucket.level) / rate))
            }
            Self::LeakyBucket(bucket) if rate > 0.0 => Some(Duration::from_secs_f64(
                (bucket.level + 1.0 - f64::from(config.burst_limit)) / rate,
            )),
            Self::TokenBucket(_) | Self::LeakyBucket(_) => None,
        }
    }

    pub(super) fn usage(&mut self, config: &RateLimitConfig, now: Instant) -> Usage {
        let capacity = f64::from(config.burst_limit);
        match self {
            Self::FixedWindow(window) => {
                window.roll(config, now);
                Usage::Windows {
                    window: window.window.count,
                    minute: window.minute.count,
                    hour: window.hour.count,
                }
            }
            Self::SlidingWindow(window) => {
                window.prune(config, now);
                Usage::Windows {
                    window: window.count_within(config.window_size(), now),
                    minute: window.count_within(MINUTE, now),
                    hour: window.count_within(HOUR, now),
                }
            }
            Self::TokenBucket(bucket) => {
                bucket.refill(config, now);
                Usage::Bucket {
                    level: bucket.level,
                    capacity,
                }
            }
            Self::LeakyBucket(bucket) => {
                bucket.leak(config, now);
                Usage::Bucket {
                    level: bucket.level,
                    capacity,
                }
            }
        }
    }
}

const fn under(count: u32, limit: u32) -> bool {
    limit == 0 || count < limit
}

#[derive(Debug)]
struct Counter {
    count: u32,
    started: Instant,
}

impl Counter {
    const fn new(now: Instant) -> Self {
        Self {
            count: 0,
            started: now,
        }
    }

    fn roll(&mut self, length: Duration, now: Instant) {
        if now.saturating_duration_since(self.started) >= length {
            self.count = 0;
            self.started = now;
        }
    }

    fn remaining(&self, length: Duration, now: Instant) -> Duration {
        (self.started + length).saturating_duration_since(now)
    }
}

#[derive(Debug)]
pub(super) struct FixedWindow {
    window: Counter,
    minute: Counter,
    hour: Counter,
}

impl FixedWindow {
    const fn new(now: Instant) -> Self {
        Self {
            window: Counter::new(now),
            minute: Counter::new(now),
            hour: Counter::new(now),
        }
    }

    fn roll(&mut self, config: &RateLimitConfig, now: Instant) {
        self.window.roll(config.window_size(), now);
        self.minute.roll(MINUTE, now);
        self.hour.roll(HOUR, now);
    }

    fn allows(&mut self, config: &RateLimitConfig, now: Instant) -> bool {
        self.roll(config, now);
        under(self.window.count, config.max_requests_per_second)
            && under(self.minute.count, config.max_requests_per_minute)
            && under(self.hour.count, config.max_requests_per_hour)
    }

    fn record(&mut self, config: &RateLimitConfig, now: Instant) {
        self.roll(config, now);
        self.window.count = self.window.count.saturating_add(1);
        self.minute.count = self.minute.count.saturating_add(1);
        self.hour.count = self.hour.count.saturating_add(1);
    }

    /// The latest reset among the windows that are currently full
    fn time_until_available(&self, config: &RateLimitConfig, now: Instant) -> Option<Duration> {
        [
            (&self.window, config.window_size(), config.max_requests_per_second),
            (&self.minute, MINUTE, config.max_requests_per_minute),
            (&self.hour, HOUR, config.max_requests_per_hour),
        ]
        .into_iter()
        .filter(|(counter, _, limit)| !under(counter.count, *limit))
        .map(|(counter, length, _)| counter.remaining(length, now))
        .max()
    }
}

#[derive(Debug, Default)]
pub(super) struct SlidingWindow {
    /// Admission times, oldest first
    hits: VecDeque<Instant>,
}

impl SlidingWindow {
    /// History only needs to cover the longest window that has a limit
    fn horizon(config: &RateLimitConfig) -> Duration {
        Self::windows(config)
            .into_iter()
            .filter(|(_, limit)| *limit > 0)
            .map(|(length, _)| length)
            .max()
            .unwrap_or_default()
    }

    fn prune(&mut self, config: &RateLimitConfig, now: Instant) {
        let horizon = Self::horizon(config);
        while self
            .hits
            .front()
            .is_some_and(|hit| now.saturating_duration_since(*hit) >= horizon)
        {
            self.hits.pop_front();
        }
    }

    fn count_within(&self, length: Duration, now: Instant) -> u32 {
        let count = self
            .hits
            .iter()
            .rev()
            .take_while(|hit| now.saturating_duration_since(**hit) < length)
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    fn windows(config: &RateLimitConfig) -> [(Duration, u32); 3] {
        [
            (config.window_size(), config.max_requests_per_second),
            (MINUTE, config.max_requests_per_minute),
            (HOUR, config.max_requests_per_hour),
        ]
    }

    fn allows(&mut self, config: &RateLimitConfig, now: Instant) -> bool {
        self.prune(config, now);
        Self::windows(config)
            .into_iter()
            .all(|(length, limit)| under(self.count_within(length, now), limit))
    }

    fn record(&mut self, now: Instant) {
        self.hits.push_back(now);
    }

    /// For each full window, the moment its oldest counted hit slides out
    fn time_until_available(&self, config: &RateLimitConfig, now: Instant) -> Option<Duration> {
        Self::windows(config)
            .into_iter()
            .filter(|(length, limit)| !under(self.count_within(*length, now), *limit))
            .filter_map(|(length, limit)| {
                let index = self.hits.len().checked_sub(usize::try_from(limit).ok()?)?;
                let hit = self.hits.get(index)?;
                Some((*hit + length).saturating_duration_since(now))
            })
            .max()
    }
}

#[derive(Debug)]
pub(super) struct Bucket {
    level: f64,
    last_update: Instant,
}

impl Bucket {
    fn elapsed(&mut self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.last_update = self.last_update.max(now);
        elapsed
    }

    /// Add the tokens earned since the last update
    fn refill(&mut self, config: &RateLimitConfig, now: Instant) {
        let earned = self.elapsed(now) * f64::from(config.max_requests_per_second);
        self.level = (self.level + earned).min(f64::from(config.burst_limit));
    }

    /// Drain the requests that leaked out since the last update
    fn leak(&mut self, config: &RateLimitConfig, now: Instant) {
        let drained = self.elapsed(now) * f64::from(config.max_requests_per_second);
        self.level = (self.level - drained).max(0.0);
    }
}
