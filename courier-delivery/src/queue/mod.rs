//! Delivery queue management
//!
//! Messages wait here until they are due, highest priority first and in
//! submission order within a priority. A pool of worker tasks takes ready
//! entries and hands them to a [`Dispatcher`]; temporary failures come back as
//! RETRY entries that wait out an exponential backoff before they are eligible
//! again.

pub mod retry;
mod store;
mod worker;

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use courier_common::{DeliveryStatus, Message, MessageId, Priority};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{sync::Notify, task::JoinHandle, time::Instant};
use tracing::{Instrument, Span};

use self::store::{Store, advance};
use crate::{error::SystemError, policy::RetryPolicy, types::DeliveryReport};

/// Sends a queued message on its way
///
/// The router implements this; the queue only cares about the report.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, entry: &QueueEntry) -> DeliveryReport;
}

const fn default_max_queue_size() -> usize {
    10_000
}

const fn default_workers() -> usize {
    4
}

const fn default_batch_size() -> usize {
    10
}

const fn default_max_failed_retained() -> usize {
    100
}

const fn default_idle_wait() -> u64 {
    1000
}

const fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Live entries allowed before `enqueue` is refused
    ///
    /// Default: 10000
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Number of worker tasks
    ///
    /// Default: 4
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Entries a worker takes before yielding
    ///
    /// Default: 10
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Order by priority before submission order. When disabled the queue is
    /// strictly FIFO.
    ///
    /// Default: `true`
    #[serde(default = "default_enabled")]
    pub enable_priority_queuing: bool,

    /// Honour [`EnqueueOptions::delay`]. When disabled delayed messages are
    /// queued as if they were due immediately.
    ///
    /// Default: `true`
    #[serde(default = "default_enabled")]
    pub enable_scheduled_sending: bool,

    /// Failed entries kept for inspection, oldest evicted first
    ///
    /// Default: 100
    #[serde(default = "default_max_failed_retained")]
    pub max_failed_retained: usize,

    /// Longest an idle worker sleeps before looking again (in milliseconds)
    ///
    /// Default: 1000
    #[serde(default = "default_idle_wait")]
    pub idle_wait_ms: u64,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            workers: default_workers(),
            batch_size: default_batch_size(),
            enable_priority_queuing: default_enabled(),
            enable_scheduled_sending: default_enabled(),
            max_failed_retained: default_max_failed_retained(),
            idle_wait_ms: default_idle_wait(),
            retry: RetryPolicy::default(),
        }
    }
}

impl QueueConfig {
    #[must_use]
    pub const fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }
}

/// A message together with its delivery state
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub message: Arc<Message>,
    pub priority: Priority,
    pub status: DeliveryStatus,
    pub created_at: SystemTime,
    /// Not dispatched before this instant; never moves backwards
    pub scheduled_for: Instant,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub last_attempt: Option<SystemTime>,
    /// Channel the caller asked for, if any
    pub channel: Option<String>,
    /// Channel used by the latest attempt
    pub last_channel: Option<String>,
    sequence: u64,
    generation: u64,
}

impl QueueEntry {
    #[must_use]
    pub fn id(&self) -> MessageId {
        self.message.id
    }

    /// Whether the retry budget allows another attempt
    #[must_use]
    pub const fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    #[must_use]
    pub const fn remaining_retries(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }
}

/// Per-message options for [`DeliveryQueue::enqueue_with`]
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Priority,
    /// Send through this channel rather than letting the router choose
    pub channel: Option<String>,
    /// Overrides the configured retry budget
    pub max_retries: Option<u32>,
    /// Hold the message back for this long
    pub delay: Option<Duration>,
}

impl EnqueueOptions {
    #[must_use]
    pub fn priority(priority: Priority) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Hold the message back until `at`; times in the past mean now
    #[must_use]
    pub fn scheduled_at(self, at: SystemTime) -> Self {
        let delay = at.duration_since(SystemTime::now()).unwrap_or_default();
        self.with_delay(delay)
    }
}

/// Queue counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub total_enqueued: u64,
    /// Messages sent successfully
    pub processed: u64,
    pub failed: u64,
    /// Retries scheduled
    pub retried: u64,
    pub cancelled: u64,
    pub current_size: usize,
    pub active_workers: usize,
    pub last_activity: Option<SystemTime>,
}

impl QueueStats {
    #[must_use]
    pub fn as_counters(&self) -> BTreeMap<String, u64> {
        [
            ("total_enqueued", self.total_enqueued),
            ("processed", self.processed),
            ("failed", self.failed),
            ("retried", self.retried),
            ("cancelled", self.cancelled),
            ("current_size", self.current_size as u64),
            ("active_workers", self.active_workers as u64),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
    }
}

struct Shared {
    config: QueueConfig,
    store: Mutex<Store>,
    notify: Notify,
    running: AtomicBool,
    dispatcher: Mutex<Option<Arc<dyn Dispatcher>>>,
    span: Span,
}

impl Shared {
    fn take(&self) -> Option<QueueEntry> {
        self.store
            .lock()
            .take(Instant::now(), self.config.enable_priority_queuing)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Apply the outcome of an attempt to the entry that was dispatched
    fn complete(&self, id: MessageId, report: DeliveryReport) {
        let now = Instant::now();
        let mut guard = self.store.lock();
        let store = &mut *guard;
        store.stats.last_activity = Some(SystemTime::now());

        let Some(entry) = store.entries.get_mut(&id) else {
            tracing::warn!(parent: &self.span, %id, "Completed message is no longer queued");
            return;
        };

        if entry.status != DeliveryStatus::Processing {
            tracing::warn!(parent: &self.span, %id, status = %entry.status, "Completed message was not being processed");
            return;
        }

        if report.channel.is_some() {
            entry.last_channel.clone_from(&report.channel);
        }

        match report.error {
            None => {
                advance(entry, DeliveryStatus::Sent);
                store.entries.remove(&id);
                store.stats.processed += 1;
                drop(guard);

                tracing::debug!(
                    parent: &self.span,
                    %id,
                    channel = report.channel.as_deref().unwrap_or_default(),
                    "Message sent"
                );
            }
            Some(error) if error.is_temporary() && entry.can_retry() => {
                entry.retry_count += 1;
                entry.last_error = Some(error.to_string());

                let delay = self.config.retry.retry_delay(entry.retry_count);
                entry.scheduled_for = entry.scheduled_for.max(now + delay);
                advance(entry, DeliveryStatus::Retry);

                let retry_count = entry.retry_count;
                store.push_delayed(id);
                store.stats.retried += 1;
                drop(guard);

                tracing::info!(
                    parent: &self.span,
                    %id,
                    retry_count,
                    ?delay,
                    %error,
                    "Delivery failed, retry scheduled"
                );
                self.notify.notify_one();
            }
            Some(error) => {
                entry.last_error = Some(error.to_string());
                advance(entry, DeliveryStatus::Failed);

                let retry_count = entry.retry_count;
                if let Some(failed) = store.entries.remove(&id) {
                    store.retain_failed(failed, self.config.max_failed_retained);
                }
                store.stats.failed += 1;
                drop(guard);

                tracing::warn!(
                    parent: &self.span,
                    %id,
                    retry_count,
                    %error,
                    "Delivery failed permanently"
                );
            }
        }
    }
}

/// Priority and retry aware in-memory queue with its own worker pool
pub struct DeliveryQueue {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for DeliveryQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl DeliveryQueue {
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                store: Mutex::new(Store::default()),
                notify: Notify::new(),
                running: AtomicBool::new(false),
                dispatcher: Mutex::new(None),
                span: Span::none(),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Emit queue and worker events under `span`
    ///
    /// Only takes effect before [`start`](Self::start).
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => shared.span = span,
            None => tracing::warn!("Queue span can only be set before the queue is started"),
        }
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    pub fn set_dispatcher(&self, dispatcher: Arc<dyn Dispatcher>) {
        *self.shared.dispatcher.lock() = Some(dispatcher);
    }

    /// Queue `message` with default options
    ///
    /// # Errors
    ///
    /// See [`enqueue_with`](Self::enqueue_with).
    pub fn enqueue(&self, message: Message, priority: Priority) -> Result<MessageId, SystemError> {
        self.enqueue_with(message, EnqueueOptions::priority(priority))
    }

    /// Queue `message`
    ///
    /// # Errors
    ///
    /// [`SystemError::QueueFull`] when `max_queue_size` entries are live, and
    /// [`SystemError::AlreadyQueued`] when a message with the same id is.
    pub fn enqueue_with(
        &self,
        message: Message,
        options: EnqueueOptions,
    ) -> Result<MessageId, SystemError> {
        let config = &self.shared.config;
        let id = message.id;
        let recipients = message.recipients.len();
        let delay = match options.delay {
            Some(delay) if !config.enable_scheduled_sending => {
                tracing::debug!(parent: &self.shared.span, %id, ?delay, "Scheduled sending disabled, queueing immediately");
                None
            }
            delay => delay.filter(|delay| !delay.is_zero()),
        };

        let mut store = self.shared.store.lock();
        if store.entries.len() >= config.max_queue_size {
            drop(store);
            tracing::warn!(parent: &self.shared.span, %id, max = config.max_queue_size, "Queue full, message refused");
            return Err(SystemError::QueueFull(config.max_queue_size));
        }

        if store.entries.contains_key(&id) {
            return Err(SystemError::AlreadyQueued(id.to_string()));
        }

        let sequence = store.next_sequence();
        let entry = QueueEntry {
            priority: options.priority,
            status: DeliveryStatus::Pending,
            created_at: message.created_at,
            scheduled_for: Instant::now() + delay.unwrap_or_default(),
            retry_count: 0,
            max_retries: options.max_retries.unwrap_or(config.retry.max_retries),
            last_error: None,
            last_attempt: None,
            channel: options.channel,
            last_channel: None,
            sequence,
            generation: 0,
            message: Arc::new(message),
        };
        let sender = entry.message.sender.clone();
        store.entries.insert(id, entry);

        if delay.is_some() {
            store.push_delayed(id);
        } else {
            store.push_ready(id, config.enable_priority_queuing);
        }

        store.stats.total_enqueued += 1;
        store.stats.last_activity = Some(SystemTime::now());
        drop(store);

        self.shared.notify.notify_one();
        tracing::debug!(
            parent: &self.shared.span,
            %id,
            %sender,
            recipients,
            priority = %options.priority,
            ?delay,
            "Message queued"
        );

        Ok(id)
    }

    /// Take the next ready entry, marking it as processing
    ///
    /// Workers call this themselves; it is public for callers that drive the
    /// queue by hand, who must hand the outcome back through
    /// [`complete`](Self::complete).
    pub fn dequeue(&self) -> Option<QueueEntry> {
        self.shared.take()
    }

    /// Record the outcome of an attempt on a dequeued entry
    pub fn complete(&self, id: MessageId, report: DeliveryReport) {
        self.shared.complete(id, report);
    }

    /// Cancel a message that is waiting to be sent
    ///
    /// Returns `false` if the message is unknown or already being processed.
    pub fn cancel(&self, id: MessageId) -> bool {
        let mut store = self.shared.store.lock();
        let Some(entry) = store.entries.get_mut(&id) else {
            return false;
        };

        if !entry.status.is_cancellable() || !advance(entry, DeliveryStatus::Cancelled) {
            return false;
        }

        store.entries.remove(&id);
        store.stats.cancelled += 1;
        drop(store);

        tracing::debug!(parent: &self.shared.span, %id, "Message cancelled");
        true
    }

    /// Look up a live or retained failed entry
    pub fn get(&self, id: MessageId) -> Option<QueueEntry> {
        let store = self.shared.store.lock();
        store
            .entries
            .get(&id)
            .or_else(|| store.failed.iter().find(|entry| entry.id() == id))
            .cloned()
    }

    /// Entries waiting to be sent (PENDING or RETRY), in dispatch order
    pub fn pending_messages(&self) -> Vec<QueueEntry> {
        let prioritise = self.shared.config.enable_priority_queuing;
        let mut pending: Vec<_> = self
            .shared
            .store
            .lock()
            .entries
            .values()
            .filter(|entry| entry.status.is_cancellable())
            .cloned()
            .collect();

        pending.sort_by(|a, b| {
            let priority = if prioritise {
                b.priority.cmp(&a.priority)
            } else {
                core::cmp::Ordering::Equal
            };
            priority.then(a.sequence.cmp(&b.sequence))
        });
        pending
    }

    /// Retained failed entries, oldest first
    pub fn failed_messages(&self) -> Vec<QueueEntry> {
        self.shared.store.lock().failed.iter().cloned().collect()
    }

    /// Remove and return every entry that is not in flight
    pub fn drain(&self) -> Vec<QueueEntry> {
        let drained = self.shared.store.lock().drain_waiting();
        tracing::debug!(parent: &self.shared.span, count = drained.len(), "Queue drained");
        drained
    }

    pub fn stats(&self) -> QueueStats {
        let store = self.shared.store.lock();
        QueueStats {
            current_size: store.entries.len(),
            ..store.stats.clone()
        }
    }

    /// Live entries, including those being processed
    pub fn len(&self) -> usize {
        self.shared.store.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.store.lock().entries.is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Spawn the worker pool on the current Tokio runtime
    ///
    /// Starting an already running queue does nothing.
    ///
    /// # Errors
    ///
    /// [`SystemError::NoDispatcher`] if no dispatcher has been set, or
    /// [`SystemError::Internal`] when called outside a Tokio runtime.
    pub fn start(&self) -> Result<(), SystemError> {
        if self.shared.dispatcher.lock().is_none() {
            return Err(SystemError::NoDispatcher);
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| SystemError::Internal(err.to_string()))?;

        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let count = self.shared.config.workers.max(1);
        let mut workers = self.workers.lock();
        for index in 0..count {
            let span = tracing::debug_span!(parent: &self.shared.span, "worker", index);
            let shared = Arc::clone(&self.shared);
            workers.push(runtime.spawn(shared.run(index).instrument(span)));
        }
        drop(workers);

        tracing::info!(parent: &self.shared.span, workers = count, "Delivery queue started");
        Ok(())
    }

    /// Stop the workers, waiting for in-flight attempts to finish
    ///
    /// Waiting entries stay queued for a later [`start`](Self::start).
    pub async fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.notify.notify_waiters();

        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }

        for worker in workers {
            if let Err(err) = worker.await {
                tracing::error!(parent: &self.shared.span, %err, "Queue worker did not shut down cleanly");
            }
        }

        tracing::info!(parent: &self.shared.span, pending = self.len(), "Delivery queue stopped");
    }
}

impl Drop for DeliveryQueue {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.notify.notify_waiters();
    }
}

impl core::fmt::Debug for DeliveryQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeliveryQueue")
            .field("config", &self.shared.config)
            .field("running", &self.is_running())
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
