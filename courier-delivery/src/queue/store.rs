//! Queue storage
//!
//! Live entries sit in a map keyed by message id. Ordering lives in two heaps of
//! lightweight keys: one for entries that may be dispatched now and one for
//! entries waiting on a retry or a scheduled send. A key is only honoured if its
//! generation matches the entry's current one, so cancelled or rescheduled
//! entries leave stale keys behind that are skipped when popped.

use std::{
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, VecDeque},
    time::SystemTime,
};

use ahash::AHashMap;
use courier_common::{DeliveryStatus, MessageId, Priority};
use tokio::time::Instant;

use super::{QueueEntry, QueueStats};

#[derive(Debug, PartialEq, Eq)]
struct ReadyKey {
    priority: Priority,
    sequence: u64,
    generation: u64,
    id: MessageId,
}

impl Ord for ReadyKey {
    /// Max-heap order: highest priority, then lowest sequence
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
            .then_with(|| other.generation.cmp(&self.generation))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for ReadyKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct DelayedKey {
    at: Instant,
    sequence: u64,
    generation: u64,
    id: MessageId,
}

/// Move `entry` along the state machine, refusing illegal transitions
pub(super) fn advance(entry: &mut QueueEntry, next: DeliveryStatus) -> bool {
    match entry.status.transition(next) {
        Ok(()) => true,
        Err(err) => {
            tracing::error!(id = %entry.id(), %err, "Refusing queue entry transition");
            false
        }
    }
}

#[derive(Debug, Default)]
pub(super) struct Store {
    pub(super) entries: AHashMap<MessageId, QueueEntry>,
    ready: BinaryHeap<ReadyKey>,
    delayed: BinaryHeap<Reverse<DelayedKey>>,
    pub(super) failed: VecDeque<QueueEntry>,
    next_sequence: u64,
    pub(super) stats: QueueStats,
}

impl Store {
    pub(super) const fn next_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    /// Make `id` eligible for dispatch now
    pub(super) fn push_ready(&mut self, id: MessageId, prioritise: bool) {
        let generation = self.next_sequence();
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.generation = generation;
            self.ready.push(ReadyKey {
                priority: if prioritise {
                    entry.priority
                } else {
                    Priority::Normal
                },
                sequence: entry.sequence,
                generation,
                id,
            });
        }
    }

    /// Hold `id` back until its `scheduled_for`
    pub(super) fn push_delayed(&mut self, id: MessageId) {
        let generation = self.next_sequence();
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.generation = generation;
            self.delayed.push(Reverse(DelayedKey {
                at: entry.scheduled_for,
                sequence: entry.sequence,
                generation,
                id,
            }));
        }
    }

    /// Move every delayed entry that is due onto the ready heap
    fn promote_due(&mut self, now: Instant, prioritise: bool) {
        while self
            .delayed
            .peek()
            .is_some_and(|Reverse(key)| key.at <= now)
        {
            let Some(Reverse(key)) = self.delayed.pop() else {
                break;
            };

            let Some(entry) = self.entries.get_mut(&key.id) else {
                continue;
            };

            if entry.generation != key.generation {
                continue;
            }

            if entry.status == DeliveryStatus::Retry && !advance(entry, DeliveryStatus::Pending) {
                continue;
            }

            self.push_ready(key.id, prioritise);
        }
    }

    /// Pop the next dispatchable entry and mark it as processing
    pub(super) fn take(&mut self, now: Instant, prioritise: bool) -> Option<QueueEntry> {
        self.promote_due(now, prioritise);

        while let Some(key) = self.ready.pop() {
            let Some(entry) = self.entries.get_mut(&key.id) else {
                continue;
            };

            if entry.generation != key.generation
                || entry.status != DeliveryStatus::Pending
                || !advance(entry, DeliveryStatus::Processing)
            {
                continue;
            }

            entry.last_attempt = Some(SystemTime::now());
            return Some(entry.clone());
        }

        None
    }

    pub(super) fn next_due(&self) -> Option<Instant> {
        self.delayed.peek().map(|Reverse(key)| key.at)
    }

    pub(super) fn has_ready(&self, now: Instant) -> bool {
        !self.ready.is_empty() || self.next_due().is_some_and(|due| due <= now)
    }

    /// Keep a failed entry for inspection, evicting the oldest beyond `limit`
    pub(super) fn retain_failed(&mut self, entry: QueueEntry, limit: usize) {
        if limit == 0 {
            return;
        }

        while self.failed.len() >= limit {
            self.failed.pop_front();
        }
        self.failed.push_back(entry);
    }

    /// Remove every entry not currently being processed
    pub(super) fn drain_waiting(&mut self) -> Vec<QueueEntry> {
        let waiting: Vec<_> = self
            .entries
            .values()
            .filter(|entry| entry.status.is_cancellable())
            .map(QueueEntry::id)
            .collect();

        // Only waiting entries ever have keys
        self.ready.clear();
        self.delayed.clear();

        let mut drained: Vec<_> = waiting
            .into_iter()
            .filter_map(|id| self.entries.remove(&id))
            .collect();
        drained.sort_by_key(|entry| entry.sequence);
        drained
    }
}
