//! Channel selection when the caller does not name one.

use std::sync::atomic::{AtomicUsize, Ordering};

use courier_common::Message;

use crate::channel::Channel;

/// Picks one of the candidate channels for a message
///
/// Candidates are the currently valid channels in registration order. Returning
/// `None` (or an out of range index) means none of them should be used.
pub trait SelectionStrategy: Send + Sync {
    fn select(&self, message: &Message, candidates: &[&dyn Channel]) -> Option<usize>;
}

/// Always the first valid channel
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstAvailable;

impl SelectionStrategy for FirstAvailable {
    fn select(&self, _message: &Message, candidates: &[&dyn Channel]) -> Option<usize> {
        (!candidates.is_empty()).then_some(0)
    }
}

/// Spread messages across the valid channels in turn
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl SelectionStrategy for RoundRobin {
    fn select(&self, _message: &Message, candidates: &[&dyn Channel]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        Some(self.next.fetch_add(1, Ordering::Relaxed) % candidates.len())
    }
}
