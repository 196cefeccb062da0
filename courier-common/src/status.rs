//! Delivery state machine
//!
//! ```text
//! Pending ──> Processing ──> Sent
//!    ^            │
//!    │            ├──> Retry ──> Pending
//!    │            │
//!    │            └──> Failed
//!    │
//! Pending / Retry ──> Cancelled
//! ```
//!
//! `Sent`, `Failed` and `Cancelled` are terminal.

use core::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryStatus {
    #[default]
    Pending,
    Processing,
    Sent,
    Failed,
    Retry,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("Illegal delivery status transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: DeliveryStatus,
    pub to: DeliveryStatus,
}

impl DeliveryStatus {
    /// Whether no further transitions are possible
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed | Self::Cancelled)
    }

    /// Whether the message may still be cancelled
    #[must_use]
    pub const fn is_cancellable(self) -> bool {
        matches!(self, Self::Pending | Self::Retry)
    }

    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing | Self::Cancelled)
                | (Self::Processing, Self::Sent | Self::Retry | Self::Failed)
                | (Self::Retry, Self::Pending | Self::Cancelled)
        )
    }

    /// Move to `next`, rejecting transitions the state machine does not allow
    ///
    /// # Errors
    ///
    /// Returns a [`TransitionError`] when `next` is not reachable from the current state.
    pub fn transition(&mut self, next: Self) -> Result<(), TransitionError> {
        if self.can_transition_to(next) {
            *self = next;
            Ok(())
        } else {
            Err(TransitionError {
                from: *self,
                to: next,
            })
        }
    }
}

impl Display for DeliveryStatus {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        fmt.write_str(match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
            Self::Retry => "RETRY",
            Self::Cancelled => "CANCELLED",
        })
    }
}

#[cfg(test)]
mod test {
    use super::DeliveryStatus;

    #[test]
    fn status() {
        assert!(DeliveryStatus::Sent.is_terminal());
        assert!(DeliveryStatus::Failed.is_terminal());
        assert!(DeliveryStatus::Cancelled.is_terminal());
        assert!(!DeliveryStatus::Retry.is_terminal());

        assert!(DeliveryStatus::Pending.is_cancellable());
        assert!(DeliveryStatus::Retry.is_cancellable());
        assert!(!DeliveryStatus::Processing.is_cancellable());
    }

    #[test]
    fn transitions() {
        let mut status = DeliveryStatus::Pending;
        assert!(status.transition(DeliveryStatus::Processing).is_ok());
        assert!(status.transition(DeliveryStatus::Retry).is_ok());
        assert!(status.transition(DeliveryStatus::Pending).is_ok());
        assert!(status.transition(DeliveryStatus::Processing).is_ok());
        assert!(status.transition(DeliveryStatus::Sent).is_ok());

        let err = status.transition(DeliveryStatus::Pending).unwrap_err();
        assert_eq!(err.from, DeliveryStatus::Sent);
        assert_eq!(err.to, DeliveryStatus::Pending);
        assert_eq!(status, DeliveryStatus::Sent);

        let mut processing = DeliveryStatus::Processing;
        assert!(processing.transition(DeliveryStatus::Cancelled).is_err());
    }
}
