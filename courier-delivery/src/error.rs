//! Typed error handling for delivery operations.
//!
//! This module provides structured error types that distinguish between:
//! - Temporary failures (timeouts, connection problems, throttling) - retry with backoff
//! - Permanent failures (bad credentials, bad recipients, bad requests) - don't retry
//! - System errors - problems inside the engine itself

use std::{any::Any, io};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level delivery error type.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Permanent failure that should not be retried.
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),

    /// Temporary failure that can be retried with backoff.
    #[error("Temporary failure: {0}")]
    Temporary(#[from] TemporaryError),

    /// System-level error (queue capacity, panics, configuration loading).
    #[error("System error: {0}")]
    System(#[from] SystemError),
}

/// Permanent errors that should not be retried.
#[derive(Debug, Error)]
pub enum PermanentError {
    /// The channel rejected the configured credentials.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Recipient address is invalid or rejected by the provider.
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    /// The provider could not make sense of the request.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// The channel is not configured well enough to attempt delivery.
    #[error("Channel misconfigured: {0}")]
    Configuration(String),

    /// An explicitly requested channel is not registered.
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    /// No registered channel is currently valid.
    #[error("No channel available")]
    NoChannelAvailable,

    /// The provider refused the message for a reason we could not categorise.
    #[error("Message rejected: {0}")]
    Rejected(String),
}

/// Temporary errors that should be retried with exponential backoff.
#[derive(Debug, Error)]
pub enum TemporaryError {
    /// The attempt timed out.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Failed to reach the provider.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Throttled, either locally or by the provider.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The provider flagged the failure as temporary.
    #[error("Temporary error: {0}")]
    Temporary(String),
}

/// System-level errors that indicate internal problems.
#[derive(Debug, Error)]
pub enum SystemError {
    /// The queue holds `max_queue_size` live messages already.
    #[error("Queue is full ({0} messages)")]
    QueueFull(usize),

    /// A message with this identifier is already live in the queue.
    #[error("Message {0} is already queued")]
    AlreadyQueued(String),

    /// The queue was started without a dispatcher.
    #[error("No dispatcher configured")]
    NoDispatcher,

    /// Something panicked while processing a message.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DeliveryError {
    /// Returns `true` if this error is temporary and should be retried.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    /// Returns `true` if this error is permanent and should not be retried.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    /// Returns `true` if this is a system error.
    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(self, Self::System(_))
    }

    /// Returns `true` if another channel might succeed where this one failed.
    ///
    /// Recipient and request problems follow the message to any channel, so only
    /// transport trouble and per-channel configuration qualify.
    #[must_use]
    pub const fn is_channel_related(&self) -> bool {
        matches!(
            self,
            Self::Temporary(_)
                | Self::Permanent(
                    PermanentError::AuthenticationFailed(_) | PermanentError::Configuration(_)
                )
        )
    }
}

/// Failure category reported by a channel alongside its error text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Timeout,
    Connection,
    RateLimited,
    Temporary,
    Authentication,
    InvalidRecipient,
    MalformedRequest,
    Configuration,
}

impl ErrorCategory {
    /// Whether failures in this category are worth retrying
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Connection | Self::RateLimited | Self::Temporary
        )
    }

    /// Guess the category from an error message.
    ///
    /// Returns `None` when nothing in the text is recognised.
    pub fn from_message(message: &str) -> Option<Self> {
        let message = message.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|needle| message.contains(needle));

        if has(&["timeout", "timed out"]) {
            Some(Self::Timeout)
        } else if has(&["rate limit", "too many requests", "throttl"]) {
            Some(Self::RateLimited)
        } else if has(&["connection", "connect", "unreachable"]) {
            Some(Self::Connection)
        } else if has(&["temporary", "temporarily", "try again", "service unavailable"]) {
            Some(Self::Temporary)
        } else if has(&["recipient", "mailbox", "invalid address", "no such user"]) {
            Some(Self::InvalidRecipient)
        } else if has(&["auth", "credential", "unauthorized", "forbidden", "api key"]) {
            Some(Self::Authentication)
        } else if has(&["malformed", "bad request", "invalid request"]) {
            Some(Self::MalformedRequest)
        } else if has(&["config", "not configured"]) {
            Some(Self::Configuration)
        } else {
            None
        }
    }
}

/// Failure reported by [`Channel::send`](crate::Channel::send)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ChannelError {
    pub category: Option<ErrorCategory>,
    pub message: String,
}

impl ChannelError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category: Some(category),
            message: message.into(),
        }
    }

    /// An error whose category is inferred from the text when classified
    pub fn uncategorised(message: impl Into<String>) -> Self {
        Self {
            category: None,
            message: message.into(),
        }
    }

    /// The explicit category, falling back to scanning the message
    pub fn category(&self) -> Option<ErrorCategory> {
        self.category
            .or_else(|| ErrorCategory::from_message(&self.message))
    }
}

/// Classify a channel failure.
///
/// Anything that is not recognisably transient is treated as permanent.
impl From<ChannelError> for DeliveryError {
    fn from(error: ChannelError) -> Self {
        let category = error.category();
        let message = error.message;

        match category {
            Some(ErrorCategory::Timeout) => Self::Temporary(TemporaryError::Timeout(message)),
            Some(ErrorCategory::Connection) => {
                Self::Temporary(TemporaryError::ConnectionFailed(message))
            }
            Some(ErrorCategory::RateLimited) => {
                Self::Temporary(TemporaryError::RateLimited(message))
            }
            Some(ErrorCategory::Temporary) => Self::Temporary(TemporaryError::Temporary(message)),
            Some(ErrorCategory::Authentication) => {
                Self::Permanent(PermanentError::AuthenticationFailed(message))
            }
            Some(ErrorCategory::InvalidRecipient) => {
                Self::Permanent(PermanentError::InvalidRecipient(message))
            }
            Some(ErrorCategory::MalformedRequest) => {
                Self::Permanent(PermanentError::MalformedRequest(message))
            }
            Some(ErrorCategory::Configuration) => {
                Self::Permanent(PermanentError::Configuration(message))
            }
            None => Self::Permanent(PermanentError::Rejected(message)),
        }
    }
}

/// Text carried by a caught panic payload
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
