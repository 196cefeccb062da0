//! Type definitions shared by the router and the queue

use std::time::Duration;

use courier_common::MessageId;

use crate::{channel::SendReceipt, error::DeliveryError};

/// Outcome of routing one message
#[derive(Debug)]
pub struct DeliveryReport {
    pub message_id: MessageId,

    /// The channel that finally succeeded or failed, `None` if none was reached
    pub channel: Option<String>,

    pub provider_message_id: Option<String>,

    /// `None` on success
    pub error: Option<DeliveryError>,

    /// Whether a fallback channel was tried after the first one failed
    pub fell_back: bool,

    /// Additional attempts made within this send (1 after a fallback)
    pub retry_count: u32,

    pub elapsed: Duration,
}

impl DeliveryReport {
    pub fn sent(message_id: MessageId, channel: &str, receipt: SendReceipt) -> Self {
        Self {
            message_id,
            channel: Some(channel.to_string()),
            provider_message_id: receipt.provider_message_id,
            error: None,
            fell_back: false,
            retry_count: 0,
            elapsed: Duration::ZERO,
        }
    }

    pub fn failed(
        message_id: MessageId,
        channel: Option<&str>,
        error: impl Into<DeliveryError>,
    ) -> Self {
        Self {
            message_id,
            channel: channel.map(str::to_string),
            provider_message_id: None,
            error: Some(error.into()),
            fell_back: false,
            retry_count: 0,
            elapsed: Duration::ZERO,
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Whether a later attempt could still succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.error.as_ref().is_some_and(DeliveryError::is_temporary)
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }
}
