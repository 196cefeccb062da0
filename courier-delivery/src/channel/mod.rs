//! Transport channels
//!
//! A channel knows how to hand a single message to one transport (an SMTP relay
//! or a provider's HTTP API). Everything about wire formats and credentials lives
//! behind the [`Channel`] trait; the delivery core only sees the outcome.

mod factory;
mod provider;

use async_trait::async_trait;
use courier_common::Message;
use serde::{Deserialize, Serialize};

pub use self::{
    factory::{ChannelBuilder, ChannelConfig, ChannelFactory},
    provider::{Provider, UnknownProvider},
};
use crate::error::ChannelError;

/// Acknowledgement returned by a channel that accepted a message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Identifier assigned by the provider, when it returns one
    pub provider_message_id: Option<String>,
}

impl SendReceipt {
    pub fn new(provider_message_id: impl Into<String>) -> Self {
        Self {
            provider_message_id: Some(provider_message_id.into()),
        }
    }
}

#[async_trait]
pub trait Channel: Send + Sync {
    /// Unique name used to address this channel
    fn name(&self) -> &str;

    fn provider(&self) -> Provider;

    /// Attempt to deliver one message.
    ///
    /// Failures should carry an [`ErrorCategory`](crate::ErrorCategory) when the
    /// channel knows it; uncategorised failures are classified from their text.
    async fn send(&self, message: &Message) -> Result<SendReceipt, ChannelError>;

    /// Whether the channel is configured well enough to be tried at all
    fn is_valid(&self) -> bool {
        true
    }

    /// Check that the transport is reachable without sending anything
    async fn test_connection(&self) -> bool {
        self.is_valid()
    }
}
