//! Outbound message delivery across multiple channels
//!
//! This crate provides functionality to:
//! - Hold messages in a priority queue until they are due
//! - Throttle each channel with its own rate limiter
//! - Route messages to a channel and fall back to another one on failure
//! - Retry temporary failures with exponential backoff

pub mod channel;
mod config;
mod error;
pub mod policy;
pub mod queue;
pub mod rate_limiter;
pub mod router;
mod service;
mod types;

// Re-export channel types
pub use channel::{Channel, ChannelConfig, ChannelFactory, Provider, SendReceipt};
// Re-export configuration
pub use config::{DeliveryConfig, find_config_file};
// Re-export common types
pub use courier_common::{DeliveryStatus, Message, MessageId, Priority};
// Re-export error types
pub use error::{
    ChannelError, DeliveryError, ErrorCategory, PermanentError, SystemError, TemporaryError,
};
// Re-export core types
pub use queue::{DeliveryQueue, Dispatcher, EnqueueOptions, QueueConfig, QueueEntry, QueueStats};
pub use rate_limiter::{RateLimitConfig, RateLimitStrategy, RateLimiter};
pub use router::{Router, RouterConfig};
pub use service::DeliveryService;
pub use types::DeliveryReport;
