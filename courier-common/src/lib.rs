//! Types shared between the courier crates
//!
//! - [`message`]: the outbound message and its identifier
//! - [`status`]: the per-message delivery state machine
//! - [`logging`]: [`LoggingConfig`], subscriber setup and the `internal!` family of
//!   macros

pub mod logging;
pub mod message;
pub mod status;

pub use logging::LoggingConfig;
pub use message::{Message, MessageId, Priority};
pub use status::{DeliveryStatus, TransitionError};
pub use tracing;

/// Lifecycle signals broadcast to long running services
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
