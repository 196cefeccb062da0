//! Policy abstractions for delivery operations.
//!
//! - [`RetryPolicy`]: how long a failed message waits before its next attempt
//! - [`SelectionStrategy`]: which channel a message goes out on when the caller
//!   leaves it open

pub mod retry;
pub mod selection;

pub use retry::RetryPolicy;
pub use selection::{FirstAvailable, RoundRobin, SelectionStrategy};
