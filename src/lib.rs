//! Resilience and caching layer for a flaky-network streaming client.
//!
//! - [`error`]: one error taxonomy for every component
//! - [`resilience`]: bounded retries and circuit breaking
//! - [`cache`]: memory, persistent and combined caches
//! - [`offline`]: on-device document cache and the durable sync queue
//!
//! Nothing here is a global. The host builds each component once, passes it
//! by reference to consumers, and disposes of it on shutdown.

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod network;
pub mod offline;
pub mod resilience;

pub use error::{AppError, ErrorKind, Severity};
