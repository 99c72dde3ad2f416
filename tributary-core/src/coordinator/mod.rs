//! Coordination service integration
//!
//! The client boundary to the shared coordination service, the
//! heartbeat monitor that tracks shard ownership, and an in-process
//! implementation of the service.

pub mod client;
pub mod heartbeat;
pub mod memory;

pub use client::CoordinationClient;
pub use heartbeat::HeartbeatMonitor;
pub use memory::{InMemoryClient, InMemoryCoordinator};
