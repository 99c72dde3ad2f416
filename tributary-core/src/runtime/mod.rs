//! Runtime coordination primitives
//!
//! Shutdown signalling shared by a worker pool and its background tasks.

pub mod shutdown;

pub use shutdown::ShutdownSignal;
