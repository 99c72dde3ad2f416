//! Graceful shutdown handling
//!
//! Watch-based shutdown signalling. Unlike a broadcast, a receiver
//! created after the trigger still observes it, so late subscribers
//! never miss a shutdown.

use std::sync::Arc;
use tokio::sync::watch;

/// Shutdown token shared by one worker pool and its background tasks
///
/// Clones share state; independent pools each own their own signal.
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    /// Create a new, untriggered signal
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Trigger shutdown; repeated calls are no-ops
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    /// Whether shutdown has been triggered
    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolve once shutdown has been triggered
    pub async fn wait(&self) {
        let mut receiver = self.sender.subscribe();
        loop {
            let triggered = *receiver.borrow_and_update();
            // The sender lives as long as `self`, so `changed` cannot fail early.
            if triggered || receiver.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Clone for ShutdownSignal {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_signal() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();

        // Spawn task waiting for shutdown
        let handle = tokio::spawn(async move {
            waiter.wait().await;
            42
        });

        signal.trigger();

        let result = handle.await.unwrap();
        assert_eq!(result, 42);
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_late_waiter_sees_trigger() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        signal.trigger();

        tokio::time::timeout(Duration::from_secs(1), signal.clone().wait())
            .await
            .expect("waiter created after trigger must resolve");
    }

    #[tokio::test]
    async fn test_independent_signals() {
        let a = ShutdownSignal::new();
        let b = ShutdownSignal::new();
        a.trigger();

        assert!(a.is_triggered());
        assert!(!b.is_triggered());
    }
}
