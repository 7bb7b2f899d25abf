//! Push-based download progress
//!
//! Producers publish from whichever task or thread observed the bytes.
//! Each subscription owns exactly one delivery task, so its callback is never
//! invoked concurrently with itself and sees events in publish order.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const CHANNEL_CAPACITY: usize = 256;

/// Fractional progress for one model key
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub key: String,
    /// Always within `0.0..=1.0`
    pub fraction: f64,
}

impl ProgressEvent {
    pub fn new(key: impl Into<String>, fraction: f64) -> Self {
        Self {
            key: key.into(),
            fraction: fraction.clamp(0.0, 1.0),
        }
    }

    /// Progress as a percentage, for display
    pub fn percentage(&self) -> f64 {
        self.fraction * 100.0
    }
}

/// Compute `written / total`, or `None` when the total is unknown or zero
pub fn fraction(written: u64, total: Option<u64>) -> Option<f64> {
    match total {
        Some(total) if total > 0 => Some((written as f64 / total as f64).min(1.0)),
        _ => None,
    }
}

/// Fan-out of progress events to subscribers
#[derive(Debug, Clone)]
pub struct ProgressHub {
    tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressHub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event; silently dropped when nobody is listening
    pub fn publish(&self, event: ProgressEvent) {
        tracing::trace!(key = %event.key, fraction = event.fraction, "Progress");
        let _ = self.tx.send(event);
    }

    /// Raw receiver for async consumers
    pub fn receiver(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// Deliver every future event to `callback` on a dedicated task
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe<F>(&self, mut callback: F) -> Subscription
    where
        F: FnMut(ProgressEvent) + Send + 'static,
    {
        let mut rx = self.tx.subscribe();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callback(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Progress subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Subscription { task }
    }
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Active progress subscription; delivery stops when dropped
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
