//! Debounced Change Notification
//!
//! The data model mutates many times inside one poll turn (every fetch
//! completion flips status flags). Consumers re-reading the model want one
//! wakeup per burst, not one per mutation, so marks set a dirty flag and
//! collapse until a waiter drains it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Shared dirty flag with collapsed wakeups. Clone the `Arc` freely; marks
/// from any task wake at most one pending render pass.
#[derive(Debug, Default)]
pub struct ChangeSignal {
    dirty: AtomicBool,
    notify: Notify,
}

impl ChangeSignal {
    /// Create a clean signal
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record that consumer-visible state changed
    pub fn mark(&self) {
        self.dirty.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Whether a change is pending (without consuming it)
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Wait until at least one change has been marked since the last call,
    /// then reset the flag. Many marks in between collapse into one return.
    pub async fn changed(&self) {
        loop {
            if self.dirty.swap(false, Ordering::AcqRel) {
                return;
            }
            self.notify.notified().await;
        }
    }
}
