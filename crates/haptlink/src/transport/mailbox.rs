//! Single-slot, latest-wins hand-off between a receive task and a tick loop.

use std::sync::Arc;

use tokio::sync::watch;

/// Holds at most one unconsumed item; posting overwrites whatever is waiting.
///
/// Cloning shares the slot.
pub struct Mailbox<T> {
    slot: Arc<watch::Sender<Option<T>>>,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Mailbox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("empty", &self.is_empty())
            .finish()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            slot: Arc::new(slot),
        }
    }

    /// Store `item`, replacing any unconsumed one. Returns true if an item was overwritten.
    pub fn post(&self, item: T) -> bool {
        self.replace(item).is_some()
    }

    /// Store `item` and hand back the unconsumed item it overwrote.
    pub fn replace(&self, item: T) -> Option<T> {
        self.slot.send_replace(Some(item))
    }

    /// Remove and return the newest unconsumed item.
    pub fn take(&self) -> Option<T> {
        let mut taken = None;
        self.slot.send_if_modified(|slot| {
            taken = slot.take();
            false
        });
        taken
    }

    pub fn is_empty(&self) -> bool {
        self.slot.borrow().is_none()
    }

    pub fn clear(&self) {
        drop(self.take());
    }

    /// Wait until an item is posted, then take it.
    pub async fn recv(&self) -> T {
        let mut changes = self.slot.subscribe();
        loop {
            if let Some(item) = self.take() {
                return item;
            }
            // The sender lives in `self`, so the channel cannot close while we wait.
            if changes.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
