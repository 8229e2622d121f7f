//! Lifecycle events emitted by the engine.
//!
//! Listeners subscribe through [`EventBus::subscribe`] and receive events
//! over a plain channel. Emission is fire-and-forget: a slow or dropped
//! subscriber never blocks or fails a storage operation.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

/// Where a resilient load found a usable container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoverySource {
    /// The `.prev` shadow copy.
    Shadow,
    /// A timestamped backup file.
    Backup(String),
}

/// Event taxonomy for the mirror, the lock, and the password flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageEvent {
    MirrorConnected,
    MirrorDisconnected,
    MirrorError { code: &'static str, message: String },
    MirrorRecovered { source: RecoverySource },
    LockAcquired,
    LockReleased,
    LockBlocked,
    PasswordNeeded,
    PasswordWrong,
    PasswordChanged,
}

/// Subscriber registry. Cheap to clone; clones share subscribers.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<StorageEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener and return its receiving end.
    pub fn subscribe(&self) -> Receiver<StorageEvent> {
        let (tx, rx) = channel();
        self.lock_subscribers().push(tx);
        rx
    }

    /// Deliver an event to every live subscriber, pruning dropped ones.
    pub fn emit(&self, event: StorageEvent) {
        tracing::debug!(?event, "storage event");
        self.lock_subscribers()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Vec<Sender<StorageEvent>>> {
        // A panic while holding this lock cannot corrupt a Vec of senders.
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
