//! Cooperative mutual exclusion over the mirror file.
//!
//! The lock is a descriptor in a sibling `<name>.lock` file: owner device,
//! heartbeat, and an expiry horizon. It is purely advisory - a signal
//! between well-behaved writers sharing a cloud-synced folder, not a
//! consensus protocol. A descriptor counts as stale only when its expiry is
//! past the grace window *and* its heartbeat is older than the TTL, so a
//! writer whose clock drifts slightly does not get its lock stolen.
//!
//! Hosts without sibling-directory capability get a no-op lock that always
//! reports success; mutual exclusion is simply unavailable there.

use std::io;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::events::{EventBus, StorageEvent};
use crate::handle::ExternalFile;

/// Default lifetime of an acquired lock.
pub const LOCK_TTL: Duration = Duration::from_secs(120);

/// Slack added past `expires_at` before a lock may be considered stale.
pub const LOCK_GRACE: Duration = Duration::from_secs(10);

/// Maximum total time a bounded acquisition will keep retrying.
pub const LOCK_RETRY_WINDOW: Duration = Duration::from_secs(15);

/// Suffix appended to the mirror file name to form the lock file name.
pub const LOCK_SUFFIX: &str = ".lock";

const RETRY_BASE_DELAY_MS: u64 = 250;
const RETRY_JITTER_MS: u64 = 250;

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

/// The advisory descriptor stored in the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockDescriptor {
    pub device_id: String,
    pub owner_heartbeat: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockDescriptor {
    /// A descriptor is live unless it is both expired past the grace
    /// window and its heartbeat has gone stale.
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        let expired = now >= self.expires_at + to_delta(LOCK_GRACE);
        let heartbeat_stale = now - self.owner_heartbeat >= to_delta(LOCK_TTL);
        !(expired && heartbeat_stale)
    }
}

/// File-based cooperative lock guarding one mirror file.
#[derive(Debug)]
pub struct FileLock {
    file: Option<Box<dyn ExternalFile>>,
    device_id: String,
    events: EventBus,
}

impl FileLock {
    /// Resolve the lock file next to `handle`. When the handle has no
    /// sibling capability the lock degrades to a no-op.
    pub fn for_handle(
        handle: &dyn ExternalFile,
        device_id: impl Into<String>,
        events: EventBus,
    ) -> Self {
        let file = handle
            .directory()
            .and_then(|dir| dir.open(&format!("{}{LOCK_SUFFIX}", handle.name())).ok());
        if file.is_none() {
            tracing::debug!("no sibling capability; lock is a no-op");
        }
        Self {
            file,
            device_id: device_id.into(),
            events,
        }
    }

    /// Try to take the lock once. Returns `true` on success.
    pub fn acquire(&self, ttl: Duration) -> bool {
        let Some(file) = &self.file else {
            return true;
        };
        let now = Utc::now();
        if let Some(existing) = self.read_descriptor(file.as_ref()) {
            if existing.is_live(now) {
                tracing::debug!(owner = %existing.device_id, "lock held");
                return false;
            }
            tracing::info!(owner = %existing.device_id, "reclaiming stale lock");
        }
        let descriptor = LockDescriptor {
            device_id: self.device_id.clone(),
            owner_heartbeat: now,
            expires_at: now + to_delta(ttl),
        };
        match self.write_descriptor(file.as_ref(), &descriptor) {
            Ok(()) => {
                self.events.emit(StorageEvent::LockAcquired);
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "lock descriptor write failed");
                self.events.emit(StorageEvent::LockBlocked);
                false
            }
        }
    }

    /// Keep retrying [`acquire`](Self::acquire) with jittered backoff until
    /// it succeeds or the retry window closes.
    pub fn acquire_with_retry(&self, ttl: Duration, window: Duration) -> bool {
        let start = Instant::now();
        loop {
            if self.acquire(ttl) {
                return true;
            }
            if start.elapsed() >= window {
                return false;
            }
            let jitter = rand::rng().random_range(0..RETRY_JITTER_MS);
            std::thread::sleep(Duration::from_millis(RETRY_BASE_DELAY_MS + jitter));
        }
    }

    /// Refresh the heartbeat and push the expiry out while holding the lock.
    pub fn renew(&self, ttl: Duration) -> io::Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let now = Utc::now();
        let descriptor = LockDescriptor {
            device_id: self.device_id.clone(),
            owner_heartbeat: now,
            expires_at: now + to_delta(ttl),
        };
        self.write_descriptor(file.as_ref(), &descriptor)
    }

    /// Release by truncating the descriptor. Failures are logged, never
    /// propagated - the TTL bounds the damage of a leaked lock.
    pub fn release(&self) {
        let Some(file) = &self.file else {
            return;
        };
        match file.truncate() {
            Ok(()) => self.events.emit(StorageEvent::LockReleased),
            Err(e) => tracing::warn!(error = %e, "lock release failed; TTL will reclaim"),
        }
    }

    fn read_descriptor(&self, file: &dyn ExternalFile) -> Option<LockDescriptor> {
        let bytes = file.read().ok()?;
        if bytes.is_empty() {
            return None;
        }
        // An unreadable descriptor counts as free.
        serde_json::from_slice(&bytes).ok()
    }

    fn write_descriptor(&self, file: &dyn ExternalFile, descriptor: &LockDescriptor) -> io::Result<()> {
        let bytes = serde_json::to_vec(descriptor)?;
        file.write(&bytes)
    }
}
