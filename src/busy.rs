//! Single-slot lease guarding a connection's wire.
//!
//! ```text
//!   task A ── acquire ──► [held] ─────── drop guard ──┐
//!   task B ── acquire ──► wait (notified) ◄───────────┘──► [held] ...
//!   task C ── try_enter ─► Err(Busy)                    (never waits)
//! ```
//!
//! The slot is a compare-and-swap flag. Waiters park on a [`Notify`] and
//! retry the swap after every release, so a waiting acquisition never
//! spins and never blocks an executor thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{ConnectionError, Result};

/// Mutual-exclusion slot allowing one in-flight wire operation.
#[derive(Debug, Default)]
pub struct BusyLock {
    held: AtomicBool,
    released: Notify,
}

impl BusyLock {
    /// Create an unheld lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a guard is currently live.
    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Take the slot without waiting.
    ///
    /// Fails with [`ConnectionError::Busy`] if another guard is live.
    pub fn try_enter(&self) -> Result<BusyGuard<'_>> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| BusyGuard { lock: self })
            .map_err(|_held| ConnectionError::Busy)
    }

    /// Wait for the slot.
    ///
    /// Returns `None` when `timeout` elapses or `cancel` fires first; not
    /// getting the slot is an ordinary outcome, not an error. `None` for
    /// `timeout` waits indefinitely.
    pub async fn acquire(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Option<BusyGuard<'_>> {
        if cancel.is_cancelled() {
            return None;
        }

        let wait = async {
            loop {
                let notified = self.released.notified();
                tokio::pin!(notified);
                // Register before the swap so a release in between is not missed.
                notified.as_mut().enable();
                if let Ok(guard) = self.try_enter() {
                    return guard;
                }
                notified.await;
            }
        };

        tokio::select! {
            () = cancel.cancelled() => None,
            guard = async {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, wait).await.ok(),
                    None => Some(wait.await),
                }
            } => guard,
        }
    }

    fn release(&self) {
        let was_held = self.held.swap(false, Ordering::AcqRel);
        debug_assert!(was_held, "busy slot released while not held");
        self.released.notify_waiters();
    }
}

/// Live lease on a [`BusyLock`]. Dropping it frees the slot.
#[derive(Debug)]
pub struct BusyGuard<'a> {
    lock: &'a BusyLock,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}
