//! Per-transaction wake-up events
//!
//! A `WaitEvent` is the signal a blocked transaction's retry waits on. The
//! concurrency manager clears it when the transaction becomes WAITING and
//! sets it when a lock release makes the request grantable. Setting is
//! idempotent, and a wait that starts after the set completes immediately:
//! the waiter registers with the `Notify` before checking the flag, so a
//! signal can never fall between the check and the await.

use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// A settable/clearable signal with async waiting.
pub struct WaitEvent {
    set: Mutex<bool>,
    notify: Notify,
}

impl WaitEvent {
    pub fn new() -> Self {
        Self {
            set: Mutex::new(false),
            notify: Notify::new(),
        }
    }

    /// Signal the event. Idempotent; wakes every current waiter.
    pub fn set(&self) {
        *self.set.lock().expect("wait event mutex poisoned") = true;
        self.notify.notify_waiters();
    }

    /// Reset the event ahead of a new wait cycle.
    pub fn clear(&self) {
        *self.set.lock().expect("wait event mutex poisoned") = false;
    }

    pub fn is_set(&self) -> bool {
        *self.set.lock().expect("wait event mutex poisoned")
    }

    /// Wait until the event is set or the timeout elapses. Returns whether
    /// the event was set.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.is_set() {
                return true;
            }
            match tokio::time::timeout_at(deadline, notified).await {
                Ok(()) => continue,
                Err(_) => return self.is_set(),
            }
        }
    }
}

impl Default for WaitEvent {
    fn default() -> Self {
        Self::new()
    }
}
