//! Lock-based concurrency control: strict 2PL with Wait-Die
//!
//! Table-granular shared/exclusive locks. Deadlock prevention is Wait-Die:
//! an older transaction (smaller timestamp) requesting a lock held by a
//! younger one waits; a younger requester dies immediately and must be
//! rolled back by its client. Locks are held until `commit_flushed` or
//! `abort`, which makes the schedule strict (recoverable, cascadeless).
//!
//! Wake-up is event-driven. A waiter is recorded in the resource's FIFO
//! queue with its event cleared; whoever releases the lock walks the queue
//! from the front and sets the event of every waiter whose request is now
//! grantable, stopping at the first that is not. The waiter re-issues its
//! `query` when it wakes; the release does not transfer lock ownership.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use log::debug;

use super::{
    Action, ConcurrencyControl, LockDecision, TransactionStatus, TxnId, TxnTable, WaitEvent,
};
use crate::error::Result;

struct Waiter {
    txid: TxnId,
    action: Action,
}

#[derive(Default)]
struct LockState {
    /// resource -> shared holders
    shared: HashMap<String, HashSet<TxnId>>,
    /// resource -> exclusive holder
    exclusive: HashMap<String, TxnId>,
    /// resource -> FIFO queue of blocked requests
    wait_queue: HashMap<String, VecDeque<Waiter>>,
    /// A transaction waits for at most one resource at a time.
    waiting_on: HashMap<TxnId, String>,
}

struct Inner {
    txns: TxnTable,
    locks: LockState,
}

pub struct LockBasedManager {
    inner: Mutex<Inner>,
}

impl LockBasedManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                txns: TxnTable::new(),
                locks: LockState::default(),
            }),
        }
    }
}

impl Default for LockBasedManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    /// Wait-Die arbitration against `holder`. The requester's timestamp
    /// decides: older waits, younger dies.
    fn wait_die(
        &mut self,
        txid: TxnId,
        action: Action,
        resource: &str,
        holder: TxnId,
    ) -> LockDecision {
        let requester_ts = self.txns.get(txid).map(|t| t.timestamp).unwrap_or(0);
        let holder_ts = self.txns.get(holder).map(|t| t.timestamp).unwrap_or(0);

        if requester_ts < holder_ts {
            debug!(
                "txn {} waits for {} on '{}' (older than holder)",
                txid, holder, resource
            );
            self.enqueue_waiter(txid, action, resource);
            LockDecision::Waiting {
                blocked_by: Some(holder),
            }
        } else {
            debug!(
                "txn {} dies on '{}' (younger than holder {})",
                txid, resource, holder
            );
            // The victim is marked FAILED here; the caller must roll back.
            let _ = self.txns.mark_failed(txid);
            self.forget_waiter(txid);
            LockDecision::Failed {
                reason: "wait-die: die".to_string(),
            }
        }
    }

    fn enqueue_waiter(&mut self, txid: TxnId, action: Action, resource: &str) {
        // One outstanding wait per transaction; a fresh wait replaces any
        // stale registration.
        self.forget_waiter(txid);
        self.locks
            .wait_queue
            .entry(resource.to_string())
            .or_default()
            .push_back(Waiter { txid, action });
        self.locks.waiting_on.insert(txid, resource.to_string());
        if let Some(txn) = self.txns.get(txid) {
            txn.event.clear();
        }
    }

    fn forget_waiter(&mut self, txid: TxnId) {
        if let Some(resource) = self.locks.waiting_on.remove(&txid) {
            let now_empty = match self.locks.wait_queue.get_mut(&resource) {
                Some(queue) => {
                    queue.retain(|w| w.txid != txid);
                    queue.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.locks.wait_queue.remove(&resource);
            }
        }
    }

    /// Would `action` on `resource` be granted right now, ignoring the wait
    /// queue? Used when deciding which waiters to wake.
    fn grantable(&self, txid: TxnId, action: Action, resource: &str) -> bool {
        let exclusive = self.locks.exclusive.get(resource);
        match action {
            Action::Read => exclusive.is_none() || exclusive == Some(&txid),
            Action::Write => {
                if exclusive == Some(&txid) {
                    return true;
                }
                if exclusive.is_some() {
                    return false;
                }
                match self.locks.shared.get(resource) {
                    None => true,
                    Some(holders) => holders.iter().all(|h| *h == txid),
                }
            }
        }
    }

    /// Release every lock `txid` holds and wake newly grantable waiters.
    fn release_locks(&mut self, txid: TxnId) {
        let (shared_res, exclusive_res) = match self.txns.get(txid) {
            Some(txn) => (
                txn.read_set.iter().cloned().collect::<Vec<_>>(),
                txn.write_set.iter().cloned().collect::<Vec<_>>(),
            ),
            None => return,
        };

        let mut freed: Vec<String> = Vec::new();
        for resource in shared_res {
            let now_empty = match self.locks.shared.get_mut(&resource) {
                Some(holders) => {
                    holders.remove(&txid);
                    holders.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.locks.shared.remove(&resource);
            }
            freed.push(resource);
        }
        for resource in exclusive_res {
            if self.locks.exclusive.get(&resource) == Some(&txid) {
                self.locks.exclusive.remove(&resource);
            }
            freed.push(resource);
        }

        if let Some(txn) = self.txns.get_mut(txid) {
            txn.read_set.clear();
            txn.write_set.clear();
        }
        self.forget_waiter(txid);

        freed.sort();
        freed.dedup();
        for resource in freed {
            self.wake_waiters(&resource);
        }
    }

    /// Walk `resource`'s queue from the front, signalling waiters whose
    /// requests can now be granted: either the one writer at the head, or
    /// every consecutive reader up to the next writer. A woken waiter has
    /// not re-acquired yet, so the walk must not also wake requests that
    /// conflict with what it just granted.
    fn wake_waiters(&mut self, resource: &str) {
        let mut woke_reader = false;
        loop {
            let front = match self.locks.wait_queue.get(resource).and_then(|q| q.front()) {
                Some(w) => (w.txid, w.action),
                None => break,
            };
            let (txid, action) = front;

            // Drop waiters that died or aborted while queued.
            if self.txns.status(txid) != Some(TransactionStatus::Active) {
                self.pop_waiter(resource);
                continue;
            }

            if !self.grantable(txid, action, resource) {
                break;
            }
            if action == Action::Write && woke_reader {
                break;
            }

            self.pop_waiter(resource);
            if let Some(txn) = self.txns.get(txid) {
                debug!("waking txn {} for '{}'", txid, resource);
                txn.event.set();
            }
            if action == Action::Write {
                break;
            }
            woke_reader = true;
        }
    }

    fn pop_waiter(&mut self, resource: &str) {
        let (popped, now_empty) = match self.locks.wait_queue.get_mut(resource) {
            Some(queue) => (queue.pop_front(), queue.is_empty()),
            None => return,
        };
        if let Some(w) = popped {
            self.locks.waiting_on.remove(&w.txid);
        }
        if now_empty {
            self.locks.wait_queue.remove(resource);
        }
    }
}

impl ConcurrencyControl for LockBasedManager {
    fn begin(&self) -> TxnId {
        let mut inner = self.inner.lock().expect("ccm mutex poisoned");
        inner.txns.begin()
    }

    fn query(&self, txid: TxnId, action: Action, resource: &str) -> LockDecision {
        let mut guard = self.inner.lock().expect("ccm mutex poisoned");
        let inner = &mut *guard;

        if let Some(reason) = inner.txns.queryable_reason(txid) {
            return LockDecision::Failed { reason };
        }

        match action {
            Action::Read => {
                let exclusive = inner.locks.exclusive.get(resource).copied();
                match exclusive {
                    Some(holder) if holder != txid => {
                        return inner.wait_die(txid, action, resource, holder);
                    }
                    Some(_) => {
                        // Exclusive holders read through their own lock.
                    }
                    None => {
                        inner
                            .locks
                            .shared
                            .entry(resource.to_string())
                            .or_default()
                            .insert(txid);
                        if let Some(txn) = inner.txns.get_mut(txid) {
                            txn.read_set.insert(resource.to_string());
                        }
                    }
                }
                inner.forget_waiter(txid);
                LockDecision::Granted
            }
            Action::Write => {
                let exclusive = inner.locks.exclusive.get(resource).copied();
                if exclusive == Some(txid) {
                    inner.forget_waiter(txid);
                    return LockDecision::Granted;
                }
                if let Some(holder) = exclusive {
                    return inner.wait_die(txid, action, resource, holder);
                }

                let others: Vec<TxnId> = inner
                    .locks
                    .shared
                    .get(resource)
                    .map(|holders| holders.iter().copied().filter(|h| *h != txid).collect())
                    .unwrap_or_default();

                if !others.is_empty() {
                    // Arbitrate against the oldest other shared holder.
                    let oldest = others
                        .into_iter()
                        .min_by_key(|h| inner.txns.get(*h).map(|t| t.timestamp).unwrap_or(u64::MAX))
                        .expect("non-empty holder set");
                    return inner.wait_die(txid, action, resource, oldest);
                }

                // Sole shared holder (or no holders): upgrade to exclusive.
                let now_empty = match inner.locks.shared.get_mut(resource) {
                    Some(holders) => {
                        holders.remove(&txid);
                        holders.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    inner.locks.shared.remove(resource);
                }
                inner.locks.exclusive.insert(resource.to_string(), txid);
                if let Some(txn) = inner.txns.get_mut(txid) {
                    txn.read_set.remove(resource);
                    txn.write_set.insert(resource.to_string());
                }
                inner.forget_waiter(txid);
                LockDecision::Granted
            }
        }
    }

    fn commit(&self, txid: TxnId) -> Result<()> {
        let mut inner = self.inner.lock().expect("ccm mutex poisoned");
        inner.txns.mark_partially_committed(txid)
    }

    fn commit_flushed(&self, txid: TxnId) -> Result<()> {
        let mut inner = self.inner.lock().expect("ccm mutex poisoned");
        inner.txns.mark_committed(txid)?;
        inner.release_locks(txid);
        Ok(())
    }

    fn rollback(&self, txid: TxnId) -> Result<()> {
        let mut inner = self.inner.lock().expect("ccm mutex poisoned");
        inner.txns.mark_failed(txid)
    }

    fn abort(&self, txid: TxnId) -> Result<()> {
        let mut inner = self.inner.lock().expect("ccm mutex poisoned");
        inner.txns.mark_aborted(txid)?;
        inner.release_locks(txid);
        // Anything blocked on the aborted transaction retries immediately.
        if let Some(txn) = inner.txns.get(txid) {
            txn.event.set();
        }
        Ok(())
    }

    fn end(&self, txid: TxnId) -> Result<()> {
        let mut inner = self.inner.lock().expect("ccm mutex poisoned");
        inner.txns.terminate(txid)
    }

    fn status(&self, txid: TxnId) -> Option<TransactionStatus> {
        self.inner.lock().expect("ccm mutex poisoned").txns.status(txid)
    }

    fn wait_event(&self, txid: TxnId) -> Option<Arc<WaitEvent>> {
        self.inner.lock().expect("ccm mutex poisoned").txns.event(txid)
    }
}
