//! Timestamp-ordering concurrency control with the Thomas Write Rule
//!
//! Each resource carries a pair of high-water marks: the largest timestamp
//! that has read it and the largest that has written it. Both marks persist
//! across transactions and never decrease. Requests either pass the check
//! and advance a mark, or fail immediately. This protocol never waits, so
//! the per-transaction wait events exist only for API uniformity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;

use super::{
    Action, ConcurrencyControl, LockDecision, TransactionStatus, TxnId, TxnTable, WaitEvent,
};
use crate::error::Result;

#[derive(Default, Clone, Copy)]
struct Marks {
    read_ts: u64,
    write_ts: u64,
}

struct Inner {
    txns: TxnTable,
    /// resource -> (read_ts, write_ts); outlives individual transactions.
    marks: HashMap<String, Marks>,
}

pub struct TimestampManager {
    inner: Mutex<Inner>,
}

impl TimestampManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                txns: TxnTable::new(),
                marks: HashMap::new(),
            }),
        }
    }

    /// Current (read_ts, write_ts) for a resource; (0, 0) if untouched.
    #[cfg(test)]
    fn marks(&self, resource: &str) -> (u64, u64) {
        let inner = self.inner.lock().expect("ccm mutex poisoned");
        let m = inner.marks.get(resource).copied().unwrap_or_default();
        (m.read_ts, m.write_ts)
    }
}

impl Default for TimestampManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConcurrencyControl for TimestampManager {
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
        let ts = inner.txns.get(txid).map(|t| t.timestamp).unwrap_or(0);
        let marks = inner.marks.entry(resource.to_string()).or_default();

        match action {
            Action::Read => {
                if ts < marks.write_ts {
                    debug!(
                        "txn {} read of '{}' rejected: ts {} < write_ts {}",
                        txid, resource, ts, marks.write_ts
                    );
                    let _ = inner.txns.mark_failed(txid);
                    return LockDecision::Failed {
                        reason: "timestamp too old".to_string(),
                    };
                }
                marks.read_ts = marks.read_ts.max(ts);
                if let Some(txn) = inner.txns.get_mut(txid) {
                    txn.read_set.insert(resource.to_string());
                }
                LockDecision::Granted
            }
            Action::Write => {
                if ts < marks.read_ts {
                    debug!(
                        "txn {} write of '{}' rejected: ts {} < read_ts {}",
                        txid, resource, ts, marks.read_ts
                    );
                    let _ = inner.txns.mark_failed(txid);
                    return LockDecision::Failed {
                        reason: "timestamp too old".to_string(),
                    };
                }
                if ts < marks.write_ts {
                    // Thomas Write Rule: a write older than the newest write
                    // is accepted but leaves the mark untouched.
                    debug!(
                        "txn {} write of '{}' absorbed by Thomas rule (ts {} < write_ts {})",
                        txid, resource, ts, marks.write_ts
                    );
                } else {
                    marks.write_ts = ts;
                }
                if let Some(txn) = inner.txns.get_mut(txid) {
                    txn.write_set.insert(resource.to_string());
                }
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
        inner.txns.mark_committed(txid)
    }

    fn rollback(&self, txid: TxnId) -> Result<()> {
        let mut inner = self.inner.lock().expect("ccm mutex poisoned");
        inner.txns.mark_failed(txid)
    }

    fn abort(&self, txid: TxnId) -> Result<()> {
        let mut inner = self.inner.lock().expect("ccm mutex poisoned");
        inner.txns.mark_aborted(txid)
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
