//! Validation-based (backward OCC) concurrency control
//!
//! Transactions run through three phases. During the read phase every
//! `query` is granted while the read-set and write-set accumulate; nothing
//! is pre-claimed. `commit` is the validation phase: the transaction is
//! checked backward against every transaction that finished inside its
//! execution window, and loses if its read-set overlaps any of their
//! write-sets. `commit_flushed` is the write phase boundary: the finish
//! stamp is taken and the transaction's write-set joins the committed
//! record log for future validations.
//!
//! At table granularity a write reads the table it rewrites, so a WRITE
//! joins the read-set as well; two transactions inserting into the same
//! table do conflict.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::debug;

use super::{
    Action, ConcurrencyControl, LockDecision, TransactionStatus, TxnId, TxnTable, WaitEvent,
};
use crate::error::{BasaltError, Result};

/// Validation window stamps for a live transaction.
#[derive(Default, Clone, Copy)]
struct Window {
    start_ts: u64,
    validation_ts: Option<u64>,
}

/// What remains of a committed transaction for backward validation.
struct CommittedRecord {
    finish_ts: u64,
    write_set: Vec<String>,
}

struct Inner {
    txns: TxnTable,
    windows: HashMap<TxnId, Window>,
    committed: Vec<CommittedRecord>,
}

pub struct ValidationManager {
    inner: Mutex<Inner>,
}

impl ValidationManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                txns: TxnTable::new(),
                windows: HashMap::new(),
                committed: Vec::new(),
            }),
        }
    }

    #[cfg(test)]
    fn committed_len(&self) -> usize {
        self.inner.lock().expect("ccm mutex poisoned").committed.len()
    }
}

impl Default for ValidationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    /// Drop committed records no live transaction can still conflict with.
    fn prune_committed(&mut self) {
        match self.txns.oldest_active_timestamp() {
            Some(oldest) => self.committed.retain(|rec| rec.finish_ts >= oldest),
            None => self.committed.clear(),
        }
    }
}

impl ConcurrencyControl for ValidationManager {
    fn begin(&self) -> TxnId {
        let mut inner = self.inner.lock().expect("ccm mutex poisoned");
        let txid = inner.txns.begin();
        let start_ts = inner.txns.get(txid).map(|t| t.timestamp).unwrap_or(0);
        inner.windows.insert(
            txid,
            Window {
                start_ts,
                validation_ts: None,
            },
        );
        txid
    }

    fn query(&self, txid: TxnId, action: Action, resource: &str) -> LockDecision {
        let mut inner = self.inner.lock().expect("ccm mutex poisoned");

        if let Some(reason) = inner.txns.queryable_reason(txid) {
            return LockDecision::Failed { reason };
        }
        if let Some(txn) = inner.txns.get_mut(txid) {
            match action {
                Action::Read => {
                    txn.read_set.insert(resource.to_string());
                }
                Action::Write => {
                    txn.read_set.insert(resource.to_string());
                    txn.write_set.insert(resource.to_string());
                }
            }
        }
        LockDecision::Granted
    }

    fn commit(&self, txid: TxnId) -> Result<()> {
        let mut inner = self.inner.lock().expect("ccm mutex poisoned");

        if inner.txns.status(txid) != Some(TransactionStatus::Active) {
            return Err(BasaltError::transaction_gone());
        }
        let validation_ts = inner.txns.next_stamp();
        let window = inner.windows.get(&txid).copied().unwrap_or_default();
        let read_set: Vec<String> = inner
            .txns
            .get(txid)
            .map(|t| t.read_set.iter().cloned().collect())
            .unwrap_or_default();

        // Backward validation against every transaction whose finish stamp
        // lies inside this transaction's execution window.
        let conflict = inner.committed.iter().any(|rec| {
            rec.finish_ts >= window.start_ts
                && rec.finish_ts <= validation_ts
                && rec.write_set.iter().any(|w| read_set.contains(w))
        });
        if conflict {
            debug!("txn {} fails backward validation", txid);
            let _ = inner.txns.mark_failed(txid);
            return Err(BasaltError::Transaction("validation failure".to_string()));
        }

        if let Some(window) = inner.windows.get_mut(&txid) {
            window.validation_ts = Some(validation_ts);
        }
        inner.txns.mark_partially_committed(txid)
    }

    fn commit_flushed(&self, txid: TxnId) -> Result<()> {
        let mut inner = self.inner.lock().expect("ccm mutex poisoned");
        inner.txns.mark_committed(txid)?;

        let finish_ts = inner.txns.next_stamp();
        let write_set: Vec<String> = inner
            .txns
            .get(txid)
            .map(|t| t.write_set.iter().cloned().collect())
            .unwrap_or_default();
        inner.committed.push(CommittedRecord {
            finish_ts,
            write_set,
        });
        if let Some(window) = inner.windows.remove(&txid) {
            debug!(
                "txn {} window: start {} validate {:?} finish {}",
                txid, window.start_ts, window.validation_ts, finish_ts
            );
        }
        inner.prune_committed();
        Ok(())
    }

    fn rollback(&self, txid: TxnId) -> Result<()> {
        let mut inner = self.inner.lock().expect("ccm mutex poisoned");
        inner.txns.mark_failed(txid)
    }

    fn abort(&self, txid: TxnId) -> Result<()> {
        let mut inner = self.inner.lock().expect("ccm mutex poisoned");
        inner.txns.mark_aborted(txid)?;
        inner.windows.remove(&txid);
        inner.prune_committed();
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
