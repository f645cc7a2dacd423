//! Concurrency control for Basalt
//!
//! Three interchangeable table-granular protocols, chosen at server startup:
//!
//! - **Lock-based**: strict two-phase locking with Wait-Die deadlock
//!   prevention and event-driven waiter wake-up.
//! - **Timestamp ordering**: read/write timestamp checks with the Thomas
//!   Write Rule; grants or fails immediately, never waits.
//! - **Validation (backward OCC)**: optimistic read phase, backward
//!   validation at commit against transactions that finished during the
//!   execution window.
//!
//! All three share the same contract: `query` is the sole authorization
//! point and never blocks: it returns `Waiting` (recording the waiter) or
//! `Failed` instead. State lives behind one coarse mutex per manager; wait
//! events are set under that mutex but waited on outside it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{BasaltError, Result};

pub mod event;
pub mod lock_based;
pub mod timestamp;
pub mod validation;

pub use event::WaitEvent;
pub use lock_based::LockBasedManager;
pub use timestamp::TimestampManager;
pub use validation::ValidationManager;

/// Transaction id. Doubles as the protocol timestamp: ids are allocated from
/// a single monotonic counter, so a smaller id is an older transaction.
pub type TxnId = u64;

/// Transaction lifecycle states.
///
/// Transitions form a DAG: Active -> PartiallyCommitted -> Committed ->
/// Terminated, or Active -> Failed -> Aborted -> Terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    PartiallyCommitted,
    Committed,
    Failed,
    Aborted,
    Terminated,
}

/// Requested access mode for a resource (a table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Write,
}

/// Outcome of a `query` authorization request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockDecision {
    /// Access granted; the caller may touch the resource.
    Granted,
    /// The request conflicts; the caller must retry after the transaction's
    /// wait event fires.
    Waiting { blocked_by: Option<TxnId> },
    /// The protocol refused the request; for "wait-die: die" and timestamp
    /// violations the transaction has already been marked FAILED.
    Failed { reason: String },
}

/// Which protocol a server process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    LockBased,
    Timestamp,
    Validation,
}

impl std::str::FromStr for ProtocolKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "lock" | "lock-based" => Ok(ProtocolKind::LockBased),
            "timestamp" | "ts" => Ok(ProtocolKind::Timestamp),
            "validation" | "occ" => Ok(ProtocolKind::Validation),
            other => Err(format!("unknown concurrency protocol '{}'", other)),
        }
    }
}

/// Build the manager for the configured protocol.
pub fn build(kind: ProtocolKind) -> Arc<dyn ConcurrencyControl> {
    match kind {
        ProtocolKind::LockBased => Arc::new(LockBasedManager::new()),
        ProtocolKind::Timestamp => Arc::new(TimestampManager::new()),
        ProtocolKind::Validation => Arc::new(ValidationManager::new()),
    }
}

/// The common concurrency-control contract.
pub trait ConcurrencyControl: Send + Sync {
    /// Allocate a new transaction id and timestamp; register it ACTIVE.
    fn begin(&self) -> TxnId;

    /// Authorize `action` on `resource`. Never blocks.
    fn query(&self, txid: TxnId, action: Action, resource: &str) -> LockDecision;

    /// First commit phase: validate (OCC) or mark PARTIALLY_COMMITTED.
    /// Releases nothing yet.
    fn commit(&self, txid: TxnId) -> Result<()>;

    /// Second commit phase, after the WAL flush: transition to COMMITTED,
    /// release everything held, signal waiters.
    fn commit_flushed(&self, txid: TxnId) -> Result<()>;

    /// Mark the transaction FAILED. Idempotent cleanup: rolling back an
    /// already-FAILED transaction (a Wait-Die victim) is fine.
    fn rollback(&self, txid: TxnId) -> Result<()>;

    /// FAILED -> ABORTED; release everything held, signal waiters.
    fn abort(&self, txid: TxnId) -> Result<()>;

    /// COMMITTED/ABORTED -> TERMINATED; drop the transaction record.
    fn end(&self, txid: TxnId) -> Result<()>;

    /// Current status, if the transaction is still registered.
    fn status(&self, txid: TxnId) -> Option<TransactionStatus>;

    /// The transaction's wake-up event, if still registered.
    fn wait_event(&self, txid: TxnId) -> Option<Arc<WaitEvent>>;
}

/// Per-transaction record shared by all protocol implementations. The id
/// is the map key in `TxnTable`.
pub(crate) struct TxnRecord {
    pub timestamp: u64,
    pub status: TransactionStatus,
    /// Resources read (lock-based: shared locks held).
    pub read_set: HashSet<String>,
    /// Resources written (lock-based: exclusive locks held).
    pub write_set: HashSet<String>,
    pub event: Arc<WaitEvent>,
}

/// Registry of transactions plus the monotonic id/timestamp clock.
#[derive(Default)]
pub(crate) struct TxnTable {
    clock: u64,
    txns: HashMap<TxnId, TxnRecord>,
}

impl TxnTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh id (== timestamp) and register an ACTIVE record.
    pub fn begin(&mut self) -> TxnId {
        self.clock += 1;
        let id = self.clock;
        self.txns.insert(
            id,
            TxnRecord {
                timestamp: id,
                status: TransactionStatus::Active,
                read_set: HashSet::new(),
                write_set: HashSet::new(),
                event: Arc::new(WaitEvent::new()),
            },
        );
        id
    }

    /// Draw the next value from the shared clock (OCC validation and finish
    /// stamps come from the same source as transaction timestamps).
    pub fn next_stamp(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub fn get(&self, txid: TxnId) -> Option<&TxnRecord> {
        self.txns.get(&txid)
    }

    pub fn get_mut(&mut self, txid: TxnId) -> Option<&mut TxnRecord> {
        self.txns.get_mut(&txid)
    }

    pub fn status(&self, txid: TxnId) -> Option<TransactionStatus> {
        self.txns.get(&txid).map(|t| t.status)
    }

    /// Reason string when `txid` cannot accept queries, None when it can.
    pub fn queryable_reason(&self, txid: TxnId) -> Option<String> {
        match self.txns.get(&txid) {
            None => Some("not active".to_string()),
            Some(t) if t.status != TransactionStatus::Active => Some("not active".to_string()),
            Some(_) => None,
        }
    }

    /// ACTIVE -> PARTIALLY_COMMITTED.
    pub fn mark_partially_committed(&mut self, txid: TxnId) -> Result<()> {
        let txn = self.txns.get_mut(&txid).ok_or_else(BasaltError::transaction_gone)?;
        if txn.status != TransactionStatus::Active {
            return Err(BasaltError::transaction_gone());
        }
        txn.status = TransactionStatus::PartiallyCommitted;
        Ok(())
    }

    /// PARTIALLY_COMMITTED -> COMMITTED.
    pub fn mark_committed(&mut self, txid: TxnId) -> Result<()> {
        let txn = self.txns.get_mut(&txid).ok_or_else(BasaltError::transaction_gone)?;
        if txn.status != TransactionStatus::PartiallyCommitted {
            return Err(BasaltError::Transaction(format!(
                "transaction {} is not partially committed",
                txid
            )));
        }
        txn.status = TransactionStatus::Committed;
        Ok(())
    }

    /// ACTIVE -> FAILED, tolerating an already-FAILED transaction. Also
    /// reachable from PARTIALLY_COMMITTED when the commit flush fails and
    /// the transaction must be rolled back instead.
    pub fn mark_failed(&mut self, txid: TxnId) -> Result<()> {
        let txn = self.txns.get_mut(&txid).ok_or_else(BasaltError::transaction_gone)?;
        match txn.status {
            TransactionStatus::Active
            | TransactionStatus::PartiallyCommitted
            | TransactionStatus::Failed => {
                txn.status = TransactionStatus::Failed;
                Ok(())
            }
            _ => Err(BasaltError::transaction_gone()),
        }
    }

    /// FAILED -> ABORTED.
    pub fn mark_aborted(&mut self, txid: TxnId) -> Result<()> {
        let txn = self.txns.get_mut(&txid).ok_or_else(BasaltError::transaction_gone)?;
        if txn.status != TransactionStatus::Failed {
            return Err(BasaltError::Transaction(format!(
                "transaction {} is not in failed state",
                txid
            )));
        }
        txn.status = TransactionStatus::Aborted;
        Ok(())
    }

    /// COMMITTED/ABORTED -> TERMINATED; the record is removed.
    pub fn terminate(&mut self, txid: TxnId) -> Result<()> {
        let status = self.status(txid).ok_or_else(BasaltError::transaction_gone)?;
        match status {
            TransactionStatus::Committed | TransactionStatus::Aborted => {
                self.txns.remove(&txid);
                Ok(())
            }
            _ => Err(BasaltError::Transaction(format!(
                "transaction {} cannot end without commit or rollback",
                txid
            ))),
        }
    }

    pub fn event(&self, txid: TxnId) -> Option<Arc<WaitEvent>> {
        self.txns.get(&txid).map(|t| Arc::clone(&t.event))
    }

    /// Smallest timestamp among ACTIVE transactions, if any.
    pub fn oldest_active_timestamp(&self) -> Option<u64> {
        self.txns
            .values()
            .filter(|t| t.status == TransactionStatus::Active)
            .map(|t| t.timestamp)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let mut table = TxnTable::new();
        let a = table.begin();
        let b = table.begin();
        let c = table.begin();
        assert!(a < b && b < c);
        assert_eq!(table.get(a).unwrap().timestamp, a);
    }

    #[test]
    fn test_status_dag_commit_path() {
        let mut table = TxnTable::new();
        let t = table.begin();
        table.mark_partially_committed(t).unwrap();
        table.mark_committed(t).unwrap();
        table.terminate(t).unwrap();
        assert!(table.status(t).is_none());
    }

    #[test]
    fn test_status_dag_abort_path() {
        let mut table = TxnTable::new();
        let t = table.begin();
        table.mark_failed(t).unwrap();
        // idempotent from FAILED
        table.mark_failed(t).unwrap();
        table.mark_aborted(t).unwrap();
        table.terminate(t).unwrap();
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let mut table = TxnTable::new();
        let t = table.begin();
        assert!(table.mark_committed(t).is_err());
        assert!(table.mark_aborted(t).is_err());
        assert!(table.terminate(t).is_err());

        table.mark_partially_committed(t).unwrap();
        table.mark_committed(t).unwrap();
        assert!(table.mark_failed(t).is_err());
    }

    #[test]
    fn test_partially_committed_can_fail_back() {
        // Commit-flush failure path: the transaction rolls back instead.
        let mut table = TxnTable::new();
        let t = table.begin();
        table.mark_partially_committed(t).unwrap();
        table.mark_failed(t).unwrap();
        table.mark_aborted(t).unwrap();
        table.terminate(t).unwrap();
    }

    #[test]
    fn test_queryable_reason() {
        let mut table = TxnTable::new();
        assert_eq!(table.queryable_reason(99), Some("not active".to_string()));
        let t = table.begin();
        assert_eq!(table.queryable_reason(t), None);
        table.mark_failed(t).unwrap();
        assert_eq!(table.queryable_reason(t), Some("not active".to_string()));
    }
}
