//! Query processor: transaction registry and statement orchestration
//!
//! Routes every statement through plan → lock → execute → log, and owns the
//! commit/rollback choreography:
//!
//! - commit: `ccm.commit` (OCC validates here) → WAL COMMIT record → WAL
//!   flush (durability point) → `ccm.commit_flushed` (locks released,
//!   waiters signalled) → `ccm.end`.
//! - rollback: idempotent cleanup that works from ACTIVE or FAILED, appends
//!   the WAL ABORT record, and always ends the transaction so locks are
//!   never stranded.
//!
//! A statement without a transaction id runs in an auto-commit transaction
//! scoped to itself; `end` is reached on every terminal path. A blocked
//! statement keeps its transaction open and reports `Blocked` so the retry
//! dispatcher can park it on the transaction's wait event.

use std::sync::Arc;

use log::{debug, info, warn};

use crate::ccm::{ConcurrencyControl, TransactionStatus, TxnId};
use crate::error::{BasaltError, Result};
use crate::executor::{ExecOutcome, Executor};
use crate::planner::Planner;
use crate::storage::TableStore;
use crate::types::{ExecutionResult, Rows, Value};
use crate::wal::{LogEntry, WalManager};

/// Outcome of routing one statement.
#[derive(Debug)]
pub enum StatementOutcome {
    Done(ExecutionResult),
    /// Parked on a lock conflict. `auto_commit` records whether the
    /// transaction was implicit, so the retry finishes the commit itself.
    Blocked {
        txid: TxnId,
        blocked_by: Option<TxnId>,
        auto_commit: bool,
    },
}

pub struct QueryProcessor {
    storage: Arc<dyn TableStore>,
    ccm: Arc<dyn ConcurrencyControl>,
    wal: Arc<WalManager>,
    executor: Executor,
}

impl QueryProcessor {
    pub fn new(
        storage: Arc<dyn TableStore>,
        ccm: Arc<dyn ConcurrencyControl>,
        wal: Arc<WalManager>,
    ) -> Self {
        let executor = Executor::new(Arc::clone(&storage), Arc::clone(&ccm), Arc::clone(&wal));
        Self {
            storage,
            ccm,
            wal,
            executor,
        }
    }

    pub fn ccm(&self) -> &Arc<dyn ConcurrencyControl> {
        &self.ccm
    }

    pub fn storage(&self) -> &Arc<dyn TableStore> {
        &self.storage
    }

    /// Start an explicit transaction.
    pub fn begin_transaction(&self) -> Result<TxnId> {
        let txid = self.ccm.begin();
        self.wal.append(txid, LogEntry::Start)?;
        info!("transaction {} started", txid);
        Ok(txid)
    }

    /// Execute one statement, under `txid` if given, else auto-commit.
    pub fn execute_query(&self, sql: &str, txid: Option<TxnId>) -> StatementOutcome {
        if let Some(result) = self.meta_command(sql) {
            return StatementOutcome::Done(result);
        }

        match txid {
            Some(txid) => self.run_statement(sql, txid, false),
            None => {
                let txid = match self.begin_transaction() {
                    Ok(t) => t,
                    Err(e) => return StatementOutcome::Done(ExecutionResult::failure(e.to_string())),
                };
                self.run_statement(sql, txid, true)
            }
        }
    }

    /// Re-run a parked statement after its wait event fired.
    pub fn resume_query(&self, sql: &str, txid: TxnId, auto_commit: bool) -> StatementOutcome {
        self.run_statement(sql, txid, auto_commit)
    }

    fn run_statement(&self, sql: &str, txid: TxnId, auto_commit: bool) -> StatementOutcome {
        let plan = match Planner::plan(sql) {
            Ok(plan) => plan,
            Err(e) => {
                // Parse errors leave the transaction untouched.
                let result = ExecutionResult::failure(e.to_string()).in_transaction(txid);
                if auto_commit {
                    self.finish_auto_commit_failure(txid);
                }
                return StatementOutcome::Done(result);
            }
        };

        match self.executor.execute(&plan, txid) {
            Ok(ExecOutcome::Completed(result)) => {
                if auto_commit {
                    if result.success {
                        let commit = self.commit_transaction(txid);
                        if !commit.success {
                            return StatementOutcome::Done(commit);
                        }
                    } else {
                        self.finish_auto_commit_failure(txid);
                    }
                }
                StatementOutcome::Done(result)
            }
            Ok(ExecOutcome::Blocked { blocked_by }) => StatementOutcome::Blocked {
                txid,
                blocked_by,
                auto_commit,
            },
            Err(e) => {
                let result = ExecutionResult::failure(e.to_string()).in_transaction(txid);
                match &e {
                    // I/O-class failures roll the transaction back here;
                    // protocol deaths stay FAILED until the client rolls
                    // back; schema/syntax errors leave the txn usable.
                    BasaltError::Storage(_) | BasaltError::Wal(_) | BasaltError::Io(_) => {
                        let _ = self.rollback_transaction(txid);
                    }
                    _ => {
                        if auto_commit {
                            self.finish_auto_commit_failure(txid);
                        }
                    }
                }
                StatementOutcome::Done(result)
            }
        }
    }

    /// Terminal cleanup for a failed auto-commit statement.
    fn finish_auto_commit_failure(&self, txid: TxnId) {
        let _ = self.rollback_transaction(txid);
    }

    /// Two-phase commit against the CCM with the WAL flush in between.
    pub fn commit_transaction(&self, txid: TxnId) -> ExecutionResult {
        if let Err(e) = self.ccm.commit(txid) {
            // A validation loss leaves the transaction FAILED; clean it up
            // so its effects are never replayed.
            if self.ccm.status(txid) == Some(TransactionStatus::Failed) {
                let _ = self.wal.append(txid, LogEntry::Abort);
                let _ = self.ccm.abort(txid);
                let _ = self.ccm.end(txid);
            }
            return ExecutionResult::failure(e.to_string()).in_transaction(txid);
        }

        if let Err(e) = self
            .wal
            .append(txid, LogEntry::Commit)
            .and_then(|_| self.wal.flush())
        {
            warn!("commit flush failed for transaction {}: {}", txid, e);
            let _ = self.ccm.rollback(txid);
            let _ = self.wal.append(txid, LogEntry::Abort);
            let _ = self.ccm.abort(txid);
            let _ = self.ccm.end(txid);
            return ExecutionResult::failure(e.to_string()).in_transaction(txid);
        }

        if let Err(e) = self.ccm.commit_flushed(txid) {
            return ExecutionResult::failure(e.to_string()).in_transaction(txid);
        }
        let _ = self.ccm.end(txid);
        info!("transaction {} committed", txid);

        self.maybe_checkpoint();
        ExecutionResult::ok(format!("Transaction {} committed", txid)).in_transaction(txid)
    }

    /// Idempotent rollback: valid from ACTIVE or FAILED.
    pub fn rollback_transaction(&self, txid: TxnId) -> ExecutionResult {
        if let Err(e) = self.ccm.rollback(txid) {
            return ExecutionResult::failure(e.to_string()).in_transaction(txid);
        }
        let _ = self.wal.append(txid, LogEntry::Abort);
        if let Err(e) = self.ccm.abort(txid) {
            return ExecutionResult::failure(e.to_string()).in_transaction(txid);
        }
        let _ = self.ccm.end(txid);
        info!("transaction {} rolled back", txid);
        ExecutionResult::ok(format!("Transaction {} rolled back", txid)).in_transaction(txid)
    }

    fn maybe_checkpoint(&self) {
        if !self.wal.wants_checkpoint() {
            return;
        }
        debug!("checkpoint threshold reached");
        if let Err(e) = self
            .storage
            .flush_all()
            .and_then(|_| self.wal.checkpoint().map(|_| ()))
        {
            warn!("automatic checkpoint failed: {}", e);
        }
    }

    /// Table statistics for the `analyze` request.
    pub fn analyze_table(&self, table: &str) -> ExecutionResult {
        match self.storage.analyze(table) {
            Ok(stats) => ExecutionResult::ok(format!(
                "table '{}': {} live row(s), {} tombstone(s), {} block(s), row size {}",
                stats.table, stats.live_rows, stats.tombstones, stats.blocks, stats.row_size
            )),
            Err(e) => ExecutionResult::failure(e.to_string()),
        }
    }

    /// Compact a table for the `defragment` request. Row ids shift, so a
    /// checkpoint brackets the compaction; callers should be quiesced.
    pub fn defragment_table(&self, table: &str) -> ExecutionResult {
        let result = self
            .storage
            .flush_all()
            .and_then(|_| self.wal.checkpoint())
            .and_then(|_| self.storage.defragment(table))
            .and_then(|reclaimed| self.wal.checkpoint().map(|_| reclaimed));
        match result {
            Ok(reclaimed) => ExecutionResult::ok(format!(
                "table '{}' defragmented, {} slot(s) reclaimed",
                table, reclaimed
            )),
            Err(e) => ExecutionResult::failure(e.to_string()),
        }
    }

    /// `show tables` / `show data <t>` sugar used by the CLI.
    fn meta_command(&self, sql: &str) -> Option<ExecutionResult> {
        let trimmed = sql.trim().trim_end_matches(';').trim();
        let lowered = trimmed.to_ascii_lowercase();
        if lowered == "show tables" {
            let names = self.storage.list_tables();
            let data = names.into_iter().map(|n| vec![Value::Text(n)]).collect();
            return Some(ExecutionResult::with_rows(Rows::new(
                vec!["table_name".to_string()],
                data,
            )));
        }
        if let Some(rest) = lowered.strip_prefix("show data ") {
            let table = rest.trim().to_string();
            return match self.execute_query(&format!("SELECT * FROM {}", table), None) {
                StatementOutcome::Done(result) => Some(result),
                StatementOutcome::Blocked { .. } => {
                    Some(ExecutionResult::failure("table is locked, try again"))
                }
            };
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ccm::{self, ProtocolKind};
    use crate::storage::FileStore;
    use tempfile::{tempdir, TempDir};

    fn setup(kind: ProtocolKind) -> (QueryProcessor, TempDir) {
        let dir = tempdir().unwrap();
        let storage: Arc<dyn TableStore> =
            Arc::new(FileStore::open(dir.path().to_path_buf()).unwrap());
        let ccm = ccm::build(kind);
        let wal = Arc::new(WalManager::open(&dir.path().to_path_buf(), 1, 1000).unwrap());
        (QueryProcessor::new(storage, ccm, wal), dir)
    }

    fn done(outcome: StatementOutcome) -> ExecutionResult {
        match outcome {
            StatementOutcome::Done(result) => result,
            other => panic!("expected Done, got {:?}", other),
        }
    }

    #[test]
    fn test_auto_commit_statement() {
        let (processor, _dir) = setup(ProtocolKind::LockBased);
        let result = done(processor.execute_query("CREATE TABLE t (v INT)", None));
        assert!(result.success);
        // Auto-commit finished: no transaction remains registered.
        assert!(processor.ccm.status(result.transaction_id.unwrap()).is_none());

        let result = done(processor.execute_query("INSERT INTO t VALUES (1)", None));
        assert!(result.success);
        let rows = done(processor.execute_query("SELECT * FROM t", None))
            .rows
            .unwrap();
        assert_eq!(rows.data.len(), 1);
    }

    #[test]
    fn test_explicit_transaction_commit() {
        let (processor, _dir) = setup(ProtocolKind::LockBased);
        let txid = processor.begin_transaction().unwrap();

        assert!(done(processor.execute_query("CREATE TABLE t (v INT)", Some(txid))).success);
        assert!(done(processor.execute_query("INSERT INTO t VALUES (42)", Some(txid))).success);

        let commit = processor.commit_transaction(txid);
        assert!(commit.success);

        let rows = done(processor.execute_query("SELECT * FROM t", None))
            .rows
            .unwrap();
        assert_eq!(rows.data, vec![vec![Value::Int(42)]]);
    }

    #[test]
    fn test_second_commit_fails() {
        let (processor, _dir) = setup(ProtocolKind::LockBased);
        let txid = processor.begin_transaction().unwrap();
        done(processor.execute_query("CREATE TABLE t (v INT)", Some(txid)));

        assert!(processor.commit_transaction(txid).success);
        let second = processor.commit_transaction(txid);
        assert!(!second.success);
        assert_eq!(
            second.error.as_deref(),
            Some("transaction not found or not active")
        );
    }

    #[test]
    fn test_rollback_from_failed_state() {
        let (processor, _dir) = setup(ProtocolKind::LockBased);
        done(processor.execute_query("CREATE TABLE t (v INT)", None));

        let older = processor.begin_transaction().unwrap();
        let younger = processor.begin_transaction().unwrap();

        assert!(done(processor.execute_query("UPDATE t SET v = 1", Some(older))).success);
        // Younger dies on the conflict.
        let died = done(processor.execute_query("UPDATE t SET v = 2", Some(younger)));
        assert!(!died.success);
        assert_eq!(died.error.as_deref(), Some("wait-die: die"));

        // Subsequent statements rejected until rollback.
        let rejected = done(processor.execute_query("UPDATE t SET v = 3", Some(younger)));
        assert_eq!(rejected.error.as_deref(), Some("not active"));

        assert!(processor.rollback_transaction(younger).success);
        assert!(processor.commit_transaction(older).success);
    }

    #[test]
    fn test_parse_error_leaves_transaction_usable() {
        let (processor, _dir) = setup(ProtocolKind::LockBased);
        let txid = processor.begin_transaction().unwrap();

        let bad = done(processor.execute_query("SELEKT * FROM t", Some(txid)));
        assert!(!bad.success);

        done(processor.execute_query("CREATE TABLE t (v INT)", Some(txid)));
        assert!(processor.commit_transaction(txid).success);
    }

    #[test]
    fn test_schema_error_transaction_continues() {
        let (processor, _dir) = setup(ProtocolKind::LockBased);
        let txid = processor.begin_transaction().unwrap();

        let missing = done(processor.execute_query("SELECT * FROM ghost", Some(txid)));
        assert!(!missing.success);
        assert!(missing.error.unwrap().contains("doesn't exist"));

        // Still active.
        assert_eq!(
            processor.ccm.status(txid),
            Some(TransactionStatus::Active)
        );
        assert!(processor.rollback_transaction(txid).success);
    }

    #[test]
    fn test_occ_validation_loss_surfaces_on_commit() {
        let (processor, _dir) = setup(ProtocolKind::Validation);
        done(processor.execute_query("CREATE TABLE t (v INT)", None));

        let a = processor.begin_transaction().unwrap();
        let b = processor.begin_transaction().unwrap();
        assert!(done(processor.execute_query("INSERT INTO t VALUES (1)", Some(a))).success);
        assert!(done(processor.execute_query("INSERT INTO t VALUES (2)", Some(b))).success);

        assert!(processor.commit_transaction(b).success);
        let lost = processor.commit_transaction(a);
        assert!(!lost.success);
        assert_eq!(lost.error.as_deref(), Some("validation failure"));
        // Cleanup happened; the id is gone.
        assert!(processor.ccm.status(a).is_none());
    }

    #[test]
    fn test_timestamp_conflict_marks_failed() {
        let (processor, _dir) = setup(ProtocolKind::Timestamp);
        done(processor.execute_query("CREATE TABLE x (id INT)", None));

        let a = processor.begin_transaction().unwrap();
        let b = processor.begin_transaction().unwrap();

        assert!(done(processor.execute_query("INSERT INTO x VALUES (1)", Some(b))).success);
        let stale = done(processor.execute_query("SELECT * FROM x", Some(a)));
        assert!(!stale.success);
        assert_eq!(stale.error.as_deref(), Some("timestamp too old"));
        assert_eq!(processor.ccm.status(a), Some(TransactionStatus::Failed));
    }

    #[test]
    fn test_blocked_statement_keeps_transaction_open() {
        let (processor, _dir) = setup(ProtocolKind::LockBased);
        done(processor.execute_query("CREATE TABLE t (v INT)", None));
        done(processor.execute_query("INSERT INTO t VALUES (1)", None));

        let older = processor.begin_transaction().unwrap();
        let younger = processor.begin_transaction().unwrap();
        assert!(done(processor.execute_query("UPDATE t SET v = 2", Some(younger))).success);

        let outcome = processor.execute_query("UPDATE t SET v = 3", Some(older));
        let StatementOutcome::Blocked {
            txid,
            blocked_by,
            auto_commit,
        } = outcome
        else {
            panic!("expected blocked");
        };
        assert_eq!(txid, older);
        assert_eq!(blocked_by, Some(younger));
        assert!(!auto_commit);

        // After the younger commits, the resume succeeds.
        assert!(processor.commit_transaction(younger).success);
        let resumed = processor.resume_query("UPDATE t SET v = 3", older, false);
        assert!(done(resumed).success);
        assert!(processor.commit_transaction(older).success);
    }

    #[test]
    fn test_meta_commands() {
        let (processor, _dir) = setup(ProtocolKind::LockBased);
        done(processor.execute_query("CREATE TABLE b (v INT)", None));
        done(processor.execute_query("CREATE TABLE a (v INT)", None));

        let tables = done(processor.execute_query("show tables", None)).rows.unwrap();
        assert_eq!(
            tables.data,
            vec![
                vec![Value::Text("a".into())],
                vec![Value::Text("b".into())]
            ]
        );

        done(processor.execute_query("INSERT INTO a VALUES (5)", None));
        let data = done(processor.execute_query("show data a", None)).rows.unwrap();
        assert_eq!(data.data, vec![vec![Value::Int(5)]]);
    }

    #[test]
    fn test_analyze_and_defragment() {
        let (processor, _dir) = setup(ProtocolKind::LockBased);
        done(processor.execute_query("CREATE TABLE t (v INT)", None));
        done(processor.execute_query("INSERT INTO t VALUES (1)", None));
        done(processor.execute_query("INSERT INTO t VALUES (2)", None));
        done(processor.execute_query("DELETE FROM t WHERE v = 1", None));

        let analyzed = processor.analyze_table("t");
        assert!(analyzed.success);
        assert!(analyzed.message.unwrap().contains("1 tombstone(s)"));

        let defragged = processor.defragment_table("t");
        assert!(defragged.success);
        assert!(defragged.message.unwrap().contains("1 slot(s) reclaimed"));
    }
}
