//! Crash recovery: redo-only WAL replay
//!
//! Storage reaches disk only at checkpoints, and the checkpoint record's
//! `redo_lsn` asserts that everything below it is applied. So recovery is
//! redo-only: find the newest checkpoint, then replay op records with
//! `lsn >= redo_lsn` belonging to transactions that logged a COMMIT and no
//! later ABORT. Uncommitted work never reached a durable COMMIT record and
//! its in-memory storage effects died with the process, so there is nothing
//! to undo. Every redo step is idempotent.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use log::{info, warn};

use super::{LogEntry, LogRecord, Lsn, WalManager};
use crate::ccm::TxnId;
use crate::error::Result;
use crate::storage::TableStore;
use crate::types::Row;
use std::collections::HashMap;

/// Optional filter narrowing which transactions are replayed.
#[derive(Debug, Clone, Default)]
pub struct RecoverCriteria {
    /// Replay only this transaction's records when set.
    pub transaction_id: Option<TxnId>,
}

/// What recovery found and did.
#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    /// First LSN the reopened log should hand out.
    pub next_lsn: Lsn,
    /// Op records replayed.
    pub redone: usize,
}

/// Replays the WAL into storage on startup.
pub struct RecoveryManager {
    data_dir: PathBuf,
}

impl RecoveryManager {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    fn wal_path(&self) -> PathBuf {
        self.data_dir.join(WalManager::WAL_FILE)
    }

    /// Run recovery against `storage` and report the next usable LSN.
    pub fn recover(
        &self,
        storage: &dyn TableStore,
        criteria: &RecoverCriteria,
    ) -> Result<RecoveryOutcome> {
        let wal_path = self.wal_path();
        if !wal_path.exists() {
            return Ok(RecoveryOutcome {
                next_lsn: 1,
                redone: 0,
            });
        }

        info!("starting recovery from WAL");
        let records = self.read_records(&wal_path)?;

        // First pass: newest checkpoint plus commit/abort positions.
        let mut redo_lsn: Lsn = 0;
        let mut commit_lsn: HashMap<TxnId, Lsn> = HashMap::new();
        let mut abort_lsn: HashMap<TxnId, Lsn> = HashMap::new();
        let mut max_lsn: Lsn = 0;

        for record in &records {
            max_lsn = max_lsn.max(record.lsn);
            match &record.entry {
                LogEntry::Checkpoint { redo_lsn: r } => redo_lsn = redo_lsn.max(*r),
                LogEntry::Commit => {
                    commit_lsn.insert(record.txid, record.lsn);
                }
                LogEntry::Abort => {
                    abort_lsn.insert(record.txid, record.lsn);
                }
                _ => {}
            }
        }
        if redo_lsn > 0 {
            info!("newest checkpoint redo_lsn {}", redo_lsn);
        }

        let is_committed = |txid: TxnId| -> bool {
            match commit_lsn.get(&txid) {
                None => false,
                Some(c) => abort_lsn.get(&txid).map_or(true, |a| a < c),
            }
        };

        // Second pass: replay qualifying op records in LSN order.
        let mut redone = 0usize;
        for record in &records {
            if record.lsn < redo_lsn {
                continue;
            }
            if let Some(only) = criteria.transaction_id {
                if record.txid != only {
                    continue;
                }
            }
            if !is_committed(record.txid) {
                continue;
            }
            if redo_entry(&record.entry, storage)? {
                redone += 1;
            }
        }

        if redone > 0 {
            storage.flush_all()?;
        }
        info!("recovery complete: {} op record(s) redone", redone);

        Ok(RecoveryOutcome {
            next_lsn: max_lsn + 1,
            redone,
        })
    }

    fn read_records(&self, path: &PathBuf) -> Result<Vec<LogRecord>> {
        let file = File::open(path)?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    // A torn tail from a crash mid-write is expected.
                    warn!("skipping malformed WAL record: {}", e);
                }
            }
        }
        records.sort_by_key(|r| r.lsn);
        Ok(records)
    }
}

/// Apply one logged op to storage. Returns whether the entry was an op
/// record (as opposed to a transaction marker).
fn redo_entry(entry: &LogEntry, storage: &dyn TableStore) -> Result<bool> {
    match entry {
        LogEntry::Insert {
            table,
            row_id,
            values,
        } => {
            if storage.has_table(table) && storage.get_row(table, *row_id)?.is_none() {
                storage.restore_row(table, Row::new(*row_id, values.clone()))?;
            }
            Ok(true)
        }
        LogEntry::Update {
            table,
            row_id,
            new_row_id,
            new_values,
            ..
        } => {
            if storage.has_table(table) {
                storage.delete_rows(table, &[*row_id])?;
                if storage.get_row(table, *new_row_id)?.is_none() {
                    storage.restore_row(table, Row::new(*new_row_id, new_values.clone()))?;
                }
            }
            Ok(true)
        }
        LogEntry::Delete { table, row_id, .. } => {
            if storage.has_table(table) {
                storage.delete_rows(table, &[*row_id])?;
            }
            Ok(true)
        }
        LogEntry::CreateTable { schema } => {
            if !storage.has_table(&schema.name) {
                storage.create_table(schema.clone())?;
            }
            Ok(true)
        }
        LogEntry::DropTable { table } => {
            storage.drop_table(table)?;
            Ok(true)
        }
        LogEntry::Start | LogEntry::Commit | LogEntry::Abort | LogEntry::Checkpoint { .. } => {
            Ok(false)
        }
    }
}
