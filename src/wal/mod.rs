//! Write-ahead log for Basalt
//!
//! The log is an append-only NDJSON file: one JSON-encoded record per line,
//! with strictly increasing LSNs. Records are staged in an in-memory buffer
//! by `append` and made durable by `flush`, which writes the staged lines
//! and fsyncs before advancing `flushed_lsn`. The commit protocol flushes
//! the COMMIT record before success is reported to the client; op records
//! ride along with whichever flush comes next.
//!
//! A CHECKPOINT record carries `redo_lsn`, the first LSN recovery must
//! replay. The caller flushes storage before checkpointing, so everything
//! below the checkpoint is already applied on disk. A small sidecar marker
//! file remembers the newest checkpoint for quick lookup.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::ccm::TxnId;
use crate::error::{BasaltError, Result};
use crate::types::{TableSchema, Value};

pub mod recovery;

pub use recovery::{RecoverCriteria, RecoveryManager, RecoveryOutcome};

/// Log Sequence Number - unique identifier for each WAL record
pub type Lsn = u64;

/// A WAL log record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Log sequence number
    pub lsn: Lsn,
    /// Transaction id (0 for checkpoint records)
    pub txid: TxnId,
    /// The logged event
    pub entry: LogEntry,
    /// Timestamp (Unix epoch millis)
    pub timestamp: u64,
}

/// Events that can be logged
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogEntry {
    /// Transaction started
    Start,
    /// Transaction committed
    Commit,
    /// Transaction aborted
    Abort,
    /// Checkpoint marker; `redo_lsn` is where recovery starts replaying
    Checkpoint { redo_lsn: Lsn },
    /// Row inserted
    Insert {
        table: String,
        row_id: u64,
        values: Vec<Value>,
    },
    /// Row replaced by a new version (old slot tombstoned)
    Update {
        table: String,
        row_id: u64,
        new_row_id: u64,
        old_values: Vec<Value>,
        new_values: Vec<Value>,
    },
    /// Row tombstoned
    Delete {
        table: String,
        row_id: u64,
        old_values: Vec<Value>,
    },
    /// Table created
    CreateTable { schema: TableSchema },
    /// Table dropped
    DropTable { table: String },
}

struct WalInner {
    file: File,
    next_lsn: Lsn,
    flushed_lsn: Lsn,
    buffer: Vec<LogRecord>,
    records_since_checkpoint: usize,
}

/// The write-ahead log manager
pub struct WalManager {
    checkpoint_path: PathBuf,
    /// Buffered records between checkpoints before one is suggested
    checkpoint_threshold: usize,
    inner: Mutex<WalInner>,
}

impl WalManager {
    pub const WAL_FILE: &'static str = "wal.log";
    pub const CHECKPOINT_FILE: &'static str = "wal.checkpoint";

    /// Open (or create) the log in `data_dir`, continuing from `start_lsn`
    /// (recovery reports the next usable LSN for a pre-existing log).
    pub fn open(data_dir: &Path, start_lsn: Lsn, checkpoint_threshold: usize) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(data_dir.join(Self::WAL_FILE))?;

        Ok(Self {
            checkpoint_path: data_dir.join(Self::CHECKPOINT_FILE),
            checkpoint_threshold,
            inner: Mutex::new(WalInner {
                file,
                next_lsn: start_lsn,
                flushed_lsn: start_lsn.saturating_sub(1),
                buffer: Vec::new(),
                records_since_checkpoint: 0,
            }),
        })
    }

    fn timestamp() -> u64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(dur) => dur.as_millis() as u64,
            Err(_) => 0,
        }
    }

    /// Stage a record in the buffer, assigning its LSN.
    pub fn append(&self, txid: TxnId, entry: LogEntry) -> Result<Lsn> {
        let mut inner = self.inner.lock().expect("wal mutex poisoned");
        let lsn = inner.next_lsn;
        inner.next_lsn += 1;
        inner.records_since_checkpoint += 1;
        inner.buffer.push(LogRecord {
            lsn,
            txid,
            entry,
            timestamp: Self::timestamp(),
        });
        Ok(lsn)
    }

    /// Write buffered records and fsync; advances `flushed_lsn`.
    pub fn flush(&self) -> Result<Lsn> {
        let mut inner = self.inner.lock().expect("wal mutex poisoned");
        self.flush_locked(&mut inner)
    }

    fn flush_locked(&self, inner: &mut WalInner) -> Result<Lsn> {
        if inner.buffer.is_empty() {
            return Ok(inner.flushed_lsn);
        }

        let mut out = String::new();
        for record in &inner.buffer {
            out.push_str(
                &serde_json::to_string(record)
                    .map_err(|e| BasaltError::Wal(format!("log encode failed: {}", e)))?,
            );
            out.push('\n');
        }
        let last = inner.buffer.last().map(|r| r.lsn).unwrap_or(inner.flushed_lsn);

        inner
            .file
            .write_all(out.as_bytes())
            .map_err(|e| BasaltError::Wal(format!("log write failed: {}", e)))?;
        inner
            .file
            .sync_all()
            .map_err(|e| BasaltError::Wal(format!("log fsync failed: {}", e)))?;

        inner.buffer.clear();
        inner.flushed_lsn = last;
        debug!("wal flushed through lsn {}", last);
        Ok(last)
    }

    /// Highest LSN known durable.
    pub fn flushed_lsn(&self) -> Lsn {
        self.inner.lock().expect("wal mutex poisoned").flushed_lsn
    }

    /// Whether enough records accumulated to warrant a checkpoint.
    pub fn wants_checkpoint(&self) -> bool {
        let inner = self.inner.lock().expect("wal mutex poisoned");
        inner.records_since_checkpoint >= self.checkpoint_threshold
    }

    /// Append and flush a CHECKPOINT record. The caller must have flushed
    /// storage first: `redo_lsn` is the checkpoint's own LSN, asserting that
    /// every earlier record is already applied.
    pub fn checkpoint(&self) -> Result<Lsn> {
        let mut inner = self.inner.lock().expect("wal mutex poisoned");

        let redo_lsn = inner.next_lsn;
        let lsn = inner.next_lsn;
        inner.next_lsn += 1;
        inner.buffer.push(LogRecord {
            lsn,
            txid: 0,
            entry: LogEntry::Checkpoint { redo_lsn },
            timestamp: Self::timestamp(),
        });
        self.flush_locked(&mut inner)?;
        inner.records_since_checkpoint = 0;

        let marker = serde_json::json!({
            "checkpoint_lsn": lsn,
            "redo_lsn": redo_lsn,
            "timestamp": Self::timestamp(),
        });
        fs::write(&self.checkpoint_path, serde_json::to_string_pretty(&marker)?)?;
        debug!("checkpoint written at lsn {}", lsn);
        Ok(lsn)
    }
}
