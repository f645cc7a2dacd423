//! Storage layer for Basalt
//!
//! The executor and recovery consume the narrow `TableStore` facade; the
//! production implementation is `FileStore`, an in-memory heap per table
//! persisted to block-structured data files plus a JSON catalog. Mutations
//! happen in memory and reach disk on `flush_all` (the checkpoint path);
//! durability between checkpoints is the WAL's job.

use crate::error::Result;
use crate::types::{Row, Rows, TableSchema, Value};

pub mod codec;
pub mod file;

pub use file::FileStore;

/// A pending replacement for one row.
#[derive(Debug, Clone)]
pub struct RowPatch {
    pub row_id: u64,
    pub values: Vec<Value>,
}

/// Statistics reported by `analyze`.
#[derive(Debug, Clone)]
pub struct TableStats {
    pub table: String,
    pub live_rows: u64,
    pub tombstones: u64,
    pub blocks: u64,
    pub row_size: u64,
}

/// The storage facade consumed by the executor and recovery.
///
/// Calls are atomic at the call level; transactional semantics live above
/// this trait in the concurrency manager and WAL.
pub trait TableStore: Send + Sync {
    /// All live rows with their declared column names.
    fn read_table(&self, table: &str) -> Result<Rows>;

    /// All live rows with their internal ids.
    fn scan(&self, table: &str) -> Result<Vec<Row>>;

    /// Append rows, assigning fresh monotonic internal ids. Values are
    /// validated and coerced against the schema. Returns the stored rows.
    fn insert_rows(&self, table: &str, values: Vec<Vec<Value>>) -> Result<Vec<Row>>;

    /// Replace rows as new versions: each old slot is tombstoned and the new
    /// values land under a fresh id. Returns (old id, new row) pairs.
    fn update_rows(&self, table: &str, patches: Vec<RowPatch>) -> Result<Vec<(u64, Row)>>;

    /// Tombstone rows. Returns how many were live.
    fn delete_rows(&self, table: &str, row_ids: &[u64]) -> Result<u64>;

    /// Register a new table. Fails if the name is taken.
    fn create_table(&self, schema: TableSchema) -> Result<()>;

    /// Remove a table and its data file. Returns whether it existed.
    fn drop_table(&self, table: &str) -> Result<bool>;

    /// A single live row by id.
    fn get_row(&self, table: &str, row_id: u64) -> Result<Option<Row>>;

    /// Re-materialize a row under a known id (recovery redo).
    fn restore_row(&self, table: &str, row: Row) -> Result<()>;

    fn schema(&self, table: &str) -> Result<TableSchema>;

    fn has_table(&self, table: &str) -> bool;

    fn list_tables(&self) -> Vec<String>;

    /// Persist every dirty table and the catalog.
    fn flush_all(&self) -> Result<()>;

    /// Recompute table statistics.
    fn analyze(&self, table: &str) -> Result<TableStats>;

    /// Compact tombstoned slots out of the data file. Row ids are
    /// reassigned, so callers must checkpoint around this.
    fn defragment(&self, table: &str) -> Result<u64>;
}
