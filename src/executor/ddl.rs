//! DDL execution: create table, drop table
//!
//! Catalog mutations take a WRITE lock on the table's name as a
//! pseudo-resource, serializing them against every reader of that table.

use crate::ccm::TxnId;
use crate::error::{BasaltError, Result};
use crate::executor::Executor;
use crate::types::{ColumnDef, ExecutionResult, TableSchema};
use crate::wal::LogEntry;

impl Executor {
    pub(crate) fn execute_create_table(
        &self,
        txid: TxnId,
        table: &str,
        columns: &[ColumnDef],
    ) -> Result<ExecutionResult> {
        if columns.is_empty() {
            return Err(BasaltError::Syntax(format!(
                "CREATE TABLE {} needs at least one column",
                table
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for col in columns {
            if !seen.insert(col.name.to_ascii_lowercase()) {
                return Err(BasaltError::Column(format!(
                    "duplicate column '{}'",
                    col.name
                )));
            }
        }

        let schema = TableSchema {
            name: table.to_string(),
            columns: columns.to_vec(),
        };
        self.storage.create_table(schema.clone())?;
        self.wal.append(txid, LogEntry::CreateTable { schema })?;

        Ok(ExecutionResult::ok(format!(
            "Table '{}' created with {} column(s)",
            table,
            columns.len()
        )))
    }

    pub(crate) fn execute_drop_table(
        &self,
        txid: TxnId,
        table: &str,
        if_exists: bool,
    ) -> Result<ExecutionResult> {
        let existed = self.storage.drop_table(table)?;
        if !existed {
            if if_exists {
                return Ok(ExecutionResult::ok(format!(
                    "Table '{}' does not exist, nothing dropped",
                    table
                )));
            }
            return Err(BasaltError::table_not_found(table));
        }

        self.wal.append(
            txid,
            LogEntry::DropTable {
                table: table.to_string(),
            },
        )?;
        Ok(ExecutionResult::ok(format!("Table '{}' dropped", table)))
    }
}
