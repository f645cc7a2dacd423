//! DML execution: insert, update, delete
//!
//! The WRITE lock was acquired by the pre-execution pass. Each mutation is
//! applied to storage first and then logged to the WAL as an op record, in
//! that order. Recovery is redo-only, so an op record must never describe
//! a change that was not applied.

use crate::ccm::TxnId;
use crate::error::{BasaltError, Result};
use crate::executor::{evaluator, Executor};
use crate::planner::{Assignment, Predicate};
use crate::storage::RowPatch;
use crate::types::{ExecutionResult, Value};
use crate::wal::LogEntry;

impl Executor {
    pub(crate) fn execute_insert(
        &self,
        txid: TxnId,
        table: &str,
        columns: &Option<Vec<String>>,
        values: &[Value],
    ) -> Result<ExecutionResult> {
        let schema = self.storage.schema(table)?;

        let ordered = match columns {
            None => {
                if values.len() != schema.columns.len() {
                    return Err(BasaltError::column_count_mismatch(
                        schema.columns.len(),
                        values.len(),
                    ));
                }
                values.to_vec()
            }
            Some(names) => {
                if names.len() != values.len() {
                    return Err(BasaltError::column_count_mismatch(names.len(), values.len()));
                }
                // Without defaults every column must be supplied.
                if names.len() != schema.columns.len() {
                    return Err(BasaltError::Column(format!(
                        "INSERT into '{}' must provide all {} columns",
                        table,
                        schema.columns.len()
                    )));
                }
                let mut ordered = vec![Value::Null; schema.columns.len()];
                for (name, value) in names.iter().zip(values) {
                    let idx = schema
                        .find_column(name)
                        .ok_or_else(|| BasaltError::unknown_column(name))?;
                    ordered[idx] = value.clone();
                }
                ordered
            }
        };

        let inserted = self.storage.insert_rows(table, vec![ordered])?;
        for row in &inserted {
            self.wal.append(
                txid,
                LogEntry::Insert {
                    table: table.to_string(),
                    row_id: row.id,
                    values: row.values.clone(),
                },
            )?;
        }

        Ok(ExecutionResult::with_affected(
            inserted.len() as u64,
            format!("Inserted {} row(s) into {}", inserted.len(), table),
        ))
    }

    pub(crate) fn execute_update(
        &self,
        txid: TxnId,
        table: &str,
        assignments: &[Assignment],
        filter: Option<&Predicate>,
    ) -> Result<ExecutionResult> {
        let schema = self.storage.schema(table)?;
        let columns = schema.column_names();

        // Validate assignment targets up front.
        for assignment in assignments {
            if schema.find_column(&assignment.column).is_none() {
                return Err(BasaltError::unknown_column(&assignment.column));
            }
        }

        let mut patches = Vec::new();
        let mut old_values = Vec::new();
        for row in self.storage.scan(table)? {
            if let Some(pred) = filter {
                if !evaluator::eval_predicate(pred, &columns, &row.values) {
                    continue;
                }
            }
            let mut new_values = row.values.clone();
            for assignment in assignments {
                let idx = schema
                    .find_column(&assignment.column)
                    .expect("validated above");
                new_values[idx] = evaluator::eval_scalar(&assignment.expr, &columns, &row.values)?;
            }
            old_values.push(row.values.clone());
            patches.push(RowPatch {
                row_id: row.id,
                values: new_values,
            });
        }

        let replaced = self.storage.update_rows(table, patches)?;
        for ((old_id, new_row), old) in replaced.iter().zip(old_values) {
            self.wal.append(
                txid,
                LogEntry::Update {
                    table: table.to_string(),
                    row_id: *old_id,
                    new_row_id: new_row.id,
                    old_values: old,
                    new_values: new_row.values.clone(),
                },
            )?;
        }

        Ok(ExecutionResult::with_affected(
            replaced.len() as u64,
            format!("Updated {} row(s) in {}", replaced.len(), table),
        ))
    }

    pub(crate) fn execute_delete(
        &self,
        txid: TxnId,
        table: &str,
        filter: Option<&Predicate>,
    ) -> Result<ExecutionResult> {
        let schema = self.storage.schema(table)?;
        let columns = schema.column_names();

        let mut doomed = Vec::new();
        for row in self.storage.scan(table)? {
            if let Some(pred) = filter {
                if !evaluator::eval_predicate(pred, &columns, &row.values) {
                    continue;
                }
            }
            doomed.push(row);
        }

        let ids: Vec<u64> = doomed.iter().map(|r| r.id).collect();
        let deleted = self.storage.delete_rows(table, &ids)?;
        for row in &doomed {
            self.wal.append(
                txid,
                LogEntry::Delete {
                    table: table.to_string(),
                    row_id: row.id,
                    old_values: row.values.clone(),
                },
            )?;
        }

        Ok(ExecutionResult::with_affected(
            deleted,
            format!("Deleted {} row(s) from {}", deleted, table),
        ))
    }
}
