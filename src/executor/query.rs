//! Relational plan nodes: scan, filter, project, sort, join
//!
//! `eval_rows` walks the read-only part of a plan tree and produces a row
//! set. Locks were already acquired by the pre-execution pass, so these
//! methods only touch storage.

use std::cmp::Ordering;

use crate::error::{BasaltError, Result};
use crate::executor::evaluator;
use crate::executor::Executor;
use crate::planner::{PlanNode, Predicate, Projection, SortKey};
use crate::types::Rows;

impl Executor {
    /// Evaluate a relational subtree into a row set.
    pub(crate) fn eval_rows(&self, node: &PlanNode) -> Result<Rows> {
        match node {
            PlanNode::TableScan { table, alias } => self.eval_table_scan(table, alias.as_deref()),
            PlanNode::Filter { condition, child } => {
                let rows = self.eval_rows(child)?;
                Ok(filter_rows(rows, condition))
            }
            PlanNode::Project { projection, child } => {
                let rows = self.eval_rows(child)?;
                project_rows(rows, projection)
            }
            PlanNode::Sort { keys, limit, child } => {
                let rows = self.eval_rows(child)?;
                sort_rows(rows, keys, *limit)
            }
            PlanNode::NestedLoopJoin {
                left,
                right,
                condition,
            } => {
                let left = self.eval_rows(left)?;
                let right = self.eval_rows(right)?;
                Ok(join_rows(left, right, condition.as_ref()))
            }
            other => Err(BasaltError::Internal(format!(
                "{} is not a relational node",
                node_kind(other)
            ))),
        }
    }

    fn eval_table_scan(&self, table: &str, alias: Option<&str>) -> Result<Rows> {
        let mut rows = self.storage.read_table(table)?;
        if let Some(alias) = alias {
            rows.columns = rows
                .columns
                .iter()
                .map(|c| format!("{}.{}", alias, c))
                .collect();
        }
        Ok(rows)
    }
}

fn node_kind(node: &PlanNode) -> &'static str {
    match node {
        PlanNode::TableScan { .. } => "TableScan",
        PlanNode::Filter { .. } => "Filter",
        PlanNode::Project { .. } => "Project",
        PlanNode::Sort { .. } => "Sort",
        PlanNode::NestedLoopJoin { .. } => "NestedLoopJoin",
        PlanNode::Insert { .. } => "Insert",
        PlanNode::Update { .. } => "Update",
        PlanNode::Delete { .. } => "Delete",
        PlanNode::CreateTable { .. } => "CreateTable",
        PlanNode::DropTable { .. } => "DropTable",
    }
}

fn filter_rows(rows: Rows, condition: &Predicate) -> Rows {
    let Rows { columns, data } = rows;
    let data = data
        .into_iter()
        .filter(|row| evaluator::eval_predicate(condition, &columns, row))
        .collect();
    Rows { columns, data }
}

fn project_rows(rows: Rows, projection: &Projection) -> Result<Rows> {
    let wanted = match projection {
        Projection::All => return Ok(rows),
        Projection::Columns(columns) => columns,
    };

    let mut indices = Vec::with_capacity(wanted.len());
    let mut names = Vec::with_capacity(wanted.len());
    for out in wanted {
        let idx = evaluator::resolve_column(&rows.columns, &out.column)
            .ok_or_else(|| BasaltError::unknown_column(&out.column))?;
        indices.push(idx);
        names.push(out.alias.clone().unwrap_or_else(|| out.column.clone()));
    }

    let data = rows
        .data
        .into_iter()
        .map(|row| indices.iter().map(|&i| row[i].clone()).collect())
        .collect();
    Ok(Rows::new(names, data))
}

fn sort_rows(rows: Rows, keys: &[SortKey], limit: Option<usize>) -> Result<Rows> {
    let Rows { columns, mut data } = rows;

    if !keys.is_empty() {
        let mut resolved = Vec::with_capacity(keys.len());
        for key in keys {
            let idx = evaluator::resolve_column(&columns, &key.column)
                .ok_or_else(|| BasaltError::unknown_column(&key.column))?;
            resolved.push((idx, key.descending));
        }

        // Stable multi-key sort; NULLs compare equal and order first.
        data.sort_by(|a, b| {
            for &(idx, descending) in &resolved {
                let ord = a[idx].partial_cmp(&b[idx]).unwrap_or(Ordering::Equal);
                let ord = if descending { ord.reverse() } else { ord };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }

    if let Some(limit) = limit {
        data.truncate(limit);
    }
    Ok(Rows::new(columns, data))
}

fn join_rows(left: Rows, right: Rows, condition: Option<&Predicate>) -> Rows {
    let mut columns = left.columns.clone();
    columns.extend(right.columns.iter().cloned());

    let mut data = Vec::new();
    for left_row in &left.data {
        for right_row in &right.data {
            let mut combined = left_row.clone();
            combined.extend(right_row.iter().cloned());
            let keep = match condition {
                Some(pred) => evaluator::eval_predicate(pred, &columns, &combined),
                None => true,
            };
            if keep {
                data.push(combined);
            }
        }
    }
    Rows::new(columns, data)
}
