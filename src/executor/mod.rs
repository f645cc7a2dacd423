//! Query Executor for Basalt
//!
//! The executor takes a logical plan tree and runs it against the storage
//! facade, under the authority of the concurrency manager and with every
//! mutation logged to the WAL.
//!
//! ## Execution model
//!
//! 1. Walk the plan and collect the tables it touches (WRITE dominates).
//! 2. Acquire access through `ccm.query` in alphabetical table order;
//!    a deterministic order keeps Wait-Die aborts down.
//! 3. On GRANTED for every table, evaluate the tree; storage mutations are
//!    applied first and WAL-logged second.
//! 4. On WAITING, stop before touching storage and report `Blocked` so the
//!    server can park the statement on the transaction's wait event.
//! 5. On FAILED, surface the protocol's reason; the transaction is already
//!    marked FAILED and only a rollback will revive the session.

use std::sync::Arc;

use log::debug;

use crate::ccm::{ConcurrencyControl, LockDecision, TxnId};
use crate::error::{BasaltError, Result};
use crate::planner::PlanNode;
use crate::storage::TableStore;
use crate::types::ExecutionResult;
use crate::wal::WalManager;

pub mod ddl;
pub mod dml;
pub mod evaluator;
pub mod query;

/// What became of one execution attempt.
#[derive(Debug)]
pub enum ExecOutcome {
    /// The statement ran (successfully or not).
    Completed(ExecutionResult),
    /// A lock conflict parked the statement; retry when the transaction's
    /// wait event fires.
    Blocked { blocked_by: Option<TxnId> },
}

/// The plan-tree executor
pub struct Executor {
    pub(crate) storage: Arc<dyn TableStore>,
    pub(crate) ccm: Arc<dyn ConcurrencyControl>,
    pub(crate) wal: Arc<WalManager>,
}

impl Executor {
    pub fn new(
        storage: Arc<dyn TableStore>,
        ccm: Arc<dyn ConcurrencyControl>,
        wal: Arc<WalManager>,
    ) -> Self {
        Self { storage, ccm, wal }
    }

    /// Execute a plan under `txid`.
    pub fn execute(&self, plan: &PlanNode, txid: TxnId) -> Result<ExecOutcome> {
        // Authorization pass: all tables, deterministic order, before any
        // storage access.
        for (table, action) in plan.table_accesses() {
            match self.ccm.query(txid, action, &table) {
                LockDecision::Granted => {}
                LockDecision::Waiting { blocked_by } => {
                    debug!(
                        "txn {} blocked on '{}' (held by {:?})",
                        txid, table, blocked_by
                    );
                    return Ok(ExecOutcome::Blocked { blocked_by });
                }
                LockDecision::Failed { reason } => {
                    return Err(BasaltError::Transaction(reason));
                }
            }
        }

        let result = match plan {
            PlanNode::TableScan { .. }
            | PlanNode::Filter { .. }
            | PlanNode::Project { .. }
            | PlanNode::Sort { .. }
            | PlanNode::NestedLoopJoin { .. } => {
                self.eval_rows(plan).map(ExecutionResult::with_rows)?
            }
            PlanNode::Insert {
                table,
                columns,
                values,
            } => self.execute_insert(txid, table, columns, values)?,
            PlanNode::Update {
                table,
                assignments,
                filter,
            } => self.execute_update(txid, table, assignments, filter.as_ref())?,
            PlanNode::Delete { table, filter } => {
                self.execute_delete(txid, table, filter.as_ref())?
            }
            PlanNode::CreateTable { table, columns } => {
                self.execute_create_table(txid, table, columns)?
            }
            PlanNode::DropTable { table, if_exists } => {
                self.execute_drop_table(txid, table, *if_exists)?
            }
        };

        Ok(ExecOutcome::Completed(result.in_transaction(txid)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ccm::{self, ProtocolKind};
    use crate::planner::Planner;
    use crate::storage::FileStore;
    use crate::types::Value;
    use tempfile::{tempdir, TempDir};

    fn setup() -> (Executor, Arc<dyn ConcurrencyControl>, TempDir) {
        let dir = tempdir().unwrap();
        let storage = Arc::new(FileStore::open(dir.path().to_path_buf()).unwrap());
        let ccm = ccm::build(ProtocolKind::LockBased);
        let wal = Arc::new(
            WalManager::open(&dir.path().to_path_buf(), 1, 1000).unwrap(),
        );
        (
            Executor::new(storage, Arc::clone(&ccm), wal),
            ccm,
            dir,
        )
    }

    fn run(executor: &Executor, ccm: &Arc<dyn ConcurrencyControl>, sql: &str) -> ExecutionResult {
        let txid = ccm.begin();
        let plan = Planner::plan(sql).unwrap();
        let result = match executor.execute(&plan, txid).unwrap() {
            ExecOutcome::Completed(r) => r,
            ExecOutcome::Blocked { .. } => panic!("unexpected block"),
        };
        ccm.commit(txid).unwrap();
        ccm.commit_flushed(txid).unwrap();
        ccm.end(txid).unwrap();
        result
    }

    #[test]
    fn test_create_insert_select_round_trip() {
        let (executor, ccm, _dir) = setup();

        run(&executor, &ccm, "CREATE TABLE users (id INT, name VARCHAR(50))");
        run(&executor, &ccm, "INSERT INTO users VALUES (1, 'Alice')");
        run(&executor, &ccm, "INSERT INTO users VALUES (2, 'Bob')");

        let result = run(&executor, &ccm, "SELECT * FROM users");
        let rows = result.rows.unwrap();
        assert_eq!(rows.columns, vec!["id", "name"]);
        assert_eq!(
            rows.data,
            vec![
                vec![Value::Int(1), Value::Text("Alice".into())],
                vec![Value::Int(2), Value::Text("Bob".into())],
            ]
        );
    }

    #[test]
    fn test_where_order_limit() {
        let (executor, ccm, _dir) = setup();
        run(&executor, &ccm, "CREATE TABLE n (v INT)");
        for v in [5, 3, 9, 1, 7] {
            run(&executor, &ccm, &format!("INSERT INTO n VALUES ({})", v));
        }

        let result = run(
            &executor,
            &ccm,
            "SELECT v FROM n WHERE v > 2 ORDER BY v DESC LIMIT 2",
        );
        let rows = result.rows.unwrap();
        assert_eq!(rows.data, vec![vec![Value::Int(9)], vec![Value::Int(7)]]);
    }

    #[test]
    fn test_join_on_condition() {
        let (executor, ccm, _dir) = setup();
        run(&executor, &ccm, "CREATE TABLE users (id INT, name VARCHAR(20))");
        run(&executor, &ccm, "CREATE TABLE orders (user_id INT, total INT)");
        run(&executor, &ccm, "INSERT INTO users VALUES (1, 'Alice')");
        run(&executor, &ccm, "INSERT INTO users VALUES (2, 'Bob')");
        run(&executor, &ccm, "INSERT INTO orders VALUES (1, 100)");
        run(&executor, &ccm, "INSERT INTO orders VALUES (1, 50)");

        let result = run(
            &executor,
            &ccm,
            "SELECT users.name, orders.total FROM users JOIN orders ON users.id = orders.user_id",
        );
        let rows = result.rows.unwrap();
        assert_eq!(rows.columns, vec!["users.name", "orders.total"]);
        assert_eq!(rows.data.len(), 2);
        assert!(rows
            .data
            .iter()
            .all(|r| r[0] == Value::Text("Alice".into())));
    }

    #[test]
    fn test_update_with_arithmetic_and_where() {
        let (executor, ccm, _dir) = setup();
        run(&executor, &ccm, "CREATE TABLE products (id INT, price INT)");
        run(&executor, &ccm, "INSERT INTO products VALUES (1, 100)");
        run(&executor, &ccm, "INSERT INTO products VALUES (2, 200)");

        let result = run(
            &executor,
            &ccm,
            "UPDATE products SET price = 2 * price + 10 WHERE id = 1",
        );
        assert_eq!(result.affected_rows, Some(1));

        let rows = run(&executor, &ccm, "SELECT price FROM products ORDER BY id")
            .rows
            .unwrap();
        assert_eq!(rows.data, vec![vec![Value::Int(210)], vec![Value::Int(200)]]);
    }

    #[test]
    fn test_delete_with_where() {
        let (executor, ccm, _dir) = setup();
        run(&executor, &ccm, "CREATE TABLE t (v INT)");
        for v in 1..=5 {
            run(&executor, &ccm, &format!("INSERT INTO t VALUES ({})", v));
        }

        let result = run(&executor, &ccm, "DELETE FROM t WHERE v BETWEEN 2 AND 4");
        assert_eq!(result.affected_rows, Some(3));
        let rows = run(&executor, &ccm, "SELECT * FROM t").rows.unwrap();
        assert_eq!(rows.data, vec![vec![Value::Int(1)], vec![Value::Int(5)]]);
    }

    #[test]
    fn test_drop_if_exists_never_fails() {
        let (executor, ccm, _dir) = setup();
        let result = run(&executor, &ccm, "DROP TABLE IF EXISTS ghost");
        assert!(result.success);

        let txid = ccm.begin();
        let plan = Planner::plan("DROP TABLE ghost").unwrap();
        assert!(executor.execute(&plan, txid).is_err());
    }

    #[test]
    fn test_blocked_execution_touches_nothing() {
        let (executor, ccm, _dir) = setup();
        run(&executor, &ccm, "CREATE TABLE t (v INT)");
        run(&executor, &ccm, "INSERT INTO t VALUES (1)");

        let older = ccm.begin();
        let younger = ccm.begin();
        // Younger takes the write lock first.
        let plan = Planner::plan("UPDATE t SET v = 2").unwrap();
        assert!(matches!(
            executor.execute(&plan, younger).unwrap(),
            ExecOutcome::Completed(_)
        ));

        // Older blocks; the table is unchanged.
        let outcome = executor
            .execute(&Planner::plan("UPDATE t SET v = 3").unwrap(), older)
            .unwrap();
        assert!(matches!(outcome, ExecOutcome::Blocked { .. }));
    }

    #[test]
    fn test_failed_lock_surfaces_reason() {
        let (executor, ccm, _dir) = setup();
        run(&executor, &ccm, "CREATE TABLE t (v INT)");

        let older = ccm.begin();
        let younger = ccm.begin();
        let plan = Planner::plan("UPDATE t SET v = 1").unwrap();
        assert!(matches!(
            executor.execute(&plan, older).unwrap(),
            ExecOutcome::Completed(_)
        ));

        let err = executor.execute(&plan, younger).unwrap_err();
        assert_eq!(err.to_string(), "wait-die: die");
    }

    #[test]
    fn test_insert_with_column_list_reorders() {
        let (executor, ccm, _dir) = setup();
        run(&executor, &ccm, "CREATE TABLE t (id INT, name VARCHAR(10))");
        run(
            &executor,
            &ccm,
            "INSERT INTO t (name, id) VALUES ('Alice', 7)",
        );

        let rows = run(&executor, &ccm, "SELECT * FROM t").rows.unwrap();
        assert_eq!(rows.data, vec![vec![Value::Int(7), Value::Text("Alice".into())]]);
    }
}
