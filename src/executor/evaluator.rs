//! Predicate and scalar expression evaluation
//!
//! Predicates evaluate over one row given its column names. A column
//! reference resolves by exact name first, then by unique unqualified
//! suffix, so `id` finds `users.id` in a join row as long as only one
//! table has an `id` column. A reference that cannot be resolved makes
//! the predicate false rather than erroring, mirroring how WHERE treats
//! missing columns; scalar expressions (UPDATE SET) are stricter and
//! error on unknown columns.

use crate::error::{BasaltError, Result};
use crate::planner::{ArithOp, CompareOp, Operand, Predicate, ScalarExpr};
use crate::types::Value;

/// Resolve a column reference against a row's column names.
pub fn resolve_column(columns: &[String], name: &str) -> Option<usize> {
    if let Some(idx) = columns.iter().position(|c| c.eq_ignore_ascii_case(name)) {
        return Some(idx);
    }
    match name.rsplit_once('.') {
        // Unqualified reference against qualified columns: a unique
        // `.name` suffix wins.
        None => {
            let suffix = format!(".{}", name.to_ascii_lowercase());
            let mut found = None;
            for (idx, col) in columns.iter().enumerate() {
                if col.to_ascii_lowercase().ends_with(&suffix) {
                    if found.is_some() {
                        return None; // ambiguous
                    }
                    found = Some(idx);
                }
            }
            found
        }
        // Qualified reference against plain columns (single-table query
        // written with a table prefix): match the bare name.
        Some((_, bare)) => {
            let mut found = None;
            for (idx, col) in columns.iter().enumerate() {
                if !col.contains('.') && col.eq_ignore_ascii_case(bare) {
                    if found.is_some() {
                        return None;
                    }
                    found = Some(idx);
                }
            }
            found
        }
    }
}

/// Evaluate a predicate over one row.
pub fn eval_predicate(pred: &Predicate, columns: &[String], row: &[Value]) -> bool {
    match pred {
        Predicate::Compare { column, op, value } => {
            let left = match resolve_column(columns, column) {
                Some(idx) => &row[idx],
                None => return false,
            };
            let right = match value {
                Operand::Literal(v) => v,
                Operand::ColumnRef(name) => match resolve_column(columns, name) {
                    Some(idx) => &row[idx],
                    None => return false,
                },
            };
            compare(left, *op, right)
        }
        Predicate::Like { column, pattern } => match resolve_column(columns, column) {
            Some(idx) => like_match(&row[idx].to_string(), pattern),
            None => false,
        },
        Predicate::In { column, list } => match resolve_column(columns, column) {
            Some(idx) => list.iter().any(|v| *v == row[idx]),
            None => false,
        },
        Predicate::Between { column, low, high } => match resolve_column(columns, column) {
            Some(idx) => {
                compare(&row[idx], CompareOp::Ge, low) && compare(&row[idx], CompareOp::Le, high)
            }
            None => false,
        },
        Predicate::IsNull { column, negated } => match resolve_column(columns, column) {
            Some(idx) => row[idx].is_null() != *negated,
            None => false,
        },
        Predicate::And(parts) => parts.iter().all(|p| eval_predicate(p, columns, row)),
        Predicate::Or(parts) => parts.iter().any(|p| eval_predicate(p, columns, row)),
        Predicate::Not(inner) => !eval_predicate(inner, columns, row),
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> bool {
    match op {
        CompareOp::Eq => left == right,
        CompareOp::NotEq => left != right,
        CompareOp::Gt => matches!(left.partial_cmp(right), Some(std::cmp::Ordering::Greater)),
        CompareOp::Ge => matches!(
            left.partial_cmp(right),
            Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
        ),
        CompareOp::Lt => matches!(left.partial_cmp(right), Some(std::cmp::Ordering::Less)),
        CompareOp::Le => matches!(
            left.partial_cmp(right),
            Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
        ),
    }
}

/// SQL LIKE: `%` matches any run, `_` any single character. Full-string.
pub fn like_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pat: Vec<char> = pattern.chars().collect();
    like_rec(&text, &pat)
}

fn like_rec(text: &[char], pat: &[char]) -> bool {
    match pat.first() {
        None => text.is_empty(),
        Some('%') => (0..=text.len()).any(|i| like_rec(&text[i..], &pat[1..])),
        Some('_') => !text.is_empty() && like_rec(&text[1..], &pat[1..]),
        Some(c) => text.first() == Some(c) && like_rec(&text[1..], &pat[1..]),
    }
}

/// Evaluate a scalar SET expression over one row.
pub fn eval_scalar(expr: &ScalarExpr, columns: &[String], row: &[Value]) -> Result<Value> {
    match expr {
        ScalarExpr::Literal(v) => Ok(v.clone()),
        ScalarExpr::Column(name) => match resolve_column(columns, name) {
            Some(idx) => Ok(row[idx].clone()),
            None => Err(BasaltError::unknown_column(name)),
        },
        ScalarExpr::Binary { op, left, right } => {
            let l = eval_scalar(left, columns, row)?;
            let r = eval_scalar(right, columns, row)?;
            arith(*op, l, r)
        }
    }
}

fn arith(op: ArithOp, left: Value, right: Value) -> Result<Value> {
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => match op {
            ArithOp::Add => Ok(Value::Int(a + b)),
            ArithOp::Sub => Ok(Value::Int(a - b)),
            ArithOp::Mul => Ok(Value::Int(a * b)),
            ArithOp::Div => {
                if b == 0 {
                    Err(BasaltError::Type("division by zero".into()))
                } else {
                    Ok(Value::Int(a / b))
                }
            }
        },
        (a, b) => {
            let to_f = |v: Value| -> Result<f64> {
                match v {
                    Value::Int(i) => Ok(i as f64),
                    Value::Float(f) => Ok(f),
                    other => Err(BasaltError::Type(format!(
                        "arithmetic on {} value",
                        other.type_name()
                    ))),
                }
            };
            let a = to_f(a)?;
            let b = to_f(b)?;
            match op {
                ArithOp::Add => Ok(Value::Float(a + b)),
                ArithOp::Sub => Ok(Value::Float(a - b)),
                ArithOp::Mul => Ok(Value::Float(a * b)),
                ArithOp::Div => {
                    if b == 0.0 {
                        Err(BasaltError::Type("division by zero".into()))
                    } else {
                        Ok(Value::Float(a / b))
                    }
                }
            }
        }
    }
}
