//! Core types for Basalt
//!
//! Defines SQL data types, values, table schemas, rows, and the execution
//! result surfaced to clients.

use crate::ccm::TxnId;
use crate::error::{BasaltError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// SQL data types supported by Basalt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    /// 32-bit signed integer (packed as i32 LE on disk)
    Int,
    /// 32-bit floating point (packed as f32 LE on disk)
    Float,
    /// Fixed-length string, NUL-padded to `n` bytes
    Char(u16),
    /// Variable-length string with max length `n`
    Varchar(u16),
}

impl DataType {
    /// Coerce a value into this column type. Ints widen to floats for FLOAT
    /// columns; over-long strings are truncated to the declared length.
    /// The on-disk format has no null encoding, so NULL is rejected here.
    pub fn coerce(&self, value: Value) -> Result<Value> {
        match (self, value) {
            (_, Value::Null) => Err(BasaltError::Type(format!(
                "NULL is not storable in a {} column",
                self
            ))),
            (DataType::Int, Value::Int(i)) => {
                if i < i32::MIN as i64 || i > i32::MAX as i64 {
                    return Err(BasaltError::Type(format!("INT value {} out of range", i)));
                }
                Ok(Value::Int(i))
            }
            (DataType::Float, Value::Int(i)) => Ok(Value::Float(i as f64)),
            (DataType::Float, Value::Float(f)) => Ok(Value::Float(f)),
            (DataType::Char(n), Value::Text(s)) | (DataType::Varchar(n), Value::Text(s)) => {
                let n = *n as usize;
                if s.len() > n {
                    let mut truncated = s;
                    truncated.truncate(n);
                    Ok(Value::Text(truncated))
                } else {
                    Ok(Value::Text(s))
                }
            }
            (_, other) => Err(BasaltError::Type(format!(
                "cannot store {} in a {} column",
                other.type_name(),
                self
            ))),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Int => write!(f, "INT"),
            DataType::Float => write!(f, "FLOAT"),
            DataType::Char(n) => write!(f, "CHAR({})", n),
            DataType::Varchar(n) => write!(f, "VARCHAR({})", n),
        }
    }
}

/// A SQL value
///
/// Untagged so wire rows serialize as plain JSON scalars.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// NULL value
    Null,
    /// Integer value
    Int(i64),
    /// Float value
    Float(f64),
    /// String value
    Text(String),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            // Cross-type numeric comparison
            (Value::Int(a), Value::Float(b)) => (*a as f64) == *b,
            (Value::Float(a), Value::Int(b)) => *a == (*b as f64),
            _ => false,
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            // NULLs compare equal and sort before any other value
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Null, _) => Some(Ordering::Less),
            (_, Value::Null) => Some(Ordering::Greater),
            (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{}", v),
        }
    }
}

impl Value {
    /// Check if the value is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short type name for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Int(_) => "INT",
            Value::Float(_) => "FLOAT",
            Value::Text(_) => "TEXT",
        }
    }
}

/// A column definition in a table schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name
    pub name: String,
    /// Column data type
    pub data_type: DataType,
}

/// Table schema definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name
    pub name: String,
    /// Column definitions
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    /// Find a column by name, returning its index
    pub fn find_column(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Get column names
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// A stored row with its internal id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Row {
    /// Internal row id (per-table, monotonic, assigned by slot order)
    pub id: u64,
    /// Column values in schema order
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(id: u64, values: Vec<Value>) -> Self {
        Self { id, values }
    }
}

/// A result set: ordered column names plus rows of values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rows {
    /// Column names
    pub columns: Vec<String>,
    /// Rows of data
    pub data: Vec<Vec<Value>>,
}

impl Rows {
    pub fn new(columns: Vec<String>, data: Vec<Vec<Value>>) -> Self {
        Self { columns, data }
    }

    pub fn empty() -> Self {
        Self {
            columns: vec![],
            data: vec![],
        }
    }
}

/// Result of executing one statement or transaction command
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Whether the operation succeeded
    pub success: bool,
    /// Human-readable success message
    pub message: Option<String>,
    /// Error message on failure
    pub error: Option<String>,
    /// Result set (SELECT only)
    pub rows: Option<Rows>,
    /// Affected row count (DML only)
    pub affected_rows: Option<u64>,
    /// Transaction the statement ran under
    pub transaction_id: Option<TxnId>,
}

impl ExecutionResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            error: None,
            rows: None,
            affected_rows: None,
            transaction_id: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(error.into()),
            rows: None,
            affected_rows: None,
            transaction_id: None,
        }
    }

    pub fn with_rows(rows: Rows) -> Self {
        Self {
            success: true,
            message: None,
            error: None,
            rows: Some(rows),
            affected_rows: None,
            transaction_id: None,
        }
    }

    pub fn with_affected(affected: u64, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            error: None,
            rows: None,
            affected_rows: Some(affected),
            transaction_id: None,
        }
    }

    pub fn in_transaction(mut self, txid: TxnId) -> Self {
        self.transaction_id = Some(txid);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_equality() {
        assert_eq!(Value::Int(1), Value::Int(1));
        assert_ne!(Value::Int(1), Value::Int(2));
        assert_eq!(Value::Float(1.5), Value::Float(1.5));
        assert_eq!(Value::Text("hi".into()), Value::Text("hi".into()));
        assert_eq!(Value::Null, Value::Null);

        // Cross-type numeric comparison
        assert_eq!(Value::Int(1), Value::Float(1.0));
        assert_ne!(Value::Int(1), Value::Text("1".into()));
    }

    #[test]
    fn test_value_ordering_nulls_first() {
        assert!(Value::Int(1) < Value::Int(2));
        assert!(Value::Int(1) < Value::Float(1.5));
        assert!(Value::Null < Value::Int(i64::MIN));
        assert!(Value::Null < Value::Text("".into()));
        assert_eq!(
            Value::Null.partial_cmp(&Value::Null),
            Some(Ordering::Equal)
        );
    }

    #[test]
    fn test_value_json_is_scalar() {
        assert_eq!(serde_json::to_string(&Value::Int(42)).unwrap(), "42");
        assert_eq!(
            serde_json::to_string(&Value::Text("Alice".into())).unwrap(),
            "\"Alice\""
        );
        assert_eq!(serde_json::to_string(&Value::Null).unwrap(), "null");

        let v: Value = serde_json::from_str("1.5").unwrap();
        assert_eq!(v, Value::Float(1.5));
        let v: Value = serde_json::from_str("7").unwrap();
        assert_eq!(v, Value::Int(7));
    }

    #[test]
    fn test_coerce_int_range() {
        assert!(DataType::Int.coerce(Value::Int(1 << 40)).is_err());
        assert_eq!(
            DataType::Int.coerce(Value::Int(42)).unwrap(),
            Value::Int(42)
        );
        assert_eq!(
            DataType::Float.coerce(Value::Int(2)).unwrap(),
            Value::Float(2.0)
        );
    }

    #[test]
    fn test_coerce_truncates_long_strings() {
        let v = DataType::Varchar(3)
            .coerce(Value::Text("abcdef".into()))
            .unwrap();
        assert_eq!(v, Value::Text("abc".into()));
        assert!(DataType::Char(4).coerce(Value::Int(1)).is_err());
        assert!(DataType::Int.coerce(Value::Null).is_err());
    }

}
