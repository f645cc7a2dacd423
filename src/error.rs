//! Error types for Basalt
//!
//! Defines a unified error type that can represent errors from all components.
//! Messages are surfaced verbatim to clients in the `error` field of responses.

use std::fmt;
use std::io;

/// Unified error type for Basalt operations
#[derive(Debug)]
pub enum BasaltError {
    /// I/O error (file operations, network)
    Io(io::Error),
    /// SQL syntax error
    Syntax(String),
    /// Table-related error (not found, already exists, etc.)
    Table(String),
    /// Column-related error
    Column(String),
    /// Type error (wrong type for operation)
    Type(String),
    /// Transaction error (not active, died by protocol, validation loss)
    Transaction(String),
    /// Storage engine error
    Storage(String),
    /// Write-ahead log / durability error
    Wal(String),
    /// Wire protocol error (bad framing, unknown request type)
    Protocol(String),
    /// Generic internal error
    Internal(String),
}

impl BasaltError {
    /// "table doesn't exist" error
    pub fn table_not_found(table_name: &str) -> Self {
        BasaltError::Table(format!("Table '{}' doesn't exist", table_name))
    }

    /// "table already exists" error
    pub fn table_already_exists(table_name: &str) -> Self {
        BasaltError::Table(format!("Table '{}' already exists", table_name))
    }

    /// "unknown column" error
    pub fn unknown_column(column_name: &str) -> Self {
        BasaltError::Column(format!("Unknown column '{}'", column_name))
    }

    /// "column count mismatch" error for INSERT
    pub fn column_count_mismatch(expected: usize, got: usize) -> Self {
        BasaltError::Column(format!(
            "Column count doesn't match value count (expected {}, got {})",
            expected, got
        ))
    }

    /// Standard error for commit/rollback against an id the registry no
    /// longer knows (or never knew).
    pub fn transaction_gone() -> Self {
        BasaltError::Transaction("transaction not found or not active".to_string())
    }
}

impl fmt::Display for BasaltError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BasaltError::Io(e) => write!(f, "{}", e),
            BasaltError::Syntax(msg) => write!(f, "{}", msg),
            BasaltError::Table(msg) => write!(f, "{}", msg),
            BasaltError::Column(msg) => write!(f, "{}", msg),
            BasaltError::Type(msg) => write!(f, "{}", msg),
            BasaltError::Transaction(msg) => write!(f, "{}", msg),
            BasaltError::Storage(msg) => write!(f, "{}", msg),
            BasaltError::Wal(msg) => write!(f, "{}", msg),
            BasaltError::Protocol(msg) => write!(f, "{}", msg),
            BasaltError::Internal(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for BasaltError {}

impl From<io::Error> for BasaltError {
    fn from(e: io::Error) -> Self {
        BasaltError::Io(e)
    }
}

impl From<serde_json::Error> for BasaltError {
    fn from(e: serde_json::Error) -> Self {
        BasaltError::Protocol(e.to_string())
    }
}

/// Result type alias for Basalt operations
pub type Result<T> = std::result::Result<T, BasaltError>;
