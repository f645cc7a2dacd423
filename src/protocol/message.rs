//! Wire request/response schema

use serde::{Deserialize, Serialize};

use crate::ccm::TxnId;
use crate::types::{ExecutionResult, Rows};

/// A client request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Request {
    Begin,
    Execute {
        query: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transaction_id: Option<TxnId>,
    },
    Commit {
        transaction_id: TxnId,
    },
    Rollback {
        transaction_id: TxnId,
    },
    Analyze {
        table_name: String,
    },
    Defragment {
        table_name: String,
    },
}

/// A server response. Clients must be prepared for one unsolicited
/// follow-up response (`retried: true`) per execute that came back with
/// `queued_for_retry: true`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<TxnId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affected_rows: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Rows>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_for_retry: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retried: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_transaction_id: Option<TxnId>,
}

impl Response {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// The immediate reply for a statement parked on a lock conflict.
    pub fn queued(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            queued_for_retry: Some(true),
            message: Some("Query queued for automatic retry".to_string()),
            ..Default::default()
        }
    }

    /// Mark this response as the follow-up delivery of a retried statement.
    pub fn retried(mut self, original_txid: TxnId) -> Self {
        self.retried = Some(true);
        self.original_transaction_id = Some(original_txid);
        self
    }
}

impl From<ExecutionResult> for Response {
    fn from(result: ExecutionResult) -> Self {
        Self {
            success: result.success,
            error: result.error,
            message: result.message,
            transaction_id: result.transaction_id,
            affected_rows: result.affected_rows,
            rows: result.rows,
            ..Default::default()
        }
    }
}
