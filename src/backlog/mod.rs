//! Backlog Module
//!
//! Durable per-backend queues of statements withheld from backends that were
//! unreachable when the statements were issued. Statements are replayed in
//! FIFO order once the backend is reachable again.

mod store;

pub use store::BacklogStore;

use serde::{Deserialize, Serialize};

use crate::backend::Value;

/// A statement waiting to be executed, with its bind values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingStatement {
    pub query: String,
    pub parameters: Option<Vec<Value>>,
}

impl PendingStatement {
    pub fn new(query: impl Into<String>, parameters: Option<Vec<Value>>) -> Self {
        Self {
            query: query.into(),
            parameters,
        }
    }

    /// Parameters to bind, `None` when the statement runs unparameterized
    pub fn parameters(&self) -> Option<&[Value]> {
        self.parameters.as_deref()
    }
}

/// On-disk form of the backlog: one queue per configured backend, in
/// configuration order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BacklogSnapshot {
    pub queues: Vec<Vec<PendingStatement>>,
}

impl BacklogSnapshot {
    /// Empty snapshot for `backends` backends
    pub fn empty(backends: usize) -> Self {
        Self {
            queues: vec![Vec::new(); backends],
        }
    }

    /// Total number of pending statements across all backends
    pub fn total_pending(&self) -> usize {
        self.queues.iter().map(Vec::len).sum()
    }
}
