//! Dispatch Strategies
//!
//! How a statement reaches the backends: the backend at the cursor, every
//! active backend, or every active backend except the one at the cursor.
//! Fan-out strategies also record the statement for each inactive backend.

use futures::future::join_all;

use super::ConnectionManager;
use crate::backend::QueryResult;
use crate::backlog::PendingStatement;
use crate::error::{Error, Result};

/// Query sending behavior selected by the transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStrategy {
    /// Backend at the round-robin cursor only
    SingleDatabase,
    /// Every active backend; inactive ones get it in their backlog
    AllDatabases,
    /// Every active backend but the one at the cursor, which already has it
    AllExceptOneDatabase,
}

impl DispatchStrategy {
    pub(crate) async fn send(
        self,
        manager: &ConnectionManager,
        statement: &PendingStatement,
    ) -> Result<QueryResult> {
        let membership = manager.membership().await;

        match self {
            DispatchStrategy::SingleDatabase => {
                let index = membership.current().ok_or(Error::NoActiveBackends)?;
                tracing::debug!("Executing on database number {}: {}", index, statement.query);
                manager.execute_on(index, statement).await
            }
            DispatchStrategy::AllDatabases => {
                if membership.active.is_empty() {
                    return Err(Error::NoActiveBackends);
                }
                tracing::debug!("Executing on all databases: {}", statement.query);
                fan_out(manager, &membership.active, &membership.inactive, statement).await
            }
            DispatchStrategy::AllExceptOneDatabase => {
                let pinned = membership.current().ok_or(Error::NoActiveBackends)?;
                tracing::debug!(
                    "Executing on all databases except number {}: {}",
                    pinned,
                    statement.query
                );
                let targets = membership.active_except_current();
                fan_out(manager, &targets, &membership.inactive, statement).await
            }
        }
    }
}

/// Execute on `targets` concurrently and record for `inactive`.
///
/// Waits for every target. Resolves with the first successful result in
/// target order, and fails only if every target failed.
async fn fan_out(
    manager: &ConnectionManager,
    targets: &[usize],
    inactive: &[usize],
    statement: &PendingStatement,
) -> Result<QueryResult> {
    manager.store_to_all_inactive(inactive, statement).await;

    if targets.is_empty() {
        return Ok(QueryResult::default());
    }

    let results = join_all(targets.iter().map(|&index| manager.execute_on(index, statement))).await;

    let mut first_ok = None;
    let mut first_err = None;
    for (&index, result) in targets.iter().zip(results) {
        match result {
            Ok(result) => {
                first_ok.get_or_insert(result);
            }
            Err(e) => {
                tracing::warn!("Database {} failed to execute '{}': {}", index, statement.query, e);
                first_err.get_or_insert(e);
            }
        }
    }

    match (first_ok, first_err) {
        (Some(result), _) => Ok(result),
        (None, first) => Err(Error::AllBackendsFailed {
            attempted: targets.len(),
            first: Box::new(first.unwrap_or(Error::NoActiveBackends)),
        }),
    }
}
