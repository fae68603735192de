//! Transaction States
//!
//! A transaction starts pinned to the backend at the cursor. Its first write
//! promotes it: the queued statements are replayed to every other active
//! backend and from then on everything is broadcast until it closes. Reads
//! always stay on the pinned backend.

use serde::Serialize;

use super::QueryKind;
use crate::backend::QueryResult;
use crate::backlog::PendingStatement;
use crate::connection::{ConnectionManager, DispatchStrategy};
use crate::error::{Error, Result};

use DispatchStrategy::{AllDatabases, AllExceptOneDatabase, SingleDatabase};

/// Transaction state of one load balancer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum TransactionState {
    #[default]
    NoTransaction,
    /// Open transaction executing on the pinned backend only
    PinnedSingle,
    /// Open transaction replicated to every active backend
    FullyReplicated,
}

/// Mutable routing context shared by the transaction states
#[derive(Debug, Default)]
pub struct TransactionContext {
    pub state: TransactionState,
    /// Open `START TRANSACTION` count
    pub nesting: u32,
    /// Statements run on the pinned backend only, replayed on promotion
    pub queue: Vec<PendingStatement>,
}

impl TransactionContext {
    /// Route one classified statement according to the current state
    pub async fn process(
        &mut self,
        kind: QueryKind,
        manager: &ConnectionManager,
        statement: PendingStatement,
    ) -> Result<QueryResult> {
        let state = self.state;
        match kind {
            QueryKind::StartTransaction => state.start_transaction(self, manager, statement).await,
            QueryKind::Commit => state.commit(self, manager, statement).await,
            QueryKind::Rollback => state.rollback(self, manager, statement).await,
            QueryKind::NonModifying => state.non_modifying_query(self, manager, statement).await,
            QueryKind::Modifying => state.modifying_query(self, manager, statement).await,
        }
    }

    /// Drop the transaction queue and close every nesting level
    pub fn clear_queue(&mut self) {
        self.queue.clear();
        self.nesting = 0;
    }

    /// Forget any open transaction
    pub fn reset(&mut self) {
        self.clear_queue();
        self.state = TransactionState::NoTransaction;
    }

    /// Replay the queued statements on every active backend except the pinned one
    async fn send_and_clear_queue(&mut self, manager: &ConnectionManager) -> Result<()> {
        for statement in std::mem::take(&mut self.queue) {
            manager.send(AllExceptOneDatabase, &statement).await?;
        }
        Ok(())
    }
}

impl TransactionState {
    pub async fn non_modifying_query(
        self,
        _ctx: &mut TransactionContext,
        manager: &ConnectionManager,
        statement: PendingStatement,
    ) -> Result<QueryResult> {
        if self == TransactionState::NoTransaction {
            manager.choose_database().await;
        }
        manager.send(SingleDatabase, &statement).await
    }

    pub async fn modifying_query(
        self,
        ctx: &mut TransactionContext,
        manager: &ConnectionManager,
        statement: PendingStatement,
    ) -> Result<QueryResult> {
        if self == TransactionState::PinnedSingle {
            ctx.state = TransactionState::FullyReplicated;
            ctx.send_and_clear_queue(manager).await?;
        }
        manager.send(AllDatabases, &statement).await
    }

    pub async fn start_transaction(
        self,
        ctx: &mut TransactionContext,
        manager: &ConnectionManager,
        statement: PendingStatement,
    ) -> Result<QueryResult> {
        ctx.nesting += 1;
        match self {
            TransactionState::NoTransaction => {
                ctx.state = TransactionState::PinnedSingle;
                ctx.queue.push(statement.clone());
                manager.choose_database().await;
                manager.send(SingleDatabase, &statement).await
            }
            TransactionState::PinnedSingle => {
                ctx.queue.push(statement.clone());
                manager.send(SingleDatabase, &statement).await
            }
            TransactionState::FullyReplicated => manager.send(AllDatabases, &statement).await,
        }
    }

    pub async fn commit(
        self,
        ctx: &mut TransactionContext,
        manager: &ConnectionManager,
        statement: PendingStatement,
    ) -> Result<QueryResult> {
        if self == TransactionState::NoTransaction {
            return Err(Error::TransactionProtocol("Commit while no transaction".into()));
        }

        ctx.nesting = ctx.nesting.saturating_sub(1);
        let closed = ctx.nesting == 0;
        if closed {
            ctx.clear_queue();
            ctx.state = TransactionState::NoTransaction;
        }

        if self == TransactionState::PinnedSingle {
            if !closed {
                ctx.queue.push(statement.clone());
            }
            manager.send(SingleDatabase, &statement).await
        } else {
            manager.send(AllDatabases, &statement).await
        }
    }

    pub async fn rollback(
        self,
        ctx: &mut TransactionContext,
        manager: &ConnectionManager,
        statement: PendingStatement,
    ) -> Result<QueryResult> {
        if self == TransactionState::NoTransaction {
            return Err(Error::TransactionProtocol("Rollback while no transaction".into()));
        }

        ctx.reset();
        let strategy = if self == TransactionState::PinnedSingle {
            SingleDatabase
        } else {
            AllDatabases
        };
        manager.send(strategy, &statement).await
    }
}
