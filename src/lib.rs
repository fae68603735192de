//! WolfBalance - Write-Replicating Load Balancer
//!
//! An in-process load balancer in front of a set of homogeneous PostgreSQL
//! databases. Every statement issued by the client is routed by its SQL verb:
//! reads go to one backend picked round-robin, writes are replicated to all
//! of them.
//!
//! # Architecture
//!
//! A client transaction is pinned to a single backend until its first write.
//! That write promotes it: the statements run so far are replayed to the
//! other backends and the transaction continues on all of them, so every
//! backend ends up in the same state.
//!
//! # Features
//!
//! - Round-robin reads with read-your-writes inside transactions
//! - Nested `START TRANSACTION` tracking
//! - Durable backlog of statements for unreachable backends
//! - Automatic catch-up replay when a backend reconnects
//! - Opportunistic reconnection driven by query traffic

pub mod config;
pub mod error;
pub mod backend;
pub mod backlog;
pub mod connection;
pub mod transaction;
pub mod lb;

#[cfg(test)]
pub(crate) mod testing;

pub use config::BalancerConfig;
pub use error::{Error, Result};
pub use lb::{LoadBalancer, LoadBalancerStats, QueryFilter};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{BalancerConfig, BackendConfig};
    pub use crate::error::{Error, Result};
    pub use crate::backend::{QueryResult, Row, Value};
    pub use crate::backlog::PendingStatement;
    pub use crate::transaction::TransactionState;
    pub use crate::lb::{LoadBalancer, QueryFilter};
}
