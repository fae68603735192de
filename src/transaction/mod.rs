//! Transaction Module
//!
//! Tracks transaction boundaries so that a client transaction sees a single
//! backend until its first write replicates it to all of them.

mod query;
mod state;

pub use query::QueryKind;
pub use state::{TransactionContext, TransactionState};
