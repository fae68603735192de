//! Backend Module
//!
//! Physical connections to the backend databases. The balancer core only
//! sees the [`Connector`] and [`BackendConnection`] traits; the PostgreSQL
//! implementation lives in [`postgres`].

mod postgres;
mod value;

pub use postgres::{PgBackend, PgConnector};
pub use value::Value;

use serde::{Deserialize, Serialize};

use crate::config::BackendConfig;
use crate::error::Result;

/// One decoded result row: column names paired with their values
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Row {
    pub columns: Vec<(String, Value)>,
}

impl Row {
    /// Look up a column by name
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, value)| value)
    }
}

/// Outcome of executing one statement on one backend
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryResult {
    /// Rows affected, as reported by the backend
    pub rows_affected: u64,
    /// Rows returned, if any
    pub rows: Vec<Row>,
}

/// An open connection to a single backend database
#[async_trait::async_trait]
pub trait BackendConnection: Send {
    /// Execute a statement. `None` or an empty slice runs it unparameterized.
    async fn execute(&mut self, query: &str, parameters: Option<&[Value]>) -> Result<QueryResult>;
}

/// Opens connections to configured backends
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Connect to the backend at `index` of the configuration list
    async fn connect(&self, index: usize, config: &BackendConfig) -> Result<Box<dyn BackendConnection>>;
}

/// Parameter slice that should actually be bound, if any
pub(crate) fn bound_parameters(parameters: Option<&[Value]>) -> Option<&[Value]> {
    parameters.filter(|p| !p.is_empty())
}
