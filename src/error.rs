//! WolfBalance Error Types

use thiserror::Error;

/// Result type alias for WolfBalance operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfBalance error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Query execution failed on backend {backend}: {reason}")]
    QueryExecution { backend: usize, reason: String },

    #[error("Type conversion error: {0}")]
    TypeConversion(String),

    // Connection errors
    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // Routing errors
    #[error("No active backend available")]
    NoActiveBackends,

    #[error("Backend {0} has no open connection")]
    BackendUnavailable(usize),

    #[error("All {attempted} targeted backends failed, first error: {first}")]
    AllBackendsFailed { attempted: usize, first: Box<Error> },

    // Transaction errors
    #[error("{0}")]
    TransactionProtocol(String),

    // Backlog persistence errors
    #[error("Backlog error: {0}")]
    Backlog(String),

    #[error("Backlog serialization error: {0}")]
    BacklogSerialization(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error was caused by a misuse of transaction statements
    /// (commit or rollback with no open transaction)
    pub fn is_protocol_misuse(&self) -> bool {
        matches!(self, Error::TransactionProtocol(_))
    }

    /// Check if this error came from a backend rather than from the balancer
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            Error::Database(_)
                | Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
                | Error::QueryExecution { .. }
                | Error::BackendUnavailable(_)
                | Error::AllBackendsFailed { .. }
        )
    }
}
