//! Statement classification
//!
//! Statements are classified by their literal leading SQL verb. Matching is
//! case-sensitive and prefix-exact; there is no parsing.

/// Kind of statement, as far as routing is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    StartTransaction,
    Commit,
    Rollback,
    /// `SELECT`, served by a single backend
    NonModifying,
    /// Anything else, replicated to every backend
    Modifying,
}

impl QueryKind {
    /// Classify a statement by its prefix
    pub fn classify(query: &str) -> Self {
        if query.starts_with("START TRANSACTION") {
            QueryKind::StartTransaction
        } else if query.starts_with("COMMIT") {
            QueryKind::Commit
        } else if query.starts_with("ROLLBACK") {
            QueryKind::Rollback
        } else if query.starts_with("SELECT") {
            QueryKind::NonModifying
        } else {
            QueryKind::Modifying
        }
    }
}
