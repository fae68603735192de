//! Connection Module
//!
//! Owns the backend connections, their active/inactive partition, the
//! round-robin cursor and the backlog. Queries are sent through one of the
//! [`DispatchStrategy`] variants.

mod dispatch;
mod manager;

pub use dispatch::DispatchStrategy;
pub use manager::ConnectionManager;

use serde::Serialize;

/// Partition of backend indices by reachability, plus the round-robin cursor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Membership {
    /// Reachable, caught-up backends. Order is the round-robin order.
    pub active: Vec<usize>,
    /// Backends that are unreachable or still behind on their backlog
    pub inactive: Vec<usize>,
    /// Position in `active` of the currently selected backend
    pub cursor: usize,
}

impl Membership {
    /// Every backend starts out inactive until it has connected
    pub fn new(backends: usize) -> Self {
        Self {
            active: Vec::new(),
            inactive: (0..backends).collect(),
            cursor: 0,
        }
    }

    /// Backend index at the cursor
    pub fn current(&self) -> Option<usize> {
        self.active.get(self.cursor).copied()
    }

    /// Advance the cursor modulo the current active set size
    pub fn advance(&mut self) {
        self.cursor += 1;
        if self.cursor >= self.active.len() {
            self.cursor = 0;
        }
    }

    /// Move a backend from the inactive set to the end of the active set
    pub fn activate(&mut self, index: usize) {
        self.inactive.retain(|&i| i != index);
        if !self.active.contains(&index) {
            self.active.push(index);
        }
    }

    /// Active backends other than the one at the cursor
    pub fn active_except_current(&self) -> Vec<usize> {
        self.active
            .iter()
            .enumerate()
            .filter(|&(position, _)| position != self.cursor)
            .map(|(_, &index)| index)
            .collect()
    }
}
