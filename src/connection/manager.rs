//! Connection Manager
//!
//! One physical connection per configured backend. Startup connects to every
//! backend concurrently while the backlog snapshot loads, then replays each
//! reachable backend's backlog before it joins the active set. Sends wait for
//! that phase to finish.

use std::sync::Arc;
use futures::future::join_all;
use tokio::sync::{watch, Mutex, RwLock};

use super::{DispatchStrategy, Membership};
use crate::backend::{BackendConnection, Connector, QueryResult};
use crate::backlog::{BacklogStore, PendingStatement};
use crate::config::BackendConfig;
use crate::error::{Error, Result};

type Slot = Mutex<Option<Box<dyn BackendConnection>>>;

/// Owner of all backend connections and their backlogs
pub struct ConnectionManager {
    /// Backend targets, in configuration order
    configs: Vec<BackendConfig>,
    /// Opens physical connections
    connector: Arc<dyn Connector>,
    /// Current connection per backend; replaced on reconnect
    connections: Vec<Slot>,
    /// Active/inactive partition and round-robin cursor
    membership: RwLock<Membership>,
    /// Statements pending for inactive backends
    backlog: Arc<BacklogStore>,
    /// Flips to true once initialization has settled
    ready: watch::Sender<bool>,
}

impl ConnectionManager {
    /// Create the manager and spawn its initialization.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        configs: Vec<BackendConfig>,
        connector: Arc<dyn Connector>,
        backlog: Arc<BacklogStore>,
    ) -> Arc<Self> {
        let (ready, _) = watch::channel(false);
        let backends = configs.len();

        let manager = Arc::new(Self {
            connections: (0..backends).map(|_| Mutex::new(None)).collect(),
            configs,
            connector,
            membership: RwLock::new(Membership::new(backends)),
            backlog,
            ready,
        });

        let init = Arc::clone(&manager);
        tokio::spawn(async move { init.initialize().await });

        manager
    }

    async fn initialize(&self) {
        let all: Vec<usize> = (0..self.configs.len()).collect();
        let (connected, ()) = tokio::join!(self.connect_many(&all), self.backlog.restore());
        let online = self.catch_up_many(&connected).await;

        {
            let mut membership = self.membership.write().await;
            for &index in &online {
                membership.activate(index);
            }
            membership.active.sort_unstable();
            tracing::info!(
                "Initialization complete: active backends {:?}, inactive backends {:?}",
                membership.active,
                membership.inactive
            );
        }

        self.ready.send_replace(true);
    }

    /// Wait until startup connections and catch-up have settled
    pub async fn wait_for_initialization(&self) {
        let mut ready = self.ready.subscribe();
        // the sender lives as long as self, so this cannot fail
        let _ = ready.wait_for(|done| *done).await;
    }

    /// Try to reconnect every inactive backend.
    ///
    /// A backend that connects and replays its whole backlog moves to the
    /// active set. Returns the indices that came back.
    pub async fn try_reconnect_inactive(&self) -> Vec<usize> {
        self.wait_for_initialization().await;

        let inactive = self.membership.read().await.inactive.clone();
        if inactive.is_empty() {
            return Vec::new();
        }

        let connected = self.connect_many(&inactive).await;
        let online = self.catch_up_many(&connected).await;

        if !online.is_empty() {
            let mut membership = self.membership.write().await;
            for &index in &online {
                membership.activate(index);
                tracing::info!("Backend {} reconnected and caught up", index);
            }
        }

        online
    }

    /// Open fresh connections to `indices` concurrently, returning those that succeeded
    async fn connect_many(&self, indices: &[usize]) -> Vec<usize> {
        let attempts = indices.iter().map(|&index| async move {
            self.connect_one(index).await.then_some(index)
        });
        join_all(attempts).await.into_iter().flatten().collect()
    }

    async fn connect_one(&self, index: usize) -> bool {
        let config = &self.configs[index];
        let attempt = self.connector.connect(index, config).await;

        let mut slot = self.connections[index].lock().await;
        match attempt {
            Ok(conn) => {
                *slot = Some(conn);
                tracing::info!("Connected to database {} ({})", index, config.display_target());
                true
            }
            Err(e) => {
                *slot = None;
                tracing::warn!("Could not connect to database {}: {}", index, e);
                false
            }
        }
    }

    /// Catch up `indices` concurrently, returning those whose backlog drained
    async fn catch_up_many(&self, indices: &[usize]) -> Vec<usize> {
        let replays = indices.iter().map(|&index| async move {
            match self.catch_up(index).await {
                Ok(()) => Some(index),
                Err(e) => {
                    tracing::warn!("Catch-up of database {} failed, keeping it inactive: {}", index, e);
                    None
                }
            }
        });
        join_all(replays).await.into_iter().flatten().collect()
    }

    /// Replay a backend's backlog in FIFO order, one statement at a time.
    ///
    /// A statement leaves the backlog only after the backend applied it. On
    /// failure the connection is dropped and the rest stays queued.
    pub async fn catch_up(&self, index: usize) -> Result<()> {
        let mut slot = self.connections[index].lock().await;
        let mut replayed = 0usize;

        while let Some(statement) = self.backlog.front(index).await {
            let conn = slot.as_mut().ok_or(Error::BackendUnavailable(index))?;
            if let Err(e) = conn.execute(&statement.query, statement.parameters()).await {
                *slot = None;
                return Err(e);
            }
            self.backlog.pop_front(index).await;
            replayed += 1;
        }

        if replayed > 0 {
            tracing::info!("Database {} caught up: {} backlog statements replayed", index, replayed);
        }
        Ok(())
    }

    /// Execute a statement on one backend's current connection
    pub(crate) async fn execute_on(&self, index: usize, statement: &PendingStatement) -> Result<QueryResult> {
        let mut slot = self.connections[index].lock().await;
        let conn = slot.as_mut().ok_or(Error::BackendUnavailable(index))?;
        conn.execute(&statement.query, statement.parameters()).await
    }

    /// Advance the round-robin cursor, once the active set is known
    pub async fn choose_database(&self) {
        self.wait_for_initialization().await;
        self.membership.write().await.advance();
    }

    /// Send a statement with the given strategy, once initialization is done
    pub async fn send(&self, strategy: DispatchStrategy, statement: &PendingStatement) -> Result<QueryResult> {
        self.wait_for_initialization().await;
        strategy.send(self, statement).await
    }

    /// Record a statement for every currently inactive backend
    pub(crate) async fn store_to_all_inactive(&self, inactive: &[usize], statement: &PendingStatement) {
        self.backlog.append(inactive, statement).await;
    }

    /// Copy of the current membership
    pub async fn membership(&self) -> Membership {
        self.membership.read().await.clone()
    }

    /// Backlog store
    pub fn backlog(&self) -> &Arc<BacklogStore> {
        &self.backlog
    }

    /// Number of configured backends
    pub fn backend_count(&self) -> usize {
        self.configs.len()
    }
}
