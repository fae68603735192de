//! Load Balancer Routing Module
//!
//! Public entry point. Classifies each statement by its SQL verb, triggers
//! reconnection of inactive backends when the reconnect interval elapsed,
//! and drives the transaction state machine. Statements are routed one at a
//! time per load balancer; I/O to the individual backends runs concurrently.

use std::sync::Arc;
use std::time::{Duration, Instant};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::backend::{Connector, PgConnector, QueryResult, Value};
use crate::backlog::{BacklogStore, PendingStatement};
use crate::config::BalancerConfig;
use crate::connection::{ConnectionManager, DispatchStrategy};
use crate::error::Result;
use crate::transaction::{QueryKind, TransactionContext, TransactionState};

/// Statement sent to every backend by [`LoadBalancer::rollback_all`]
const ROLLBACK_ALL: &str = "ROLLBACK;";

/// Entry points the query-issuing client calls into
#[async_trait::async_trait]
pub trait QueryFilter: Send + Sync {
    /// Route one statement with its optional bind values
    async fn process(&self, parameters: Option<Vec<Value>>, query: &str) -> Result<QueryResult>;

    /// Broadcast a session setup statement to every backend
    async fn process_initialization_query(&self, query: &str) -> Result<QueryResult>;
}

/// Routing state owned by one load balancer, mutated one statement at a time
struct Router {
    context: TransactionContext,
    last_reconnect_check: Instant,
}

/// Write-replicating load balancer over the configured backends
pub struct LoadBalancer {
    manager: Arc<ConnectionManager>,
    router: Mutex<Router>,
    reconnect_interval: Duration,
    flusher: JoinHandle<()>,
}

impl LoadBalancer {
    /// Create a load balancer connecting to PostgreSQL backends.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: &BalancerConfig) -> Result<Self> {
        Self::with_connector(config, Arc::new(PgConnector))
    }

    /// Create a load balancer using `connector` to reach the backends.
    ///
    /// The configuration is validated before anything is spawned.
    pub fn with_connector(config: &BalancerConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;

        let backlog = Arc::new(BacklogStore::new(
            config.backlog.path.clone(),
            config.backends.len(),
        ));
        let flusher = backlog.spawn_flusher(config.flush_interval());
        let manager = ConnectionManager::start(config.backends.clone(), connector, backlog);

        tracing::info!(
            "Load balancer started with {} backends, backlog at {:?}",
            config.backends.len(),
            manager.backlog().path()
        );

        Ok(Self {
            manager,
            router: Mutex::new(Router {
                context: TransactionContext::default(),
                last_reconnect_check: Instant::now(),
            }),
            reconnect_interval: config.reconnect_interval(),
            flusher,
        })
    }

    /// Route a statement.
    ///
    /// If the reconnect interval elapsed since the last check, inactive
    /// backends are reconnected first.
    pub async fn process(&self, parameters: Option<Vec<Value>>, query: &str) -> Result<QueryResult> {
        let mut router = self.router.lock().await;

        if router.last_reconnect_check.elapsed() > self.reconnect_interval {
            router.last_reconnect_check = Instant::now();
            self.manager.try_reconnect_inactive().await;
        }

        let kind = QueryKind::classify(query);
        tracing::trace!("Routing {:?} in {:?}: {}", kind, router.context.state, query);

        router
            .context
            .process(kind, &self.manager, PendingStatement::new(query, parameters))
            .await
    }

    /// Broadcast an unparameterized statement to every backend
    pub async fn send_initialization_query(&self, query: &str) -> Result<QueryResult> {
        let _router = self.router.lock().await;
        self.manager
            .send(DispatchStrategy::AllDatabases, &PendingStatement::new(query, None))
            .await
    }

    /// Abandon any open transaction: broadcast `ROLLBACK;` and reset the context
    pub async fn rollback_all(&self) -> Result<QueryResult> {
        let mut router = self.router.lock().await;
        router.context.reset();
        self.manager
            .send(DispatchStrategy::AllDatabases, &PendingStatement::new(ROLLBACK_ALL, None))
            .await
    }

    /// Reconnect inactive backends now, regardless of the interval.
    ///
    /// Returns the indices that came back.
    pub async fn reconnect_inactive(&self) -> Vec<usize> {
        let mut router = self.router.lock().await;
        router.last_reconnect_check = Instant::now();
        self.manager.try_reconnect_inactive().await
    }

    /// Wait until startup connections and catch-up have settled
    pub async fn ready(&self) {
        self.manager.wait_for_initialization().await;
    }

    /// Get stats about the load balancer state
    pub async fn stats(&self) -> LoadBalancerStats {
        let router = self.router.lock().await;
        let membership = self.manager.membership().await;

        LoadBalancerStats {
            state: router.context.state,
            nesting: router.context.nesting,
            queued_statements: router.context.queue.len(),
            active_backends: membership.active,
            inactive_backends: membership.inactive,
            cursor: membership.cursor,
            backlog_lengths: self.manager.backlog().lengths().await,
        }
    }

    /// Stop the periodic flush and write the backlog one last time
    pub async fn shutdown(&self) -> Result<()> {
        self.flusher.abort();
        self.manager.backlog().persist().await?;
        tracing::info!("Load balancer stopped");
        Ok(())
    }
}

impl Drop for LoadBalancer {
    fn drop(&mut self) {
        self.flusher.abort();
    }
}

#[async_trait::async_trait]
impl QueryFilter for LoadBalancer {
    async fn process(&self, parameters: Option<Vec<Value>>, query: &str) -> Result<QueryResult> {
        LoadBalancer::process(self, parameters, query).await
    }

    async fn process_initialization_query(&self, query: &str) -> Result<QueryResult> {
        self.send_initialization_query(query).await
    }
}

/// Statistics about load balancer state
#[derive(Debug, Clone, Serialize)]
pub struct LoadBalancerStats {
    /// Current transaction state
    pub state: TransactionState,
    /// Open transaction nesting depth
    pub nesting: u32,
    /// Statements waiting for promotion replay
    pub queued_statements: usize,
    /// Active backends, in round-robin order
    pub active_backends: Vec<usize>,
    /// Inactive backends
    pub inactive_backends: Vec<usize>,
    /// Round-robin cursor into the active backends
    pub cursor: usize,
    /// Pending backlog length per backend
    pub backlog_lengths: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::BacklogSnapshot;
    use crate::error::Error;
    use crate::testing::{answered_by, test_config, MockCluster};
    use std::collections::HashSet;
    use tempfile::tempdir;

    async fn ok(lb: &LoadBalancer, query: &str) -> QueryResult {
        lb.process(None, query).await.unwrap()
    }

    #[tokio::test]
    async fn test_reads_round_robin_over_active_backends() {
        let dir = tempdir().unwrap();
        let cluster = MockCluster::new(3);
        let lb = LoadBalancer::with_connector(&test_config(3, dir.path()), cluster.connector()).unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(answered_by(&ok(&lb, "SELECT * FROM t").await));
        }
        let distinct: HashSet<usize> = seen.iter().copied().collect();
        assert_eq!(distinct.len(), 3);

        let fourth = answered_by(&ok(&lb, "SELECT * FROM t").await);
        assert_eq!(fourth, seen[0]);
    }

    #[tokio::test]
    async fn test_transaction_promotes_on_first_write() {
        let dir = tempdir().unwrap();
        let cluster = MockCluster::new(3);
        let lb = LoadBalancer::with_connector(&test_config(3, dir.path()), cluster.connector()).unwrap();

        let pinned = answered_by(&ok(&lb, "START TRANSACTION;").await);
        for index in (0..3).filter(|&i| i != pinned) {
            assert!(cluster.executed(index).is_empty());
        }

        ok(&lb, "INSERT INTO t VALUES (1)").await;
        for index in 0..3 {
            assert_eq!(
                cluster.executed(index),
                vec!["START TRANSACTION;", "INSERT INTO t VALUES (1)"],
                "backend {}",
                index
            );
        }

        ok(&lb, "COMMIT;").await;
        for index in 0..3 {
            assert_eq!(cluster.executed(index).last().map(String::as_str), Some("COMMIT;"));
        }

        let stats = lb.stats().await;
        assert_eq!(stats.state, TransactionState::NoTransaction);
        assert_eq!(stats.nesting, 0);
        assert_eq!(stats.queued_statements, 0);
    }

    #[tokio::test]
    async fn test_read_only_transaction_stays_pinned() {
        let dir = tempdir().unwrap();
        let cluster = MockCluster::new(3);
        let lb = LoadBalancer::with_connector(&test_config(3, dir.path()), cluster.connector()).unwrap();

        let pinned = answered_by(&ok(&lb, "START TRANSACTION;").await);
        assert_eq!(answered_by(&ok(&lb, "SELECT 1").await), pinned);
        assert_eq!(answered_by(&ok(&lb, "SELECT 2").await), pinned);
        assert_eq!(answered_by(&ok(&lb, "COMMIT;").await), pinned);

        assert_eq!(cluster.executed(pinned).len(), 4);
        assert_eq!(cluster.total_executed(), 4);
        assert_eq!(lb.stats().await.state, TransactionState::NoTransaction);
    }

    #[tokio::test]
    async fn test_nested_transactions_close_after_matching_commits() {
        let dir = tempdir().unwrap();
        let cluster = MockCluster::new(2);
        let lb = LoadBalancer::with_connector(&test_config(2, dir.path()), cluster.connector()).unwrap();

        let pinned = answered_by(&ok(&lb, "START TRANSACTION;").await);
        ok(&lb, "START TRANSACTION;").await;
        ok(&lb, "COMMIT;").await;

        let stats = lb.stats().await;
        assert_eq!(stats.state, TransactionState::PinnedSingle);
        assert_eq!(stats.nesting, 1);

        ok(&lb, "COMMIT;").await;
        let stats = lb.stats().await;
        assert_eq!(stats.state, TransactionState::NoTransaction);
        assert_eq!(stats.nesting, 0);
        assert_eq!(stats.queued_statements, 0);

        assert_eq!(cluster.executed(pinned).len(), 4);
        assert_eq!(cluster.total_executed(), 4);
    }

    #[tokio::test]
    async fn test_rollback_resets_any_depth() {
        let dir = tempdir().unwrap();
        let cluster = MockCluster::new(2);
        let lb = LoadBalancer::with_connector(&test_config(2, dir.path()), cluster.connector()).unwrap();

        ok(&lb, "START TRANSACTION;").await;
        ok(&lb, "START TRANSACTION;").await;
        ok(&lb, "UPDATE t SET v = 1").await;
        ok(&lb, "START TRANSACTION;").await;
        assert_eq!(lb.stats().await.nesting, 3);

        ok(&lb, "ROLLBACK;").await;
        let stats = lb.stats().await;
        assert_eq!(stats.state, TransactionState::NoTransaction);
        assert_eq!(stats.nesting, 0);
        assert_eq!(stats.queued_statements, 0);
        assert_eq!(cluster.executed(0).last().map(String::as_str), Some("ROLLBACK;"));
        assert_eq!(cluster.executed(1).last().map(String::as_str), Some("ROLLBACK;"));
    }

    #[tokio::test]
    async fn test_first_transaction_pins_after_cursor_advance() {
        let dir = tempdir().unwrap();
        let cluster = MockCluster::new(3);
        let lb = LoadBalancer::with_connector(&test_config(3, dir.path()), cluster.connector()).unwrap();

        // issued before initialization settles
        assert_eq!(answered_by(&ok(&lb, "START TRANSACTION;").await), 1);
        assert_eq!(lb.stats().await.cursor, 1);
    }

    #[tokio::test]
    async fn test_pinned_rollback_stays_on_pinned_backend() {
        let dir = tempdir().unwrap();
        let cluster = MockCluster::new(3);
        let lb = LoadBalancer::with_connector(&test_config(3, dir.path()), cluster.connector()).unwrap();

        let pinned = answered_by(&ok(&lb, "START TRANSACTION;").await);
        assert_eq!(answered_by(&ok(&lb, "SELECT 1").await), pinned);
        assert_eq!(answered_by(&ok(&lb, "ROLLBACK;").await), pinned);

        assert_eq!(cluster.executed(pinned), vec!["START TRANSACTION;", "SELECT 1", "ROLLBACK;"]);
        assert_eq!(cluster.total_executed(), 3);

        let stats = lb.stats().await;
        assert_eq!(stats.state, TransactionState::NoTransaction);
        assert_eq!(stats.nesting, 0);
        assert_eq!(stats.queued_statements, 0);
    }

    #[tokio::test]
    async fn test_promoted_inner_commit_broadcasts_and_stays_open() {
        let dir = tempdir().unwrap();
        let cluster = MockCluster::new(2);
        let lb = LoadBalancer::with_connector(&test_config(2, dir.path()), cluster.connector()).unwrap();

        ok(&lb, "START TRANSACTION;").await;
        ok(&lb, "START TRANSACTION;").await;
        ok(&lb, "UPDATE t SET v = 1").await;
        ok(&lb, "COMMIT;").await;

        for index in 0..2 {
            assert_eq!(cluster.executed(index).last().map(String::as_str), Some("COMMIT;"));
        }
        let stats = lb.stats().await;
        assert_eq!(stats.state, TransactionState::FullyReplicated);
        assert_eq!(stats.nesting, 1);

        ok(&lb, "COMMIT;").await;
        assert_eq!(lb.stats().await.state, TransactionState::NoTransaction);
        for index in 0..2 {
            assert_eq!(
                cluster.executed(index),
                vec!["START TRANSACTION;", "START TRANSACTION;", "UPDATE t SET v = 1", "COMMIT;", "COMMIT;"],
                "backend {}",
                index
            );
        }
    }

    #[tokio::test]
    async fn test_flush_failure_is_non_fatal() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();

        let cluster = MockCluster::new(2);
        cluster.set_reachable(1, false);
        let mut config = test_config(2, dir.path());
        config.backlog.path = blocker.join("queries.json");
        config.backlog.flush_interval_ms = 3_600_000;
        let lb = LoadBalancer::with_connector(&config, cluster.connector()).unwrap();

        ok(&lb, "INSERT INTO t VALUES (1)").await;
        let backlog = lb.manager.backlog();
        assert!(backlog.flush().await.is_err());
        assert!(backlog.is_dirty());

        ok(&lb, "INSERT INTO t VALUES (2)").await;
        ok(&lb, "SELECT 1").await;
        assert_eq!(lb.stats().await.backlog_lengths, vec![0, 2]);
        assert!(lb.shutdown().await.is_err());
        assert!(backlog.is_dirty());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_start() {
        let dir = tempdir().unwrap();
        let cluster = MockCluster::new(2);
        let mut config = test_config(2, dir.path());
        config.backlog.flush_interval_ms = 0;

        assert!(matches!(
            LoadBalancer::with_connector(&config, cluster.connector()),
            Err(Error::Config(_))
        ));
        tokio::task::yield_now().await;
        assert_eq!(cluster.connects(0), 0);
    }

    #[tokio::test]
    async fn test_commit_without_transaction_is_rejected() {
        let dir = tempdir().unwrap();
        let cluster = MockCluster::new(2);
        let lb = LoadBalancer::with_connector(&test_config(2, dir.path()), cluster.connector()).unwrap();

        let err = lb.process(None, "COMMIT;").await.unwrap_err();
        assert!(err.is_protocol_misuse());
        let err = lb.process(None, "ROLLBACK;").await.unwrap_err();
        assert!(matches!(err, Error::TransactionProtocol(_)));

        assert_eq!(cluster.total_executed(), 0);
    }

    #[tokio::test]
    async fn test_backlog_replayed_in_order_on_reconnect() {
        let dir = tempdir().unwrap();
        let cluster = MockCluster::new(3);
        cluster.set_reachable(2, false);
        let lb = LoadBalancer::with_connector(&test_config(3, dir.path()), cluster.connector()).unwrap();

        ok(&lb, "INSERT INTO t VALUES (1)").await;
        ok(&lb, "SELECT * FROM t").await;
        lb.process(Some(vec![Value::Int(2)]), "INSERT INTO t VALUES ($1)").await.unwrap();

        let stats = lb.stats().await;
        assert_eq!(stats.inactive_backends, vec![2]);
        assert_eq!(stats.backlog_lengths, vec![0, 0, 2]);

        cluster.set_reachable(2, true);
        assert_eq!(lb.reconnect_inactive().await, vec![2]);
        assert_eq!(
            cluster.executed(2),
            vec!["INSERT INTO t VALUES (1)", "INSERT INTO t VALUES ($1)"]
        );

        let stats = lb.stats().await;
        assert_eq!(stats.active_backends, vec![0, 1, 2]);
        assert!(stats.inactive_backends.is_empty());
        assert_eq!(stats.backlog_lengths, vec![0, 0, 0]);

        let readers: HashSet<usize> = {
            let mut readers = HashSet::new();
            for _ in 0..3 {
                readers.insert(answered_by(&ok(&lb, "SELECT * FROM t").await));
            }
            readers
        };
        assert!(readers.contains(&2));
    }

    #[tokio::test]
    async fn test_reconnect_triggered_by_elapsed_interval() {
        let dir = tempdir().unwrap();
        let cluster = MockCluster::new(2);
        cluster.set_reachable(1, false);

        let mut config = test_config(2, dir.path());
        config.balancer.reconnect_interval_ms = 1;
        let lb = LoadBalancer::with_connector(&config, cluster.connector()).unwrap();

        ok(&lb, "DELETE FROM t").await;
        assert_eq!(lb.stats().await.backlog_lengths, vec![0, 1]);

        cluster.set_reachable(1, true);
        tokio::time::sleep(Duration::from_millis(5)).await;
        ok(&lb, "SELECT 1").await;

        assert_eq!(cluster.executed(1).first().map(String::as_str), Some("DELETE FROM t"));
        assert_eq!(lb.stats().await.active_backends, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_backlog_persists_across_restart() {
        let dir = tempdir().unwrap();
        let config = test_config(2, dir.path());

        let cluster = MockCluster::new(2);
        cluster.set_reachable(1, false);
        let lb = LoadBalancer::with_connector(&config, cluster.connector()).unwrap();
        ok(&lb, "INSERT INTO t VALUES (1)").await;
        ok(&lb, "INSERT INTO t VALUES (2)").await;
        lb.shutdown().await.unwrap();
        drop(lb);

        let written: BacklogSnapshot =
            serde_json::from_slice(&std::fs::read(&config.backlog.path).unwrap()).unwrap();
        assert_eq!(written.queues[1].len(), 2);

        // backend 1 is still down after the restart
        let cluster = MockCluster::new(2);
        cluster.set_reachable(1, false);
        let lb = LoadBalancer::with_connector(&config, cluster.connector()).unwrap();
        lb.ready().await;
        assert_eq!(lb.stats().await.backlog_lengths, vec![0, 2]);

        // a configuration with a different backend count starts clean
        let dir2 = tempdir().unwrap();
        let mut grown = test_config(3, dir2.path());
        grown.backlog.path = config.backlog.path.clone();
        let lb = LoadBalancer::with_connector(&grown, MockCluster::new(3).connector()).unwrap();
        lb.ready().await;
        assert_eq!(lb.stats().await.backlog_lengths, vec![0, 0, 0]);
    }

    #[tokio::test]
    async fn test_initialization_query_and_rollback_all() {
        let dir = tempdir().unwrap();
        let cluster = MockCluster::new(2);
        let lb = LoadBalancer::with_connector(&test_config(2, dir.path()), cluster.connector()).unwrap();

        lb.send_initialization_query("SET search_path TO app").await.unwrap();
        ok(&lb, "START TRANSACTION;").await;
        lb.rollback_all().await.unwrap();

        for index in 0..2 {
            assert_eq!(cluster.executed(index).first().map(String::as_str), Some("SET search_path TO app"));
            assert_eq!(cluster.executed(index).last().map(String::as_str), Some("ROLLBACK;"));
        }
        assert_eq!(lb.stats().await.state, TransactionState::NoTransaction);
    }

    #[tokio::test]
    async fn test_query_filter_entry_points() {
        let dir = tempdir().unwrap();
        let cluster = MockCluster::new(2);
        let filter: Arc<dyn QueryFilter> = Arc::new(
            LoadBalancer::with_connector(&test_config(2, dir.path()), cluster.connector()).unwrap(),
        );

        filter.process_initialization_query("SET TIME ZONE 'UTC'").await.unwrap();
        let result = filter.process(None, "SELECT 1").await.unwrap();
        assert_eq!(result.rows_affected, 1);
        assert_eq!(cluster.total_executed(), 3);
    }
}
