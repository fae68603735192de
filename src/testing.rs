//! In-memory backends for tests
//!
//! Every statement a backend executes is recorded. Backends can be taken
//! down (connects and statements fail) or made to reject statements.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::backend::{BackendConnection, Connector, QueryResult, Row, Value};
use crate::config::{BackendConfig, BacklogConfig, BalancerConfig, LoggingConfig, RoutingConfig};
use crate::error::{Error, Result};

#[derive(Default)]
struct ClusterState {
    reachable: Vec<bool>,
    failing: Vec<bool>,
    executed: Vec<Vec<String>>,
    connects: Vec<usize>,
}

/// Scripted set of backends shared by a connector and the test body
#[derive(Clone)]
pub(crate) struct MockCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MockCluster {
    pub fn new(backends: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClusterState {
                reachable: vec![true; backends],
                failing: vec![false; backends],
                executed: vec![Vec::new(); backends],
                connects: vec![0; backends],
            })),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector { cluster: self.clone() })
    }

    pub fn set_reachable(&self, index: usize, reachable: bool) {
        self.state.lock().unwrap().reachable[index] = reachable;
    }

    pub fn set_failing(&self, index: usize, failing: bool) {
        self.state.lock().unwrap().failing[index] = failing;
    }

    /// Statements executed by one backend, in execution order
    pub fn executed(&self, index: usize) -> Vec<String> {
        self.state.lock().unwrap().executed[index].clone()
    }

    /// Total number of statements executed by all backends
    pub fn total_executed(&self) -> usize {
        self.state.lock().unwrap().executed.iter().map(Vec::len).sum()
    }

    pub fn connects(&self, index: usize) -> usize {
        self.state.lock().unwrap().connects[index]
    }
}

struct MockConnector {
    cluster: MockCluster,
}

#[async_trait::async_trait]
impl Connector for MockConnector {
    async fn connect(&self, index: usize, config: &BackendConfig) -> Result<Box<dyn BackendConnection>> {
        let mut state = self.cluster.state.lock().unwrap();
        state.connects[index] += 1;
        if !state.reachable[index] {
            return Err(Error::ConnectionFailed {
                address: config.display_target(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(Box::new(MockConnection {
            index,
            cluster: self.cluster.clone(),
        }))
    }
}

struct MockConnection {
    index: usize,
    cluster: MockCluster,
}

#[async_trait::async_trait]
impl BackendConnection for MockConnection {
    async fn execute(&mut self, query: &str, _parameters: Option<&[Value]>) -> Result<QueryResult> {
        // let fan-out siblings interleave
        tokio::task::yield_now().await;

        let mut state = self.cluster.state.lock().unwrap();
        if !state.reachable[self.index] {
            return Err(Error::BackendUnavailable(self.index));
        }
        if state.failing[self.index] {
            return Err(Error::QueryExecution {
                backend: self.index,
                reason: format!("rejected: {}", query),
            });
        }
        state.executed[self.index].push(query.to_string());

        Ok(QueryResult {
            rows_affected: 1,
            rows: vec![Row {
                columns: vec![("backend".to_string(), Value::Int(self.index as i64))],
            }],
        })
    }
}

/// Backend index that produced a result from a [`MockCluster`]
pub(crate) fn answered_by(result: &QueryResult) -> usize {
    result.rows[0]
        .get("backend")
        .and_then(Value::as_i64)
        .expect("mock result carries the backend index") as usize
}

/// Configuration for `backends` mock backends with the backlog in `dir`
pub(crate) fn test_config(backends: usize, dir: &Path) -> BalancerConfig {
    BalancerConfig {
        backends: (0..backends)
            .map(|i| BackendConfig {
                host: "localhost".to_string(),
                port: 5432,
                database: format!("db{}", i),
                user: "postgres".to_string(),
                password: String::new(),
                connect_timeout_secs: 1,
            })
            .collect(),
        backlog: BacklogConfig {
            path: dir.join("queries.json"),
            flush_interval_ms: 50,
        },
        balancer: RoutingConfig {
            reconnect_interval_ms: Duration::from_secs(3600).as_millis() as u64,
        },
        logging: LoggingConfig::default(),
    }
}
