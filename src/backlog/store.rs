//! Backlog Store
//!
//! In-memory backlog queues with best-effort persistence. The whole
//! snapshot is rewritten on a fixed cadence whenever it changed; a crash
//! between a mutation and the next flush loses that mutation.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::{BacklogSnapshot, PendingStatement};
use crate::error::{Error, Result};

/// Per-backend backlog queues backed by a JSON snapshot file
pub struct BacklogStore {
    /// Snapshot file location
    path: PathBuf,
    /// One FIFO queue per configured backend
    queues: RwLock<Vec<VecDeque<PendingStatement>>>,
    /// Set on every mutation, cleared by a successful flush
    dirty: AtomicBool,
}

impl BacklogStore {
    /// Create a store with an empty queue for each of `backends` backends
    pub fn new(path: PathBuf, backends: usize) -> Self {
        Self {
            path,
            queues: RwLock::new(vec![VecDeque::new(); backends]),
            dirty: AtomicBool::new(false),
        }
    }

    /// Create a store and restore the previous snapshot from `path`
    pub async fn open(path: PathBuf, backends: usize) -> Self {
        let store = Self::new(path, backends);
        store.restore().await;
        store
    }

    /// Replace the in-memory queues with the snapshot on disk.
    ///
    /// A snapshot that cannot be read, or whose queue count differs from the
    /// configured backend count, is discarded and every backlog starts empty.
    pub async fn restore(&self) {
        let backends = self.queues.read().await.len();
        let path = &self.path;

        let restored = match Self::load(path).await {
            Ok(snapshot) if snapshot.queues.len() == backends => {
                if snapshot.total_pending() > 0 {
                    tracing::info!(
                        "Loaded backlog snapshot from {:?}: {} pending statements",
                        path,
                        snapshot.total_pending()
                    );
                }
                Some(snapshot.queues.into_iter().map(VecDeque::from).collect())
            }
            Ok(snapshot) => {
                tracing::warn!(
                    "Backlog snapshot {:?} has {} queues but {} backends are configured, discarding it",
                    path,
                    snapshot.queues.len(),
                    backends
                );
                self.dirty.store(true, Ordering::Release);
                None
            }
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No backlog snapshot at {:?}, starting empty", path);
                None
            }
            Err(e) => {
                tracing::warn!("Error while reading backlog snapshot {:?}: {}", path, e);
                None
            }
        };

        let mut queues = self.queues.write().await;
        *queues = restored.unwrap_or_else(|| vec![VecDeque::new(); backends]);
    }

    async fn load(path: &Path) -> Result<BacklogSnapshot> {
        let content = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// Snapshot file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a statement to the backlog of every backend in `indices`
    pub async fn append(&self, indices: &[usize], statement: &PendingStatement) {
        if indices.is_empty() {
            return;
        }

        let mut queues = self.queues.write().await;
        for &index in indices {
            match queues.get_mut(index) {
                Some(queue) => queue.push_back(statement.clone()),
                None => tracing::error!("Backlog append for unknown backend {}", index),
            }
        }
        self.dirty.store(true, Ordering::Release);
    }

    /// Oldest pending statement for a backend
    pub async fn front(&self, index: usize) -> Option<PendingStatement> {
        let queues = self.queues.read().await;
        queues.get(index).and_then(|queue| queue.front().cloned())
    }

    /// Drop the oldest pending statement for a backend, once it has been applied
    pub async fn pop_front(&self, index: usize) -> Option<PendingStatement> {
        let mut queues = self.queues.write().await;
        let popped = queues.get_mut(index).and_then(VecDeque::pop_front);
        if popped.is_some() {
            self.dirty.store(true, Ordering::Release);
        }
        popped
    }

    /// Number of pending statements for a backend
    pub async fn len(&self, index: usize) -> usize {
        let queues = self.queues.read().await;
        queues.get(index).map(VecDeque::len).unwrap_or(0)
    }

    /// Number of pending statements for every backend, in configuration order
    pub async fn lengths(&self) -> Vec<usize> {
        let queues = self.queues.read().await;
        queues.iter().map(VecDeque::len).collect()
    }

    /// Copy of the current backlog
    pub async fn snapshot(&self) -> BacklogSnapshot {
        let queues = self.queues.read().await;
        BacklogSnapshot {
            queues: queues.iter().map(|q| q.iter().cloned().collect()).collect(),
        }
    }

    /// Whether the backlog changed since the last successful flush
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Write the snapshot if it changed since the last flush.
    ///
    /// Returns whether a write happened.
    pub async fn flush(&self) -> Result<bool> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }

        let snapshot = self.snapshot().await;
        if let Err(e) = write_snapshot(&self.path, &snapshot).await {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }

        tracing::trace!("Backlog snapshot written: {} pending", snapshot.total_pending());
        Ok(true)
    }

    /// Write the snapshot unconditionally
    pub async fn persist(&self) -> Result<()> {
        self.dirty.store(true, Ordering::Release);
        self.flush().await.map(|_| ())
    }

    /// Spawn the periodic flush task.
    ///
    /// The task only holds a weak reference and exits once the store is dropped.
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                if let Err(e) = store.flush().await {
                    tracing::error!("Error while writing backlog to {:?}: {}", store.path(), e);
                }
            }
        })
    }
}

/// Replace the snapshot file wholesale via a temporary file and rename
async fn write_snapshot(path: &Path, snapshot: &BacklogSnapshot) -> Result<()> {
    let content = serde_json::to_vec(snapshot)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, &content).await?;
    tokio::fs::rename(&tmp, path).await.map_err(|e| {
        Error::Backlog(format!("failed to replace {:?}: {}", path, e))
    })?;
    Ok(())
}
