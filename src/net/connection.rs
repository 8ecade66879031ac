//! Connection identity and lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs (the routing registry key)
//! - Count live connection tasks for graceful shutdown
//! - Wait for connections to drain with a deadline

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Tracks live connection tasks so shutdown can wait for them.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    active_count: Arc<AtomicU64>,
    /// Publishes the count every time a guard is dropped.
    changed_tx: Arc<watch::Sender<u64>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            active_count: Arc::new(AtomicU64::new(0)),
            changed_tx: Arc::new(tx),
        }
    }

    /// Record a new connection and assign its ID. The guard decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        let count = self.active_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.changed_tx.send_replace(count);
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            changed_tx: Arc::clone(&self.changed_tx),
            id: ConnectionId::new(),
        }
    }

    /// Get current live connection count.
    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Wait until every tracked connection has finished, or the deadline passes.
    ///
    /// Returns `true` when the count reached zero in time.
    pub async fn wait_for_drain(&self, deadline: Duration) -> bool {
        let mut rx = self.changed_tx.subscribe();
        let active_count = Arc::clone(&self.active_count);
        let drained = async move {
            while active_count.load(Ordering::SeqCst) > 0 {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };
        tokio::time::timeout(deadline, drained).await.is_ok()
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that tracks a connection task's lifetime.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    changed_tx: Arc<watch::Sender<u64>>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let remaining = self.active_count.fetch_sub(1, Ordering::SeqCst) - 1;
        self.changed_tx.send_replace(remaining);
        tracing::trace!(connection_id = %self.id, remaining, "Connection task finished");
    }
}
