//! Pooled connection handles.
//!
//! # Responsibilities
//! - Identify connections for tracing and leak tracking
//! - Track per-connection lifecycle metadata (age, last use, use count)
//! - Guarantee a checked-out connection is returned exactly once
//!
//! # Design Decisions
//! - `PooledConnection` is an RAII guard: dropping it without `release`
//!   returns the connection as unhealthy, which covers cancelled futures
//! - The pool's checkout table decides who returns a connection; a handle
//!   reclaimed by the leak reaper is destroyed when it finally comes back

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::pool::manager::PoolInner;
use crate::transport::Connection;

/// Global atomic counter for connection IDs.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle metadata carried alongside a connection.
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    pub id: ConnectionId,
    pub created_at: Instant,
    pub last_used: Instant,
    pub use_count: u64,
}

impl ConnectionMeta {
    pub(crate) fn new() -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            created_at: now,
            last_used: now,
            use_count: 0,
        }
    }

    /// Past max lifetime, or idle for longer than the idle timeout.
    pub fn is_expired(&self, config: &PoolConfig) -> bool {
        self.created_at.elapsed() > config.max_lifetime()
            || self.last_used.elapsed() > config.idle_timeout()
    }
}

/// An exclusively checked-out connection.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    meta: ConnectionMeta,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    pub(crate) fn new(conn: Box<dyn Connection>, meta: ConnectionMeta, pool: Arc<PoolInner>) -> Self {
        Self {
            conn: Some(conn),
            meta,
            pool,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.meta.id
    }

    /// Name of the pool this connection belongs to.
    pub fn pool_name(&self) -> &str {
        self.pool.name()
    }

    pub fn meta(&self) -> &ConnectionMeta {
        &self.meta
    }

    /// Return the connection to its pool.
    ///
    /// Unhealthy connections are destroyed instead of reused.
    pub fn release(mut self, healthy: bool) {
        self.check_in(healthy);
    }

    fn check_in(&mut self, healthy: bool) {
        if let Some(conn) = self.conn.take() {
            self.pool.check_in(conn, self.meta.clone(), healthy);
        }
    }
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        // `conn` is only taken by `check_in`, which consumes the guard.
        match &self.conn {
            Some(conn) => conn.as_ref(),
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.name())
            .field("id", &self.meta.id)
            .field("use_count", &self.meta.use_count)
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.conn.is_some() {
            tracing::debug!(
                pool = %self.pool.name(),
                connection_id = %self.meta.id,
                "Connection dropped without release, discarding as unhealthy"
            );
            self.check_in(false);
        }
    }
}
