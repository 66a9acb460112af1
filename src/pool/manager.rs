//! Connection pool management.
//!
//! # Responsibilities
//! - Hand out exclusive connections with a bounded wait
//! - Reuse idle connections, create new ones up to `max_size`
//! - Reclaim leaked checkouts and cull unhealthy idle connections
//! - Keep one pool per traffic class

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::config::{PoolConfig, PoolsConfig};
use crate::context::{CallContext, Interrupted};
use crate::observability::metrics;
use crate::pool::connection::{ConnectionId, ConnectionMeta, PooledConnection};
use crate::transport::{
    Connection, ConnectionFactory, HttpConnector, TransportError, UpstreamRequest, UpstreamResponse,
};

/// Traffic shape, used to pick a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficClass {
    /// Short, frequent API calls.
    #[default]
    Api,
    /// Larger, less frequent content transfers.
    Bulk,
}

impl TrafficClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficClass::Api => "api",
            TrafficClass::Bulk => "bulk",
        }
    }
}

impl fmt::Display for TrafficClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by `acquire`.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("connection pool '{pool}' exhausted after waiting {waited:?}")]
    Exhausted { pool: String, waited: Duration },

    #[error("acquire cancelled by caller")]
    Cancelled,

    #[error("connection pool '{0}' is closed")]
    Closed(String),

    #[error("failed to open connection: {0}")]
    Connect(#[from] TransportError),
}

impl From<PoolError> for TransportError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Exhausted { pool, .. } | PoolError::Closed(pool) => {
                TransportError::PoolExhausted(pool)
            }
            PoolError::Cancelled => TransportError::Cancelled,
            PoolError::Connect(e) => e,
        }
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub pool: String,
    pub max_size: usize,
    pub in_use: usize,
    pub idle: usize,
    pub created: u64,
    pub destroyed: u64,
    pub leaked: u64,
}

struct IdleConnection {
    conn: Box<dyn Connection>,
    meta: ConnectionMeta,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<IdleConnection>,
    /// Checkout start time per connection currently handed out.
    checked_out: HashMap<ConnectionId, Instant>,
}

/// Shared pool internals, referenced by every outstanding `PooledConnection`.
pub(crate) struct PoolInner {
    name: String,
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    /// One permit per checkout slot.
    slots: Arc<Semaphore>,
    state: Mutex<PoolState>,
    created: AtomicU64,
    destroyed: AtomicU64,
    leaked: AtomicU64,
}

impl PoolInner {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return a connection. Called exactly once per checkout by the guard.
    pub(crate) fn check_in(&self, conn: Box<dyn Connection>, mut meta: ConnectionMeta, healthy: bool) {
        let discard = {
            let mut state = self.lock_state();
            if state.checked_out.remove(&meta.id).is_none() {
                // Already reclaimed by the leak reaper and counted as destroyed.
                tracing::debug!(
                    pool = %self.name,
                    connection_id = %meta.id,
                    "Late return of reclaimed connection, discarding"
                );
                Some(conn)
            } else {
                self.slots.add_permits(1);
                if healthy
                    && !meta.is_expired(&self.config)
                    && state.idle.len() < self.config.max_size
                {
                    meta.last_used = Instant::now();
                    state.idle.push(IdleConnection { conn, meta });
                    None
                } else {
                    self.destroyed.fetch_add(1, Ordering::Relaxed);
                    Some(conn)
                }
            }
        };
        drop(discard);
    }
}

/// A named pool of reusable connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(name: impl Into<String>, config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_size));
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                config,
                factory,
                slots,
                state: Mutex::new(PoolState::default()),
                created: AtomicU64::new(0),
                destroyed: AtomicU64::new(0),
                leaked: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Check out a connection.
    ///
    /// Waits at most `acquire_timeout` (clamped to the context deadline) for a
    /// free slot, then fails with `PoolError::Exhausted`.
    pub async fn acquire(&self, ctx: &CallContext) -> Result<PooledConnection, PoolError> {
        let inner = &self.inner;
        let started = Instant::now();

        let permit = match ctx
            .run(inner.config.acquire_timeout(), inner.slots.clone().acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed(inner.name.clone())),
            Err(Interrupted::Cancelled) => return Err(PoolError::Cancelled),
            Err(Interrupted::TimedOut) => {
                let waited = started.elapsed();
                tracing::warn!(pool = %inner.name, waited = ?waited, "Connection pool exhausted");
                metrics::record_pool_exhausted(&inner.name);
                return Err(PoolError::Exhausted {
                    pool: inner.name.clone(),
                    waited,
                });
            }
        };

        let (reused, expired) = {
            let mut state = inner.lock_state();
            let mut expired = Vec::new();
            let mut reused = None;
            while let Some(idle) = state.idle.pop() {
                if idle.meta.is_expired(&inner.config) {
                    expired.push(idle);
                } else {
                    state.checked_out.insert(idle.meta.id, Instant::now());
                    reused = Some(idle);
                    break;
                }
            }
            (reused, expired)
        };
        if !expired.is_empty() {
            inner
                .destroyed
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            drop(expired);
        }

        if let Some(IdleConnection { conn, mut meta }) = reused {
            permit.forget();
            meta.last_used = Instant::now();
            meta.use_count += 1;
            return Ok(PooledConnection::new(conn, meta, inner.clone()));
        }

        // The permit is held (not forgotten) while connecting so a cancelled
        // acquire gives the slot back.
        let conn = match ctx
            .run(inner.config.acquire_timeout(), inner.factory.connect())
            .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(PoolError::Connect(e)),
            Err(Interrupted::Cancelled) => return Err(PoolError::Cancelled),
            Err(Interrupted::TimedOut) => {
                return Err(PoolError::Connect(TransportError::Timeout(
                    inner.config.acquire_timeout(),
                )))
            }
        };

        inner.created.fetch_add(1, Ordering::Relaxed);
        let mut meta = ConnectionMeta::new();
        meta.use_count = 1;
        inner.lock_state().checked_out.insert(meta.id, Instant::now());
        permit.forget();

        tracing::debug!(pool = %inner.name, connection_id = %meta.id, "Opened pooled connection");
        Ok(PooledConnection::new(conn, meta, inner.clone()))
    }

    /// Return a connection to the pool.
    pub fn release(&self, conn: PooledConnection, healthy: bool) {
        conn.release(healthy);
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let state = inner.lock_state();
        PoolStats {
            pool: inner.name.clone(),
            max_size: inner.config.max_size,
            in_use: state.checked_out.len(),
            idle: state.idle.len(),
            created: inner.created.load(Ordering::Relaxed),
            destroyed: inner.destroyed.load(Ordering::Relaxed),
            leaked: inner.leaked.load(Ordering::Relaxed),
        }
    }

    /// Reclaim checkouts held longer than the leak threshold.
    ///
    /// Reclaimed connections free their slot immediately and are destroyed
    /// when (if ever) they are returned.
    pub fn reap_leaks(&self) -> usize {
        let inner = &self.inner;
        let threshold = inner.config.leak_threshold();

        let reclaimed: Vec<(ConnectionId, Duration)> = {
            let mut state = inner.lock_state();
            let leaked: Vec<(ConnectionId, Duration)> = state
                .checked_out
                .iter()
                .filter(|(_, since)| since.elapsed() > threshold)
                .map(|(id, since)| (*id, since.elapsed()))
                .collect();
            for (id, _) in &leaked {
                state.checked_out.remove(id);
            }
            if !leaked.is_empty() {
                inner.slots.add_permits(leaked.len());
            }
            leaked
        };

        if reclaimed.is_empty() {
            return 0;
        }

        for (id, held) in &reclaimed {
            tracing::warn!(
                pool = %inner.name,
                connection_id = %id,
                held = ?held,
                "Reclaimed leaked connection"
            );
        }
        let count = reclaimed.len() as u64;
        inner.leaked.fetch_add(count, Ordering::Relaxed);
        inner.destroyed.fetch_add(count, Ordering::Relaxed);
        metrics::record_connection_leaks(&inner.name, count);
        reclaimed.len()
    }

    /// Health-check idle connections, destroying expired or unhealthy ones.
    ///
    /// Checks run without holding the pool lock; idle connections are
    /// temporarily taken out of the free list while they are probed.
    pub async fn check_idle(&self) -> usize {
        let inner = &self.inner;
        let candidates = std::mem::take(&mut inner.lock_state().idle);

        let mut keep = Vec::with_capacity(candidates.len());
        let mut culled = 0usize;
        for idle in candidates {
            if idle.meta.is_expired(&inner.config) || !idle.conn.is_healthy().await {
                culled += 1;
            } else {
                keep.push(idle);
            }
        }

        let overflow = {
            let mut state = inner.lock_state();
            let mut overflow = Vec::new();
            for idle in keep {
                if state.idle.len() < inner.config.max_size {
                    state.idle.push(idle);
                } else {
                    overflow.push(idle);
                }
            }
            overflow
        };
        culled += overflow.len();
        drop(overflow);

        if culled > 0 {
            inner.destroyed.fetch_add(culled as u64, Ordering::Relaxed);
            tracing::debug!(pool = %inner.name, culled, "Culled idle connections");
        }
        culled
    }

    /// Stop handing out connections and drop the idle ones.
    pub fn close(&self) {
        self.inner.slots.close();
        let idle = std::mem::take(&mut self.inner.lock_state().idle);
        self.inner
            .destroyed
            .fetch_add(idle.len() as u64, Ordering::Relaxed);
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.inner.name)
            .field("max_size", &self.inner.config.max_size)
            .finish()
    }
}

/// Owns the per-traffic-class pools.
#[derive(Debug, Clone)]
pub struct PoolManager {
    api: ConnectionPool,
    bulk: ConnectionPool,
}

impl PoolManager {
    /// Build both pools with explicit connection factories.
    pub fn new(
        config: &PoolsConfig,
        api_factory: Arc<dyn ConnectionFactory>,
        bulk_factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        Self {
            api: ConnectionPool::new(TrafficClass::Api.as_str(), config.api.clone(), api_factory),
            bulk: ConnectionPool::new(TrafficClass::Bulk.as_str(), config.bulk.clone(), bulk_factory),
        }
    }

    /// Build both pools backed by HTTP connections.
    pub fn from_config(config: &PoolsConfig) -> Result<Self, TransportError> {
        Ok(Self::new(
            config,
            Arc::new(http_connector(&config.api)?),
            Arc::new(http_connector(&config.bulk)?),
        ))
    }

    pub fn pool(&self, class: TrafficClass) -> &ConnectionPool {
        match class {
            TrafficClass::Api => &self.api,
            TrafficClass::Bulk => &self.bulk,
        }
    }

    /// Look a pool up by name ("api" or "bulk").
    pub fn by_name(&self, name: &str) -> Option<&ConnectionPool> {
        [&self.api, &self.bulk].into_iter().find(|p| p.name() == name)
    }

    pub async fn acquire(
        &self,
        class: TrafficClass,
        ctx: &CallContext,
    ) -> Result<PooledConnection, PoolError> {
        self.pool(class).acquire(ctx).await
    }

    pub fn release(&self, conn: PooledConnection, healthy: bool) {
        conn.release(healthy);
    }

    /// Check out a connection, send one request, and return the connection.
    ///
    /// The connection goes back healthy unless the transport itself failed.
    pub async fn send(
        &self,
        class: TrafficClass,
        ctx: &CallContext,
        request: &UpstreamRequest,
    ) -> Result<UpstreamResponse, TransportError> {
        let conn = self.acquire(class, ctx).await?;
        let result = match ctx.run(request.timeout, conn.send(request)).await {
            Ok(result) => result,
            Err(Interrupted::Cancelled) => Err(TransportError::Cancelled),
            Err(Interrupted::TimedOut) => Err(TransportError::Timeout(ctx.clamp(request.timeout))),
        };
        let healthy = matches!(result, Ok(_) | Err(TransportError::Status { .. }));
        conn.release(healthy);
        result
    }

    pub fn stats(&self, class: TrafficClass) -> PoolStats {
        self.pool(class).stats()
    }

    pub fn all_stats(&self) -> Vec<PoolStats> {
        vec![self.api.stats(), self.bulk.stats()]
    }

    pub fn pools(&self) -> [&ConnectionPool; 2] {
        [&self.api, &self.bulk]
    }

    pub fn close(&self) {
        self.api.close();
        self.bulk.close();
    }
}

fn http_connector(config: &PoolConfig) -> Result<HttpConnector, TransportError> {
    let health_url = config
        .health_check_url
        .as_deref()
        .map(url::Url::parse)
        .transpose()
        .map_err(|e| TransportError::InvalidRequest(format!("health_check_url: {e}")))?;
    Ok(HttpConnector::new(config.acquire_timeout(), config.idle_timeout(), config.max_size)?
        .with_health_url(health_url))
}
