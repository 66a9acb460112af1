//! Connection pooling subsystem.
//!
//! # Data Flow
//! ```text
//! Router / HttpStore
//!     → PoolManager::acquire(TrafficClass, ctx)
//!     → ConnectionPool: wait for a slot (bounded by acquire_timeout)
//!     → reuse idle (LIFO, expired ones destroyed) or open new via factory
//!     → PooledConnection guard (exclusive)
//!     → release(healthy) / drop → back to idle or destroyed
//!
//! Maintenance (maintenance.rs), per pool:
//!     reaper tick  → reclaim checkouts older than leak_threshold
//!     health tick  → probe idle connections, cull failures
//! ```
//!
//! # Design Decisions
//! - A semaphore bounds checkouts; the permit is forgotten once a checkout
//!   is registered and re-added on check-in or leak reclaim
//! - The bookkeeping mutex is never held across I/O
//! - Two pool profiles: `api` (many short-lived) and `bulk` (few long-lived)

pub mod connection;
pub mod maintenance;
pub mod manager;

use tokio::task::JoinHandle;

use crate::lifecycle::shutdown::Shutdown;

pub use connection::{ConnectionId, ConnectionMeta, PooledConnection};
pub use maintenance::PoolMaintenance;
pub use manager::{ConnectionPool, PoolError, PoolManager, PoolStats, TrafficClass};

impl PoolManager {
    /// Spawn one maintenance task per pool.
    pub fn spawn_maintenance(&self, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        self.pools()
            .into_iter()
            .map(|pool| tokio::spawn(PoolMaintenance::new(pool.clone()).run(shutdown.subscribe())))
            .collect()
    }
}
