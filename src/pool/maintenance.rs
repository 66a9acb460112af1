//! Background pool maintenance.
//!
//! # Responsibilities
//! - Reclaim leaked checkouts on every reaper tick
//! - Health-check idle connections on a slower cadence
//! - Publish pool gauges

use tokio::sync::broadcast;
use tokio::time::{self, MissedTickBehavior};

use crate::observability::metrics;
use crate::pool::manager::ConnectionPool;

pub struct PoolMaintenance {
    pool: ConnectionPool,
}

impl PoolMaintenance {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let config = self.pool.config().clone();
        tracing::info!(
            pool = %self.pool.name(),
            reaper_interval = ?config.reaper_interval(),
            health_check_interval = ?config.health_check_interval(),
            "Pool maintenance starting"
        );

        let mut reaper = time::interval(config.reaper_interval());
        reaper.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut health = time::interval(config.health_check_interval());
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = reaper.tick() => {
                    self.pool.reap_leaks();
                    metrics::record_pool_stats(&self.pool.stats());
                }
                _ = health.tick() => {
                    self.pool.check_idle().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!(pool = %self.pool.name(), "Pool maintenance received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::context::CallContext;
    use crate::lifecycle::shutdown::Shutdown;
    use crate::pool::manager::tests::TestFactory;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn reaper_reclaims_leak_within_one_tick() {
        let pool = ConnectionPool::new(
            "api",
            PoolConfig {
                max_size: 1,
                leak_threshold_ms: 200,
                reaper_interval_ms: 50,
                ..Default::default()
            },
            Arc::new(TestFactory::new()),
        );
        let shutdown = Shutdown::new();
        let task = tokio::spawn(PoolMaintenance::new(pool.clone()).run(shutdown.subscribe()));

        let leaked = pool.acquire(&CallContext::background()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200 + 50 + 10)).await;
        assert_eq!(pool.stats().leaked, 1);
        assert_eq!(pool.stats().in_use, 0);

        shutdown.trigger();
        task.await.unwrap();
        drop(leaked);
    }
}
