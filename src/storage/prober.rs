//! Background storage health prober.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{self, MissedTickBehavior};

use crate::context::CallContext;
use crate::storage::hybrid::HybridStorage;

pub struct StorageProber {
    storage: Arc<HybridStorage>,
    interval: Duration,
}

impl StorageProber {
    pub fn new(storage: Arc<HybridStorage>, interval: Duration) -> Self {
        Self { storage, interval }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(interval = ?self.interval, "Storage prober starting");

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Drivers bound each ping by their endpoint timeout, which
                    // may exceed the interval.
                    let ctx = CallContext::background();
                    tokio::select! {
                        _ = self.storage.probe_once(&ctx) => {}
                        _ = shutdown.recv() => {
                            ctx.token().cancel();
                            tracing::info!("Storage prober received shutdown signal, exiting loop");
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Storage prober received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}
