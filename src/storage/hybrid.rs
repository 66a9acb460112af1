//! Hybrid primary/fallback key-value storage.
//!
//! # Responsibilities
//! - Serve get/set/delete from the primary tier while it is healthy
//! - Fail over to the fallback tier within the same call
//! - Track tier health from breaker state and background probes
//!
//! # Design Decisions
//! - The primary is marked unhealthy when its breaker opens and healthy
//!   again only after a successful probe closes the breaker
//! - Writes during an outage land on the fallback and are never copied back
//! - The fallback is always attempted; there is nothing further to fail over to

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

use crate::config::validation::ValidationError;
use crate::config::{ConfigError, StorageConfig, StoreDriverConfig};
use crate::context::CallContext;
use crate::endpoint::{EndpointId, EndpointRegistry};
use crate::error::GatewayError;
use crate::observability::metrics;
use crate::pool::PoolManager;
use crate::resilience::{classify, BreakerRegistry, CircuitBreaker, CircuitState};
use crate::storage::driver::StorageDriver;
use crate::storage::http::HttpStore;
use crate::storage::memory::MemoryStore;
use crate::storage::status::{StorageBackendStatus, Tier, TierStatus};
use crate::transport::TransportError;

enum StoreOp<'a> {
    Get(&'a str),
    Set(&'a str, Bytes, Option<Duration>),
    Delete(&'a str),
}

impl StoreOp<'_> {
    fn name(&self) -> &'static str {
        match self {
            StoreOp::Get(_) => "get",
            StoreOp::Set(..) => "set",
            StoreOp::Delete(_) => "delete",
        }
    }
}

enum StoreOutput {
    Value(Option<Bytes>),
    Done,
}

/// One storage tier: driver, breaker and health flag.
pub struct StorageTier {
    tier: Tier,
    driver: Arc<dyn StorageDriver>,
    breaker: Arc<CircuitBreaker>,
    status: TierStatus,
}

impl StorageTier {
    pub fn new(tier: Tier, driver: Arc<dyn StorageDriver>, breaker: Arc<CircuitBreaker>) -> Self {
        let status = TierStatus::new(tier, driver.describe());
        Self {
            tier,
            driver,
            breaker,
            status,
        }
    }

    pub fn status(&self) -> StorageBackendStatus {
        self.status.snapshot()
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    async fn call(&self, ctx: &CallContext, op: &StoreOp<'_>) -> Result<StoreOutput, TransportError> {
        match op {
            StoreOp::Get(key) => self.driver.get(ctx, key).await.map(StoreOutput::Value),
            StoreOp::Set(key, value, ttl) => self
                .driver
                .set(ctx, key, value.clone(), *ttl)
                .await
                .map(|()| StoreOutput::Done),
            StoreOp::Delete(key) => self.driver.delete(ctx, key).await.map(|()| StoreOutput::Done),
        }
    }

    fn on_success(&self) {
        self.breaker.record_success();
        self.status.record_success();
    }

    fn on_failure(&self, err: &TransportError) {
        self.breaker.record_failure(classify(err));
        self.status.record_failure();
        if matches!(
            self.breaker.current_state(),
            CircuitState::Open | CircuitState::PermanentlyOpen
        ) {
            self.status.set_healthy(false);
        }
    }
}

pub struct HybridStorage {
    primary: StorageTier,
    fallback: StorageTier,
}

impl HybridStorage {
    pub fn new(primary: StorageTier, fallback: StorageTier) -> Self {
        Self { primary, fallback }
    }

    /// Build both tiers from configuration. Http tiers share the `api` pool;
    /// memory tiers get breakers named `store.primary` / `store.fallback`.
    pub fn from_config(
        config: &StorageConfig,
        endpoints: &EndpointRegistry,
        breakers: &BreakerRegistry,
        pools: &PoolManager,
    ) -> Result<Self, ConfigError> {
        let build = |tier: Tier, driver: &StoreDriverConfig| -> Result<StorageTier, ConfigError> {
            let (driver, breaker_id): (Arc<dyn StorageDriver>, EndpointId) = match driver {
                StoreDriverConfig::Memory => (
                    Arc::new(MemoryStore::new()) as Arc<dyn StorageDriver>,
                    EndpointId::new(format!("store.{}", tier)),
                ),
                StoreDriverConfig::Http { endpoint } => {
                    let id = EndpointId::new(endpoint);
                    let endpoint = endpoints.get(&id).ok_or_else(|| {
                        ConfigError::Validation(vec![ValidationError::new(
                            format!("storage.{}.endpoint", tier),
                            format!("unknown endpoint '{}'", id),
                        )])
                    })?;
                    (Arc::new(HttpStore::new(endpoint, pools.clone())) as Arc<dyn StorageDriver>, id)
                }
            };
            Ok(StorageTier::new(tier, driver, breakers.get(&breaker_id)))
        };

        Ok(Self::new(
            build(Tier::Primary, &config.primary)?,
            build(Tier::Fallback, &config.fallback)?,
        ))
    }

    pub fn tier(&self, tier: Tier) -> &StorageTier {
        match tier {
            Tier::Primary => &self.primary,
            Tier::Fallback => &self.fallback,
        }
    }

    pub async fn get(&self, ctx: &CallContext, key: &str) -> Result<Option<Bytes>, GatewayError> {
        match self.execute(ctx, StoreOp::Get(key)).await? {
            StoreOutput::Value(value) => Ok(value),
            StoreOutput::Done => Ok(None),
        }
    }

    pub async fn set(
        &self,
        ctx: &CallContext,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<(), GatewayError> {
        self.execute(ctx, StoreOp::Set(key, value, ttl)).await.map(|_| ())
    }

    /// Delete from whichever tier is active; the other tier is not touched.
    pub async fn delete(&self, ctx: &CallContext, key: &str) -> Result<(), GatewayError> {
        self.execute(ctx, StoreOp::Delete(key)).await.map(|_| ())
    }

    async fn execute(&self, ctx: &CallContext, op: StoreOp<'_>) -> Result<StoreOutput, GatewayError> {
        let key = match &op {
            StoreOp::Get(key) | StoreOp::Set(key, ..) | StoreOp::Delete(key) => *key,
        };
        if key.is_empty() {
            return Err(GatewayError::InvalidRequest("empty storage key".into()));
        }

        let primary_error = if self.primary.status.is_healthy() && self.primary.breaker.is_call_allowed() {
            match self.primary.call(ctx, &op).await {
                Ok(output) => {
                    self.primary.on_success();
                    metrics::record_storage_op(Tier::Primary.as_str(), op.name(), "success");
                    return Ok(output);
                }
                Err(TransportError::Cancelled) => return Err(GatewayError::Cancelled),
                Err(e) => {
                    self.primary.on_failure(&e);
                    metrics::record_storage_op(Tier::Primary.as_str(), op.name(), "failure");
                    tracing::warn!(
                        op = op.name(),
                        key = %key,
                        error = %e,
                        "Primary storage failed, using fallback"
                    );
                    e.to_string()
                }
            }
        } else {
            format!("primary {}", self.primary.breaker.current_state())
        };

        match self.fallback.call(ctx, &op).await {
            Ok(output) => {
                self.fallback.on_success();
                self.fallback.status.set_healthy(true);
                metrics::record_storage_op(Tier::Fallback.as_str(), op.name(), "success");
                Ok(output)
            }
            Err(TransportError::Cancelled) => Err(GatewayError::Cancelled),
            Err(e) => {
                self.fallback.on_failure(&e);
                metrics::record_storage_op(Tier::Fallback.as_str(), op.name(), "failure");
                tracing::error!(
                    op = op.name(),
                    key = %key,
                    primary_error = %primary_error,
                    fallback_error = %e,
                    "Both storage tiers failed"
                );
                Err(GatewayError::StorageUnavailable {
                    primary: primary_error,
                    fallback: e.to_string(),
                })
            }
        }
    }

    /// One prober pass over both tiers.
    ///
    /// The primary is pinged only when its breaker admits a call, so an open
    /// primary is retried once per cool-down.
    pub async fn probe_once(&self, ctx: &CallContext) {
        self.probe_tier(&self.primary, ctx).await;
        self.probe_tier(&self.fallback, ctx).await;
    }

    async fn probe_tier(&self, tier: &StorageTier, ctx: &CallContext) {
        if !tier.breaker.is_call_allowed() {
            tracing::debug!(tier = %tier.tier, state = %tier.breaker.current_state(), "Storage probe skipped");
            return;
        }
        tier.status.mark_checked();
        match tier.driver.ping(ctx).await {
            Ok(()) => {
                tier.on_success();
                if tier.breaker.current_state() == CircuitState::Closed {
                    tier.status.set_healthy(true);
                }
            }
            Err(TransportError::Cancelled) => {}
            Err(e) => {
                tracing::debug!(tier = %tier.tier, error = %e, "Storage probe failed");
                tier.on_failure(&e);
            }
        }
    }

    pub fn statuses(&self) -> Vec<StorageBackendStatus> {
        vec![self.primary.status(), self.fallback.status()]
    }
}
