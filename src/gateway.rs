//! Gateway facade.
//!
//! # Responsibilities
//! - Build every component from one validated configuration
//! - Spawn and own the background tasks
//! - Expose the operations collaborators call: invoke, get/set/delete,
//!   health, reset, reload

use arc_swap::ArcSwap;
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::capability::{CapabilityCache, CapabilityDetector};
use crate::config::validation::{validate_config, ValidationError};
use crate::config::{ConfigError, GatewayConfig};
use crate::context::CallContext;
use crate::endpoint::{EndpointId, EndpointRegistry, Role};
use crate::error::GatewayError;
use crate::lifecycle::Shutdown;
use crate::pool::{PoolManager, PoolStats, TrafficClass};
use crate::resilience::{BreakerRegistry, BreakerStatus, CircuitState};
use crate::routing::{ApiRouter, Dispatched, InvokeRequest, RoutingPreference};
use crate::storage::{HybridStorage, StorageBackendStatus, StorageProber};

/// Result of a successful `invoke`.
pub type Invocation = Dispatched;

/// Health of one AI endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointHealth {
    pub endpoint: EndpointId,
    pub role: Role,
    pub state: CircuitState,
    /// Fresh cached capability, `None` when unknown.
    pub available: Option<bool>,
    pub checked_at: Option<u64>,
    /// The default traffic-class pool its calls check out from. Pools are
    /// shared by every endpoint of that class.
    pub pool: PoolStats,
}

/// Point-in-time view of the whole gateway.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub routing: RoutingPreference,
    pub endpoints: Vec<EndpointHealth>,
    pub breakers: Vec<BreakerStatus>,
    pub pools: Vec<PoolStats>,
    pub storage: Vec<StorageBackendStatus>,
}

pub struct Gateway {
    config: ArcSwap<GatewayConfig>,
    endpoints: Arc<EndpointRegistry>,
    breakers: Arc<BreakerRegistry>,
    cache: Arc<CapabilityCache>,
    detector: Arc<CapabilityDetector>,
    pools: PoolManager,
    router: ApiRouter,
    storage: Arc<HybridStorage>,
}

fn invalid(field: &str, err: impl ToString) -> GatewayError {
    GatewayError::Config(ConfigError::Validation(vec![ValidationError::new(
        field,
        err.to_string(),
    )]))
}

impl Gateway {
    /// Build every component. Nothing runs until `start`.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        validate_config(&config).map_err(ConfigError::Validation)?;

        let endpoints = Arc::new(
            EndpointRegistry::from_configs(&config.endpoints).map_err(|e| invalid("endpoints", e))?,
        );
        let breakers = Arc::new(BreakerRegistry::new(
            config.breaker.clone(),
            endpoints.all().iter().map(|e| &e.id),
        ));
        let cache = Arc::new(match &config.capability.persist_path {
            Some(path) => CapabilityCache::load(
                path,
                config.capability.ttl(),
                config.capability.persist_retries,
            ),
            None => CapabilityCache::new(config.capability.ttl()),
        });
        let pools = PoolManager::from_config(&config.pools).map_err(|e| invalid("pools", e))?;
        let detector = Arc::new(CapabilityDetector::new(
            endpoints.clone(),
            breakers.clone(),
            cache.clone(),
            pools.clone(),
            config.capability.detection_timeout(),
        ));
        let router = ApiRouter::new(
            endpoints.clone(),
            breakers.clone(),
            cache.clone(),
            detector.clone(),
            pools.clone(),
            RoutingPreference::from_config(&config.routing),
        );
        let storage = Arc::new(HybridStorage::from_config(
            &config.storage,
            &endpoints,
            &breakers,
            &pools,
        )?);

        tracing::info!(
            endpoints = endpoints.all().len(),
            routing = ?router.preference(),
            "Gateway initialized"
        );

        Ok(Self {
            config: ArcSwap::from_pointee(config),
            endpoints,
            breakers,
            cache,
            detector,
            pools,
            router,
            storage,
        })
    }

    /// Spawn background tasks: pool maintenance, capability persister and
    /// refresh, storage prober. All stop when `shutdown` triggers.
    pub fn start(&self, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        let mut handles = self.pools.spawn_maintenance(shutdown);
        handles.extend(self.cache.spawn_persister(shutdown.subscribe()));
        handles.extend(self.detector.spawn_refresh(shutdown.subscribe()));

        let prober = StorageProber::new(
            self.storage.clone(),
            self.config.load().storage.probe_interval(),
        );
        handles.push(tokio::spawn(prober.run(shutdown.subscribe())));

        tracing::info!(tasks = handles.len(), "Gateway background tasks started");
        handles
    }

    pub fn config(&self) -> Arc<GatewayConfig> {
        self.config.load_full()
    }

    /// Send `payload` to the best available AI endpoint.
    pub async fn invoke(
        &self,
        ctx: &CallContext,
        payload: serde_json::Value,
    ) -> Result<Invocation, GatewayError> {
        self.router.dispatch(ctx, &InvokeRequest::new(payload)).await
    }

    /// `invoke` with an explicit traffic class or preference override.
    pub async fn invoke_with(
        &self,
        ctx: &CallContext,
        request: &InvokeRequest,
    ) -> Result<Invocation, GatewayError> {
        self.router.dispatch(ctx, request).await
    }

    pub async fn get(&self, ctx: &CallContext, key: &str) -> Result<Option<Bytes>, GatewayError> {
        self.storage.get(ctx, key).await
    }

    pub async fn set(
        &self,
        ctx: &CallContext,
        key: &str,
        value: impl Into<Bytes>,
        ttl: Option<Duration>,
    ) -> Result<(), GatewayError> {
        self.storage.set(ctx, key, value.into(), ttl).await
    }

    pub async fn delete(&self, ctx: &CallContext, key: &str) -> Result<(), GatewayError> {
        self.storage.delete(ctx, key).await
    }

    /// Probe every AI endpoint now.
    pub async fn detect_all(&self, ctx: &CallContext) -> HashMap<EndpointId, bool> {
        self.detector.detect_all(ctx).await
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        let pool = self.pools.stats(TrafficClass::default());
        let endpoints = self
            .endpoints
            .ai_endpoints()
            .map(|e| {
                let record = self.cache.get(&e.id);
                EndpointHealth {
                    endpoint: e.id.clone(),
                    role: e.role,
                    state: self.breakers.current_state(&e.id),
                    available: record.as_ref().map(|r| r.available),
                    checked_at: record.map(|r| r.checked_at),
                    pool: pool.clone(),
                }
            })
            .collect();

        HealthSnapshot {
            routing: self.router.preference(),
            endpoints,
            breakers: self.breakers.statuses(),
            pools: self.pools.all_stats(),
            storage: self.storage.statuses(),
        }
    }

    /// Administrative reset: close the endpoint's breaker and forget its
    /// cached capability so it is re-detected. False for unknown endpoints.
    pub fn reset_endpoint(&self, endpoint: &EndpointId) -> bool {
        if !self.breakers.reset(endpoint) {
            return false;
        }
        self.cache.invalidate(endpoint);
        tracing::info!(endpoint = %endpoint, "Endpoint reset");
        true
    }

    /// Apply a reloaded configuration.
    ///
    /// The routing preference is swapped atomically and permanently open
    /// breakers are reset with their capability records dropped, so those
    /// endpoints are re-detected. Endpoint, pool and storage changes need a
    /// restart.
    pub fn reload(&self, config: GatewayConfig) -> Result<(), GatewayError> {
        validate_config(&config).map_err(ConfigError::Validation)?;

        let current = self.config.load();
        for (section, changed) in [
            ("endpoints", differs(&current.endpoints, &config.endpoints)),
            ("pools", differs(&current.pools, &config.pools)),
            ("storage", differs(&current.storage, &config.storage)),
            ("breaker", differs(&current.breaker, &config.breaker)),
        ] {
            if changed {
                tracing::warn!(section, "Configuration change requires a restart to take effect");
            }
        }

        self.router
            .set_preference(RoutingPreference::from_config(&config.routing));
        let reset = self.breakers.reset_permanent();
        for endpoint in &reset {
            self.cache.invalidate(endpoint);
        }
        self.config.store(Arc::new(config));

        tracing::info!(permanent_breakers_reset = reset.len(), "Configuration reloaded");
        Ok(())
    }

    /// Write the capability cache to its persist path now.
    pub async fn persist_capabilities(&self) -> bool {
        self.cache.persist().await
    }

    /// Stop handing out pooled connections.
    pub fn close(&self) {
        self.pools.close();
    }
}

fn differs<T: Serialize>(a: &T, b: &T) -> bool {
    serde_json::to_value(a).ok() != serde_json::to_value(b).ok()
}
