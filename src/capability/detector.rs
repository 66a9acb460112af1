//! Active capability detection.
//!
//! # Responsibilities
//! - Probe AI endpoints with a side-effect-free request
//! - Record outcomes on the capability cache and the endpoint's breaker
//! - Refresh unknown endpoints lazily in the background

use futures_util::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::capability::cache::CapabilityCache;
use crate::context::CallContext;
use crate::endpoint::{Endpoint, EndpointId, EndpointRegistry};
use crate::pool::{PoolManager, TrafficClass};
use crate::resilience::{classify, status_failure, BreakerRegistry, CircuitState, FailureClass};
use crate::transport::{TransportError, UpstreamRequest};

/// Result of probing one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Available,
    Failed(FailureClass),
    /// Breaker is open or the trial is taken; nothing was sent.
    Skipped,
    /// Breaker is permanently open; recorded unavailable without a call.
    Unsupported,
    Cancelled,
}

pub struct CapabilityDetector {
    endpoints: Arc<EndpointRegistry>,
    breakers: Arc<BreakerRegistry>,
    cache: Arc<CapabilityCache>,
    pools: PoolManager,
    detection_timeout: Duration,
    refresh_tx: mpsc::UnboundedSender<EndpointId>,
    refresh_rx: Mutex<Option<mpsc::UnboundedReceiver<EndpointId>>>,
    /// Endpoints queued or being refreshed.
    pending: Mutex<HashSet<EndpointId>>,
}

impl CapabilityDetector {
    pub fn new(
        endpoints: Arc<EndpointRegistry>,
        breakers: Arc<BreakerRegistry>,
        cache: Arc<CapabilityCache>,
        pools: PoolManager,
        detection_timeout: Duration,
    ) -> Self {
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        Self {
            endpoints,
            breakers,
            cache,
            pools,
            detection_timeout,
            refresh_tx,
            refresh_rx: Mutex::new(Some(refresh_rx)),
            pending: Mutex::new(HashSet::new()),
        }
    }

    /// Probe every AI endpoint concurrently, bounded by the detection timeout.
    ///
    /// Returns the availability each endpoint now has in the cache; endpoints
    /// with no fresh record report `false`.
    pub async fn detect_all(&self, ctx: &CallContext) -> HashMap<EndpointId, bool> {
        let ctx = ctx.clone().deadline_in(self.detection_timeout);
        let endpoints: Vec<Arc<Endpoint>> = self.endpoints.ai_endpoints().cloned().collect();

        let outcomes = join_all(endpoints.iter().map(|e| self.probe(&ctx, e))).await;

        endpoints
            .iter()
            .zip(outcomes)
            .map(|(endpoint, outcome)| {
                tracing::debug!(endpoint = %endpoint.id, outcome = ?outcome, "Capability probe finished");
                (endpoint.id.clone(), self.cached_available(&endpoint.id))
            })
            .collect()
    }

    /// Probe one endpoint and report its cached availability afterwards.
    pub async fn detect_one(&self, ctx: &CallContext, endpoint: &EndpointId) -> bool {
        let Some(endpoint) = self.endpoints.get(endpoint) else {
            tracing::warn!(endpoint = %endpoint, "Capability detection for unknown endpoint");
            return false;
        };
        let ctx = ctx.clone().deadline_in(self.detection_timeout);
        self.probe(&ctx, &endpoint).await;
        self.cached_available(&endpoint.id)
    }

    fn cached_available(&self, endpoint: &EndpointId) -> bool {
        self.cache.get(endpoint).is_some_and(|r| r.available)
    }

    /// Probe without any lookup; the outcome is recorded on cache and breaker.
    pub async fn probe(&self, ctx: &CallContext, endpoint: &Endpoint) -> ProbeOutcome {
        let breaker = self.breakers.get(&endpoint.id);
        if breaker.current_state() == CircuitState::PermanentlyOpen {
            self.cache.put(&endpoint.id, false);
            return ProbeOutcome::Unsupported;
        }
        if !breaker.is_call_allowed() {
            return ProbeOutcome::Skipped;
        }

        let request = match endpoint.url_for(&endpoint.probe_path) {
            Ok(url) => UpstreamRequest::get(url, ctx.clamp(endpoint.timeout)),
            Err(e) => {
                tracing::error!(endpoint = %endpoint.id, error = %e, "Invalid probe URL");
                breaker.record_failure(FailureClass::PermanentlyUnsupported);
                self.cache.put(&endpoint.id, false);
                return ProbeOutcome::Failed(FailureClass::PermanentlyUnsupported);
            }
        };

        let class = match self.pools.send(TrafficClass::Api, ctx, &request).await {
            Ok(response) => {
                match status_failure(response.status, &response.body_snippet()) {
                    None => {
                        breaker.record_success();
                        self.cache.put(&endpoint.id, true);
                        return ProbeOutcome::Available;
                    }
                    Some(class) => class,
                }
            }
            Err(TransportError::Cancelled) => return ProbeOutcome::Cancelled,
            Err(TransportError::PoolExhausted(pool)) => {
                tracing::debug!(endpoint = %endpoint.id, pool = %pool, "Probe failed, pool exhausted");
                FailureClass::Transient
            }
            Err(e) => {
                tracing::debug!(endpoint = %endpoint.id, error = %e, "Capability probe failed");
                classify(&e)
            }
        };

        breaker.record_failure(class);
        if class == FailureClass::PermanentlyUnsupported {
            self.cache.put(&endpoint.id, false);
        }
        ProbeOutcome::Failed(class)
    }

    /// Queue a background refresh for `endpoint`. Duplicate requests for an
    /// endpoint already queued are dropped.
    pub fn request_refresh(&self, endpoint: &EndpointId) {
        let newly_queued = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(endpoint.clone());
        if newly_queued && self.refresh_tx.send(endpoint.clone()).is_err() {
            self.clear_pending(endpoint);
        }
    }

    fn clear_pending(&self, endpoint: &EndpointId) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(endpoint);
    }

    /// Spawn the lazy-refresh task. Returns `None` if already spawned.
    pub fn spawn_refresh(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> Option<JoinHandle<()>> {
        let mut rx = self
            .refresh_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let detector = self.clone();
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(endpoint) = rx.recv() => {
                        detector.detect_one(&CallContext::background(), &endpoint).await;
                        detector.clear_pending(&endpoint);
                    }
                    _ = shutdown.recv() => {
                        tracing::info!("Capability refresh received shutdown signal, exiting loop");
                        break;
                    }
                }
            }
        }))
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
