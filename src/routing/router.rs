//! AI request routing and dispatch.
//!
//! # Responsibilities
//! - Build the candidate list from preference, capability and breaker state
//! - Dispatch through the connection pool with failover across candidates
//! - Feed every outcome back into the breaker and capability cache
//!
//! # Design Decisions
//! - Routing preference lives behind `ArcSwap` so reloads never block traffic
//! - Admission is re-checked at dispatch time; the plan may be stale by then
//! - Pool exhaustion is retryable: it is recorded as a transient failure, and
//!   surfaces as `PoolExhausted` only when no candidate failed for another reason

use arc_swap::ArcSwap;
use bytes::Bytes;
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::capability::{CapabilityCache, CapabilityDetector};
use crate::context::CallContext;
use crate::endpoint::{Endpoint, EndpointId, EndpointRegistry, Role};
use crate::error::{CandidateFailure, GatewayError};
use crate::observability::metrics;
use crate::pool::{PoolManager, TrafficClass};
use crate::resilience::{classify, status_failure, BreakerRegistry, CircuitState, FailureClass};
use crate::routing::decision::{RoutingDecision, RoutingPreference};
use crate::transport::{TransportError, UpstreamRequest, UpstreamResponse};

/// One AI invocation.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub payload: serde_json::Value,
    pub class: TrafficClass,
    /// Overrides the configured preference for this call only.
    pub preference: Option<RoutingPreference>,
}

impl InvokeRequest {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            class: TrafficClass::Api,
            preference: None,
        }
    }

    pub fn with_class(mut self, class: TrafficClass) -> Self {
        self.class = class;
        self
    }

    pub fn with_preference(mut self, preference: RoutingPreference) -> Self {
        self.preference = Some(preference);
        self
    }
}

/// A successfully delivered response and the endpoint that produced it.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub response: UpstreamResponse,
    pub endpoint: EndpointId,
    pub request_id: String,
    /// Candidates tried, including the one that answered.
    pub attempts: usize,
}

pub struct ApiRouter {
    endpoints: Arc<EndpointRegistry>,
    breakers: Arc<BreakerRegistry>,
    cache: Arc<CapabilityCache>,
    detector: Arc<CapabilityDetector>,
    pools: PoolManager,
    preference: ArcSwap<RoutingPreference>,
}

impl ApiRouter {
    pub fn new(
        endpoints: Arc<EndpointRegistry>,
        breakers: Arc<BreakerRegistry>,
        cache: Arc<CapabilityCache>,
        detector: Arc<CapabilityDetector>,
        pools: PoolManager,
        preference: RoutingPreference,
    ) -> Self {
        Self {
            endpoints,
            breakers,
            cache,
            detector,
            pools,
            preference: ArcSwap::from_pointee(preference),
        }
    }

    pub fn preference(&self) -> RoutingPreference {
        **self.preference.load()
    }

    pub fn set_preference(&self, preference: RoutingPreference) {
        let previous = self.preference.swap(Arc::new(preference));
        if *previous != preference {
            tracing::info!(from = ?previous, to = ?preference, "Routing preference changed");
        }
    }

    /// Plan the candidate list. Fails with `NoAvailableBackend` when nothing
    /// can be called; no network I/O happens here.
    pub fn route(&self, preference: RoutingPreference) -> Result<RoutingDecision, GatewayError> {
        let decision = RoutingDecision::build(
            preference,
            self.endpoints.by_role(Role::AiPrimary),
            self.endpoints.by_role(Role::AiSecondary),
            |id| self.cache.get(id).map(|r| r.available),
            |id| {
                let breaker = self.breakers.get(id);
                if breaker.would_allow() {
                    Ok(())
                } else {
                    Err(breaker.current_state())
                }
            },
        );

        for id in decision.unverified() {
            self.detector.request_refresh(id);
        }

        if decision.is_empty() {
            let reasons = decision
                .excluded
                .iter()
                .map(|e| CandidateFailure {
                    endpoint: e.endpoint.clone(),
                    reason: format!("circuit {}", e.state),
                })
                .collect::<Vec<_>>();
            tracing::warn!(preference = ?preference, excluded = ?decision.excluded, "No routable AI endpoint");
            metrics::record_no_backend();
            return Err(GatewayError::NoAvailableBackend { reasons });
        }

        tracing::debug!(
            preference = ?preference,
            candidates = ?decision.endpoint_ids(),
            excluded = ?decision.excluded,
            "Routing decision"
        );
        Ok(decision)
    }

    /// Route and send `request`, failing over across candidates.
    pub async fn dispatch(
        &self,
        ctx: &CallContext,
        request: &InvokeRequest,
    ) -> Result<Dispatched, GatewayError> {
        let preference = request.preference.unwrap_or_else(|| self.preference());
        let decision = self.route(preference)?;
        let body = serde_json::to_vec(&request.payload)
            .map(Bytes::from)
            .map_err(|e| GatewayError::InvalidRequest(e.to_string()))?;
        let request_id = Uuid::new_v4().to_string();

        let mut failures: Vec<CandidateFailure> = Vec::new();
        let mut exhausted_pool: Option<String> = None;
        let mut only_backpressure = true;

        for (attempt, candidate) in decision.candidates.iter().enumerate() {
            if ctx.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }
            let endpoint = &candidate.endpoint;
            let breaker = self.breakers.get(&endpoint.id);
            if !breaker.is_call_allowed() {
                only_backpressure = false;
                failures.push(CandidateFailure {
                    endpoint: endpoint.id.clone(),
                    reason: format!("circuit {}", breaker.current_state()),
                });
                continue;
            }

            let upstream = match invoke_request(endpoint, body.clone(), ctx, &request_id) {
                Ok(upstream) => upstream,
                Err(e) => {
                    self.record_failure(&endpoint.id, FailureClass::PermanentlyUnsupported);
                    only_backpressure = false;
                    failures.push(CandidateFailure {
                        endpoint: endpoint.id.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let started = Instant::now();
            let (class, reason) = match self.pools.send(request.class, ctx, &upstream).await {
                Ok(response) => match status_failure(response.status, &response.body_snippet()) {
                    None => {
                        breaker.record_success();
                        if !self.cache.get(&endpoint.id).is_some_and(|r| r.available) {
                            self.cache.put(&endpoint.id, true);
                        }
                        metrics::record_dispatch(endpoint.id.as_str(), "success", started);
                        tracing::info!(
                            request_id = %request_id,
                            endpoint = %endpoint.id,
                            status = response.status,
                            attempt = attempt + 1,
                            "AI request dispatched"
                        );
                        return Ok(Dispatched {
                            response,
                            endpoint: endpoint.id.clone(),
                            request_id,
                            attempts: attempt + 1,
                        });
                    }
                    Some(class) => (class, format!("status {}", response.status)),
                },
                Err(TransportError::Cancelled) => {
                    metrics::record_dispatch(endpoint.id.as_str(), "cancelled", started);
                    return Err(GatewayError::Cancelled);
                }
                Err(TransportError::PoolExhausted(pool)) => {
                    self.record_failure(&endpoint.id, FailureClass::Transient);
                    metrics::record_dispatch(endpoint.id.as_str(), "pool_exhausted", started);
                    failures.push(CandidateFailure {
                        endpoint: endpoint.id.clone(),
                        reason: format!("pool '{}' exhausted", pool),
                    });
                    exhausted_pool = Some(pool);
                    continue;
                }
                Err(e) => (classify(&e), e.to_string()),
            };

            only_backpressure = false;
            self.record_failure(&endpoint.id, class);
            metrics::record_dispatch(endpoint.id.as_str(), "failure", started);
            tracing::warn!(
                request_id = %request_id,
                endpoint = %endpoint.id,
                class = ?class,
                reason = %reason,
                "AI request failed, trying next candidate"
            );
            failures.push(CandidateFailure {
                endpoint: endpoint.id.clone(),
                reason,
            });
        }

        let attempts: Vec<String> = failures.iter().map(ToString::to_string).collect();
        tracing::error!(request_id = %request_id, attempts = ?attempts, "All AI candidates failed");

        match exhausted_pool {
            Some(pool) if only_backpressure => Err(GatewayError::PoolExhausted { pool }),
            _ => {
                metrics::record_no_backend();
                Err(GatewayError::NoAvailableBackend { reasons: failures })
            }
        }
    }

    fn record_failure(&self, endpoint: &EndpointId, class: FailureClass) {
        self.breakers.record_failure(endpoint, class);
        if class == FailureClass::PermanentlyUnsupported {
            self.cache.put(endpoint, false);
        }
    }

}

fn invoke_request(
    endpoint: &Endpoint,
    body: Bytes,
    ctx: &CallContext,
    request_id: &str,
) -> Result<UpstreamRequest, url::ParseError> {
    let url = endpoint.url_for(&endpoint.invoke_path)?;
    let mut request = UpstreamRequest::new(reqwest::Method::POST, url, ctx.clamp(endpoint.timeout))
        .with_request_id(request_id);
    request.body = Some(body);
    request.content_type = Some("application/json");
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, EndpointConfig, PoolConfig, PoolsConfig};
    use crate::pool::manager::tests::TestFactory;
    use crate::transport::{Connection, ConnectionFactory};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Per-host scripted responses; `0` means connection refused.
    #[derive(Default)]
    struct Script {
        statuses: Mutex<HashMap<String, u16>>,
        calls: Mutex<HashMap<String, usize>>,
        total: AtomicUsize,
    }

    impl Script {
        fn set(&self, host: &str, status: u16) {
            self.statuses.lock().unwrap().insert(host.to_string(), status);
        }

        fn calls(&self, host: &str) -> usize {
            self.calls.lock().unwrap().get(host).copied().unwrap_or(0)
        }
    }

    struct ScriptedConnection(Arc<Script>);

    #[async_trait]
    impl Connection for ScriptedConnection {
        async fn send(&self, request: &UpstreamRequest) -> Result<UpstreamResponse, TransportError> {
            let host = request.url.host_str().unwrap_or_default().to_string();
            self.0.total.fetch_add(1, Ordering::SeqCst);
            *self.0.calls.lock().unwrap().entry(host.clone()).or_default() += 1;
            let status = self.0.statuses.lock().unwrap().get(&host).copied().unwrap_or(200);
            match status {
                0 => Err(TransportError::Connect("refused".into())),
                s => Ok(UpstreamResponse::new(s, format!("from {}", host))),
            }
        }

        async fn is_healthy(&self) -> bool {
            true
        }
    }

    struct ScriptedFactory(Arc<Script>);

    #[async_trait]
    impl ConnectionFactory for ScriptedFactory {
        async fn connect(&self) -> Result<Box<dyn Connection>, TransportError> {
            Ok(Box::new(ScriptedConnection(self.0.clone())))
        }
    }

    fn endpoint_config(id: &str, role: Role, host: &str) -> EndpointConfig {
        EndpointConfig {
            id: id.to_string(),
            role,
            base_url: format!("http://{}", host),
            timeout_ms: 1_000,
            probe_path: "/health".to_string(),
            invoke_path: "/v1/generate".to_string(),
        }
    }

    fn router_with(pools: PoolsConfig, preference: RoutingPreference) -> (ApiRouter, Arc<Script>) {
        let endpoints = Arc::new(
            EndpointRegistry::from_configs(&[
                endpoint_config("ai.primary", Role::AiPrimary, "primary"),
                endpoint_config("ai.secondary", Role::AiSecondary, "secondary"),
            ])
            .unwrap(),
        );
        let ids: Vec<EndpointId> = endpoints.all().iter().map(|e| e.id.clone()).collect();
        let breakers = Arc::new(BreakerRegistry::new(
            BreakerConfig {
                open_threshold: 2,
                ..Default::default()
            },
            &ids,
        ));
        let cache = Arc::new(CapabilityCache::new(Duration::from_secs(60)));
        let script = Arc::new(Script::default());
        let pool_manager = PoolManager::new(
            &pools,
            Arc::new(ScriptedFactory(script.clone())),
            Arc::new(TestFactory::new()),
        );
        let detector = Arc::new(CapabilityDetector::new(
            endpoints.clone(),
            breakers.clone(),
            cache.clone(),
            pool_manager.clone(),
            Duration::from_millis(500),
        ));
        let router = ApiRouter::new(endpoints, breakers, cache, detector, pool_manager, preference);
        (router, script)
    }

    fn router(preference: RoutingPreference) -> (ApiRouter, Arc<Script>) {
        router_with(PoolsConfig::default(), preference)
    }

    fn invoke() -> InvokeRequest {
        InvokeRequest::new(serde_json::json!({"prompt": "hello"}))
    }

    #[tokio::test]
    async fn dispatches_to_primary_and_caches_capability() {
        let (router, script) = router(RoutingPreference::Auto);
        let dispatched = router.dispatch(&CallContext::background(), &invoke()).await.unwrap();

        assert_eq!(dispatched.endpoint.as_str(), "ai.primary");
        assert_eq!(dispatched.attempts, 1);
        assert_eq!(dispatched.response.body, Bytes::from("from primary"));
        assert_eq!(script.calls("primary"), 1);
        assert!(router.cache.get(&EndpointId::new("ai.primary")).unwrap().available);
    }

    #[tokio::test]
    async fn permanent_failure_fails_over_and_stops_calling_primary() {
        let (router, script) = router(RoutingPreference::Auto);
        script.set("primary", 404);

        let first = router.dispatch(&CallContext::background(), &invoke()).await.unwrap();
        assert_eq!(first.endpoint.as_str(), "ai.secondary");
        assert_eq!(first.attempts, 2);

        for _ in 0..20 {
            let d = router.dispatch(&CallContext::background(), &invoke()).await.unwrap();
            assert_eq!(d.endpoint.as_str(), "ai.secondary");
        }
        assert_eq!(script.calls("primary"), 1);
        assert_eq!(
            router.breakers.current_state(&EndpointId::new("ai.primary")),
            CircuitState::PermanentlyOpen
        );
    }

    #[tokio::test]
    async fn deliverable_client_error_is_returned() {
        let (router, script) = router(RoutingPreference::PreferPrimary);
        script.set("primary", 400);
        let d = router.dispatch(&CallContext::background(), &invoke()).await.unwrap();
        assert_eq!(d.endpoint.as_str(), "ai.primary");
        assert_eq!(d.response.status, 400);
        assert_eq!(script.calls("secondary"), 0);
    }

    #[tokio::test]
    async fn all_open_returns_no_backend_without_calls() {
        let (router, script) = router(RoutingPreference::Auto);
        router
            .breakers
            .record_failure(&EndpointId::new("ai.primary"), FailureClass::PermanentlyUnsupported);
        for _ in 0..2 {
            router
                .breakers
                .record_failure(&EndpointId::new("ai.secondary"), FailureClass::Transient);
        }

        let err = router.dispatch(&CallContext::background(), &invoke()).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoAvailableBackend { .. }));
        assert_eq!(script.total.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transient_failures_on_both_return_no_backend() {
        let (router, script) = router(RoutingPreference::Auto);
        script.set("primary", 503);
        script.set("secondary", 0);

        let err = router.dispatch(&CallContext::background(), &invoke()).await.unwrap_err();
        match err {
            GatewayError::NoAvailableBackend { reasons } => {
                assert_eq!(reasons.len(), 2);
                assert_eq!(reasons[0].reason, "status 503");
            }
            other => panic!("unexpected error {:?}", other),
        }
        // Transient failures leave the capability cache alone.
        assert!(router.cache.get(&EndpointId::new("ai.primary")).is_none());
    }

    #[tokio::test]
    async fn force_secondary_never_calls_primary() {
        let (router, script) = router(RoutingPreference::ForceSecondary);
        for _ in 0..5 {
            let d = router.dispatch(&CallContext::background(), &invoke()).await.unwrap();
            assert_eq!(d.endpoint.as_str(), "ai.secondary");
        }
        assert_eq!(script.calls("primary"), 0);
    }

    #[tokio::test]
    async fn preference_can_be_swapped() {
        let (router, _) = router(RoutingPreference::Auto);
        router.set_preference(RoutingPreference::PreferSecondary);
        assert_eq!(router.preference(), RoutingPreference::PreferSecondary);
        let d = router.dispatch(&CallContext::background(), &invoke()).await.unwrap();
        assert_eq!(d.endpoint.as_str(), "ai.secondary");
    }

    #[tokio::test]
    async fn pool_backpressure_counts_as_transient_failure() {
        let pools = PoolsConfig {
            api: PoolConfig {
                max_size: 1,
                acquire_timeout_ms: 20,
                ..Default::default()
            },
            ..Default::default()
        };
        let (router, script) = router_with(pools, RoutingPreference::Auto);
        let held = router
            .pools
            .acquire(TrafficClass::Api, &CallContext::background())
            .await
            .unwrap();
        let primary = EndpointId::new("ai.primary");

        let err = router.dispatch(&CallContext::background(), &invoke()).await.unwrap_err();
        assert!(matches!(err, GatewayError::PoolExhausted { ref pool } if pool == "api"));
        assert_eq!(router.breakers.get(&primary).status().consecutive_failures, 1);

        // Second backpressure failure reaches the threshold of two.
        let err = router.dispatch(&CallContext::background(), &invoke()).await.unwrap_err();
        assert!(matches!(err, GatewayError::PoolExhausted { .. }));
        assert_eq!(router.breakers.current_state(&primary), CircuitState::Open);

        let err = router.dispatch(&CallContext::background(), &invoke()).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoAvailableBackend { .. }));
        assert_eq!(script.total.load(Ordering::SeqCst), 0);
        held.release(true);
    }

    #[tokio::test]
    async fn cancelled_context_is_not_recorded() {
        let (router, script) = router(RoutingPreference::Auto);
        let ctx = CallContext::background();
        ctx.token().cancel();
        let err = router.dispatch(&ctx, &invoke()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Cancelled));
        assert_eq!(script.total.load(Ordering::SeqCst), 0);
        assert_eq!(router.breakers.get(&EndpointId::new("ai.primary")).status().consecutive_failures, 0);
    }
}
