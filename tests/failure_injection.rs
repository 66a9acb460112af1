//! Failure injection tests for the gateway.

use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use resilient_gateway::config::StoreDriverConfig;
use resilient_gateway::resilience::CircuitState;
use resilient_gateway::storage::Tier;
use resilient_gateway::{
    CallContext, EndpointId, Gateway, GatewayError, HealthSnapshot, InvokeRequest, Role,
    RoutingPreference, Shutdown,
};

mod common;
use common::MockReply;

fn breaker_state(health: &HealthSnapshot, id: &str) -> CircuitState {
    health
        .breakers
        .iter()
        .find(|b| b.endpoint.as_str() == id)
        .map(|b| b.state)
        .unwrap()
}

#[tokio::test]
async fn test_unsupported_primary_is_never_called_again() {
    let primary = common::start_programmable_backend(|method, _| async move {
        if method == "POST" {
            MockReply::status(404, r#"{"error":"model not found"}"#)
        } else {
            MockReply::ok("{}")
        }
    })
    .await;
    let secondary =
        common::start_programmable_backend(|_, _| async { MockReply::ok(r#"{"text":"hi"}"#) })
            .await;

    let gateway = Gateway::new(common::ai_config(&primary, &secondary)).unwrap();
    let ctx = CallContext::with_timeout(Duration::from_secs(5));

    let first = gateway.invoke(&ctx, json!({"prompt": "hello"})).await.unwrap();
    assert_eq!(first.endpoint.as_str(), "ai.secondary");
    assert_eq!(first.attempts, 2);
    assert_eq!(primary.requests(), 1);
    assert_eq!(
        breaker_state(&gateway.health_snapshot(), "ai.primary"),
        CircuitState::PermanentlyOpen
    );

    for _ in 0..100 {
        let invocation = gateway.invoke(&ctx, json!({"prompt": "again"})).await.unwrap();
        assert_eq!(invocation.endpoint.as_str(), "ai.secondary");
        assert_eq!(invocation.attempts, 1);
    }
    assert_eq!(primary.requests(), 1, "primary must not be called once unsupported");
    assert_eq!(secondary.requests(), 101);

    // An administrative reset makes the primary eligible again.
    assert!(gateway.reset_endpoint(&EndpointId::new("ai.primary")));
    let request = InvokeRequest::new(json!({"prompt": "retry"}))
        .with_preference(RoutingPreference::PreferPrimary);
    let after_reset = gateway.invoke_with(&ctx, &request).await.unwrap();
    assert_eq!(after_reset.endpoint.as_str(), "ai.secondary");
    assert_eq!(primary.requests(), 2);
}

#[tokio::test]
async fn test_no_available_backend_without_network_calls() {
    let primary = common::start_programmable_backend(|_, _| async {
        MockReply::status(404, "not found")
    })
    .await;
    let secondary = common::start_programmable_backend(|_, _| async {
        MockReply::status(501, "not implemented")
    })
    .await;

    let gateway = Gateway::new(common::ai_config(&primary, &secondary)).unwrap();
    let ctx = CallContext::with_timeout(Duration::from_secs(5));

    match gateway.invoke(&ctx, json!({})).await {
        Err(GatewayError::NoAvailableBackend { reasons }) => assert_eq!(reasons.len(), 2),
        other => panic!("expected NoAvailableBackend, got {other:?}"),
    }
    assert_eq!((primary.requests(), secondary.requests()), (1, 1));

    match gateway.invoke(&ctx, json!({})).await {
        Err(GatewayError::NoAvailableBackend { reasons }) => {
            assert!(reasons.iter().all(|r| r.reason.contains("permanently_open")));
        }
        other => panic!("expected NoAvailableBackend, got {other:?}"),
    }
    assert_eq!((primary.requests(), secondary.requests()), (1, 1));
}

#[tokio::test]
async fn test_transient_failure_fails_over_and_stays_closed() {
    let primary = common::start_programmable_backend(|_, _| async {
        MockReply::status(503, "overloaded")
    })
    .await;
    let secondary =
        common::start_programmable_backend(|_, _| async { MockReply::ok("{}") }).await;

    let gateway = Gateway::new(common::ai_config(&primary, &secondary)).unwrap();
    let ctx = CallContext::with_timeout(Duration::from_secs(5));

    let invocation = gateway.invoke(&ctx, json!({})).await.unwrap();
    assert_eq!(invocation.endpoint.as_str(), "ai.secondary");
    // One transient failure is below the default threshold.
    assert_eq!(
        breaker_state(&gateway.health_snapshot(), "ai.primary"),
        CircuitState::Closed
    );
}

#[tokio::test]
async fn test_cancelled_context_makes_no_calls() {
    let primary = common::start_mock_backend("{}").await;
    let secondary = common::start_mock_backend("{}").await;
    let gateway = Gateway::new(common::ai_config(&primary, &secondary)).unwrap();

    let ctx = CallContext::background();
    ctx.token().cancel();

    assert!(matches!(
        gateway.invoke(&ctx, json!({})).await,
        Err(GatewayError::Cancelled)
    ));
    assert_eq!(primary.requests() + secondary.requests(), 0);
}

#[tokio::test]
async fn test_store_outage_falls_back_and_recovers() {
    let slow = Arc::new(AtomicBool::new(true));
    let puts = Arc::new(AtomicUsize::new(0));

    let (slow_flag, put_count) = (slow.clone(), puts.clone());
    let store = common::start_programmable_backend(move |method, _| {
        let slow = slow_flag.load(Ordering::SeqCst);
        if method == "PUT" {
            put_count.fetch_add(1, Ordering::SeqCst);
        }
        async move {
            let reply = MockReply::ok("stored");
            if slow {
                reply.delayed(Duration::from_secs(2))
            } else {
                reply
            }
        }
    })
    .await;

    let mut config = resilient_gateway::GatewayConfig::default();
    config.endpoints.push(common::endpoint(
        "store.primary",
        Role::StorePrimary,
        store.url(),
        200,
    ));
    config.storage.primary = StoreDriverConfig::Http {
        endpoint: "store.primary".to_string(),
    };
    config.storage.fallback = StoreDriverConfig::Memory;
    config.storage.probe_interval_ms = 50;
    config.breaker.cool_down_ms = 300;
    config.breaker.max_cool_down_ms = 1_000;

    let gateway = Gateway::new(config).unwrap();
    let ctx = CallContext::with_timeout(Duration::from_secs(5));

    // Three timeouts open the primary breaker; every write lands in the fallback.
    for i in 0..3 {
        gateway
            .set(&ctx, &format!("k{i}"), "v", None)
            .await
            .unwrap();
    }
    assert_eq!(puts.load(Ordering::SeqCst), 3);
    let health = gateway.health_snapshot();
    assert_eq!(breaker_state(&health, "store.primary"), CircuitState::Open);
    assert!(!health.storage[0].healthy);

    // Open primary is skipped entirely.
    gateway.set(&ctx, "k3", "v", None).await.unwrap();
    assert_eq!(puts.load(Ordering::SeqCst), 3);
    assert_eq!(
        gateway.get(&ctx, "k3").await.unwrap().as_deref(),
        Some(&b"v"[..])
    );

    // Primary recovers; the prober closes the breaker after the cool-down.
    slow.store(false, Ordering::SeqCst);
    let shutdown = Shutdown::new();
    let handles = gateway.start(&shutdown);

    let recovered = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let health = gateway.health_snapshot();
            let primary = health.storage.iter().find(|s| s.tier == Tier::Primary).unwrap();
            if primary.healthy && breaker_state(&health, "store.primary") == CircuitState::Closed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await;
    assert!(recovered.is_ok(), "primary store should recover");

    gateway.set(&ctx, "k4", "v", None).await.unwrap();
    assert_eq!(puts.load(Ordering::SeqCst), 4, "primary preferred again");

    shutdown.trigger();
    for handle in handles {
        handle.await.unwrap();
    }
}
