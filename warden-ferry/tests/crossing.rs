//! Crossing pipeline behaviour over a scripted transport: failover,
//! rate limiting, breaker gating, and the end-to-end deadline.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use warden_ferry::{
    BalanceStrategy, CrossingRequest, CrossingResponse, Ferry, FerryConfig, FerryError,
    RateLimitConfig, RetryConfig, Shore, ShoreTransport,
};

/// Transport that replays a per-shore script of outcomes; once a script
/// runs dry the shore answers 200.
#[derive(Default)]
struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<Result<CrossingResponse, FerryError>>>>,
    forwarded_to: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    async fn script(&self, shore: &str, outcomes: Vec<Result<CrossingResponse, FerryError>>) {
        self.scripts
            .lock()
            .await
            .insert(shore.to_string(), outcomes.into());
    }

    async fn forwards(&self) -> Vec<String> {
        self.forwarded_to.lock().await.clone()
    }
}

fn ok(status: u16) -> Result<CrossingResponse, FerryError> {
    Ok(CrossingResponse {
        status,
        body: Vec::new(),
    })
}

#[async_trait]
impl ShoreTransport for ScriptedTransport {
    async fn forward(
        &self,
        shore: &Shore,
        _request: &CrossingRequest,
        _timeout: Duration,
    ) -> Result<CrossingResponse, FerryError> {
        self.forwarded_to
            .lock()
            .await
            .push(shore.id.as_str().to_string());
        let mut scripts = self.scripts.lock().await;
        scripts
            .get_mut(shore.id.as_str())
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| ok(200))
    }

    async fn probe(
        &self,
        _shore: &Shore,
        _path: &str,
        _timeout: Duration,
    ) -> Result<u16, FerryError> {
        Ok(200)
    }
}

fn config() -> FerryConfig {
    FerryConfig {
        strategy: BalanceStrategy::RoundRobin,
        retry: RetryConfig {
            max_retries: 1,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            retry_on_statuses: vec![503],
        },
        crossing_timeout: Duration::from_secs(5),
        ..FerryConfig::default()
    }
}

async fn ferry_with_shores(
    config: FerryConfig,
    transport: Arc<ScriptedTransport>,
    shore_ids: &[&str],
) -> Ferry {
    let ferry = Ferry::new(config, transport).unwrap();
    for (i, id) in shore_ids.iter().enumerate() {
        ferry
            .register_shore(Shore::new(*id, format!("10.1.0.{i}:8080")))
            .await
            .unwrap();
    }
    ferry
}

#[tokio::test]
async fn failover_retries_on_a_different_shore() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.script("a", vec![ok(503)]).await;
    transport.script("b", vec![ok(200)]).await;

    let ferry = ferry_with_shores(config(), Arc::clone(&transport), &["a", "b"]).await;
    let response = ferry.cross(CrossingRequest::get("/v1/submit")).await.unwrap();
    assert_eq!(response.status, 200);

    // First attempt went to "a", the retry was forced onto "b".
    assert_eq!(transport.forwards().await, vec!["a", "b"]);
    ferry.shutdown();
}

#[tokio::test]
async fn retries_exhausted_surface_the_last_error() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.script("a", vec![ok(503), ok(503)]).await;
    transport.script("b", vec![ok(503), ok(503)]).await;

    let ferry = ferry_with_shores(config(), transport, &["a", "b"]).await;
    let err = ferry.cross(CrossingRequest::get("/")).await.unwrap_err();
    assert_eq!(err, FerryError::UpstreamStatus { status: 503 });
    ferry.shutdown();
}

#[tokio::test]
async fn non_retryable_statuses_are_returned_as_responses() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.script("a", vec![ok(404)]).await;

    let ferry = ferry_with_shores(config(), transport, &["a"]).await;
    let response = ferry.cross(CrossingRequest::get("/")).await.unwrap();
    assert_eq!(response.status, 404);
    ferry.shutdown();
}

#[tokio::test]
async fn crossing_with_no_shores_fails_cleanly() {
    let transport = Arc::new(ScriptedTransport::default());
    let ferry = Ferry::new(config(), transport).unwrap();
    let err = ferry.cross(CrossingRequest::get("/")).await.unwrap_err();
    assert_eq!(err, FerryError::NoHealthyShores);
    ferry.shutdown();
}

#[tokio::test]
async fn duplicate_registration_is_rejected() {
    let transport = Arc::new(ScriptedTransport::default());
    let ferry = ferry_with_shores(config(), transport, &["a"]).await;
    let err = ferry
        .register_shore(Shore::new("a", "10.9.9.9:8080"))
        .await
        .unwrap_err();
    assert!(matches!(err, FerryError::ShoreAlreadyExists(_)));
    ferry.shutdown();
}

#[tokio::test]
async fn rate_limit_refuses_beyond_burst() {
    let transport = Arc::new(ScriptedTransport::default());
    let mut cfg = config();
    cfg.rate_limit = RateLimitConfig {
        enabled: true,
        rps: 1.0,
        burst: 2,
        ..RateLimitConfig::default()
    };

    let ferry = ferry_with_shores(cfg, transport, &["a"]).await;
    let request = CrossingRequest::get("/").with_tenant("acme");

    assert!(ferry.cross(request.clone()).await.is_ok());
    assert!(ferry.cross(request.clone()).await.is_ok());
    let err = ferry.cross(request.clone()).await.unwrap_err();
    assert!(matches!(err, FerryError::RateLimitExceeded { .. }));

    // A different tenant has its own bucket.
    let other = CrossingRequest::get("/").with_tenant("globex");
    assert!(ferry.cross(other).await.is_ok());
    ferry.shutdown();
}

#[tokio::test]
async fn open_breaker_excludes_the_shore() {
    let transport = Arc::new(ScriptedTransport::default());
    // Persistent 503s from the only shore.
    transport
        .script("a", vec![ok(503), ok(503), ok(503), ok(503)])
        .await;

    let mut cfg = config();
    cfg.breaker.threshold = 2;
    cfg.retry.max_retries = 1;

    let ferry = ferry_with_shores(cfg, Arc::clone(&transport), &["a"]).await;

    // Each crossing forwards once (the lone shore is excluded from its
    // own retry); two failures trip the breaker.
    for _ in 0..2 {
        let err = ferry.cross(CrossingRequest::get("/")).await.unwrap_err();
        assert_eq!(err, FerryError::UpstreamStatus { status: 503 });
    }

    // Now the breaker refuses before any forward happens.
    let err = ferry.cross(CrossingRequest::get("/")).await.unwrap_err();
    assert!(matches!(err, FerryError::CircuitOpen { .. }));
    assert_eq!(transport.forwards().await.len(), 2);
    ferry.shutdown();
}

#[tokio::test]
async fn least_connections_prefers_the_idle_shore() {
    let transport = Arc::new(ScriptedTransport::default());
    let mut cfg = config();
    cfg.strategy = BalanceStrategy::LeastConnections;

    let ferry = ferry_with_shores(cfg, Arc::clone(&transport), &["a", "b"]).await;
    // With zero in-flight everywhere the tie breaks on shore ID.
    ferry.cross(CrossingRequest::get("/")).await.unwrap();
    assert_eq!(transport.forwards().await, vec!["a"]);
    ferry.shutdown();
}

#[tokio::test]
async fn consistent_hash_pins_a_tenant_to_one_shore() {
    let transport = Arc::new(ScriptedTransport::default());
    let mut cfg = config();
    cfg.strategy = BalanceStrategy::ConsistentHash;

    let ferry = ferry_with_shores(cfg, Arc::clone(&transport), &["a", "b", "c"]).await;
    for _ in 0..5 {
        ferry
            .cross(CrossingRequest::get("/").with_tenant("acme"))
            .await
            .unwrap();
    }

    let forwards = transport.forwards().await;
    assert_eq!(forwards.len(), 5);
    assert!(forwards.iter().all(|shore| shore == &forwards[0]));
    ferry.shutdown();
}

struct SlowTransport;

#[async_trait]
impl ShoreTransport for SlowTransport {
    async fn forward(
        &self,
        _shore: &Shore,
        _request: &CrossingRequest,
        _timeout: Duration,
    ) -> Result<CrossingResponse, FerryError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(CrossingResponse {
            status: 200,
            body: Vec::new(),
        })
    }

    async fn probe(
        &self,
        _shore: &Shore,
        _path: &str,
        _timeout: Duration,
    ) -> Result<u16, FerryError> {
        Ok(200)
    }
}

#[tokio::test(start_paused = true)]
async fn the_crossing_deadline_covers_the_whole_attempt() {
    let mut cfg = config();
    cfg.crossing_timeout = Duration::from_secs(2);

    let ferry = Ferry::new(cfg, Arc::new(SlowTransport)).unwrap();
    ferry
        .register_shore(Shore::new("slow", "10.1.0.1:8080"))
        .await
        .unwrap();

    let err = ferry.cross(CrossingRequest::get("/")).await.unwrap_err();
    assert_eq!(err, FerryError::Timeout);
    ferry.shutdown();
}
