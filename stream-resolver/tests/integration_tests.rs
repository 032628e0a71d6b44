//! End-to-end resolution through the public API: circuit breaking, caching,
//! provider fallback and the maintenance endpoint.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use hosters::{DecryptionClient, DecryptionHealth, HosterError, StreamSource, StreamType};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use stream_resolver::api::{ApiServer, ApiServerConfig, AppState};
use stream_resolver::config::ResolverConfig;
use stream_resolver::domain::{ResolveKey, ResolveRequest};
use stream_resolver::error::{Error, Result};
use stream_resolver::extraction::{Capabilities, Provider, ProviderInfo, ProviderOutput};
use stream_resolver::services::{Collaborators, ServiceContainer};

struct OfflineDecryption;

#[async_trait]
impl DecryptionClient for OfflineDecryption {
    async fn decrypt(
        &self,
        operation: &str,
        _payload: &str,
    ) -> std::result::Result<serde_json::Value, HosterError> {
        Err(HosterError::decryption(operation, "offline"))
    }

    async fn health(&self) -> DecryptionHealth {
        DecryptionHealth::unavailable("offline")
    }
}

struct CountingProvider {
    info: ProviderInfo,
    healthy: bool,
    calls: AtomicUsize,
}

impl CountingProvider {
    fn new(id: &str, healthy: bool) -> Arc<Self> {
        Arc::new(Self {
            info: ProviderInfo {
                id: id.to_string(),
                name: id.to_uppercase(),
                priority: 0,
                capabilities: Capabilities::default(),
                languages: Vec::new(),
            },
            healthy,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for CountingProvider {
    fn info(&self) -> &ProviderInfo {
        &self.info
    }

    async fn fetch(&self, request: &ResolveRequest) -> Result<ProviderOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.healthy {
            return Err(Error::provider_unavailable(&self.info.id, "upstream down"));
        }
        Ok(ProviderOutput::Sources {
            sources: vec![StreamSource::new(
                format!("https://cdn.example.com/{}/{}.m3u8", self.info.id, request.id),
                "1080p",
                StreamType::Hls,
            )],
            referer: Some(format!("https://{}.example.com/", self.info.id)),
        })
    }
}

fn build(providers: &[Arc<CountingProvider>]) -> ServiceContainer {
    let mut config = ResolverConfig::default();
    config.breaker.failure_threshold = 5;

    let container = ServiceContainer::with_collaborators(
        config,
        Collaborators {
            client: reqwest::Client::new(),
            decryptor: Arc::new(OfflineDecryption),
            lookup: None,
        },
    )
    .unwrap();
    for provider in providers {
        container
            .providers
            .register(provider.clone(), true)
            .unwrap();
    }
    container
}

#[tokio::test]
async fn five_failures_open_the_circuit_and_block_further_calls() {
    let flaky = CountingProvider::new("flaky", false);
    let container = build(&[flaky.clone()]);
    let cancel = CancellationToken::new();

    // Distinct titles so the negative cache never short-circuits a run.
    for id in 1..=5 {
        let err = container
            .orchestrator
            .resolve(&ResolveRequest::movie(id.to_string()), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExtractionFailed { .. }));
    }
    assert_eq!(flaky.calls(), 5);
    assert!(container.breakers.snapshot("flaky").is_open);

    assert!(!container.breakers.allow("flaky"));
    let err = container
        .orchestrator
        .resolve(&ResolveRequest::movie("6"), &cancel)
        .await
        .unwrap_err();
    match err {
        Error::ExtractionFailed { attempts, .. } => {
            assert!(attempts[0].contains("Circuit breaker open"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(flaky.calls(), 5);
}

#[tokio::test]
async fn second_resolve_within_ttl_is_served_from_cache() {
    let provider = CountingProvider::new("alpha", true);
    let container = build(&[provider.clone()]);
    let cancel = CancellationToken::new();
    let request = ResolveRequest::movie("603");

    let first = container.orchestrator.resolve(&request, &cancel).await.unwrap();
    assert!(!first.cached);
    assert!(container.cache.stream.get(&request.key()).is_some());

    let second = container.orchestrator.resolve(&request, &cancel).await.unwrap();
    assert!(second.cached);
    assert_eq!(second.stream.sources, first.stream.sources);
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn open_circuit_is_skipped_in_favour_of_healthy_provider() {
    let p1 = CountingProvider::new("p1", true);
    let p2 = CountingProvider::new("p2", true);
    let container = build(&[p1.clone(), p2.clone()]);
    for _ in 0..5 {
        container.breakers.record_failure("p1");
    }

    let request = ResolveRequest::movie("550");
    let outcome = container
        .orchestrator
        .resolve(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.stream.provider, "p2");
    assert_eq!(p1.calls(), 0);
    assert_eq!(p2.calls(), 1);

    let p1_health = container.health.snapshot("p1");
    assert_eq!(p1_health.success_count + p1_health.failure_count, 0);
    assert_eq!(container.health.snapshot("p2").success_count, 1);
    assert_eq!(
        container.cache.stream.get(&request.key()).unwrap().provider,
        "p2"
    );
}

#[tokio::test]
async fn reset_all_clears_breakers_and_every_cache() {
    let good = CountingProvider::new("good", true);
    let bad = CountingProvider::new("bad", false);
    let container = build(&[good.clone(), bad.clone()]);
    container.providers.set_enabled("good", false).unwrap();

    // Populate the negative cache and trip `bad`.
    let cancel = CancellationToken::new();
    for id in 1..=5 {
        let _ = container
            .orchestrator
            .resolve(&ResolveRequest::movie(id.to_string()), &cancel)
            .await;
    }
    container.providers.set_enabled("good", true).unwrap();

    // Populate the stream and validation caches.
    container
        .orchestrator
        .resolve(&ResolveRequest::movie("100"), &cancel)
        .await
        .unwrap();
    container
        .cache
        .validation
        .insert("https://cdn.example.com/good/100.m3u8".to_string(), true);

    assert!(container.breakers.snapshot("bad").is_open);
    assert!(!container.cache.stream.is_empty());
    assert!(!container.cache.validation.is_empty());
    assert!(!container.cache.negative.is_empty());

    let app = ApiServer::with_state(
        ApiServerConfig::default(),
        AppState::from_container(&container),
    )
    .build_router();
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/status")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"action":"reset-all"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let snapshot = container.breakers.snapshot("bad");
    assert!(!snapshot.is_open);
    assert_eq!(snapshot.failures, 0);
    assert!(container.cache.stream.is_empty());
    assert!(container.cache.validation.is_empty());
    assert!(container.cache.negative.is_empty());

    let key: ResolveKey = ResolveRequest::movie("1").key();
    assert!(container.cache.negative.get(&key).is_none());
}

#[tokio::test]
async fn resolve_endpoint_runs_a_tracked_worker() {
    let provider = CountingProvider::new("alpha", true);
    let container = build(&[provider]);
    let app = ApiServer::with_state(
        ApiServerConfig::default(),
        AppState::from_container(&container),
    )
    .build_router();

    let response = app
        .oneshot(
            Request::builder()
                .uri("/resolve?mediaType=tv&id=1399&season=1&episode=1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let worker_id: uuid::Uuid = json["workerId"].as_str().unwrap().parse().unwrap();

    let worker = container.workers.get(&worker_id).unwrap();
    assert_eq!(worker.result.unwrap()["provider"], "alpha");
    assert!(!worker.logs.is_empty());

    container.shutdown().await.unwrap();
    assert!(container.is_shutting_down());
}
