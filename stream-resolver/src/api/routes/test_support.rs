//! Fixtures shared by the route tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use hosters::{DecryptionClient, DecryptionHealth, HosterError, StreamSource, StreamType};
use tower::ServiceExt;

use crate::api::server::AppState;
use crate::config::ResolverConfig;
use crate::domain::ResolveRequest;
use crate::error::{Error, Result};
use crate::extraction::{Capabilities, Provider, ProviderInfo, ProviderOutput};
use crate::services::{Collaborators, ServiceContainer};

pub struct NoDecrypt;

#[async_trait]
impl DecryptionClient for NoDecrypt {
    async fn decrypt(
        &self,
        operation: &str,
        _payload: &str,
    ) -> std::result::Result<serde_json::Value, HosterError> {
        Err(HosterError::decryption(operation, "unavailable in tests"))
    }

    async fn health(&self) -> DecryptionHealth {
        DecryptionHealth::unavailable("test")
    }
}

pub struct StubProvider {
    info: ProviderInfo,
    succeed: bool,
    calls: AtomicUsize,
}

impl StubProvider {
    pub fn new(id: &str, succeed: bool) -> Arc<Self> {
        Arc::new(Self {
            info: ProviderInfo {
                id: id.to_string(),
                name: id.to_uppercase(),
                priority: 0,
                capabilities: Capabilities::default(),
                languages: Vec::new(),
            },
            succeed,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for StubProvider {
    fn info(&self) -> &ProviderInfo {
        &self.info
    }

    async fn fetch(&self, _request: &ResolveRequest) -> Result<ProviderOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.succeed {
            Ok(ProviderOutput::Sources {
                sources: vec![StreamSource::new(
                    format!("https://cdn.example.com/{}/index.m3u8", self.info.id),
                    "1080p",
                    StreamType::Hls,
                )],
                referer: Some(format!("https://{}.example.com/", self.info.id)),
            })
        } else {
            Err(Error::provider_unavailable(&self.info.id, "stub failure"))
        }
    }
}

/// Container with the given providers registered and no external collaborators.
pub fn container(config: ResolverConfig, providers: &[Arc<StubProvider>]) -> ServiceContainer {
    let collaborators = Collaborators {
        client: reqwest::Client::new(),
        decryptor: Arc::new(NoDecrypt),
        lookup: None,
    };
    let container = ServiceContainer::with_collaborators(config, collaborators).unwrap();
    for provider in providers {
        container
            .providers
            .register(provider.clone(), true)
            .unwrap();
    }
    container
}

pub fn app(state: AppState) -> Router {
    crate::api::routes::create_router(state)
}

pub async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

pub async fn json_body(response: Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

pub fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}
