//! Client for the external decryption service.
//!
//! Hosters hand their opaque payloads to this service and get back JSON.
//! The shape of that JSON is hoster specific, so decoding is left to each hoster.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::error::HosterError;

/// Reported health of the decryption service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecryptionHealth {
    pub healthy: bool,
    pub latency_ms: Option<u64>,
    pub message: Option<String>,
}

impl DecryptionHealth {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency_ms: None,
            message: Some(message.into()),
        }
    }
}

#[async_trait]
pub trait DecryptionClient: Send + Sync {
    /// Decrypt `payload` using the named operation.
    async fn decrypt(&self, operation: &str, payload: &str)
    -> Result<serde_json::Value, HosterError>;

    async fn health(&self) -> DecryptionHealth;
}

#[derive(Serialize)]
struct DecryptRequest<'a> {
    operation: &'a str,
    payload: &'a str,
}

#[derive(Deserialize)]
struct DecryptErrorBody {
    #[serde(alias = "message")]
    error: String,
}

/// Talks to the decryption service over HTTP.
///
/// `POST {base}/decrypt` with `{operation, payload}`; `GET {base}/health`.
#[derive(Debug, Clone)]
pub struct HttpDecryptionClient {
    client: Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpDecryptionClient {
    pub fn new(client: Client, base_url: &str, timeout: Duration) -> Result<Self, HosterError> {
        let mut base_url =
            Url::parse(base_url).map_err(|e| HosterError::InvalidUrl(format!("{base_url}: {e}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, HosterError> {
        self.base_url
            .join(path)
            .map_err(|e| HosterError::InvalidUrl(e.to_string()))
    }
}

#[async_trait]
impl DecryptionClient for HttpDecryptionClient {
    async fn decrypt(
        &self,
        operation: &str,
        payload: &str,
    ) -> Result<serde_json::Value, HosterError> {
        let endpoint = self.endpoint("decrypt")?;
        debug!(operation, payload_len = payload.len(), "Submitting payload for decryption");

        let response = self
            .client
            .post(endpoint)
            .timeout(self.timeout)
            .json(&DecryptRequest { operation, payload })
            .send()
            .await
            .map_err(|e| HosterError::decryption(operation, e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| HosterError::decryption(operation, e.to_string()))?;

        if !status.is_success() {
            let message = serde_json::from_str::<DecryptErrorBody>(&body)
                .map(|b| b.error)
                .unwrap_or_else(|_| format!("status {}", status.as_u16()));
            return Err(HosterError::decryption(operation, message));
        }

        serde_json::from_str(&body).map_err(|e| HosterError::decryption(operation, e.to_string()))
    }

    async fn health(&self) -> DecryptionHealth {
        let endpoint = match self.endpoint("health") {
            Ok(endpoint) => endpoint,
            Err(e) => return DecryptionHealth::unavailable(e.to_string()),
        };

        let start = Instant::now();
        match self.client.get(endpoint).timeout(self.timeout).send().await {
            Ok(response) if response.status().is_success() => DecryptionHealth {
                healthy: true,
                latency_ms: Some(start.elapsed().as_millis() as u64),
                message: None,
            },
            Ok(response) => DecryptionHealth {
                healthy: false,
                latency_ms: Some(start.elapsed().as_millis() as u64),
                message: Some(format!("status {}", response.status().as_u16())),
            },
            Err(e) => {
                warn!(error = %e, "Decryption service health check failed");
                DecryptionHealth::unavailable(e.to_string())
            }
        }
    }
}
