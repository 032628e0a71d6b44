use std::str::FromStr;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, RequestBuilder};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::config::HosterConfig;
use crate::decrypt::DecryptionClient;
use crate::error::HosterError;
use crate::source::{RawSource, StreamSource, finalize_sources};

pub(crate) const DEFAULT_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// What a hoster's media endpoint handed back.
#[derive(Debug, Clone)]
pub enum EncodedPayload {
    /// Opaque blob that must go through the decryption service.
    Encrypted(String),
    /// Source list that was already in the clear.
    Plain(Vec<RawSource>),
}

/// Shared state for every hoster: its config, the HTTP client and default headers.
#[derive(Debug, Clone)]
pub struct HosterBase {
    pub config: HosterConfig,
    pub client: Client,
    headers: HeaderMap,
}

impl HosterBase {
    pub fn new(config: HosterConfig, client: Client) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            HeaderValue::from_static(DEFAULT_UA),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("text/html,application/json,*/*;q=0.8"),
        );

        Self {
            config,
            client,
            headers,
        }
    }

    pub fn add_header_str<K: AsRef<str>, V: AsRef<str>>(&mut self, key: K, value: V) {
        match (
            HeaderName::from_str(key.as_ref()),
            HeaderValue::from_str(value.as_ref()),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => debug!(hoster = %self.config.id, "Invalid header; skipping"),
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Build a request carrying the default headers and the embed page as referer.
    pub fn request(&self, method: Method, url: Url, referer: &Url) -> RequestBuilder {
        let mut headers = self.headers.clone();
        if let Ok(value) = HeaderValue::from_str(referer.as_str()) {
            headers.insert(reqwest::header::REFERER, value);
        }
        self.client
            .request(method, url)
            .headers(headers)
            .timeout(self.config.timeout())
    }

    pub async fn get_text(&self, url: Url, referer: &Url) -> Result<String, HosterError> {
        let response = self.request(Method::GET, url.clone(), referer).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(HosterError::UpstreamStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.text().await?)
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        referer: &Url,
    ) -> Result<T, HosterError> {
        let body = self.get_text(url, referer).await?;
        Ok(serde_json::from_str(&body)?)
    }
}

/// A hoster turns an embed URL into playable sources.
///
/// Implementors only provide the fetch and decode steps; [`Hoster::resolve`] runs
/// the shared match, fetch, decrypt, decode, finalize sequence.
#[async_trait]
pub trait Hoster: Send + Sync {
    fn base(&self) -> &HosterBase;

    fn config(&self) -> &HosterConfig {
        &self.base().config
    }

    fn id(&self) -> &str {
        &self.config().id
    }

    fn can_handle(&self, url: &Url) -> bool {
        self.config().matches(url)
    }

    /// Operation name sent to the decryption service.
    fn decrypt_operation(&self) -> &str {
        self.id()
    }

    fn media_url(&self, embed: &Url) -> Result<Url, HosterError> {
        self.config().media_url(embed)
    }

    /// Fetch the hoster's media endpoint for `embed`.
    async fn fetch_payload(&self, embed: &Url) -> Result<EncodedPayload, HosterError>;

    /// Turn the decryption service's JSON into raw source tuples.
    fn decode(&self, decrypted: serde_json::Value) -> Result<Vec<RawSource>, HosterError>;

    async fn resolve(
        &self,
        embed: &Url,
        decryptor: &dyn DecryptionClient,
    ) -> Result<Vec<StreamSource>, HosterError> {
        if !self.can_handle(embed) {
            return Err(HosterError::UnsupportedUrl {
                hoster: self.id().to_string(),
                url: embed.to_string(),
            });
        }

        let raw = match self.fetch_payload(embed).await? {
            EncodedPayload::Plain(raw) => raw,
            EncodedPayload::Encrypted(payload) => {
                let decrypted = decryptor
                    .decrypt(self.decrypt_operation(), &payload)
                    .await?;
                self.decode(decrypted)?
            }
        };

        let sources = finalize_sources(&raw);
        debug!(
            hoster = %self.id(),
            raw = raw.len(),
            kept = sources.len(),
            "Decoded hoster sources"
        );
        if sources.is_empty() {
            return Err(HosterError::NoSources);
        }
        Ok(sources)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use axum::Router;
    use tokio::net::TcpListener;

    use crate::decrypt::{DecryptionClient, DecryptionHealth};
    use crate::error::HosterError;

    /// Decryptor returning a fixed value and counting calls.
    pub struct StubDecryptor {
        pub response: serde_json::Value,
        pub calls: Arc<AtomicUsize>,
        pub last_payload: parking_lot::Mutex<Option<(String, String)>>,
    }

    impl StubDecryptor {
        pub fn new(response: serde_json::Value) -> Self {
            Self {
                response,
                calls: Arc::new(AtomicUsize::new(0)),
                last_payload: parking_lot::Mutex::new(None),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DecryptionClient for StubDecryptor {
        async fn decrypt(
            &self,
            operation: &str,
            payload: &str,
        ) -> Result<serde_json::Value, HosterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_payload.lock() = Some((operation.to_string(), payload.to_string()));
            Ok(self.response.clone())
        }

        async fn health(&self) -> DecryptionHealth {
            DecryptionHealth {
                healthy: true,
                latency_ms: Some(0),
                message: None,
            }
        }
    }

    /// Serve `app` on an ephemeral local port and return `host:port`.
    pub async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr.to_string()
    }
}
