use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::config::HosterConfig;
use crate::error::HosterError;
use crate::hoster::{EncodedPayload, Hoster, HosterBase};
use crate::source::RawSource;

pub const DOMAINS: &[&str] = &["megacloud.tv", "megacloud.blog"];
const EMBED_PATH: &str = r"^/embed-2/(?:v\d+/)?e-1/([A-Za-z0-9]+)";
const MEDIA_PATH: &str = "/embed-2/ajax/e-1/getSources?id={id}";
const TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Deserialize)]
struct GetSourcesResponse {
    sources: SourcesField,
    #[serde(default)]
    encrypted: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SourcesField {
    Encoded(String),
    List(Vec<RawSource>),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Decrypted {
    Wrapped { sources: Vec<RawSource> },
    List(Vec<RawSource>),
    Single(RawSource),
}

/// `getSources` JSON endpoint; the source list is either plain or an encrypted string.
pub struct Megacloud {
    base: HosterBase,
}

impl Megacloud {
    pub fn default_config() -> Result<HosterConfig, HosterError> {
        HosterConfig::new(
            "megacloud",
            "MegaCloud",
            DOMAINS,
            EMBED_PATH,
            MEDIA_PATH,
            TIMEOUT_MS,
        )
    }

    pub fn new(client: Client) -> Result<Self, HosterError> {
        Ok(Self::with_config(Self::default_config()?, client))
    }

    pub fn with_config(config: HosterConfig, client: Client) -> Self {
        let mut base = HosterBase::new(config, client);
        base.add_header_str("X-Requested-With", "XMLHttpRequest");
        Self { base }
    }
}

#[async_trait]
impl Hoster for Megacloud {
    fn base(&self) -> &HosterBase {
        &self.base
    }

    async fn fetch_payload(&self, embed: &Url) -> Result<EncodedPayload, HosterError> {
        let media = self.media_url(embed)?;
        let response: GetSourcesResponse = self.base.get_json(media, embed).await?;

        match response.sources {
            SourcesField::Encoded(payload) if !payload.is_empty() => {
                Ok(EncodedPayload::Encrypted(payload))
            }
            SourcesField::Encoded(_) => Err(HosterError::PayloadNotFound(
                "empty sources string".to_string(),
            )),
            SourcesField::List(list) if response.encrypted => Err(HosterError::UnexpectedPayload(
                format!("encrypted flag set on plain list of {}", list.len()),
            )),
            SourcesField::List(list) => Ok(EncodedPayload::Plain(list)),
        }
    }

    fn decode(&self, decrypted: serde_json::Value) -> Result<Vec<RawSource>, HosterError> {
        let decoded: Decrypted = serde_json::from_value(decrypted)
            .map_err(|e| HosterError::UnexpectedPayload(e.to_string()))?;
        Ok(match decoded {
            Decrypted::Wrapped { sources } | Decrypted::List(sources) => sources,
            Decrypted::Single(source) => vec![source],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hoster::test_support::{StubDecryptor, serve};
    use crate::source::StreamType;
    use axum::Router;
    use axum::extract::Query;
    use axum::routing::get;
    use serde_json::json;
    use std::collections::HashMap;

    fn local(client: Client) -> Megacloud {
        let config = Megacloud::default_config()
            .unwrap()
            .with_domains(&["127.0.0.1"]);
        Megacloud::with_config(config, client)
    }

    #[test]
    fn test_matches_embed_variants() {
        let hoster = Megacloud::new(Client::new()).unwrap();
        let url = |s: &str| Url::parse(s).unwrap();

        assert!(hoster.can_handle(&url("https://megacloud.tv/embed-2/e-1/AbC123?k=1")));
        assert!(hoster.can_handle(&url("https://megacloud.blog/embed-2/v2/e-1/AbC123")));
        assert!(!hoster.can_handle(&url("https://megacloud.tv/watch/AbC123")));
        assert!(!hoster.can_handle(&url("https://megacloud.example.com/embed-2/e-1/AbC123")));
    }

    #[tokio::test]
    async fn test_encrypted_sources_go_through_decryptor() {
        let app = Router::new().route(
            "/embed-2/ajax/e-1/getSources",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                axum::Json(json!({
                    "sources": format!("blob-{}", q.get("id").cloned().unwrap_or_default()),
                    "encrypted": true,
                }))
            }),
        );
        let addr = serve(app).await;

        let decryptor = StubDecryptor::new(json!({
            "sources": [
                {"file": "https://cdn.example.com/480/index.m3u8", "label": "480p"},
                {"file": "https://cdn.example.com/1080/index.m3u8", "label": "1080p"},
            ]
        }));

        let hoster = local(Client::new());
        let embed = Url::parse(&format!("http://{addr}/embed-2/e-1/xyz789")).unwrap();
        let sources = hoster.resolve(&embed, &decryptor).await.unwrap();

        assert_eq!(decryptor.calls(), 1);
        assert_eq!(
            decryptor.last_payload.lock().clone(),
            Some(("megacloud".to_string(), "blob-xyz789".to_string()))
        );
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].quality, "1080p");
        assert_eq!(sources[0].stream_type, StreamType::Hls);
    }

    #[tokio::test]
    async fn test_plain_sources_skip_decryptor() {
        let app = Router::new().route(
            "/embed-2/ajax/e-1/getSources",
            get(|| async {
                axum::Json(json!({
                    "sources": [{"file": "https://cdn.example.com/master.m3u8", "type": "hls"}],
                    "encrypted": false,
                }))
            }),
        );
        let addr = serve(app).await;
        let decryptor = StubDecryptor::new(json!({}));

        let hoster = local(Client::new());
        let embed = Url::parse(&format!("http://{addr}/embed-2/e-1/plain1")).unwrap();
        let sources = hoster.resolve(&embed, &decryptor).await.unwrap();

        assert_eq!(decryptor.calls(), 0);
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].quality, "auto");
    }

    #[tokio::test]
    async fn test_private_sources_are_dropped() {
        let app = Router::new().route(
            "/embed-2/ajax/e-1/getSources",
            get(|| async {
                axum::Json(json!({
                    "sources": [{"file": "http://127.0.0.1:9/steal.m3u8"}],
                    "encrypted": false,
                }))
            }),
        );
        let addr = serve(app).await;
        let decryptor = StubDecryptor::new(json!({}));

        let hoster = local(Client::new());
        let embed = Url::parse(&format!("http://{addr}/embed-2/e-1/evil")).unwrap();
        let err = hoster.resolve(&embed, &decryptor).await.unwrap_err();
        assert!(matches!(err, HosterError::NoSources));
    }
}
