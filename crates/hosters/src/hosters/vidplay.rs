use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::config::HosterConfig;
use crate::error::HosterError;
use crate::hoster::{EncodedPayload, Hoster, HosterBase};
use crate::source::RawSource;

pub const DOMAINS: &[&str] = &["vidplay.online", "vidplay.site", "mcloud.bz"];
const EMBED_PATH: &str = r"^/e/([A-Za-z0-9]+)";
const MEDIA_PATH: &str = "/mediainfo/{id}";
const TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Deserialize)]
struct MediaInfoResponse {
    result: MediaInfoResult,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MediaInfoResult {
    Encoded(String),
    Plain { sources: Vec<RawSource> },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Decrypted {
    Wrapped { sources: Vec<RawSource> },
    Nested { result: NestedSources },
    Single(RawSource),
}

#[derive(Debug, Deserialize)]
struct NestedSources {
    sources: Vec<RawSource>,
}

/// `mediainfo` JSON endpoint whose `result` field carries the encoded source list.
pub struct Vidplay {
    base: HosterBase,
}

impl Vidplay {
    pub fn default_config() -> Result<HosterConfig, HosterError> {
        HosterConfig::new(
            "vidplay",
            "VidPlay",
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
        Self {
            base: HosterBase::new(config, client),
        }
    }
}

#[async_trait]
impl Hoster for Vidplay {
    fn base(&self) -> &HosterBase {
        &self.base
    }

    /// The embed query string (subtitle and autostart flags) has to survive the rewrite.
    fn media_url(&self, embed: &Url) -> Result<Url, HosterError> {
        let mut media = self.config().media_url(embed)?;
        media.set_query(embed.query());
        Ok(media)
    }

    async fn fetch_payload(&self, embed: &Url) -> Result<EncodedPayload, HosterError> {
        let media = self.media_url(embed)?;
        let response: MediaInfoResponse = self.base.get_json(media, embed).await?;

        match response.result {
            MediaInfoResult::Encoded(payload) if payload.is_empty() => Err(
                HosterError::PayloadNotFound("empty mediainfo result".to_string()),
            ),
            MediaInfoResult::Encoded(payload) => Ok(EncodedPayload::Encrypted(payload)),
            MediaInfoResult::Plain { sources } => Ok(EncodedPayload::Plain(sources)),
        }
    }

    fn decode(&self, decrypted: serde_json::Value) -> Result<Vec<RawSource>, HosterError> {
        let decoded: Decrypted = serde_json::from_value(decrypted)
            .map_err(|e| HosterError::UnexpectedPayload(e.to_string()))?;
        Ok(match decoded {
            Decrypted::Wrapped { sources } => sources,
            Decrypted::Nested { result } => result.sources,
            Decrypted::Single(source) => vec![source],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hoster::test_support::{StubDecryptor, serve};
    use axum::Router;
    use axum::extract::{Path, RawQuery};
    use axum::routing::get;
    use serde_json::json;

    #[test]
    fn test_media_url_keeps_query() {
        let hoster = Vidplay::new(Client::new()).unwrap();
        let embed = Url::parse("https://vidplay.online/e/K8R6OOjS7?t=4&autostart=true").unwrap();
        let media = hoster.media_url(&embed).unwrap();
        assert_eq!(
            media.as_str(),
            "https://vidplay.online/mediainfo/K8R6OOjS7?t=4&autostart=true"
        );
    }

    #[tokio::test]
    async fn test_encoded_result_is_decoded() {
        let app = Router::new().route(
            "/mediainfo/{id}",
            get(|Path(id): Path<String>, RawQuery(q): RawQuery| async move {
                axum::Json(json!({ "result": format!("{id}|{}", q.unwrap_or_default()) }))
            }),
        );
        let addr = serve(app).await;
        let decryptor = StubDecryptor::new(json!({
            "result": {"sources": [{"file": "https://cdn.example.com/list.m3u8"}]}
        }));

        let config = Vidplay::default_config()
            .unwrap()
            .with_domains(&["127.0.0.1"]);
        let hoster = Vidplay::with_config(config, Client::new());
        let embed = Url::parse(&format!("http://{addr}/e/abc?sub=en")).unwrap();

        let sources = hoster.resolve(&embed, &decryptor).await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(
            decryptor.last_payload.lock().clone(),
            Some(("vidplay".to_string(), "abc|sub=en".to_string()))
        );
    }

    #[test]
    fn test_decode_rejects_unknown_shape() {
        let hoster = Vidplay::new(Client::new()).unwrap();
        let err = hoster.decode(json!({"nothing": true})).unwrap_err();
        assert!(matches!(err, HosterError::UnexpectedPayload(_)));
    }
}
