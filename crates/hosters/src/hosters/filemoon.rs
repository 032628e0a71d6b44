use std::sync::LazyLock;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::config::HosterConfig;
use crate::error::HosterError;
use crate::hoster::{EncodedPayload, Hoster, HosterBase};
use crate::source::RawSource;

pub const DOMAINS: &[&str] = &["filemoon.sx", "filemoon.to", "filemoon.in"];
const EMBED_PATH: &str = r"^/[ed]/([A-Za-z0-9]+)";
const MEDIA_PATH: &str = "/e/{id}";
const TIMEOUT_MS: u64 = 15_000;

static PACKED_SCRIPT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)(eval\(function\(p,a,c,k,e,[dr]\).*?\.split\('\|'\)(?:,0,\{\})?\)\))").unwrap()
});

static PLAIN_FILE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"sources\s*:\s*\[\s*\{\s*file\s*:\s*"([^"]+)""#).unwrap()
});

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Decrypted {
    Sources { sources: Vec<RawSource> },
    Stream { stream: String },
    File(RawSource),
}

/// HTML player page with a packed jwplayer setup script.
///
/// The packed script is base64-encoded before it is handed to the decryption service.
pub struct Filemoon {
    base: HosterBase,
}

impl Filemoon {
    pub fn default_config() -> Result<HosterConfig, HosterError> {
        HosterConfig::new(
            "filemoon",
            "Filemoon",
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

    fn extract_payload(html: &str) -> Result<EncodedPayload, HosterError> {
        if let Some(packed) = PACKED_SCRIPT_REGEX
            .captures(html)
            .and_then(|c| c.get(1))
        {
            return Ok(EncodedPayload::Encrypted(STANDARD.encode(packed.as_str())));
        }

        if let Some(file) = PLAIN_FILE_REGEX.captures(html).and_then(|c| c.get(1)) {
            return Ok(EncodedPayload::Plain(vec![RawSource::new(file.as_str())]));
        }

        Err(HosterError::PayloadNotFound(
            "no packed player script in page".to_string(),
        ))
    }
}

#[async_trait]
impl Hoster for Filemoon {
    fn base(&self) -> &HosterBase {
        &self.base
    }

    async fn fetch_payload(&self, embed: &Url) -> Result<EncodedPayload, HosterError> {
        let media = self.media_url(embed)?;
        let html = self.base.get_text(media, embed).await?;
        Self::extract_payload(&html)
    }

    fn decode(&self, decrypted: serde_json::Value) -> Result<Vec<RawSource>, HosterError> {
        let decoded: Decrypted = serde_json::from_value(decrypted)
            .map_err(|e| HosterError::UnexpectedPayload(e.to_string()))?;
        Ok(match decoded {
            Decrypted::Sources { sources } => sources,
            Decrypted::Stream { stream } => vec![RawSource::new(stream)],
            Decrypted::File(source) => vec![source],
        })
    }
}
