//! Content providers and the provider registry.
//!
//! A provider turns a title request into either playable sources or embed URLs
//! that the hoster chain has to decode.

use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hosters::{RawSource, StreamSource, finalize_sources};
use parking_lot::RwLock;
use regex::Regex;
use reqwest::Client;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::domain::{MediaType, ResolveRequest};
use crate::error::{Error, Result};

static IFRAME_SRC_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<iframe[^>]+src\s*=\s*["']([^"']+)["']"#).unwrap());

/// What a provider can serve.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub movie: bool,
    pub tv: bool,
    pub requires_imdb_id: bool,
}

impl Capabilities {
    pub fn supports(&self, media_type: MediaType) -> bool {
        match media_type {
            MediaType::Movie => self.movie,
            MediaType::Tv => self.tv,
        }
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            movie: true,
            tv: true,
            requires_imdb_id: false,
        }
    }
}

/// Immutable provider identity.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    /// Static tie-breaker, lower first.
    pub priority: u32,
    pub capabilities: Capabilities,
    /// Audio languages the provider serves, as lowercase tags. Empty when unknown.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub languages: Vec<String>,
}

impl ProviderInfo {
    /// Position of the first preferred language this provider serves, or
    /// `preferred.len()` when it serves none of them.
    pub fn language_rank(&self, preferred: &[String]) -> usize {
        preferred
            .iter()
            .position(|lang| self.languages.iter().any(|l| l.eq_ignore_ascii_case(lang)))
            .unwrap_or(preferred.len())
    }
}

/// Result of one provider call.
#[derive(Debug, Clone)]
pub enum ProviderOutput {
    /// Playable sources returned directly.
    Sources {
        sources: Vec<StreamSource>,
        referer: Option<String>,
    },
    /// Embed URLs to run through the hoster chain, in preference order.
    Embeds(Vec<String>),
}

impl ProviderOutput {
    pub fn is_empty(&self) -> bool {
        match self {
            ProviderOutput::Sources { sources, .. } => sources.is_empty(),
            ProviderOutput::Embeds(embeds) => embeds.is_empty(),
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> &ProviderInfo;

    fn id(&self) -> &str {
        &self.info().id
    }

    /// Fetch sources or embeds for `request`. `imdb_id` is filled in when the
    /// provider requires it.
    async fn fetch(&self, request: &ResolveRequest) -> Result<ProviderOutput>;
}

struct RegisteredProvider {
    provider: Arc<dyn Provider>,
    enabled: AtomicBool,
}

/// Summary of a registered provider.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderEntry {
    #[serde(flatten)]
    pub info: ProviderInfo,
    pub enabled: bool,
    /// Registration order, the final ranking tie-breaker.
    #[serde(skip)]
    pub order: usize,
}

/// Registry of providers in registration order.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<Vec<RegisteredProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider. Ids are unique.
    pub fn register(&self, provider: Arc<dyn Provider>, enabled: bool) -> Result<()> {
        let mut providers = self.providers.write();
        if providers.iter().any(|p| p.provider.id() == provider.id()) {
            return Err(Error::config(format!(
                "provider '{}' registered twice",
                provider.id()
            )));
        }
        info!(provider = %provider.id(), enabled, "Registered provider");
        providers.push(RegisteredProvider {
            provider,
            enabled: AtomicBool::new(enabled),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Provider>> {
        self.providers
            .read()
            .iter()
            .find(|p| p.provider.id() == id)
            .map(|p| p.provider.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let providers = self.providers.read();
        let entry = providers
            .iter()
            .find(|p| p.provider.id() == id)
            .ok_or_else(|| Error::not_found("Provider", id))?;
        entry.enabled.store(enabled, Ordering::SeqCst);
        info!(provider = %id, enabled, "Provider enabled flag changed");
        Ok(())
    }

    pub fn entries(&self) -> Vec<ProviderEntry> {
        self.providers
            .read()
            .iter()
            .enumerate()
            .map(|(order, p)| ProviderEntry {
                info: p.provider.info().clone(),
                enabled: p.enabled.load(Ordering::SeqCst),
                order,
            })
            .collect()
    }

    /// Enabled providers that support `media_type`, with their registration order.
    pub fn candidates(&self, media_type: MediaType) -> Vec<(Arc<dyn Provider>, usize)> {
        self.providers
            .read()
            .iter()
            .enumerate()
            .filter(|(_, p)| {
                p.enabled.load(Ordering::SeqCst)
                    && p.provider.info().capabilities.supports(media_type)
            })
            .map(|(order, p)| (p.provider.clone(), order))
            .collect()
    }
}

/// Provider declaration as found in the providers file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDefinition {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: u32,
    /// URL template; `{id}`, `{imdbId}`, `{title}` and `{year}` are substituted.
    pub movie_url: String,
    /// URL template for episodes; also substitutes `{season}` and `{episode}`.
    #[serde(default)]
    pub tv_url: Option<String>,
    #[serde(default)]
    pub referer: Option<String>,
    #[serde(default)]
    pub requires_imdb_id: bool,
    #[serde(default)]
    pub languages: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// JSON shapes a provider endpoint may answer with.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ProviderPayload {
    Sources {
        sources: Vec<RawSource>,
        #[serde(default)]
        referer: Option<String>,
    },
    Embeds {
        embeds: Vec<String>,
    },
    Embed {
        #[serde(alias = "url", alias = "link")]
        embed: String,
    },
}

/// Provider backed by URL templates over HTTP.
///
/// JSON responses may carry `sources`, `embeds` or a single `embed`/`url`; HTML
/// responses are scanned for iframe sources.
pub struct HttpProvider {
    info: ProviderInfo,
    definition: ProviderDefinition,
    client: Client,
}

impl HttpProvider {
    pub fn new(definition: ProviderDefinition, client: Client) -> Self {
        let info = ProviderInfo {
            id: definition.id.clone(),
            name: definition.name.clone(),
            priority: definition.priority,
            capabilities: Capabilities {
                movie: !definition.movie_url.is_empty(),
                tv: definition.tv_url.is_some(),
                requires_imdb_id: definition.requires_imdb_id,
            },
            languages: definition
                .languages
                .iter()
                .map(|l| l.to_ascii_lowercase())
                .collect(),
        };
        Self {
            info,
            definition,
            client,
        }
    }

    /// Fill the URL template for `request`.
    pub fn build_url(&self, request: &ResolveRequest) -> Result<String> {
        let template = match request.media_type {
            MediaType::Movie => Some(self.definition.movie_url.as_str()),
            MediaType::Tv => self.definition.tv_url.as_deref(),
        }
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            Error::validation(format!(
                "provider {} does not serve {}",
                self.info.id, request.media_type
            ))
        })?;

        let imdb_id = request.imdb_id.as_deref().unwrap_or_default();
        if template.contains("{imdbId}") && imdb_id.is_empty() {
            return Err(Error::ContentIdLookup(format!(
                "provider {} needs an IMDb id",
                self.info.id
            )));
        }

        let title = request.title.as_deref().unwrap_or_default();
        if template.contains("{title}") && title.trim().is_empty() {
            return Err(Error::validation(format!(
                "provider {} needs a title",
                self.info.id
            )));
        }
        let year = request.year.map(|y| y.to_string()).unwrap_or_default();
        if template.contains("{year}") && year.is_empty() {
            return Err(Error::validation(format!(
                "provider {} needs a release year",
                self.info.id
            )));
        }

        Ok(template
            .replace("{id}", &urlencoding::encode(&request.id))
            .replace("{imdbId}", &urlencoding::encode(imdb_id))
            .replace("{title}", &urlencoding::encode(title.trim()))
            .replace("{year}", &year)
            .replace("{season}", &request.season.unwrap_or_default().to_string())
            .replace("{episode}", &request.episode.unwrap_or_default().to_string()))
    }

    /// Make an embed link absolute against the page it was found on.
    fn absolutize(base: &Url, src: &str) -> Option<String> {
        if let Some(rest) = src.strip_prefix("//") {
            return Some(format!("https://{rest}"));
        }
        match base.join(src) {
            Ok(url) => Some(url.to_string()),
            Err(e) => {
                debug!(base = %base, src = %src, error = %e, "Dropping unresolvable embed");
                None
            }
        }
    }

    fn parse_body(&self, base: &Url, body: &str, is_json: bool) -> Result<ProviderOutput> {
        let trimmed = body.trim_start();
        if is_json || trimmed.starts_with('{') {
            let payload: ProviderPayload = serde_json::from_str(trimmed)?;
            return Ok(match payload {
                ProviderPayload::Sources { sources, referer } => ProviderOutput::Sources {
                    sources: finalize_sources(&sources),
                    referer: referer.or_else(|| self.definition.referer.clone()),
                },
                ProviderPayload::Embeds { embeds } => ProviderOutput::Embeds(
                    embeds
                        .iter()
                        .filter_map(|e| Self::absolutize(base, e))
                        .collect(),
                ),
                ProviderPayload::Embed { embed } => {
                    ProviderOutput::Embeds(Self::absolutize(base, &embed).into_iter().collect())
                }
            });
        }

        let embeds = IFRAME_SRC_REGEX
            .captures_iter(body)
            .filter_map(|c| c.get(1))
            .filter_map(|m| Self::absolutize(base, m.as_str()))
            .collect();
        Ok(ProviderOutput::Embeds(embeds))
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn info(&self) -> &ProviderInfo {
        &self.info
    }

    async fn fetch(&self, request: &ResolveRequest) -> Result<ProviderOutput> {
        let url = self.build_url(request)?;
        debug!(provider = %self.info.id, url = %url, "Fetching provider");

        let mut builder = self.client.get(&url);
        if let Some(referer) = &self.definition.referer {
            builder = builder.header(reqwest::header::REFERER, referer);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::provider_unavailable(&self.info.id, e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::ProviderRateLimited {
                provider: self.info.id.clone(),
            });
        }
        if status == StatusCode::NOT_FOUND {
            return Err(Error::ContentNotFound(format!(
                "{} has no entry for {}",
                self.info.id, request.id
            )));
        }
        if !status.is_success() {
            return Err(Error::provider_unavailable(
                &self.info.id,
                format!("status {}", status.as_u16()),
            ));
        }

        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("json"));
        let base = response.url().clone();
        let body = response
            .text()
            .await
            .map_err(|e| Error::provider_unavailable(&self.info.id, e.to_string()))?;

        self.parse_body(&base, &body, is_json)
    }
}

/// Looks up IMDb ids for TMDB titles.
#[async_trait]
pub trait ContentIdLookup: Send + Sync {
    async fn imdb_id(&self, media_type: MediaType, tmdb_id: &str) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct ExternalIds {
    imdb_id: Option<String>,
}

/// TMDB `external_ids` client.
pub struct TmdbLookup {
    client: Client,
    api_key: String,
    base_url: String,
    timeout: Duration,
}

impl TmdbLookup {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.themoviedb.org/3";

    pub fn new(client: Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: Self::DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl ContentIdLookup for TmdbLookup {
    async fn imdb_id(&self, media_type: MediaType, tmdb_id: &str) -> Result<String> {
        let url = format!(
            "{}/{}/{}/external_ids",
            self.base_url,
            media_type,
            urlencoding::encode(tmdb_id)
        );

        let response = self
            .client
            .get(&url)
            .query(&[("api_key", self.api_key.as_str())])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::ContentIdLookup(e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::ContentIdLookup(format!(
                "TMDB returned status {} for {media_type} {tmdb_id}",
                response.status().as_u16()
            )));
        }

        let ids: ExternalIds = response
            .json()
            .await
            .map_err(|e| Error::ContentIdLookup(e.to_string()))?;

        ids.imdb_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::ContentIdLookup(format!("no IMDb id for {media_type} {tmdb_id}")))
    }
}
