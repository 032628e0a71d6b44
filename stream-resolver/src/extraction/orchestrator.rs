//! The extraction engine: cache checks, coalescing, ranked provider fallback.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hosters::{HosterError, HosterManager, StreamSource};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::health::HealthTracker;
use super::provider::{ContentIdLookup, Provider, ProviderOutput, ProviderRegistry};
use super::resilience::CircuitBreakerManager;
use super::validation::StreamValidator;
use crate::cache::{CacheLayer, Flight, NegativeEntry};
use crate::domain::{ResolveKey, ResolveRequest, ResolvedStream};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Budget for one provider call.
    pub provider_timeout: Duration,
    /// Probe sources before accepting them.
    pub validate_sources: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            provider_timeout: Duration::from_secs(15),
            validate_sources: false,
        }
    }
}

/// Receives progress from a running extraction.
pub trait ExtractionObserver: Send + Sync {
    fn log(&self, _message: &str) {}

    fn progress(&self, _percent: u8) {}
}

struct NoopObserver;

impl ExtractionObserver for NoopObserver {}

/// A successful extraction.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionOutcome {
    #[serde(flatten)]
    pub stream: ResolvedStream,
    /// Served from the stream cache without touching any provider.
    pub cached: bool,
    /// Shared from a concurrent identical resolution.
    pub coalesced: bool,
}

/// Input to [`rank_providers`].
#[derive(Debug, Clone, PartialEq)]
pub struct RankCandidate {
    pub id: String,
    pub score: f64,
    /// Index of the first requested language the provider serves.
    pub language_rank: usize,
    pub priority: u32,
    pub order: usize,
}

/// Order candidates by score (desc), then language preference, then priority
/// (asc), then registration order.
pub fn rank_providers(mut candidates: Vec<RankCandidate>) -> Vec<RankCandidate> {
    candidates.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.language_rank.cmp(&b.language_rank))
            .then_with(|| a.priority.cmp(&b.priority))
            .then_with(|| a.order.cmp(&b.order))
    });
    candidates
}

/// Move sources matching the requested quality to the front, keeping order otherwise.
fn prefer_quality(mut sources: Vec<StreamSource>, quality: &str) -> Vec<StreamSource> {
    if quality == "auto" {
        return sources;
    }
    sources.sort_by_key(|s| !s.quality.eq_ignore_ascii_case(quality));
    sources
}

enum ImdbState {
    Unknown,
    Found(String),
    Failed(String),
}

pub struct ExtractionOrchestrator {
    providers: Arc<ProviderRegistry>,
    health: Arc<HealthTracker>,
    breakers: Arc<CircuitBreakerManager>,
    cache: Arc<CacheLayer>,
    hosters: Arc<HosterManager>,
    lookup: Option<Arc<dyn ContentIdLookup>>,
    validator: Option<StreamValidator>,
    config: OrchestratorConfig,
}

impl ExtractionOrchestrator {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        health: Arc<HealthTracker>,
        breakers: Arc<CircuitBreakerManager>,
        cache: Arc<CacheLayer>,
        hosters: Arc<HosterManager>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            providers,
            health,
            breakers,
            cache,
            hosters,
            lookup: None,
            validator: None,
            config,
        }
    }

    pub fn with_lookup(mut self, lookup: Arc<dyn ContentIdLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    /// Validator used when `validate_sources` is on.
    pub fn with_validator(mut self, validator: StreamValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    pub fn cache(&self) -> &Arc<CacheLayer> {
        &self.cache
    }

    pub fn hosters(&self) -> &Arc<HosterManager> {
        &self.hosters
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub async fn resolve(
        &self,
        request: &ResolveRequest,
        cancel: &CancellationToken,
    ) -> Result<ExtractionOutcome> {
        self.resolve_with(request, cancel, &NoopObserver).await
    }

    /// Resolve `request`, reporting progress to `observer`.
    pub async fn resolve_with(
        &self,
        request: &ResolveRequest,
        cancel: &CancellationToken,
        observer: &dyn ExtractionObserver,
    ) -> Result<ExtractionOutcome> {
        request.validate()?;
        let key = request.key();

        loop {
            if let Some(outcome) = self.check_caches(&key)? {
                observer.log("Served from stream cache");
                observer.progress(100);
                return Ok(outcome);
            }

            match self.cache.in_flight.join(&key) {
                Flight::Leader(guard) => {
                    // A previous leader may have finished between the cache check and the join.
                    if let Some(outcome) = self.check_caches(&key)? {
                        guard.complete(Ok(outcome.stream.clone()));
                        return Ok(outcome);
                    }

                    return match self.run_providers(request, &key, cancel, observer).await {
                        Ok(stream) => {
                            guard.complete(Ok(stream.clone()));
                            Ok(ExtractionOutcome {
                                stream,
                                cached: false,
                                coalesced: false,
                            })
                        }
                        Err(Error::ExtractionFailed { message, attempts }) => {
                            guard.complete(Err(NegativeEntry {
                                message: message.clone(),
                                attempts: attempts.clone(),
                            }));
                            Err(Error::ExtractionFailed { message, attempts })
                        }
                        // Dropping the guard lets followers retry.
                        Err(e) => Err(e),
                    };
                }
                Flight::Follower(state) => {
                    debug!(key = %key, "Joining in-flight resolution");
                    observer.log("Waiting for an identical in-flight resolution");
                    let shared = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        shared = state.wait() => shared,
                    };
                    match shared {
                        Some(Ok(stream)) => {
                            observer.progress(100);
                            return Ok(ExtractionOutcome {
                                stream,
                                cached: false,
                                coalesced: true,
                            });
                        }
                        Some(Err(negative)) => {
                            return Err(Error::extraction_failed(
                                negative.message,
                                negative.attempts,
                            ));
                        }
                        None => continue,
                    }
                }
            }
        }
    }

    fn check_caches(&self, key: &ResolveKey) -> Result<Option<ExtractionOutcome>> {
        if let Some(stream) = self.cache.stream.get(key) {
            debug!(key = %key, provider = %stream.provider, "Stream cache hit");
            return Ok(Some(ExtractionOutcome {
                stream,
                cached: true,
                coalesced: false,
            }));
        }
        if let Some(negative) = self.cache.negative.get(key) {
            debug!(key = %key, "Negative cache hit");
            return Err(Error::extraction_failed(negative.message, negative.attempts));
        }
        Ok(None)
    }

    /// Ranked enabled providers supporting the request's media type.
    pub fn ranked_providers(&self, request: &ResolveRequest) -> Vec<Arc<dyn Provider>> {
        let candidates = self.providers.candidates(request.media_type);
        let preferred = request.preferred_languages.as_deref().unwrap_or_default();
        let ranked = rank_providers(
            candidates
                .iter()
                .map(|(provider, order)| RankCandidate {
                    id: provider.id().to_string(),
                    score: self.health.score(provider.id()),
                    language_rank: provider.info().language_rank(preferred),
                    priority: provider.info().priority,
                    order: *order,
                })
                .collect(),
        );

        ranked
            .into_iter()
            .filter_map(|c| candidates.iter().find(|(p, _)| p.id() == c.id))
            .map(|(p, _)| p.clone())
            .collect()
    }

    async fn run_providers(
        &self,
        request: &ResolveRequest,
        key: &ResolveKey,
        cancel: &CancellationToken,
        observer: &dyn ExtractionObserver,
    ) -> Result<ResolvedStream> {
        let ranked = self.ranked_providers(request);
        let total = ranked.len().max(1);
        let mut attempts = Vec::new();
        let mut imdb = match &request.imdb_id {
            Some(id) => ImdbState::Found(id.clone()),
            None => ImdbState::Unknown,
        };

        info!(key = %key, providers = ranked.len(), "Starting extraction");

        for (index, provider) in ranked.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let id = provider.id();
            observer.progress((index * 100 / total) as u8);

            let Some(permit) = self.breakers.try_acquire(id) else {
                debug!(provider = %id, "Circuit open, skipping provider");
                attempts.push(Error::CircuitBreakerOpen(id.to_string()).to_string());
                observer.log(&format!("Skipped {id}: circuit open"));
                continue;
            };

            observer.log(&format!("Trying provider {id}"));
            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                result = self.attempt(provider.as_ref(), request, key, &mut imdb, cancel) => result,
            };

            match result {
                Ok(stream) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    self.health.record_success(id, latency_ms);
                    permit.on_result(true);
                    self.cache.stream.insert(key.clone(), stream.clone());
                    info!(
                        key = %key,
                        provider = %id,
                        sources = stream.sources.len(),
                        latency_ms,
                        "Extraction succeeded"
                    );
                    observer.log(&format!(
                        "Provider {id} returned {} source(s)",
                        stream.sources.len()
                    ));
                    observer.progress(100);
                    return Ok(stream);
                }
                Err(e) if e.is_cancelled() => {
                    drop(permit);
                    debug!(provider = %id, "Extraction cancelled");
                    return Err(Error::Cancelled);
                }
                Err(e) => {
                    self.health.record_failure(id);
                    permit.on_result(false);
                    warn!(provider = %id, error = %e, "Provider attempt failed");
                    observer.log(&format!("Provider {id} failed: {e}"));
                    attempts.push(format!("{id}: {e}"));
                }
            }
        }

        let message = if ranked.is_empty() {
            "No providers available".to_string()
        } else {
            format!("All {} provider(s) failed", ranked.len())
        };
        warn!(key = %key, attempts = attempts.len(), "{message}");
        self.cache.negative.insert(
            key.clone(),
            NegativeEntry {
                message: message.clone(),
                attempts: attempts.clone(),
            },
        );
        Err(Error::extraction_failed(message, attempts))
    }

    async fn attempt(
        &self,
        provider: &dyn Provider,
        request: &ResolveRequest,
        key: &ResolveKey,
        imdb: &mut ImdbState,
        cancel: &CancellationToken,
    ) -> Result<ResolvedStream> {
        let id = provider.id();

        let request = if provider.info().capabilities.requires_imdb_id && request.imdb_id.is_none()
        {
            let mut scoped = request.clone();
            scoped.imdb_id = Some(self.lookup_imdb(request, imdb).await?);
            Cow::Owned(scoped)
        } else {
            Cow::Borrowed(request)
        };

        let output = tokio::time::timeout(self.config.provider_timeout, provider.fetch(&request))
            .await
            .map_err(|_| Error::ProviderTimeout {
                provider: id.to_string(),
                timeout_ms: self.config.provider_timeout.as_millis() as u64,
            })??;

        let (sources, referer) = match output {
            ProviderOutput::Sources { sources, referer } => (sources, referer),
            ProviderOutput::Embeds(embeds) => self.resolve_embeds(id, &embeds, cancel).await?,
        };

        let sources = match (&self.validator, self.config.validate_sources) {
            (Some(validator), true) => {
                validator
                    .filter(sources, referer.as_deref(), cancel)
                    .await?
            }
            _ => sources,
        };

        if sources.is_empty() {
            return Err(Error::StreamValidation(format!(
                "provider {id} produced no playable sources"
            )));
        }

        Ok(ResolvedStream {
            sources: prefer_quality(sources, &key.quality),
            provider: id.to_string(),
            referer,
        })
    }

    async fn lookup_imdb(&self, request: &ResolveRequest, state: &mut ImdbState) -> Result<String> {
        match state {
            ImdbState::Found(id) => return Ok(id.clone()),
            ImdbState::Failed(message) => return Err(Error::ContentIdLookup(message.clone())),
            ImdbState::Unknown => {}
        }

        let Some(lookup) = &self.lookup else {
            let message = "no content id lookup configured".to_string();
            *state = ImdbState::Failed(message.clone());
            return Err(Error::ContentIdLookup(message));
        };

        match lookup.imdb_id(request.media_type, &request.id).await {
            Ok(id) => {
                debug!(tmdb_id = %request.id, imdb_id = %id, "Resolved IMDb id");
                *state = ImdbState::Found(id.clone());
                Ok(id)
            }
            Err(e) => {
                *state = ImdbState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Try embeds in order; the first one yielding sources wins.
    async fn resolve_embeds(
        &self,
        provider: &str,
        embeds: &[String],
        cancel: &CancellationToken,
    ) -> Result<(Vec<StreamSource>, Option<String>)> {
        let mut last_error: Option<HosterError> = None;

        for embed in embeds {
            match self.hosters.resolve(embed, cancel).await {
                Ok(Some(resolution)) if !resolution.sources.is_empty() => {
                    debug!(provider = %provider, hoster = %resolution.hoster, "Embed resolved");
                    return Ok((resolution.sources, Some(resolution.referer)));
                }
                Ok(Some(_)) => {
                    last_error = Some(HosterError::NoSources);
                }
                Ok(None) => {
                    debug!(provider = %provider, embed = %embed, "No hoster for embed");
                }
                Err(HosterError::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    debug!(provider = %provider, embed = %embed, error = %e, "Hoster failed");
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => Error::Hoster(e),
            None => Error::ContentNotFound(format!(
                "provider {provider} returned no embed a hoster could handle"
            )),
        })
    }
}
