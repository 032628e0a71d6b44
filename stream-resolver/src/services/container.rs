//! Service container for dependency injection.
//!
//! Builds every registry and service once at startup and owns the background
//! tasks' cancellation token.

use std::sync::Arc;
use std::time::Duration;

use hosters::{DecryptionClient, HosterManager, HttpDecryptionClient};
use reqwest::Client;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{CacheLayer, CacheLayerStats};
use crate::config::{ResolverConfig, load_providers};
use crate::error::{Error, Result};
use crate::extraction::{
    CircuitBreakerManager, ContentIdLookup, ExtractionOrchestrator, HealthTracker, HttpProvider,
    ProviderRegistry, StreamValidator, TmdbLookup,
};
use crate::proxy::{DEFAULT_USER_AGENT, PlaylistProxy, PlaylistRewriter};
use crate::worker::WorkerManager;

/// Default shutdown timeout.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// External collaborators, replaceable for tests.
pub struct Collaborators {
    pub client: Client,
    pub decryptor: Arc<dyn DecryptionClient>,
    pub lookup: Option<Arc<dyn ContentIdLookup>>,
}

impl Collaborators {
    /// HTTP-backed collaborators as configured.
    pub fn from_config(config: &ResolverConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(20)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;

        let decryptor: Arc<dyn DecryptionClient> = Arc::new(HttpDecryptionClient::new(
            client.clone(),
            &config.decryption_api_url,
            config.decryption_timeout,
        )?);

        let lookup = config.tmdb_api_key.as_ref().map(|key| {
            Arc::new(TmdbLookup::new(client.clone(), key.clone())) as Arc<dyn ContentIdLookup>
        });
        if lookup.is_none() {
            warn!("TMDB_API_KEY not set; providers requiring IMDb ids will fail without one");
        }

        Ok(Self {
            client,
            decryptor,
            lookup,
        })
    }
}

/// Service container holding all application services.
pub struct ServiceContainer {
    pub config: ResolverConfig,
    pub http_client: Client,
    pub cache: Arc<CacheLayer>,
    pub health: Arc<HealthTracker>,
    pub breakers: Arc<CircuitBreakerManager>,
    pub providers: Arc<ProviderRegistry>,
    pub hosters: Arc<HosterManager>,
    pub orchestrator: Arc<ExtractionOrchestrator>,
    pub workers: Arc<WorkerManager>,
    pub playlist_proxy: Arc<PlaylistProxy>,
    cancellation_token: CancellationToken,
}

impl ServiceContainer {
    /// Build the container with HTTP collaborators and providers from `PROVIDERS_FILE`.
    pub fn new(config: ResolverConfig) -> Result<Self> {
        let collaborators = Collaborators::from_config(&config)?;
        let container = Self::with_collaborators(config, collaborators)?;

        if let Some(path) = &container.config.providers_file {
            for definition in load_providers(path)? {
                let enabled = definition.enabled;
                let provider = HttpProvider::new(definition, container.http_client.clone());
                container.providers.register(Arc::new(provider), enabled)?;
            }
        } else {
            warn!("PROVIDERS_FILE not set; no providers registered");
        }

        Ok(container)
    }

    /// Build the container around the given collaborators. No providers are registered.
    pub fn with_collaborators(config: ResolverConfig, collaborators: Collaborators) -> Result<Self> {
        let Collaborators {
            client,
            decryptor,
            lookup,
        } = collaborators;

        let cache = Arc::new(CacheLayer::new(config.cache.clone()));
        let health = Arc::new(HealthTracker::new(config.health.clone()));
        let breakers = Arc::new(CircuitBreakerManager::new(config.breaker.clone()));
        let providers = Arc::new(ProviderRegistry::new());
        let hosters = Arc::new(HosterManager::with_defaults(client.clone(), decryptor)?);
        let workers = Arc::new(WorkerManager::new(config.workers.clone())?);

        let validator = StreamValidator::new(client.clone(), cache.clone(), config.validation_timeout)
            .with_workers(workers.clone());
        let mut orchestrator = ExtractionOrchestrator::new(
            providers.clone(),
            health.clone(),
            breakers.clone(),
            cache.clone(),
            hosters.clone(),
            config.orchestrator.clone(),
        )
        .with_validator(validator);
        if let Some(lookup) = lookup {
            orchestrator = orchestrator.with_lookup(lookup);
        }

        let playlist_proxy = Arc::new(PlaylistProxy::new(PlaylistRewriter::default())?);

        Ok(Self {
            config,
            http_client: client,
            cache,
            health,
            breakers,
            providers,
            hosters,
            orchestrator: Arc::new(orchestrator),
            workers,
            playlist_proxy,
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Replace the playlist proxy, e.g. to allow local upstreams.
    pub fn with_playlist_proxy(mut self, proxy: PlaylistProxy) -> Self {
        self.playlist_proxy = Arc::new(proxy);
        self
    }

    /// Start background maintenance: cache sweeps and worker reaping.
    pub fn initialize(&self) {
        self.cache.start_cleanup(self.cancellation_token.child_token());
        self.workers
            .start_reaper(self.cancellation_token.child_token());
        info!(
            providers = self.providers.len(),
            hosters = ?self.hosters.hoster_ids(),
            "Services initialized"
        );
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Stop background tasks and cancel running workers.
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<()> {
        info!("Shutting down services (timeout: {:?})", timeout);
        self.cancellation_token.cancel();

        if tokio::time::timeout(timeout, self.workers.shutdown())
            .await
            .is_err()
        {
            warn!("Shutdown timeout reached, abandoning remaining workers");
        }

        info!("Services shut down");
        Ok(())
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            provider_count: self.providers.len(),
            in_flight: self.cache.in_flight.len(),
            cache: self.cache.stats(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    pub provider_count: usize,
    pub in_flight: usize,
    pub cache: CacheLayerStats,
}
