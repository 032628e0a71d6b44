//! Stream extraction: providers, health scoring, circuit breaking and the
//! orchestrator that ties them to the hoster chain and caches.

pub mod health;
pub mod orchestrator;
pub mod provider;
pub mod resilience;
pub mod validation;

pub use health::{HealthConfig, HealthTracker, NEUTRAL_SCORE, ProviderHealth};
pub use orchestrator::{
    ExtractionObserver, ExtractionOrchestrator, ExtractionOutcome, OrchestratorConfig,
    RankCandidate, rank_providers,
};
pub use provider::{
    Capabilities, ContentIdLookup, HttpProvider, Provider, ProviderDefinition, ProviderEntry,
    ProviderInfo, ProviderOutput, ProviderRegistry, TmdbLookup,
};
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerManager, CircuitBreakerSnapshot,
    CircuitPermit, CircuitState,
};
pub use validation::StreamValidator;
