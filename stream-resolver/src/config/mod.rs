//! Service configuration.
//!
//! Everything is read from the environment (after `.env` is loaded) over
//! built-in defaults. Providers are declared in a separate JSON file.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use tracing::{info, warn};

use crate::api::ApiServerConfig;
use crate::cache::CacheLayerConfig;
use crate::error::{Error, Result};
use crate::extraction::{CircuitBreakerConfig, HealthConfig, OrchestratorConfig, ProviderDefinition};
use crate::worker::{WorkerConfig, WorkerType};

/// Complete service configuration.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub server: ApiServerConfig,
    pub log_dir: String,
    /// JSON file with provider declarations.
    pub providers_file: Option<PathBuf>,
    /// Base URL of the decryption collaborator.
    pub decryption_api_url: String,
    pub decryption_timeout: Duration,
    pub tmdb_api_key: Option<String>,
    pub orchestrator: OrchestratorConfig,
    pub validation_timeout: Duration,
    pub breaker: CircuitBreakerConfig,
    pub health: HealthConfig,
    pub cache: CacheLayerConfig,
    pub workers: WorkerConfig,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            server: ApiServerConfig::default(),
            log_dir: "logs".to_string(),
            providers_file: None,
            decryption_api_url: "http://127.0.0.1:3001/".to_string(),
            decryption_timeout: Duration::from_secs(10),
            tmdb_api_key: None,
            orchestrator: OrchestratorConfig::default(),
            validation_timeout: Duration::from_secs(5),
            breaker: CircuitBreakerConfig::default(),
            health: HealthConfig::default(),
            cache: CacheLayerConfig::default(),
            workers: WorkerConfig::default(),
        }
    }
}

/// Parse `name` from the environment. Unset keeps `None`; invalid values warn and keep `None`.
fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = name, value = raw, "Invalid environment value, keeping default");
            None
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        "" => None,
        other => {
            warn!(var = name, value = other, "Invalid boolean, keeping default");
            None
        }
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl ResolverConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env_or_default() -> Self {
        let mut config = Self {
            server: ApiServerConfig::from_env_or_default(),
            ..Self::default()
        };

        if let Some(dir) = env_string("LOG_DIR") {
            config.log_dir = dir;
        }
        config.providers_file = env_string("PROVIDERS_FILE").map(PathBuf::from);
        if let Some(url) = env_string("DECRYPTION_API_URL") {
            config.decryption_api_url = url;
        }
        if let Some(ms) = env_parse::<u64>("DECRYPTION_TIMEOUT_MS") {
            config.decryption_timeout = Duration::from_millis(ms);
        }
        config.tmdb_api_key = env_string("TMDB_API_KEY");

        if let Some(ms) = env_parse::<u64>("PROVIDER_TIMEOUT_MS") {
            config.orchestrator.provider_timeout = Duration::from_millis(ms);
        }
        if let Some(validate) = env_bool("VALIDATE_SOURCES") {
            config.orchestrator.validate_sources = validate;
        }
        if let Some(ms) = env_parse::<u64>("VALIDATION_TIMEOUT_MS") {
            config.validation_timeout = Duration::from_millis(ms);
        }

        if let Some(threshold) = env_parse::<u32>("BREAKER_FAILURE_THRESHOLD") {
            if threshold == 0 {
                warn!("BREAKER_FAILURE_THRESHOLD must be positive, keeping default");
            } else {
                config.breaker.failure_threshold = threshold;
            }
        }
        if let Some(ms) = env_parse::<u64>("BREAKER_COOLDOWN_MS") {
            config.breaker.cooldown_ms = ms;
        }
        if let Some(ms) = env_parse::<u64>("BREAKER_MAX_COOLDOWN_MS") {
            config.breaker.max_cooldown_ms = ms;
        }
        if let Some(multiplier) = env_parse::<f64>("BREAKER_BACKOFF_MULTIPLIER") {
            if multiplier >= 1.0 {
                config.breaker.backoff_multiplier = multiplier;
            } else {
                warn!(multiplier, "BREAKER_BACKOFF_MULTIPLIER below 1, keeping default");
            }
        }
        if let Some(jitter) = env_bool("BREAKER_JITTER") {
            config.breaker.use_jitter = jitter;
        }

        if let Some(secs) = env_parse::<u64>("STREAM_CACHE_TTL_SECS") {
            config.cache.stream_ttl = Duration::from_secs(secs);
        }
        if let Some(size) = env_parse::<usize>("STREAM_CACHE_MAX_SIZE") {
            config.cache.stream_max_size = size;
        }
        if let Some(secs) = env_parse::<u64>("VALIDATION_CACHE_TTL_SECS") {
            config.cache.validation_ttl = Duration::from_secs(secs);
        }
        if let Some(size) = env_parse::<usize>("VALIDATION_CACHE_MAX_SIZE") {
            config.cache.validation_max_size = size;
        }
        if let Some(secs) = env_parse::<u64>("NEGATIVE_CACHE_TTL_SECS") {
            config.cache.negative_ttl = Duration::from_secs(secs);
        }
        if let Some(size) = env_parse::<usize>("NEGATIVE_CACHE_MAX_SIZE") {
            config.cache.negative_max_size = size;
        }

        let mut workers = config.workers.clone();
        for (var, worker_type) in [
            ("WORKER_MAX_EXTRACTION", WorkerType::Extraction),
            ("WORKER_MAX_VALIDATION", WorkerType::Validation),
            ("WORKER_MAX_PLAYLIST", WorkerType::Playlist),
        ] {
            if let Some(max) = env_parse::<usize>(var) {
                workers.max_concurrent.insert(worker_type, max);
            }
        }
        if let Some(ms) = env_parse::<u64>("WORKER_CLEANUP_AFTER_MS") {
            workers.cleanup_after_ms = ms;
        }
        if let Some(max) = env_parse::<usize>("WORKER_MAX_LOGS") {
            workers.max_logs_per_worker = max;
        }
        match workers.validate() {
            Ok(()) => config.workers = workers,
            Err(e) => warn!(error = %e, "Invalid worker settings, keeping defaults"),
        }

        config
    }
}

/// Top-level shape of the providers file.
#[derive(Debug, serde::Deserialize)]
#[serde(untagged)]
enum ProvidersFile {
    List(Vec<ProviderDefinition>),
    Wrapped { providers: Vec<ProviderDefinition> },
}

/// Parse provider declarations: either a bare array or `{"providers": [...]}`.
pub fn parse_providers(json: &str) -> Result<Vec<ProviderDefinition>> {
    let definitions = match serde_json::from_str::<ProvidersFile>(json)? {
        ProvidersFile::List(list) => list,
        ProvidersFile::Wrapped { providers } => providers,
    };

    let mut seen = std::collections::HashSet::new();
    for def in &definitions {
        if def.id.trim().is_empty() {
            return Err(Error::config("provider id must not be empty"));
        }
        if !seen.insert(def.id.as_str()) {
            return Err(Error::config(format!("duplicate provider id '{}'", def.id)));
        }
        if def.movie_url.is_empty() && def.tv_url.is_none() {
            return Err(Error::config(format!(
                "provider '{}' declares neither movieUrl nor tvUrl",
                def.id
            )));
        }
    }
    Ok(definitions)
}

pub fn load_providers(path: &Path) -> Result<Vec<ProviderDefinition>> {
    let json = std::fs::read_to_string(path)?;
    let definitions = parse_providers(&json)?;
    info!(path = %path.display(), count = definitions.len(), "Loaded provider definitions");
    Ok(definitions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_providers_shapes() {
        let list = r#"[{"id":"a","name":"A","movieUrl":"https://a/{id}"}]"#;
        assert_eq!(parse_providers(list).unwrap().len(), 1);

        let wrapped = r#"{"providers":[
            {"id":"a","name":"A","movieUrl":"https://a/{id}","priority":2},
            {"id":"b","name":"B","movieUrl":"","tvUrl":"https://b/{id}/{season}/{episode}","requiresImdbId":true}
        ]}"#;
        let defs = parse_providers(wrapped).unwrap();
        assert_eq!(defs[0].priority, 2);
        assert!(defs[1].requires_imdb_id);
    }

    #[test]
    fn test_parse_providers_rejects_bad_entries() {
        let dup = r#"[{"id":"a","name":"A","movieUrl":"x"},{"id":"a","name":"A2","movieUrl":"y"}]"#;
        assert!(matches!(parse_providers(dup), Err(Error::Configuration(_))));

        let empty = r#"[{"id":"c","name":"C","movieUrl":""}]"#;
        assert!(parse_providers(empty).is_err());

        assert!(matches!(
            parse_providers("not json"),
            Err(Error::Serialization(_))
        ));
    }

    #[test]
    fn test_load_providers_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("providers.json");
        std::fs::write(&path, r#"[{"id":"a","name":"A","movieUrl":"https://a/{id}"}]"#).unwrap();
        assert_eq!(load_providers(&path).unwrap()[0].id, "a");
        assert!(matches!(
            load_providers(&dir.path().join("missing.json")),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_defaults() {
        let config = ResolverConfig::default();
        assert_eq!(config.cache.stream_max_size, 1000);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert!(!config.orchestrator.validate_sources);
    }
}
