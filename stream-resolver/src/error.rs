//! Application-wide error types.

use thiserror::Error;

use crate::proxy::ProxyError;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Provider {provider} unavailable: {message}")]
    ProviderUnavailable { provider: String, message: String },

    #[error("Provider {provider} timed out after {timeout_ms}ms")]
    ProviderTimeout { provider: String, timeout_ms: u64 },

    #[error("Provider {provider} rate limited")]
    ProviderRateLimited { provider: String },

    #[error("Circuit breaker open for provider {0}")]
    CircuitBreakerOpen(String),

    #[error("Stream validation failed: {0}")]
    StreamValidation(String),

    #[error("Content not found: {0}")]
    ContentNotFound(String),

    #[error("Content id lookup failed: {0}")]
    ContentIdLookup(String),

    #[error("Hoster error: {0}")]
    Hoster(#[from] hosters::HosterError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Extraction failed: {message}")]
    ExtractionFailed {
        message: String,
        attempts: Vec<String>,
    },

    #[error("Worker capacity reached for {worker_type} (max {max})")]
    WorkerCapacity { worker_type: String, max: usize },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn provider_unavailable(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderUnavailable {
            provider: provider.into(),
            message: message.into(),
        }
    }

    pub fn extraction_failed(message: impl Into<String>, attempts: Vec<String>) -> Self {
        Self::ExtractionFailed {
            message: message.into(),
            attempts,
        }
    }

    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Hoster(hosters::HosterError::Cancelled)
        )
    }
}
