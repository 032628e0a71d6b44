use thiserror::Error;

#[derive(Debug, Error)]
pub enum HosterError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("url does not match hoster {hoster}: {url}")]
    UnsupportedUrl { hoster: String, url: String },
    #[error("http error: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("upstream returned status {status} for {url}")]
    UpstreamStatus { status: u16, url: String },
    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("payload not found: {0}")]
    PayloadNotFound(String),
    #[error("decryption api error ({operation}): {message}")]
    DecryptionApi { operation: String, message: String },
    #[error("unexpected decrypted payload: {0}")]
    UnexpectedPayload(String),
    #[error("no playable sources")]
    NoSources,
    #[error("hoster {hoster} timed out after {timeout_ms}ms")]
    Timeout { hoster: String, timeout_ms: u64 },
    #[error("cancelled")]
    Cancelled,
}

impl HosterError {
    pub fn decryption(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DecryptionApi {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Whether this error originated in the decryption collaborator.
    pub fn is_decryption(&self) -> bool {
        matches!(self, Self::DecryptionApi { .. })
    }
}
