use std::time::Duration;

use regex::Regex;
use url::Url;

use crate::error::HosterError;

/// Static metadata describing one hoster implementation.
#[derive(Debug, Clone)]
pub struct HosterConfig {
    pub id: String,
    pub name: String,
    /// Hosts served by this hoster. Subdomains match too.
    pub domains: Vec<String>,
    /// Matched against the embed URL path. Capture group 1 is the media id.
    pub embed_path_pattern: Regex,
    /// Path (and optional query) of the media endpoint; `{id}` is replaced by the media id.
    pub media_path_pattern: String,
    pub timeout_ms: u64,
}

impl HosterConfig {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        domains: &[&str],
        embed_path_pattern: &str,
        media_path_pattern: impl Into<String>,
        timeout_ms: u64,
    ) -> Result<Self, HosterError> {
        let embed_path_pattern = Regex::new(embed_path_pattern)
            .map_err(|e| HosterError::InvalidUrl(format!("bad embed pattern: {e}")))?;

        Ok(Self {
            id: id.into(),
            name: name.into(),
            domains: domains.iter().map(|d| d.to_ascii_lowercase()).collect(),
            embed_path_pattern,
            media_path_pattern: media_path_pattern.into(),
            timeout_ms,
        })
    }

    /// Replace the domain list, keeping everything else.
    pub fn with_domains(mut self, domains: &[&str]) -> Self {
        self.domains = domains.iter().map(|d| d.to_ascii_lowercase()).collect();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn matches_domain(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        self.domains.iter().any(|domain| {
            host == *domain
                || host
                    .strip_suffix(domain.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }

    pub fn matches(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https")
            && self.matches_domain(url)
            && self.embed_path_pattern.is_match(url.path())
    }

    /// Extract the media id from an embed URL.
    pub fn media_id<'a>(&self, url: &'a Url) -> Result<&'a str, HosterError> {
        self.embed_path_pattern
            .captures(url.path())
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
            .ok_or_else(|| HosterError::UnsupportedUrl {
                hoster: self.id.clone(),
                url: url.to_string(),
            })
    }

    /// Rewrite an embed URL to the hoster's media endpoint on the same origin.
    pub fn media_url(&self, embed: &Url) -> Result<Url, HosterError> {
        let id = self.media_id(embed)?;
        let path = self.media_path_pattern.replace("{id}", id);
        embed
            .join(&path)
            .map_err(|e| HosterError::InvalidUrl(format!("{path}: {e}")))
    }
}
