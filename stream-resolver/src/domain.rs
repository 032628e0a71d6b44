//! Request and result types shared across the resolution engine.

use std::fmt;

use hosters::StreamSource;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Kind of title being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Tv,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Movie => "movie",
            MediaType::Tv => "tv",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to resolve a playable stream for one title.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    pub media_type: MediaType,
    /// TMDB id of the title.
    pub id: String,
    #[serde(default)]
    pub imdb_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub year: Option<u32>,
    #[serde(default)]
    pub season: Option<u32>,
    #[serde(default)]
    pub episode: Option<u32>,
    #[serde(default)]
    pub preferred_languages: Option<Vec<String>>,
    #[serde(default)]
    pub quality: Option<String>,
}

impl ResolveRequest {
    pub fn movie(id: impl Into<String>) -> Self {
        Self {
            media_type: MediaType::Movie,
            id: id.into(),
            imdb_id: None,
            title: None,
            year: None,
            season: None,
            episode: None,
            preferred_languages: None,
            quality: None,
        }
    }

    pub fn tv(id: impl Into<String>, season: u32, episode: u32) -> Self {
        Self {
            media_type: MediaType::Tv,
            season: Some(season),
            episode: Some(episode),
            ..Self::movie(id)
        }
    }

    pub fn with_imdb_id(mut self, imdb_id: impl Into<String>) -> Self {
        self.imdb_id = Some(imdb_id.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::validation("id must not be empty"));
        }
        if self.media_type == MediaType::Tv && (self.season.is_none() || self.episode.is_none()) {
            return Err(Error::validation("tv requests require season and episode"));
        }
        Ok(())
    }

    /// Cache and coalescing key for this request.
    pub fn key(&self) -> ResolveKey {
        let (season, episode) = match self.media_type {
            MediaType::Movie => (None, None),
            MediaType::Tv => (self.season, self.episode),
        };
        ResolveKey {
            media_type: self.media_type,
            id: self.id.trim().to_string(),
            season,
            episode,
            quality: self
                .quality
                .as_deref()
                .map(|q| q.trim().to_ascii_lowercase())
                .filter(|q| !q.is_empty())
                .unwrap_or_else(|| "auto".to_string()),
        }
    }
}

/// Identity of a resolution: `{mediaType, id, qualityTag}` plus season/episode for tv.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolveKey {
    pub media_type: MediaType,
    pub id: String,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub quality: String,
}

impl fmt::Display for ResolveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.season, self.episode) {
            (Some(s), Some(e)) => write!(
                f,
                "{}:{}:s{}e{}:{}",
                self.media_type, self.id, s, e, self.quality
            ),
            _ => write!(f, "{}:{}:{}", self.media_type, self.id, self.quality),
        }
    }
}

/// A successful resolution as stored in the stream cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedStream {
    pub sources: Vec<StreamSource>,
    pub provider: String,
    pub referer: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(ResolveRequest::movie("603").validate().is_ok());
        assert!(ResolveRequest::movie("  ").validate().is_err());
        assert!(ResolveRequest::tv("1399", 1, 2).validate().is_ok());

        let mut missing_episode = ResolveRequest::tv("1399", 1, 2);
        missing_episode.episode = None;
        assert!(missing_episode.validate().is_err());
    }

    #[test]
    fn test_key_format() {
        assert_eq!(ResolveRequest::movie("603").key().to_string(), "movie:603:auto");

        let mut tv = ResolveRequest::tv("1399", 1, 2);
        tv.quality = Some("1080P".to_string());
        assert_eq!(tv.key().to_string(), "tv:1399:s1e2:1080p");
    }

    #[test]
    fn test_movie_key_ignores_episode_fields() {
        let mut a = ResolveRequest::movie("603");
        a.season = Some(3);
        assert_eq!(a.key(), ResolveRequest::movie("603").key());
    }

    #[test]
    fn test_request_deserializes_camel_case() {
        let request: ResolveRequest = serde_json::from_str(
            r#"{"mediaType":"tv","id":"1399","imdbId":"tt0944947","season":1,"episode":1}"#,
        )
        .unwrap();
        assert_eq!(request.media_type, MediaType::Tv);
        assert_eq!(request.imdb_id.as_deref(), Some("tt0944947"));
    }
}
