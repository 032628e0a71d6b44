use std::fmt;
use std::net::IpAddr;
use std::sync::LazyLock;

use regex::Regex;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::{Host, Url};

static QUALITY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^0-9])(\d{3,4})p(?:$|[^0-9a-z])").unwrap());

/// Container type of a stream.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Hls,
    Mp4,
}

impl StreamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Hls => "hls",
            StreamType::Mp4 => "mp4",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hls" | "m3u8" | "application/x-mpegurl" | "application/vnd.apple.mpegurl" => {
                Some(StreamType::Hls)
            }
            "mp4" | "video/mp4" => Some(StreamType::Mp4),
            _ => None,
        }
    }

    /// Guess the type from the URL path. Anything that is not a playlist is treated as mp4.
    pub fn infer(url: &Url) -> Self {
        if url.path().to_ascii_lowercase().ends_with(".m3u8") {
            StreamType::Hls
        } else {
            StreamType::Mp4
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A playable stream produced by a hoster or returned directly by a provider.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StreamSource {
    pub url: String,
    // e.g. "1080p", "720p", "auto"
    pub quality: String,
    #[serde(rename = "type")]
    pub stream_type: StreamType,
}

impl StreamSource {
    pub fn new(url: impl Into<String>, quality: impl Into<String>, stream_type: StreamType) -> Self {
        Self {
            url: url.into(),
            quality: quality.into(),
            stream_type,
        }
    }

    /// Numeric rank used for ordering, higher is better.
    pub fn quality_rank(&self) -> u32 {
        quality_rank(&self.quality)
    }
}

impl fmt::Display for StreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {} ({})", self.stream_type, self.quality, self.url)
    }
}

/// An un-normalized `{file, quality, type}` tuple as found in decrypted payloads.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct RawSource {
    #[serde(alias = "url", alias = "src")]
    pub file: String,
    #[serde(default, alias = "label", alias = "res")]
    pub quality: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl RawSource {
    pub fn new(file: impl Into<String>) -> Self {
        Self {
            file: file.into(),
            ..Default::default()
        }
    }

    /// Validate the URL and fill in quality/type. Returns `None` for anything unsafe or malformed.
    pub fn normalize(&self) -> Option<StreamSource> {
        let url = validate_source_url(self.file.trim())?;

        let stream_type = self
            .kind
            .as_deref()
            .and_then(StreamType::parse)
            .unwrap_or_else(|| StreamType::infer(&url));

        let quality = self
            .quality
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(normalize_quality)
            .or_else(|| {
                QUALITY_REGEX
                    .captures(&url.path().to_ascii_lowercase())
                    .and_then(|c| c.get(1))
                    .map(|m| format!("{}p", m.as_str()))
            })
            .unwrap_or_else(|| "auto".to_string());

        Some(StreamSource {
            url: url.to_string(),
            quality,
            stream_type,
        })
    }
}

fn normalize_quality(quality: &str) -> String {
    let lower = quality.to_ascii_lowercase();
    if lower.chars().all(|c| c.is_ascii_digit()) {
        format!("{lower}p")
    } else {
        lower
    }
}

/// Map a quality label to a comparable height. Unknown labels rank lowest.
pub fn quality_rank(quality: &str) -> u32 {
    let lower = quality.trim().to_ascii_lowercase();
    match lower.as_str() {
        "4k" | "uhd" => return 2160,
        "2k" => return 1440,
        "fhd" => return 1080,
        "hd" => return 720,
        "sd" => return 480,
        _ => {}
    }
    lower
        .trim_end_matches('p')
        .parse::<u32>()
        .unwrap_or(0)
}

/// Whether `ip` is not publicly routable: loopback, private, link-local,
/// unspecified, broadcast or unique-local. IPv4-mapped IPv6 addresses are
/// judged as the IPv4 address they carry.
pub fn is_non_public_ip(ip: IpAddr) -> bool {
    let ip = match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4),
        v4 => v4,
    };
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Whether a URL host is `localhost` or a non-public address literal.
pub fn is_restricted_host(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(domain) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            domain.is_empty() || domain == "localhost" || domain.ends_with(".localhost")
        }
        Host::Ipv4(v4) => is_non_public_ip(IpAddr::V4(*v4)),
        Host::Ipv6(v6) => is_non_public_ip(IpAddr::V6(*v6)),
    }
}

/// Parse a source URL and reject anything that is not a public http(s) address.
pub fn validate_source_url(raw: &str) -> Option<Url> {
    let url = match Url::parse(raw) {
        Ok(url) => url,
        Err(e) => {
            debug!(url = %raw, error = %e, "Dropping unparsable source url");
            return None;
        }
    };

    if !matches!(url.scheme(), "http" | "https") {
        debug!(url = %raw, "Dropping source with non-http scheme");
        return None;
    }

    let host = url.host()?;
    if is_restricted_host(&host) {
        debug!(url = %raw, "Dropping source with local or private host");
        return None;
    }

    Some(url)
}

/// Normalize raw tuples, drop invalid ones, dedupe by URL and order by descending quality.
///
/// The sort is stable, so sources of equal quality keep their payload order.
pub fn finalize_sources(raw: &[RawSource]) -> Vec<StreamSource> {
    let mut seen = FxHashSet::default();
    let mut sources: Vec<StreamSource> = raw
        .iter()
        .filter_map(RawSource::normalize)
        .filter(|s| seen.insert(s.url.clone()))
        .collect();

    sources.sort_by(|a, b| b.quality_rank().cmp(&a.quality_rank()));
    sources
}
