//! HLS playlist proxy.
//!
//! Fetches upstream manifests with the hoster's referer and rewrites them so
//! players fetch every segment through this service.

mod playlist;

pub use playlist::PlaylistRewriter;

use std::sync::Arc;
use std::time::Duration;

use hosters::is_restricted_host;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::redirect::Policy;
use reqwest::{Client, Response};
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36";

const MAX_REDIRECTS: usize = 5;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("target not allowed: {0}")]
    Forbidden(String),
    #[error("upstream returned status {status} for {url}")]
    Upstream { status: u16, url: String },
    #[error("upstream request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("playlist parse error: {0}")]
    PlaylistParse(String),
    #[error("invalid header: {0}")]
    InvalidHeader(String),
}

impl ProxyError {
    /// Caller-side mistakes, as opposed to upstream failures.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ProxyError::InvalidUrl(_) | ProxyError::Forbidden(_) | ProxyError::InvalidHeader(_)
        )
    }

    fn from_send(e: reqwest::Error) -> Self {
        if e.is_redirect() {
            ProxyError::Forbidden(format!("redirect refused: {e}"))
        } else {
            ProxyError::Http(e)
        }
    }
}

/// Vet a target: http(s) only, no localhost or non-public literals unless the
/// host is explicitly trusted.
fn check_url(target: &Url, trusted_hosts: &[String]) -> Result<(), ProxyError> {
    match target.scheme() {
        "http" | "https" => {}
        other => {
            return Err(ProxyError::Forbidden(format!(
                "scheme {other} is not allowed"
            )));
        }
    }

    let host = target
        .host()
        .ok_or_else(|| ProxyError::InvalidUrl(format!("{target}: missing host")))?;
    let host_str = host.to_string();
    if trusted_hosts.iter().any(|h| h.eq_ignore_ascii_case(&host_str)) {
        return Ok(());
    }
    if is_restricted_host(&host) {
        return Err(ProxyError::Forbidden(format!("{host_str} is not allowed")));
    }
    Ok(())
}

/// Fetches playlists and segments on behalf of players.
pub struct PlaylistProxy {
    client: Client,
    rewriter: PlaylistRewriter,
    playlist_timeout: Duration,
    segment_timeout: Duration,
    trusted_hosts: Arc<[String]>,
}

impl PlaylistProxy {
    pub fn new(rewriter: PlaylistRewriter) -> Result<Self, ProxyError> {
        Self::with_trusted_hosts(rewriter, Vec::<String>::new())
    }

    /// Build a proxy that also accepts the given hosts even when they are
    /// loopback or private. Only for local upstreams.
    pub fn with_trusted_hosts(
        rewriter: PlaylistRewriter,
        hosts: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Self, ProxyError> {
        let trusted_hosts: Arc<[String]> = hosts.into_iter().map(Into::into).collect();

        // Every hop is vetted like the first request.
        let policy_hosts = trusted_hosts.clone();
        let policy = Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                return attempt.error(ProxyError::Forbidden("too many redirects".to_string()));
            }
            match check_url(attempt.url(), &policy_hosts) {
                Ok(()) => attempt.follow(),
                Err(e) => attempt.error(e),
            }
        });

        let client = Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .redirect(policy)
            .build()?;

        Ok(Self {
            client,
            rewriter,
            playlist_timeout: Duration::from_secs(15),
            segment_timeout: Duration::from_secs(60),
            trusted_hosts,
        })
    }

    pub fn with_segment_timeout(mut self, timeout: Duration) -> Self {
        self.segment_timeout = timeout;
        self
    }

    pub fn rewriter(&self) -> &PlaylistRewriter {
        &self.rewriter
    }

    /// Parse and vet a proxy target.
    pub fn check_target(&self, raw: &str) -> Result<Url, ProxyError> {
        let target = Url::parse(raw).map_err(|e| ProxyError::InvalidUrl(format!("{raw}: {e}")))?;
        check_url(&target, &self.trusted_hosts)?;
        Ok(target)
    }

    fn upstream_headers(referer: Option<&str>) -> Result<HeaderMap, ProxyError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_static(DEFAULT_USER_AGENT),
        );
        if let Some(referer) = referer.filter(|r| !r.is_empty()) {
            let value = HeaderValue::from_str(referer)
                .map_err(|_| ProxyError::InvalidHeader("referer".to_string()))?;
            headers.insert(header::REFERER, value.clone());
            if let Ok(origin) = Url::parse(referer)
                && let Ok(origin) = HeaderValue::from_str(&origin.origin().ascii_serialization())
            {
                headers.insert(header::ORIGIN, origin);
            }
        }
        Ok(headers)
    }

    /// Fetch an upstream playlist and rewrite it for local playback.
    pub async fn fetch_playlist(&self, url: &str, referer: Option<&str>) -> Result<String, ProxyError> {
        let target = self.check_target(url)?;
        debug!(url = %target, "Fetching upstream playlist");

        let response = self
            .client
            .get(target.clone())
            .headers(Self::upstream_headers(referer)?)
            .timeout(self.playlist_timeout)
            .send()
            .await
            .map_err(ProxyError::from_send)?;

        if !response.status().is_success() {
            return Err(ProxyError::Upstream {
                status: response.status().as_u16(),
                url: target.to_string(),
            });
        }

        // Redirects change the base for relative URIs.
        let final_url = response.url().clone();
        let body = response.bytes().await?;
        self.rewriter.rewrite(&body, &final_url, referer)
    }

    /// Open an upstream segment or key, forwarding `range` when present.
    ///
    /// The response is returned as-is, including non-2xx statuses, so callers
    /// can stream it back.
    pub async fn open_segment(
        &self,
        url: &str,
        referer: Option<&str>,
        range: Option<&str>,
    ) -> Result<Response, ProxyError> {
        let target = self.check_target(url)?;
        let mut headers = Self::upstream_headers(referer)?;
        if let Some(range) = range {
            let value = HeaderValue::from_str(range)
                .map_err(|_| ProxyError::InvalidHeader("range".to_string()))?;
            headers.insert(header::RANGE, value);
        }

        self.client
            .get(target)
            .headers(headers)
            .timeout(self.segment_timeout)
            .send()
            .await
            .map_err(ProxyError::from_send)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::HeaderMap as AxumHeaders;
    use axum::routing::get;
    use tokio::net::TcpListener;

    fn proxy() -> PlaylistProxy {
        PlaylistProxy::new(PlaylistRewriter::default()).unwrap()
    }

    fn local_proxy() -> PlaylistProxy {
        PlaylistProxy::with_trusted_hosts(PlaylistRewriter::default(), ["127.0.0.1"]).unwrap()
    }

    #[test]
    fn test_check_target_guards() {
        let proxy = proxy();
        assert!(proxy.check_target("https://cdn.example.com/a.m3u8").is_ok());
        assert!(matches!(
            proxy.check_target("file:///etc/passwd"),
            Err(ProxyError::Forbidden(_))
        ));
        assert!(matches!(
            proxy.check_target("http://localhost/a.m3u8"),
            Err(ProxyError::Forbidden(_))
        ));
        assert!(proxy.check_target("http://127.0.0.1/a").is_err());
        assert!(proxy.check_target("http://192.168.1.4/a").is_err());
        assert!(proxy.check_target("http://[::1]/a").is_err());
        assert!(proxy.check_target("http://[::ffff:127.0.0.1]/a").is_err());
        assert!(proxy.check_target("http://[::ffff:169.254.169.254]/a").is_err());
        assert!(proxy.check_target("http://[fd00::5]/a").is_err());
        assert!(matches!(
            proxy.check_target("::nope"),
            Err(ProxyError::InvalidUrl(_))
        ));

        let local = local_proxy();
        assert!(local.check_target("http://127.0.0.1/a").is_ok());
        assert!(local.check_target("http://10.0.0.1/a").is_err());
    }

    #[tokio::test]
    async fn test_fetch_playlist_sends_referer_and_rewrites() {
        let app = Router::new().route(
            "/hls/index.m3u8",
            get(|headers: AxumHeaders| async move {
                if headers.get("referer").and_then(|v| v.to_str().ok())
                    != Some("https://embed.example.com/")
                {
                    return (axum::http::StatusCode::FORBIDDEN, String::new());
                }
                (
                    axum::http::StatusCode::OK,
                    "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\nseg0.ts\n#EXT-X-ENDLIST\n"
                        .to_string(),
                )
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let proxy = local_proxy();
        let url = format!("http://{addr}/hls/index.m3u8");

        let out = proxy
            .fetch_playlist(&url, Some("https://embed.example.com/"))
            .await
            .unwrap();
        assert!(out.contains(&urlencoding::encode(&format!("http://{addr}/hls/seg0.ts")).into_owned()));

        assert!(matches!(
            proxy.fetch_playlist(&url, None).await,
            Err(ProxyError::Upstream { status: 403, .. })
        ));
    }

    #[tokio::test]
    async fn test_redirect_into_forbidden_host_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new()
            .route(
                "/bounce.ts",
                get(move || async move {
                    axum::response::Redirect::temporary(&format!("http://localhost:{}/seg.ts", addr.port()))
                }),
            )
            .route(
                "/hop.ts",
                get(|| async { axum::response::Redirect::temporary("/seg.ts") }),
            )
            .route("/seg.ts", get(|| async { "segment" }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let proxy = local_proxy();
        let refused = proxy
            .open_segment(&format!("http://{addr}/bounce.ts"), None, None)
            .await;
        assert!(matches!(refused, Err(ProxyError::Forbidden(_))));

        let followed = proxy
            .open_segment(&format!("http://{addr}/hop.ts"), None, None)
            .await
            .unwrap();
        assert_eq!(followed.text().await.unwrap(), "segment");
    }
}
