//! HLS proxy routes.
//!
//! `/proxy/playlist` fetches and rewrites manifests so that players come back
//! here for every variant, segment and key; `/proxy/segment` streams those
//! back with the hoster's referer and Range support.

use axum::Router;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures::TryStreamExt;
use serde::Deserialize;

use super::unavailable;
use crate::api::error::{ApiError, ApiResult};
use crate::api::server::AppState;
use crate::error::Error;
use crate::worker::WorkerType;

pub const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

#[derive(Debug, Deserialize)]
pub struct ProxyQuery {
    pub url: String,
    pub referer: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/playlist", get(proxy_playlist).options(proxy_options))
        .route("/segment", get(proxy_segment).options(proxy_options))
}

fn cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, HEAD, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Range"),
    );
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("Content-Length, Content-Range, Accept-Ranges"),
    );
}

async fn proxy_options() -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    cors_headers(&mut headers);
    (StatusCode::NO_CONTENT, headers)
}

async fn proxy_playlist(
    State(state): State<AppState>,
    Query(query): Query<ProxyQuery>,
) -> ApiResult<Response> {
    let proxy = state
        .playlist_proxy
        .clone()
        .ok_or_else(|| unavailable("Playlist proxy"))?;
    let workers = state.workers.as_ref().ok_or_else(|| unavailable("Worker manager"))?;

    // Fail fast on bad targets without taking a worker slot.
    proxy.check_target(&query.url)?;

    let metadata = serde_json::json!({ "url": query.url, "referer": query.referer });
    let mut playlist = None;
    let slot = &mut playlist;
    let (_, result) = workers
        .spawn(WorkerType::Playlist, metadata, move |worker| {
            async move {
                let token = worker.cancellation_token().clone();
                let fetched = tokio::select! {
                    _ = token.cancelled() => return Err(Error::Cancelled),
                    fetched = proxy.fetch_playlist(&query.url, query.referer.as_deref()) => fetched?,
                };
                let bytes = fetched.len();
                worker.log(format!("Rewrote playlist ({bytes} bytes)"));
                *slot = Some(fetched);
                Ok(bytes)
            }
        })
        .await?;
    result?;

    let body = playlist.ok_or_else(|| ApiError::internal("Playlist missing after rewrite"))?;
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(PLAYLIST_CONTENT_TYPE),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    cors_headers(&mut headers);

    Ok((StatusCode::OK, headers, body).into_response())
}

async fn proxy_segment(
    State(state): State<AppState>,
    Query(query): Query<ProxyQuery>,
    request_headers: HeaderMap,
) -> ApiResult<Response> {
    let proxy = state
        .playlist_proxy
        .as_ref()
        .ok_or_else(|| unavailable("Playlist proxy"))?;

    let range = request_headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok());
    let upstream = proxy
        .open_segment(&query.url, query.referer.as_deref(), range)
        .await?;

    let status = upstream.status();
    let mut out_headers = HeaderMap::new();
    let allowed = [
        header::CONTENT_TYPE,
        header::CONTENT_LENGTH,
        header::CONTENT_RANGE,
        header::ACCEPT_RANGES,
        header::CACHE_CONTROL,
        header::ETAG,
        header::LAST_MODIFIED,
        header::DATE,
    ];
    for key in allowed {
        if let Some(value) = upstream.headers().get(key.as_str()) {
            out_headers.insert(key, value.clone());
        }
    }
    cors_headers(&mut out_headers);

    let stream = upstream.bytes_stream().map_err(std::io::Error::other);
    let mut response = (status, Body::from_stream(stream)).into_response();
    *response.headers_mut() = out_headers;
    Ok(response)
}
