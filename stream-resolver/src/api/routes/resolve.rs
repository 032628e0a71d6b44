//! Stream resolution routes.
//!
//! Every call runs as one tracked extraction worker, so it counts against the
//! extraction cap and shows up under `/workers` while it runs.

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;

use super::unavailable;
use crate::api::error::ApiResult;
use crate::api::models::ResolveResponse;
use crate::api::server::AppState;
use crate::domain::{MediaType, ResolveRequest};
use crate::error::Error;
use crate::worker::WorkerType;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(resolve_get).post(resolve_post))
}

/// Query form of [`ResolveRequest`]; `preferredLanguages` is comma separated.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveQuery {
    pub media_type: MediaType,
    pub id: String,
    pub imdb_id: Option<String>,
    pub title: Option<String>,
    pub year: Option<u32>,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub preferred_languages: Option<String>,
    pub quality: Option<String>,
}

impl From<ResolveQuery> for ResolveRequest {
    fn from(query: ResolveQuery) -> Self {
        let preferred_languages = query.preferred_languages.map(|langs| {
            langs
                .split(',')
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(String::from)
                .collect()
        });
        ResolveRequest {
            media_type: query.media_type,
            id: query.id,
            imdb_id: query.imdb_id,
            title: query.title,
            year: query.year,
            season: query.season,
            episode: query.episode,
            preferred_languages,
            quality: query.quality,
        }
    }
}

async fn resolve_get(
    State(state): State<AppState>,
    Query(query): Query<ResolveQuery>,
) -> ApiResult<Response> {
    run_resolve(state, query.into()).await
}

async fn resolve_post(
    State(state): State<AppState>,
    Json(request): Json<ResolveRequest>,
) -> ApiResult<Response> {
    run_resolve(state, request).await
}

async fn run_resolve(state: AppState, request: ResolveRequest) -> ApiResult<Response> {
    let orchestrator = state
        .orchestrator
        .clone()
        .ok_or_else(|| unavailable("Orchestrator"))?;
    let workers = state.workers.as_ref().ok_or_else(|| unavailable("Worker manager"))?;

    request.validate()?;
    let metadata = serde_json::json!({
        "key": request.key().to_string(),
        "request": request,
    });

    let (worker, result) = workers
        .spawn(WorkerType::Extraction, metadata, |worker| async move {
            worker.log(format!("Resolving {}", request.key()));
            orchestrator
                .resolve_with(&request, worker.cancellation_token(), &worker)
                .await
        })
        .await?;

    let worker_id = worker.id();
    match result {
        Ok(outcome) => Ok(Json(ResolveResponse {
            success: true,
            sources: outcome.stream.sources,
            provider: Some(outcome.stream.provider),
            referer: outcome.stream.referer,
            cached: outcome.cached,
            worker_id,
            error: None,
            attempts: Vec::new(),
        })
        .into_response()),
        Err(Error::ExtractionFailed { message, attempts }) => Ok((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ResolveResponse {
                success: false,
                sources: Vec::new(),
                provider: None,
                referer: None,
                cached: false,
                worker_id,
                error: Some(message),
                attempts,
            }),
        )
            .into_response()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::routes::test_support::{StubProvider, app, container, get, json_body, json_request, send};
    use crate::config::ResolverConfig;
    use crate::worker::WorkerStatus;

    fn state_for(container: &crate::services::ServiceContainer) -> AppState {
        AppState::from_container(container)
    }

    #[tokio::test]
    async fn test_post_resolve_then_cached() {
        let good = StubProvider::new("alpha", true);
        let container = container(ResolverConfig::default(), &[good.clone()]);
        let app = app(state_for(&container));

        let body = serde_json::json!({"mediaType": "movie", "id": "603"});
        let response = send(&app, json_request("POST", "/resolve", body.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["provider"], "alpha");
        assert_eq!(json["cached"], false);
        assert_eq!(json["sources"][0]["url"], "https://cdn.example.com/alpha/index.m3u8");

        let worker_id: uuid::Uuid = json["workerId"].as_str().unwrap().parse().unwrap();
        let worker = container.workers.get(&worker_id).unwrap();
        assert_eq!(worker.status, WorkerStatus::Succeeded);

        let response = send(&app, json_request("POST", "/resolve", body)).await;
        let json = json_body(response).await;
        assert_eq!(json["cached"], true);
        assert_eq!(good.calls(), 1);
    }

    #[tokio::test]
    async fn test_get_resolve_tv_query() {
        let good = StubProvider::new("alpha", true);
        let container = container(ResolverConfig::default(), &[good]);
        let app = app(state_for(&container));

        let response = send(
            &app,
            get("/resolve?mediaType=tv&id=1399&season=1&episode=2&preferredLanguages=en,%20de"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["success"], true);
    }

    #[tokio::test]
    async fn test_total_failure_is_503_with_attempts() {
        let bad = StubProvider::new("beta", false);
        let container = container(ResolverConfig::default(), &[bad]);
        let app = app(state_for(&container));

        let response = send(
            &app,
            json_request("POST", "/resolve", serde_json::json!({"mediaType": "movie", "id": "1"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = json_body(response).await;
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().contains("failed"));
        assert!(json["attempts"][0].as_str().unwrap().starts_with("beta:"));
    }

    #[tokio::test]
    async fn test_invalid_request_is_400() {
        let container = container(ResolverConfig::default(), &[]);
        let app = app(state_for(&container));

        // TV without season/episode.
        let response = send(
            &app,
            json_request("POST", "/resolve", serde_json::json!({"mediaType": "tv", "id": "1399"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_worker_cap_is_429() {
        let mut config = ResolverConfig::default();
        config
            .workers
            .max_concurrent
            .insert(WorkerType::Extraction, 0);
        let container = container(config, &[StubProvider::new("alpha", true)]);
        let app = app(state_for(&container));

        let response = send(
            &app,
            json_request("POST", "/resolve", serde_json::json!({"mediaType": "movie", "id": "1"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(json_body(response).await["code"], "WORKER_CAPACITY");
    }

    #[tokio::test]
    async fn test_without_services_is_503() {
        let response = send(
            &app(AppState::new()),
            json_request("POST", "/resolve", serde_json::json!({"mediaType": "movie", "id": "1"})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
