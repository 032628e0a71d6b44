//! Provider status and maintenance actions.

use axum::{Json, Router, extract::State, routing::get};

use super::unavailable;
use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{
    ActionResponse, ProviderStatus, StatusActionRequest, StatusResponse, StatusSummary,
};
use crate::api::server::AppState;
use crate::error::Error;
use crate::extraction::ExtractionOrchestrator;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(get_status).post(post_action))
}

async fn get_status(State(state): State<AppState>) -> ApiResult<Json<StatusResponse>> {
    let orchestrator = state
        .orchestrator
        .as_ref()
        .ok_or_else(|| unavailable("Orchestrator"))?;

    let providers: Vec<ProviderStatus> = orchestrator
        .providers()
        .entries()
        .into_iter()
        .map(|entry| {
            let id = entry.info.id;
            ProviderStatus {
                score: orchestrator.health().score(&id),
                circuit_breaker: orchestrator.breakers().snapshot(&id),
                health: orchestrator.health().snapshot(&id),
                name: entry.info.name,
                priority: entry.info.priority,
                enabled: entry.enabled,
                id,
            }
        })
        .collect();

    let summary = StatusSummary {
        total: providers.len(),
        enabled: providers.iter().filter(|p| p.enabled).count(),
        open: providers
            .iter()
            .filter(|p| p.circuit_breaker.is_open)
            .count(),
        half_open: providers
            .iter()
            .filter(|p| p.circuit_breaker.is_half_open)
            .count(),
    };

    let cache = orchestrator.cache();
    Ok(Json(StatusResponse {
        providers,
        summary,
        cache: cache.stats(),
        in_flight: cache.in_flight.len(),
        decryption: orchestrator.hosters().decryption_health().await,
    }))
}

fn require_provider<'a>(
    orchestrator: &ExtractionOrchestrator,
    provider_id: Option<&'a str>,
) -> ApiResult<&'a str> {
    let id = provider_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("providerId is required"))?;
    if !orchestrator.providers().contains(id) {
        return Err(Error::not_found("Provider", id).into());
    }
    Ok(id)
}

async fn post_action(
    State(state): State<AppState>,
    Json(request): Json<StatusActionRequest>,
) -> ApiResult<Json<ActionResponse>> {
    let orchestrator = state
        .orchestrator
        .as_ref()
        .ok_or_else(|| unavailable("Orchestrator"))?;
    let provider_id = request.provider_id.as_deref();

    let message = match request.action.as_str() {
        "reset" => {
            let id = require_provider(orchestrator, provider_id)?;
            orchestrator.breakers().reset(id);
            orchestrator.health().reset(id);
            format!("Circuit breaker and health reset for {id}")
        }
        "reset-all" => {
            orchestrator.breakers().reset_all();
            orchestrator.health().reset_all();
            orchestrator.cache().clear_all();
            "All circuit breakers reset and caches cleared".to_string()
        }
        "enable" | "disable" => {
            let id = require_provider(orchestrator, provider_id)?;
            let enabled = request.action == "enable";
            orchestrator.providers().set_enabled(id, enabled)?;
            format!("Provider {id} {}d", request.action)
        }
        other => {
            return Err(ApiError::bad_request(format!("Unknown action '{other}'")));
        }
    };

    tracing::info!(action = %request.action, provider = ?provider_id, "Status action applied");
    Ok(Json(ActionResponse {
        success: true,
        message,
    }))
}
