//! Health check routes.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};

use crate::api::models::{ComponentHealth, HealthResponse};
use crate::api::server::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/live", get(liveness_check))
}

fn component(name: &str, healthy: bool, message: Option<String>) -> ComponentHealth {
    ComponentHealth {
        name: name.to_string(),
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        message,
    }
}

/// Overall health: providers, circuit state and the decryption collaborator.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = state.start_time.elapsed().as_secs();
    let mut components = Vec::new();

    if let Some(orchestrator) = &state.orchestrator {
        let entries = orchestrator.providers().entries();
        let usable = entries
            .iter()
            .filter(|e| e.enabled && !orchestrator.breakers().snapshot(&e.info.id).is_open)
            .count();
        components.push(component(
            "providers",
            usable > 0,
            Some(format!("{usable}/{} usable", entries.len())),
        ));

        let decryption = orchestrator.hosters().decryption_health().await;
        components.push(component(
            "decryption",
            decryption.healthy,
            decryption.message,
        ));
    }

    let status = if state.is_shutting_down() {
        "shutting_down"
    } else if components.iter().all(|c| c.status == "healthy") {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: uptime,
        components,
    })
}

/// Ready once wired to an orchestrator with at least one enabled provider.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    if state.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down");
    }
    match &state.orchestrator {
        Some(orchestrator) if orchestrator.providers().entries().iter().any(|e| e.enabled) => {
            (StatusCode::OK, "ready")
        }
        Some(_) => (StatusCode::SERVICE_UNAVAILABLE, "no providers enabled"),
        None => (StatusCode::OK, "ready"),
    }
}

async fn liveness_check(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = state.start_time.elapsed().as_secs();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "alive",
            "uptime_secs": uptime
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn app(state: AppState) -> Router {
        Router::new().nest("/health", router()).with_state(state)
    }

    #[tokio::test]
    async fn test_health_without_services() {
        let response = app(AppState::new())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn test_ready_reports_shutdown() {
        let token = tokio_util::sync::CancellationToken::new();
        token.cancel();
        let state = AppState {
            shutdown_token: Some(token),
            ..AppState::new()
        };

        let response = app(state)
            .oneshot(
                Request::builder()
                    .uri("/health/ready")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
