//! API route modules.
//!
//! Organizes routes by resource type.

pub mod health;
pub mod logging;
pub mod proxy;
pub mod resolve;
pub mod status;
pub mod workers;

#[cfg(test)]
mod test_support;

use axum::Router;

use crate::api::error::ApiError;
use crate::api::server::AppState;

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/resolve", resolve::router())
        .nest("/status", status::router())
        .nest("/workers", workers::router())
        .nest("/proxy", proxy::router())
        .nest("/logging", logging::router())
        .nest("/health", health::router())
        .with_state(state)
}

fn unavailable(component: &str) -> ApiError {
    ApiError::service_unavailable(format!("{component} not available"))
}
