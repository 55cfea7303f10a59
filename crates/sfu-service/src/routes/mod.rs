//! HTTP routes for the SFU service.
//!
//! Defines the Axum router and application state.

use crate::handlers;
use crate::observability::{health_router, HealthState};
use crate::orchestrator::SessionOrchestrator;
use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Signaling operations over the actor hierarchy.
    pub orchestrator: SessionOrchestrator,

    /// Liveness and readiness flags.
    pub health: Arc<HealthState>,
}

/// Build the application routes.
///
/// Creates an Axum router with:
/// - `/health`, `/ready` - health checks
/// - `/metrics` - Prometheus metrics endpoint
/// - `/rooms/...` - signaling endpoints, see [`handlers::rooms`]
/// - TraceLayer for request logging
/// - permissive CORS, signaling clients are browsers on other origins
///
/// Requests are not bounded by a timeout: a slow engine call must not turn
/// a `disconnected` notification into an error.
pub fn build_routes(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let signaling_routes = Router::new()
        .route(
            "/rooms/:room_id/router-rtp-capabilities",
            get(handlers::get_router_rtp_capabilities),
        )
        .route(
            "/rooms/:room_id/clients/:client_id/transports",
            post(handlers::create_transport),
        )
        .route(
            "/rooms/:room_id/clients/:client_id/transports/:transport_id/connect",
            post(handlers::connect_transport),
        )
        .route(
            "/rooms/:room_id/clients/:client_id/transports/:transport_id/produce",
            post(handlers::produce),
        )
        .route(
            "/rooms/:room_id/clients/:client_id/producers",
            get(handlers::list_producers),
        )
        .route(
            "/rooms/:room_id/clients/:client_id/transports/:transport_id/consume",
            post(handlers::consume),
        )
        .route(
            "/rooms/:room_id/clients/:client_id/consumers/:consumer_id/resume",
            post(handlers::resume_consumer),
        )
        .route(
            "/rooms/:room_id/clients/:client_id/disconnected",
            post(handlers::disconnect),
        )
        .with_state(Arc::clone(&state));

    let metrics_routes = Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(metrics_handle);

    signaling_routes
        .merge(metrics_routes)
        .merge(health_router(Arc::clone(&state.health)))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_state_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }
}
