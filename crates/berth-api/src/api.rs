//! API router.
//!
//! Serves the container lifecycle endpoints with Docker Engine API paths,
//! both unversioned and under every supported `/v1.NN` prefix.
//! See: https://docs.docker.com/engine/api/v1.43/

use crate::handlers;
use crate::trace::trace_id_middleware;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use berth_container::ContainerManager;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Application state shared with handlers.
#[derive(Clone)]
pub struct AppState {
    /// Container lifecycle backend.
    pub manager: Arc<dyn ContainerManager>,
    /// Cancelled when the server shuts down; in-flight manager calls and
    /// attach sessions observe it.
    pub shutdown: CancellationToken,
}

/// Creates the API router with all endpoints.
#[must_use]
pub fn create_router(manager: Arc<dyn ContainerManager>) -> Router {
    create_router_with_shutdown(manager, CancellationToken::new())
}

/// Creates the API router, tying in-flight work to `shutdown`.
#[must_use]
pub fn create_router_with_shutdown(
    manager: Arc<dyn ContainerManager>,
    shutdown: CancellationToken,
) -> Router {
    let state = AppState { manager, shutdown };

    // Versioned API routes (Docker compatibility), from MIN_API_VERSION (1.24)
    // to API_VERSION (1.43).
    let mut router = routes();
    for minor in 24..=43 {
        router = router.nest(&format!("/v1.{minor}"), routes());
    }

    router
        .layer(middleware::from_fn(trace_id_middleware))
        .with_state(state)
}

fn routes() -> Router<AppState> {
    Router::new()
        // System
        .route("/_ping", get(handlers::ping).head(handlers::ping))
        .route("/version", get(handlers::get_version))
        // Containers
        .route("/containers/create", post(handlers::create_container))
        .route("/containers/{name}/start", post(handlers::start_container))
        .route("/containers/{name}/stop", post(handlers::stop_container))
        .route("/containers/{name}/attach", post(handlers::attach_container))
}
