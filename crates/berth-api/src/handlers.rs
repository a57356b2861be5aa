//! API request handlers.
//!
//! Each lifecycle handler decodes its request, then makes exactly one
//! manager call. Manager failures are passed through as
//! [`ApiError::Manager`] without being inspected.

use crate::api::AppState;
use crate::error::{ApiError, Result};
use crate::types::{
    ContainerCreateResponse, CreateContainerQuery, StartContainerQuery, StopContainerQuery,
    VersionResponse,
};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use berth_container::{ContainerConfig, StartConfig};
use bytes::Bytes;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use crate::attach::attach_container;

/// Runs a manager call, abandoning it if the server starts shutting down.
///
/// Dropping the call's future is what interrupts it.
pub(crate) async fn cancellable<T>(
    shutdown: &CancellationToken,
    call: impl Future<Output = berth_container::Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        () = shutdown.cancelled() => Err(ApiError::Cancelled),
        result = call => result.map_err(ApiError::Manager),
    }
}

// ============================================================================
// Container Handlers
// ============================================================================

/// Create container.
pub async fn create_container(
    State(state): State<AppState>,
    Query(params): Query<CreateContainerQuery>,
    body: Bytes,
) -> Result<(StatusCode, Json<ContainerCreateResponse>)> {
    let config: ContainerConfig = serde_json::from_slice(&body)
        .map_err(|e| ApiError::InvalidParameter(format!("invalid container config: {e}")))?;

    let created = cancellable(&state.shutdown, state.manager.create(&params.name, config)).await?;

    tracing::debug!(name = %params.name, id = %created.id, "created container");
    Ok((
        StatusCode::CREATED,
        Json(ContainerCreateResponse {
            id: created.id.to_string(),
            warnings: created.warnings,
        }),
    ))
}

/// Start container.
pub async fn start_container(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<StartContainerQuery>,
) -> Result<StatusCode> {
    let config = StartConfig {
        id: name,
        detach_keys: params.detach_keys,
    };

    cancellable(&state.shutdown, state.manager.start(config)).await?;

    Ok(StatusCode::OK)
}

/// Stop container.
pub async fn stop_container(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<StopContainerQuery>,
) -> Result<StatusCode> {
    let secs = params
        .timeout_secs()
        .map_err(|t| ApiError::InvalidParameter(format!("invalid stop timeout t={t:?}")))?;

    cancellable(
        &state.shutdown,
        state.manager.stop(&name, Duration::from_secs(secs)),
    )
    .await?;

    Ok(StatusCode::OK)
}

// ============================================================================
// System Handlers
// ============================================================================

/// Get version.
pub async fn get_version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        api_version: crate::API_VERSION.to_string(),
        min_api_version: crate::MIN_API_VERSION.to_string(),
        git_commit: option_env!("GIT_COMMIT").unwrap_or("unknown").to_string(),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
    })
}

/// Ping.
pub async fn ping() -> &'static str {
    "OK"
}
