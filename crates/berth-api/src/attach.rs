//! Attach bridge.
//!
//! Turns an attach request into a raw bidirectional stream bound to a
//! container's standard streams. The client gets a `101 Switching Protocols`
//! response; once hyper hands over the upgraded connection, it is passed to
//! the manager's attach call, which owns it until the session ends.
//!
//! Failures after the 101 has been sent cannot be reported over HTTP any
//! more, so they are logged with the container name and trace id.

use crate::api::AppState;
use crate::error::{ApiError, Result};
use crate::trace::TraceId;
use crate::types::AttachContainerQuery;
use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, Response, StatusCode};
use axum::Extension;
use berth_container::{AttachConfig, Connection, ContainerManager, DetachKeys};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use std::io;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Content type Docker clients expect for a non-multiplexed attach stream.
pub const RAW_STREAM_CONTENT_TYPE: &str = "application/vnd.docker.raw-stream";

/// The client side of an HTTP request, before takeover.
///
/// Hyper only attaches an upgrade handle to requests that asked for an
/// upgrade on connections served with upgrades enabled. Without one the
/// connection cannot be taken over.
#[derive(Debug)]
pub struct HttpConnection {
    on_upgrade: Option<OnUpgrade>,
}

impl HttpConnection {
    /// Takes the upgrade handle out of the request.
    pub fn from_request<B>(request: &mut axum::http::Request<B>) -> Self {
        Self {
            on_upgrade: request.extensions_mut().remove::<OnUpgrade>(),
        }
    }

    /// Returns whether the connection can be taken over.
    #[must_use]
    pub const fn is_hijackable(&self) -> bool {
        self.on_upgrade.is_some()
    }

    /// Consumes the connection, yielding the final HTTP response to send and
    /// the pending raw connection.
    ///
    /// Nothing else may be written through the HTTP layer afterwards, which is
    /// why this takes `self`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::HijackUnsupported`] if there is no upgrade handle.
    pub fn hijack(self) -> Result<(Response<Body>, PendingHijack)> {
        let on_upgrade = self.on_upgrade.ok_or_else(|| {
            ApiError::HijackUnsupported("request carries no upgrade handle".to_string())
        })?;

        let response = Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(header::CONNECTION, "Upgrade")
            .header(header::UPGRADE, "tcp")
            .header(header::CONTENT_TYPE, RAW_STREAM_CONTENT_TYPE)
            .body(Body::empty())
            .map_err(|e| ApiError::Server(format!("failed to build upgrade response: {e}")))?;

        Ok((response, PendingHijack { on_upgrade }))
    }
}

/// A connection whose switching response has been issued but which hyper
/// has not released yet.
#[derive(Debug)]
pub struct PendingHijack {
    on_upgrade: OnUpgrade,
}

impl PendingHijack {
    /// Waits for hyper to flush the 101 and release the raw connection.
    ///
    /// Bytes the client pipelined after the request are kept in front of
    /// the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection closed before the upgrade completed.
    pub async fn establish(self) -> io::Result<Connection> {
        let upgraded = self.on_upgrade.await.map_err(io::Error::other)?;
        Ok(Box::new(TokioIo::new(upgraded)))
    }
}

/// Attach parameters negotiated from the request, before the connection is
/// available.
#[derive(Debug, Clone)]
struct AttachRequest {
    name: String,
    stdin: bool,
    upgrade: bool,
    detach_keys: Option<DetachKeys>,
}

impl AttachRequest {
    fn into_config(self, connection: Connection) -> AttachConfig {
        AttachConfig {
            stdin: self.stdin,
            stdout: true,
            stderr: true,
            upgrade: self.upgrade,
            detach_keys: self.detach_keys,
            connection,
        }
    }
}

/// Attach to container.
pub async fn attach_container(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<AttachContainerQuery>,
    trace_id: Option<Extension<TraceId>>,
    mut request: Request,
) -> Result<Response<Body>> {
    let trace_id = trace_id.map_or_else(String::new, |Extension(id)| id.0);

    let connection = HttpConnection::from_request(&mut request);
    if !connection.is_hijackable() {
        tracing::error!(
            container = %name,
            trace_id = %trace_id,
            "attach failed: connection not hijackable"
        );
        return Err(ApiError::HijackUnsupported(
            "the connection does not support upgrade".to_string(),
        ));
    }

    let detach_keys = params
        .detach_keys
        .as_deref()
        .filter(|keys| !keys.is_empty())
        .map(DetachKeys::parse)
        .transpose()
        .map_err(|e| ApiError::InvalidParameter(e.to_string()))?;

    let attach = AttachRequest {
        name,
        stdin: params.wants_stdin(),
        upgrade: request.headers().contains_key(header::UPGRADE),
        detach_keys,
    };

    let (response, pending) = connection.hijack()?;

    tokio::spawn(run_attach(
        Arc::clone(&state.manager),
        state.shutdown.clone(),
        attach,
        pending,
        trace_id,
    ));

    Ok(response)
}

/// Completes the takeover and runs the manager's attach until the session
/// ends or the server shuts down.
async fn run_attach(
    manager: Arc<dyn ContainerManager>,
    shutdown: CancellationToken,
    attach: AttachRequest,
    pending: PendingHijack,
    trace_id: String,
) {
    let name = attach.name.clone();

    let connection = match pending.establish().await {
        Ok(connection) => connection,
        Err(e) => {
            tracing::error!(
                container = %name,
                trace_id = %trace_id,
                error = %e,
                "attach failed: upgrade did not complete"
            );
            return;
        }
    };

    tracing::debug!(
        container = %name,
        trace_id = %trace_id,
        stdin = attach.stdin,
        upgrade = attach.upgrade,
        "connection hijacked"
    );

    tokio::select! {
        result = manager.attach(&name, attach.into_config(connection)) => match result {
            Ok(end) => tracing::info!(
                container = %name,
                trace_id = %trace_id,
                reason = %end,
                "attach session ended"
            ),
            Err(e) => tracing::error!(
                container = %name,
                trace_id = %trace_id,
                error = %e,
                "attach failed"
            ),
        },
        () = shutdown.cancelled() => tracing::info!(
            container = %name,
            trace_id = %trace_id,
            "attach session closed by shutdown"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_request_is_not_hijackable() {
        let mut request = axum::http::Request::builder()
            .uri("/containers/web/attach")
            .header(header::UPGRADE, "tcp")
            .body(())
            .unwrap();

        let connection = HttpConnection::from_request(&mut request);
        assert!(!connection.is_hijackable());
        assert!(matches!(
            connection.hijack(),
            Err(ApiError::HijackUnsupported(_))
        ));
    }

    #[test]
    fn attach_config_always_requests_output() {
        let (_client, server) = tokio::io::duplex(64);
        let request = AttachRequest {
            name: "web".to_string(),
            stdin: false,
            upgrade: true,
            detach_keys: None,
        };
        let config = request.into_config(Box::new(server));
        assert!(config.stdout);
        assert!(config.stderr);
        assert!(!config.stdin);
        assert!(config.upgrade);
    }
}
