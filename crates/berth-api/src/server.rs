//! API server.

use crate::api::create_router_with_shutdown;
use crate::error::{ApiError, Result};
use axum::extract::Request;
use axum::Router;
use berth_container::ContainerManager;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;
use tower::Service;
use tower_http::trace::TraceLayer;

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Unix socket path.
    pub socket_path: PathBuf,
    /// Optional TCP listen address. No TLS; bind to loopback.
    pub tcp_addr: Option<SocketAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            tcp_addr: None,
        }
    }
}

/// Default socket location: `~/.berth/berth.sock`.
#[must_use]
pub fn default_socket_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".berth")
        .join("berth.sock")
}

/// API server.
pub struct ApiServer {
    config: ServerConfig,
    manager: Arc<dyn ContainerManager>,
}

impl ApiServer {
    /// Creates a new API server.
    #[must_use]
    pub fn new(config: ServerConfig, manager: Arc<dyn ContainerManager>) -> Self {
        Self { config, manager }
    }

    /// Returns the socket path.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Builds the HTTP application, with request tracing.
    #[must_use]
    pub fn router(&self, shutdown: CancellationToken) -> Router {
        create_router_with_shutdown(Arc::clone(&self.manager), shutdown).layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request| {
                tracing::info_span!(
                    "request",
                    method = %request.method(),
                    uri = %request.uri(),
                    trace_id = tracing::field::Empty,
                )
            }),
        )
    }

    /// Runs the server until `shutdown` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if a listener cannot be bound or accepting fails.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        // Remove a stale socket from a previous run.
        let _ = std::fs::remove_file(&self.config.socket_path);

        if let Some(parent) = self.config.socket_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let unix = UnixListener::bind(&self.config.socket_path).map_err(|e| {
            ApiError::Server(format!(
                "failed to bind {}: {e}",
                self.config.socket_path.display()
            ))
        })?;
        tracing::info!(
            "API server listening on {}",
            self.config.socket_path.display()
        );

        let app = self.router(shutdown.clone());

        let result = match self.config.tcp_addr {
            Some(addr) => {
                let tcp = TcpListener::bind(addr)
                    .await
                    .map_err(|e| ApiError::Server(format!("failed to bind {addr}: {e}")))?;
                tracing::info!("API server listening on tcp://{addr}");

                tokio::try_join!(
                    serve_unix(unix, app.clone(), shutdown.clone()),
                    serve_tcp(tcp, app, shutdown),
                )
                .map(|_| ())
            }
            None => serve_unix(unix, app, shutdown).await,
        };

        let _ = std::fs::remove_file(&self.config.socket_path);
        result
    }
}

/// Serves `app` on a Unix listener until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if accepting a connection fails.
pub async fn serve_unix(
    listener: UnixListener,
    app: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let stream = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                accepted.map_err(|e| ApiError::Server(e.to_string()))?.0
            }
        };
        spawn_connection(stream, app.clone());
    }
}

/// Serves `app` on a TCP listener until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if accepting a connection fails.
pub async fn serve_tcp(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let stream = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                accepted.map_err(|e| ApiError::Server(e.to_string()))?.0
            }
        };
        spawn_connection(stream, app.clone());
    }
}

/// Serves one HTTP/1.1 connection with upgrades enabled, so attach requests
/// can take the connection over.
fn spawn_connection<S>(stream: S, app: Router)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let hyper_service = hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
            app.clone().call(request)
        });

        if let Err(err) = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), hyper_service)
            .with_upgrades()
            .await
        {
            let err_str = err.to_string().to_lowercase();
            if !err_str.contains("shutting down")
                && !err_str.contains("connection reset")
                && !err_str.contains("broken pipe")
            {
                tracing::error!("Error serving connection: {}", err);
            }
        }
    });
}
