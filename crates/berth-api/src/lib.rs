//! # berth-api
//!
//! HTTP surface for Berth.
//!
//! Exposes container lifecycle operations with Docker Engine API paths and
//! translates each request into one call on a [`ContainerManager`]:
//!
//! - Create, start and stop (the command dispatcher)
//! - Attach, which hijacks the HTTP connection and hands it to the manager
//!   as a raw bidirectional stream
//! - Ping and version, so Docker clients can negotiate
//!
//! ## Architecture
//!
//! ```text
//! client ──► Unix socket / TCP ──► berth-api ──► ContainerManager
//!                                     │
//!                                     ▼
//!                              HTTP REST API
//!                             (Axum server)
//! ```
//!
//! [`ContainerManager`]: berth_container::ContainerManager

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod attach;
pub mod error;
pub mod handlers;
pub mod server;
pub mod trace;
pub mod types;

pub use api::{create_router, create_router_with_shutdown, AppState};
pub use attach::{HttpConnection, PendingHijack};
pub use error::{ApiError, Result};
pub use server::{ApiServer, ServerConfig};

/// Docker API version.
pub const API_VERSION: &str = "1.43";

/// Minimum supported API version.
pub const MIN_API_VERSION: &str = "1.24";
