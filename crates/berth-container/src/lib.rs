//! # berth-container
//!
//! Container lifecycle backend for Berth.
//!
//! This crate holds everything below the HTTP layer:
//!
//! - The [`ContainerManager`] interface the API dispatches to
//! - Container configuration and state
//! - [`AttachSession`], which relays a hijacked client connection to a
//!   container's standard streams
//! - [`LocalManager`], a backend that runs containers as host processes
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 berth-api                   │
//! │        (create / start / stop / attach)     │
//! └─────────────────────────────────────────────┘
//!                      │ ContainerManager
//!                      ▼
//! ┌─────────────────────────────────────────────┐
//! │               LocalManager                  │
//! │  - Container lifecycle                      │
//! │  - Output fan-out, stdin writer             │
//! │  - AttachSession per attached client        │
//! └─────────────────────────────────────────────┘
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod local;
pub mod manager;
pub mod session;
pub mod state;

pub use config::ContainerConfig;
pub use error::{ContainerError, Result};
pub use local::{LocalManager, LocalManagerOptions};
pub use manager::{AttachConfig, ContainerManager, CreateResult, StartConfig};
pub use session::{
    AttachSession, Connection, DetachKeys, OutputChunk, OutputStream, RawStream, SessionEnd,
    StdStream,
};
pub use state::{Container, ContainerId, ContainerState};
