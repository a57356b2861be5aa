//! Container manager interface.
//!
//! The HTTP layer talks to containers only through [`ContainerManager`], so
//! backends stay swappable. Cancelling a call means dropping its future.

use crate::{
    config::ContainerConfig,
    error::Result,
    session::{Connection, DetachKeys, SessionEnd},
    state::ContainerId,
};
use async_trait::async_trait;
use std::time::Duration;

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateResult {
    /// Manager-issued container ID.
    pub id: ContainerId,
    /// Non-fatal warnings raised while creating.
    pub warnings: Vec<String>,
}

/// Parameters for starting a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartConfig {
    /// Container ID or name.
    pub id: String,
    /// Detach key override, forwarded as received.
    pub detach_keys: Option<String>,
}

/// Parameters for attaching to a container.
pub struct AttachConfig {
    /// Forward client input to the container's stdin.
    pub stdin: bool,
    /// Relay the container's stdout.
    pub stdout: bool,
    /// Relay the container's stderr.
    pub stderr: bool,
    /// The client negotiated an HTTP upgrade.
    pub upgrade: bool,
    /// Detach key sequence for this session.
    pub detach_keys: Option<DetachKeys>,
    /// The hijacked client connection. Owned by the manager from here on.
    pub connection: Connection,
}

impl std::fmt::Debug for AttachConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachConfig")
            .field("stdin", &self.stdin)
            .field("stdout", &self.stdout)
            .field("stderr", &self.stderr)
            .field("upgrade", &self.upgrade)
            .field("detach_keys", &self.detach_keys)
            .finish_non_exhaustive()
    }
}

/// Container lifecycle backend.
#[async_trait]
pub trait ContainerManager: Send + Sync {
    /// Creates a container. An empty `name` asks the manager to pick one.
    async fn create(&self, name: &str, config: ContainerConfig) -> Result<CreateResult>;

    /// Starts a container.
    async fn start(&self, config: StartConfig) -> Result<()>;

    /// Stops a container, escalating to a forced kill once `timeout` elapses.
    async fn stop(&self, name: &str, timeout: Duration) -> Result<()>;

    /// Binds `config.connection` to the container's standard streams.
    ///
    /// Resolves when the session ends.
    async fn attach(&self, name: &str, config: AttachConfig) -> Result<SessionEnd>;
}
