//! Container state management.

use crate::config::ContainerConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Container identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new random container ID (64 hex characters, like Docker).
    #[must_use]
    pub fn new() -> Self {
        Self(format!(
            "{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        ))
    }

    /// Creates a container ID from a string.
    #[must_use]
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Returns the ID as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the 12-character short form.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl Default for ContainerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Container state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Container created but not started.
    Created,
    /// Container is running.
    Running,
    /// Container is being stopped.
    Stopping,
    /// Container has exited.
    Exited,
    /// Container failed to start.
    Dead,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Exited => write!(f, "exited"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

/// Container information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    /// Container ID.
    pub id: ContainerId,
    /// Container name.
    pub name: String,
    /// Configuration the container was created with.
    pub config: ContainerConfig,
    /// Current state.
    pub state: ContainerState,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Start time of the current or last run.
    pub started_at: Option<DateTime<Utc>>,
    /// Finish time of the last run.
    pub finished_at: Option<DateTime<Utc>>,
    /// Exit code (if exited).
    pub exit_code: Option<i32>,
    /// Process ID (if running).
    pub pid: Option<u32>,
    /// Detach keys recorded by the last start request.
    pub detach_keys: Option<String>,
}

impl Container {
    /// Creates a new container in the `Created` state.
    #[must_use]
    pub fn new(name: impl Into<String>, config: ContainerConfig) -> Self {
        Self {
            id: ContainerId::new(),
            name: name.into(),
            config,
            state: ContainerState::Created,
            created: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            pid: None,
            detach_keys: None,
        }
    }

    /// Returns whether the container is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }
}
