//! Container configuration.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// Container configuration, as decoded from a create request.
///
/// Field names follow the Docker Engine API so a create payload can be
/// decoded directly into this type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    /// Image name (required). Recorded as metadata; images are not resolved.
    pub image: String,
    /// Command to run.
    #[serde(default, deserialize_with = "null_as_default")]
    pub cmd: Vec<String>,
    /// Entrypoint.
    #[serde(default, deserialize_with = "null_as_default")]
    pub entrypoint: Vec<String>,
    /// Environment variables (`KEY=VALUE`).
    #[serde(default, deserialize_with = "null_as_default")]
    pub env: Vec<String>,
    /// Working directory.
    pub working_dir: Option<String>,
    /// User to run as.
    pub user: Option<String>,
    /// Allocate a TTY.
    #[serde(default, deserialize_with = "null_as_default")]
    pub tty: bool,
    /// Keep stdin open so attach sessions can write to it.
    #[serde(default, deserialize_with = "null_as_default")]
    pub open_stdin: bool,
    /// Close stdin after the first attach session disconnects.
    #[serde(default, deserialize_with = "null_as_default")]
    pub stdin_once: bool,
    /// Labels.
    #[serde(default, deserialize_with = "null_as_default")]
    pub labels: HashMap<String, String>,
    /// Signal sent on stop (e.g. `SIGTERM`, `SIGINT`).
    pub stop_signal: Option<String>,
    /// Default stop timeout in seconds.
    pub stop_timeout: Option<u64>,
}

impl ContainerConfig {
    /// Returns the full argv (entrypoint followed by cmd).
    #[must_use]
    pub fn argv(&self) -> Vec<String> {
        self.entrypoint
            .iter()
            .chain(self.cmd.iter())
            .cloned()
            .collect()
    }

    /// Splits `Env` entries into key/value pairs.
    ///
    /// Entries without `=` get an empty value.
    #[must_use]
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| match s.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => (s.clone(), String::new()),
            })
            .collect()
    }
}

/// Docker clients send `null` for unset lists and maps.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
