//! Docker API types.
//!
//! Wire types for the endpoints Berth serves, with Docker Engine API field
//! names. See: <https://docs.docker.com/engine/api/v1.43>

use serde::{Deserialize, Serialize};

// ============================================================================
// Container Types
// ============================================================================

/// Container create response.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerCreateResponse {
    /// Container ID.
    pub id: String,
    /// Warnings.
    pub warnings: Vec<String>,
}

/// Create container query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct CreateContainerQuery {
    /// Container name. Empty lets the manager pick one.
    #[serde(default)]
    pub name: String,
}

/// Start container query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct StartContainerQuery {
    /// Detach key override, forwarded as received.
    #[serde(rename = "detachKeys")]
    pub detach_keys: Option<String>,
}

/// Stop container query parameters.
///
/// `t` stays a string so a malformed value is reported as a 400 from the
/// handler rather than a generic extractor rejection.
#[derive(Debug, Default, Deserialize)]
pub struct StopContainerQuery {
    /// Grace period in seconds.
    pub t: Option<String>,
}

impl StopContainerQuery {
    /// Returns the grace period in seconds. Absent or empty means zero.
    ///
    /// # Errors
    ///
    /// Returns the offending value if it is not a non-negative integer.
    pub fn timeout_secs(&self) -> std::result::Result<u64, String> {
        match self.t.as_deref() {
            None | Some("") => Ok(0),
            Some(t) => t.parse().map_err(|_| t.to_string()),
        }
    }
}

/// Attach container query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct AttachContainerQuery {
    /// `"1"` requests stdin forwarding; any other value does not.
    pub stdin: Option<String>,
    /// Detach key sequence for this session, Docker format.
    #[serde(rename = "detachKeys")]
    pub detach_keys: Option<String>,
}

impl AttachContainerQuery {
    /// Returns whether the client asked for stdin.
    #[must_use]
    pub fn wants_stdin(&self) -> bool {
        self.stdin.as_deref() == Some("1")
    }
}

// ============================================================================
// System Types
// ============================================================================

/// Version response.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VersionResponse {
    /// Version.
    pub version: String,
    /// API version.
    pub api_version: String,
    /// Minimum API version.
    #[serde(rename = "MinAPIVersion")]
    pub min_api_version: String,
    /// Git commit.
    pub git_commit: String,
    /// OS.
    pub os: String,
    /// Architecture.
    pub arch: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_timeout_parsing() {
        let query = |t: Option<&str>| StopContainerQuery {
            t: t.map(String::from),
        };
        assert_eq!(query(None).timeout_secs(), Ok(0));
        assert_eq!(query(Some("")).timeout_secs(), Ok(0));
        assert_eq!(query(Some("10")).timeout_secs(), Ok(10));
        assert_eq!(query(Some("abc")).timeout_secs(), Err("abc".to_string()));
        assert!(query(Some("-1")).timeout_secs().is_err());
    }

    #[test]
    fn stdin_requires_literal_one() {
        let query = |s: &str| AttachContainerQuery {
            stdin: Some(s.to_string()),
            detach_keys: None,
        };
        assert!(query("1").wants_stdin());
        assert!(!query("true").wants_stdin());
        assert!(!query("0").wants_stdin());
        assert!(!AttachContainerQuery::default().wants_stdin());
    }

    #[test]
    fn create_response_uses_docker_field_names() {
        let body = serde_json::to_value(ContainerCreateResponse {
            id: "abc".to_string(),
            warnings: vec![],
        })
        .unwrap();
        assert_eq!(body["Id"], "abc");
        assert!(body["Warnings"].as_array().unwrap().is_empty());
    }
}
