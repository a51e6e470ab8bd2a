use serde::Deserialize;
use thiserror::Error;

use crate::topology::Topology;

/// Error body the server attaches to failed responses.
///
/// All fields are optional: transport-level failures and non-JSON bodies
/// produce partially filled responses.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ErrorResponse {
    #[serde(rename = "Url")]
    pub url: Option<String>,

    #[serde(rename = "Type")]
    pub error_type: Option<String>,

    #[serde(rename = "Message")]
    pub message: Option<String>,

    #[serde(rename = "Error")]
    pub error: Option<String>,
}

impl ErrorResponse {
    /// Best-effort parse of a server error body; never fails.
    pub fn from_body(body: &[u8]) -> Self {
        match serde_json::from_slice(body) {
            Ok(parsed) => parsed,
            Err(_) => ErrorResponse {
                error_type: Some("Unparsable Server Response".to_string()),
                error: Some(String::from_utf8_lossy(body).into_owned()),
                ..Default::default()
            },
        }
    }

    fn describe(&self) -> String {
        self.message
            .clone()
            .or_else(|| self.error.clone())
            .or_else(|| self.error_type.clone())
            .unwrap_or_else(|| "unknown server error".to_string())
    }
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe())
    }
}

#[derive(Error, Debug)]
pub enum ClientError {
    /// Every seed URL failed during topology discovery. Carries the
    /// per-URL error list so operators can see what each node said.
    #[error("Failed to retrieve cluster topology from all known nodes: {}",
        format_attempts(attempts))]
    TopologyUpdate { attempts: Vec<(String, String)> },

    /// One command failed against every node in the live topology.
    #[error("{message}")]
    AllNodesDown {
        message: String,
        topology: Option<Topology>,
    },

    /// A specific node answered with a transient server-side status.
    #[error("Request to {url} ({cluster_tag}) was unsuccessful: HTTP {status}")]
    UnsuccessfulRequest {
        url: String,
        cluster_tag: String,
        status: u16,
    },

    /// HTTP 409. Never retried by the executor; writes race on the caller's
    /// terms, Hi-Lo handles its own conflicts internally.
    #[error("Conflict: {0}")]
    Conflict(ErrorResponse),

    /// The target database is not present on the cluster.
    #[error("Database '{0}' does not exist")]
    DatabaseDoesNotExist(String),

    /// The server explicitly signalled failure with a decoded error body.
    #[error("Server error (HTTP {status}): {response}")]
    Server { status: u16, response: ErrorResponse },

    /// Connect/timeout level failure before any HTTP status was produced.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Request executor is closed")]
    Closed,

    /// No topology has been acquired yet (or it is empty).
    #[error("No known topology: {0}")]
    NoTopology(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

fn format_attempts(attempts: &[(String, String)]) -> String {
    attempts
        .iter()
        .map(|(url, err)| format!("{} -> {}", url, err))
        .collect::<Vec<_>>()
        .join(", ")
}
