//! Error taxonomy for the store, generator, compose driver and lifecycle runs.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no settings found at {} (run `muxbee init` first)", .0.display())]
    NotFound(PathBuf),

    #[error("failed to parse {}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("i/o error on {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not determine the {0} directory")]
    NoBaseDir(&'static str),

    #[error("invalid bridge catalog: {0}")]
    Catalog(String),

    #[error("`{command}` failed: {detail}")]
    ExternalTool { command: String, detail: String },

    #[error("unknown bridge `{0}`")]
    UnknownBridge(String),

    #[error("{bridge} requires API credentials (api_id and api_hash)")]
    MissingCredentials { bridge: String },

    #[error("{service} failed to start - check logs with 'muxbee logs {service}'")]
    NotRunning { service: String },

    #[error("failed to serialize {what}: {detail}")]
    Serialize { what: &'static str, detail: String },

    #[error("homeserver request failed")]
    Http(#[from] reqwest::Error),

    #[error("homeserver returned {status}: {message}")]
    Matrix { status: u16, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn tool(command: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ExternalTool {
            command: command.into(),
            detail: detail.into(),
        }
    }
}

/// A lifecycle run that stopped before completing.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// Rejected before any step ran; nothing was changed.
    #[error(transparent)]
    Precondition(Error),

    /// A step failed; earlier steps stay applied.
    #[error("{label} failed{}", service_suffix(.service))]
    Step {
        index: usize,
        label: String,
        service: Option<String>,
        #[source]
        source: Error,
    },

    #[error("background task ended without reporting a result")]
    Interrupted,
}

fn service_suffix(service: &Option<String>) -> String {
    service
        .as_deref()
        .map(|s| format!(" ({s})"))
        .unwrap_or_default()
}

/// Failure of a step that never aborts the enclosing run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{step}: {message}")]
pub struct BestEffortError {
    pub step: String,
    pub service: Option<String>,
    pub message: String,
}

impl BestEffortError {
    pub fn new(step: impl Into<String>, service: Option<String>, message: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            service,
            message: message.into(),
        }
    }
}

/// Render an error with its source chain, `outer: inner: root`.
pub fn chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut cur = err.source();
    while let Some(src) = cur {
        out.push_str(": ");
        out.push_str(&src.to_string());
        cur = src.source();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_error_names_label_and_service() {
        let err = OrchestrationError::Step {
            index: 2,
            label: "Restarting synapse".into(),
            service: Some("synapse".into()),
            source: Error::tool("docker compose restart synapse", "exit status 1"),
        };
        assert_eq!(
            chain(&err),
            "Restarting synapse failed (synapse): `docker compose restart synapse` failed: exit status 1"
        );
    }

    #[test]
    fn not_running_points_at_logs() {
        let err = Error::NotRunning {
            service: "mautrix-signal".into(),
        };
        assert!(err.to_string().contains("muxbee logs mautrix-signal"));
    }
}
