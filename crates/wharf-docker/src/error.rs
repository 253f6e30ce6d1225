//! Error types for Docker daemon operations.

use thiserror::Error;

/// Result type alias for daemon operations.
pub type Result<T> = std::result::Result<T, DockerError>;

/// Errors that can occur while talking to the Docker daemon.
#[derive(Debug, Error)]
pub enum DockerError {
    /// The daemon socket could not be reached.
    #[error("docker daemon unreachable at {socket}: {source}")]
    Connect {
        /// Socket path that failed to connect.
        socket: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The daemon answered with a non-success status.
    #[error("{status} from docker daemon: {body}")]
    Api {
        /// HTTP status returned by the daemon.
        status: hyper::StatusCode,
        /// Response body text.
        body: String,
    },

    /// A pull status stream reported an error.
    #[error("pull failed: {0}")]
    Pull(String),

    /// A BuildKit build failed.
    #[error("build failed: {0}")]
    Build(String),

    /// The BuildKit session side channel could not be established.
    #[error("buildkit session: {0}")]
    Session(String),

    /// The credential helper failed.
    #[error("credential helper: {0}")]
    Credential(String),

    /// A daemon response failed to parse.
    #[error("{source} while parsing: {content}")]
    Decode {
        /// Underlying JSON error.
        source: serde_json::Error,
        /// The bytes that failed to parse, lossily decoded.
        content: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Hyper(#[from] hyper::Error),

    /// Malformed request construction.
    #[error("HTTP request error: {0}")]
    Http(#[from] hyper::http::Error),
}

impl DockerError {
    /// Heuristic for pulls denied for lack of credentials, detected from
    /// the daemon's error text.
    #[must_use]
    pub fn indicates_auth_required(&self) -> bool {
        let text = self.to_string();
        text.contains("no basic auth credentials")
            || text.contains("authorization")
            || text.contains("401 Unauthorized")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_required_heuristic() {
        let err = DockerError::Api {
            status: hyper::StatusCode::INTERNAL_SERVER_ERROR,
            body: "Head \"https://registry/v2/foo\": no basic auth credentials".to_string(),
        };
        assert!(err.indicates_auth_required());

        let err = DockerError::Api {
            status: hyper::StatusCode::INTERNAL_SERVER_ERROR,
            body: "received unexpected HTTP status: 401 Unauthorized".to_string(),
        };
        assert!(err.indicates_auth_required());

        let err = DockerError::Pull("i/o timeout".to_string());
        assert!(!err.indicates_auth_required());
    }
}
