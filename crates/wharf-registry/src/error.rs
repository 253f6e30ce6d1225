//! Error types for the registry core, and their HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{error, warn};
use wharf_docker::DockerError;
use wharf_oci::OciError;

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors that can occur while serving or materializing images.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The requested content does not exist (here or upstream).
    #[error("not found")]
    NotFound,

    /// A pull was denied and no credentials were supplied. Surfacing
    /// this instead of a 404 lets Kubernetes retry with its own pull
    /// secrets.
    #[error("authorization required: {0}")]
    AuthRequired(String),

    /// Cached or exported content is structurally wrong.
    #[error("{0}")]
    Malformed(String),

    /// The request names an image or reference this registry cannot
    /// represent.
    #[error("invalid reference: {0}")]
    InvalidReference(String),

    /// An upload used a digest algorithm other than sha256.
    #[error("unsupported digest algorithm: {0}")]
    UnsupportedDigest(String),

    /// An uploaded body does not hash to the digest it claims.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// The digest the client claimed.
        expected: String,
        /// The digest of the bytes actually received.
        actual: String,
    },

    /// The client misused the upload protocol.
    #[error("{0}")]
    Protocol(String),

    /// Cache bookkeeping failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// An OCI document failed to parse.
    #[error(transparent)]
    Oci(#[from] OciError),

    /// The Docker daemon conversation failed.
    #[error(transparent)]
    Daemon(#[from] DockerError),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Response construction failure.
    #[error("HTTP error: {0}")]
    Http(#[from] axum::http::Error),
}

impl RegistryError {
    /// The HTTP status this error maps to.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::InvalidReference(_)
            | Self::UnsupportedDigest(_)
            | Self::DigestMismatch { .. }
            | Self::Protocol(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match status {
            StatusCode::NOT_FOUND => {}
            s if s.is_client_error() => warn!("{self}"),
            _ => error!("{self}"),
        }
        (status, format!("{self}\n")).into_response()
    }
}
