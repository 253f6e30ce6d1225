//! Error types for OCI document parsing.

use thiserror::Error;

/// Result type alias for OCI parsing.
pub type Result<T> = std::result::Result<T, OciError>;

/// Errors that can occur while parsing OCI documents.
///
/// Parse errors carry the offending bytes so that a malformed manifest or
/// index can be inspected straight from the log line.
#[derive(Debug, Error)]
pub enum OciError {
    /// The document failed to parse as JSON.
    #[error("{source} while parsing: {content}")]
    Parse {
        /// Underlying JSON error.
        source: serde_json::Error,
        /// The bytes that failed to parse, lossily decoded.
        content: String,
    },

    /// The document parsed but carries no `mediaType`.
    #[error("missing mediaType while parsing: {content}")]
    MissingMediaType {
        /// The offending document, lossily decoded.
        content: String,
    },
}

impl OciError {
    pub(crate) fn parse(source: serde_json::Error, content: &[u8]) -> Self {
        Self::Parse {
            source,
            content: String::from_utf8_lossy(content).into_owned(),
        }
    }
}
