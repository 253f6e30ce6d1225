//! # wharf-oci
//!
//! OCI image format data model for wharf.
//!
//! This crate covers the small slice of the OCI image spec the registry
//! needs: recognizing index and manifest media types, parsing indexes and
//! manifests leniently (unknown fields tolerated), and working with
//! `sha256:<hex>` digests.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod error;

pub use error::{OciError, Result};

use serde::{Deserialize, Serialize};

// Well-known media types.
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// Returns true for media types describing an index (manifest list).
#[must_use]
pub fn is_index_type(media_type: &str) -> bool {
    matches!(media_type, MEDIA_TYPE_OCI_INDEX | MEDIA_TYPE_MANIFEST_LIST)
}

/// Returns true for media types describing a single-platform manifest.
#[must_use]
pub fn is_manifest_type(media_type: &str) -> bool {
    matches!(media_type, MEDIA_TYPE_OCI_MANIFEST | MEDIA_TYPE_MANIFEST_V2)
}

/// Just enough of any OCI document to learn what it is.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaTyped {
    /// Schema version; 2 for everything this registry handles.
    #[serde(default)]
    pub schema_version: i32,
    /// Media type, e.g. `application/vnd.oci.image.index.v1+json`.
    #[serde(default)]
    pub media_type: Option<String>,
}

/// Content descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Algorithm-qualified content digest, e.g. `sha256:<hex>`.
    pub digest: String,
    /// Content size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    /// Inline embedding of the referenced content, base64 encoded.
    /// A descriptor with non-empty data needs no blob on disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Platform of the referenced manifest (index entries only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    /// Whether the descriptor embeds its content inline.
    #[must_use]
    pub fn has_inline_data(&self) -> bool {
        self.data.as_ref().is_some_and(|d| !d.is_empty())
    }
}

/// Platform of a referenced manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Platform {
    /// CPU architecture.
    pub architecture: String,
    /// Operating system.
    pub os: String,
    /// CPU variant, e.g. `v8`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// OCI image index (or Docker manifest list).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    /// Schema version (2).
    pub schema_version: i32,
    /// Media type of this document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Referenced per-platform manifests.
    pub manifests: Vec<Descriptor>,
}

/// OCI image manifest (or Docker v2 manifest).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Schema version (2).
    pub schema_version: i32,
    /// Media type of this document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Config descriptor.
    pub config: Descriptor,
    /// Ordered layer descriptors.
    pub layers: Vec<Descriptor>,
}

/// Parses the `mediaType` envelope of an OCI document.
///
/// # Errors
///
/// Returns an error carrying the offending bytes if the document is not
/// JSON or carries no media type.
pub fn parse_media_typed(content: &[u8]) -> Result<MediaTyped> {
    let parsed: MediaTyped =
        serde_json::from_slice(content).map_err(|source| OciError::parse(source, content))?;
    if parsed.media_type.as_deref().unwrap_or("").is_empty() {
        return Err(OciError::MissingMediaType {
            content: String::from_utf8_lossy(content).into_owned(),
        });
    }
    Ok(parsed)
}

/// Parses an OCI index (or Docker manifest list).
///
/// # Errors
///
/// Returns an error carrying the offending bytes if parsing fails.
pub fn parse_index(content: &[u8]) -> Result<Index> {
    serde_json::from_slice(content).map_err(|source| OciError::parse(source, content))
}

/// Parses an OCI manifest (or Docker v2 manifest).
///
/// # Errors
///
/// Returns an error carrying the offending bytes if parsing fails.
pub fn parse_manifest(content: &[u8]) -> Result<Manifest> {
    serde_json::from_slice(content).map_err(|source| OciError::parse(source, content))
}

/// Splits a `sha256:<hex>` digest into its hex part.
///
/// Returns `None` for any other algorithm or a malformed hex payload, so
/// callers can't be tricked into using a digest as a path component.
#[must_use]
pub fn parse_sha256_digest(digest: &str) -> Option<&str> {
    let hex = digest.strip_prefix("sha256:")?;
    if hex.len() == 64 && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        Some(hex)
    } else {
        None
    }
}
