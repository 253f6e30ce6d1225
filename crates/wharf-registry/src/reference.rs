//! Image references and name normalization.
//!
//! A request addresses an image as `(name, tag-or-digest)`, where `name`
//! is a registry-relative path that may carry a domain prefix (the `ns`
//! query parameter contributes it for mirror requests). Before the
//! daemon sees a name, Docker Hub spellings are normalized: a leading
//! `docker.io/` is dropped, and if that reveals a leading `library/`, it
//! is dropped too, so `alpine:latest` means what `docker image ls` says
//! it means.

use crate::error::{RegistryError, Result};
use std::fmt;

/// A tag or digest reference to an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// A mutable tag, e.g. `latest`.
    Tag(String),
    /// A `sha256:<hex>` digest, stored as the bare hex.
    Digest(String),
}

impl Reference {
    /// Parses the `<tagOrDigest>` path value of a request.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed digests and for tags that cannot
    /// name a cache entry.
    pub fn parse(s: &str) -> Result<Self> {
        if s.starts_with("sha256:") {
            return wharf_oci::parse_sha256_digest(s).map_or_else(
                || {
                    Err(RegistryError::InvalidReference(format!(
                        "malformed digest: {s:?}"
                    )))
                },
                |hex| Ok(Self::Digest(hex.to_string())),
            );
        }
        if s.contains(':') {
            return Err(RegistryError::InvalidReference(format!(
                "unsupported digest algorithm: {s:?}"
            )));
        }
        if s.is_empty() || s == "." || s == ".." || s.contains('/') {
            return Err(RegistryError::InvalidReference(format!(
                "unusable tag: {s:?}"
            )));
        }
        Ok(Self::Tag(s.to_string()))
    }

    /// Whether this is a digest reference.
    #[must_use]
    pub const fn is_digest(&self) -> bool {
        matches!(self, Self::Digest(_))
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tag(tag) => write!(f, "{tag}"),
            Self::Digest(hex) => write!(f, "sha256:{hex}"),
        }
    }
}

/// The image name a request addresses: the upstream registry named by
/// `ns` (when present) prefixed onto the path name.
#[must_use]
pub fn effective_name(path_name: &str, ns: Option<&str>) -> String {
    match ns {
        Some(ns) if !ns.is_empty() => format!("{ns}/{path_name}"),
        _ => path_name.to_string(),
    }
}

/// Normalizes a name to what the Docker daemon calls the image: a
/// leading `docker.io/` is stripped, and a `library/` prefix revealed by
/// that strip goes with it.
#[must_use]
pub fn daemon_image_name(name: &str) -> &str {
    match name.strip_prefix("docker.io/") {
        Some(rest) => rest.strip_prefix("library/").unwrap_or(rest),
        None => name,
    }
}

/// Formats the full daemon reference for an image, e.g. `alpine:latest`
/// or `gcr.io/foo/bar@sha256:<hex>`.
#[must_use]
pub fn daemon_reference(name: &str, reference: &Reference) -> String {
    let base = daemon_image_name(name);
    match reference {
        Reference::Tag(tag) => format!("{base}:{tag}"),
        Reference::Digest(hex) => format!("{base}@sha256:{hex}"),
    }
}

/// The registry host component of a name, used for credential lookup.
#[must_use]
pub fn registry_host(name: &str) -> Option<&str> {
    name.split('/').next().filter(|s| !s.is_empty())
}
