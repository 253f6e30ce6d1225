//! On-demand image materialization.
//!
//! [`Materializer::ensure_cached`] is the registry's one promise: after a
//! `Found` return, the cache answers every blob and manifest request for
//! the image out of plain files. Getting there may involve asking the
//! Docker daemon to pull, exporting the image as an OCI-layout tar,
//! validating the exported manifest graph, and driving a BuildKit
//! force-pull when the daemon's export left blobs out.

use crate::cache::ImageCache;
use crate::error::{RegistryError, Result};
use crate::graph;
use crate::keyed_lock::KeyedMutexPool;
use crate::reference::{daemon_reference, registry_host, Reference};
use std::sync::Arc;
use tracing::{debug, info, warn};
use wharf_docker::{CredentialResolver, ImageDaemon, ImageInfo, PullOutcome};

/// Outcome of a materialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Materialized {
    /// The cache holds a complete layout for the reference.
    Found,
    /// The upstream genuinely lacks the image, or its export is
    /// unsalvageably broken.
    NotFound,
}

/// Coordinates daemon exports into the cache, one image name at a time.
pub struct Materializer {
    cache: ImageCache,
    daemon: Arc<dyn ImageDaemon>,
    credentials: Arc<dyn CredentialResolver>,
    locks: KeyedMutexPool,
}

impl Materializer {
    /// Creates a materializer over its collaborators.
    #[must_use]
    pub fn new(
        cache: ImageCache,
        daemon: Arc<dyn ImageDaemon>,
        credentials: Arc<dyn CredentialResolver>,
    ) -> Self {
        Self {
            cache,
            daemon,
            credentials,
            locks: KeyedMutexPool::new(),
        }
    }

    /// The cache this materializer populates.
    #[must_use]
    pub fn cache(&self) -> &ImageCache {
        &self.cache
    }

    /// Ensures the cache holds a complete layout for `(name, reference)`.
    ///
    /// All work for one name runs inside that name's critical section;
    /// requests for other names proceed in parallel. A second request
    /// for a just-materialized image re-enters, sees the populated
    /// cache, and returns without touching the daemon.
    ///
    /// # Errors
    ///
    /// Returns an error for daemon failures, malformed content, and
    /// authorization-required pulls; a missing upstream image is the
    /// `NotFound` value, not an error.
    pub async fn ensure_cached(&self, name: &str, reference: &Reference) -> Result<Materialized> {
        let _serialized = self.locks.acquire(name).await;

        if self.cached_and_complete(name, reference)? {
            debug!(image = %name, reference = %reference, "cache hit");
            return Ok(Materialized::Found);
        }

        let daemon_ref = daemon_reference(name, reference);

        let mut image = self.daemon.inspect(&daemon_ref).await?;
        if image.is_none() {
            image = self.pull_from_upstream(name, &daemon_ref).await?;
        }
        let Some(image) = image else {
            return Ok(Materialized::NotFound);
        };

        info!(image = %daemon_ref, id = %image.id, "exporting image");
        self.export_into_cache(name, reference, &image.id).await?;

        // Pass 1: a by-digest request must have produced the blob it
        // asked for. Docker's non-containerd store sometimes exports
        // under a different id for digest references; the kubelet will
        // try its next mirror on the 404.
        let top_hex = match reference {
            Reference::Digest(hex) => {
                if !self.cache.blob_exists(name, hex)? {
                    warn!(image = %daemon_ref, digest = %hex, "export did not produce the requested digest");
                    return Ok(Materialized::NotFound);
                }
                hex.clone()
            }
            Reference::Tag(tag) => self.resolved_tag_digest(name, tag)?,
        };

        // Pass 2: walk the manifest graph and repair holes with a
        // BuildKit force-pull.
        let missing = graph::missing_blobs(&self.cache, name, &top_hex)?;
        if !missing.is_empty() {
            warn!(
                image = %daemon_ref,
                missing = missing.len(),
                "export is missing blobs, forcing a full pull"
            );
            self.daemon.force_pull(&daemon_ref).await?;

            // The daemon may associate the reference with a fresh id once
            // every blob is local; look again before re-exporting.
            let id = match self.daemon.inspect(&daemon_ref).await? {
                Some(info) => info.id,
                None => image.id.clone(),
            };
            self.export_into_cache(name, reference, &id).await?;

            let still_missing = graph::missing_blobs(&self.cache, name, &top_hex)?;
            if !still_missing.is_empty() {
                warn!(
                    image = %daemon_ref,
                    missing = still_missing.len(),
                    "export is still missing blobs, giving up"
                );
                if let Reference::Tag(tag) = reference {
                    // Leave no index behind; future requests for the tag
                    // must miss cleanly instead of 404ing on blob fetch.
                    self.cache.remove_index(name, tag)?;
                }
                return Ok(Materialized::NotFound);
            }
        }

        Ok(Materialized::Found)
    }

    /// The fast path: the target cache entry exists and its manifest
    /// graph is complete. Filesystem reads only — a hot cache never
    /// costs a daemon call.
    fn cached_and_complete(&self, name: &str, reference: &Reference) -> Result<bool> {
        let top_hex = match reference {
            Reference::Digest(hex) => {
                if !self.cache.blob_exists(name, hex)? {
                    return Ok(false);
                }
                hex.clone()
            }
            Reference::Tag(tag) => match self.cache.read_index(name, tag)? {
                Some(content) => single_manifest_digest(&content)?,
                None => return Ok(false),
            },
        };
        Ok(graph::missing_blobs(&self.cache, name, &top_hex)?.is_empty())
    }

    /// Pulls a reference the daemon does not hold, resolving registry
    /// credentials first. Returns the freshly inspected image, or `None`
    /// for a genuine upstream miss.
    async fn pull_from_upstream(
        &self,
        name: &str,
        daemon_ref: &str,
    ) -> Result<Option<ImageInfo>> {
        let auth = match registry_host(name) {
            Some(host) => self.credentials.resolve(host).await?,
            None => None,
        };
        info!(image = %daemon_ref, authenticated = auth.is_some(), "pulling image");

        match self.daemon.pull(daemon_ref, auth.as_ref()).await {
            Ok(PullOutcome::Pulled) => Ok(self.daemon.inspect(daemon_ref).await?),
            Ok(PullOutcome::NotFound) => {
                if auth.is_none() {
                    // An anonymous 404 can be a private image. Surface an
                    // authorization error so Kubernetes retries the pull
                    // with its own secrets.
                    Err(RegistryError::AuthRequired(format!(
                        "pull of {daemon_ref} was denied or the image does not exist; \
                         credentials may be required"
                    )))
                } else {
                    Ok(None)
                }
            }
            Err(e) if auth.is_none() && e.indicates_auth_required() => {
                Err(RegistryError::AuthRequired(e.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn export_into_cache(
        &self,
        name: &str,
        reference: &Reference,
        image_id: &str,
    ) -> Result<()> {
        let stream = self.daemon.export(image_id).await?;
        let tag = match reference {
            Reference::Tag(tag) => Some(tag.as_str()),
            Reference::Digest(_) => None,
        };
        self.cache.import_export_tar(name, tag, stream).await
    }

    /// Reads the just-written per-tag index and resolves its single
    /// manifest digest.
    fn resolved_tag_digest(&self, name: &str, tag: &str) -> Result<String> {
        let content = self.cache.read_index(name, tag)?.ok_or_else(|| {
            RegistryError::Storage(format!("image export produced no index for {name}:{tag}"))
        })?;
        single_manifest_digest(&content)
    }
}

/// Resolves the single manifest descriptor of a per-tag index to its
/// sha256 hex. The daemon emits a single-arch index per exported image;
/// anything else in this slot is malformed cache content.
pub(crate) fn single_manifest_digest(content: &[u8]) -> Result<String> {
    let index = wharf_oci::parse_index(content)?;
    if index.manifests.len() != 1 {
        return Err(RegistryError::Malformed(format!(
            "len(manifests) != 1 while parsing: {}",
            String::from_utf8_lossy(content)
        )));
    }
    let digest = &index.manifests[0].digest;
    wharf_oci::parse_sha256_digest(digest)
        .map(str::to_string)
        .ok_or_else(|| {
            RegistryError::Malformed(format!("unsupported digest in index: {digest:?}"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_manifest_digest_accepts_exactly_one() {
        let hex = "cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc";
        let index = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": wharf_oci::MEDIA_TYPE_OCI_INDEX,
            "manifests": [{
                "mediaType": wharf_oci::MEDIA_TYPE_MANIFEST_LIST,
                "digest": format!("sha256:{hex}"),
                "size": 1
            }]
        }))
        .unwrap();
        assert_eq!(single_manifest_digest(&index).unwrap(), hex);
    }

    #[test]
    fn single_manifest_digest_rejects_other_counts() {
        let empty = br#"{"schemaVersion":2,"manifests":[]}"#;
        let err = single_manifest_digest(empty).unwrap_err();
        assert!(matches!(err, RegistryError::Malformed(_)));
        assert!(err.to_string().contains("len(manifests) != 1"));

        let two = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "manifests": [
                {"digest": "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"},
                {"digest": "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"}
            ]
        }))
        .unwrap();
        assert!(single_manifest_digest(&two).is_err());
    }

    #[test]
    fn single_manifest_digest_rejects_foreign_algorithms() {
        let index = br#"{"schemaVersion":2,"manifests":[{"digest":"sha512:abcd"}]}"#;
        assert!(single_manifest_digest(index).is_err());
    }
}
