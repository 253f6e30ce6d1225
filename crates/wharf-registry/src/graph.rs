//! OCI reference walker.
//!
//! Checks that everything a manifest graph references is actually in the
//! cache. Docker's containerd-backed store sometimes exports a manifest
//! whose layers were deduplicated into another image and left out of the
//! tar; this walk is how such holes are found.

use crate::cache::ImageCache;
use crate::error::Result;
use std::collections::HashSet;

/// Walks the manifest graph rooted at `top_hex` and returns the digests
/// of referenced blobs that are not in the cache.
///
/// Index entries whose manifest blob is absent are skipped — an index
/// may legitimately advertise platforms that were never fetched. Within
/// a manifest, the config and every layer must be present unless the
/// descriptor embeds its content inline. Unknown media types give no
/// basis to judge and count as complete.
///
/// # Errors
///
/// Returns an error if a present blob fails to parse or the filesystem
/// fails; absence alone is reported through the returned list.
pub fn missing_blobs(cache: &ImageCache, name: &str, top_hex: &str) -> Result<Vec<String>> {
    let mut missing = Vec::new();
    let mut seen = HashSet::new();
    walk(cache, name, top_hex, &mut seen, &mut missing)?;
    Ok(missing)
}

fn walk(
    cache: &ImageCache,
    name: &str,
    hex: &str,
    seen: &mut HashSet<String>,
    missing: &mut Vec<String>,
) -> Result<()> {
    if !seen.insert(hex.to_string()) {
        return Ok(());
    }
    let Some(content) = cache.read_blob(name, hex)? else {
        missing.push(format!("sha256:{hex}"));
        return Ok(());
    };

    let media_typed = wharf_oci::parse_media_typed(&content)?;
    let media_type = media_typed.media_type.as_deref().unwrap_or("");

    if wharf_oci::is_index_type(media_type) {
        let index = wharf_oci::parse_index(&content)?;
        for descriptor in &index.manifests {
            let Some(child) = wharf_oci::parse_sha256_digest(&descriptor.digest) else {
                continue;
            };
            if cache.blob_exists(name, child)? {
                walk(cache, name, child, seen, missing)?;
            }
        }
    } else if wharf_oci::is_manifest_type(media_type) {
        let manifest = wharf_oci::parse_manifest(&content)?;
        for descriptor in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
            if descriptor.has_inline_data() {
                continue;
            }
            let Some(child) = wharf_oci::parse_sha256_digest(&descriptor.digest) else {
                continue;
            };
            if !cache.blob_exists(name, child)? {
                missing.push(descriptor.digest.clone());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest as _, Sha256};
    use tempfile::tempdir;

    const NAME: &str = "docker.io/library/alpine";

    fn store(cache: &ImageCache, content: &[u8]) -> String {
        cache.store_blob(NAME, content).unwrap()
    }

    fn digest_of(content: &[u8]) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(content)))
    }

    fn manifest_json(config: &str, layers: &[&str]) -> Vec<u8> {
        let layers: Vec<_> = layers
            .iter()
            .map(|digest| {
                serde_json::json!({
                    "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                    "digest": digest,
                    "size": 1
                })
            })
            .collect();
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": wharf_oci::MEDIA_TYPE_OCI_MANIFEST,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config,
                "size": 1
            },
            "layers": layers
        }))
        .unwrap()
    }

    #[test]
    fn complete_graph_has_no_missing_blobs() {
        let dir = tempdir().unwrap();
        let cache = ImageCache::new(dir.path()).unwrap();

        let config = b"{\"architecture\":\"amd64\"}";
        let layer = b"layer-bytes";
        let config_hex = store(&cache, config);
        let layer_hex = store(&cache, layer);

        let manifest = manifest_json(
            &format!("sha256:{config_hex}"),
            &[&format!("sha256:{layer_hex}")],
        );
        let manifest_hex = store(&cache, &manifest);

        assert!(missing_blobs(&cache, NAME, &manifest_hex).unwrap().is_empty());
    }

    #[test]
    fn missing_layer_is_reported() {
        let dir = tempdir().unwrap();
        let cache = ImageCache::new(dir.path()).unwrap();

        let config_hex = store(&cache, b"{}");
        let absent = digest_of(b"never stored");
        let manifest = manifest_json(&format!("sha256:{config_hex}"), &[&absent]);
        let manifest_hex = store(&cache, &manifest);

        let missing = missing_blobs(&cache, NAME, &manifest_hex).unwrap();
        assert_eq!(missing, vec![absent]);
    }

    #[test]
    fn inline_data_needs_no_blob() {
        let dir = tempdir().unwrap();
        let cache = ImageCache::new(dir.path()).unwrap();

        let manifest = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": wharf_oci::MEDIA_TYPE_OCI_MANIFEST,
            "config": {
                "mediaType": "application/vnd.oci.empty.v1+json",
                "digest": digest_of(b"{}"),
                "size": 2,
                "data": "e30="
            },
            "layers": []
        }))
        .unwrap();
        let manifest_hex = store(&cache, &manifest);

        assert!(missing_blobs(&cache, NAME, &manifest_hex).unwrap().is_empty());
    }

    #[test]
    fn absent_platform_manifests_are_ignored() {
        let dir = tempdir().unwrap();
        let cache = ImageCache::new(dir.path()).unwrap();

        let config_hex = store(&cache, b"{}");
        let manifest = manifest_json(&format!("sha256:{config_hex}"), &[]);
        let manifest_hex = store(&cache, &manifest);

        let index = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": wharf_oci::MEDIA_TYPE_MANIFEST_LIST,
            "manifests": [
                {
                    "mediaType": wharf_oci::MEDIA_TYPE_MANIFEST_V2,
                    "digest": format!("sha256:{manifest_hex}"),
                    "size": 1
                },
                {
                    "mediaType": wharf_oci::MEDIA_TYPE_MANIFEST_V2,
                    "digest": digest_of(b"some arm64 manifest we never fetched"),
                    "size": 1
                }
            ]
        }))
        .unwrap();
        let index_hex = store(&cache, &index);

        assert!(missing_blobs(&cache, NAME, &index_hex).unwrap().is_empty());
    }

    #[test]
    fn unknown_media_type_counts_as_complete() {
        let dir = tempdir().unwrap();
        let cache = ImageCache::new(dir.path()).unwrap();
        let hex = store(&cache, br#"{"mediaType":"application/vnd.example.custom+json"}"#);
        assert!(missing_blobs(&cache, NAME, &hex).unwrap().is_empty());
    }

    #[test]
    fn garbage_blob_is_an_error_not_a_miss() {
        let dir = tempdir().unwrap();
        let cache = ImageCache::new(dir.path()).unwrap();
        let hex = store(&cache, b"\x00\x01 not json");
        assert!(missing_blobs(&cache, NAME, &hex).is_err());
    }
}
