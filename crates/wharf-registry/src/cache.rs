//! Content-addressed image cache.
//!
//! Storage layout, rooted at one directory:
//!
//! ```text
//! <root>/
//! └── <urlencoded(name)>/
//!     ├── blobs/
//!     │   └── sha256/
//!     │       └── <hex>                       # content-addressed blobs
//!     └── indexes/
//!         └── <urlencoded(tag)>/
//!             └── index.json                  # per-tag OCI index
//! ```
//!
//! A blob file's presence is the only record that the blob is available,
//! so writes must never expose partial content: everything lands in a
//! temp file first and is renamed into place, and the directory holding
//! an index is fsynced before the index counts as committed.

use crate::error::{RegistryError, Result};
use sha2::{Digest as _, Sha256};
use std::fs;
use std::io::{self, Read, Write as _};
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::io::SyncIoBridge;
use tracing::{debug, warn};

/// Content-addressed cache for exported images.
#[derive(Debug, Clone)]
pub struct ImageCache {
    root: PathBuf,
}

impl ImageCache {
    /// Opens (creating if needed) a cache rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Returns the cache root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The directory holding one image's blobs and indexes.
    ///
    /// # Errors
    ///
    /// Returns an error for names that cannot become a path segment.
    pub fn image_root(&self, name: &str) -> Result<PathBuf> {
        Ok(self.root.join(encode_segment(name)?))
    }

    /// The path a blob lives at.
    ///
    /// # Errors
    ///
    /// Returns an error for an unusable name or a non-hex digest.
    pub fn blob_path(&self, name: &str, hex: &str) -> Result<PathBuf> {
        if !is_sha256_hex(hex) {
            return Err(RegistryError::InvalidReference(format!(
                "not a sha256 hex digest: {hex:?}"
            )));
        }
        Ok(self.image_root(name)?.join("blobs").join("sha256").join(hex))
    }

    /// Whether a blob is present. Filesystem errors other than absence
    /// propagate.
    ///
    /// # Errors
    ///
    /// Returns an error for unusable paths or filesystem failures.
    pub fn blob_exists(&self, name: &str, hex: &str) -> Result<bool> {
        file_exists(&self.blob_path(name, hex)?)
    }

    /// Reads a whole blob into memory. Only for manifests and indexes,
    /// which are small; layer blobs stream through [`Self::open_blob`].
    ///
    /// # Errors
    ///
    /// Returns an error for unusable paths or filesystem failures.
    pub fn read_blob(&self, name: &str, hex: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.blob_path(name, hex)?) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Opens a blob for streaming, returning the file and its length.
    ///
    /// # Errors
    ///
    /// Returns an error for unusable paths or filesystem failures.
    pub async fn open_blob(&self, name: &str, hex: &str) -> Result<Option<(tokio::fs::File, u64)>> {
        let path = self.blob_path(name, hex)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => {
                let len = file.metadata().await?.len();
                Ok(Some((file, len)))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The path a per-tag index lives at.
    ///
    /// # Errors
    ///
    /// Returns an error for unusable names or references.
    pub fn index_path(&self, name: &str, reference: &str) -> Result<PathBuf> {
        Ok(self
            .image_root(name)?
            .join("indexes")
            .join(encode_segment(reference)?)
            .join("index.json"))
    }

    /// Whether a per-tag index is present.
    ///
    /// # Errors
    ///
    /// Returns an error for unusable paths or filesystem failures.
    pub fn index_exists(&self, name: &str, reference: &str) -> Result<bool> {
        file_exists(&self.index_path(name, reference)?)
    }

    /// Reads a per-tag index.
    ///
    /// # Errors
    ///
    /// Returns an error for unusable paths or filesystem failures.
    pub fn read_index(&self, name: &str, reference: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.index_path(name, reference)?) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes a per-tag index atomically and makes it durable before
    /// returning: the index is the commit point of a materialization.
    ///
    /// # Errors
    ///
    /// Returns an error for unusable paths or filesystem failures.
    pub fn write_index(&self, name: &str, reference: &str, content: &[u8]) -> Result<()> {
        let path = self.index_path(name, reference)?;
        write_atomic(&path, content)?;
        if let Some(parent) = path.parent() {
            sync_dir(parent)?;
        }
        debug!(path = %path.display(), bytes = content.len(), "wrote index");
        Ok(())
    }

    /// Removes a per-tag index so future requests for the tag miss
    /// cleanly. Absence is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error for unusable paths or filesystem failures.
    pub fn remove_index(&self, name: &str, reference: &str) -> Result<()> {
        let path = self.index_path(name, reference)?;
        let dir = path.parent().unwrap_or(&path);
        match fs::remove_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Stores a small blob (a manifest) content-addressed. Returns the
    /// hex digest it landed at. Writing an already-present blob is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns an error for unusable paths or filesystem failures.
    pub fn store_blob(&self, name: &str, content: &[u8]) -> Result<String> {
        let hex = hex::encode(Sha256::digest(content));
        let path = self.blob_path(name, &hex)?;
        if file_exists(&path)? {
            debug!(digest = %hex, "blob already cached");
            return Ok(hex);
        }
        write_atomic(&path, content)?;
        debug!(digest = %hex, bytes = content.len(), "stored blob");
        Ok(hex)
    }

    /// Streams an uploaded blob into the cache, hashing as it lands.
    /// When `expected_hex` is given and the body hashes differently,
    /// nothing is left behind and the mismatch is reported.
    ///
    /// # Errors
    ///
    /// Returns an error on digest mismatch, unusable paths, or
    /// filesystem failures.
    pub async fn store_blob_stream<R>(
        &self,
        name: &str,
        mut reader: R,
        expected_hex: Option<&str>,
    ) -> Result<String>
    where
        R: AsyncRead + Unpin + Send,
    {
        let blobs_dir = self.image_root(name)?.join("blobs").join("sha256");
        tokio::fs::create_dir_all(&blobs_dir).await?;
        let tmp = blobs_dir.join(format!(
            ".upload.{}.{}",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        ));

        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        let write_result: Result<String> = async {
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                file.write_all(&buf[..n]).await?;
            }
            file.sync_all().await?;
            Ok(hex::encode(hasher.finalize()))
        }
        .await;
        drop(file);

        let hex = match write_result {
            Ok(hex) => hex,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e);
            }
        };

        if let Some(expected) = expected_hex {
            if expected != hex {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(RegistryError::DigestMismatch {
                    expected: format!("sha256:{expected}"),
                    actual: format!("sha256:{hex}"),
                });
            }
        }

        let target = blobs_dir.join(&hex);
        if file_exists(&target)? {
            let _ = tokio::fs::remove_file(&tmp).await;
        } else if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!(digest = %hex, "stored uploaded blob");
        Ok(hex)
    }

    /// Lands a daemon export (an OCI-layout tar stream) in the cache.
    ///
    /// Blobs are written under the image root unless already present;
    /// the layout's `index.json` becomes the per-tag index when the
    /// request was by tag. Everything else in the layout is ignored. A
    /// stream truncated by the sender ends the import without error;
    /// validation afterwards decides what is missing.
    ///
    /// # Errors
    ///
    /// Returns an error for unusable paths, a corrupt archive, or
    /// filesystem failures.
    pub async fn import_export_tar(
        &self,
        name: &str,
        tag: Option<&str>,
        reader: Pin<Box<dyn AsyncRead + Send>>,
    ) -> Result<()> {
        let image_root = self.image_root(name)?;
        let index_path = match tag {
            Some(tag) => Some(self.index_path(name, tag)?),
            None => None,
        };
        let bridge = SyncIoBridge::new(reader);
        tokio::task::spawn_blocking(move || import_tar(bridge, &image_root, index_path.as_deref()))
            .await
            .map_err(|e| RegistryError::Storage(format!("cache import task failed: {e}")))?
    }
}

/// Makes an arbitrary name or reference safe as one path component.
fn encode_segment(segment: &str) -> Result<String> {
    if segment.is_empty() || segment == "." || segment == ".." {
        return Err(RegistryError::InvalidReference(format!(
            "unusable path segment: {segment:?}"
        )));
    }
    Ok(urlencoding::encode(segment).into_owned())
}

fn is_sha256_hex(hex: &str) -> bool {
    hex.len() == 64 && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn file_exists(path: &Path) -> Result<bool> {
    match fs::metadata(path) {
        Ok(metadata) => Ok(metadata.is_file()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path.file_name().unwrap_or_default().to_string_lossy();
    path.with_file_name(format!(
        "{name}.tmp.{}.{}",
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    ))
}

/// Writes a file via a temp sibling and rename, fsyncing the content
/// first. Readers never observe partial bytes.
fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| RegistryError::Storage(format!("no parent for {}", path.display())))?;
    fs::create_dir_all(parent)?;
    let tmp = temp_sibling(path);
    let mut file = fs::File::create(&tmp)?;
    if let Err(e) = file.write_all(content).and_then(|()| file.sync_all()) {
        drop(file);
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    drop(file);
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

fn sync_dir(dir: &Path) -> Result<()> {
    fs::File::open(dir)?.sync_all()?;
    Ok(())
}

fn is_unexpected_eof(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::UnexpectedEof
}

/// The blocking half of an export import.
fn import_tar(reader: impl Read, image_root: &Path, index_path: Option<&Path>) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    let entries = match archive.entries() {
        Ok(entries) => entries,
        Err(e) if is_unexpected_eof(&e) => {
            warn!("image export stream ended before the first tar header");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(e) if is_unexpected_eof(&e) => {
                warn!("image export stream ended early");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if entry.header().entry_type().is_dir() {
            continue;
        }
        let path = entry.path()?.into_owned();

        let expected_len = entry.header().size()?;

        if let Some((algo, hex)) = blob_entry_components(&path) {
            let target = image_root.join("blobs").join(algo).join(hex);
            if file_exists(&target)? {
                // Content-addressed: the bytes are already there, and
                // another request may be streaming from this very file.
                debug!(path = %target.display(), "blob already cached, skipping");
                continue;
            }
            if !copy_entry_atomic(&mut entry, expected_len, &target)? {
                warn!(path = %target.display(), "image export stream ended mid-blob");
                return Ok(());
            }
            debug!(path = %target.display(), "wrote blob");
        } else if is_index_entry(&path) {
            if let Some(index_path) = index_path {
                let mut content = Vec::new();
                match entry.read_to_end(&mut content) {
                    Ok(_) if (content.len() as u64) < expected_len => {
                        warn!("image export stream ended mid-index");
                        return Ok(());
                    }
                    Ok(_) => {
                        write_atomic(index_path, &content)?;
                        if let Some(parent) = index_path.parent() {
                            sync_dir(parent)?;
                        }
                        debug!(path = %index_path.display(), bytes = content.len(), "wrote index");
                    }
                    Err(e) if is_unexpected_eof(&e) => {
                        warn!("image export stream ended mid-index");
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        // Everything else in the layout (oci-layout, manifest.json,
        // repositories) is not needed to serve the image.
    }
    Ok(())
}

/// Recognizes `blobs/<algo>/<hex>` entries and rejects anything that
/// could escape the image root.
fn blob_entry_components(path: &Path) -> Option<(String, String)> {
    let parts = normal_components(path)?;
    if parts.len() != 3 || parts[0] != "blobs" {
        return None;
    }
    let algo = parts[1];
    let hex = parts[2];
    let algo_ok =
        !algo.is_empty() && algo.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit());
    let hex_ok = hex.len() >= 32 && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
    (algo_ok && hex_ok).then(|| (algo.to_string(), hex.to_string()))
}

fn is_index_entry(path: &Path) -> bool {
    normal_components(path).is_some_and(|parts| parts == ["index.json"])
}

/// Path components of a tar entry name, with `./` tolerated and absolute
/// or parent-traversing names rejected.
fn normal_components(path: &Path) -> Option<Vec<&str>> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(os) => parts.push(os.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(parts)
}

/// Copies a tar entry into place atomically. Returns `false` when the
/// stream was truncated mid-entry (either as an error or as a short
/// read); the partial temp file is discarded.
fn copy_entry_atomic(entry: &mut impl Read, expected_len: u64, target: &Path) -> Result<bool> {
    let parent = target
        .parent()
        .ok_or_else(|| RegistryError::Storage(format!("no parent for {}", target.display())))?;
    fs::create_dir_all(parent)?;
    let tmp = temp_sibling(target);
    let mut file = fs::File::create(&tmp)?;
    match io::copy(entry, &mut file) {
        Ok(copied) if copied < expected_len => {
            drop(file);
            let _ = fs::remove_file(&tmp);
            Ok(false)
        }
        Ok(_) => {
            file.sync_all()?;
            drop(file);
            if let Err(e) = fs::rename(&tmp, target) {
                let _ = fs::remove_file(&tmp);
                return Err(e.into());
            }
            Ok(true)
        }
        Err(e) if is_unexpected_eof(&e) => {
            drop(file);
            let _ = fs::remove_file(&tmp);
            Ok(false)
        }
        Err(e) => {
            drop(file);
            let _ = fs::remove_file(&tmp);
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tar_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            builder.append_data(&mut header, path, *content).unwrap();
        }
        builder.into_inner().unwrap()
    }

    const HEX_A: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const HEX_B: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    #[test]
    fn store_blob_is_content_addressed_and_idempotent() {
        let dir = tempdir().unwrap();
        let cache = ImageCache::new(dir.path()).unwrap();

        let hex = cache.store_blob("docker.io/library/alpine", b"hello world").unwrap();
        assert_eq!(
            hex,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert!(cache.blob_exists("docker.io/library/alpine", &hex).unwrap());
        assert_eq!(
            cache.read_blob("docker.io/library/alpine", &hex).unwrap().unwrap(),
            b"hello world"
        );

        let again = cache.store_blob("docker.io/library/alpine", b"hello world").unwrap();
        assert_eq!(hex, again);
    }

    #[test]
    fn names_with_slashes_stay_single_segments() {
        let dir = tempdir().unwrap();
        let cache = ImageCache::new(dir.path()).unwrap();

        cache.store_blob("gcr.io/foo/bar", b"x").unwrap();
        let encoded: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(encoded, vec!["gcr.io%2Ffoo%2Fbar".to_string()]);
        // The encoding round-trips back to the reference.
        assert_eq!(
            urlencoding::decode("gcr.io%2Ffoo%2Fbar").unwrap(),
            "gcr.io/foo/bar"
        );
    }

    #[test]
    fn rejects_traversal_segments() {
        let dir = tempdir().unwrap();
        let cache = ImageCache::new(dir.path()).unwrap();
        assert!(cache.image_root("").is_err());
        assert!(cache.image_root(".").is_err());
        assert!(cache.image_root("..").is_err());
        assert!(cache.blob_path("ok", "not-hex").is_err());
    }

    #[test]
    fn import_writes_blobs_and_tagged_index() {
        let dir = tempdir().unwrap();
        let cache = ImageCache::new(dir.path()).unwrap();

        let tarball = tar_with(&[
            ("oci-layout", br#"{"imageLayoutVersion":"1.0.0"}"#),
            (&format!("blobs/sha256/{HEX_A}"), b"blob-a"),
            (&format!("blobs/sha256/{HEX_B}"), b"blob-b"),
            ("index.json", br#"{"schemaVersion":2,"manifests":[]}"#),
            ("manifest.json", b"[]"),
        ]);

        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(cache.import_export_tar(
            "docker.io/library/alpine",
            Some("3.19"),
            Box::pin(std::io::Cursor::new(tarball)),
        ))
        .unwrap();

        assert_eq!(
            cache.read_blob("docker.io/library/alpine", HEX_A).unwrap().unwrap(),
            b"blob-a"
        );
        assert_eq!(
            cache
                .read_index("docker.io/library/alpine", "3.19")
                .unwrap()
                .unwrap(),
            br#"{"schemaVersion":2,"manifests":[]}"#
        );
        // The layout bookkeeping files are not cached.
        assert!(!dir.path().join("docker.io%2Flibrary%2Falpine").join("oci-layout").exists());
    }

    #[test]
    fn import_by_digest_writes_no_index() {
        let dir = tempdir().unwrap();
        let cache = ImageCache::new(dir.path()).unwrap();

        let tarball = tar_with(&[
            (&format!("blobs/sha256/{HEX_A}"), b"blob-a"),
            ("index.json", br#"{"schemaVersion":2,"manifests":[]}"#),
        ]);

        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(cache.import_export_tar(
            "gcr.io/foo/bar",
            None,
            Box::pin(std::io::Cursor::new(tarball)),
        ))
        .unwrap();

        assert!(cache.blob_exists("gcr.io/foo/bar", HEX_A).unwrap());
        assert!(!dir.path().join("gcr.io%2Ffoo%2Fbar").join("indexes").exists());
    }

    #[test]
    fn import_never_overwrites_existing_blobs() {
        let dir = tempdir().unwrap();
        let cache = ImageCache::new(dir.path()).unwrap();
        let path = cache.blob_path("img", HEX_A).unwrap();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"original").unwrap();

        let tarball = tar_with(&[(&format!("blobs/sha256/{HEX_A}"), b"replacement")]);
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(cache.import_export_tar("img", None, Box::pin(std::io::Cursor::new(tarball))))
            .unwrap();

        assert_eq!(cache.read_blob("img", HEX_A).unwrap().unwrap(), b"original");
    }

    #[test]
    fn truncated_import_leaves_no_partial_blob() {
        let dir = tempdir().unwrap();
        let cache = ImageCache::new(dir.path()).unwrap();

        let mut tarball = tar_with(&[(&format!("blobs/sha256/{HEX_A}"), b"full-content")]);
        // Cut the archive off inside the entry body.
        tarball.truncate(512 + 4);

        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(cache.import_export_tar("img", None, Box::pin(std::io::Cursor::new(tarball))))
            .unwrap();

        assert!(!cache.blob_exists("img", HEX_A).unwrap());
        // No temp litter either.
        let blobs_dir = cache.image_root("img").unwrap().join("blobs").join("sha256");
        let leftover = fs::read_dir(&blobs_dir)
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftover, 0);
    }

    #[test]
    fn blob_entry_recognition() {
        assert!(blob_entry_components(Path::new(&format!("blobs/sha256/{HEX_A}"))).is_some());
        assert!(blob_entry_components(Path::new(&format!("./blobs/sha256/{HEX_A}"))).is_some());
        assert!(blob_entry_components(Path::new("blobs/sha256/../escape")).is_none());
        assert!(blob_entry_components(Path::new("blobs/sha256")).is_none());
        assert!(blob_entry_components(Path::new("blobs/SHA256/aaaa")).is_none());
        assert!(is_index_entry(Path::new("index.json")));
        assert!(is_index_entry(Path::new("./index.json")));
        assert!(!is_index_entry(Path::new("nested/index.json")));
    }

    #[tokio::test]
    async fn upload_stream_verifies_digest() {
        let dir = tempdir().unwrap();
        let cache = ImageCache::new(dir.path()).unwrap();

        let content: &[u8] = b"hello world";
        let good = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

        let hex = cache
            .store_blob_stream("img", content, Some(good))
            .await
            .unwrap();
        assert_eq!(hex, good);

        let err = cache
            .store_blob_stream("img", b"other bytes".as_slice(), Some(good))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DigestMismatch { .. }));
        // The mismatching upload left nothing behind.
        let blobs_dir = cache.image_root("img").unwrap().join("blobs").join("sha256");
        let names: Vec<_> = fs::read_dir(&blobs_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![good.to_string()]);
    }

    #[test]
    fn remove_index_is_idempotent() {
        let dir = tempdir().unwrap();
        let cache = ImageCache::new(dir.path()).unwrap();
        cache.write_index("img", "v1", b"{}").unwrap();
        assert!(cache.index_exists("img", "v1").unwrap());
        cache.remove_index("img", "v1").unwrap();
        assert!(!cache.index_exists("img", "v1").unwrap());
        cache.remove_index("img", "v1").unwrap();
    }
}
