//! Registry endpoint handlers.
//!
//! Pull side: manifest requests are where materialization happens; blob
//! requests are pure cache reads because the registry protocol always
//! fetches a manifest first. Push side: content-addressed writes into
//! the same cache the pull side serves from.

use crate::api::{query_param, AppState};
use crate::error::{RegistryError, Result};
use crate::materializer::{single_manifest_digest, Materialized};
use crate::reference::{effective_name, Reference};
use axum::body::Body;
use axum::extract::Request;
use axum::http::{header, Method, StatusCode};
use axum::response::Response;
use futures::TryStreamExt;
use sha2::{Digest as _, Sha256};
use tokio_util::io::{ReaderStream, StreamReader};

/// Manifests are bounded documents; anything bigger is not a manifest.
const MAX_MANIFEST_SIZE: usize = 8 * 1024 * 1024;

/// `GET|HEAD /v2/<name>/manifests/<tagOrDigest>`
pub(crate) async fn serve_manifest(
    state: AppState,
    name: String,
    target: String,
    req: Request<Body>,
) -> Result<Response> {
    let ns = query_param(req.uri(), "ns");
    let reference = Reference::parse(&target)?;
    let name = effective_name(&name, ns.as_deref());
    let cache = state.materializer.cache();

    if ns.is_some() {
        match state.materializer.ensure_cached(&name, &reference).await? {
            Materialized::Found => {}
            Materialized::NotFound => return Err(RegistryError::NotFound),
        }
    } else {
        // Without an upstream namespace the registry serves only its own
        // pushed content; a miss is a miss and the daemon stays out of it.
        let cached = match &reference {
            Reference::Digest(hex) => cache.blob_exists(&name, hex)?,
            Reference::Tag(tag) => cache.index_exists(&name, tag)?,
        };
        if !cached {
            return Err(RegistryError::NotFound);
        }
    }

    // A tag resolves through its single-entry index to the manifest the
    // daemon considers the image's identity.
    let digest_hex = match &reference {
        Reference::Digest(hex) => hex.clone(),
        Reference::Tag(tag) => {
            let content = cache
                .read_index(&name, tag)?
                .ok_or(RegistryError::NotFound)?;
            single_manifest_digest(&content)?
        }
    };

    let Some(content) = cache.read_blob(&name, &digest_hex)? else {
        return Err(RegistryError::NotFound);
    };

    // Kubernetes stalls containers forever on a missing or wrong
    // Content-Type here, so it is always the document's own mediaType.
    let media_typed = wharf_oci::parse_media_typed(&content)?;
    let media_type = media_typed.media_type.unwrap_or_default();

    let len = content.len();
    let body = if req.method() == Method::HEAD {
        Body::empty()
    } else {
        Body::from(content)
    };
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, media_type)
        .header(header::CONTENT_LENGTH, len)
        .header("Docker-Content-Digest", format!("sha256:{digest_hex}"))
        .body(body)?)
}

/// `GET|HEAD /v2/<name>/blobs/<digest>`
///
/// Never triggers a pull: materialization happened on the manifest
/// request that preceded this one.
pub(crate) async fn serve_blob(
    state: AppState,
    name: String,
    digest: String,
    req: Request<Body>,
) -> Result<Response> {
    let ns = query_param(req.uri(), "ns");
    let name = effective_name(&name, ns.as_deref());

    let Some(hex) = wharf_oci::parse_sha256_digest(&digest) else {
        return Err(RegistryError::NotFound);
    };
    let Some((file, len)) = state.materializer.cache().open_blob(&name, hex).await? else {
        return Err(RegistryError::NotFound);
    };

    let body = if req.method() == Method::HEAD {
        Body::empty()
    } else {
        Body::from_stream(ReaderStream::new(file))
    };
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, len)
        .header("Docker-Content-Digest", format!("sha256:{hex}"))
        .body(body)?)
}

/// `POST|PUT /v2/<name>/blobs/uploads[?digest=...]`
///
/// Without a digest this is the monolithic-upload handshake: the client
/// gets a location to PUT the bytes to. With a digest the body lands
/// content-addressed, verified against the claim.
pub(crate) async fn upload_blob(
    state: AppState,
    name: String,
    req: Request<Body>,
) -> Result<Response> {
    let Some(digest) = query_param(req.uri(), "digest") else {
        if req.method() != Method::POST {
            return Err(RegistryError::Protocol(
                "upload PUT requires a digest parameter".to_string(),
            ));
        }
        return Ok(Response::builder()
            .status(StatusCode::ACCEPTED)
            .header(header::LOCATION, format!("/v2/{name}/blobs/uploads"))
            .body(Body::empty())?);
    };

    let Some(hex) = wharf_oci::parse_sha256_digest(&digest) else {
        return Err(RegistryError::UnsupportedDigest(digest));
    };

    let reader = StreamReader::new(
        req.into_body()
            .into_data_stream()
            .map_err(std::io::Error::other),
    );
    let stored = state
        .materializer
        .cache()
        .store_blob_stream(&name, reader, Some(hex))
        .await?;

    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header(header::LOCATION, format!("/v2/{name}/blobs/sha256:{stored}"))
        .header("Docker-Content-Digest", format!("sha256:{stored}"))
        .body(Body::empty())?)
}

/// `PUT /v2/<name>/manifests/<tagOrDigest>`
pub(crate) async fn put_manifest(
    state: AppState,
    name: String,
    target: String,
    req: Request<Body>,
) -> Result<Response> {
    let ns = query_param(req.uri(), "ns");
    let reference = Reference::parse(&target)?;
    let effective = effective_name(&name, ns.as_deref());
    let cache = state.materializer.cache();

    let content = axum::body::to_bytes(req.into_body(), MAX_MANIFEST_SIZE)
        .await
        .map_err(|e| RegistryError::Protocol(format!("unreadable manifest body: {e}")))?;

    let hex = hex::encode(Sha256::digest(&content));
    if let Reference::Digest(expected) = &reference {
        // Nothing is written on a mismatch.
        if expected != &hex {
            return Err(RegistryError::DigestMismatch {
                expected: format!("sha256:{expected}"),
                actual: format!("sha256:{hex}"),
            });
        }
    }

    cache.store_blob(&effective, &content)?;

    if let Reference::Tag(tag) = &reference {
        // A tag points at its manifest through a single-entry index,
        // the same shape a daemon export produces.
        let media_type = wharf_oci::parse_media_typed(&content)
            .ok()
            .and_then(|m| m.media_type)
            .unwrap_or_else(|| wharf_oci::MEDIA_TYPE_OCI_MANIFEST.to_string());
        let index = wharf_oci::Index {
            schema_version: 2,
            media_type: Some(wharf_oci::MEDIA_TYPE_OCI_INDEX.to_string()),
            manifests: vec![wharf_oci::Descriptor {
                media_type: Some(media_type),
                digest: format!("sha256:{hex}"),
                size: Some(content.len() as i64),
                data: None,
                platform: None,
            }],
        };
        let index_bytes = serde_json::to_vec(&index)
            .map_err(|e| RegistryError::Storage(format!("unencodable index: {e}")))?;
        cache.write_index(&effective, tag, &index_bytes)?;
    }

    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header(
            header::LOCATION,
            format!("/v2/{name}/manifests/sha256:{hex}"),
        )
        .header("Docker-Content-Digest", format!("sha256:{hex}"))
        .body(Body::empty())?)
}
