//! # wharf-docker
//!
//! Docker daemon adapter for wharf.
//!
//! This crate owns every conversation with the local Docker daemon:
//!
//! - Image inspection (does the daemon hold a reference locally?)
//! - Image pull, with optional registry credentials
//! - Image export as an OCI-layout tar stream
//! - The BuildKit force-pull used to repair incomplete exports
//! - The ECR credential helper for private Amazon registries
//!
//! ## Transport
//!
//! Connections are plain HTTP/1.1 over the daemon's Unix socket, one
//! connection per call. The BuildKit session side channel uses the same
//! socket with an HTTP upgrade (hijack).

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod buildkit;
pub mod client;
pub mod ecr;
pub mod error;

pub use client::{DaemonClient, ImageInfo};
pub use ecr::{CredentialResolver, EcrCredentialResolver};
pub use error::{DockerError, Result};

use async_trait::async_trait;
use std::pin::Pin;
use tokio::io::AsyncRead;

/// Registry credentials for a pull.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    /// Username.
    pub username: String,
    /// Password or token.
    pub password: String,
}

/// Outcome of a pull attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullOutcome {
    /// The image was pulled (or the daemon already had every blob).
    Pulled,
    /// The upstream registry does not know the image.
    NotFound,
}

/// A streamed image export in OCI layout.
pub type ExportStream = Pin<Box<dyn AsyncRead + Send>>;

/// The narrow daemon interface the registry core consumes.
///
/// [`DaemonClient`] is the production implementation; tests substitute
/// scripted fakes.
#[async_trait]
pub trait ImageDaemon: Send + Sync {
    /// Looks up a reference in the daemon's local image store.
    async fn inspect(&self, reference: &str) -> Result<Option<ImageInfo>>;

    /// Pulls a reference from its upstream registry.
    async fn pull(&self, reference: &str, auth: Option<&RegistryAuth>) -> Result<PullOutcome>;

    /// Exports an image as an OCI-layout tar stream.
    async fn export(&self, image: &str) -> Result<ExportStream>;

    /// Forces the daemon to fully materialize a reference's blobs by
    /// building a throwaway `FROM <reference>` image with BuildKit.
    async fn force_pull(&self, reference: &str) -> Result<()>;
}

#[async_trait]
impl ImageDaemon for DaemonClient {
    async fn inspect(&self, reference: &str) -> Result<Option<ImageInfo>> {
        DaemonClient::inspect(self, reference).await
    }

    async fn pull(&self, reference: &str, auth: Option<&RegistryAuth>) -> Result<PullOutcome> {
        DaemonClient::pull(self, reference, auth).await
    }

    async fn export(&self, image: &str) -> Result<ExportStream> {
        DaemonClient::export(self, image).await
    }

    async fn force_pull(&self, reference: &str) -> Result<()> {
        DaemonClient::force_pull_via_build(self, reference).await
    }
}
