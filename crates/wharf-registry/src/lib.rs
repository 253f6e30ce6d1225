//! # wharf-registry
//!
//! The registry core: a pull-through OCI registry that materializes
//! images out of the local Docker daemon's image store.
//!
//! A kubelet (or any registry client) asks for `(name, tag-or-digest)`;
//! the materializer makes sure a valid OCI layout for that image exists
//! in the on-disk cache, exporting from the daemon on first request and
//! repairing incomplete exports through a BuildKit force-pull. Every
//! subsequent blob or manifest request is a plain filesystem read.
//!
//! ## Architecture
//!
//! ```text
//! kubelet ──► HTTP surface (axum) ──► per-key serializer ──► materializer
//!                                                                │
//!                     cache (content-addressed) ◄── export tar ──┘
//!                                                       ▲
//!                                              docker daemon (wharf-docker)
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod cache;
pub mod error;
pub mod graph;
mod handlers;
pub mod keyed_lock;
pub mod materializer;
pub mod reference;
pub mod server;

pub use api::create_router;
pub use cache::ImageCache;
pub use error::{RegistryError, Result};
pub use keyed_lock::KeyedMutexPool;
pub use materializer::{Materialized, Materializer};
pub use reference::Reference;
pub use server::RegistryServer;
