//! Request dispatch.
//!
//! Image names span multiple path segments (`gcr.io/foo/bar`), so the
//! registry endpoints cannot be exact axum routes. The two fixed paths
//! are; everything else falls through to an ordered regex table whose
//! named capture groups become path values, first match wins.

use crate::handlers;
use crate::materializer::Materializer;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use regex::Regex;
use std::borrow::Cow;
use std::sync::Arc;

/// Application state shared with handlers.
#[derive(Clone)]
pub struct AppState {
    /// The materialization pipeline (owns the cache).
    pub(crate) materializer: Arc<Materializer>,
    /// Ordered registry route patterns.
    routes: Arc<RouteTable>,
}

/// Creates the registry router.
#[must_use]
pub fn create_router(materializer: Arc<Materializer>) -> Router {
    let state = AppState {
        materializer,
        routes: Arc::new(RouteTable::new()),
    };
    Router::new()
        .route("/", get(hello_world))
        .route("/v2/", get(v2_check))
        .fallback(dispatch)
        .with_state(state)
}

/// Liveness text.
async fn hello_world() -> &'static str {
    "Hello, world!\n"
}

/// `/v2/` has to answer 2xx but needs no content.
async fn v2_check() {}

enum RouteKind {
    BlobUpload,
    Blob,
    Manifest,
}

struct RegistryRoute {
    pattern: Regex,
    kind: RouteKind,
}

struct RouteTable {
    routes: Vec<RegistryRoute>,
}

impl RouteTable {
    /// Order matters: the upload pattern must win over the blob pattern,
    /// which would otherwise capture `uploads` as a digest.
    fn new() -> Self {
        let route = |pattern: &str, kind| RegistryRoute {
            pattern: Regex::new(pattern).expect("route pattern"),
            kind,
        };
        Self {
            routes: vec![
                route(r"^/v2/(?P<name>.+)/blobs/uploads/?$", RouteKind::BlobUpload),
                route(r"^/v2/(?P<name>.+)/blobs/(?P<digest>[^/]+)$", RouteKind::Blob),
                route(
                    r"^/v2/(?P<name>.+)/manifests/(?P<tagOrDigest>[^/]+)$",
                    RouteKind::Manifest,
                ),
            ],
        }
    }
}

/// Matches the request path against the route table and runs the first
/// matching handler, or answers 404/405.
async fn dispatch(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path().to_string();
    let routes = Arc::clone(&state.routes);
    let method = req.method().clone();

    for route in &routes.routes {
        let Some(captures) = route.pattern.captures(&path) else {
            continue;
        };
        let name = captures
            .name("name")
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();

        return match route.kind {
            RouteKind::BlobUpload => {
                if method == Method::POST || method == Method::PUT {
                    handlers::upload_blob(state, name, req).await.into_response()
                } else {
                    method_not_allowed()
                }
            }
            RouteKind::Blob => {
                let digest = captures["digest"].to_string();
                if method == Method::GET || method == Method::HEAD {
                    handlers::serve_blob(state, name, digest, req)
                        .await
                        .into_response()
                } else {
                    method_not_allowed()
                }
            }
            RouteKind::Manifest => {
                let target = captures["tagOrDigest"].to_string();
                if method == Method::GET || method == Method::HEAD {
                    handlers::serve_manifest(state, name, target, req)
                        .await
                        .into_response()
                } else if method == Method::PUT {
                    handlers::put_manifest(state, name, target, req)
                        .await
                        .into_response()
                } else {
                    method_not_allowed()
                }
            }
        };
    }

    StatusCode::NOT_FOUND.into_response()
}

fn method_not_allowed() -> Response {
    StatusCode::METHOD_NOT_ALLOWED.into_response()
}

/// Reads one query parameter off a request URI, percent-decoding the
/// value.
pub(crate) fn query_param(uri: &Uri, key: &str) -> Option<String> {
    for pair in uri.query()?.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next() != Some(key) {
            continue;
        }
        let value = parts.next().unwrap_or("");
        return Some(
            urlencoding::decode(value)
                .map(Cow::into_owned)
                .unwrap_or_else(|_| value.to_string()),
        );
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_param_extraction() {
        let uri: Uri = "/v2/foo/manifests/latest?ns=docker.io&x=1".parse().unwrap();
        assert_eq!(query_param(&uri, "ns").as_deref(), Some("docker.io"));
        assert_eq!(query_param(&uri, "x").as_deref(), Some("1"));
        assert_eq!(query_param(&uri, "digest"), None);

        let uri: Uri = "/v2/foo/blobs/uploads?digest=sha256%3Aabcd".parse().unwrap();
        assert_eq!(query_param(&uri, "digest").as_deref(), Some("sha256:abcd"));

        let uri: Uri = "/v2/foo/manifests/latest".parse().unwrap();
        assert_eq!(query_param(&uri, "ns"), None);
    }

    #[test]
    fn route_table_ordering_and_captures() {
        let table = RouteTable::new();

        // Uploads win over the blob pattern.
        let caps = table.routes[0]
            .pattern
            .captures("/v2/gcr.io/foo/bar/blobs/uploads")
            .unwrap();
        assert_eq!(&caps["name"], "gcr.io/foo/bar");
        assert!(table.routes[0]
            .pattern
            .captures("/v2/foo/blobs/sha256:abc")
            .is_none());

        // Multi-segment names land in the name group.
        let caps = table.routes[2]
            .pattern
            .captures("/v2/library/alpine/manifests/3.19")
            .unwrap();
        assert_eq!(&caps["name"], "library/alpine");
        assert_eq!(&caps["tagOrDigest"], "3.19");

        let caps = table.routes[1]
            .pattern
            .captures("/v2/a/b/c/blobs/sha256:def")
            .unwrap();
        assert_eq!(&caps["name"], "a/b/c");
        assert_eq!(&caps["digest"], "sha256:def");
    }
}
