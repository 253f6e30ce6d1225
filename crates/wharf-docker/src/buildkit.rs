//! BuildKit force-pull.
//!
//! Docker's containerd-backed image store can export a manifest whose
//! layer blobs belong to another image and are left out of the tar. A
//! BuildKit build of a Dockerfile containing only `FROM <image>` forces
//! the daemon to fully materialize the parent image's blobs; the next
//! export then contains them. The throwaway image the build produces is
//! deleted afterwards.

use crate::client::{body_reader, api_error, DaemonClient, JsonMessage};
use crate::error::{DockerError, Result};
use base64::Engine as _;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use prost::Message as _;
use serde::Deserialize;
use std::collections::HashSet;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Session name advertised to the daemon.
const SESSION_NAME: &str = "wharf";

/// Aux payload of a `moby.image.id` message.
#[derive(Debug, Deserialize)]
struct BuildResult {
    #[serde(rename = "ID")]
    id: String,
}

impl DaemonClient {
    /// Builds a throwaway `FROM <reference>` image with BuildKit so the
    /// daemon materializes every blob of the parent image, then deletes
    /// the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be established, the build
    /// fails, or the status stream cannot be read.
    pub async fn force_pull_via_build(&self, reference: &str) -> Result<()> {
        let session_id = uuid::Uuid::new_v4().simple().to_string();
        let session = SessionHandle::open(self, &session_id).await?;
        info!(session = %session_id, image = %reference, "starting buildkit force-pull");

        let context = tarred_dockerfile(&format!("FROM {reference}"))?;
        let uri = format!(
            "/v1.44/build?version=2&session={session_id}&dockerfile=Dockerfile"
        );
        let req = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::HOST, "localhost")
            .header(header::CONTENT_TYPE, "application/x-tar")
            .body(Full::new(context))?;

        let resp = self.send(req).await?;
        if !resp.status().is_success() {
            session.close().await;
            return Err(api_error(resp).await);
        }

        let mut lines = BufReader::new(body_reader(resp.into_body())).lines();
        let mut seen = HashSet::new();
        let mut image_id: Option<String> = None;
        let mut build_error: Option<String> = None;

        while let Some(line) = lines.next_line().await? {
            if line.is_empty() {
                continue;
            }
            let Ok(msg) = serde_json::from_str::<JsonMessage>(&line) else {
                info!("{line}");
                continue;
            };
            match msg.id.as_deref() {
                // The built image id, so we can delete it afterwards.
                Some("moby.image.id") => match msg.aux {
                    Some(aux) => match serde_json::from_value::<BuildResult>(aux) {
                        Ok(result) => image_id = Some(result.id),
                        Err(e) => warn!("error parsing {line:?}: {e}"),
                    },
                    None => warn!("moby.image.id message without aux: {line}"),
                },
                // Binary-encoded progress; decode and log deduplicated.
                Some("moby.buildkit.trace") => {
                    let Some(payload) = msg.aux.as_ref().and_then(serde_json::Value::as_str)
                    else {
                        info!("{line}");
                        continue;
                    };
                    match base64::engine::general_purpose::STANDARD.decode(payload) {
                        Ok(raw) => log_trace(&raw, &mut seen),
                        Err(e) => warn!("undecodable buildkit trace: {e}"),
                    }
                }
                _ => {
                    if let Some(err) = msg.error_message() {
                        build_error.get_or_insert(err);
                    } else if let Some(stream) = &msg.stream {
                        info!("{}", stream.trim_end());
                    } else {
                        info!("{line}");
                    }
                }
            }
        }

        session.close().await;

        if let Some(id) = image_id {
            match self.remove_image(&id).await {
                Ok(items) => {
                    for item in items {
                        if let Some(deleted) = item.deleted {
                            info!(image = %deleted, "deleted temporary image");
                        }
                        if let Some(untagged) = item.untagged {
                            info!(image = %untagged, "untagged");
                        }
                    }
                }
                Err(e) => warn!(image = %id, "error deleting temporary image: {e}"),
            }
        }

        if let Some(err) = build_error {
            return Err(DockerError::Build(err));
        }
        Ok(())
    }
}

/// The session side channel of one build.
///
/// The daemon expects a hijacked `/session` connection to exist for the
/// lifetime of a BuildKit build. The handle holds it open on a background
/// task and closes it when the build is done; dropping the handle's owner
/// (request cancellation) tears the connection down with it.
struct SessionHandle {
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    async fn open(client: &DaemonClient, session_id: &str) -> Result<Self> {
        let req = Request::builder()
            .method(Method::POST)
            .uri("/session")
            .header(header::HOST, "localhost")
            .header(header::UPGRADE, "h2c")
            .header(header::CONNECTION, "Upgrade")
            .header("X-Docker-Expose-Session-Uuid", session_id)
            .header("X-Docker-Expose-Session-Name", SESSION_NAME)
            .header("X-Docker-Expose-Session-Sharedkey", "")
            .body(Full::new(Bytes::new()))?;

        let resp = client.send_upgradable(req).await?;
        if resp.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(DockerError::Session(format!(
                "daemon rejected session upgrade with {}",
                resp.status()
            )));
        }

        let upgraded = hyper::upgrade::on(resp)
            .await
            .map_err(|e| DockerError::Session(format!("session upgrade failed: {e}")))?;

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut io = TokioIo::new(upgraded);
            let mut buf = [0u8; 4096];
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    read = io.read(&mut buf) => match read {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    },
                }
            }
        });

        Ok(Self {
            stop: Some(stop_tx),
            task,
        })
    }

    async fn close(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = (&mut self.task).await;
    }
}

/// Tars up a single-file build context containing only a Dockerfile.
fn tarred_dockerfile(content: &str) -> Result<Bytes> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    builder.append_data(&mut header, "Dockerfile", content.as_bytes())?;
    Ok(Bytes::from(builder.into_inner()?))
}

/// Decodes a BuildKit status payload and logs vertexes, statuses, and
/// logs. Vertex and status lines repeat on every progress tick, so they
/// are deduplicated across one build.
fn log_trace(payload: &[u8], seen: &mut HashSet<String>) {
    let status = match control::StatusResponse::decode(payload) {
        Ok(status) => status,
        Err(e) => {
            warn!("undecodable buildkit status: {e}");
            return;
        }
    };

    for vertex in &status.vertexes {
        let key = format!("vertex:{}:{}", vertex.name, vertex.error);
        if !seen.insert(key) {
            continue;
        }
        if vertex.error.is_empty() {
            info!(name = %vertex.name, cached = vertex.cached, "buildkit vertex");
        } else {
            warn!(name = %vertex.name, error = %vertex.error, "buildkit vertex");
        }
    }
    for st in &status.statuses {
        let key = format!("status:{}:{}:{}/{}", st.id, st.name, st.current, st.total);
        if !seen.insert(key) {
            continue;
        }
        if st.current != 0 || st.total != 0 {
            info!(id = %st.id, current = st.current, total = st.total, "buildkit status");
        } else {
            info!(id = %st.id, "buildkit status");
        }
    }
    for log in &status.logs {
        info!(vertex = %log.vertex, "{}", String::from_utf8_lossy(&log.msg).trim_end());
    }
}

/// The slice of BuildKit's control API this crate decodes. Field tags
/// follow `moby/buildkit` `api/services/control/control.proto`; fields we
/// do not need (timestamps, inputs, progress groups) are skipped by the
/// decoder.
mod control {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct StatusResponse {
        #[prost(message, repeated, tag = "1")]
        pub vertexes: Vec<Vertex>,
        #[prost(message, repeated, tag = "2")]
        pub statuses: Vec<VertexStatus>,
        #[prost(message, repeated, tag = "3")]
        pub logs: Vec<VertexLog>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Vertex {
        #[prost(string, tag = "1")]
        pub digest: String,
        #[prost(string, tag = "3")]
        pub name: String,
        #[prost(bool, tag = "4")]
        pub cached: bool,
        #[prost(string, tag = "7")]
        pub error: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct VertexStatus {
        #[prost(string, tag = "1")]
        pub id: String,
        #[prost(string, tag = "2")]
        pub vertex: String,
        #[prost(string, tag = "3")]
        pub name: String,
        #[prost(int64, tag = "4")]
        pub current: i64,
        #[prost(int64, tag = "5")]
        pub total: i64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct VertexLog {
        #[prost(string, tag = "1")]
        pub vertex: String,
        #[prost(int64, tag = "3")]
        pub stream: i64,
        #[prost(bytes = "vec", tag = "4")]
        pub msg: Vec<u8>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn dockerfile_context_is_a_single_entry_tar() {
        let context = tarred_dockerfile("FROM alpine:latest").unwrap();
        let mut archive = tar::Archive::new(context.as_ref());
        let mut entries = archive.entries().unwrap();

        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str(), Some("Dockerfile"));
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        assert_eq!(content, "FROM alpine:latest");

        assert!(entries.next().is_none());
    }

    #[test]
    fn trace_decode_round_trip() {
        let status = control::StatusResponse {
            vertexes: vec![control::Vertex {
                digest: "sha256:aaaa".to_string(),
                name: "[1/1] FROM alpine".to_string(),
                cached: false,
                error: String::new(),
            }],
            statuses: vec![control::VertexStatus {
                id: "extracting".to_string(),
                vertex: "sha256:aaaa".to_string(),
                name: "extract".to_string(),
                current: 10,
                total: 100,
            }],
            logs: vec![],
        };
        let encoded = status.encode_to_vec();

        let mut seen = HashSet::new();
        log_trace(&encoded, &mut seen);
        // One vertex line and one status line were recorded for dedup.
        assert_eq!(seen.len(), 2);
        // The same payload again adds nothing.
        log_trace(&encoded, &mut seen);
        assert_eq!(seen.len(), 2);
    }
}
