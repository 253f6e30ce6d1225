//! HTTP/1.1 client for the Docker Engine API over a Unix socket.
//!
//! Each operation opens its own connection, mirroring how short-lived the
//! daemon conversations are; export streams keep theirs open until the
//! body is drained.

use crate::error::{DockerError, Result};
use crate::{ExportStream, PullOutcome, RegistryAuth};
use base64::Engine as _;
use bytes::Bytes;
use futures::StreamExt;
use http_body_util::{BodyExt, BodyStream, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::header;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::UnixStream;
use tokio_util::io::StreamReader;
use tracing::{debug, info};

/// Default Docker daemon socket path.
pub const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

/// Engine API version every request is pinned to.
const API_VERSION: &str = "v1.44";

/// A local image as reported by the daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageInfo {
    /// Image id, e.g. `sha256:<hex>`.
    #[serde(rename = "Id")]
    pub id: String,
}

/// One result entry from an image delete.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageDeleteItem {
    /// A tag that was removed.
    #[serde(rename = "Untagged", default)]
    pub untagged: Option<String>,
    /// An image layer or config that was removed.
    #[serde(rename = "Deleted", default)]
    pub deleted: Option<String>,
}

/// A line of the daemon's JSON status stream (pull, build).
#[derive(Debug, Default, Deserialize)]
pub(crate) struct JsonMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub stream: Option<String>,
    #[serde(default)]
    pub aux: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, rename = "errorDetail")]
    pub error_detail: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorDetail {
    #[serde(default)]
    pub message: Option<String>,
}

impl JsonMessage {
    /// The error carried by this message, if any.
    pub(crate) fn error_message(&self) -> Option<String> {
        self.error
            .clone()
            .or_else(|| self.error_detail.as_ref().and_then(|d| d.message.clone()))
    }
}

/// Docker daemon client.
pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    /// Creates a client for the daemon behind `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    /// Returns the socket path this client talks to.
    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Looks up a reference in the daemon's local image store.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon is unreachable or answers with a
    /// non-success status.
    pub async fn inspect(&self, reference: &str) -> Result<Option<ImageInfo>> {
        let filters = serde_json::json!({ "reference": [reference] }).to_string();
        let uri = format!(
            "/{API_VERSION}/images/json?filters={}",
            urlencoding::encode(&filters)
        );
        let req = self.request(Method::GET, &uri).body(empty_body())?;
        let resp = self.send(req).await?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }

        let content = collect_bytes(resp.into_body()).await?;
        let images: Vec<ImageInfo> =
            serde_json::from_slice(&content).map_err(|source| DockerError::Decode {
                source,
                content: String::from_utf8_lossy(&content).into_owned(),
            })?;
        Ok(images.into_iter().next())
    }

    /// Pulls a reference, streaming status lines to the log.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon is unreachable, rejects the pull, or
    /// the status stream reports a failure. An upstream 404 is not an
    /// error; it is [`PullOutcome::NotFound`].
    pub async fn pull(
        &self,
        reference: &str,
        auth: Option<&RegistryAuth>,
    ) -> Result<PullOutcome> {
        let uri = format!(
            "/{API_VERSION}/images/create?fromImage={}",
            urlencoding::encode(reference)
        );
        let mut builder = self.request(Method::POST, &uri);
        if let Some(auth) = auth {
            builder = builder.header("X-Registry-Auth", registry_auth_header(auth));
        }
        let resp = self.send(builder.body(empty_body())?).await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(PullOutcome::NotFound);
        }
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }

        let mut lines = BufReader::new(body_reader(resp.into_body())).lines();
        let mut stream_error: Option<String> = None;
        while let Some(line) = lines.next_line().await? {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<JsonMessage>(&line) {
                Ok(msg) => {
                    if let Some(err) = msg.error_message() {
                        stream_error.get_or_insert(err);
                    } else if let Some(status) = &msg.status {
                        match &msg.id {
                            Some(id) => info!(id = %id, "{status}"),
                            None => info!("{status}"),
                        }
                    } else {
                        info!("{line}");
                    }
                }
                Err(_) => info!("{line}"),
            }
        }

        if let Some(err) = stream_error {
            return Err(DockerError::Pull(err));
        }
        Ok(PullOutcome::Pulled)
    }

    /// Exports an image as an OCI-layout tar stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon is unreachable or does not know the
    /// image.
    pub async fn export(&self, image: &str) -> Result<ExportStream> {
        let uri = format!(
            "/{API_VERSION}/images/{}/get",
            urlencoding::encode(image)
        );
        let req = self.request(Method::GET, &uri).body(empty_body())?;
        let resp = self.send(req).await?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }
        Ok(Box::pin(body_reader(resp.into_body())))
    }

    /// Deletes an image, returning what the daemon untagged and removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon is unreachable or refuses the
    /// delete.
    pub async fn remove_image(&self, image: &str) -> Result<Vec<ImageDeleteItem>> {
        let uri = format!("/{API_VERSION}/images/{}", urlencoding::encode(image));
        let req = self.request(Method::DELETE, &uri).body(empty_body())?;
        let resp = self.send(req).await?;
        if !resp.status().is_success() {
            return Err(api_error(resp).await);
        }

        let content = collect_bytes(resp.into_body()).await?;
        serde_json::from_slice(&content).map_err(|source| DockerError::Decode {
            source,
            content: String::from_utf8_lossy(&content).into_owned(),
        })
    }

    fn request(&self, method: Method, path_and_query: &str) -> hyper::http::request::Builder {
        Request::builder()
            .method(method)
            .uri(path_and_query)
            .header(header::HOST, "localhost")
    }

    /// Sends a request over a fresh connection.
    pub(crate) async fn send(&self, req: Request<Full<Bytes>>) -> Result<Response<Incoming>> {
        let (mut sender, conn) = self.handshake().await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                log_connection_end(&e);
            }
        });
        Ok(sender.send_request(req).await?)
    }

    /// Sends a request over a fresh connection that supports HTTP
    /// upgrades (the BuildKit session hijack).
    pub(crate) async fn send_upgradable(
        &self,
        req: Request<Full<Bytes>>,
    ) -> Result<Response<Incoming>> {
        let (mut sender, conn) = self.handshake().await?;
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                log_connection_end(&e);
            }
        });
        Ok(sender.send_request(req).await?)
    }

    async fn handshake(
        &self,
    ) -> Result<(
        http1::SendRequest<Full<Bytes>>,
        http1::Connection<TokioIo<UnixStream>, Full<Bytes>>,
    )> {
        let stream =
            UnixStream::connect(&self.socket_path)
                .await
                .map_err(|source| DockerError::Connect {
                    socket: self.socket_path.display().to_string(),
                    source,
                })?;
        Ok(http1::handshake(TokioIo::new(stream)).await?)
    }
}

fn log_connection_end(e: &hyper::Error) {
    let msg = e.to_string().to_lowercase();
    if !msg.contains("canceled") && !msg.contains("incomplete") {
        debug!("docker daemon connection ended: {e}");
    }
}

fn empty_body() -> Full<Bytes> {
    Full::new(Bytes::new())
}

/// Encodes pull credentials the way the Engine API wants them: the
/// `X-Registry-Auth` header carries URL-safe base64 of an AuthConfig.
fn registry_auth_header(auth: &RegistryAuth) -> String {
    let config = serde_json::json!({
        "username": auth.username,
        "password": auth.password,
    });
    base64::engine::general_purpose::URL_SAFE.encode(config.to_string())
}

/// Turns a response body into an `AsyncRead` without buffering it.
pub(crate) fn body_reader(body: Incoming) -> impl AsyncRead + Send + Unpin {
    let stream = BodyStream::new(body).map(|result| match result {
        Ok(frame) => Ok(frame.into_data().unwrap_or_default()),
        Err(e) => Err(std::io::Error::other(e)),
    });
    StreamReader::new(stream)
}

pub(crate) async fn collect_bytes(body: Incoming) -> Result<Bytes> {
    Ok(body.collect().await?.to_bytes())
}

pub(crate) async fn api_error(resp: Response<Incoming>) -> DockerError {
    let status = resp.status();
    let body = match collect_bytes(resp.into_body()).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => format!("<unreadable body: {e}>"),
    };
    DockerError::Api { status, body }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_header_is_urlsafe_base64_json() {
        let auth = RegistryAuth {
            username: "AWS".to_string(),
            password: "token".to_string(),
        };
        let header = registry_auth_header(&auth);
        let decoded = base64::engine::general_purpose::URL_SAFE
            .decode(header)
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(value["username"], "AWS");
        assert_eq!(value["password"], "token");
    }

    #[test]
    fn json_message_error_precedence() {
        let msg: JsonMessage =
            serde_json::from_str(r#"{"errorDetail":{"message":"detail"},"error":"top"}"#).unwrap();
        assert_eq!(msg.error_message().as_deref(), Some("top"));

        let msg: JsonMessage =
            serde_json::from_str(r#"{"errorDetail":{"message":"detail"}}"#).unwrap();
        assert_eq!(msg.error_message().as_deref(), Some("detail"));

        let msg: JsonMessage = serde_json::from_str(r#"{"status":"Downloading"}"#).unwrap();
        assert_eq!(msg.error_message(), None);
    }
}
