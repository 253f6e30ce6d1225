//! HTTP listener.
//!
//! A plain TCP accept loop serving each connection with hyper http1.
//! Registry clients (kubelet, docker push) hold connections open for
//! streamed blob bodies, so every connection gets its own task.

use axum::Router;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower::Service;
use tower_http::trace::TraceLayer;
use tracing::info;

/// The registry's HTTP server.
pub struct RegistryServer {
    addr: SocketAddr,
    router: Router,
}

impl RegistryServer {
    /// Creates a server for `router` on `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr, router: Router) -> Self {
        Self { addr, router }
    }

    /// Runs the accept loop. Never returns except on listener errors.
    ///
    /// # Errors
    ///
    /// Returns an error if binding or accepting fails.
    pub async fn run(self) -> std::io::Result<()> {
        let app = self.router.layer(TraceLayer::new_for_http());
        let listener = TcpListener::bind(self.addr).await?;
        info!("listening on {}", self.addr);

        loop {
            let (stream, _) = listener.accept().await?;
            let tower_service = app.clone();
            tokio::spawn(async move {
                let hyper_service =
                    hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
                        tower_service.clone().call(request)
                    });

                if let Err(err) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), hyper_service)
                    .await
                {
                    let err_str = err.to_string().to_lowercase();
                    if !err_str.contains("shutting down")
                        && !err_str.contains("connection reset")
                        && !err_str.contains("broken pipe")
                    {
                        tracing::error!("error serving connection: {err}");
                    }
                }
            });
        }
    }
}
