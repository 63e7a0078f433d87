//! Cluster API server.

use crate::api::{create_router, AppState};
use crate::error::{ApiError, Result};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tower::Service;
use tower_http::trace::TraceLayer;

/// HTTP server exposing the cluster API.
pub struct ApiServer {
    listen: SocketAddr,
}

impl ApiServer {
    /// Creates a server bound to `listen` once run.
    #[must_use]
    pub const fn new(listen: SocketAddr) -> Self {
        Self { listen }
    }

    /// Runs the accept loop until the process shuts down.
    ///
    /// Each connection is served on its own task with upgrade support, so
    /// attach and exec sessions can take over their connection.
    ///
    /// # Errors
    ///
    /// Returns an error if binding or accepting fails.
    pub async fn run(&self, state: AppState) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.listen)
            .await
            .map_err(|e| ApiError::server(format!("bind {}: {e}", self.listen)))?;
        tracing::info!("cluster API listening on {}", self.listen);

        let app = create_router(state).layer(TraceLayer::new_for_http());

        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| ApiError::server(e.to_string()))?;

            let tower_service = app.clone();
            tokio::spawn(async move {
                let hyper_service =
                    hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
                        tower_service.clone().call(request)
                    });

                if let Err(err) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), hyper_service)
                    .with_upgrades()
                    .await
                {
                    let err_str = err.to_string().to_lowercase();
                    if !err_str.contains("shutting down")
                        && !err_str.contains("connection reset")
                        && !err_str.contains("broken pipe")
                    {
                        tracing::error!("error serving connection from {peer}: {err}");
                    }
                }
            });
        }
    }
}
