//! Cluster API router.
//!
//! Serves the Docker Engine API surface over the whole cluster; one router
//! instance is nested under every supported version prefix so clients
//! negotiating any version in range land on the same handlers.

use crate::error::Result;
use crate::handlers;
use crate::proxy;
use armada_cluster::transport::TlsConfig;
use armada_cluster::{Cluster, EventQueue};
use axum::body::Body;
use axum::extract::{OriginalUri, State};
use axum::http::{header, Response, Uri};
use axum::routing::{delete, get, head, post};
use axum::Router;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Highest Docker API version the router answers under.
pub const API_VERSION: &str = "1.48";
/// Lowest accepted version prefix.
pub const MIN_API_VERSION: &str = "1.24";

/// Application state shared with handlers.
#[derive(Clone)]
pub struct AppState {
    /// The cluster aggregate.
    pub cluster: Arc<Cluster>,
    /// Fan-out queue behind `/events`.
    pub queue: Arc<EventQueue>,
    /// TLS client config for dialing engines, if the cluster uses TLS.
    pub tls: Option<TlsConfig>,
    /// Exec ID to engine address routing, filled by exec create.
    pub exec_engines: Arc<Mutex<HashMap<String, String>>>,
}

impl AppState {
    /// Creates the shared handler state.
    #[must_use]
    pub fn new(cluster: Arc<Cluster>, queue: Arc<EventQueue>, tls: Option<TlsConfig>) -> Self {
        Self {
            cluster,
            queue,
            tls,
            exec_engines: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Creates the cluster API router with all endpoints.
#[must_use]
pub fn create_router(state: AppState) -> Router {
    let mut router = api_routes();
    // Accept every version prefix in the supported range; the handlers
    // themselves are version-agnostic.
    for minor in 24..=48 {
        router = router.nest(&format!("/v1.{minor}"), api_routes());
    }

    router.fallback(proxy_fallback).with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/_ping", get(handlers::ping))
        .route("/_ping", head(handlers::ping))
        .route("/version", get(handlers::get_version))
        .route("/info", get(handlers::get_info))
        .route("/events", get(handlers::events))
        .route("/containers/json", get(handlers::list_containers))
        .route("/containers/create", post(handlers::create_container))
        .route("/containers/:id/json", get(handlers::inspect_container))
        .route("/containers/:id/rename", post(handlers::rename_container))
        .route("/containers/:id/start", post(handlers::start_container))
        .route("/containers/:id/logs", get(handlers::container_logs))
        .route("/containers/:id/attach", post(handlers::attach_container))
        .route("/containers/:id/exec", post(handlers::exec_create))
        .route("/containers/:id", delete(handlers::remove_container))
        .route("/exec/:id/start", post(handlers::exec_start))
        .route("/images/json", get(handlers::list_images))
        .route("/images/create", post(handlers::pull_image))
        .route("/images/load", post(handlers::load_image))
        .route("/images/:id/tag", post(handlers::tag_image))
        .route("/images/:id", delete(handlers::remove_image))
        .route("/networks", get(handlers::list_networks))
        .route("/networks/create", post(handlers::create_network))
        .route("/networks/:id", get(handlers::inspect_network))
        .route("/networks/:id", delete(handlers::remove_network))
        .route("/volumes", get(handlers::list_volumes))
        .route("/volumes/create", post(handlers::create_volume))
        .route("/volumes/:name", get(handlers::inspect_volume))
        .route("/volumes/:name", delete(handlers::remove_volume))
}

/// Catch-all handler for endpoints the router doesn't model.
///
/// Container-scoped paths resolve the owning engine from the path and proxy
/// there, so endpoints like stop, pause or stats keep working without a
/// dedicated handler. Everything else goes to an arbitrary healthy engine.
/// Upgrade requests get the hijack treatment either way.
async fn proxy_fallback(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    req: axum::http::Request<Body>,
) -> Result<Response<Body>> {
    let addr = match container_scoped_target(&state, &uri) {
        Some(addr) => addr,
        None => state.cluster.random_engine()?.addr().to_string(),
    };

    let wants_upgrade = req.headers().get(header::UPGRADE).is_some()
        || req
            .headers()
            .get(header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().contains("upgrade"));

    if wants_upgrade {
        return proxy::hijack(state.tls.as_ref(), &addr, &uri, req).await;
    }
    proxy::proxy_to_engine(state.tls.as_ref(), &addr, &uri, req).await
}

/// Extracts the owning engine's address from `/containers/{id}/...` paths,
/// with or without a version prefix.
fn container_scoped_target(state: &AppState, uri: &Uri) -> Option<String> {
    let mut segments = uri.path().split('/').filter(|s| !s.is_empty());
    let first = segments.next()?;
    let (kind, id) = if first.starts_with("v1.") {
        (segments.next()?, segments.next()?)
    } else {
        (first, segments.next()?)
    };
    if kind != "containers" {
        return None;
    }
    state
        .cluster
        .container(id)
        .map(|c| c.engine.addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AppState {
        AppState::new(
            Arc::new(Cluster::new()),
            Arc::new(EventQueue::new()),
            None,
        )
    }

    #[test]
    fn container_paths_are_recognized() {
        let s = state();
        // No engines registered: resolution yields nothing, but the path
        // shape must be parsed either way.
        assert!(container_scoped_target(&s, &"/containers/abc/stop".parse().unwrap()).is_none());
        assert!(
            container_scoped_target(&s, &"/v1.41/containers/abc/stop".parse().unwrap()).is_none()
        );
        assert!(container_scoped_target(&s, &"/images/json".parse().unwrap()).is_none());
    }
}
