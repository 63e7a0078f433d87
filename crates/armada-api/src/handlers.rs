//! Docker-compatible API handlers backed by the cluster.
//!
//! Read endpoints serve from the mirrored cluster state; write endpoints go
//! through the cluster so placement and Swarm ID injection apply. Endpoints
//! with engine-specific semantics (inspect, logs, attach, exec) resolve the
//! owning engine and proxy to it.

use crate::api::{AppState, API_VERSION, MIN_API_VERSION};
use crate::error::{ApiError, Result};
use crate::proxy;
use armada_cluster::types::{
    ContainerConfig, CreateContainerResponse, NetworkCreateRequest, NetworkCreateResponse,
    VolumeCreateRequest, VolumeListResponse, VolumeResource,
};
use armada_cluster::{ClusterError, Container};
use axum::body::Body;
use axum::extract::{OriginalUri, Path, Query, State};
use axum::http::{header, Request, Response, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use bytes::Bytes;
use http_body_util::BodyExt;
use std::collections::HashMap;

// ============================================================================
// System
// ============================================================================

/// `GET /_ping`
pub async fn ping() -> &'static str {
    "OK"
}

/// `GET /version`
pub async fn get_version() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "Version": format!("armada/{}", env!("CARGO_PKG_VERSION")),
        "ApiVersion": API_VERSION,
        "MinAPIVersion": MIN_API_VERSION,
        "Os": std::env::consts::OS,
        "Arch": std::env::consts::ARCH,
        "Experimental": false,
    }))
}

/// `GET /info` with cluster-wide totals and a per-engine status block.
pub async fn get_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    let engines = state.cluster.engines();
    let containers = state.cluster.containers().0;
    let running = containers.iter().filter(|c| c.is_running()).count();

    let mut system_status = vec![
        vec!["Engines".to_string(), engines.len().to_string()],
    ];
    for engine in &engines {
        system_status.push(vec![engine.name(), engine.addr().to_string()]);
        system_status.push(vec![
            " └ Status".to_string(),
            if engine.is_healthy() { "Healthy" } else { "Unhealthy" }.to_string(),
        ]);
        system_status.push(vec![
            " └ Containers".to_string(),
            engine.containers().len().to_string(),
        ]);
        system_status.push(vec![
            " └ Reserved CPUs".to_string(),
            format!("{} / {}", engine.used_cpus(), engine.total_cpus()),
        ]);
        system_status.push(vec![
            " └ Reserved Memory".to_string(),
            format!("{} / {}", engine.used_memory(), engine.total_memory()),
        ]);
    }

    Json(serde_json::json!({
        "Name": "armada",
        "ServerVersion": format!("armada/{}", env!("CARGO_PKG_VERSION")),
        "NCPU": state.cluster.total_cpus(),
        "MemTotal": state.cluster.total_memory(),
        "Containers": containers.len(),
        "ContainersRunning": running,
        "Images": state.cluster.images().0.len(),
        "SystemStatus": system_status,
    }))
}

/// `GET /events`: long-poll stream of cluster events as JSON lines.
///
/// The watcher registration lives inside the response stream; when the
/// client goes away the stream drops and the watcher deregisters.
pub async fn events(State(state): State<AppState>) -> Response<Body> {
    let (rx, handle) = state.queue.watch();
    let stream = futures::stream::unfold((rx, handle), |(mut rx, handle)| async move {
        let event = rx.recv().await?;
        let mut line = serde_json::to_vec(&event).ok()?;
        line.push(b'\n');
        Some((
            Ok::<Bytes, std::convert::Infallible>(Bytes::from(line)),
            (rx, handle),
        ))
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from_stream(stream))
        .unwrap_or_default()
}

// ============================================================================
// Containers
// ============================================================================

/// Rewrites listing names to the cluster form `/engineName/name` so callers
/// can see (and address) where each container runs.
fn qualified_summary(container: &Container) -> serde_json::Value {
    let names: Vec<String> = container
        .names
        .iter()
        .map(|n| format!("/{}{}", container.engine.name, n))
        .collect();
    serde_json::json!({
        "Id": container.id,
        "Names": names,
        "Image": container.image,
        "ImageID": container.image_id,
        "Command": container.command,
        "Created": container.created,
        "State": container.state,
        "Status": container.status,
        "Labels": container.labels,
    })
}

/// `GET /containers/json`
pub async fn list_containers(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Vec<serde_json::Value>> {
    let all = params
        .get("all")
        .is_some_and(|v| v == "1" || v == "true");
    let list = state
        .cluster
        .containers()
        .0
        .iter()
        .filter(|c| all || c.is_running())
        .map(qualified_summary)
        .collect();
    Json(list)
}

/// `POST /containers/create`
pub async fn create_container(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    Json(config): Json<ContainerConfig>,
) -> Result<(StatusCode, Json<CreateContainerResponse>)> {
    let name = params.get("name").map_or("", String::as_str);
    let container = state.cluster.create_container(name, config).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateContainerResponse {
            id: container.id,
            warnings: Vec::new(),
        }),
    ))
}

/// `GET /containers/:id/json`: proxied to the owning engine for full
/// inspect fidelity.
pub async fn inspect_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    OriginalUri(uri): OriginalUri,
    req: Request<Body>,
) -> Result<Response<Body>> {
    let container = lookup_container(&state, &id)?;
    proxy::proxy_to_engine(state.tls.as_ref(), &container.engine.addr, &uri, req).await
}

/// `POST /containers/:id/rename`
pub async fn rename_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<StatusCode> {
    let name = params
        .get("name")
        .ok_or_else(|| ApiError::from(ClusterError::InvalidArgument("missing name".into())))?;
    state.cluster.rename_container(&id, name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /containers/:id/start`
pub async fn start_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.cluster.start_container(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /containers/:id`
pub async fn remove_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<StatusCode> {
    let force = params.get("force").is_some_and(|v| v == "1" || v == "true");
    let volumes = params.get("v").is_some_and(|v| v == "1" || v == "true");
    state.cluster.remove_container(&id, force, volumes).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /containers/:id/logs`: streamed straight from the owning engine.
pub async fn container_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    OriginalUri(uri): OriginalUri,
    req: Request<Body>,
) -> Result<Response<Body>> {
    let container = lookup_container(&state, &id)?;
    proxy::proxy_to_engine(state.tls.as_ref(), &container.engine.addr, &uri, req).await
}

/// `POST /containers/:id/attach`: hijacked to the owning engine.
pub async fn attach_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    OriginalUri(uri): OriginalUri,
    req: Request<Body>,
) -> Result<Response<Body>> {
    let container = lookup_container(&state, &id)?;
    proxy::hijack(state.tls.as_ref(), &container.engine.addr, &uri, req).await
}

/// `POST /containers/:id/exec`: proxied to the owning engine, recording
/// which engine issued the exec ID so `exec/:id/start` can route later.
pub async fn exec_create(
    State(state): State<AppState>,
    Path(id): Path<String>,
    OriginalUri(uri): OriginalUri,
    req: Request<Body>,
) -> Result<Response<Body>> {
    let container = lookup_container(&state, &id)?;
    let addr = container.engine.addr.clone();
    let response = proxy::proxy_to_engine(state.tls.as_ref(), &addr, &uri, req).await?;

    // The response is a tiny JSON document; buffer it to learn the exec ID.
    let (parts, body) = response.into_parts();
    let bytes = body
        .collect()
        .await
        .map_err(|e| ApiError::Transport(format!("exec create response: {e}")))?
        .to_bytes();
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes) {
        if let Some(exec_id) = value.get("Id").and_then(|v| v.as_str()) {
            state
                .exec_engines
                .lock()
                .expect("exec routing lock")
                .insert(exec_id.to_string(), addr);
        }
    }
    Ok(Response::from_parts(parts, Body::from(bytes)))
}

/// `POST /exec/:id/start`: hijacked to the engine that created the exec.
pub async fn exec_start(
    State(state): State<AppState>,
    Path(id): Path<String>,
    OriginalUri(uri): OriginalUri,
    req: Request<Body>,
) -> Result<Response<Body>> {
    let addr = state
        .exec_engines
        .lock()
        .expect("exec routing lock")
        .get(&id)
        .cloned()
        .ok_or_else(|| ApiError::from(ClusterError::not_found("exec", &id)))?;
    proxy::hijack(state.tls.as_ref(), &addr, &uri, req).await
}

// ============================================================================
// Images
// ============================================================================

/// `GET /images/json`
pub async fn list_images(State(state): State<AppState>) -> Json<Vec<serde_json::Value>> {
    let list = state
        .cluster
        .images()
        .0
        .iter()
        .map(|image| {
            serde_json::json!({
                "Id": image.id,
                "RepoTags": image.repo_tags,
                "Created": image.created,
                "Size": image.size,
                "Labels": image.labels,
            })
        })
        .collect();
    Json(list)
}

/// `POST /images/create`: a pull (`fromImage`) runs on every healthy engine;
/// an import (`fromSrc`) distributes the source the same way. Either way the
/// response is one status line per engine, Docker progress style.
pub async fn pull_image(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Response<Body>> {
    if let Some(src) = params.get("fromSrc") {
        let repo = params.get("repo").map_or("", String::as_str);
        let tag = params.get("tag").map_or("", String::as_str);
        let results = state.cluster.import_image(src, repo, tag, body).await;
        return engine_status_lines(results, &format!("Imported {src}"), "Error importing");
    }

    let from_image = params
        .get("fromImage")
        .ok_or_else(|| ApiError::from(ClusterError::InvalidArgument("missing fromImage".into())))?;
    let reference = match params.get("tag") {
        Some(tag) if !tag.is_empty() => format!("{from_image}:{tag}"),
        _ => from_image.clone(),
    };

    let results = state.cluster.pull(&reference).await;
    engine_status_lines(results, &format!("Pulled {reference}"), "Error pulling")
}

/// `POST /images/load`: loads the uploaded tarball on every healthy engine.
pub async fn load_image(State(state): State<AppState>, body: Bytes) -> Result<Response<Body>> {
    let results = state.cluster.load_image(body).await;
    engine_status_lines(results, "Loaded image", "Error loading image")
}

/// Renders per-engine outcomes as a JSON-lines progress body.
fn engine_status_lines(
    results: Vec<(String, armada_cluster::Result<()>)>,
    ok: &str,
    failed: &str,
) -> Result<Response<Body>> {
    if results.is_empty() {
        return Err(ClusterError::NoEngineAvailable.into());
    }

    let mut lines = Vec::new();
    for (engine, outcome) in results {
        let status = match outcome {
            Ok(()) => serde_json::json!({
                "status": format!("{engine}: {ok}"),
            }),
            Err(e) => serde_json::json!({
                "status": format!("{engine}: {failed}"),
                "error": e.to_string(),
            }),
        };
        lines.extend_from_slice(status.to_string().as_bytes());
        lines.push(b'\n');
    }

    Response::builder()
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(lines))
        .map_err(|e| ApiError::server(e.to_string()))
}

/// `POST /images/:id/tag`
pub async fn tag_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<StatusCode> {
    let repo = params
        .get("repo")
        .ok_or_else(|| ApiError::from(ClusterError::InvalidArgument("missing repo".into())))?;
    let tag = params.get("tag").map_or("latest", String::as_str);
    state.cluster.tag_image(&id, repo, tag).await?;
    Ok(StatusCode::CREATED)
}

/// `DELETE /images/:id`
pub async fn remove_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<serde_json::Value>>> {
    let force = params.get("force").is_some_and(|v| v == "1" || v == "true");
    state.cluster.remove_image(&id, force).await?;
    Ok(Json(vec![serde_json::json!({ "Deleted": id })]))
}

// ============================================================================
// Networks
// ============================================================================

/// `GET /networks`
pub async fn list_networks(State(state): State<AppState>) -> Json<Vec<serde_json::Value>> {
    let list = state
        .cluster
        .networks()
        .iter()
        .map(network_json)
        .collect();
    Json(list)
}

/// `GET /networks/:id`
pub async fn inspect_network(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let network = state
        .cluster
        .network(&id)
        .ok_or_else(|| ApiError::from(ClusterError::not_found("network", &id)))?;
    Ok(Json(network_json(&network)))
}

/// `POST /networks/create`
pub async fn create_network(
    State(state): State<AppState>,
    Json(req): Json<NetworkCreateRequest>,
) -> Result<(StatusCode, Json<NetworkCreateResponse>)> {
    let id = state.cluster.create_network(req).await?;
    Ok((
        StatusCode::CREATED,
        Json(NetworkCreateResponse {
            id,
            warning: String::new(),
        }),
    ))
}

/// `DELETE /networks/:id`
pub async fn remove_network(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.cluster.remove_network(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn network_json(network: &armada_cluster::Network) -> serde_json::Value {
    serde_json::json!({
        "Id": network.id,
        "Name": format!("{}/{}", network.engine.name, network.name),
        "Driver": network.driver,
        "Scope": network.scope,
        "Options": network.options,
        "Labels": network.labels,
        "Containers": network.containers,
    })
}

// ============================================================================
// Volumes
// ============================================================================

/// `GET /volumes`
pub async fn list_volumes(State(state): State<AppState>) -> Json<VolumeListResponse> {
    let volumes = state
        .cluster
        .volumes()
        .into_iter()
        .map(volume_resource)
        .collect();
    Json(VolumeListResponse {
        volumes,
        warnings: Vec::new(),
    })
}

/// `GET /volumes/:name`
pub async fn inspect_volume(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<VolumeResource>> {
    let volume = state
        .cluster
        .volume(&name)
        .ok_or_else(|| ApiError::from(ClusterError::not_found("volume", &name)))?;
    Ok(Json(volume_resource(volume)))
}

/// `POST /volumes/create`
pub async fn create_volume(
    State(state): State<AppState>,
    Json(req): Json<VolumeCreateRequest>,
) -> Result<(StatusCode, Json<VolumeResource>)> {
    let volume = state.cluster.create_volume(req).await?;
    Ok((StatusCode::CREATED, Json(volume_resource(volume))))
}

/// `DELETE /volumes/:name`
pub async fn remove_volume(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode> {
    state.cluster.remove_volume(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn volume_resource(volume: armada_cluster::Volume) -> VolumeResource {
    VolumeResource {
        name: volume.name,
        driver: volume.driver,
        mountpoint: volume.mountpoint,
        labels: volume.labels,
        options: volume.options,
        scope: volume.scope,
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn lookup_container(state: &AppState, id_or_name: &str) -> Result<Container> {
    state
        .cluster
        .container(id_or_name)
        .ok_or_else(|| ApiError::from(ClusterError::not_found("container", id_or_name)))
}
