//! Remote engine client seam.
//!
//! The cluster core talks to engines exclusively through [`EngineClient`],
//! allowing different implementations (real HTTP, mock for testing).

use crate::error::Result;
use crate::types::{
    ContainerConfig, ContainerDetail, ContainerSummary, EngineEvent, EngineInfoDto, ImageSummary,
    NetworkCreateRequest, NetworkResource, VolumeCreateRequest, VolumeResource,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

/// A live stream of raw events pushed by the remote engine.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<EngineEvent>> + Send>>;

/// The remote engine API surface the cluster consumes.
///
/// The endpoint set is dictated by the Docker-compatible remote engine, not
/// by this system; implementations surface remote errors verbatim.
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Fetches daemon identity and capacity (`GET /info`).
    async fn info(&self) -> Result<EngineInfoDto>;

    /// Lists containers, optionally filtered by exact ID.
    async fn list_containers(&self, all: bool, id_filter: Option<&str>)
        -> Result<Vec<ContainerSummary>>;

    /// Inspects one container.
    async fn inspect_container(&self, id: &str) -> Result<ContainerDetail>;

    /// Creates a container; returns the engine-assigned ID.
    async fn create_container(&self, name: &str, config: &ContainerConfig) -> Result<String>;

    /// Removes a container.
    async fn remove_container(&self, id: &str, force: bool, volumes: bool) -> Result<()>;

    /// Renames a container.
    async fn rename_container(&self, id: &str, name: &str) -> Result<()>;

    /// Starts a container.
    async fn start_container(&self, id: &str) -> Result<()>;

    /// Lists images.
    async fn list_images(&self, all: bool) -> Result<Vec<ImageSummary>>;

    /// Pulls an image by reference (`repo:tag`).
    async fn pull_image(&self, reference: &str) -> Result<()>;

    /// Imports an image from a URL or raw tarball
    /// (`POST /images/create?fromSrc=...`).
    async fn import_image(&self, src: &str, repo: &str, tag: &str, body: Bytes) -> Result<()>;

    /// Loads an image tarball (`POST /images/load`).
    async fn load_image(&self, body: Bytes) -> Result<()>;

    /// Tags an image.
    async fn tag_image(&self, id: &str, repo: &str, tag: &str) -> Result<()>;

    /// Removes an image.
    async fn remove_image(&self, id: &str, force: bool) -> Result<()>;

    /// Lists networks.
    async fn list_networks(&self) -> Result<Vec<NetworkResource>>;

    /// Creates a network; returns the engine-assigned ID.
    async fn create_network(&self, req: &NetworkCreateRequest) -> Result<String>;

    /// Removes a network.
    async fn remove_network(&self, id: &str) -> Result<()>;

    /// Lists volumes.
    async fn list_volumes(&self) -> Result<Vec<VolumeResource>>;

    /// Creates a volume.
    async fn create_volume(&self, req: &VolumeCreateRequest) -> Result<VolumeResource>;

    /// Removes a volume.
    async fn remove_volume(&self, name: &str) -> Result<()>;

    /// Subscribes to the engine's event stream.
    async fn events(&self) -> Result<EventStream>;
}
