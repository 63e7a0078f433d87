//! The cluster aggregate: one virtual engine over many real ones.

use crate::container::{Container, Containers, SWARM_ID_LABEL};
use crate::engine::Engine;
use crate::error::{ClusterError, Result};
use crate::event::{Event, EventHandler, STATUS_ENGINE_CONNECT};
use crate::image::{Image, Images};
use crate::network::{self, Network};
use crate::scheduler::{Scheduler, SpreadScheduler};
use crate::types::{ContainerConfig, NetworkCreateRequest, VolumeCreateRequest};
use crate::volume::{self, Volume};
use bytes::Bytes;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

/// Aggregates many engines behind one engine-shaped surface.
///
/// Owns the engine registry and fans engine events out to an ordered list
/// of registered handlers. The registry lock is independent of any engine's
/// own state lock and is never held across remote I/O.
pub struct Cluster {
    engines: RwLock<HashMap<String, Arc<Engine>>>,
    handlers: Mutex<Vec<(u64, Arc<dyn EventHandler>)>>,
    next_handler_id: AtomicU64,
    scheduler: Box<dyn Scheduler>,
}

impl Cluster {
    /// Creates a cluster with the default placement strategy.
    #[must_use]
    pub fn new() -> Self {
        Self::with_scheduler(Box::new(SpreadScheduler))
    }

    /// Creates a cluster with an explicit placement strategy.
    #[must_use]
    pub fn with_scheduler(scheduler: Box<dyn Scheduler>) -> Self {
        Self {
            engines: RwLock::new(HashMap::new()),
            handlers: Mutex::new(Vec::new()),
            next_handler_id: AtomicU64::new(1),
            scheduler,
        }
    }

    // ------------------------------------------------------------------
    // Engine registry
    // ------------------------------------------------------------------

    /// Registers a connected engine.
    ///
    /// The cluster becomes the engine's event handler and an
    /// `engine_connect` event is published.
    ///
    /// # Errors
    ///
    /// Fails when the engine never connected or when its ID is already
    /// registered. A duplicate ID under a different address is reported as a
    /// likely engine misconfiguration (two daemons sharing a machine ID).
    pub fn add_engine(self: &Arc<Self>, engine: Arc<Engine>) -> Result<()> {
        if !engine.is_connected() {
            return Err(ClusterError::NotConnected(engine.addr().to_string()));
        }
        let id = engine.id();
        {
            let mut engines = self.engines.write().expect("engine registry lock");
            if let Some(existing) = engines.get(&id) {
                if existing.addr() != engine.addr() {
                    warn!(
                        engine = %id,
                        existing = %existing.addr(),
                        new = %engine.addr(),
                        "engine ID already registered under a different address; \
                         likely duplicated engine identity"
                    );
                }
                return Err(ClusterError::DuplicateEngine(id));
            }
            engines.insert(id.clone(), Arc::clone(&engine));
        }

        // An engine already feeding another handler cannot join; the failed
        // registration must leave the cluster untouched.
        if let Err(e) = engine.register_event_handler(Arc::clone(self) as Arc<dyn EventHandler>) {
            self.engines
                .write()
                .expect("engine registry lock")
                .remove(&id);
            return Err(e);
        }
        info!(engine = %engine.name(), addr = %engine.addr(), "engine registered");
        self.handle(&Event::cluster(STATUS_ENGINE_CONNECT, engine.engine_info()));
        Ok(())
    }

    /// Removes an engine from the registry.
    ///
    /// # Errors
    ///
    /// Fails when no engine with `id` is registered.
    pub fn remove_engine(&self, id: &str) -> Result<Arc<Engine>> {
        self.engines
            .write()
            .expect("engine registry lock")
            .remove(id)
            .ok_or_else(|| ClusterError::not_found("engine", id))
    }

    /// Resolves an engine by ID or name.
    #[must_use]
    pub fn engine(&self, id_or_name: &str) -> Option<Arc<Engine>> {
        let engines = self.engines.read().expect("engine registry lock");
        if let Some(engine) = engines.get(id_or_name) {
            return Some(Arc::clone(engine));
        }
        engines
            .values()
            .find(|e| e.name() == id_or_name)
            .cloned()
    }

    /// Every registered engine.
    #[must_use]
    pub fn engines(&self) -> Vec<Arc<Engine>> {
        self.engines
            .read()
            .expect("engine registry lock")
            .values()
            .cloned()
            .collect()
    }

    /// Engines whose last refresh succeeded.
    #[must_use]
    pub fn healthy_engines(&self) -> Vec<Arc<Engine>> {
        self.engines()
            .into_iter()
            .filter(|e| e.is_healthy())
            .collect()
    }

    /// An arbitrary healthy engine, for requests with no affinity to any
    /// particular host.
    ///
    /// # Errors
    ///
    /// Fails when no engine is healthy.
    pub fn random_engine(&self) -> Result<Arc<Engine>> {
        self.healthy_engines()
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(ClusterError::NoEngineAvailable)
    }

    // ------------------------------------------------------------------
    // Aggregate capacity
    // ------------------------------------------------------------------

    /// Sum of advertised CPU capacity across engines.
    #[must_use]
    pub fn total_cpus(&self) -> i64 {
        self.engines().iter().map(|e| e.total_cpus()).sum()
    }

    /// Sum of advertised memory capacity across engines.
    #[must_use]
    pub fn total_memory(&self) -> i64 {
        self.engines().iter().map(|e| e.total_memory()).sum()
    }

    // ------------------------------------------------------------------
    // Unified reads
    // ------------------------------------------------------------------

    /// Every mirrored container across every engine.
    #[must_use]
    pub fn containers(&self) -> Containers {
        Containers(
            self.engines()
                .iter()
                .flat_map(|e| e.containers())
                .collect(),
        )
    }

    /// Resolves one container by ID, Swarm ID, name, or unambiguous prefix.
    #[must_use]
    pub fn container(&self, id_or_name: &str) -> Option<Container> {
        self.containers().get(id_or_name).cloned()
    }

    /// Every mirrored image across every engine.
    #[must_use]
    pub fn images(&self) -> Images {
        Images(self.engines().iter().flat_map(|e| e.images()).collect())
    }

    /// Resolves one image by reference.
    #[must_use]
    pub fn image(&self, reference: &str) -> Option<Image> {
        self.images().get(reference).cloned()
    }

    /// Cluster-wide networks, merged by ID.
    #[must_use]
    pub fn networks(&self) -> Vec<Network> {
        network::uniq(self.engines().iter().flat_map(|e| e.networks()).collect())
    }

    /// Resolves one network by ID, name, or `engineName/name`.
    #[must_use]
    pub fn network(&self, id_or_name: &str) -> Option<Network> {
        self.networks().into_iter().find(|n| n.matches(id_or_name))
    }

    /// Cluster-wide volumes, merged by name and driver.
    #[must_use]
    pub fn volumes(&self) -> Vec<Volume> {
        volume::uniq(self.engines().iter().flat_map(|e| e.volumes()).collect())
    }

    /// Resolves one volume by name or `engineName/name`.
    #[must_use]
    pub fn volume(&self, name: &str) -> Option<Volume> {
        self.volumes().into_iter().find(|v| v.matches(name))
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Creates a container on an engine chosen by the placement strategy.
    ///
    /// A Swarm ID label is injected before the remote call so the container
    /// stays addressable cluster-wide even after a reschedule changes its
    /// engine-assigned ID.
    ///
    /// # Errors
    ///
    /// Fails when no healthy engine can host the container, or with the
    /// chosen engine's error.
    pub async fn create_container(
        &self,
        name: &str,
        mut config: ContainerConfig,
    ) -> Result<Container> {
        config
            .labels
            .entry(SWARM_ID_LABEL.to_string())
            .or_insert_with(|| Uuid::new_v4().to_string());

        let engines = self.healthy_engines();
        let engine = self
            .scheduler
            .select(&engines, &config)
            .ok_or(ClusterError::NoEngineAvailable)?;
        engine.create_container(name, &config).await
    }

    /// Removes a container wherever it lives.
    ///
    /// # Errors
    ///
    /// Fails when the lookup resolves nothing, or with the engine's error.
    pub async fn remove_container(
        &self,
        id_or_name: &str,
        force: bool,
        volumes: bool,
    ) -> Result<()> {
        let (engine, container) = self.resolve_container(id_or_name)?;
        engine.remove_container(&container.id, force, volumes).await
    }

    /// Renames a container wherever it lives.
    ///
    /// # Errors
    ///
    /// Fails when the lookup resolves nothing, or with the engine's error.
    pub async fn rename_container(&self, id_or_name: &str, name: &str) -> Result<()> {
        let (engine, container) = self.resolve_container(id_or_name)?;
        engine.rename_container(&container.id, name).await
    }

    /// Starts a container wherever it lives.
    ///
    /// # Errors
    ///
    /// Fails when the lookup resolves nothing, or with the engine's error.
    pub async fn start_container(&self, id_or_name: &str) -> Result<()> {
        let (engine, container) = self.resolve_container(id_or_name)?;
        engine.start_container(&container.id).await
    }

    /// Pulls an image on every healthy engine.
    ///
    /// Always returns per-engine outcomes; a failing engine never aborts
    /// the pull on the others.
    pub async fn pull(&self, reference: &str) -> Vec<(String, Result<()>)> {
        let mut results = Vec::new();
        for engine in self.healthy_engines() {
            let outcome = engine.pull(reference).await;
            results.push((engine.name(), outcome));
        }
        results
    }

    /// Imports an image from a URL or uploaded tarball on every healthy
    /// engine, reporting per-engine outcomes like [`Cluster::pull`].
    pub async fn import_image(
        &self,
        src: &str,
        repo: &str,
        tag: &str,
        body: Bytes,
    ) -> Vec<(String, Result<()>)> {
        let mut results = Vec::new();
        for engine in self.healthy_engines() {
            let outcome = engine.import_image(src, repo, tag, body.clone()).await;
            results.push((engine.name(), outcome));
        }
        results
    }

    /// Loads an image tarball onto every healthy engine, reporting
    /// per-engine outcomes like [`Cluster::pull`].
    pub async fn load_image(&self, body: Bytes) -> Vec<(String, Result<()>)> {
        let mut results = Vec::new();
        for engine in self.healthy_engines() {
            let outcome = engine.load_image(body.clone()).await;
            results.push((engine.name(), outcome));
        }
        results
    }

    /// Tags an image on every engine that holds it.
    ///
    /// # Errors
    ///
    /// Fails when the reference resolves to no image.
    pub async fn tag_image(&self, reference: &str, repo: &str, tag: &str) -> Result<()> {
        let image = self
            .image(reference)
            .ok_or_else(|| ClusterError::not_found("image", reference))?;
        let mut tagged = false;
        for engine in self.healthy_engines() {
            if engine.images().iter().any(|i| i.id == image.id) {
                engine.tag_image(&image.id, repo, tag).await?;
                tagged = true;
            }
        }
        if tagged {
            Ok(())
        } else {
            Err(ClusterError::not_found("image", reference))
        }
    }

    /// Removes an image from every engine that holds it.
    ///
    /// # Errors
    ///
    /// Fails when the reference resolves to no image.
    pub async fn remove_image(&self, reference: &str, force: bool) -> Result<()> {
        let image = self
            .image(reference)
            .ok_or_else(|| ClusterError::not_found("image", reference))?;
        for engine in self.healthy_engines() {
            if engine.images().iter().any(|i| i.id == image.id) {
                engine.remove_image(&image.id, force).await?;
            }
        }
        Ok(())
    }

    /// Creates a network.
    ///
    /// A name of the form `engineName/name` pins the network to that engine
    /// under the bare name; otherwise an arbitrary healthy engine hosts it
    /// (global-scope drivers propagate it to the rest themselves).
    ///
    /// # Errors
    ///
    /// Fails when the named engine is unknown, no engine is healthy, or with
    /// the engine's error.
    pub async fn create_network(&self, mut req: NetworkCreateRequest) -> Result<String> {
        let engine = match req.name.split_once('/') {
            Some((engine_name, bare)) => {
                let engine = self
                    .engine(engine_name)
                    .ok_or_else(|| ClusterError::not_found("engine", engine_name))?;
                req.name = bare.to_string();
                engine
            }
            None => self.random_engine()?,
        };
        engine.create_network(&req).await
    }

    /// Removes a network from every engine that has it.
    ///
    /// # Errors
    ///
    /// Fails when the lookup resolves nothing, or with an engine's error.
    pub async fn remove_network(&self, id_or_name: &str) -> Result<()> {
        let target = self
            .network(id_or_name)
            .ok_or_else(|| ClusterError::not_found("network", id_or_name))?;
        for engine in self.healthy_engines() {
            if engine.networks().iter().any(|n| n.id == target.id) {
                engine.remove_network(&target.id).await?;
            }
        }
        Ok(())
    }

    /// Creates a volume.
    ///
    /// A name of the form `engineName/name` creates it on that engine only;
    /// a bare name creates it on every healthy engine so any placement can
    /// mount it.
    ///
    /// # Errors
    ///
    /// Fails when the named engine is unknown, no engine is healthy, or when
    /// every engine rejects the volume.
    pub async fn create_volume(&self, mut req: VolumeCreateRequest) -> Result<Volume> {
        if let Some((engine_name, bare)) = req.name.split_once('/') {
            let engine = self
                .engine(engine_name)
                .ok_or_else(|| ClusterError::not_found("engine", engine_name))?;
            req.name = bare.to_string();
            return engine.create_volume(&req).await;
        }

        let engines = self.healthy_engines();
        if engines.is_empty() {
            return Err(ClusterError::NoEngineAvailable);
        }
        let mut created = None;
        let mut last_err = None;
        for engine in engines {
            match engine.create_volume(&req).await {
                Ok(volume) => created = created.or(Some(volume)),
                Err(e) => {
                    warn!(engine = %engine.name(), volume = %req.name,
                          "volume create failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        match created {
            Some(volume) => Ok(volume),
            None => Err(last_err.unwrap_or(ClusterError::NoEngineAvailable)),
        }
    }

    /// Removes a volume from every engine that holds it.
    ///
    /// # Errors
    ///
    /// Fails when the name resolves to no volume, or with an engine's error.
    pub async fn remove_volume(&self, name: &str) -> Result<()> {
        let target = self
            .volume(name)
            .ok_or_else(|| ClusterError::not_found("volume", name))?;
        for engine in self.healthy_engines() {
            if engine.volumes().iter().any(|v| v.name == target.name) {
                engine.remove_volume(&target.name).await?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Event fan-out
    // ------------------------------------------------------------------

    /// Adds a handler to the fan-out list. Returns a stable ID for
    /// deregistration. Handlers run in registration order.
    pub fn register_handler(&self, handler: Arc<dyn EventHandler>) -> u64 {
        let id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .expect("handler list lock")
            .push((id, handler));
        id
    }

    /// Removes a handler by its registration ID.
    pub fn deregister_handler(&self, id: u64) {
        self.handlers
            .lock()
            .expect("handler list lock")
            .retain(|(hid, _)| *hid != id);
    }

    fn resolve_container(&self, id_or_name: &str) -> Result<(Arc<Engine>, Container)> {
        let container = self
            .container(id_or_name)
            .ok_or_else(|| ClusterError::not_found("container", id_or_name))?;
        let engine = self
            .engine(&container.engine.id)
            .ok_or_else(|| ClusterError::not_found("engine", &container.engine.id))?;
        Ok((engine, container))
    }
}

impl Default for Cluster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for Cluster {
    /// Fans one event out to every registered handler in order. Handlers
    /// are synchronous and must not block.
    fn handle(&self, event: &Event) {
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .lock()
            .expect("handler list lock")
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            handler.handle(event);
        }
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("engines", &self.engines().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::EngineClient;
    use crate::engine::tests::{detail_with_shares, summary, MockClient, Recorder};
    use crate::engine::EngineOptions;
    use crate::event::{STATUS_ENGINE_CONNECT, STATUS_ENGINE_DISCONNECT};
    use std::time::Duration;

    async fn engine(id: &str, name: &str) -> (Arc<MockClient>, Arc<Engine>) {
        let client = Arc::new(MockClient::new(id, name, 4, 4096));
        let engine = Arc::new(Engine::new(
            format!("{name}:2375"),
            Arc::clone(&client) as Arc<dyn EngineClient>,
            EngineOptions {
                refresh_interval: Duration::from_secs(3600),
                overcommit_ratio: 0.0,
            },
        ));
        engine.connect().await.unwrap();
        (client, engine)
    }

    #[tokio::test]
    async fn add_engine_requires_connection() {
        let cluster = Arc::new(Cluster::new());
        let client = Arc::new(MockClient::new("ENG:1", "node-1", 4, 4096));
        let engine = Arc::new(Engine::new("node-1:2375", client, EngineOptions::default()));
        let err = cluster.add_engine(engine).unwrap_err();
        assert!(matches!(err, ClusterError::NotConnected(_)));
    }

    #[tokio::test]
    async fn add_engine_rejects_duplicate_ids() {
        let cluster = Arc::new(Cluster::new());
        let (_c1, e1) = engine("ENG:1", "node-1").await;
        cluster.add_engine(e1).unwrap();

        // Same daemon ID reported from a different address.
        let (_c2, e2) = engine("ENG:1", "node-2").await;
        let err = cluster.add_engine(e2).unwrap_err();
        assert!(matches!(err, ClusterError::DuplicateEngine(_)));
        assert_eq!(cluster.engines().len(), 1);
    }

    #[tokio::test]
    async fn failed_handler_registration_leaves_no_engine_behind() {
        let other = Arc::new(Cluster::new());
        let (_c, e) = engine("ENG:1", "node-1").await;
        other.add_engine(Arc::clone(&e)).unwrap();

        // The engine already answers to another cluster; adding it here must
        // fail without leaving it registered.
        let cluster = Arc::new(Cluster::new());
        let err = cluster.add_engine(e).unwrap_err();
        assert!(matches!(err, ClusterError::HandlerExists(_)));
        assert!(cluster.engines().is_empty());
    }

    #[tokio::test]
    async fn add_engine_publishes_engine_connect() {
        let cluster = Arc::new(Cluster::new());
        let recorder = Recorder::new();
        cluster.register_handler(recorder.clone() as Arc<dyn EventHandler>);

        let (_c, e) = engine("ENG:1", "node-1").await;
        cluster.add_engine(e).unwrap();
        assert_eq!(recorder.statuses(), vec![STATUS_ENGINE_CONNECT.to_string()]);
    }

    #[tokio::test]
    async fn engine_lookup_by_id_and_name() {
        let cluster = Arc::new(Cluster::new());
        let (_c, e) = engine("ENG:1", "node-1").await;
        cluster.add_engine(e).unwrap();

        assert!(cluster.engine("ENG:1").is_some());
        assert!(cluster.engine("node-1").is_some());
        assert!(cluster.engine("node-9").is_none());
    }

    #[tokio::test]
    async fn containers_flatten_across_engines() {
        let cluster = Arc::new(Cluster::new());
        let (c1, e1) = engine("ENG:1", "node-1").await;
        let (c2, e2) = engine("ENG:2", "node-2").await;
        c1.set_containers(vec![summary("c1", "web")]);
        c2.set_containers(vec![summary("c2", "db")]);
        e1.refresh_containers(false).await.unwrap();
        e2.refresh_containers(false).await.unwrap();
        cluster.add_engine(e1).unwrap();
        cluster.add_engine(e2).unwrap();

        assert_eq!(cluster.containers().0.len(), 2);
        assert_eq!(cluster.container("c1").unwrap().engine.name, "node-1");
        assert_eq!(cluster.container("node-2/db").unwrap().id, "c2");
    }

    #[tokio::test]
    async fn create_container_injects_a_swarm_id() {
        let cluster = Arc::new(Cluster::new());
        let (client, e) = engine("ENG:1", "node-1").await;
        cluster.add_engine(e).unwrap();

        cluster
            .create_container("web", ContainerConfig::default())
            .await
            .unwrap();

        let created = client.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        let (name, config) = &created[0];
        assert_eq!(name, "web");
        assert!(config.labels.contains_key(SWARM_ID_LABEL));
    }

    #[tokio::test]
    async fn create_container_without_engines_fails() {
        let cluster = Arc::new(Cluster::new());
        let err = cluster
            .create_container("web", ContainerConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NoEngineAvailable));
    }

    #[tokio::test]
    async fn unhealthy_engines_are_excluded_from_placement() {
        let cluster = Arc::new(Cluster::new());
        let (client, e) = engine("ENG:1", "node-1").await;
        cluster.add_engine(Arc::clone(&e)).unwrap();

        client.fail(true);
        e.tick().await;
        assert!(!e.is_healthy());

        let err = cluster
            .create_container("web", ContainerConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NoEngineAvailable));
    }

    #[tokio::test]
    async fn engine_health_edges_reach_cluster_handlers() {
        let cluster = Arc::new(Cluster::new());
        let recorder = Recorder::new();
        cluster.register_handler(recorder.clone() as Arc<dyn EventHandler>);

        let (client, e) = engine("ENG:1", "node-1").await;
        cluster.add_engine(Arc::clone(&e)).unwrap();

        client.fail(true);
        e.tick().await;
        e.tick().await;

        assert_eq!(
            recorder.statuses(),
            vec![
                STATUS_ENGINE_CONNECT.to_string(),
                STATUS_ENGINE_DISCONNECT.to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn deregistered_handlers_stop_receiving() {
        let cluster = Arc::new(Cluster::new());
        let recorder = Recorder::new();
        let id = cluster.register_handler(recorder.clone() as Arc<dyn EventHandler>);
        cluster.deregister_handler(id);

        let (_c, e) = engine("ENG:1", "node-1").await;
        cluster.add_engine(e).unwrap();
        assert!(recorder.statuses().is_empty());
    }

    #[tokio::test]
    async fn import_and_load_reach_every_healthy_engine() {
        let cluster = Arc::new(Cluster::new());
        let (c1, e1) = engine("ENG:1", "node-1").await;
        let (c2, e2) = engine("ENG:2", "node-2").await;
        cluster.add_engine(Arc::clone(&e1)).unwrap();
        cluster.add_engine(Arc::clone(&e2)).unwrap();

        c2.fail(true);
        e2.tick().await;
        assert!(!e2.is_healthy());

        let tarball = Bytes::from_static(b"layers");
        let results = cluster.load_image(tarball.clone()).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "node-1");
        assert_eq!(c1.loads.load(Ordering::SeqCst), 1);
        assert_eq!(c2.loads.load(Ordering::SeqCst), 0);

        let results = cluster
            .import_image("http://files/img.tar", "repo", "latest", tarball)
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(
            *c1.imports.lock().unwrap(),
            vec!["http://files/img.tar".to_string()]
        );
        assert!(c2.imports.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn used_resources_aggregate() {
        let cluster = Arc::new(Cluster::new());
        let (client, e) = engine("ENG:1", "node-1").await;
        client.set_containers(vec![summary("c1", "web")]);
        client.set_detail("c1", detail_with_shares("c1", 100, 512));
        e.refresh_containers(true).await.unwrap();
        cluster.add_engine(e).unwrap();

        assert_eq!(cluster.total_cpus(), 4);
        assert_eq!(cluster.total_memory(), 4096);
    }
}
