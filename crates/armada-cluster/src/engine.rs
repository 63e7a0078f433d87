//! Per-engine state mirror and refresh machinery.
//!
//! Each [`Engine`] owns exactly one remote connection and maintains the
//! mirrored container/image/network/volume lists for that host. State is
//! guarded by one read/write lock that is never held across network I/O;
//! remote listings are fetched first, then swapped in.

use crate::client::EngineClient;
use crate::container::Container;
use crate::error::{ClusterError, Result};
use crate::event::{Event, EventHandler, STATUS_ENGINE_DISCONNECT, STATUS_ENGINE_RECONNECT};
use crate::image::Image;
use crate::network::Network;
use crate::types::{ContainerConfig, ContainerDetail, EngineEvent, VolumeCreateRequest};
use crate::volume::Volume;
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Default period of the background refresh loop.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Identity snapshot of an engine, carried by models and events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineInfo {
    /// Engine ID as reported by the remote daemon.
    pub id: String,
    /// Engine (host) name.
    pub name: String,
    /// Address used to connect and proxy (`host:port`).
    pub addr: String,
}

/// Construction parameters for an [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Background refresh period.
    pub refresh_interval: Duration,
    /// Fraction of raw capacity added on top for placement purposes
    /// (`0.05` advertises 105% of the host's resources).
    pub overcommit_ratio: f64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            overcommit_ratio: 0.0,
        }
    }
}

#[derive(Default)]
struct EngineState {
    id: String,
    name: String,
    labels: HashMap<String, String>,
    cpus: i64,
    memory: i64,
    containers: HashMap<String, Container>,
    images: Vec<Image>,
    networks: Vec<Network>,
    volumes: Vec<Volume>,
}

/// In-process proxy for one remote container-engine daemon.
pub struct Engine {
    addr: String,
    client: Arc<dyn EngineClient>,
    /// Overcommit ratio pre-scaled by 100 so capacity math stays integral.
    overcommit_ratio: i64,
    refresh_interval: Duration,
    state: RwLock<EngineState>,
    healthy: AtomicBool,
    connected: AtomicBool,
    /// True while an event-subscription task holds the remote stream.
    stream_alive: AtomicBool,
    refresh_tx: mpsc::Sender<()>,
    /// Receiver side of the refresh trigger; taken once by the refresh loop.
    refresh_rx: Mutex<Option<mpsc::Receiver<()>>>,
    handler: Mutex<Option<Arc<dyn EventHandler>>>,
}

impl Engine {
    /// Creates an unconnected engine for `addr`.
    #[must_use]
    pub fn new(addr: impl Into<String>, client: Arc<dyn EngineClient>, opts: EngineOptions) -> Self {
        // Capacity-1 trigger: a send while one is pending is dropped, so at
        // most one extra refresh is ever queued.
        let (refresh_tx, refresh_rx) = mpsc::channel(1);
        Self {
            addr: addr.into(),
            client,
            #[allow(clippy::cast_possible_truncation)]
            overcommit_ratio: (opts.overcommit_ratio * 100.0) as i64,
            refresh_interval: opts.refresh_interval,
            state: RwLock::new(EngineState::default()),
            healthy: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            stream_alive: AtomicBool::new(false),
            refresh_tx,
            refresh_rx: Mutex::new(Some(refresh_rx)),
            handler: Mutex::new(None),
        }
    }

    /// Connects to the remote engine.
    ///
    /// Fetches daemon info, then performs a full container refresh and
    /// image/network/volume refreshes synchronously. Only when all of that
    /// succeeds does the engine count as connected and start its background
    /// refresh loop and event subscription.
    ///
    /// # Errors
    ///
    /// Fails fatally (engine unusable, must not be added to a cluster) when
    /// the remote reports no ID — the API version predates what the cluster
    /// can manage — or when the initial refresh fails.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let remote = self.client.info().await?;
        if remote.id.is_empty() {
            return Err(ClusterError::EngineUnsupported(self.addr.clone()));
        }

        {
            let mut state = self.state.write().expect("engine state lock");
            state.id = remote.id;
            state.name = if remote.name.is_empty() {
                self.addr.clone()
            } else {
                remote.name
            };
            state.cpus = remote.ncpu;
            state.memory = remote.mem_total;
            state.labels = parse_labels(remote.labels.as_deref().unwrap_or_default());
        }

        self.refresh_containers(true).await?;
        self.refresh_images().await?;
        self.refresh_networks().await?;
        self.refresh_volumes().await?;

        self.healthy.store(true, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);

        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.run_refresh_loop().await });
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.run_event_stream().await });

        info!(engine = %self.name(), addr = %self.addr, "engine connected");
        Ok(())
    }

    /// Whether the initial connect succeeded.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Whether the last refresh succeeded.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Identity snapshot for models and events.
    #[must_use]
    pub fn engine_info(&self) -> EngineInfo {
        let state = self.state.read().expect("engine state lock");
        EngineInfo {
            id: state.id.clone(),
            name: state.name.clone(),
            addr: self.addr.clone(),
        }
    }

    /// Engine ID (empty until connected).
    #[must_use]
    pub fn id(&self) -> String {
        self.state.read().expect("engine state lock").id.clone()
    }

    /// Engine name.
    #[must_use]
    pub fn name(&self) -> String {
        self.state.read().expect("engine state lock").name.clone()
    }

    /// Connect/proxy address.
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Engine labels.
    #[must_use]
    pub fn labels(&self) -> HashMap<String, String> {
        self.state.read().expect("engine state lock").labels.clone()
    }

    /// Raw CPU count.
    #[must_use]
    pub fn cpus(&self) -> i64 {
        self.state.read().expect("engine state lock").cpus
    }

    /// Raw memory in bytes.
    #[must_use]
    pub fn memory(&self) -> i64 {
        self.state.read().expect("engine state lock").memory
    }

    /// Advertised CPU capacity including overcommit.
    #[must_use]
    pub fn total_cpus(&self) -> i64 {
        let raw = self.cpus();
        raw + raw * self.overcommit_ratio / 100
    }

    /// Advertised memory capacity including overcommit.
    #[must_use]
    pub fn total_memory(&self) -> i64 {
        let raw = self.memory();
        raw + raw * self.overcommit_ratio / 100
    }

    /// Sum of the live containers' normalized CPU shares. Recomputed per
    /// call; the container count per host keeps this cheap.
    #[must_use]
    pub fn used_cpus(&self) -> i64 {
        let state = self.state.read().expect("engine state lock");
        state.containers.values().map(Container::used_cpus).sum()
    }

    /// Sum of the live containers' configured memory.
    #[must_use]
    pub fn used_memory(&self) -> i64 {
        let state = self.state.read().expect("engine state lock");
        state.containers.values().map(Container::used_memory).sum()
    }

    /// Snapshot of the mirrored containers.
    #[must_use]
    pub fn containers(&self) -> Vec<Container> {
        let state = self.state.read().expect("engine state lock");
        state.containers.values().cloned().collect()
    }

    /// One mirrored container by exact ID.
    #[must_use]
    pub fn container(&self, id: &str) -> Option<Container> {
        let state = self.state.read().expect("engine state lock");
        state.containers.get(id).cloned()
    }

    /// Snapshot of the mirrored images.
    #[must_use]
    pub fn images(&self) -> Vec<Image> {
        self.state.read().expect("engine state lock").images.clone()
    }

    /// Snapshot of the mirrored networks.
    #[must_use]
    pub fn networks(&self) -> Vec<Network> {
        self.state
            .read()
            .expect("engine state lock")
            .networks
            .clone()
    }

    /// Snapshot of the mirrored volumes.
    #[must_use]
    pub fn volumes(&self) -> Vec<Volume> {
        self.state.read().expect("engine state lock").volumes.clone()
    }

    /// Registers the engine's event handler. Exactly one handler is
    /// supported per engine.
    ///
    /// # Errors
    ///
    /// Returns an error if a handler is already registered.
    pub fn register_event_handler(&self, handler: Arc<dyn EventHandler>) -> Result<()> {
        let mut slot = self.handler.lock().expect("handler lock");
        if slot.is_some() {
            return Err(ClusterError::HandlerExists(self.id()));
        }
        *slot = Some(handler);
        Ok(())
    }

    /// Wakes the refresh loop ahead of its next tick. A pending wake
    /// coalesces with the next one; this never blocks.
    pub fn trigger_refresh(&self) {
        let _ = self.refresh_tx.try_send(());
    }

    /// Drops a container from the local mirror without touching the remote
    /// engine. Used by the watchdog so rescheduled containers don't show up
    /// twice while their dead engine is still registered.
    pub fn forget_container(&self, id: &str) {
        let mut state = self.state.write().expect("engine state lock");
        state.containers.remove(id);
    }

    // ------------------------------------------------------------------
    // Refresh
    // ------------------------------------------------------------------

    /// Re-syncs every container: the mirrored map is replaced with exactly
    /// what the engine lists — entries absent from the listing are dropped.
    pub(crate) async fn refresh_containers(&self, full: bool) -> Result<()> {
        let summaries = self.client.list_containers(true, None).await?;
        let engine_info = self.engine_info();
        let cpus = self.cpus();

        // Previous inspected configs, reused for soft refreshes.
        let previous: HashMap<String, ContainerConfig> = {
            let state = self.state.read().expect("engine state lock");
            state
                .containers
                .iter()
                .filter_map(|(id, c)| c.config.clone().map(|cfg| (id.clone(), cfg)))
                .collect()
        };

        let mut containers = HashMap::with_capacity(summaries.len());
        for summary in summaries {
            let mut container = Container::from_summary(summary, engine_info.clone());
            if full {
                // A container the engine just listed must inspect; a failure
                // here means the engine itself is in trouble, so the whole
                // refresh (and a connect-time caller) fails with it.
                let detail = self.client.inspect_container(&container.id).await?;
                container.config = Some(normalize_config(detail, cpus));
            } else if let Some(cfg) = previous.get(&container.id) {
                container.config = Some(cfg.clone());
            }
            containers.insert(container.id.clone(), container);
        }

        let mut state = self.state.write().expect("engine state lock");
        state.containers = containers;
        Ok(())
    }

    /// Targeted re-sync of one container.
    ///
    /// More than one listing match for the ID filter means the filter was
    /// ambiguous; fall back to a full refresh. Zero matches means the
    /// container vanished between event and refresh; drop it locally.
    pub(crate) async fn refresh_container(&self, id: &str, full: bool) -> Result<()> {
        let matches = self.client.list_containers(true, Some(id)).await?;
        if matches.len() > 1 {
            return self.refresh_containers(full).await;
        }

        let Some(summary) = matches.into_iter().next() else {
            let mut state = self.state.write().expect("engine state lock");
            state.containers.remove(id);
            return Ok(());
        };

        let engine_info = self.engine_info();
        let cpus = self.cpus();
        let mut container = Container::from_summary(summary, engine_info);
        if full {
            let detail = self.client.inspect_container(&container.id).await?;
            container.config = Some(normalize_config(detail, cpus));
        } else {
            let state = self.state.read().expect("engine state lock");
            if let Some(prev) = state.containers.get(&container.id) {
                container.config = prev.config.clone();
            }
        }

        let mut state = self.state.write().expect("engine state lock");
        state.containers.insert(container.id.clone(), container);
        Ok(())
    }

    pub(crate) async fn refresh_images(&self) -> Result<()> {
        let summaries = self.client.list_images(false).await?;
        let engine_info = self.engine_info();
        let images = summaries
            .into_iter()
            .map(|s| Image::from_summary(s, engine_info.clone()))
            .collect();
        self.state.write().expect("engine state lock").images = images;
        Ok(())
    }

    pub(crate) async fn refresh_networks(&self) -> Result<()> {
        let resources = self.client.list_networks().await?;
        let engine_info = self.engine_info();
        let networks = resources
            .into_iter()
            .map(|r| Network::from_resource(r, engine_info.clone()))
            .collect();
        self.state.write().expect("engine state lock").networks = networks;
        Ok(())
    }

    pub(crate) async fn refresh_volumes(&self) -> Result<()> {
        let resources = self.client.list_volumes().await?;
        let engine_info = self.engine_info();
        let volumes = resources
            .into_iter()
            .map(|r| Volume::from_resource(r, engine_info.clone()))
            .collect();
        self.state.write().expect("engine state lock").volumes = volumes;
        Ok(())
    }

    async fn run_refresh_loop(self: Arc<Self>) {
        let Some(mut refresh_rx) = self.refresh_rx.lock().expect("refresh rx lock").take() else {
            warn!(engine = %self.name(), "refresh loop already running");
            return;
        };

        let mut ticker = tokio::time::interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; connect just refreshed.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                wake = refresh_rx.recv() => {
                    if wake.is_none() {
                        return;
                    }
                }
            }
            self.tick().await;
            // Resubscription happens here, not inside the health state
            // machine: the subscription task itself drives that machine, so
            // spawning from there would make the two tasks mutually
            // recursive.
            if self.is_healthy() && !self.stream_alive.load(Ordering::SeqCst) {
                let engine = Arc::clone(&self);
                tokio::spawn(async move { engine.run_event_stream().await });
            }
        }
    }

    /// One refresh cycle plus health-edge bookkeeping.
    pub(crate) async fn tick(&self) {
        let result = async {
            self.refresh_containers(false).await?;
            self.refresh_images().await
        }
        .await;
        self.observe_refresh(result).await;
    }

    /// Drives the health state machine from a refresh outcome. Transitions
    /// are edge-triggered: a run of failures emits one disconnect, the
    /// first following success emits one reconnect.
    async fn observe_refresh(&self, result: Result<()>) {
        match result {
            Err(e) => {
                if self.healthy.swap(false, Ordering::SeqCst) {
                    warn!(engine = %self.name(), addr = %self.addr, "engine unhealthy: {e}");
                    self.emit(&Event::cluster(STATUS_ENGINE_DISCONNECT, self.engine_info()));
                } else {
                    debug!(engine = %self.name(), "refresh failed while unhealthy: {e}");
                }
            }
            Ok(()) => {
                if !self.healthy.swap(true, Ordering::SeqCst) {
                    info!(engine = %self.name(), addr = %self.addr, "engine back to healthy");
                    self.emit(&Event::cluster(STATUS_ENGINE_RECONNECT, self.engine_info()));
                    if let Err(e) = self.refetch_info().await {
                        debug!(engine = %self.name(), "info refetch after reconnect failed: {e}");
                    }
                }
            }
        }
    }

    /// Best-effort identity/capacity refresh after a reconnect.
    async fn refetch_info(&self) -> Result<()> {
        let remote = self.client.info().await?;
        let mut state = self.state.write().expect("engine state lock");
        if !remote.name.is_empty() {
            state.name = remote.name;
        }
        state.cpus = remote.ncpu;
        state.memory = remote.mem_total;
        state.labels = parse_labels(remote.labels.as_deref().unwrap_or_default());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Remote event stream
    // ------------------------------------------------------------------

    async fn run_event_stream(self: Arc<Self>) {
        // At most one live subscription: health flaps must not stack
        // duplicate streams delivering the same events twice.
        if self.stream_alive.swap(true, Ordering::SeqCst) {
            return;
        }
        let _live = StreamLiveGuard(&self.stream_alive);

        let mut stream = match self.client.events().await {
            Ok(s) => s,
            Err(e) => {
                debug!(engine = %self.name(), "event subscription failed: {e}");
                return;
            }
        };
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => self.handle_remote_event(event).await,
                Err(e) => {
                    debug!(engine = %self.name(), "event stream error: {e}");
                    return;
                }
            }
        }
        debug!(engine = %self.name(), "event stream ended");
    }

    /// Classifies a pushed engine event, refreshes local state accordingly,
    /// then always forwards the event. Refresh failures degrade health but
    /// never suppress forwarding.
    pub(crate) async fn handle_remote_event(&self, event: EngineEvent) {
        let result = match event.status.as_str() {
            // Image-side activity; the container map is unaffected.
            "pull" | "untag" | "delete" | "tag" | "import" => self.refresh_images().await,
            // Network settings only materialize after a full inspect.
            "start" | "die" => self.refresh_container(&event.id, true).await,
            _ => self.refresh_container(&event.id, false).await,
        };
        self.observe_refresh(result).await;

        self.emit(&Event {
            status: event.status,
            id: event.id,
            from: event.from,
            time: event.time,
            engine: self.engine_info(),
        });
    }

    fn emit(&self, event: &Event) {
        let handler = self.handler.lock().expect("handler lock").clone();
        if let Some(handler) = handler {
            handler.handle(event);
        }
    }

    // ------------------------------------------------------------------
    // Typed remote operations
    // ------------------------------------------------------------------

    /// Creates a container on this engine and mirrors it immediately.
    ///
    /// # Errors
    ///
    /// Surfaces the remote engine's error verbatim.
    pub async fn create_container(
        &self,
        name: &str,
        config: &ContainerConfig,
    ) -> Result<Container> {
        let id = self.client.create_container(name, config).await?;
        if let Err(e) = self.refresh_container(&id, true).await {
            debug!(engine = %self.name(), container = %id, "post-create refresh failed: {e}");
        }
        if let Some(container) = self.container(&id) {
            return Ok(container);
        }
        // Refresh raced the listing; synthesize the mirror entry.
        Ok(Container {
            id,
            names: vec![format!("/{name}")],
            image: config.image.clone(),
            image_id: String::new(),
            command: String::new(),
            created: chrono::Utc::now().timestamp(),
            state: "created".to_string(),
            status: "Created".to_string(),
            labels: config.labels.clone(),
            config: Some(config.clone()),
            engine: self.engine_info(),
        })
    }

    /// Removes a container on this engine and drops it from the mirror.
    ///
    /// # Errors
    ///
    /// Surfaces the remote engine's error verbatim.
    pub async fn remove_container(&self, id: &str, force: bool, volumes: bool) -> Result<()> {
        self.client.remove_container(id, force, volumes).await?;
        self.forget_container(id);
        Ok(())
    }

    /// Renames a container on this engine.
    ///
    /// # Errors
    ///
    /// Surfaces the remote engine's error verbatim.
    pub async fn rename_container(&self, id: &str, name: &str) -> Result<()> {
        self.client.rename_container(id, name).await?;
        self.refresh_container(id, false).await
    }

    /// Starts a container on this engine.
    ///
    /// # Errors
    ///
    /// Surfaces the remote engine's error verbatim.
    pub async fn start_container(&self, id: &str) -> Result<()> {
        self.client.start_container(id).await?;
        self.refresh_container(id, true).await
    }

    /// Pulls an image onto this engine.
    ///
    /// # Errors
    ///
    /// Surfaces the remote engine's error verbatim.
    pub async fn pull(&self, reference: &str) -> Result<()> {
        self.client.pull_image(reference).await?;
        self.refresh_images().await
    }

    /// Imports an image onto this engine from a URL or uploaded tarball.
    ///
    /// # Errors
    ///
    /// Surfaces the remote engine's error verbatim.
    pub async fn import_image(&self, src: &str, repo: &str, tag: &str, body: Bytes) -> Result<()> {
        self.client.import_image(src, repo, tag, body).await?;
        self.refresh_images().await
    }

    /// Loads an image tarball onto this engine.
    ///
    /// # Errors
    ///
    /// Surfaces the remote engine's error verbatim.
    pub async fn load_image(&self, body: Bytes) -> Result<()> {
        self.client.load_image(body).await?;
        self.refresh_images().await
    }

    /// Tags an image on this engine.
    ///
    /// # Errors
    ///
    /// Surfaces the remote engine's error verbatim.
    pub async fn tag_image(&self, id: &str, repo: &str, tag: &str) -> Result<()> {
        self.client.tag_image(id, repo, tag).await?;
        self.refresh_images().await
    }

    /// Removes an image from this engine.
    ///
    /// # Errors
    ///
    /// Surfaces the remote engine's error verbatim.
    pub async fn remove_image(&self, id: &str, force: bool) -> Result<()> {
        self.client.remove_image(id, force).await?;
        self.refresh_images().await
    }

    /// Creates a network on this engine.
    ///
    /// # Errors
    ///
    /// Surfaces the remote engine's error verbatim.
    pub async fn create_network(&self, req: &crate::types::NetworkCreateRequest) -> Result<String> {
        let id = self.client.create_network(req).await?;
        self.refresh_networks().await?;
        Ok(id)
    }

    /// Removes a network from this engine.
    ///
    /// # Errors
    ///
    /// Surfaces the remote engine's error verbatim.
    pub async fn remove_network(&self, id: &str) -> Result<()> {
        self.client.remove_network(id).await?;
        self.refresh_networks().await
    }

    /// Creates a volume on this engine.
    ///
    /// # Errors
    ///
    /// Surfaces the remote engine's error verbatim.
    pub async fn create_volume(&self, req: &VolumeCreateRequest) -> Result<Volume> {
        let resource = self.client.create_volume(req).await?;
        self.refresh_volumes().await?;
        Ok(Volume::from_resource(resource, self.engine_info()))
    }

    /// Removes a volume from this engine.
    ///
    /// # Errors
    ///
    /// Surfaces the remote engine's error verbatim.
    pub async fn remove_volume(&self, name: &str) -> Result<()> {
        self.client.remove_volume(name).await?;
        self.refresh_volumes().await
    }
}

/// Clears the subscription-liveness flag when the owning task exits, on any
/// path.
struct StreamLiveGuard<'a>(&'a AtomicBool);

impl Drop for StreamLiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("addr", &self.addr)
            .field("connected", &self.is_connected())
            .field("healthy", &self.is_healthy())
            .finish_non_exhaustive()
    }
}

/// Converts `key=value` label strings to a map.
fn parse_labels(raw: &[String]) -> HashMap<String, String> {
    raw.iter()
        .map(|entry| match entry.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (entry.clone(), String::new()),
        })
        .collect()
}

/// Extracts the inspected config, folding resource limits in and
/// normalizing CPU shares from raw shares to this engine's CPU count.
fn normalize_config(detail: ContainerDetail, cpus: i64) -> ContainerConfig {
    let mut config = detail.config;
    let mut host_config = detail.host_config;
    host_config.cpu_shares = host_config.cpu_shares * cpus / 100;
    config.host_config = Some(host_config);
    config
}
