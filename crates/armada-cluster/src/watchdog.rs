//! Container rescheduling on engine failure.

use crate::cluster::Cluster;
use crate::container::{Container, ReschedulePolicy};
use crate::error::Result;
use crate::event::{Event, EventHandler, CLUSTER_EVENT_SOURCE, STATUS_ENGINE_DISCONNECT};
use crate::store::Store;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Persisted record of one reschedule decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RescheduleRecord {
    /// Cluster-internal Swarm ID of the container, stable across moves.
    pub swarm_id: Option<String>,
    /// Container name.
    pub name: String,
    /// Engine the container was moved off.
    pub from_engine: String,
    /// Engine the container landed on.
    pub to_engine: String,
    /// Engine-assigned ID before the move.
    pub old_id: String,
    /// Engine-assigned ID after the move.
    pub new_id: String,
    /// When the move happened, Unix seconds.
    pub time: i64,
}

/// Moves `reschedule-policy=always` containers off dead engines.
///
/// Registered as a cluster event handler; only `engine_disconnect` events
/// synthesized by the cluster itself trigger it. Reschedule runs are
/// serialized through one async mutex so two engines failing at once cannot
/// race placement decisions against each other.
pub struct Watchdog {
    cluster: Arc<Cluster>,
    store: Arc<Store>,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl Watchdog {
    /// Creates a watchdog over `cluster`, persisting decisions in `store`.
    #[must_use]
    pub fn new(cluster: Arc<Cluster>, store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            store,
            gate: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    /// Reschedules every `always` container of the given engine.
    ///
    /// Failures to move an individual container are logged and skipped; the
    /// rest of the engine's containers are still processed.
    pub async fn reschedule_engine(&self, engine_id: &str) {
        let _serialized = self.gate.lock().await;

        let Some(engine) = self.cluster.engine(engine_id) else {
            return;
        };
        let victims: Vec<Container> = engine
            .containers()
            .into_iter()
            .filter(|c| c.reschedule_policy() == ReschedulePolicy::Always)
            .collect();

        for container in victims {
            // Drop the mirror entry first so the recreated container never
            // coexists with a stale copy of itself in cluster listings.
            engine.forget_container(&container.id);
            if let Err(e) = self.reschedule_container(&container).await {
                warn!(
                    container = %container.name(),
                    engine = %engine_id,
                    "reschedule failed: {e}"
                );
            }
        }
    }

    async fn reschedule_container(&self, container: &Container) -> Result<()> {
        let config = container.config.clone().unwrap_or_default();
        let name = container.name().to_string();

        let recreated = self.cluster.create_container(&name, config).await?;
        if container.is_running() {
            // Start through the placing engine directly; the cluster-wide
            // lookup may not see the new container until that engine's next
            // refresh lands.
            match self.cluster.engine(&recreated.engine.id) {
                Some(engine) => {
                    if let Err(e) = engine.start_container(&recreated.id).await {
                        warn!(container = %name, "rescheduled container failed to start: {e}");
                    }
                }
                None => {
                    warn!(
                        container = %name,
                        engine = %recreated.engine.id,
                        "placing engine vanished before the rescheduled container started"
                    );
                }
            }
        }

        info!(
            container = %name,
            from = %container.engine.name,
            to = %recreated.engine.name,
            "container rescheduled"
        );

        let record = RescheduleRecord {
            swarm_id: container.swarm_id().map(str::to_string),
            name,
            from_engine: container.engine.id.clone(),
            to_engine: recreated.engine.id.clone(),
            old_id: container.id.clone(),
            new_id: recreated.id.clone(),
            time: chrono::Utc::now().timestamp(),
        };
        let key = record
            .swarm_id
            .clone()
            .unwrap_or_else(|| record.old_id.clone());
        if let Err(e) = self.store.put(&key, &record) {
            warn!(key, "failed to persist reschedule record: {e}");
        }
        Ok(())
    }
}

impl EventHandler for Watchdog {
    fn handle(&self, event: &Event) {
        if event.status != STATUS_ENGINE_DISCONNECT || event.from != CLUSTER_EVENT_SOURCE {
            return;
        }
        // Every field is an Arc; hand the spawned task its own handles.
        let watchdog = Self {
            cluster: Arc::clone(&self.cluster),
            store: Arc::clone(&self.store),
            gate: Arc::clone(&self.gate),
        };
        let engine_id = event.engine.id.clone();
        tokio::spawn(async move {
            watchdog.reschedule_engine(&engine_id).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::EngineClient;
    use crate::container::RESCHEDULE_POLICY_LABEL;
    use crate::engine::tests::{detail_with_shares, summary, MockClient};
    use crate::engine::{Engine, EngineOptions};
    use crate::types::ContainerSummary;
    use std::time::Duration;

    fn labeled_summary(id: &str, name: &str, policy: Option<&str>) -> ContainerSummary {
        let mut s = summary(id, name);
        if let Some(policy) = policy {
            s.labels
                .insert(RESCHEDULE_POLICY_LABEL.to_string(), policy.to_string());
        }
        s
    }

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
    async fn reschedules_only_always_containers() {
        let cluster = Arc::new(Cluster::new());
        let (dead_client, dead) = engine("ENG:dead", "dead-node").await;
        let (live_client, live) = engine("ENG:live", "live-node").await;

        dead_client.set_containers(vec![
            labeled_summary("c-always", "web", Some("always")),
            labeled_summary("c-never", "db", Some("never")),
            labeled_summary("c-default", "cache", None),
        ]);
        dead_client.set_detail("c-always", detail_with_shares("c-always", 0, 0));
        dead.refresh_containers(true).await.unwrap();

        cluster.add_engine(Arc::clone(&dead)).unwrap();
        cluster.add_engine(Arc::clone(&live)).unwrap();

        // Kill the dead engine so placement avoids it.
        dead_client.fail(true);
        dead.tick().await;
        assert!(!dead.is_healthy());

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let watchdog = Watchdog::new(Arc::clone(&cluster), Arc::clone(&store));

        watchdog.reschedule_engine("ENG:dead").await;

        // Exactly the one `always` container was recreated, on the live
        // engine, under its original name.
        let created = live_client.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].0, "web");
        assert!(dead_client.created.lock().unwrap().is_empty());

        // It was running before, so it was started again.
        assert_eq!(live_client.started.lock().unwrap().len(), 1);

        // The dead engine's mirror no longer lists it.
        assert!(dead.container("c-always").is_none());
        assert!(dead.container("c-never").is_some());

        // A reschedule record was persisted.
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ignores_remote_disconnect_lookalikes() {
        let cluster = Arc::new(Cluster::new());
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let watchdog = Watchdog::new(Arc::clone(&cluster), store);

        // A container event that merely shares the status string must not
        // trigger rescheduling.
        let event = Event {
            status: STATUS_ENGINE_DISCONNECT.to_string(),
            id: "c1".to_string(),
            from: "some-image".to_string(),
            time: 0,
            engine: crate::engine::EngineInfo::default(),
        };
        watchdog.handle(&event);
        // Nothing to await; the handler rejected the event synchronously.
    }

    #[tokio::test]
    async fn no_healthy_engine_leaves_containers_in_place() {
        let cluster = Arc::new(Cluster::new());
        let (dead_client, dead) = engine("ENG:dead", "dead-node").await;
        dead_client.set_containers(vec![labeled_summary("c-always", "web", Some("always"))]);
        dead.refresh_containers(true).await.unwrap();
        cluster.add_engine(Arc::clone(&dead)).unwrap();
        dead_client.fail(true);
        dead.tick().await;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let watchdog = Watchdog::new(Arc::clone(&cluster), Arc::clone(&store));

        watchdog.reschedule_engine("ENG:dead").await;

        // The create failed (no healthy engine); no record persisted, no
        // container created anywhere.
        assert!(store.list().unwrap().is_empty());
        assert!(dead_client.created.lock().unwrap().is_empty());
    }
}
