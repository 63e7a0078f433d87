//! Container model and cluster-wide fuzzy lookup.

use crate::engine::EngineInfo;
use crate::types::{ContainerConfig, ContainerSummary};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Reserved label namespace for cluster-internal annotations persisted in
/// container config.
pub const SWARM_LABEL_NAMESPACE: &str = "com.docker.swarm";

/// Label carrying the cluster-internal Swarm ID.
pub const SWARM_ID_LABEL: &str = "com.docker.swarm.id";
/// Label carrying placement affinity expressions (JSON array of strings).
pub const AFFINITIES_LABEL: &str = "com.docker.swarm.affinities";
/// Label carrying placement constraint expressions (JSON array of strings).
pub const CONSTRAINTS_LABEL: &str = "com.docker.swarm.constraints";
/// Label carrying the reschedule policy (`always` or `never`).
pub const RESCHEDULE_POLICY_LABEL: &str = "com.docker.swarm.reschedule-policy";

/// What the watchdog should do with a container when its engine dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReschedulePolicy {
    /// Recreate the container on another engine.
    Always,
    /// Leave the container for manual intervention (default).
    Never,
}

/// A container mirrored from one engine.
///
/// Replaced wholesale on every refresh cycle of its owning engine. The
/// container ID is globally unique cluster-wide (guaranteed by the remote
/// engines); the human name is unique only per engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    /// Engine-assigned container ID.
    pub id: String,
    /// Names as listed by the engine (leading `/` included).
    pub names: Vec<String>,
    /// Image reference.
    pub image: String,
    /// Image ID.
    pub image_id: String,
    /// Command line.
    pub command: String,
    /// Creation time, Unix seconds.
    pub created: i64,
    /// Coarse state (`running`, `exited`, ...).
    pub state: String,
    /// Human status string.
    pub status: String,
    /// Labels, including the reserved cluster annotations.
    pub labels: HashMap<String, String>,
    /// Inspected config envelope; present after a full refresh. CPU shares
    /// inside are normalized to the owning engine's CPU count.
    pub config: Option<ContainerConfig>,
    /// The engine this container lives on.
    pub engine: EngineInfo,
}

impl Container {
    /// Builds a container from a listing entry.
    #[must_use]
    pub fn from_summary(summary: ContainerSummary, engine: EngineInfo) -> Self {
        Self {
            id: summary.id,
            names: summary.names,
            image: summary.image,
            image_id: summary.image_id,
            command: summary.command,
            created: summary.created,
            state: summary.state,
            status: summary.status,
            labels: summary.labels,
            config: None,
            engine,
        }
    }

    /// Primary name without the leading slash, or the ID when unnamed.
    #[must_use]
    pub fn name(&self) -> &str {
        self.names
            .first()
            .map_or(self.id.as_str(), |n| n.trim_start_matches('/'))
    }

    /// The cluster-internal Swarm ID label, if present.
    #[must_use]
    pub fn swarm_id(&self) -> Option<&str> {
        self.labels.get(SWARM_ID_LABEL).map(String::as_str)
    }

    /// The reschedule policy label; unset means [`ReschedulePolicy::Never`].
    #[must_use]
    pub fn reschedule_policy(&self) -> ReschedulePolicy {
        match self.labels.get(RESCHEDULE_POLICY_LABEL).map(String::as_str) {
            Some("always") => ReschedulePolicy::Always,
            _ => ReschedulePolicy::Never,
        }
    }

    /// Decoded affinity expressions from the reserved label.
    #[must_use]
    pub fn affinities(&self) -> Vec<String> {
        decode_expression_label(&self.labels, AFFINITIES_LABEL)
    }

    /// Decoded constraint expressions from the reserved label.
    #[must_use]
    pub fn constraints(&self) -> Vec<String> {
        decode_expression_label(&self.labels, CONSTRAINTS_LABEL)
    }

    /// Whether the engine last reported this container running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }

    /// Normalized CPU usage (engine CPUs' worth of shares).
    #[must_use]
    pub fn used_cpus(&self) -> i64 {
        self.config
            .as_ref()
            .and_then(|c| c.host_config.as_ref())
            .map_or(0, |hc| hc.cpu_shares)
    }

    /// Configured memory limit in bytes.
    #[must_use]
    pub fn used_memory(&self) -> i64 {
        self.config
            .as_ref()
            .and_then(|c| c.host_config.as_ref())
            .map_or(0, |hc| hc.memory)
    }
}

/// Expression labels are JSON arrays of strings (`["region==eu","..."]`).
fn decode_expression_label(labels: &HashMap<String, String>, key: &str) -> Vec<String> {
    labels
        .get(key)
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default()
}

/// A flattened cluster-wide container listing with uniform lookup.
#[derive(Debug, Clone, Default)]
pub struct Containers(pub Vec<Container>);

impl Containers {
    /// Resolves a container by ID, Swarm ID, name, or unambiguous prefix.
    ///
    /// Precedence: exact full ID, exact Swarm ID, exact name (`name`,
    /// `/name`, `engineName/name`, `engineID/name`), ID prefix, Swarm-ID
    /// prefix. A stage yielding more than one candidate means the lookup is
    /// ambiguous and resolves to nothing rather than guessing.
    #[must_use]
    pub fn get(&self, term: &str) -> Option<&Container> {
        if term.is_empty() {
            return None;
        }

        // Exact ID.
        if let Some(c) = self.0.iter().find(|c| c.id == term) {
            return Some(c);
        }

        // Exact Swarm ID.
        if let Some(c) = self.0.iter().find(|c| c.swarm_id() == Some(term)) {
            return Some(c);
        }

        // Exact name, including engine-qualified forms.
        let by_name: Vec<&Container> = self
            .0
            .iter()
            .filter(|c| {
                c.names.iter().any(|listed| {
                    let name = listed.trim_start_matches('/');
                    listed == term
                        || name == term
                        || format!("{}/{name}", c.engine.name) == term
                        || format!("{}/{name}", c.engine.id) == term
                })
            })
            .collect();
        match by_name.len() {
            1 => return Some(by_name[0]),
            n if n > 1 => return None,
            _ => {}
        }

        // ID prefix.
        let by_id_prefix: Vec<&Container> =
            self.0.iter().filter(|c| c.id.starts_with(term)).collect();
        match by_id_prefix.len() {
            1 => return Some(by_id_prefix[0]),
            n if n > 1 => return None,
            _ => {}
        }

        // Swarm-ID prefix.
        let by_swarm_prefix: Vec<&Container> = self
            .0
            .iter()
            .filter(|c| c.swarm_id().is_some_and(|s| s.starts_with(term)))
            .collect();
        match by_swarm_prefix.len() {
            1 => Some(by_swarm_prefix[0]),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(id: &str, name: &str) -> EngineInfo {
        EngineInfo {
            id: id.to_string(),
            name: name.to_string(),
            addr: format!("{name}:2375"),
        }
    }

    fn container(id: &str, name: &str, eng: EngineInfo) -> Container {
        Container {
            id: id.to_string(),
            names: vec![format!("/{name}")],
            image: "busybox".to_string(),
            image_id: "sha256:0000".to_string(),
            command: "sh".to_string(),
            created: 0,
            state: "running".to_string(),
            status: "Up 2 minutes".to_string(),
            labels: HashMap::new(),
            config: None,
            engine: eng,
        }
    }

    #[test]
    fn exact_id_wins() {
        let list = Containers(vec![
            container("container1-id", "foo", engine("e1", "engineA")),
            container("container2-id", "bar", engine("e2", "engineB")),
        ]);
        assert_eq!(list.get("container1-id").unwrap().name(), "foo");
    }

    #[test]
    fn unqualified_duplicate_name_is_ambiguous() {
        let list = Containers(vec![
            container("container1-id", "foo", engine("e1", "engineA")),
            container("container2-id", "foo", engine("e2", "engineB")),
        ]);
        assert!(list.get("foo").is_none());
        assert_eq!(list.get("engineA/foo").unwrap().id, "container1-id");
        assert_eq!(list.get("e2/foo").unwrap().id, "container2-id");
    }

    #[test]
    fn id_prefix_must_be_unique() {
        let list = Containers(vec![
            container("container1-id", "foo", engine("e1", "engineA")),
            container("co-other", "bar", engine("e2", "engineB")),
        ]);
        // Shared 2-char prefix matches both entries: ambiguous.
        assert!(list.get("co").is_none());
        assert_eq!(list.get("container1-").unwrap().name(), "foo");
    }

    #[test]
    fn swarm_id_label_lookup() {
        let mut c = container("abc123", "web", engine("e1", "engineA"));
        c.labels
            .insert(SWARM_ID_LABEL.to_string(), "swarm-uuid-1".to_string());
        let list = Containers(vec![c]);
        assert_eq!(list.get("swarm-uuid-1").unwrap().id, "abc123");
        assert_eq!(list.get("swarm-uu").unwrap().id, "abc123");
    }

    #[test]
    fn reschedule_policy_defaults_to_never() {
        let mut c = container("abc", "web", engine("e1", "engineA"));
        assert_eq!(c.reschedule_policy(), ReschedulePolicy::Never);
        c.labels
            .insert(RESCHEDULE_POLICY_LABEL.to_string(), "always".to_string());
        assert_eq!(c.reschedule_policy(), ReschedulePolicy::Always);
    }

    #[test]
    fn expression_labels_decode_json_arrays() {
        let mut c = container("abc", "web", engine("e1", "engineA"));
        c.labels.insert(
            CONSTRAINTS_LABEL.to_string(),
            r#"["region==eu","storage==ssd"]"#.to_string(),
        );
        assert_eq!(c.constraints(), vec!["region==eu", "storage==ssd"]);
        assert!(c.affinities().is_empty());
    }
}
