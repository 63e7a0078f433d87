//! Network model and cluster-global merging.

use crate::engine::EngineInfo;
use crate::types::{NetworkContainer, NetworkResource};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A network mirrored from one engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    /// Engine-assigned network ID. Cluster-global networks (overlay) share
    /// one ID across engines.
    pub id: String,
    /// Network name.
    pub name: String,
    /// Driver name.
    pub driver: String,
    /// Scope (`local`, `global`, `swarm`).
    pub scope: String,
    /// Driver options.
    pub options: HashMap<String, String>,
    /// Labels.
    pub labels: HashMap<String, String>,
    /// Attached containers, keyed by container ID. After [`uniq`] this is
    /// the union across engines.
    pub containers: HashMap<String, NetworkContainer>,
    /// The engine that reported this view.
    pub engine: EngineInfo,
}

impl Network {
    /// Builds a network from a listing entry.
    #[must_use]
    pub fn from_resource(res: NetworkResource, engine: EngineInfo) -> Self {
        Self {
            id: res.id,
            name: res.name,
            driver: res.driver,
            scope: res.scope,
            options: res.options,
            labels: res.labels,
            containers: res.containers,
            engine,
        }
    }

    /// Whether `term` refers to this network: ID, name, or
    /// `engineName/name`.
    #[must_use]
    pub fn matches(&self, term: &str) -> bool {
        self.id == term
            || self.name == term
            || format!("{}/{}", self.engine.name, self.name) == term
    }
}

/// Merges per-engine network views by ID.
///
/// A cluster-global network (e.g. overlay) is visible from every engine
/// under the same ID; its per-host container/endpoint maps are unioned.
/// Scalar fields keep the first engine's values.
#[must_use]
pub fn uniq(networks: Vec<Network>) -> Vec<Network> {
    let mut merged: Vec<Network> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for network in networks {
        match index.get(&network.id) {
            Some(&i) => {
                let existing = &mut merged[i];
                for (cid, endpoint) in network.containers {
                    existing.containers.entry(cid).or_insert(endpoint);
                }
            }
            None => {
                index.insert(network.id.clone(), merged.len());
                merged.push(network);
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(name: &str) -> EngineInfo {
        EngineInfo {
            id: format!("{name}-id"),
            name: name.to_string(),
            addr: format!("{name}:2375"),
        }
    }

    fn overlay(id: &str, eng: &str, container: &str) -> Network {
        let mut containers = HashMap::new();
        containers.insert(
            container.to_string(),
            NetworkContainer {
                name: format!("c-{container}"),
                endpoint_id: format!("ep-{container}"),
                ipv4_address: "10.0.0.2/24".to_string(),
            },
        );
        Network {
            id: id.to_string(),
            name: "overlay-net".to_string(),
            driver: "overlay".to_string(),
            scope: "global".to_string(),
            options: HashMap::new(),
            labels: HashMap::new(),
            containers,
            engine: engine(eng),
        }
    }

    #[test]
    fn uniq_merges_same_id_across_engines() {
        let merged = uniq(vec![overlay("net1", "a", "c1"), overlay("net1", "b", "c2")]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].containers.len(), 2);
        assert_eq!(merged[0].engine.name, "a");
    }

    #[test]
    fn uniq_keeps_distinct_ids_apart() {
        let merged = uniq(vec![overlay("net1", "a", "c1"), overlay("net2", "b", "c2")]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn qualified_name_matching() {
        let net = overlay("net1", "engineA", "c1");
        assert!(net.matches("net1"));
        assert!(net.matches("overlay-net"));
        assert!(net.matches("engineA/overlay-net"));
        assert!(!net.matches("engineB/overlay-net"));
    }
}
