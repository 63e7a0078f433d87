//! Volume model and cluster-global merging.

use crate::engine::EngineInfo;
use crate::types::VolumeResource;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A volume mirrored from one engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    /// Volume name (the volume's identity; engines don't assign IDs).
    pub name: String,
    /// Driver name.
    pub driver: String,
    /// Mountpoint on the reporting engine.
    pub mountpoint: String,
    /// Labels.
    pub labels: HashMap<String, String>,
    /// Driver options.
    pub options: HashMap<String, String>,
    /// Scope (`local` or `global`).
    pub scope: String,
    /// The engine that reported this view.
    pub engine: EngineInfo,
}

impl Volume {
    /// Builds a volume from a listing entry.
    #[must_use]
    pub fn from_resource(res: VolumeResource, engine: EngineInfo) -> Self {
        Self {
            name: res.name,
            driver: res.driver,
            mountpoint: res.mountpoint,
            labels: res.labels,
            options: res.options,
            scope: res.scope,
            engine,
        }
    }

    /// Whether `term` refers to this volume: name or `engineName/name`.
    #[must_use]
    pub fn matches(&self, term: &str) -> bool {
        self.name == term || format!("{}/{}", self.engine.name, self.name) == term
    }
}

/// Merges per-engine volume views.
///
/// Global volumes (shared storage drivers) appear on every engine under the
/// same name; one entry survives per `(name, driver)` pair. Local volumes
/// that merely share a name across engines stay separate entries only when
/// their drivers differ, matching how a single engine would present them.
#[must_use]
pub fn uniq(volumes: Vec<Volume>) -> Vec<Volume> {
    let mut merged: Vec<Volume> = Vec::new();
    let mut seen: HashMap<(String, String), ()> = HashMap::new();

    for volume in volumes {
        let key = (volume.name.clone(), volume.driver.clone());
        if seen.insert(key, ()).is_none() {
            merged.push(volume);
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

    fn volume(name: &str, driver: &str, eng: &str) -> Volume {
        Volume {
            name: name.to_string(),
            driver: driver.to_string(),
            mountpoint: format!("/var/lib/docker/volumes/{name}"),
            labels: HashMap::new(),
            options: HashMap::new(),
            scope: "local".to_string(),
            engine: engine(eng),
        }
    }

    #[test]
    fn uniq_collapses_shared_volumes() {
        let merged = uniq(vec![
            volume("data", "nfs", "a"),
            volume("data", "nfs", "b"),
            volume("scratch", "local", "a"),
        ]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn qualified_name_matching() {
        let v = volume("data", "local", "engineA");
        assert!(v.matches("data"));
        assert!(v.matches("engineA/data"));
        assert!(!v.matches("engineB/data"));
    }
}
