//! Wire types for the Docker-compatible remote engine API.
//!
//! Serde mirrors of the Docker Engine API structures the cluster consumes
//! and re-serves. Only the fields the cluster reads are modeled; unknown
//! fields are ignored on input and omitted on output.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Engine
// ============================================================================

/// `GET /info` response subset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EngineInfoDto {
    /// Engine ID. Empty on daemons too old to report one; such engines are
    /// rejected at connect time.
    #[serde(rename = "ID")]
    pub id: String,
    /// Engine (host) name.
    pub name: String,
    /// Number of CPUs.
    #[serde(rename = "NCPU")]
    pub ncpu: i64,
    /// Total memory in bytes.
    pub mem_total: i64,
    /// Engine labels as `key=value` strings.
    pub labels: Option<Vec<String>>,
}

// ============================================================================
// Containers
// ============================================================================

/// One entry of `GET /containers/json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub image: String,
    #[serde(rename = "ImageID")]
    pub image_id: String,
    pub command: String,
    pub created: i64,
    pub state: String,
    pub status: String,
    pub labels: HashMap<String, String>,
    pub ports: Vec<PortSummary>,
}

/// Port mapping inside a container summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PortSummary {
    pub private_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_port: Option<u16>,
    #[serde(rename = "Type")]
    pub port_type: String,
    #[serde(rename = "IP", skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

/// `GET /containers/{id}/json` response subset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerDetail {
    pub id: String,
    pub name: String,
    pub created: String,
    pub state: ContainerStateDetail,
    pub config: ContainerConfig,
    pub host_config: HostConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_settings: Option<serde_json::Value>,
}

/// Inspected container runtime state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerStateDetail {
    pub running: bool,
    pub paused: bool,
    pub restarting: bool,
    pub exit_code: i64,
    pub started_at: String,
    pub finished_at: String,
}

/// Container configuration envelope (create request body and inspect
/// `Config` section).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerConfig {
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    pub labels: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_config: Option<HostConfig>,
}

/// Resource limits subset of the host config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct HostConfig {
    pub cpu_shares: i64,
    pub memory: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binds: Option<Vec<String>>,
}

/// `POST /containers/create` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CreateContainerResponse {
    pub id: String,
    pub warnings: Vec<String>,
}

// ============================================================================
// Images
// ============================================================================

/// One entry of `GET /images/json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ImageSummary {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub created: i64,
    pub size: i64,
    pub labels: HashMap<String, String>,
}

// ============================================================================
// Networks
// ============================================================================

/// One entry of `GET /networks`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NetworkResource {
    pub id: String,
    pub name: String,
    pub driver: String,
    pub scope: String,
    pub options: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    /// Containers attached on the reporting engine, keyed by container ID.
    pub containers: HashMap<String, NetworkContainer>,
}

/// Per-container endpoint info inside a network resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NetworkContainer {
    pub name: String,
    #[serde(rename = "EndpointID")]
    pub endpoint_id: String,
    #[serde(rename = "IPv4Address")]
    pub ipv4_address: String,
}

/// `POST /networks/create` request body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NetworkCreateRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    pub options: HashMap<String, String>,
    pub labels: HashMap<String, String>,
}

/// `POST /networks/create` response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NetworkCreateResponse {
    pub id: String,
    pub warning: String,
}

// ============================================================================
// Volumes
// ============================================================================

/// One volume as reported by `GET /volumes`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct VolumeResource {
    pub name: String,
    pub driver: String,
    pub mountpoint: String,
    pub labels: HashMap<String, String>,
    pub options: HashMap<String, String>,
    pub scope: String,
}

/// `GET /volumes` response envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct VolumeListResponse {
    pub volumes: Vec<VolumeResource>,
    pub warnings: Vec<String>,
}

/// `POST /volumes/create` request body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct VolumeCreateRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    pub driver_opts: HashMap<String, String>,
    pub labels: HashMap<String, String>,
}

// ============================================================================
// Events
// ============================================================================

/// One event from the engine's `GET /events` stream (legacy JSON-line
/// format: `status`, `id`, `from`, `time`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineEvent {
    pub status: String,
    pub id: String,
    pub from: String,
    pub time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_parses_pascal_case_fields() {
        let json = r#"{"ID":"ENG:1","Name":"node-1","NCPU":8,"MemTotal":4096,"Labels":["region=eu"],"OperatingSystem":"linux"}"#;
        let info: EngineInfoDto = serde_json::from_str(json).unwrap();
        assert_eq!(info.id, "ENG:1");
        assert_eq!(info.ncpu, 8);
        assert_eq!(info.mem_total, 4096);
        assert_eq!(info.labels.unwrap(), vec!["region=eu".to_string()]);
    }

    #[test]
    fn container_summary_tolerates_missing_fields() {
        let json = r#"{"Id":"abc","Names":["/web"],"Image":"nginx"}"#;
        let c: ContainerSummary = serde_json::from_str(json).unwrap();
        assert_eq!(c.id, "abc");
        assert_eq!(c.names, vec!["/web".to_string()]);
        assert!(c.labels.is_empty());
    }

    #[test]
    fn engine_event_is_lowercase() {
        let json = r#"{"status":"start","id":"abc","from":"nginx","time":1700000000}"#;
        let e: EngineEvent = serde_json::from_str(json).unwrap();
        assert_eq!(e.status, "start");
        assert_eq!(e.from, "nginx");
    }

    #[test]
    fn config_roundtrip_keeps_host_config() {
        let mut config = ContainerConfig {
            image: "redis".to_string(),
            ..Default::default()
        };
        config.host_config = Some(HostConfig {
            cpu_shares: 512,
            memory: 1 << 30,
            binds: None,
        });
        let json = serde_json::to_string(&config).unwrap();
        let back: ContainerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.host_config.unwrap().cpu_shares, 512);
    }
}
