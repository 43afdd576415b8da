//! Wire types shared between the HTTP surface and the services.

use serde::{Deserialize, Serialize};

/// Default pod image used when a rollout request leaves the field blank.
pub const DEFAULT_FLASHJOB_POD_IMAGE: &str = "harbor.nbfc.io/nubificus/iot_esp32-flashjob:local";

/// Operator credential record, persisted under `user:<username>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
}

/// Projection of an Akri instance custom resource.
///
/// Derived on every list request; it has no owned lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AkriInstance {
    pub uuid: String,
    pub device_type: String,
    pub application_type: String,
    pub status: String,
    pub last_updated: String,
}

/// Operator-visible audit entry, kept newest-first under the `logs` key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: i64,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Declarative FlashJob document submitted to the cluster and written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashJobManifest {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: FlashJobMetadata,
    pub spec: FlashJobSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashJobMetadata {
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlashJobSpec {
    pub application_type: Option<String>,
    pub device: Option<String>,
    #[serde(rename = "externalIP")]
    pub external_ip: Option<String>,
    pub firmware: String,
    pub flashjob_pod_image: String,
    pub host_endpoint: Option<String>,
    pub uuid: Vec<String>,
    pub version: String,
}

impl FlashJobManifest {
    /// Build the manifest for a set of device UUIDs. The name is derived from
    /// the first 8 characters of the first UUID.
    pub fn new(uuids: Vec<String>, firmware: String, pod_image: String) -> Self {
        let name = format!("flashjob-{}", uuid_prefix(&uuids[0]));
        Self {
            api_version: "application.flashjob.nbfc.io/v1alpha1".to_string(),
            kind: "FlashJob".to_string(),
            metadata: FlashJobMetadata {
                name,
                namespace: "default".to_string(),
            },
            spec: FlashJobSpec {
                application_type: None,
                device: None,
                external_ip: None,
                firmware,
                flashjob_pod_image: pod_image,
                host_endpoint: None,
                uuid: uuids,
                version: "0.2.0".to_string(),
            },
        }
    }
}

/// First 8 characters of a UUID, used for manifest names and file paths.
pub fn uuid_prefix(uuid: &str) -> String {
    uuid.chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_name_from_first_uuid() {
        let m = FlashJobManifest::new(
            vec!["abcdef0123456789".to_string(), "ffff".to_string()],
            "fw.bin".to_string(),
            DEFAULT_FLASHJOB_POD_IMAGE.to_string(),
        );
        assert_eq!(m.metadata.name, "flashjob-abcdef01");
        assert_eq!(m.metadata.namespace, "default");
        assert_eq!(m.spec.version, "0.2.0");
        assert_eq!(m.spec.uuid.len(), 2);
    }

    #[test]
    fn test_manifest_yaml_shape() {
        let m = FlashJobManifest::new(
            vec!["abcdef0123456789".to_string()],
            "fw.bin".to_string(),
            "img:latest".to_string(),
        );
        let yaml = serde_yaml::to_string(&m).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(
            doc["apiVersion"].as_str(),
            Some("application.flashjob.nbfc.io/v1alpha1")
        );
        assert_eq!(doc["kind"].as_str(), Some("FlashJob"));
        assert!(doc["spec"]["applicationType"].is_null());
        assert!(doc["spec"]["device"].is_null());
        assert!(doc["spec"]["externalIP"].is_null());
        assert!(doc["spec"]["hostEndpoint"].is_null());
        assert_eq!(doc["spec"]["firmware"].as_str(), Some("fw.bin"));
        assert_eq!(doc["spec"]["flashjobPodImage"].as_str(), Some("img:latest"));
    }

    #[test]
    fn test_log_entry_type_field() {
        let entry = LogEntry {
            timestamp: 1700000000,
            message: "hello".to_string(),
            kind: "info".to_string(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"].as_str(), Some("info"));
    }

    #[test]
    fn test_instance_wire_names() {
        let inst = AkriInstance {
            uuid: "u1".to_string(),
            device_type: "ESP32".to_string(),
            application_type: "thermo".to_string(),
            status: "active".to_string(),
            last_updated: "2024-01-01T00:00:00Z".to_string(),
        };
        let json = serde_json::to_value(&inst).unwrap();
        assert_eq!(json["deviceType"].as_str(), Some("ESP32"));
        assert_eq!(json["applicationType"].as_str(), Some("thermo"));
        assert_eq!(json["lastUpdated"].as_str(), Some("2024-01-01T00:00:00Z"));
    }
}
