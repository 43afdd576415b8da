//! Kubernetes gateway: Akri instance projection and FlashJob apply.
//!
//! The gateway is built once at startup and may legitimately hold no client:
//! a cluster that is down degrades the instance endpoints to empty lists and
//! flips `/health` to degraded, it never crashes the backend.

use chrono::SecondsFormat;
use kube::api::{Api, ApiResource, DynamicObject, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::GroupVersionKind;
use kube::{Client, Config as KubeConfig};
use serde::Deserialize;
use tracing::{info, warn};

use flashboard_common::{AkriInstance, Config, Error, FlashJobManifest, Result};

const NAMESPACE: &str = "default";

/// Instance filter tuple; empty components match everything.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InstanceFilter {
    pub uuid: String,
    pub device_type: String,
    pub application_type: String,
    pub status: String,
    pub last_updated: String,
}

#[derive(Clone)]
pub struct ClusterGateway {
    client: Option<Client>,
}

impl ClusterGateway {
    /// Build the gateway. Never fatal: with no reachable cluster the gateway
    /// simply holds no client.
    pub async fn bootstrap(cfg: &Config) -> Self {
        match build_client(cfg).await {
            Ok(client) => {
                info!("kubernetes client initialized");
                Self {
                    client: Some(client),
                }
            }
            Err(e) => {
                warn!("kubernetes client unavailable: {e:#}");
                Self { client: None }
            }
        }
    }

    /// A gateway with no cluster connection.
    pub fn disconnected() -> Self {
        Self { client: None }
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// List `akri.sh/v0` instances in the default namespace and project them.
    ///
    /// Malformed items are skipped with a warning; only a failed upstream
    /// list call (or a missing client) is an error.
    pub async fn list_instances(&self) -> Result<Vec<AkriInstance>> {
        let client = self.client.clone().ok_or_else(|| {
            Error::Internal("kubernetes client not initialized".to_string())
        })?;

        let gvk = GroupVersionKind::gvk("akri.sh", "v0", "Instance");
        let ar = ApiResource::from_gvk_with_plural(&gvk, "instances");
        let api: Api<DynamicObject> = Api::namespaced_with(client, NAMESPACE, &ar);
        let list = api.list(&ListParams::default()).await?;

        let mut instances = Vec::new();
        for item in &list.items {
            match project_instance(item) {
                Ok(inst) => instances.push(inst),
                Err(reason) => {
                    let name = item.metadata.name.as_deref().unwrap_or("<unnamed>");
                    warn!("skipping instance {name}: {reason}");
                }
            }
        }
        info!("retrieved {} akri instances", instances.len());
        Ok(instances)
    }

    /// Submit the FlashJob with create-or-update semantics: try `create`, and
    /// on any failure adopt the live object's resourceVersion and `replace`.
    /// Not atomic between the two calls; the manifest is declarative and
    /// keyed by name, so the last writer wins.
    pub async fn apply_flashjob(&self, manifest: &FlashJobManifest) -> Result<()> {
        let client = self.client.clone().ok_or_else(|| {
            Error::Internal("kubernetes client not initialized".to_string())
        })?;

        let gvk = GroupVersionKind::gvk("application.flashjob.nbfc.io", "v1alpha1", "FlashJob");
        let ar = ApiResource::from_gvk_with_plural(&gvk, "flashjobs");
        let api: Api<DynamicObject> = Api::namespaced_with(client, NAMESPACE, &ar);

        let name = manifest.metadata.name.clone();
        let mut obj: DynamicObject = serde_json::from_value(serde_json::to_value(manifest)?)?;

        match api.create(&PostParams::default(), &obj).await {
            Ok(_) => {}
            Err(create_err) => {
                warn!("failed to create flashjob {name}: {create_err}; trying update");
                let existing = api.get(&name).await?;
                obj.metadata.resource_version = existing.metadata.resource_version;
                api.replace(&name, &PostParams::default(), &obj).await?;
            }
        }

        info!(
            "created/updated flashjob {name} for uuids: {}",
            manifest.spec.uuid.join(", ")
        );
        Ok(())
    }
}

async fn build_client(cfg: &Config) -> anyhow::Result<Client> {
    let path = &cfg.kube_config_path;
    if path.is_file() {
        info!("loading kubeconfig from {}", path.display());
        match client_from_kubeconfig(cfg).await {
            Ok(client) => return Ok(client),
            Err(e) => warn!("error loading kubeconfig: {e:#}"),
        }
    } else {
        warn!("kubeconfig not available at {}", path.display());
    }

    info!("falling back to in-cluster config");
    let config = KubeConfig::incluster()?;
    Ok(Client::try_from(config)?)
}

async fn client_from_kubeconfig(cfg: &Config) -> anyhow::Result<Client> {
    let mut kubeconfig = Kubeconfig::read_from(&cfg.kube_config_path)?;

    if let Ok(server) = std::env::var("KUBERNETES_API_SERVER") {
        let server = server.trim();
        if !server.is_empty() {
            for named in &mut kubeconfig.clusters {
                if let Some(cluster) = named.cluster.as_mut() {
                    cluster.server = Some(server.to_string());
                }
            }
            info!("overriding kubernetes api server to: {server}");
        }
    }

    let mut config =
        KubeConfig::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;

    let insecure = std::env::var("KUBERNETES_INSECURE")
        .ok()
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(false);
    if insecure {
        info!("skipping TLS verification for kubernetes api");
        config.accept_invalid_certs = true;
        config.root_cert = None;
    }

    Ok(Client::try_from(config)?)
}

/// Project a single untyped Akri instance. Any missing or mis-shaped field
/// rejects the item with a reason.
fn project_instance(item: &DynamicObject) -> std::result::Result<AkriInstance, String> {
    let uuid = item
        .metadata
        .uid
        .clone()
        .ok_or("metadata.uid is missing")?;
    let last_updated = item
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|t| t.0.to_rfc3339_opts(SecondsFormat::Secs, true))
        .ok_or("metadata.creationTimestamp is missing")?;

    let props = item
        .data
        .get("spec")
        .and_then(|s| s.get("brokerProperties"))
        .and_then(|p| p.as_object())
        .ok_or("spec.brokerProperties is not a map")?;
    let device_type = props
        .get("DEVICE")
        .and_then(|v| v.as_str())
        .ok_or("DEVICE is not a string")?
        .to_string();
    let application_type = props
        .get("APPLICATION_TYPE")
        .and_then(|v| v.as_str())
        .ok_or("APPLICATION_TYPE is not a string")?
        .to_string();

    Ok(AkriInstance {
        uuid,
        device_type,
        application_type,
        status: "active".to_string(),
        last_updated,
    })
}

/// AND of the per-field predicates. `uuid` matches exactly; the type and
/// status fields match case-insensitively; `last_updated` compares the
/// date prefix (first 10 characters) of the instance timestamp.
pub fn filter_instances(instances: Vec<AkriInstance>, filter: &InstanceFilter) -> Vec<AkriInstance> {
    let filtered: Vec<AkriInstance> = instances
        .into_iter()
        .filter(|item| instance_matches(item, filter))
        .collect();
    info!("filtered down to {} instances", filtered.len());
    filtered
}

fn instance_matches(item: &AkriInstance, f: &InstanceFilter) -> bool {
    if !f.uuid.is_empty() && f.uuid != item.uuid {
        return false;
    }
    if !f.device_type.is_empty() && !f.device_type.eq_ignore_ascii_case(&item.device_type) {
        return false;
    }
    if !f.application_type.is_empty()
        && !f.application_type.eq_ignore_ascii_case(&item.application_type)
    {
        return false;
    }
    if !f.status.is_empty() && !f.status.eq_ignore_ascii_case(&item.status) {
        return false;
    }
    if !f.last_updated.is_empty() {
        let date = item.last_updated.get(..10);
        if date != Some(f.last_updated.as_str()) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dynamic(value: serde_json::Value) -> DynamicObject {
        serde_json::from_value(value).unwrap()
    }

    fn sample(uuid: &str, device: &str, app: &str, ts: &str) -> AkriInstance {
        AkriInstance {
            uuid: uuid.to_string(),
            device_type: device.to_string(),
            application_type: app.to_string(),
            status: "active".to_string(),
            last_updated: ts.to_string(),
        }
    }

    #[test]
    fn test_project_well_formed_item() {
        let item = dynamic(json!({
            "apiVersion": "akri.sh/v0",
            "kind": "Instance",
            "metadata": {
                "name": "akri-esp32-0",
                "uid": "abcdef01-2345",
                "creationTimestamp": "2024-05-05T12:00:00Z"
            },
            "spec": {
                "brokerProperties": {
                    "DEVICE": "ESP32",
                    "APPLICATION_TYPE": "thermostat"
                }
            }
        }));
        let inst = project_instance(&item).unwrap();
        assert_eq!(inst.uuid, "abcdef01-2345");
        assert_eq!(inst.device_type, "ESP32");
        assert_eq!(inst.application_type, "thermostat");
        assert_eq!(inst.status, "active");
        assert_eq!(inst.last_updated, "2024-05-05T12:00:00Z");
    }

    #[test]
    fn test_project_rejects_malformed_items() {
        // No brokerProperties
        let item = dynamic(json!({
            "apiVersion": "akri.sh/v0",
            "kind": "Instance",
            "metadata": {
                "name": "bad-1",
                "uid": "u",
                "creationTimestamp": "2024-05-05T12:00:00Z"
            },
            "spec": {}
        }));
        assert!(project_instance(&item).is_err());

        // DEVICE of the wrong shape
        let item = dynamic(json!({
            "apiVersion": "akri.sh/v0",
            "kind": "Instance",
            "metadata": {
                "name": "bad-2",
                "uid": "u",
                "creationTimestamp": "2024-05-05T12:00:00Z"
            },
            "spec": {
                "brokerProperties": { "DEVICE": 42, "APPLICATION_TYPE": "x" }
            }
        }));
        assert!(project_instance(&item).is_err());

        // Missing uid
        let item = dynamic(json!({
            "apiVersion": "akri.sh/v0",
            "kind": "Instance",
            "metadata": {
                "name": "bad-3",
                "creationTimestamp": "2024-05-05T12:00:00Z"
            },
            "spec": {
                "brokerProperties": { "DEVICE": "ESP32", "APPLICATION_TYPE": "x" }
            }
        }));
        assert!(project_instance(&item).is_err());
    }

    #[test]
    fn test_filter_device_type_case_insensitive() {
        let instances = vec![
            sample("u1", "ESP32", "thermo", "2024-05-05T12:00:00Z"),
            sample("u2", "RPI", "camera", "2024-05-05T12:00:00Z"),
        ];
        let filter = InstanceFilter {
            device_type: "esp32".to_string(),
            ..Default::default()
        };
        let out = filter_instances(instances, &filter);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].uuid, "u1");
    }

    #[test]
    fn test_filter_empty_matches_everything() {
        let instances = vec![
            sample("u1", "ESP32", "thermo", "2024-05-05T12:00:00Z"),
            sample("u2", "RPI", "camera", "2024-05-06T12:00:00Z"),
        ];
        let out = filter_instances(instances, &InstanceFilter::default());
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_filter_uuid_is_exact_and_case_sensitive() {
        let instances = vec![sample("U1", "ESP32", "thermo", "2024-05-05T12:00:00Z")];
        let miss = InstanceFilter {
            uuid: "u1".to_string(),
            ..Default::default()
        };
        assert!(filter_instances(instances.clone(), &miss).is_empty());
        let hit = InstanceFilter {
            uuid: "U1".to_string(),
            ..Default::default()
        };
        assert_eq!(filter_instances(instances, &hit).len(), 1);
    }

    #[test]
    fn test_filter_last_updated_date_prefix() {
        let instances = vec![
            sample("u1", "ESP32", "thermo", "2024-05-05T12:00:00Z"),
            sample("u2", "ESP32", "thermo", "2024-05-06T08:30:00Z"),
            sample("u3", "ESP32", "thermo", "short"),
        ];
        let filter = InstanceFilter {
            last_updated: "2024-05-05".to_string(),
            ..Default::default()
        };
        let out = filter_instances(instances, &filter);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].uuid, "u1");
    }

    #[test]
    fn test_filter_is_conjunction() {
        let instances = vec![
            sample("u1", "ESP32", "thermo", "2024-05-05T12:00:00Z"),
            sample("u2", "ESP32", "camera", "2024-05-05T12:00:00Z"),
        ];
        let filter = InstanceFilter {
            device_type: "esp32".to_string(),
            application_type: "CAMERA".to_string(),
            ..Default::default()
        };
        let out = filter_instances(instances, &filter);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].uuid, "u2");
    }

    #[tokio::test]
    async fn test_disconnected_gateway_degrades() {
        let gw = ClusterGateway::disconnected();
        assert!(!gw.is_connected());
        assert!(gw.list_instances().await.is_err());

        let manifest = FlashJobManifest::new(
            vec!["abcdef0123456789".to_string()],
            "fw.bin".to_string(),
            "img:latest".to_string(),
        );
        assert!(gw.apply_flashjob(&manifest).await.is_err());
    }

    #[test]
    fn test_filter_request_wire_names() {
        let f: InstanceFilter = serde_json::from_value(json!({
            "deviceType": "ESP32",
            "lastUpdated": "2024-05-05"
        }))
        .unwrap();
        assert_eq!(f.device_type, "ESP32");
        assert_eq!(f.last_updated, "2024-05-05");
        assert!(f.uuid.is_empty());
    }
}
