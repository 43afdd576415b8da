//! Rollout core: validate the request, synthesize the FlashJob manifest,
//! persist the YAML artifact, apply it to the cluster, and leave an audit
//! trail.
//!
//! Failure at any step stops the pipeline without rolling back earlier side
//! effects: a written artifact stays on disk even when the apply fails.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use flashboard_common::{Error, FlashJobManifest, LogEntry, Result, DEFAULT_FLASHJOB_POD_IMAGE};

use crate::cache::Cache;
use crate::cluster::ClusterGateway;

/// Where per-rollout YAML artifacts live. Never cleaned up; each file is an
/// audit artifact, not managed state.
pub const FLASHJOB_DIR: &str = "/app/flashjobs";

/// Audit log cache key.
pub const AUDIT_LOG_KEY: &str = "logs";

/// Retention for the audit log, reset on every append.
pub const AUDIT_LOG_TTL: Duration = Duration::from_secs(48 * 60 * 60);

#[derive(Debug, Clone, Deserialize)]
pub struct RolloutRequest {
    #[serde(default)]
    pub uuids: Vec<String>,
    #[serde(default)]
    pub firmware: String,
    #[serde(rename = "flashjobPodImage", default)]
    pub flashjob_pod_image: String,
}

#[derive(Debug, Serialize)]
pub struct RolloutResponse {
    pub message: String,
    pub yaml_file: String,
    pub yaml_content: String,
}

#[derive(Clone)]
pub struct RolloutCore {
    cache: Cache,
    cluster: ClusterGateway,
}

impl RolloutCore {
    pub fn new(cache: Cache, cluster: ClusterGateway) -> Self {
        Self { cache, cluster }
    }

    /// Run the full rollout pipeline for one request.
    pub async fn execute(&self, req: RolloutRequest) -> Result<RolloutResponse> {
        let manifest = build_manifest(&req)?;
        let yaml = serde_yaml::to_string(&manifest)?;

        let path = write_artifact(Path::new(FLASHJOB_DIR), &manifest.metadata.name, &yaml).await?;
        info!("saved flashjob artifact to {}", path.display());

        self.cluster.apply_flashjob(&manifest).await?;

        let entry = LogEntry {
            timestamp: Utc::now().timestamp(),
            message: audit_message(&manifest.spec.uuid, &path),
            kind: "rollout".to_string(),
        };
        append_audit(&self.cache, &entry).await;

        Ok(RolloutResponse {
            message: "FlashJob created successfully".to_string(),
            yaml_file: path.to_string_lossy().into_owned(),
            yaml_content: yaml,
        })
    }
}

/// Validate and normalize the request, then synthesize the manifest.
///
/// `firmware` is deliberately checked untrimmed; only the pod image gets a
/// single outer trim before the default is substituted.
pub fn build_manifest(req: &RolloutRequest) -> Result<FlashJobManifest> {
    if req.uuids.is_empty() || req.firmware.is_empty() {
        return Err(Error::InvalidInput(
            "UUIDs and firmware are required".to_string(),
        ));
    }

    let pod_image = match req.flashjob_pod_image.trim() {
        "" => DEFAULT_FLASHJOB_POD_IMAGE.to_string(),
        trimmed => trimmed.to_string(),
    };

    Ok(FlashJobManifest::new(
        req.uuids.clone(),
        req.firmware.clone(),
        pod_image,
    ))
}

/// Write the YAML artifact under `dir`, creating the directory if needed.
/// Collisions on the same UUID prefix overwrite the previous artifact, which
/// is consistent with the declarative apply.
pub async fn write_artifact(dir: &Path, name: &str, yaml: &str) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{name}.yaml"));
    tokio::fs::write(&path, yaml).await?;
    Ok(path)
}

fn audit_message(uuids: &[String], path: &Path) -> String {
    format!(
        "FlashJob created with UUIDs: {} and saved to {}",
        uuids.join(", "),
        path.display()
    )
}

/// Append an entry to the audit log and reset its retention window. Best
/// effort, like every other audit write.
pub async fn append_audit(cache: &Cache, entry: &LogEntry) {
    cache.push(AUDIT_LOG_KEY, entry).await;
    cache.expire(AUDIT_LOG_KEY, AUDIT_LOG_TTL).await;
}
