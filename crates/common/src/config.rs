//! Environment-driven configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Backend configuration, read once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP listen address
    pub server_addr: String,

    /// Redis host
    pub redis_host: String,

    /// Redis port
    pub redis_port: u16,

    /// Redis logical database
    pub redis_db: i64,

    /// Kubeconfig path (KUBE_CONFIG_PATH, then KUBECONFIG, then ~/.kube/config)
    pub kube_config_path: PathBuf,

    /// HMAC secret for bearer tokens
    pub jwt_secret: String,
}

impl Config {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            server_addr: get_env("SERVER_ADDR", "0.0.0.0:8000"),
            redis_host: get_env("REDIS_HOST", "localhost"),
            redis_port: get_env_parsed("REDIS_PORT", 6379),
            redis_db: get_env_parsed("REDIS_DB", 0),
            kube_config_path: kubeconfig_path_from_env(),
            jwt_secret: get_env("JWT_SECRET", "mysecretkey"),
        }
    }

    /// Redis connection URL in the form `redis://host:port/db`.
    pub fn redis_url(&self) -> String {
        format!(
            "redis://{}:{}/{}",
            self.redis_host, self.redis_port, self.redis_db
        )
    }
}

fn get_env(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn kubeconfig_path_from_env() -> PathBuf {
    if let Ok(path) = std::env::var("KUBE_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    if let Ok(path) = std::env::var("KUBECONFIG") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".kube/config"),
        None => PathBuf::from("/root/.kube/config"),
    }
}
