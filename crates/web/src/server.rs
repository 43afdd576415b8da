//! HTTP surface: request decode, dispatch to the services, response encode.
//!
//! Handlers hold no domain state; everything lives in the shared `AppState`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderValue, Method},
    middleware,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use flashboard_common::{AkriInstance, Error, LogEntry, Result};

use crate::auth::{require_auth, AuthService, AuthUser};
use crate::cache::Cache;
use crate::cluster::{filter_instances, ClusterGateway, InstanceFilter};
use crate::rollout::{append_audit, RolloutCore, RolloutRequest, RolloutResponse, AUDIT_LOG_KEY};

/// Operator log directory, written by the tracing file layer.
pub const LOG_DIR: &str = "/app/logs";

/// Operator log file, served back verbatim by `/api/logs/file`.
pub const LOG_FILE: &str = "/app/logs/app.log";

pub struct AppState {
    pub cache: Cache,
    pub auth: AuthService,
    pub cluster: ClusterGateway,
    pub rollout: RolloutCore,
}

/// Build the full router: public health/login plus the bearer-protected API.
pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/api/logout", post(logout_handler))
        .route("/api/change-password", post(change_password_handler))
        .route("/api/validate-session", get(validate_session_handler))
        .route("/api/akri-instances", get(akri_instances_handler))
        .route("/api/filter-instances", post(filter_instances_handler))
        .route("/api/generate-yaml", post(generate_yaml_handler))
        .route("/api/logs/add", post(add_log_handler))
        .route("/api/logs", get(get_logs_handler))
        .route("/api/logs/file", get(get_file_logs_handler))
        .layer(middleware::from_fn_with_state(
            state.auth.clone(),
            require_auth,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/login", post(login_handler))
        .merge(protected)
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the backend server.
pub async fn serve(addr: SocketAddr, state: Arc<AppState>) -> anyhow::Result<()> {
    info!("starting server on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(HeaderValue::from_static("http://0.0.0.0:5173"))
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let status = if state.cluster.is_connected() {
        "healthy"
    } else {
        "degraded (no k8s connection)"
    };
    Json(serde_json::json!({ "status": status }))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

async fn login_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<serde_json::Value>> {
    let token = state.auth.login(&req.username, &req.password).await?;
    Ok(Json(serde_json::json!({ "token": token })))
}

async fn logout_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Json<serde_json::Value> {
    state.auth.logout(user.user_id, &user.token).await;
    Json(serde_json::json!({ "message": "Logged out successfully" }))
}

#[derive(Debug, Deserialize)]
struct ChangePasswordRequest {
    #[serde(rename = "newPassword", default)]
    new_password: String,
}

async fn change_password_handler(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<Json<serde_json::Value>> {
    state
        .auth
        .change_password(user.user_id, &req.new_password)
        .await?;
    Ok(Json(
        serde_json::json!({ "message": "Password changed successfully" }),
    ))
}

async fn validate_session_handler(
    Extension(user): Extension<AuthUser>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "message": "Session is valid",
        "user_id": user.user_id,
        "username": user.username,
    }))
}

/// Degraded payload the UI expects when the cluster is unreachable: still a
/// 200, with the error carried in the body.
fn degraded_instances(err: &Error) -> Json<serde_json::Value> {
    warn!("failed to list akri instances: {err}");
    Json(serde_json::json!({
        "instances": Vec::<AkriInstance>::new(),
        "error": "Failed to connect to Kubernetes",
    }))
}

async fn akri_instances_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    match state.cluster.list_instances().await {
        Ok(instances) => {
            state.cache.put("akri_instances", &instances).await;
            Json(serde_json::json!({ "instances": instances }))
        }
        Err(e) => degraded_instances(&e),
    }
}

async fn filter_instances_handler(
    State(state): State<Arc<AppState>>,
    Json(filter): Json<InstanceFilter>,
) -> Json<serde_json::Value> {
    let instances = match state.cluster.list_instances().await {
        Ok(instances) => instances,
        Err(e) => return degraded_instances(&e),
    };
    let filtered = filter_instances(instances, &filter);
    state.cache.put("filtered_instances", &filtered).await;
    Json(serde_json::json!(filtered))
}

async fn generate_yaml_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RolloutRequest>,
) -> Result<Json<RolloutResponse>> {
    let resp = state.rollout.execute(req).await?;
    Ok(Json(resp))
}

#[derive(Debug, Deserialize)]
struct AddLogRequest {
    /// Arrives as a float from the UI; fractional seconds are dropped.
    #[serde(default)]
    timestamp: f64,
    #[serde(default)]
    message: String,
    #[serde(rename = "type", default)]
    kind: String,
}

async fn add_log_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddLogRequest>,
) -> Json<serde_json::Value> {
    let entry = LogEntry {
        timestamp: req.timestamp as i64,
        message: req.message,
        kind: req.kind,
    };
    append_audit(&state.cache, &entry).await;
    info!("log added: {} ({})", entry.message, entry.kind);
    Json(serde_json::json!({ "message": "Log added successfully" }))
}

async fn get_logs_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let entries: Vec<LogEntry> = state.cache.range(AUDIT_LOG_KEY, 0, -1).await;
    let logs: Vec<serde_json::Value> = entries
        .iter()
        .map(|e| {
            serde_json::json!({
                "timestamp": e.timestamp,
                "message": e.message,
                "type": e.kind,
                "formatted_time": format_local_time(e.timestamp),
            })
        })
        .collect();
    Json(serde_json::json!({ "logs": logs }))
}

async fn get_file_logs_handler() -> Result<Json<serde_json::Value>> {
    let data = tokio::fs::read_to_string(LOG_FILE).await?;
    let lines: Vec<&str> = data.split('\n').collect();
    Ok(Json(serde_json::json!({ "logs": lines })))
}

/// Render a unix timestamp in the operator's zone, falling back to UTC when
/// the tz database lacks Europe/Athens.
fn format_local_time(ts: i64) -> String {
    let Some(utc) = chrono::DateTime::from_timestamp(ts, 0) else {
        return ts.to_string();
    };
    match "Europe/Athens".parse::<chrono_tz::Tz>() {
        Ok(tz) => utc
            .with_timezone(&tz)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        Err(_) => utc.format("%Y-%m-%d %H:%M:%S").to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_local_time_athens() {
        // Athens was UTC+2 (EET) at the epoch.
        assert_eq!(format_local_time(0), "1970-01-01 02:00:00");
        // Summer time: UTC+3.
        assert_eq!(format_local_time(1_720_000_000), "2024-07-03 13:26:40");
    }

    #[test]
    fn test_add_log_timestamp_truncates() {
        let req: AddLogRequest = serde_json::from_value(serde_json::json!({
            "timestamp": 1700000000.987,
            "message": "m",
            "type": "info"
        }))
        .unwrap();
        assert_eq!(req.timestamp as i64, 1_700_000_000);
    }

    #[test]
    fn test_login_request_defaults_missing_fields() {
        // Missing fields decode to empty strings and fail validation with
        // 400 downstream instead of being rejected by the extractor.
        let req: LoginRequest = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(req.username.is_empty());
        assert!(req.password.is_empty());
    }
}
