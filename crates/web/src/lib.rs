//! Flashboard backend
//!
//! Control-plane backend for the IoT management UI: operator auth, Akri
//! instance projection, and FlashJob firmware rollouts.

pub mod auth;
pub mod cache;
pub mod cluster;
pub mod rollout;
pub mod server;

pub use auth::AuthService;
pub use cache::Cache;
pub use cluster::ClusterGateway;
pub use rollout::RolloutCore;
pub use server::AppState;
