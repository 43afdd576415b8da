use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use flashboard_common::Config;
use flashboard_web::server::{self, AppState};
use flashboard_web::{AuthService, Cache, ClusterGateway, RolloutCore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;
    tracing::info!("flashboard backend {} starting", flashboard_common::VERSION);

    let cfg = Config::from_env();

    let cache = Cache::connect(&cfg)
        .await
        .context("failed to connect to redis")?;

    let auth = AuthService::new(cache.clone(), cfg.jwt_secret.clone());
    auth.init_admin()
        .await
        .context("failed to initialize auth database")?;

    let cluster = ClusterGateway::bootstrap(&cfg).await;
    let rollout = RolloutCore::new(cache.clone(), cluster.clone());

    let state = Arc::new(AppState {
        cache,
        auth,
        cluster,
        rollout,
    });

    let addr: SocketAddr = cfg
        .server_addr
        .parse()
        .with_context(|| format!("invalid SERVER_ADDR: {}", cfg.server_addr))?;

    server::serve(addr, state).await
}

/// Log to stderr and, without ANSI codes, to the operator log file that
/// `/api/logs/file` serves back. Either path failing is fatal.
fn init_tracing() -> anyhow::Result<()> {
    std::fs::create_dir_all(server::LOG_DIR).context("failed to create log directory")?;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(server::LOG_FILE)
        .context("failed to open log file")?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(std::sync::Mutex::new(file)))
        .init();
    Ok(())
}
