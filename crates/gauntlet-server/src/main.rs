use anyhow::Context;
use clap::Parser;
use gauntlet_core::providers::ProviderClient;
use gauntlet_core::{Engine, Store};
use gauntlet_server::{api, state::AppState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gauntlet-server", about = "Multi-model benchmark harness API")]
struct Args {
    /// Sqlite database file.
    #[arg(long, env = "GAUNTLET_DB", default_value = "var/data.sqlite")]
    db: PathBuf,
    /// Listen address.
    #[arg(long, env = "GAUNTLET_LISTEN", default_value = "127.0.0.1:8700")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    if let Some(parent) = args.db.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create data directory {}", parent.display()))?;
        }
    }
    let store = Store::open(&args.db)?;
    store.init_schema()?;

    let client = Arc::new(ProviderClient::new()?);
    let engine = Engine::new(store.clone(), client);
    let state = Arc::new(AppState::new(store, engine));

    let app = api::router(state).layer(TraceLayer::new_for_http());
    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("bind {}", args.listen))?;
    info!(addr = %args.listen, db = %args.db.display(), "gauntlet-server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
}
