use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use chatterbox_core::{ConnectionRegistry, LibSqlMessageStore, SignalCoordinator};

mod config;
mod server;
mod telemetry;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();

    telemetry::init(config.log_json)
        .map_err(|e| anyhow::anyhow!("failed to init telemetry: {}", e))?;

    info!("ChatterBox server starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    config.log_config();

    let db = match &config.db_path {
        Some(path) => libsql::Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("failed to open database at {}", path.display()))?,
        None => libsql::Builder::new_local(":memory:")
            .build()
            .await
            .context("failed to open in-memory database")?,
    };
    let conn = db.connect().context("failed to connect to database")?;
    let store = Arc::new(LibSqlMessageStore::new(conn));

    let registry = Arc::new(ConnectionRegistry::new());
    let coordinator = SignalCoordinator::new(registry, store.clone(), config.history_limit);
    let state = Arc::new(server::AppState::new(coordinator, store));

    server::start(&config, state).await
}
