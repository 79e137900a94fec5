//! Server entry point: configuration, tracing, store, gateway.

use anyhow::Result;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use voiceline::gateway::{self, AppState};
use voiceline::models::AgentConfig;
use voiceline::{Config, ConversationWriter, SqliteStore, VoicePipeline};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();
    init_tracing(&config);

    let store = Arc::new(SqliteStore::open(Path::new(&config.db_path))?);

    // A fresh development database gets a demo agent so the WebSocket
    // endpoint is usable immediately.
    if config.is_development() && !store.has_agents()? {
        let agent = AgentConfig::demo();
        store.put_agent(&agent)?;
        tracing::info!(agent_id = %agent.id, "Seeded demo agent");
    }

    let pipeline = Arc::new(VoicePipeline::new(
        &config,
        Arc::clone(&store) as Arc<dyn ConversationWriter>,
    ));
    let state = AppState { pipeline, store };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, env = %config.env, "Voiceline server listening");

    axum::serve(listener, gateway::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if config.is_production() {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .init();
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
}
