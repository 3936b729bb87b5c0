//! Binary entrypoint for the realtime gateway.
use apphost::{build_router, AppState, config::Settings, gateway::KubeFeeds, store::MemoryStore, telemetry::init_tracing};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    init_tracing(&settings);
    let store = match &settings.store_file {
        Some(path) => MemoryStore::from_snapshot_file(path)?,
        None => MemoryStore::new(),
    };
    let client = kube::Client::try_default().await?;
    let state = AppState {
        store: Arc::new(store),
        feeds: Arc::new(KubeFeeds::new(client, settings.prometheus_url.clone())),
    };
    const MAX_BODY_BYTES: usize = 64 * 1024;
    let app = build_router(state)
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES));
    let addr: SocketAddr = settings.listen_addr.parse()?;
    info!(%addr, "apphost gateway listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await { tracing::warn!(error=%e, "ctrl_c handler unavailable"); }
        info!(target: "shutdown.signal", "received Ctrl+C");
        tokio::time::sleep(Duration::from_millis(200)).await;
    };
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
