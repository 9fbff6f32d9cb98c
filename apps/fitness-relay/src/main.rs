use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::Notify;
use tracing::{info, warn};

use fitness_relay::broadcast::BroadcastLoop;
use fitness_relay::config::{Cli, RelayConfig};
use fitness_relay::reconcile::ReconciliationLoop;
use fitness_relay::remote::{
    DetachedSource, FirebaseSource, RemoteStateCache, RemoteStateSource,
};
use fitness_relay::telemetry::Telemetry;
use fitness_relay::{router, AppState, RelayHub};

#[tokio::main]
async fn main() -> Result<()> {
    let config = RelayConfig::try_from(Cli::parse())?;
    let telemetry = Telemetry::init()?;

    let hub = RelayHub::new(RemoteStateCache::new());

    let source: Box<dyn RemoteStateSource> = match config.firebase.clone() {
        Some(settings) => Box::new(FirebaseSource::new(settings)),
        None => {
            warn!("no database URL configured; remote control disabled");
            Box::new(DetachedSource)
        }
    };
    ReconciliationLoop::new(source, hub.clone(), config.reconcile.clone())
        .spawn()
        .context("failed to start remote state polling thread")?;
    let broadcaster = BroadcastLoop::new(hub.clone(), config.broadcast.clone()).spawn();

    let state = AppState::new(hub, config.connection.clone())
        .with_metrics(telemetry.metrics_handle());
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "fitness relay listening");

    let shutdown = Arc::new(Notify::new());
    let server_shutdown = shutdown.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { server_shutdown.notified().await })
        .await
    });

    tokio::select! {
        result = &mut server => {
            broadcaster.abort();
            return result.context("server task panicked")?.context("server failed");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }

    broadcaster.abort();
    shutdown.notify_one();
    match tokio::time::timeout(config.shutdown_grace, server).await {
        Ok(joined) => joined.context("server task panicked")?.context("server failed")?,
        Err(_) => warn!(
            grace_secs = config.shutdown_grace.as_secs(),
            "connections still open after grace period; exiting"
        ),
    }
    Ok(())
}
