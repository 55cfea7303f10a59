//! SFU Service
//!
//! Entry point. Starts the engine workers, the room controller and the HTTP
//! signaling server. Exits with status 1 if any engine worker dies.

use anyhow::{anyhow, Context};
use sfu_service::actors::{ActorMetrics, RoomControllerActorHandle};
use sfu_service::config::Config;
use sfu_service::engine::mediasoup::MediasoupEngine;
use sfu_service::observability::{init_metrics_recorder, metrics as prom, HealthState};
use sfu_service::orchestrator::SessionOrchestrator;
use sfu_service::pool::WorkerPool;
use sfu_service::routes::{self, AppState};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sfu_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting SFU service");

    let config = Config::from_env().context("Failed to load configuration")?;

    info!(
        bind_address = %config.bind_address,
        num_workers = config.num_workers,
        rtc_min_port = config.worker_settings.rtc_min_port,
        rtc_max_port = config.worker_settings.rtc_max_port,
        codecs = config.media_codecs.len(),
        "Configuration loaded successfully"
    );

    let prometheus_handle = init_metrics_recorder().map_err(|e| anyhow!(e))?;
    let health_state = Arc::new(HealthState::new());

    let engine = MediasoupEngine::new();
    let pool = Arc::new(
        WorkerPool::start(&engine, config.num_workers, &config.worker_settings)
            .await
            .context("Failed to start engine workers")?,
    );
    prom::set_workers_active(pool.len());

    let controller = RoomControllerActorHandle::new(
        Arc::clone(&pool),
        Arc::new(config.media_settings()),
        ActorMetrics::new(),
    );
    info!("Actor system initialized");

    let shutdown_token = CancellationToken::new();
    let mut deaths = pool.watch_for_death(shutdown_token.child_token());

    let state = Arc::new(AppState {
        orchestrator: SessionOrchestrator::new(controller.clone()),
        health: Arc::clone(&health_state),
    });
    let app = routes::build_routes(state, prometheus_handle);

    let addr: SocketAddr = config
        .bind_address
        .parse()
        .with_context(|| format!("Invalid bind address: {}", config.bind_address))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    health_state.set_ready();
    info!(%addr, "SFU service listening");

    let signal_token = shutdown_token.clone();
    let signal_health = Arc::clone(&health_state);
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_health.set_not_ready();
        signal_token.cancel();
    });

    let drain_timeout = Duration::from_secs(config.shutdown_timeout_seconds);
    let drain_token = shutdown_token.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_token.clone().cancelled_owned())
        .into_future();

    tokio::select! {
        result = server => {
            result.context("HTTP server failed")?;
        }
        Some(death) = deaths.recv() => {
            prom::record_worker_died();
            error!(
                worker_id = %death.worker_id,
                reason = %death.reason,
                "Engine worker died, exiting"
            );
            std::process::exit(1);
        }
        () = async {
            drain_token.cancelled().await;
            tokio::time::sleep(drain_timeout).await;
        } => {
            warn!(
                timeout_secs = config.shutdown_timeout_seconds,
                "Drain timeout elapsed, closing remaining connections"
            );
        }
    }

    shutdown_token.cancel();
    if let Err(e) = controller.shutdown().await {
        warn!(error = %e, "Room controller shutdown failed");
    }
    pool.close_all();

    info!("SFU service shutdown complete");
    Ok(())
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => error!("Failed to listen for SIGINT: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
