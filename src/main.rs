//! Tesseract Batcher - outgoing cross-chain transfer batching
//!
//! Pools outgoing transfer requests, packs the highest-fee ones into
//! nonce-ordered batches per token contract, and settles or cancels those
//! batches as execution confirmations arrive from the foreign chain.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

mod api;
mod batch;
mod config;
mod coordination;
mod denom;
mod error;
mod events;
mod metrics;
mod pool;
mod state;
mod store;
mod valset;

use batch::BatchManager;
use config::{parse_address, Settings};
use coordination::BatchCoordinator;
use denom::DenomRegistry;
use events::{BridgeIdentity, BroadcastEventSink};
use metrics::MetricsServer;
use pool::TransferPool;
use state::StateManager;
use store::{BatchStore, MemoryBatchStore};
use valset::StaticValsetProvider;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Tesseract Batcher v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    let denoms = settings.batch_denoms();
    info!(
        "Loaded configuration for {} denominations and {} validators",
        denoms.len(),
        settings.validators.len()
    );

    // Restore pool and batches from the last snapshot
    let state_manager = Arc::new(StateManager::new(&settings.state).await?);
    let (pool, store) = match state_manager.load().await? {
        Some(snapshot) => snapshot.into_parts()?,
        None => (TransferPool::new(), MemoryBatchStore::new()),
    };
    info!(
        "State restored: {} transfers, {} pending batches",
        pool.len(),
        store.len()
    );

    let registry = Arc::new(DenomRegistry::from_config(&settings.denominations)?);
    let valsets = Arc::new(StaticValsetProvider::from_config(&settings.validators)?);
    let bridge = BridgeIdentity {
        contract_address: parse_address(&settings.bridge.contract_address)?,
        chain_id: settings.bridge.chain_id,
    };

    // Event sink and its logging subscriber
    let events = Arc::new(BroadcastEventSink::new(1024));
    let event_handle = tokio::spawn({
        let mut rx = events.subscribe();
        async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        metrics::record_event(&event);
                        debug!(
                            "Batch event {} (token {:?}, nonce {}): {:?}",
                            event.kind(),
                            event.token_contract(),
                            event.nonce(),
                            event.attributes()
                        );
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Event subscriber lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    });

    let manager = BatchManager::new(pool, store, registry, valsets, events, bridge);

    // Initialize coordinator
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (coordinator, handle) = BatchCoordinator::new(
        manager,
        state_manager.clone(),
        settings.batcher.clone(),
        denoms,
        shutdown_rx,
    );
    info!("Batch coordinator initialized");

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = api::AppState {
            handle: handle.clone(),
            state_manager: state_manager.clone(),
            started_at: Utc::now(),
        };
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = metrics_server.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    // Start coordinator
    let coordination_handle = tokio::spawn(async move {
        if let Err(e) = coordinator.run().await {
            error!("Batch coordinator error: {}", e);
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let state_manager = state_manager.clone();
        let handle = handle.clone();
        let interval = settings.batcher.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                let storage = state_manager.health_check().await;
                let coordinator = handle.status().await;

                match (storage, coordinator) {
                    (Ok(()), Ok(status)) => {
                        for (denom, count) in &status.unbatched {
                            metrics::record_pool_depth(denom, *count);
                        }
                        metrics::record_health_check();
                    }
                    (storage, coordinator) => {
                        if let Err(e) = storage {
                            warn!("Snapshot storage health check failed: {}", e);
                        }
                        if let Err(e) = coordinator {
                            warn!("Coordinator health check failed: {}", e);
                        }
                        metrics::record_health_check_failure();
                    }
                }
            }
        }
    });

    info!("Tesseract Batcher is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Let the coordinator write its final snapshot
    let _ = shutdown_tx.send(true);
    if let Err(e) = coordination_handle.await {
        error!("Batch coordinator task failed: {}", e);
    }

    // Abort background tasks
    api_handle.abort();
    health_handle.abort();
    event_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Tesseract Batcher stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tesseract_batcher=debug,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
