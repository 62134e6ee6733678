//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Transfer pool depth
//! - Batch creation, execution and cancellation
//! - Snapshot persistence
//! - Health checks

use crate::error::BatcherResult;
use crate::events::BatchEvent;

use axum::{http::StatusCode, routing::get, Router};
use ethers::types::Address;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Pool metrics
    pub static ref TRANSFERS_SUBMITTED: CounterVec = register_counter_vec!(
        "tesseract_batcher_transfers_submitted_total",
        "Total transfers admitted to the pool",
        &["denom"]
    ).unwrap();

    pub static ref POOL_UNBATCHED: GaugeVec = register_gauge_vec!(
        "tesseract_batcher_pool_unbatched",
        "Unbatched transfers per voucher denom",
        &["denom"]
    ).unwrap();

    // Batch metrics
    pub static ref BATCHES_CREATED: CounterVec = register_counter_vec!(
        "tesseract_batcher_batches_created_total",
        "Total outgoing batches created",
        &["token_contract"]
    ).unwrap();

    pub static ref BATCHES_EXECUTED: CounterVec = register_counter_vec!(
        "tesseract_batcher_batches_executed_total",
        "Total outgoing batches confirmed executed",
        &["token_contract"]
    ).unwrap();

    pub static ref BATCHES_CANCELED: CounterVec = register_counter_vec!(
        "tesseract_batcher_batches_canceled_total",
        "Total outgoing batches canceled",
        &["token_contract"]
    ).unwrap();

    pub static ref BATCH_SIZE: HistogramVec = register_histogram_vec!(
        "tesseract_batcher_batch_size",
        "Transfers per created batch",
        &["token_contract"],
        vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0]
    ).unwrap();

    pub static ref EVENTS_EMITTED: CounterVec = register_counter_vec!(
        "tesseract_batcher_events_total",
        "Batch events observed by kind",
        &["kind"]
    ).unwrap();

    // Persistence metrics
    pub static ref SNAPSHOT_FAILURES: CounterVec = register_counter_vec!(
        "tesseract_batcher_snapshot_failures_total",
        "Total failed state snapshot writes",
        &[]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "tesseract_batcher_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "tesseract_batcher_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> BatcherResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

fn token_label(token_contract: &Address) -> String {
    format!("{:?}", token_contract)
}

pub fn record_transfer_submitted(denom: &str) {
    TRANSFERS_SUBMITTED.with_label_values(&[denom]).inc();
}

pub fn record_pool_depth(denom: &str, unbatched: usize) {
    POOL_UNBATCHED
        .with_label_values(&[denom])
        .set(unbatched as f64);
}

pub fn record_batch_created(token_contract: &Address, size: usize) {
    let label = token_label(token_contract);
    BATCHES_CREATED.with_label_values(&[&label]).inc();
    BATCH_SIZE.with_label_values(&[&label]).observe(size as f64);
}

pub fn record_batch_executed(token_contract: &Address) {
    BATCHES_EXECUTED
        .with_label_values(&[&token_label(token_contract)])
        .inc();
}

pub fn record_batch_canceled(token_contract: &Address) {
    BATCHES_CANCELED
        .with_label_values(&[&token_label(token_contract)])
        .inc();
}

pub fn record_event(event: &BatchEvent) {
    EVENTS_EMITTED.with_label_values(&[event.kind()]).inc();
}

pub fn record_snapshot_failure() {
    SNAPSHOT_FAILURES.with_label_values(&[]).inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
