//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain heads, RPC failures and reorgs
//! - Relay progress (cursor, queue depth, coordinator state)
//! - Deposit and fill outcomes
//! - Fill latency

use crate::error::{RelayerError, RelayerResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "relayer_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref CHAIN_HEAD: GaugeVec = register_gauge_vec!(
        "relayer_chain_head",
        "Latest head seen per chain",
        &["chain_id"]
    ).unwrap();

    pub static ref RPC_FAILURES: CounterVec = register_counter_vec!(
        "relayer_rpc_failures_total",
        "Failed RPC calls and endpoint failovers",
        &["chain_id"]
    ).unwrap();

    pub static ref REORGS: CounterVec = register_counter_vec!(
        "relayer_reorgs_total",
        "Reorganizations detected",
        &["chain_id"]
    ).unwrap();

    // Relay progress
    pub static ref CURSOR: GaugeVec = register_gauge_vec!(
        "relayer_cursor_block",
        "Last safe source block",
        &["chain_id"]
    ).unwrap();

    pub static ref FILL_QUEUE: GaugeVec = register_gauge_vec!(
        "relayer_fill_queue_depth",
        "Deposits waiting for a fill worker",
        &[]
    ).unwrap();

    pub static ref RELAY_STATE: GaugeVec = register_gauge_vec!(
        "relayer_state",
        "Coordinator state (1 for the current state)",
        &["state"]
    ).unwrap();

    // Deposit and fill metrics
    pub static ref DEPOSITS_OBSERVED: CounterVec = register_counter_vec!(
        "relayer_deposits_observed_total",
        "Deposits recorded from the source chain",
        &["chain_id"]
    ).unwrap();

    pub static ref FILLS_SUBMITTED: CounterVec = register_counter_vec!(
        "relayer_fills_submitted_total",
        "Fill transactions accepted by the destination node",
        &["chain_id"]
    ).unwrap();

    pub static ref FILLS_COMPLETED: CounterVec = register_counter_vec!(
        "relayer_fills_completed_total",
        "Deposits filled",
        &["chain_id"]
    ).unwrap();

    pub static ref FILLS_FAILED: CounterVec = register_counter_vec!(
        "relayer_fills_failed_total",
        "Deposits marked failed by error kind",
        &["chain_id", "kind"]
    ).unwrap();

    pub static ref FILL_LATENCY: HistogramVec = register_histogram_vec!(
        "relayer_fill_latency_seconds",
        "Time from submission start to final fill",
        &["chain_id"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]
    ).unwrap();

    pub static ref NONCE_RESYNCS: CounterVec = register_counter_vec!(
        "relayer_nonce_resyncs_total",
        "Nonce conflicts and external account usage",
        &["chain_id"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "relayer_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "relayer_health_check_failure_total",
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

    pub async fn run(&self) -> RelayerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayerError::Internal(format!("metrics bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| RelayerError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Text exposition of every registered metric
pub fn render() -> RelayerResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| RelayerError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| RelayerError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_source_head(chain_id: u64, block_number: u64) {
    CHAIN_HEAD
        .with_label_values(&[&chain_id.to_string()])
        .set(block_number as f64);
}

pub fn record_rpc_failure(chain_id: u64) {
    RPC_FAILURES
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_reorg(chain_id: u64) {
    REORGS.with_label_values(&[&chain_id.to_string()]).inc();
}

pub fn record_cursor(chain_id: u64, block_number: u64) {
    CURSOR
        .with_label_values(&[&chain_id.to_string()])
        .set(block_number as f64);
}

pub fn record_queue_depth(depth: usize) {
    FILL_QUEUE.with_label_values(&[]).set(depth as f64);
}

pub fn record_relay_state(state: &str) {
    for candidate in ["starting", "running", "draining", "stopped"] {
        RELAY_STATE
            .with_label_values(&[candidate])
            .set(if candidate == state { 1.0 } else { 0.0 });
    }
}

pub fn record_deposit_observed(chain_id: u64) {
    DEPOSITS_OBSERVED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_fill_submitted(chain_id: u64) {
    FILLS_SUBMITTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_fill_completed(chain_id: u64, latency: Duration) {
    let label = chain_id.to_string();
    FILLS_COMPLETED.with_label_values(&[&label]).inc();
    FILL_LATENCY
        .with_label_values(&[&label])
        .observe(latency.as_secs_f64());
}

pub fn record_fill_failed(chain_id: u64, error: &RelayerError) {
    FILLS_FAILED
        .with_label_values(&[&chain_id.to_string(), error.kind()])
        .inc();
}

pub fn record_nonce_resync(chain_id: u64) {
    NONCE_RESYNCS
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_metrics() {
        record_reorg(424242);
        record_relay_state("running");

        let text = render().unwrap();
        assert!(text.contains("relayer_reorgs_total"));
        assert!(text.contains("chain_id=\"424242\""));
        assert!(text.contains("relayer_state{state=\"running\"} 1"));
    }
}
