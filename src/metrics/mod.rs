//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain reachability
//! - Transaction submission and final status
//! - Transfer outcomes per leg
//! - Propagation polling and RPC failover

use crate::error::{TransferError, TransferResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "interchain_chain_connected",
        "Chain reachability (1=reachable, 0=unreachable)",
        &["chain"]
    ).unwrap();

    pub static ref RPC_FAILOVERS: CounterVec = register_counter_vec!(
        "interchain_rpc_failovers_total",
        "Total RPC endpoint failovers",
        &["chain"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "interchain_transactions_submitted_total",
        "Total transactions submitted by kind",
        &["chain", "kind"]
    ).unwrap();

    pub static ref TX_ACCEPTED: CounterVec = register_counter_vec!(
        "interchain_transactions_accepted_total",
        "Total transactions accepted",
        &["chain"]
    ).unwrap();

    pub static ref TX_REJECTED: CounterVec = register_counter_vec!(
        "interchain_transactions_rejected_total",
        "Total transactions rejected",
        &["chain"]
    ).unwrap();

    pub static ref TX_LATENCY: HistogramVec = register_histogram_vec!(
        "interchain_transaction_latency_seconds",
        "Time from submission to final status",
        &["chain"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).unwrap();

    // Transfer metrics
    pub static ref TRANSFERS_STARTED: CounterVec = register_counter_vec!(
        "interchain_transfers_started_total",
        "Total transfers started",
        &["source", "destination"]
    ).unwrap();

    pub static ref TRANSFERS_COMPLETED: CounterVec = register_counter_vec!(
        "interchain_transfers_completed_total",
        "Total transfers completed",
        &["source", "destination"]
    ).unwrap();

    pub static ref TRANSFERS_FAILED: CounterVec = register_counter_vec!(
        "interchain_transfers_failed_total",
        "Total transfers failed by leg and error kind",
        &["leg", "kind"]
    ).unwrap();

    pub static ref TRANSFER_DURATION: HistogramVec = register_histogram_vec!(
        "interchain_transfer_duration_seconds",
        "End-to-end transfer duration",
        &["source", "destination"],
        vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]
    ).unwrap();

    pub static ref PROPAGATION_ATTEMPTS: HistogramVec = register_histogram_vec!(
        "interchain_propagation_attempts",
        "Polls needed before exported funds became visible",
        &["destination"],
        vec![1.0, 2.0, 3.0, 5.0, 10.0, 20.0]
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

    pub async fn run(&self) -> TransferResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| TransferError::Config(format!("Cannot bind metrics port: {}", e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| TransferError::Internal(format!("Metrics server failed: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Text exposition of every registered metric
pub fn render() -> TransferResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TransferError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TransferError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_chain_health(chain: &str, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[chain])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_rpc_failover(chain: &str) {
    RPC_FAILOVERS.with_label_values(&[chain]).inc();
}

pub fn record_tx_submitted(chain: &str, kind: &str) {
    TX_SUBMITTED.with_label_values(&[chain, kind]).inc();
}

pub fn record_tx_accepted(chain: &str, latency_secs: f64) {
    TX_ACCEPTED.with_label_values(&[chain]).inc();
    TX_LATENCY.with_label_values(&[chain]).observe(latency_secs);
}

pub fn record_tx_rejected(chain: &str) {
    TX_REJECTED.with_label_values(&[chain]).inc();
}

pub fn record_transfer_started(source: &str, destination: &str) {
    TRANSFERS_STARTED
        .with_label_values(&[source, destination])
        .inc();
}

pub fn record_transfer_completed(source: &str, destination: &str, duration_secs: f64) {
    TRANSFERS_COMPLETED
        .with_label_values(&[source, destination])
        .inc();
    TRANSFER_DURATION
        .with_label_values(&[source, destination])
        .observe(duration_secs);
}

pub fn record_transfer_failed(leg: &str, kind: &str) {
    TRANSFERS_FAILED.with_label_values(&[leg, kind]).inc();
}

pub fn record_propagation_attempts(destination: &str, attempts: u32) {
    PROPAGATION_ATTEMPTS
        .with_label_values(&[destination])
        .observe(f64::from(attempts));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_series() {
        record_tx_submitted("metrics-test", "export");
        let text = render().unwrap();
        assert!(text.contains("interchain_transactions_submitted_total"));
        assert!(text.contains("metrics-test"));
    }
}
