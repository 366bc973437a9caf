//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Listener progress and deposit counts
//! - Transaction submission, resends and outcomes
//! - Proposal votes, executions and fatal failures

use crate::error::{RelayerError, RelayerResult};
use crate::message::DomainId;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, CounterVec, Encoder, GaugeVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Listener metrics
    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "bridge_relayer_block_height",
        "Last block processed per domain",
        &["domain_id"]
    ).unwrap();

    pub static ref DEPOSITS: CounterVec = register_counter_vec!(
        "bridge_relayer_deposits_total",
        "Deposits decoded and routed",
        &["source", "destination"]
    ).unwrap();

    pub static ref DECODE_FAILURES: CounterVec = register_counter_vec!(
        "bridge_relayer_decode_failures_total",
        "Deposits skipped because they could not be decoded",
        &["domain_id"]
    ).unwrap();

    // Transaction metrics
    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "bridge_relayer_transactions_submitted_total",
        "Total transactions submitted",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_RESENT: CounterVec = register_counter_vec!(
        "bridge_relayer_transactions_resent_total",
        "Transactions resubmitted with an escalated gas price",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_CONFIRMED: CounterVec = register_counter_vec!(
        "bridge_relayer_transactions_confirmed_total",
        "Monitored transactions mined successfully",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_FAILED: CounterVec = register_counter_vec!(
        "bridge_relayer_transactions_failed_total",
        "Monitored transactions mined with a failed status",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_TIMED_OUT: CounterVec = register_counter_vec!(
        "bridge_relayer_transactions_timed_out_total",
        "Monitored transactions abandoned after the timeout",
        &["chain_id"]
    ).unwrap();

    // Proposal metrics
    pub static ref VOTES: CounterVec = register_counter_vec!(
        "bridge_relayer_votes_total",
        "Votes submitted per destination domain",
        &["domain_id"]
    ).unwrap();

    pub static ref EXECUTIONS: CounterVec = register_counter_vec!(
        "bridge_relayer_executions_total",
        "Proposal executions submitted per destination domain",
        &["domain_id"]
    ).unwrap();

    pub static ref FATAL_ERRORS: CounterVec = register_counter_vec!(
        "bridge_relayer_fatal_errors_total",
        "Proposal operations that exhausted their retry budget",
        &["operation"]
    ).unwrap();
}

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
            .map_err(|e| RelayerError::Config(format!("Failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| RelayerError::Internal(format!("Metrics server failed: {}", e)))?;

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

pub fn record_blocks_processed(domain_id: DomainId, block_number: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[&domain_id.to_string()])
        .set(block_number as f64);
}

pub fn record_deposit(source: DomainId, destination: DomainId) {
    DEPOSITS
        .with_label_values(&[&source.to_string(), &destination.to_string()])
        .inc();
}

pub fn record_decode_failure(domain_id: DomainId) {
    DECODE_FAILURES
        .with_label_values(&[&domain_id.to_string()])
        .inc();
}

pub fn record_tx_submitted(chain_id: u64) {
    TX_SUBMITTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_resent(chain_id: u64) {
    TX_RESENT.with_label_values(&[&chain_id.to_string()]).inc();
}

pub fn record_tx_confirmed(chain_id: u64) {
    TX_CONFIRMED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_tx_failed(chain_id: u64) {
    TX_FAILED.with_label_values(&[&chain_id.to_string()]).inc();
}

pub fn record_tx_timed_out(chain_id: u64) {
    TX_TIMED_OUT
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_vote(domain_id: DomainId) {
    VOTES.with_label_values(&[&domain_id.to_string()]).inc();
}

pub fn record_execution(domain_id: DomainId) {
    EXECUTIONS
        .with_label_values(&[&domain_id.to_string()])
        .inc();
}

pub fn record_fatal_error(operation: &str) {
    FATAL_ERRORS.with_label_values(&[operation]).inc();
}
