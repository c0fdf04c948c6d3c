//! Observability module for the Strata metadata server.
//!
//! Provides logging initialisation and the metric helpers the cache core
//! records into. No exporter is installed here; a host process that wants
//! to scrape the counters installs its own `metrics` recorder.

use crate::config::ObservabilityConfig;
use crate::error::{MdsError, Result};
use metrics::{counter, gauge};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| MdsError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| MdsError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    info!("Observability initialized");
    Ok(())
}

/// Record an inbound peer message.
pub fn record_message(kind: &'static str) {
    counter!("mds_messages_total", "kind" => kind).increment(1);
}

/// Record a peer message dropped as malformed or out of order.
pub fn record_protocol_violation() {
    counter!("mds_protocol_violations_total").increment(1);
}

/// Record the outcome of an export (`finished`, `aborted`).
pub fn record_export(outcome: &'static str) {
    counter!("mds_exports_total", "outcome" => outcome).increment(1);
}

/// Record the outcome of a hash or unhash.
pub fn record_hash(outcome: &'static str) {
    counter!("mds_hashes_total", "outcome" => outcome).increment(1);
}

/// Record a completed rename.
pub fn record_rename() {
    counter!("mds_renames_total").increment(1);
}

/// Record cache evictions.
pub fn record_evictions(count: u64) {
    counter!("mds_cache_evictions_total").increment(count);
}

/// Record a client request outcome (`ok`, `error`, `forwarded`).
pub fn record_request(outcome: &'static str) {
    counter!("mds_requests_total", "outcome" => outcome).increment(1);
}

/// Update the cached inode gauge.
pub fn update_cache_size(inodes: usize) {
    gauge!("mds_cache_inodes").set(inodes as f64);
}
