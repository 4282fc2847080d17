//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define relay metrics (pairings, frames, bytes, drops, faults)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `relay_pairings_total` (counter): pairings created
//! - `relay_pairings_active` (gauge): pairings currently alive
//! - `relay_pairings_rejected_total` (counter): clients refused at the connection limit
//! - `relay_frames_total` / `relay_bytes_total` (counters): forwarded traffic by direction
//! - `relay_frames_dropped_total` (counter): frames not forwarded, by direction and reason
//! - `relay_faults_total` (counter): transport faults by leg
//! - `relay_upstream_connect_seconds` (histogram): upstream connect latency by outcome
//!
//! # Design Decisions
//! - Every function is a no-op until a recorder is installed
//! - Labels are static strings to keep cardinality bounded

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Start the Prometheus scrape endpoint. Must run inside a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_pairing_opened() {
    counter!("relay_pairings_total").increment(1);
    gauge!("relay_pairings_active").increment(1.0);
}

pub fn record_pairing_closed() {
    gauge!("relay_pairings_active").decrement(1.0);
}

pub fn record_pairing_rejected() {
    counter!("relay_pairings_rejected_total").increment(1);
}

pub fn record_frame(direction: &'static str, bytes: usize) {
    counter!("relay_frames_total", "direction" => direction).increment(1);
    counter!("relay_bytes_total", "direction" => direction).increment(bytes as u64);
}

pub fn record_dropped(direction: &'static str, reason: &'static str) {
    counter!("relay_frames_dropped_total", "direction" => direction, "reason" => reason).increment(1);
}

pub fn record_fault(leg: &'static str) {
    counter!("relay_faults_total", "leg" => leg).increment(1);
}

pub fn record_upstream_connect(elapsed: Duration, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    histogram!("relay_upstream_connect_seconds", "outcome" => outcome).record(elapsed.as_secs_f64());
}
