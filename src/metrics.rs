//! Prometheus metrics for the gateway.
//!
//! Metrics are exposed via a dedicated HTTP listener (`METRICS_PORT`).
//!
//! # Available Metrics
//!
//! ## Counters
//! - `gateway_messages_published_total` - Publish outcomes (label: status)
//! - `gateway_messages_relayed_total` - Records written to stream clients
//! - `gateway_messages_dropped_total` - Records skipped because they are not messages
//!
//! Labels only ever carry values from fixed sets. Topic names come from
//! clients, so they are logged but never used as labels.
//! - `gateway_streams_opened_total` - Streams that started relaying (label: start)
//! - `gateway_streams_closed_total` - Streams released (label: reason)
//!
//! ## Histograms
//! - `gateway_append_duration_seconds` - Broker append latency including retries (label: status)
//!
//! ## Gauges
//! - `gateway_active_streams` - Streams currently relaying
//!
//! # Usage
//!
//! ```rust,ignore
//! use topic_gateway::metrics::{try_init_metrics, record_message_published};
//!
//! // Initialize metrics (call once at startup)
//! try_init_metrics("0.0.0.0:9090".parse()?);
//!
//! record_message_published("accepted");
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const MESSAGES_PUBLISHED_TOTAL: &str = "gateway_messages_published_total";
    pub const MESSAGES_RELAYED_TOTAL: &str = "gateway_messages_relayed_total";
    pub const MESSAGES_DROPPED_TOTAL: &str = "gateway_messages_dropped_total";
    pub const STREAMS_OPENED_TOTAL: &str = "gateway_streams_opened_total";
    pub const STREAMS_CLOSED_TOTAL: &str = "gateway_streams_closed_total";
    pub const APPEND_DURATION_SECONDS: &str = "gateway_append_duration_seconds";
    pub const ACTIVE_STREAMS: &str = "gateway_active_streams";
}

/// Initialize the Prometheus metrics exporter.
///
/// Sets up metric descriptions and starts the Prometheus HTTP listener on
/// `metrics_addr`.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::MESSAGES_PUBLISHED_TOTAL,
        "Total number of publish requests by outcome"
    );
    describe_counter!(
        names::MESSAGES_RELAYED_TOTAL,
        "Total number of records relayed to stream clients"
    );
    describe_counter!(
        names::MESSAGES_DROPPED_TOTAL,
        "Total number of records skipped because they did not parse as messages"
    );
    describe_counter!(
        names::STREAMS_OPENED_TOTAL,
        "Total number of streams opened"
    );
    describe_counter!(
        names::STREAMS_CLOSED_TOTAL,
        "Total number of streams closed by termination reason"
    );

    describe_histogram!(
        names::APPEND_DURATION_SECONDS,
        "Broker append duration in seconds, retries included"
    );

    describe_gauge!(names::ACTIVE_STREAMS, "Number of streams currently relaying");

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Counter Recording Functions
// =============================================================================

/// Record the outcome of a publish request.
///
/// `status` is `accepted` or an [`AppError::kind`](crate::error::AppError::kind).
pub fn record_message_published(status: &'static str) {
    counter!(names::MESSAGES_PUBLISHED_TOTAL, "status" => status).increment(1);
}

/// Record a record written to a stream client.
pub fn record_message_relayed() {
    counter!(names::MESSAGES_RELAYED_TOTAL).increment(1);
}

/// Record a record skipped by the relay.
pub fn record_message_dropped() {
    counter!(names::MESSAGES_DROPPED_TOTAL).increment(1);
}

pub fn record_stream_opened(start: &str) {
    counter!(names::STREAMS_OPENED_TOTAL, "start" => start.to_string()).increment(1);
}

pub fn record_stream_closed(reason: &str) {
    counter!(names::STREAMS_CLOSED_TOTAL, "reason" => reason.to_string()).increment(1);
}

// =============================================================================
// Histogram Recording Functions
// =============================================================================

/// Record broker append duration.
pub fn record_append_duration(status: &str, duration_secs: f64) {
    histogram!(names::APPEND_DURATION_SECONDS, "status" => status.to_string())
        .record(duration_secs);
}

// =============================================================================
// Gauge Recording Functions
// =============================================================================

pub fn set_active_streams(count: usize) {
    gauge!(names::ACTIVE_STREAMS).set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    // These only check that recording without an installed exporter is a no-op.

    #[test]
    fn test_record_publish_outcomes() {
        record_message_published("accepted");
        record_message_published("append_failed");
    }

    #[test]
    fn test_record_stream_lifecycle() {
        record_stream_opened("oldest");
        record_message_relayed();
        record_message_dropped();
        record_stream_closed("client_cancelled");
        set_active_streams(0);
    }

    #[test]
    fn test_record_append_duration() {
        record_append_duration("ok", 0.004);
    }
}
