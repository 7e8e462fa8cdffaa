//! Metrics facade for the runtimes.
//!
//! Recorded through the `metrics` crate; exporting is left to whichever
//! recorder the hosting process installs.

use ::metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Metrics for one connector operation, labelled by connector and destination
#[derive(Debug, Clone)]
pub struct ConnectorMetrics {
    connector: String,
    destination: String,
}

impl ConnectorMetrics {
    pub fn new(connector: &str, destination: &str) -> Self {
        Self {
            connector: connector.to_string(),
            destination: destination.to_string(),
        }
    }

    pub fn record_received(&self) {
        counter!("relay_messages_received_total", "connector" => self.connector.clone(), "destination" => self.destination.clone())
            .increment(1);
    }

    pub fn record_acked(&self) {
        counter!("relay_messages_acked_total", "connector" => self.connector.clone(), "destination" => self.destination.clone())
            .increment(1);
    }

    /// Message handled by the sink
    pub fn record_success(&self) {
        counter!("relay_messages_processed_total", "connector" => self.connector.clone(), "destination" => self.destination.clone())
            .increment(1);
    }

    pub fn record_error(&self, kind: &str) {
        counter!(
            "relay_errors_total",
            "connector" => self.connector.clone(),
            "destination" => self.destination.clone(),
            "kind" => kind.to_string()
        )
        .increment(1);
    }

    pub fn record_retry(&self) {
        counter!("relay_retries_total", "connector" => self.connector.clone(), "destination" => self.destination.clone())
            .increment(1);
    }

    pub fn record_sent(&self, count: u64) {
        counter!("relay_messages_sent_total", "connector" => self.connector.clone(), "destination" => self.destination.clone())
            .increment(count);
    }

    pub fn record_committed(&self) {
        counter!("relay_commits_total", "connector" => self.connector.clone(), "destination" => self.destination.clone())
            .increment(1);
    }

    pub fn record_rollback(&self) {
        counter!("relay_rollbacks_total", "connector" => self.connector.clone(), "destination" => self.destination.clone())
            .increment(1);
    }

    /// Message refused before reaching the transport
    pub fn record_rejected(&self) {
        counter!("relay_messages_rejected_total", "connector" => self.connector.clone(), "destination" => self.destination.clone())
            .increment(1);
    }

    pub fn record_processing_time(&self, duration: Duration) {
        histogram!("relay_processing_seconds", "connector" => self.connector.clone(), "destination" => self.destination.clone())
            .record(duration.as_secs_f64());
    }

    pub fn record_batch_size(&self, size: usize) {
        histogram!("relay_batch_size", "connector" => self.connector.clone(), "destination" => self.destination.clone())
            .record(size as f64);
    }

    pub fn set_health(&self, healthy: bool) {
        gauge!("relay_connector_healthy", "connector" => self.connector.clone())
            .set(if healthy { 1.0 } else { 0.0 });
    }

    pub fn set_active_consumers(&self, count: usize) {
        gauge!("relay_active_consumers", "connector" => self.connector.clone(), "destination" => self.destination.clone())
            .set(count as f64);
    }
}
