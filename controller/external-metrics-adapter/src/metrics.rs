//! Log-based metrics for the adapter
//!
//! Every recorded event is emitted as a structured tracing event so it can be
//! aggregated by the log pipeline.

use tracing::{info, warn};

/// Metrics recorder for refreshes, client construction and metric resolution
#[derive(Debug, Clone, Copy, Default)]
pub struct Metrics;

impl Metrics {
    /// Record the outcome of one configuration refresh cycle
    pub fn record_refresh(&self, applied: usize, unchanged: usize, failed: usize, removed: usize) {
        info!(
            applied = applied,
            unchanged = unchanged,
            failed = failed,
            removed = removed,
            "Recorded configuration refresh"
        );
    }

    /// Record a configuration object that could not be parsed
    pub fn record_config_error(&self, object: &str) {
        warn!(object = %object, "Recorded configuration error");
    }

    /// Record a backend client construction attempt
    pub fn record_client_created(&self, success: bool, credential: &str) {
        info!(
            success = success,
            credential = %credential,
            "Recorded backend client construction"
        );
    }

    /// Record a successful metric resolution
    pub fn record_resolution(&self, metric: &str, points: usize) {
        info!(metric = %metric, points = points, "Recorded metric resolution");
    }

    /// Record a resolution request for a metric with no configured query
    pub fn record_not_found(&self, metric: &str) {
        info!(metric = %metric, "Recorded unknown metric request");
    }

    /// Record a failed metric resolution
    pub fn record_resolution_error(&self, error_type: &str, metric: &str) {
        warn!(
            error_type = %error_type,
            metric = %metric,
            "Recorded resolution error"
        );
    }
}
