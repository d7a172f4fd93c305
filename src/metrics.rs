use metrics::{decrement_gauge, histogram, increment_counter, increment_gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use tracing::info;

pub const URLS_TOTAL: &str = "page_capture_urls_total";
pub const FAILURES_TOTAL: &str = "page_capture_failures_total";
pub const SEGMENTS_UPLOADED_TOTAL: &str = "page_capture_segments_uploaded_total";
pub const URL_DURATION_SECONDS: &str = "page_capture_url_duration_seconds";
pub const IN_FLIGHT: &str = "page_capture_in_flight";

/// Pipeline instrumentation through the `metrics` facade.
///
/// Every call is a no-op until a recorder is installed, so tests and the
/// batch CLI pay nothing for it.
#[derive(Debug, Default, Clone)]
pub struct PipelineMetrics;

impl PipelineMetrics {
    pub fn new() -> Self {
        Self
    }

    pub fn url_started(&self) {
        increment_gauge!(IN_FLIGHT, 1.0);
    }

    pub fn url_finished(&self, duration: Duration, outcome: &'static str) {
        decrement_gauge!(IN_FLIGHT, 1.0);
        increment_counter!(URLS_TOTAL, "outcome" => outcome);
        histogram!(URL_DURATION_SECONDS, duration.as_secs_f64());
    }

    pub fn record_failure(&self, kind: &'static str) {
        increment_counter!(FAILURES_TOTAL, "kind" => kind);
    }

    pub fn record_segment_uploaded(&self) {
        increment_counter!(SEGMENTS_UPLOADED_TOTAL);
    }
}

/// Install the Prometheus recorder and return the handle that renders it.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("Prometheus metrics recorder installed");
    Ok(handle)
}
