//! Metrics emitted through the `metrics` facade
//!
//! Without an installed recorder every call here is a no-op, so the library
//! and its tests never need a Prometheus exporter.

use ::metrics::{
    describe_counter, describe_gauge, describe_histogram, gauge, histogram, increment_counter, Unit,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use tracing::info;

pub const CAPTURES_TOTAL: &str = "captures_total";
pub const CAPTURE_DURATION_SECONDS: &str = "capture_duration_seconds";
pub const ENGINE_LAUNCHES_TOTAL: &str = "engine_launches_total";
pub const ENGINE_RELEASES_TOTAL: &str = "engine_releases_total";
pub const GOVERNOR_IN_FLIGHT: &str = "governor_in_flight";
pub const GOVERNOR_QUEUED: &str = "governor_queued";

/// Install the global Prometheus recorder and return a handle for rendering `/metrics`.
pub fn install_prometheus() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    info!("Prometheus metrics recorder installed");
    Ok(handle)
}

fn describe_metrics() {
    describe_counter!(CAPTURES_TOTAL, "Capture requests by outcome");
    describe_histogram!(CAPTURE_DURATION_SECONDS, Unit::Seconds, "End-to-end capture pipeline duration");
    describe_counter!(ENGINE_LAUNCHES_TOTAL, "Render engine processes launched");
    describe_counter!(ENGINE_RELEASES_TOTAL, "Render engine processes released");
    describe_gauge!(GOVERNOR_IN_FLIGHT, "Captures currently holding a slot");
    describe_gauge!(GOVERNOR_QUEUED, "Captures waiting for a slot");
}

/// `outcome` is `success` or an error kind code.
pub fn record_capture(outcome: &'static str, duration: Duration) {
    increment_counter!(CAPTURES_TOTAL, "outcome" => outcome);
    histogram!(CAPTURE_DURATION_SECONDS, duration.as_secs_f64(), "outcome" => outcome);
}

pub fn record_engine_launch() {
    increment_counter!(ENGINE_LAUNCHES_TOTAL);
}

pub fn record_engine_release() {
    increment_counter!(ENGINE_RELEASES_TOTAL);
}

pub fn set_governor_gauges(in_flight: usize, queued: usize) {
    gauge!(GOVERNOR_IN_FLIGHT, in_flight as f64);
    gauge!(GOVERNOR_QUEUED, queued as f64);
}
