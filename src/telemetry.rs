//! Exporter self-metrics (errors, cycles) rendered next to the TeamCity samples.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static RECORDER: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = RECORDER.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    metrics::describe_counter!(
        "teamcity_exporter_errors_total",
        "Failed units of work, by scrape stage"
    );
    metrics::describe_counter!("teamcity_exporter_cycles_total", "Scrape cycles started");
    metrics::describe_counter!(
        "teamcity_exporter_cycles_skipped_total",
        "Ticks skipped because the previous cycle was still running"
    );
    metrics::gauge!("teamcity_exporter_build_info", "version" => env!("CARGO_PKG_VERSION"))
        .set(1.0);

    Ok(RECORDER.get_or_init(|| handle).clone())
}

/// Scrape stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Probe,
    Expand,
    Resolve,
    Fetch,
    Transform,
}

impl Stage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Stage::Probe => "probe",
            Stage::Expand => "expand",
            Stage::Resolve => "resolve",
            Stage::Fetch => "fetch",
            Stage::Transform => "transform",
        }
    }
}

pub fn record_error(instance: &str, stage: Stage) {
    metrics::counter!(
        "teamcity_exporter_errors_total",
        "instance" => instance.to_string(),
        "stage" => stage.as_str()
    )
    .increment(1);
}

pub fn record_cycle(instance: &str) {
    metrics::counter!("teamcity_exporter_cycles_total", "instance" => instance.to_string())
        .increment(1);
}

pub fn record_skipped_cycle(instance: &str) {
    metrics::counter!("teamcity_exporter_cycles_skipped_total", "instance" => instance.to_string())
        .increment(1);
}
