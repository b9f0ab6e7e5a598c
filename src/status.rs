//! Samples the exporter records about its own scraping of each instance.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::store::{Label, MetricSample};

/// Metric family known ahead of any scrape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub name: String,
    pub help: String,
    pub labels: Vec<&'static str>,
}

#[derive(Debug, Clone, Copy)]
enum StatusKind {
    InstanceStatus,
    InstanceLastScrapeFinishTime,
    InstanceLastScrapeDuration,
    FilterLastScrapeFinishTime,
    FilterLastScrapeDuration,
}

impl StatusKind {
    const ALL: [StatusKind; 5] = [
        StatusKind::InstanceStatus,
        StatusKind::InstanceLastScrapeFinishTime,
        StatusKind::InstanceLastScrapeDuration,
        StatusKind::FilterLastScrapeFinishTime,
        StatusKind::FilterLastScrapeDuration,
    ];

    const fn suffix(self) -> &'static str {
        match self {
            StatusKind::InstanceStatus => "instance_status",
            StatusKind::InstanceLastScrapeFinishTime => "instance_last_scrape_finish_time",
            StatusKind::InstanceLastScrapeDuration => "instance_last_scrape_duration",
            StatusKind::FilterLastScrapeFinishTime => "filter_last_scrape_finish_time",
            StatusKind::FilterLastScrapeDuration => "filter_last_scrape_duration",
        }
    }

    const fn help(self) -> &'static str {
        match self {
            StatusKind::InstanceStatus => "Teamcity instance status",
            StatusKind::InstanceLastScrapeFinishTime => "Teamcity instance last scrape finish time",
            StatusKind::InstanceLastScrapeDuration => "Teamcity instance last scrape duration",
            StatusKind::FilterLastScrapeFinishTime => {
                "Teamcity instance filter last scrape finish time"
            }
            StatusKind::FilterLastScrapeDuration => "Teamcity instance filter last scrape duration",
        }
    }

    const fn labels(self) -> &'static [&'static str] {
        match self {
            StatusKind::InstanceStatus
            | StatusKind::InstanceLastScrapeFinishTime
            | StatusKind::InstanceLastScrapeDuration => &["instance"],
            StatusKind::FilterLastScrapeFinishTime | StatusKind::FilterLastScrapeDuration => {
                &["instance", "filter"]
            }
        }
    }
}

/// Builds the per-instance and per-filter status samples under a namespace.
#[derive(Debug, Clone)]
pub struct StatusMetrics {
    namespace: String,
}

impl StatusMetrics {
    pub fn new(namespace: impl Into<String>) -> Self {
        StatusMetrics { namespace: namespace.into() }
    }

    pub fn descriptors(&self) -> Vec<Descriptor> {
        StatusKind::ALL
            .into_iter()
            .map(|kind| Descriptor {
                name: self.name(kind),
                help: kind.help().to_string(),
                labels: kind.labels().to_vec(),
            })
            .collect()
    }

    /// 1 when the instance answered the liveness probe, 0 otherwise.
    pub fn instance_status(&self, instance: &str, up: bool) -> MetricSample {
        self.sample(StatusKind::InstanceStatus, &[instance], if up { 1.0 } else { 0.0 })
    }

    pub fn instance_last_scrape_finish_time(&self, instance: &str, at: SystemTime) -> MetricSample {
        self.sample(StatusKind::InstanceLastScrapeFinishTime, &[instance], unix_seconds(at))
    }

    pub fn instance_last_scrape_duration(&self, instance: &str, took: Duration) -> MetricSample {
        self.sample(StatusKind::InstanceLastScrapeDuration, &[instance], took.as_secs_f64())
    }

    pub fn filter_last_scrape_finish_time(
        &self,
        instance: &str,
        filter: &str,
        at: SystemTime,
    ) -> MetricSample {
        self.sample(StatusKind::FilterLastScrapeFinishTime, &[instance, filter], unix_seconds(at))
    }

    pub fn filter_last_scrape_duration(
        &self,
        instance: &str,
        filter: &str,
        took: Duration,
    ) -> MetricSample {
        self.sample(StatusKind::FilterLastScrapeDuration, &[instance, filter], took.as_secs_f64())
    }

    fn name(&self, kind: StatusKind) -> String {
        format!("{}_{}", self.namespace, kind.suffix())
    }

    fn sample(&self, kind: StatusKind, values: &[&str], value: f64) -> MetricSample {
        MetricSample {
            name: self.name(kind),
            help: kind.help().to_string(),
            labels: kind
                .labels()
                .iter()
                .zip(values)
                .map(|(name, value)| Label::new(*name, *value))
                .collect(),
            value,
        }
    }
}

fn unix_seconds(at: SystemTime) -> f64 {
    at.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}
