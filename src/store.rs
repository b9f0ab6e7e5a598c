//! Latest-sample store shared by every instance scheduler and the exposition endpoint.

use std::sync::Arc;

use dashmap::DashMap;
use xxhash_rust::xxh3::Xxh3;

/// Separator fed to the hasher between fields. Never valid inside UTF-8, so two
/// different (name, values) tuples can't concatenate to the same byte stream.
const FIELD_SEPARATOR: [u8; 1] = [0xff];

/// Deterministic hash over a metric name and its ordered label values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(u64);

impl Fingerprint {
    pub fn new<'a>(name: &str, label_values: impl IntoIterator<Item = &'a str>) -> Self {
        let mut hasher = Xxh3::new();
        hasher.update(name.as_bytes());
        for value in label_values {
            hasher.update(&FIELD_SEPARATOR);
            hasher.update(value.as_bytes());
        }

        Fingerprint(hasher.digest())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Label {
    pub name: &'static str,
    pub value: String,
}

impl Label {
    pub fn new(name: &'static str, value: impl Into<String>) -> Self {
        Label { name, value: value.into() }
    }
}

/// One gauge value with its identifying name and labels.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub help: String,
    pub labels: Vec<Label>,
    pub value: f64,
}

impl MetricSample {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new(&self.name, self.labels.iter().map(|label| label.value.as_str()))
    }
}

/// Concurrent map from fingerprint to the most recent sample.
///
/// Cloning is cheap and every clone refers to the same entries. Writers only
/// contend on the shard holding their key, and [`FingerprintStore::snapshot`]
/// walks shards one at a time, so a reader never holds the whole map.
///
/// Entries are never evicted; series for build configurations that disappear
/// stay at their last value until the process restarts.
#[derive(Debug, Clone, Default)]
pub struct FingerprintStore {
    entries: Arc<DashMap<Fingerprint, MetricSample>>,
}

impl FingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the sample under `fingerprint`.
    pub fn set(&self, fingerprint: Fingerprint, sample: MetricSample) {
        self.entries.insert(fingerprint, sample);
    }

    /// Insert or overwrite `sample` under its own fingerprint.
    pub fn record(&self, sample: MetricSample) {
        self.set(sample.fingerprint(), sample);
    }

    /// Eventually consistent copy of every entry.
    pub fn snapshot(&self) -> Vec<MetricSample> {
        self.entries.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<MetricSample> {
        self.entries.get(fingerprint).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
