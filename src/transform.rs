//! Build statistics property → labeled gauge sample.

use std::num::ParseFloatError;

use thiserror::Error;

use crate::store::{Label, MetricSample};
use crate::teamcity::StatisticsProperty;

#[derive(Debug, Error, PartialEq)]
pub enum TransformError {
    #[error("property {name:?} has no metric name")]
    EmptyName { name: String },
    #[error("property {name:?} has non-numeric value {value:?}: {source}")]
    InvalidValue { name: String, value: String, source: ParseFloatError },
}

/// Where a statistics property came from.
#[derive(Debug, Clone, Copy)]
pub struct SampleContext<'a> {
    pub instance: &'a str,
    pub filter: &'a str,
    pub build_configuration: &'a str,
    pub branch: &'a str,
}

/// Converts statistics properties into namespaced gauge samples.
#[derive(Debug, Clone)]
pub struct SampleTransformer {
    namespace: String,
}

impl SampleTransformer {
    pub fn new(namespace: impl Into<String>) -> Self {
        SampleTransformer { namespace: namespace.into() }
    }

    /// `metricName:other` with value `"12.5"` becomes
    /// `{namespace}_metric_name{..., other="other"} 12.5`.
    pub fn transform(
        &self,
        property: &StatisticsProperty,
        ctx: &SampleContext<'_>,
    ) -> Result<MetricSample, TransformError> {
        let (base, other) = split_metric_title(&property.name);
        let base = sanitize(&to_snake_case(base));
        if base.is_empty() {
            return Err(TransformError::EmptyName { name: property.name.clone() });
        }

        let value = property.value.trim().parse::<f64>().map_err(|source| {
            TransformError::InvalidValue {
                name: property.name.clone(),
                value: property.value.clone(),
                source,
            }
        })?;

        let mut labels = vec![
            Label::new("exporter_instance", ctx.instance),
            Label::new("exporter_filter", ctx.filter),
            Label::new("build_configuration", ctx.build_configuration),
            Label::new("branch", ctx.branch),
        ];
        if let Some(other) = other {
            labels.push(Label::new("other", other));
        }

        Ok(MetricSample {
            name: format!("{}_{base}", self.namespace),
            help: format!("TeamCity build statistic {base}"),
            labels,
            value,
        })
    }
}

/// Split `name:other` on the first colon. An empty `other` is no label at all.
pub fn split_metric_title(title: &str) -> (&str, Option<&str>) {
    match title.split_once(':') {
        Some((base, "")) => (base, None),
        Some((base, other)) => (base, Some(other)),
        None => (title, None),
    }
}

/// `QueuedTime` → `queued_time`, `buildNumber` → `build_number`, `ABTest` → `ab_test`.
///
/// A word is an uppercase letter followed by non-uppercase characters; a run of
/// uppercase letters directly before such a word is kept together as one word.
pub fn to_snake_case(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut words: Vec<String> = Vec::new();

    let mut i = chars.iter().take_while(|c| !c.is_ascii_uppercase()).count();
    if i > 0 {
        words.push(chars[..i].iter().collect());
    }

    while i < chars.len() {
        let upper_start = i;
        while i < chars.len() && chars[i].is_ascii_uppercase() {
            i += 1;
        }
        let upper_end = i;
        while i < chars.len() && !chars[i].is_ascii_uppercase() {
            i += 1;
        }

        // The last capital of a run belongs to the word that follows it.
        if i > upper_end && upper_end - upper_start > 1 {
            words.push(chars[upper_start..upper_end - 1].iter().collect());
            words.push(chars[upper_end - 1..i].iter().collect());
        } else {
            words.push(chars[upper_start..i].iter().collect());
        }
    }

    words.join("_").to_lowercase()
}

/// Replace characters Prometheus does not allow in metric names.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c.is_ascii_alphanumeric() || c == '_' {
            true => c,
            false => '_',
        })
        .collect()
}
