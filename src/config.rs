//! Exporter configuration: the TeamCity instances to poll and their builds filters.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use figment::providers::{Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::teamcity::BuildLocator;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("load: {0}")]
    Load(#[from] figment::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub instances: Vec<Instance>,
}

/// One TeamCity server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,

    /// Seconds between scrape cycles.
    pub scrape_interval: u64,

    /// Maximum number of concurrent requests per cycle stage.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,

    /// Seconds before a single TeamCity request is abandoned.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,

    /// What to do when a tick fires while the previous cycle is still running.
    #[serde(default)]
    pub overlap: OverlapPolicy,

    #[serde(default)]
    pub builds_filters: Vec<BuildFilter>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Start a new cycle on every tick.
    #[default]
    Allow,
    /// Skip the tick while a cycle of the same instance is in flight.
    Skip,
}

/// Named query template selecting the builds to report on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFilter {
    pub name: String,
    #[serde(default)]
    pub filter: BuildLocator,
}

impl BuildFilter {
    pub const DEFAULT_NAME: &'static str = "default";

    /// Latest build of every configuration on every branch.
    pub fn catch_all() -> Self {
        BuildFilter { name: Self::DEFAULT_NAME.to_string(), filter: BuildLocator::default() }
    }
}

fn default_concurrency_limit() -> usize {
    10
}

fn default_request_timeout() -> u64 {
    30
}

impl Instance {
    pub fn scrape_interval(&self) -> Duration {
        Duration::from_secs(self.scrape_interval)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// Configured filters, or the catch-all filter when none are configured.
    pub fn effective_filters(&self) -> Vec<BuildFilter> {
        match self.builds_filters.is_empty() {
            true => vec![BuildFilter::catch_all()],
            false => self.builds_filters.clone(),
        }
    }
}

impl Configuration {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        // Figment treats a missing file as an empty one.
        if !path.is_file() {
            return Err(ConfigError::Invalid(format!("{} is not a file", path.display())));
        }

        Self::from_figment(Figment::new().merge(Yaml::file(path)))
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Self::from_figment(Figment::new().merge(Yaml::string(yaml)))
    }

    fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Configuration = figment.extract()?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instances.is_empty() {
            return Err(ConfigError::Invalid("no instances configured".to_string()));
        }

        let mut names = HashSet::new();
        for instance in &self.instances {
            if instance.name.is_empty() {
                return Err(ConfigError::Invalid("instance without a name".to_string()));
            }
            if !names.insert(instance.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate instance {:?}", instance.name)));
            }
            instance.validate()?;
        }

        Ok(())
    }
}

/// Metric name prefix: a letter or `_`, then letters, digits and `_`.
pub fn validate_namespace(namespace: &str) -> Result<(), ConfigError> {
    let mut chars = namespace.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    match valid {
        true => Ok(()),
        false => Err(ConfigError::Invalid(format!(
            "metrics namespace {namespace:?} is not a valid metric name"
        ))),
    }
}

impl Instance {
    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::Invalid(format!("instance {:?}: {reason}", self.name));

        reqwest::Url::parse(&self.url).map_err(|err| invalid(&format!("url: {err}")))?;
        if self.scrape_interval == 0 {
            return Err(invalid("scrape_interval must be positive"));
        }
        if self.request_timeout == 0 {
            return Err(invalid("request_timeout must be positive"));
        }
        if self.concurrency_limit == 0 {
            return Err(invalid("concurrency_limit must be positive"));
        }

        let mut filters = HashSet::new();
        for filter in &self.builds_filters {
            if filter.name.is_empty() {
                return Err(invalid("builds filter without a name"));
            }
            if !filters.insert(filter.name.as_str()) {
                return Err(invalid(&format!("duplicate builds filter {:?}", filter.name)));
            }
            if let Some(value) = filter.filter.reserved_value() {
                return Err(invalid(&format!(
                    "builds filter {:?}: {value:?} contains '(', ')' or ','",
                    filter.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
instances:
  - name: main
    url: https://teamcity.example.com
    username: exporter
    password: secret
    scrape_interval: 60
    builds_filters:
      - name: releases
        filter:
          build_type: Project_Release
          branch: main
          status: SUCCESS
      - name: everything
  - name: legacy
    url: http://legacy.example.com:8111
    scrape_interval: 300
    concurrency_limit: 2
    request_timeout: 5
    overlap: skip
"#;

    #[test]
    fn parse_config() {
        let config = Configuration::from_yaml(CONFIG).unwrap();
        assert_eq!(config.instances.len(), 2);

        let main = &config.instances[0];
        assert_eq!(main.scrape_interval(), Duration::from_secs(60));
        assert_eq!(main.concurrency_limit, 10);
        assert_eq!(main.request_timeout(), Duration::from_secs(30));
        assert_eq!(main.overlap, OverlapPolicy::Allow);
        assert_eq!(main.builds_filters[0].filter.build_type(), Some("Project_Release"));
        assert_eq!(main.builds_filters[0].filter.status.as_deref(), Some("SUCCESS"));
        assert_eq!(main.builds_filters[1].filter, BuildLocator::default());

        let legacy = &config.instances[1];
        assert_eq!(legacy.concurrency_limit, 2);
        assert_eq!(legacy.request_timeout(), Duration::from_secs(5));
        assert_eq!(legacy.overlap, OverlapPolicy::Skip);
        assert_eq!(legacy.effective_filters(), vec![BuildFilter::catch_all()]);
    }

    #[test]
    fn reject_duplicate_filter_names() {
        let yaml = r#"
instances:
  - name: main
    url: https://teamcity.example.com
    scrape_interval: 60
    builds_filters:
      - name: a
      - name: a
"#;
        let err = Configuration::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate builds filter"), "{err}");
    }

    #[test]
    fn reject_duplicate_instance_names() {
        let yaml = r#"
instances:
  - name: main
    url: https://a.example.com
    scrape_interval: 60
  - name: main
    url: https://b.example.com
    scrape_interval: 60
"#;
        let err = Configuration::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate instance"), "{err}");
    }

    #[test]
    fn reject_zero_interval_and_bad_url() {
        let zero = r#"
instances:
  - name: main
    url: https://teamcity.example.com
    scrape_interval: 0
"#;
        assert!(matches!(Configuration::from_yaml(zero), Err(ConfigError::Invalid(_))));

        let bad_url = r#"
instances:
  - name: main
    url: not a url
    scrape_interval: 60
"#;
        assert!(matches!(Configuration::from_yaml(bad_url), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn reject_locator_delimiters_in_filters() {
        let yaml = r#"
instances:
  - name: main
    url: https://teamcity.example.com
    scrape_interval: 60
    builds_filters:
      - name: odd
        filter:
          branch: "fix(auth),v2"
"#;
        let err = Configuration::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("builds filter \"odd\""), "{err}");
    }

    #[test]
    fn namespace_must_be_a_metric_name() {
        assert!(validate_namespace("teamcity").is_ok());
        assert!(validate_namespace("_tc2").is_ok());
        assert!(validate_namespace("team_city").is_ok());

        for bad in ["", "team-city", "2teamcity", "team city", "tc:ns"] {
            assert!(matches!(validate_namespace(bad), Err(ConfigError::Invalid(_))), "{bad:?}");
        }
    }

    #[test]
    fn reject_empty_and_missing_fields() {
        assert!(matches!(Configuration::from_yaml("instances: []"), Err(ConfigError::Invalid(_))));
        assert!(matches!(
            Configuration::from_yaml("instances:\n  - name: main\n"),
            Err(ConfigError::Load(_))
        ));
    }
}
