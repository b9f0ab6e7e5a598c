//! TeamCity REST API: the four queries the pipeline needs plus the liveness probe.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Instance;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Build search constraints, as written in the `filter` block of a builds filter.
///
/// Empty strings are treated the same as absent values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildLocator {
    #[serde(default)]
    pub build_type: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub running: Option<bool>,
    #[serde(default)]
    pub canceled: Option<bool>,
    #[serde(default)]
    pub count: Option<u32>,
}

/// Characters that end or nest a dimension inside `buildType:(id:..)` and `branch:(name:..)`.
const RESERVED: [char; 3] = ['(', ')', ','];

impl BuildLocator {
    pub const DEFAULT_COUNT: u32 = 1;

    /// The first configuration or branch value that cannot be written into a
    /// locator without changing its structure.
    pub fn reserved_value(&self) -> Option<&str> {
        [self.build_type(), self.branch()]
            .into_iter()
            .flatten()
            .find(|value| value.contains(&RESERVED[..]))
    }

    pub fn build_type(&self) -> Option<&str> {
        self.build_type.as_deref().filter(|s| !s.is_empty())
    }

    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref().filter(|s| !s.is_empty())
    }

    pub fn count(&self) -> u32 {
        self.count.unwrap_or(Self::DEFAULT_COUNT)
    }

    /// Set constraints as `(key, value)` pairs, in TeamCity locator order.
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = Vec::with_capacity(6);
        if let Some(build_type) = self.build_type() {
            fields.push(("buildType", build_type.to_string()));
        }
        if let Some(branch) = self.branch() {
            fields.push(("branch", branch.to_string()));
        }
        if let Some(status) = self.status.as_deref().filter(|s| !s.is_empty()) {
            fields.push(("status", status.to_string()));
        }
        if let Some(running) = self.running {
            fields.push(("running", running.to_string()));
        }
        if let Some(canceled) = self.canceled {
            fields.push(("canceled", canceled.to_string()));
        }
        fields.push(("count", self.count().to_string()));

        fields
    }
}

/// Renders the TeamCity locator string, e.g. `buildType:(id:X),branch:(name:main),count:1`.
impl fmt::Display for BuildLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.fields().into_iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match key {
                "buildType" => write!(f, "buildType:(id:{value})")?,
                "branch" => write!(f, "branch:(name:{value})")?,
                _ => write!(f, "{key}:{value}")?,
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BuildType {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Branch {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    pub id: i64,
    #[serde(default)]
    pub build_type_id: String,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub web_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StatisticsProperty {
    pub name: String,
    pub value: String,
}

impl StatisticsProperty {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        StatisticsProperty { name: name.into(), value: value.into() }
    }
}

#[derive(Debug, Deserialize)]
struct BuildTypes {
    #[serde(default, rename = "buildType")]
    build_type: Vec<BuildType>,
}

#[derive(Debug, Deserialize)]
struct Branches {
    #[serde(default)]
    branch: Vec<Branch>,
}

#[derive(Debug, Deserialize)]
struct Builds {
    #[serde(default)]
    build: Vec<Build>,
}

#[derive(Debug, Deserialize)]
struct Properties {
    #[serde(default)]
    property: Vec<StatisticsProperty>,
}

/// The operations the scrape pipeline performs against a build server.
#[async_trait]
pub trait BuildService: Send + Sync {
    /// Connectivity and credential check.
    async fn probe(&self) -> Result<(), ServiceError>;

    async fn build_types(&self) -> Result<Vec<BuildType>, ServiceError>;

    async fn branches(&self, build_type: &str) -> Result<Vec<Branch>, ServiceError>;

    async fn builds(&self, locator: &BuildLocator) -> Result<Vec<Build>, ServiceError>;

    async fn statistics(&self, build_id: i64) -> Result<Vec<StatisticsProperty>, ServiceError>;
}

/// [`BuildService`] backed by the TeamCity REST API with HTTP Basic auth.
#[derive(Debug, Clone)]
pub struct TeamCityClient {
    http: reqwest::Client,
    url: String,
    username: String,
    password: String,
}

impl TeamCityClient {
    pub fn new(instance: &Instance) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("teamcity-exporter/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(TeamCityClient {
            http,
            url: instance.url.trim_end_matches('/').to_string(),
            username: instance.username.clone(),
            password: instance.password.clone(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ServiceError> {
        let url = format!("{}/httpAuth/app/rest/{path}", self.url);
        let response = self
            .http
            .get(&url)
            .query(query)
            .basic_auth(&self.username, Some(&self.password))
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED => Err(ServiceError::Unauthorized),
            status if !status.is_success() => {
                Err(ServiceError::Status { status: status.as_u16(), url })
            }
            _ => Ok(response.json().await?),
        }
    }
}

#[async_trait]
impl BuildService for TeamCityClient {
    async fn probe(&self) -> Result<(), ServiceError> {
        let response = self.http.get(&self.url).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(());
        }

        // Guest access is off; retry once with credentials.
        let response = self
            .http
            .get(&self.url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        match response.status() {
            StatusCode::UNAUTHORIZED => Err(ServiceError::Unauthorized),
            _ => Ok(()),
        }
    }

    async fn build_types(&self) -> Result<Vec<BuildType>, ServiceError> {
        let BuildTypes { build_type } = self.get_json("buildTypes", &[]).await?;

        Ok(build_type)
    }

    async fn branches(&self, build_type: &str) -> Result<Vec<Branch>, ServiceError> {
        let Branches { branch } = self
            .get_json(
                &format!("buildTypes/id:{build_type}/branches"),
                &[("locator", "policy:ALL_BRANCHES".to_string())],
            )
            .await?;

        Ok(branch)
    }

    async fn builds(&self, locator: &BuildLocator) -> Result<Vec<Build>, ServiceError> {
        let Builds { build } = self.get_json("builds", &[("locator", locator.to_string())]).await?;

        Ok(build)
    }

    async fn statistics(&self, build_id: i64) -> Result<Vec<StatisticsProperty>, ServiceError> {
        let Properties { property } =
            self.get_json(&format!("builds/id:{build_id}/statistics"), &[]).await?;

        Ok(property)
    }
}


#[cfg(test)]
mod tests {
    use expect_test::expect;

    use super::*;

    #[test]
    fn locator_renders_set_fields_only() {
        let locator = BuildLocator {
            build_type: Some("Project_Release".to_string()),
            branch: Some("main".to_string()),
            status: Some("SUCCESS".to_string()),
            running: Some(false),
            canceled: None,
            count: None,
        };

        expect!["buildType:(id:Project_Release),branch:(name:main),status:SUCCESS,running:false,count:1"]
            .assert_eq(&locator.to_string());
    }

    #[test]
    fn locator_treats_empty_as_unset() {
        let locator = BuildLocator {
            build_type: Some(String::new()),
            branch: Some(String::new()),
            count: Some(3),
            ..BuildLocator::default()
        };

        assert_eq!(locator.build_type(), None);
        assert_eq!(locator.branch(), None);
        assert_eq!(locator.fields(), vec![("count", "3".to_string())]);
    }

    #[test]
    fn locator_reserved_values() {
        let locator = |branch: &str| BuildLocator {
            build_type: Some("Project_Release".to_string()),
            branch: Some(branch.to_string()),
            ..BuildLocator::default()
        };

        assert_eq!(locator("feature/login-form").reserved_value(), None);
        assert_eq!(locator("fix(auth)").reserved_value(), Some("fix(auth)"));
        assert_eq!(locator("a,b").reserved_value(), Some("a,b"));
        assert_eq!(
            BuildLocator { build_type: Some("X)".to_string()), ..BuildLocator::default() }
                .reserved_value(),
            Some("X)")
        );
    }

    #[test]
    fn decode_builds_payload() {
        let payload = r#"{
            "count": 1,
            "href": "/app/rest/builds?locator=count:1",
            "build": [{
                "id": 4211,
                "buildTypeId": "Project_Release",
                "number": "57",
                "status": "SUCCESS",
                "state": "finished",
                "branchName": "main",
                "defaultBranch": true,
                "webUrl": "https://teamcity.test/viewLog.html?buildId=4211"
            }]
        }"#;

        let Builds { build } = serde_json::from_str(payload).unwrap();
        assert_eq!(
            build,
            vec![Build {
                id: 4211,
                build_type_id: "Project_Release".to_string(),
                branch_name: Some("main".to_string()),
                web_url: "https://teamcity.test/viewLog.html?buildId=4211".to_string(),
            }]
        );
    }

    #[test]
    fn decode_empty_payloads() {
        let Builds { build } = serde_json::from_str(r#"{"count":0}"#).unwrap();
        let Properties { property } = serde_json::from_str(r#"{"count":0}"#).unwrap();
        let BuildTypes { build_type } = serde_json::from_str(r#"{"count":0}"#).unwrap();

        assert!(build.is_empty());
        assert!(property.is_empty());
        assert!(build_type.is_empty());
    }

    #[test]
    fn decode_statistics_payload() {
        let payload = r#"{"count":2,"property":[
            {"name":"BuildDuration","value":"12345"},
            {"name":"buildStageDuration:firstStepPreparation","value":"12.5"}
        ]}"#;

        let Properties { property } = serde_json::from_str(payload).unwrap();
        assert_eq!(
            property,
            vec![
                StatisticsProperty::new("BuildDuration", "12345"),
                StatisticsProperty::new("buildStageDuration:firstStepPreparation", "12.5"),
            ]
        );
    }
}
