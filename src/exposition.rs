//! Prometheus scrape endpoint over the fingerprint store.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use ulid::Ulid;

use crate::status::{Descriptor, StatusMetrics};
use crate::store::{FingerprintStore, MetricSample};

const CONTENT_TYPE_TEXT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Describe-then-collect view of the store for one scrape.
#[derive(Debug)]
pub struct Collector {
    id: Ulid,
    store: FingerprintStore,
    status: StatusMetrics,
    namespace: String,
}

impl Collector {
    pub fn new(store: FingerprintStore, namespace: &str) -> Self {
        Collector {
            id: Ulid::new(),
            store,
            status: StatusMetrics::new(namespace),
            namespace: namespace.to_string(),
        }
    }

    /// Families known before any scrape: the collector identity and the status samples.
    pub fn describe(&self) -> Vec<Descriptor> {
        let mut descriptors = vec![Descriptor {
            name: format!("{}_collector", self.namespace),
            help: format!("collector ID {}", self.id),
            labels: Vec::new(),
        }];
        descriptors.extend(self.status.descriptors());

        descriptors
    }

    /// Every sample currently in the store.
    pub fn collect(&self) -> Vec<MetricSample> {
        self.store.snapshot()
    }

    /// Text exposition of [`Collector::collect`], families and series sorted.
    pub fn render(&self) -> String {
        render(&self.collect())
    }
}

pub fn render(samples: &[MetricSample]) -> String {
    let mut families: BTreeMap<&str, Vec<&MetricSample>> = BTreeMap::new();
    for sample in samples {
        families.entry(sample.name.as_str()).or_default().push(sample);
    }

    let mut out = String::new();
    for (name, mut series) in families {
        series.sort_by(|a, b| {
            a.labels.iter().map(|l| &l.value).cmp(b.labels.iter().map(|l| &l.value))
        });

        // Writing into a String is infallible.
        let _ = writeln!(out, "# HELP {name} {}", escape_help(&series[0].help));
        let _ = writeln!(out, "# TYPE {name} gauge");
        for sample in series {
            out.push_str(name);
            if !sample.labels.is_empty() {
                out.push('{');
                for (i, label) in sample.labels.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, "{}=\"{}\"", label.name, escape_label_value(&label.value));
                }
                out.push('}');
            }
            let _ = writeln!(out, " {}", format_value(sample.value));
        }
    }

    out
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn format_value(value: f64) -> String {
    match value {
        v if v.is_nan() => "NaN".to_string(),
        v if v == f64::INFINITY => "+Inf".to_string(),
        v if v == f64::NEG_INFINITY => "-Inf".to_string(),
        v => v.to_string(),
    }
}

#[derive(Clone)]
pub struct AppState {
    collector: Arc<Collector>,
    handle: PrometheusHandle,
    telemetry_path: Arc<str>,
}

impl AppState {
    pub fn new(collector: Arc<Collector>, handle: PrometheusHandle, telemetry_path: &str) -> Self {
        AppState { collector, handle, telemetry_path: telemetry_path.into() }
    }
}

pub fn router(state: AppState) -> Router {
    let telemetry_path = state.telemetry_path.to_string();
    let router = Router::new().route(&telemetry_path, get(metrics));
    let router = match telemetry_path.as_str() {
        "/" => router,
        _ => router.route("/", get(landing)),
    };

    router.with_state(state)
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = state.collector.render();
    body.push_str(&state.handle.render());

    ([(CONTENT_TYPE, CONTENT_TYPE_TEXT)], body)
}

async fn landing(State(state): State<AppState>) -> Html<String> {
    Html(format!(
        "<html>\n<head><title>Teamcity Exporter</title></head>\n<body>\n<h1>Teamcity Exporter</h1>\n<p><a href='{}'>Metrics</a></p>\n</body>\n</html>\n",
        state.telemetry_path
    ))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use expect_test::expect;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tower::ServiceExt;

    use super::*;
    use crate::store::Label;

    fn sample(name: &str, labels: &[(&'static str, &str)], value: f64) -> MetricSample {
        MetricSample {
            name: name.to_string(),
            help: name.to_string(),
            labels: labels.iter().map(|(k, v)| Label::new(*k, *v)).collect(),
            value,
        }
    }

    fn state(store: FingerprintStore) -> AppState {
        let handle = PrometheusBuilder::new().build_recorder().handle();

        AppState::new(Arc::new(Collector::new(store, "teamcity")), handle, "/metrics")
    }

    #[test]
    fn render_groups_and_sorts_families() {
        let samples = vec![
            sample("teamcity_duration", &[("branch", "main")], 12.5),
            sample("teamcity_build_duration", &[("branch", "main")], 3000.0),
            sample("teamcity_duration", &[("branch", "dev")], 1.0),
        ];

        expect![[r#"
            # HELP teamcity_build_duration teamcity_build_duration
            # TYPE teamcity_build_duration gauge
            teamcity_build_duration{branch="main"} 3000
            # HELP teamcity_duration teamcity_duration
            # TYPE teamcity_duration gauge
            teamcity_duration{branch="dev"} 1
            teamcity_duration{branch="main"} 12.5
        "#]]
        .assert_eq(&render(&samples));
    }

    #[test]
    fn render_escapes_label_values() {
        let samples = vec![sample("m", &[("other", "a \"quoted\"\\path\nline")], 1.0)];

        expect![[r#"
            # HELP m m
            # TYPE m gauge
            m{other="a \"quoted\"\\path\nline"} 1
        "#]]
        .assert_eq(&render(&samples));
    }

    #[test]
    fn render_special_values_and_no_labels() {
        let samples = vec![
            sample("a", &[], f64::NAN),
            sample("b", &[], f64::INFINITY),
            sample("c", &[], f64::NEG_INFINITY),
        ];

        expect![[r#"
            # HELP a a
            # TYPE a gauge
            a NaN
            # HELP b b
            # TYPE b gauge
            b +Inf
            # HELP c c
            # TYPE c gauge
            c -Inf
        "#]]
        .assert_eq(&render(&samples));
    }

    #[test]
    fn describe_starts_with_collector_identity() {
        let collector = Collector::new(FingerprintStore::new(), "teamcity");
        let descriptors = collector.describe();

        assert_eq!(descriptors[0].name, "teamcity_collector");
        assert!(descriptors[0].help.starts_with("collector ID "));
        assert!(descriptors.iter().any(|d| d.name == "teamcity_instance_status"));
    }

    #[test]
    fn collect_reflects_store_writes() {
        let store = FingerprintStore::new();
        let collector = Collector::new(store.clone(), "teamcity");
        assert!(collector.collect().is_empty());

        store.record(sample("teamcity_duration", &[("branch", "main")], 1.0));
        store.record(sample("teamcity_duration", &[("branch", "main")], 2.0));

        let collected = collector.collect();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].value, 2.0);
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_store() {
        let store = FingerprintStore::new();
        store.record(StatusMetrics::new("teamcity").instance_status("main", true));

        let response = router(state(store))
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], CONTENT_TYPE_TEXT);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("teamcity_instance_status{instance=\"main\"} 1\n"), "{body}");
    }

    #[tokio::test]
    async fn landing_page_links_metrics() {
        let response = router(state(FingerprintStore::new()))
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("<a href='/metrics'>Metrics</a>"));
    }
}
