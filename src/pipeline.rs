//! One scrape cycle of one instance.
//!
//! Four stages connected by channels:
//!
//! ```text
//! filters ─expand─▶ ResolvedLocator ─resolve─▶ ResolvedBuild ─fetch─▶ BuildStatistics ─transform─▶ store
//! ```
//!
//! Every stage spawns one task per unit of work, and each task owns a clone of
//! the stage's output sender. A stage's output channel therefore closes exactly
//! when the last task that could still produce into it has finished, and the
//! next stage drains until it sees that close. Requests to TeamCity from all
//! stages (and all overlapping cycles) share one semaphore sized to the
//! instance's concurrency limit.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{BuildFilter, Instance};
use crate::status::StatusMetrics;
use crate::store::FingerprintStore;
use crate::teamcity::{Build, BuildLocator, BuildService, ServiceError, StatisticsProperty};
use crate::telemetry::{self, Stage};
use crate::transform::{SampleContext, SampleTransformer};

const STAGE_CHANNEL_CAPACITY: usize = 64;

/// Runs scrape cycles for one instance. Cheap to clone.
#[derive(Clone)]
pub struct CyclePipeline {
    inner: Arc<Inner>,
}

struct Inner {
    instance: Instance,
    service: Arc<dyn BuildService>,
    store: FingerprintStore,
    transformer: SampleTransformer,
    status: StatusMetrics,
    permits: Semaphore,
}

/// Outcome of one cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleReport {
    pub samples: usize,
    pub dropped: usize,
    pub duration: Duration,
}

/// Completion marker for one builds filter within one cycle.
///
/// Every unit of work derived from the filter holds a clone; the filter's
/// status samples are written when the last clone is dropped.
struct FilterScope {
    inner: Arc<Inner>,
    name: String,
    started: Instant,
}

impl Drop for FilterScope {
    fn drop(&mut self) {
        let Inner { instance, store, status, .. } = &*self.inner;
        store.record(status.filter_last_scrape_finish_time(
            &instance.name,
            &self.name,
            SystemTime::now(),
        ));
        store.record(status.filter_last_scrape_duration(
            &instance.name,
            &self.name,
            self.started.elapsed(),
        ));
    }
}

/// A concrete (configuration, branch) query derived from a builds filter.
#[derive(Clone)]
pub struct ResolvedLocator {
    scope: Arc<FilterScope>,
    pub locator: BuildLocator,
}

impl ResolvedLocator {
    pub fn instance(&self) -> &str {
        &self.scope.inner.instance.name
    }

    pub fn filter(&self) -> &str {
        &self.scope.name
    }
}

struct ResolvedBuild {
    origin: ResolvedLocator,
    build: Build,
}

struct BuildStatistics {
    source: ResolvedBuild,
    properties: Vec<StatisticsProperty>,
}

impl CyclePipeline {
    pub fn new(
        instance: Instance,
        service: Arc<dyn BuildService>,
        store: FingerprintStore,
        namespace: &str,
    ) -> Self {
        let permits = Semaphore::new(instance.concurrency_limit.max(1));

        CyclePipeline {
            inner: Arc::new(Inner {
                instance,
                service,
                store,
                transformer: SampleTransformer::new(namespace),
                status: StatusMetrics::new(namespace),
                permits,
            }),
        }
    }

    pub fn instance(&self) -> &Instance {
        &self.inner.instance
    }

    /// Liveness and credential check; records the instance status sample.
    pub async fn check_instance(&self) -> Result<(), ServiceError> {
        let inner = &self.inner;
        let result = inner.call(inner.service.probe()).await;
        inner
            .store
            .record(inner.status.instance_status(&inner.instance.name, result.is_ok()));

        result
    }

    /// Run all stages to completion and record the instance's scrape samples.
    pub async fn run_cycle(&self) -> CycleReport {
        let started = Instant::now();
        let (locator_tx, locator_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        let (build_tx, build_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        let (stats_tx, stats_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);

        self.expand_filters(self.inner.instance.effective_filters(), locator_tx);
        let ((), (), (samples, dropped)) = tokio::join!(
            self.resolve_builds(locator_rx, build_tx),
            self.fetch_statistics(build_rx, stats_tx),
            self.store_samples(stats_rx),
        );

        let Inner { instance, store, status, .. } = &*self.inner;
        let duration = started.elapsed();
        store.record(status.instance_last_scrape_finish_time(&instance.name, SystemTime::now()));
        store.record(status.instance_last_scrape_duration(&instance.name, duration));
        debug!(
            instance = %instance.name,
            samples,
            dropped,
            storage_size = store.len(),
            duration = ?duration,
            "Collected metrics for instance"
        );

        CycleReport { samples, dropped, duration }
    }

    /// Spawn one expansion task per filter. Returns immediately; `tx` closes once
    /// every spawned task is done.
    fn expand_filters(&self, filters: Vec<BuildFilter>, tx: mpsc::Sender<ResolvedLocator>) {
        for filter in filters {
            let scope = Arc::new(FilterScope {
                inner: Arc::clone(&self.inner),
                name: filter.name,
                started: Instant::now(),
            });
            tokio::spawn(expand_filter(scope, filter.filter, tx.clone()));
        }
    }

    async fn resolve_builds(
        &self,
        mut rx: mpsc::Receiver<ResolvedLocator>,
        tx: mpsc::Sender<ResolvedBuild>,
    ) {
        while let Some(locator) = rx.recv().await {
            tokio::spawn(resolve(Arc::clone(&self.inner), locator, tx.clone()));
        }
    }

    async fn fetch_statistics(
        &self,
        mut rx: mpsc::Receiver<ResolvedBuild>,
        tx: mpsc::Sender<BuildStatistics>,
    ) {
        while let Some(build) = rx.recv().await {
            tokio::spawn(fetch(Arc::clone(&self.inner), build, tx.clone()));
        }
    }

    /// Transform and store until every fetch task has finished.
    async fn store_samples(&self, mut rx: mpsc::Receiver<BuildStatistics>) -> (usize, usize) {
        let Inner { instance, store, transformer, .. } = &*self.inner;
        let (mut samples, mut dropped) = (0, 0);

        while let Some(BuildStatistics { source, properties }) = rx.recv().await {
            let ResolvedBuild { origin, build } = &source;
            let ctx = SampleContext {
                instance: &instance.name,
                filter: origin.filter(),
                build_configuration: match build.build_type_id.is_empty() {
                    true => origin.locator.build_type().unwrap_or_default(),
                    false => build.build_type_id.as_str(),
                },
                branch: build
                    .branch_name
                    .as_deref()
                    .or(origin.locator.branch())
                    .unwrap_or_default(),
            };

            for property in &properties {
                match transformer.transform(property, &ctx) {
                    Ok(sample) => {
                        store.record(sample);
                        samples += 1;
                    }
                    Err(err) => {
                        warn!(
                            instance = %instance.name,
                            filter = ctx.filter,
                            build_id = build.id,
                            web_url = %build.web_url,
                            err = %err,
                            "dropping statistics property"
                        );
                        telemetry::record_error(&instance.name, Stage::Transform);
                        dropped += 1;
                    }
                }
            }
        }

        (samples, dropped)
    }
}

impl Inner {
    /// Run one TeamCity request under the concurrency limit and request timeout.
    async fn call<T>(
        &self,
        request: impl Future<Output = Result<T, ServiceError>>,
    ) -> Result<T, ServiceError> {
        // The semaphore is never closed.
        let _permit = self.permits.acquire().await.ok();
        let timeout = self.instance.request_timeout();

        tokio::time::timeout(timeout, request)
            .await
            .unwrap_or(Err(ServiceError::Timeout(timeout)))
    }
}

async fn expand_filter(
    scope: Arc<FilterScope>,
    filter: BuildLocator,
    tx: mpsc::Sender<ResolvedLocator>,
) {
    let inner = &scope.inner;
    let build_types = match filter.build_type() {
        Some(build_type) => vec![build_type.to_string()],
        None => match inner.call(inner.service.build_types()).await {
            Ok(build_types) => build_types.into_iter().map(|build_type| build_type.id).collect(),
            Err(err) => {
                warn!(
                    instance = %inner.instance.name,
                    filter = %scope.name,
                    err = %err,
                    "failed to list build configurations, skipping filter"
                );
                telemetry::record_error(&inner.instance.name, Stage::Expand);
                return;
            }
        },
    };

    for build_type in build_types {
        let locator = BuildLocator { build_type: Some(build_type), ..filter.clone() };
        match locator.branch() {
            Some(_) => {
                if !emit(&scope, locator, &tx).await {
                    return;
                }
            }
            None => {
                tokio::spawn(expand_branches(Arc::clone(&scope), locator, tx.clone()));
            }
        }
    }
}

/// Wildcard branch: one locator per branch TeamCity currently knows for the configuration.
async fn expand_branches(
    scope: Arc<FilterScope>,
    locator: BuildLocator,
    tx: mpsc::Sender<ResolvedLocator>,
) {
    let inner = &scope.inner;
    let build_type = locator.build_type().unwrap_or_default();
    let branches = match inner.call(inner.service.branches(build_type)).await {
        Ok(branches) => branches,
        Err(err) => {
            warn!(
                instance = %inner.instance.name,
                filter = %scope.name,
                build_configuration = build_type,
                err = %err,
                "failed to list branches, skipping build configuration"
            );
            telemetry::record_error(&inner.instance.name, Stage::Expand);
            return;
        }
    };

    // No branch information: fall back to the configuration's default branch.
    if branches.is_empty() {
        emit(&scope, locator, &tx).await;
        return;
    }

    for branch in branches {
        let locator = BuildLocator { branch: Some(branch.name), ..locator.clone() };
        if !emit(&scope, locator, &tx).await {
            return;
        }
    }
}

/// Send `locator` downstream unless one of its values would break the locator
/// syntax. Returns `false` once the receiver is gone.
async fn emit(
    scope: &Arc<FilterScope>,
    locator: BuildLocator,
    tx: &mpsc::Sender<ResolvedLocator>,
) -> bool {
    if let Some(value) = locator.reserved_value() {
        warn!(
            instance = %scope.inner.instance.name,
            filter = %scope.name,
            value,
            "value contains a locator delimiter, skipping"
        );
        telemetry::record_error(&scope.inner.instance.name, Stage::Expand);
        return true;
    }

    tx.send(ResolvedLocator { scope: Arc::clone(scope), locator }).await.is_ok()
}

async fn resolve(inner: Arc<Inner>, origin: ResolvedLocator, tx: mpsc::Sender<ResolvedBuild>) {
    let builds = match inner.call(inner.service.builds(&origin.locator)).await {
        Ok(builds) => builds,
        Err(err) => {
            warn!(
                instance = origin.instance(),
                filter = origin.filter(),
                locator = %origin.locator,
                err = %err,
                "failed to resolve builds"
            );
            telemetry::record_error(&inner.instance.name, Stage::Resolve);
            return;
        }
    };
    if builds.is_empty() {
        debug!(
            instance = origin.instance(),
            filter = origin.filter(),
            locator = %origin.locator,
            "no builds match locator"
        );
    }

    for build in builds {
        if tx.send(ResolvedBuild { origin: origin.clone(), build }).await.is_err() {
            return;
        }
    }
}

async fn fetch(inner: Arc<Inner>, source: ResolvedBuild, tx: mpsc::Sender<BuildStatistics>) {
    let properties = match inner.call(inner.service.statistics(source.build.id)).await {
        Ok(properties) => properties,
        Err(err) => {
            warn!(
                instance = source.origin.instance(),
                filter = source.origin.filter(),
                build_id = source.build.id,
                web_url = %source.build.web_url,
                err = %err,
                "failed to fetch build statistics"
            );
            telemetry::record_error(&inner.instance.name, Stage::Fetch);
            return;
        }
    };
    debug!(
        instance = source.origin.instance(),
        filter = source.origin.filter(),
        build_id = source.build.id,
        metrics_collected = properties.len(),
        "fetched build statistics"
    );

    let _ = tx.send(BuildStatistics { source, properties }).await;
}
