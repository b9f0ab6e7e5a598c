//! Per-instance timer loop driving scrape cycles.

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument};
use ulid::Ulid;

use crate::config::OverlapPolicy;
use crate::pipeline::CyclePipeline;
use crate::telemetry::{self, Stage};

/// Starts one cycle per tick of the instance's scrape interval.
///
/// The first tick fires immediately. With [`OverlapPolicy::Allow`] a tick
/// starts a cycle even if earlier cycles are still running.
pub struct InstanceScheduler {
    pipeline: CyclePipeline,
    cycles: TaskTracker,
}

impl InstanceScheduler {
    pub fn new(pipeline: CyclePipeline) -> Self {
        InstanceScheduler { pipeline, cycles: TaskTracker::new() }
    }

    /// Tick until `cxl` is cancelled, then wait for in-flight cycles.
    pub async fn run(self, cxl: CancellationToken) {
        let instance = self.pipeline.instance();
        let mut interval = tokio::time::interval(instance.scrape_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            instance = %instance.name,
            scrape_interval = ?instance.scrape_interval(),
            filters = instance.builds_filters.len(),
            overlap = ?instance.overlap,
            "starting instance scheduler"
        );

        loop {
            tokio::select! {
                biased;

                () = cxl.cancelled() => break,
                _ = interval.tick() => self.tick(),
            }
        }

        self.cycles.close();
        self.cycles.wait().await;
        debug!(instance = %instance.name, "instance scheduler stopped");
    }

    fn tick(&self) {
        let instance = self.pipeline.instance();
        if instance.overlap == OverlapPolicy::Skip && !self.cycles.is_empty() {
            warn!(
                instance = %instance.name,
                in_flight = self.cycles.len(),
                "previous cycle still running, skipping tick"
            );
            telemetry::record_skipped_cycle(&instance.name);
            return;
        }

        let span = tracing::debug_span!("cycle", instance = %instance.name, cycle_id = %Ulid::new());
        self.cycles.spawn(scrape(self.pipeline.clone()).instrument(span));
    }
}

async fn scrape(pipeline: CyclePipeline) {
    let instance = &pipeline.instance().name;
    telemetry::record_cycle(instance);
    debug!("starting metrics collection");

    if let Err(err) = pipeline.check_instance().await {
        warn!(instance = %instance, err = %err, "instance check failed, skipping cycle");
        telemetry::record_error(instance, Stage::Probe);
        return;
    }

    pipeline.run_cycle().await;
}
