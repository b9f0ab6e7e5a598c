//! TeamCity exporter: polls TeamCity build statistics per instance and exposes
//! them, plus scrape status samples, for Prometheus.

mod config;
mod exposition;
mod pipeline;
mod scheduler;
mod status;
mod store;
mod teamcity;
mod telemetry;
mod transform;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use config::{Configuration, Instance};
use exposition::{AppState, Collector};
use pipeline::CyclePipeline;
use scheduler::InstanceScheduler;
use store::FingerprintStore;
use teamcity::{BuildService, TeamCityClient};

/// TeamCity exporter: build statistics as Prometheus gauges.
#[derive(Parser, Debug)]
#[command(name = "teamcity-exporter", version)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long = "config", env = "TEAMCITY_EXPORTER_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Address to listen on for the web interface and telemetry
    #[arg(
        long = "web.listen-address",
        env = "TEAMCITY_EXPORTER_LISTEN_ADDRESS",
        default_value = "0.0.0.0:9107"
    )]
    listen_address: String,

    /// Path under which to expose metrics
    #[arg(long = "web.telemetry-path", default_value = "/metrics")]
    telemetry_path: String,

    /// Prefix of every exported TeamCity metric name
    #[arg(long = "metrics.namespace", default_value = "teamcity")]
    namespace: String,

    /// Log level when RUST_LOG does not say otherwise
    #[arg(long = "log.level", default_value = "info")]
    log_level: String,

    /// Do not probe the instances before starting
    #[arg(long = "config.skip-verify")]
    skip_verify: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("teamcity_exporter={}", args.log_level).parse()?),
        )
        .init();

    config::validate_namespace(&args.namespace)?;
    let metrics_handle = telemetry::install_recorder()?;

    let config = Configuration::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    tracing::info!(
        config = %args.config.display(),
        instances = config.instances.len(),
        "configuration loaded"
    );

    let mut clients = Vec::with_capacity(config.instances.len());
    for instance in &config.instances {
        let client = TeamCityClient::new(instance)?;
        if !args.skip_verify {
            verify(instance, &client).await?;
        }
        clients.push(client);
    }

    let store = FingerprintStore::new();
    let collector = Arc::new(Collector::new(store.clone(), &args.namespace));
    for descriptor in collector.describe() {
        tracing::debug!(
            metric = %descriptor.name,
            help = %descriptor.help,
            labels = ?descriptor.labels,
            "metric described"
        );
    }

    let cxl = CancellationToken::new();
    let mut schedulers = JoinSet::new();
    for (instance, client) in config.instances.into_iter().zip(clients) {
        let pipeline = CyclePipeline::new(instance, Arc::new(client), store.clone(), &args.namespace);
        schedulers.spawn(InstanceScheduler::new(pipeline).run(cxl.clone()));
    }

    let listener = tokio::net::TcpListener::bind(&args.listen_address).await?;
    tracing::info!(addr = %args.listen_address, path = %args.telemetry_path, "metrics listening");
    let app = exposition::router(AppState::new(collector, metrics_handle, &args.telemetry_path));

    let shutdown = cxl.clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
                () = shutdown.cancelled() => {}
            }
            shutdown.cancel();
        })
        .await?;

    cxl.cancel();
    while let Some(res) = schedulers.join_next().await {
        if let Err(e) = res {
            tracing::error!(err = %e, "instance scheduler panicked");
        }
    }

    Ok(())
}

async fn verify(instance: &Instance, client: &TeamCityClient) -> Result<()> {
    match tokio::time::timeout(instance.request_timeout(), client.probe()).await {
        Ok(Ok(())) => {
            tracing::info!(instance = %instance.name, url = %instance.url, "instance verified");
            Ok(())
        }
        Ok(Err(e)) => Err(e).with_context(|| format!("verifying instance {}", instance.name)),
        Err(_) => bail!(
            "verifying instance {}: no answer within {:?}",
            instance.name,
            instance.request_timeout()
        ),
    }
}
