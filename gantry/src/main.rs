use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use log::info;
use tokio::signal;
use tokio::sync::watch;

use gantry::config::Args;
use gantry::monitor::docker::{ContainerRegistry, DockerRegistry};
use gantry::monitor::events;
use gantry::monitor::identity::IdentityResolver;
use gantry::monitor::run_pipeline;
use gantry::monitor::summary::{SummaryOptions, run_summary};
use gantry::storage::Ledger;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let registry = DockerRegistry::connect().context("initializing container runtime client")?;
    let containers = registry
        .list_running()
        .await
        .context("querying the container runtime")?;
    info!("Container runtime reachable, {} running", containers.len());

    let ledger = Ledger::open(&args.database)
        .await
        .with_context(|| format!("opening flow ledger {}", args.database.display()))?;

    let stream = events::attach(&args.bpf_object).context("attaching the connect probe")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let summary = tokio::spawn(run_summary(
        ledger.clone(),
        SummaryOptions {
            interval: std::time::Duration::from_secs(args.summary_interval.max(1)),
            window: args.recent,
            denylist: args.denylist.iter().cloned().collect(),
        },
        shutdown_rx.clone(),
    ));

    let resolver = IdentityResolver::new(registry);
    info!("Waiting for Ctrl-C...");

    let pipeline = run_pipeline(stream, resolver, ledger.clone(), shutdown_rx);
    tokio::pin!(pipeline);

    let stats = loop {
        tokio::select! {
            stats = &mut pipeline => break stats,
            _ = signal::ctrl_c() => {
                info!("Shutting down...");
                let _ = shutdown_tx.send(true);
            }
        }
    };

    // The summary task watches the same flag; flip it for the natural-exit
    // path too.
    let _ = shutdown_tx.send(true);
    let _ = summary.await;

    info!(
        "{} flows appended, {} dropped, {} total in the ledger",
        stats.appended,
        stats.dropped,
        ledger.count().await.unwrap_or_default()
    );
    ledger.close().await;
    info!("Exiting...");

    Ok(())
}
