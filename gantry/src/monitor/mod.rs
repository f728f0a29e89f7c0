pub mod docker;
pub mod events;
pub mod identity;
pub mod summary;

#[cfg(test)]
mod tests;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::watch;

use crate::monitor::docker::ContainerRegistry;
use crate::monitor::events::{EventStream, FlowEvent};
use crate::monitor::identity::IdentityResolver;
use crate::storage::{FlowRecord, Ledger};

/// Counters returned by the pipeline for the exit log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub appended: u64,
    pub dropped: u64,
}

/// Drive events from the stream into the ledger until shutdown flips or the
/// source closes. A failing event is dropped; the loop never stops for one.
pub async fn run_pipeline<R: ContainerRegistry>(
    mut events: EventStream,
    mut resolver: IdentityResolver<R>,
    ledger: Ledger,
    mut shutdown: watch::Receiver<bool>,
) -> PipelineStats {
    let mut stats = PipelineStats::default();
    info!("Attribution pipeline running");

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(event) => handle_event(event, &mut resolver, &ledger, &mut stats).await,
                    None => {
                        info!("Event source closed");
                        break;
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let mut drained = 0;
                    while let Some(event) = events.try_recv() {
                        handle_event(event, &mut resolver, &ledger, &mut stats).await;
                        drained += 1;
                    }
                    debug!("Drained {drained} buffered events on shutdown");
                    break;
                }
            }
        }
    }

    info!(
        "Attribution pipeline stopped: {} appended, {} dropped",
        stats.appended, stats.dropped
    );
    stats
}

async fn handle_event<R: ContainerRegistry>(
    event: FlowEvent,
    resolver: &mut IdentityResolver<R>,
    ledger: &Ledger,
    stats: &mut PipelineStats,
) {
    let container = resolver.resolve(event.pid).await;
    debug!(
        "Connection: pid={} container={} {}:{} -> {}:{}",
        event.pid, container, event.saddr, event.sport, event.daddr, event.dport
    );

    let record = FlowRecord {
        ts: Utc::now(),
        pid: event.pid,
        container,
        saddr: event.saddr.to_string(),
        sport: event.sport,
        daddr: event.daddr.to_string(),
        dport: event.dport,
        proto: event.proto,
    };

    match ledger.append(&record).await {
        Ok(()) => stats.appended += 1,
        Err(err) => {
            stats.dropped += 1;
            warn!(
                "Dropping flow for pid {}: ledger append failed: {}",
                event.pid, err
            );
        }
    }
}
