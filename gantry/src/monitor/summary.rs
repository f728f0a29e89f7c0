use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::monitor::identity::ContainerIdentity;
use crate::storage::{FlowRecord, Ledger};

pub struct SummaryOptions {
    pub interval: Duration,
    pub window: u32,
    pub denylist: HashSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ContainerActivity {
    pub count: u64,
    pub anomalous: bool,
}

/// One emission of the aggregation view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummaryFrame {
    pub generated_at: DateTime<Utc>,
    pub window: usize,
    pub containers: BTreeMap<String, ContainerActivity>,
}

impl SummaryFrame {
    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}

/// Group a window of records by container name. `host` rows never enter the
/// grouped set; denylisted names are flagged with their counts untouched.
pub fn build_frame(records: &[FlowRecord], denylist: &HashSet<String>) -> SummaryFrame {
    let mut containers: BTreeMap<String, ContainerActivity> = BTreeMap::new();
    for record in records {
        let ContainerIdentity::Named(name) = &record.container else {
            continue;
        };
        containers
            .entry(name.clone())
            .or_insert(ContainerActivity {
                count: 0,
                anomalous: denylist.contains(name),
            })
            .count += 1;
    }

    SummaryFrame {
        generated_at: Utc::now(),
        window: records.len(),
        containers,
    }
}

pub async fn run_summary(
    ledger: Ledger,
    options: SummaryOptions,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(options.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Summary view stopped");
                    return;
                }
                continue;
            }
        }

        let records = match ledger.recent(options.window).await {
            Ok(records) => records,
            Err(err) => {
                warn!("Summary poll failed, keeping schedule: {err}");
                continue;
            }
        };

        let frame = build_frame(&records, &options.denylist);
        if frame.is_empty() {
            info!("No container flows recorded yet");
            continue;
        }

        match serde_json::to_string(&frame) {
            Ok(json) => info!("flow summary {json}"),
            Err(err) => warn!("Could not serialize summary frame: {err}"),
        }
        for (name, activity) in &frame.containers {
            if activity.anomalous {
                warn!(
                    "Denylisted container {} has {} flows in the last {} records",
                    name, activity.count, frame.window
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named_record(name: &str) -> FlowRecord {
        FlowRecord {
            ts: Utc::now(),
            pid: 1,
            container: ContainerIdentity::Named(name.to_string()),
            saddr: "10.0.2.15".to_string(),
            sport: 5000,
            daddr: "93.184.216.34".to_string(),
            dport: 443,
            proto: 6,
        }
    }

    fn host_record() -> FlowRecord {
        FlowRecord {
            container: ContainerIdentity::Host,
            ..named_record("unused")
        }
    }

    #[test]
    fn test_denylist_flags_without_touching_counts() {
        let mut records = Vec::new();
        for _ in 0..10 {
            records.push(named_record("web1"));
        }
        for _ in 0..5 {
            records.push(named_record("busybox2"));
        }
        let denylist = HashSet::from(["busybox2".to_string()]);

        let frame = build_frame(&records, &denylist);

        assert_eq!(frame.window, 15);
        let web1 = frame.containers["web1"];
        assert_eq!((web1.count, web1.anomalous), (10, false));
        let busy = frame.containers["busybox2"];
        assert_eq!((busy.count, busy.anomalous), (5, true));
    }

    #[test]
    fn test_host_rows_stay_out_of_the_frame() {
        let records = vec![host_record(), named_record("web1"), host_record()];
        // Even a denylisted "host" must not show up as a container.
        let denylist = HashSet::from(["host".to_string()]);

        let frame = build_frame(&records, &denylist);

        assert_eq!(frame.window, 3);
        assert_eq!(frame.containers.len(), 1);
        assert!(frame.containers.contains_key("web1"));
    }

    #[test]
    fn test_empty_window_is_an_explicit_empty_frame() {
        let frame = build_frame(&[], &HashSet::new());
        assert!(frame.is_empty());
        assert_eq!(frame.window, 0);
    }

    #[test]
    fn test_frame_serializes_to_json() {
        let frame = build_frame(&[named_record("web1")], &HashSet::new());
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"web1\""));
        assert!(json.contains("\"count\":1"));
        assert!(json.contains("\"anomalous\":false"));
    }
}
