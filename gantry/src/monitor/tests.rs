use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::watch;

use super::docker::{ContainerMeta, ContainerRegistry};
use super::events::{EventStream, FlowEvent};
use super::identity::{ContainerIdentity, IdentityResolver};
use super::summary::{SummaryOptions, build_frame, run_summary};
use super::{PipelineStats, run_pipeline};
use crate::storage::{FlowRecord, Ledger};

pub(crate) fn meta(id: &str, name: &str) -> ContainerMeta {
    ContainerMeta {
        id: id.to_string(),
        name: name.to_string(),
    }
}

pub(crate) struct StaticRegistry(pub Vec<ContainerMeta>);

impl ContainerRegistry for StaticRegistry {
    async fn list_running(&self) -> Result<Vec<ContainerMeta>, anyhow::Error> {
        Ok(self.0.clone())
    }
}

pub(crate) struct FailingRegistry;

impl ContainerRegistry for FailingRegistry {
    async fn list_running(&self) -> Result<Vec<ContainerMeta>, anyhow::Error> {
        Err(anyhow::anyhow!("registry unreachable"))
    }
}

pub(crate) struct CountingRegistry {
    containers: Vec<ContainerMeta>,
    calls: Arc<AtomicUsize>,
}

impl CountingRegistry {
    pub(crate) fn new(containers: Vec<ContainerMeta>) -> Self {
        Self {
            containers,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub(crate) fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl ContainerRegistry for CountingRegistry {
    async fn list_running(&self) -> Result<Vec<ContainerMeta>, anyhow::Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.containers.clone())
    }
}

pub(crate) fn write_cgroup(root: &Path, pid: u32, contents: &str) {
    let dir = root.join(pid.to_string());
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("cgroup"), contents).unwrap();
}

fn event(pid: u32, sport: u16, dport: u16) -> FlowEvent {
    FlowEvent {
        pid,
        saddr: "10.0.2.15".parse().unwrap(),
        daddr: "93.184.216.34".parse().unwrap(),
        sport,
        dport,
        proto: 6,
    }
}

async fn setup_ledger() -> (tempfile::TempDir, Ledger) {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Ledger::open(&dir.path().join("flows.db")).await.unwrap();
    (dir, ledger)
}

async fn append_record(ledger: &Ledger, pid: u32, container: ContainerIdentity) {
    let record = FlowRecord {
        ts: chrono::Utc::now(),
        pid,
        container,
        saddr: "10.0.2.15".to_string(),
        sport: 5000,
        daddr: "93.184.216.34".to_string(),
        dport: 443,
        proto: 6,
    };
    ledger.append(&record).await.unwrap();
}

#[tokio::test]
async fn test_scope_attributed_flow_reaches_ledger() {
    let (_db_dir, ledger) = setup_ledger().await;
    let proc_dir = tempfile::tempdir().unwrap();
    write_cgroup(proc_dir.path(), 4242, "0::/system.slice/docker-abc123.scope\n");

    let registry = StaticRegistry(vec![meta("abc123def456", "web1")]);
    let resolver = IdentityResolver::with_proc_root(registry, proc_dir.path());
    let (tx, stream) = EventStream::channel(8);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    tx.send(event(4242, 5000, 443)).await.unwrap();
    drop(tx);

    let stats = run_pipeline(stream, resolver, ledger.clone(), shutdown_rx).await;
    assert_eq!(
        stats,
        PipelineStats {
            appended: 1,
            dropped: 0
        }
    );

    let rows = ledger.recent(10).await.unwrap();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.container, ContainerIdentity::Named("web1".to_string()));
    assert_eq!(row.pid, 4242);
    assert_eq!(row.saddr, "10.0.2.15");
    assert_eq!(row.sport, 5000);
    assert_eq!(row.daddr, "93.184.216.34");
    assert_eq!(row.dport, 443);
    assert_eq!(row.proto, 6);
}

#[tokio::test]
async fn test_unresolvable_pid_recorded_as_host() {
    let (_db_dir, ledger) = setup_ledger().await;
    let proc_dir = tempfile::tempdir().unwrap();
    // No cgroup file for this pid.

    let resolver = IdentityResolver::with_proc_root(StaticRegistry(vec![]), proc_dir.path());
    let (tx, stream) = EventStream::channel(8);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    tx.send(event(9999, 40000, 80)).await.unwrap();
    drop(tx);

    let stats = run_pipeline(stream, resolver, ledger.clone(), shutdown_rx).await;
    assert_eq!(stats.appended, 1);

    let rows = ledger.recent(1).await.unwrap();
    assert_eq!(rows[0].container, ContainerIdentity::Host);
}

#[tokio::test]
async fn test_shutdown_drains_buffered_events() {
    let (_db_dir, ledger) = setup_ledger().await;
    let proc_dir = tempfile::tempdir().unwrap();

    let resolver = IdentityResolver::with_proc_root(StaticRegistry(vec![]), proc_dir.path());
    let (tx, stream) = EventStream::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    for pid in 1..=5 {
        tx.send(event(pid, 40000, 80)).await.unwrap();
    }
    shutdown_tx.send(true).unwrap();

    let stats = run_pipeline(stream, resolver, ledger.clone(), shutdown_rx).await;
    assert_eq!(stats.appended, 5);
    assert_eq!(ledger.count().await.unwrap(), 5);
}

#[tokio::test]
async fn test_summary_task_stops_on_shutdown() {
    let (_db_dir, ledger) = setup_ledger().await;
    let options = SummaryOptions {
        interval: Duration::from_secs(3600),
        window: 10,
        denylist: HashSet::new(),
    };
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(run_summary(ledger, options, shutdown_rx));
    shutdown_tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("summary task should stop once shutdown flips")
        .unwrap();
}

#[tokio::test]
async fn test_frame_reflects_persisted_window() {
    let (_db_dir, ledger) = setup_ledger().await;

    for pid in 0..3 {
        append_record(&ledger, pid, ContainerIdentity::Named("web1".to_string())).await;
    }
    append_record(&ledger, 7, ContainerIdentity::Named("busybox2".to_string())).await;
    append_record(&ledger, 8, ContainerIdentity::Host).await;

    let records = ledger.recent(50).await.unwrap();
    let denylist = HashSet::from(["busybox2".to_string()]);
    let frame = build_frame(&records, &denylist);

    assert_eq!(frame.window, 5);
    assert_eq!(frame.containers.len(), 2);
    assert_eq!(frame.containers["web1"].count, 3);
    assert!(!frame.containers["web1"].anomalous);
    assert_eq!(frame.containers["busybox2"].count, 1);
    assert!(frame.containers["busybox2"].anomalous);
}

#[tokio::test]
async fn test_empty_ledger_yields_empty_frame() {
    let (_db_dir, ledger) = setup_ledger().await;
    let records = ledger.recent(200).await.unwrap();
    let frame = build_frame(&records, &HashSet::new());
    assert!(frame.is_empty());
    assert_eq!(frame.window, 0);
}
