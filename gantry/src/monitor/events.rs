use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{Context, anyhow};
use aya::{Ebpf, maps::RingBuf, programs::KProbe};
use aya_log::EbpfLogger;
use gantry_common::{FLOW_EVENT_MAP, RawFlowEvent, TCP_CONNECT_PROGRAM, TCP_CONNECT_SYMBOL};
use log::{debug, warn};
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;

use crate::utils::{dport_from_capture, ipv4_from_capture};

pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// One established-connection event after byte-order normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowEvent {
    pub pid: u32,
    pub saddr: Ipv4Addr,
    pub daddr: Ipv4Addr,
    pub sport: u16,
    pub dport: u16,
    pub proto: u8,
}

/// Consumer half of the event channel. Anything holding the matching
/// `Sender` is an event source; tests feed synthetic events through it.
pub struct EventStream {
    rx: mpsc::Receiver<FlowEvent>,
}

impl EventStream {
    pub fn channel(capacity: usize) -> (mpsc::Sender<FlowEvent>, EventStream) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, EventStream { rx })
    }

    /// `None` once every producer is gone.
    pub async fn recv(&mut self) -> Option<FlowEvent> {
        self.rx.recv().await
    }

    /// Non-blocking variant for the shutdown drain.
    pub fn try_recv(&mut self) -> Option<FlowEvent> {
        self.rx.try_recv().ok()
    }
}

pub fn normalize(raw: &RawFlowEvent) -> FlowEvent {
    FlowEvent {
        pid: raw.pid,
        saddr: ipv4_from_capture(raw.saddr),
        daddr: ipv4_from_capture(raw.daddr),
        // skc_num is already host order at the capture site.
        sport: raw.sport,
        dport: dport_from_capture(raw.dport),
        proto: raw.proto,
    }
}

/// Load the probe object, attach the kprobe and spawn the ring drain task.
/// Dropping the returned stream ends the task, which detaches the probe.
pub fn attach(object: &Path) -> Result<EventStream, anyhow::Error> {
    // BPF maps count against the locked-memory limit on older kernels.
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        debug!("remove limit on locked memory failed, ret is: {}", ret);
    }

    let mut bpf = Ebpf::load_file(object)
        .with_context(|| format!("loading BPF object {}", object.display()))?;

    // aya-log 0.2 spawns its own log-reading task inside `init`.
    if let Err(e) = EbpfLogger::init(&mut bpf) {
        warn!("failed to initialize eBPF logger: {e}");
    }

    let program: &mut KProbe = bpf
        .program_mut(TCP_CONNECT_PROGRAM)
        .ok_or_else(|| anyhow!("program {TCP_CONNECT_PROGRAM} missing from object"))?
        .try_into()?;
    program.load()?;
    program.attach(TCP_CONNECT_SYMBOL, 0)?;

    let ring_buf = RingBuf::try_from(
        bpf.take_map(FLOW_EVENT_MAP)
            .ok_or_else(|| anyhow!("map {FLOW_EVENT_MAP} missing from object"))?,
    )?;
    let mut ring_buf_poll = AsyncFd::new(ring_buf)?;

    let (tx, stream) = EventStream::channel(EVENT_CHANNEL_CAPACITY);

    tokio::spawn(async move {
        // The task owns the handle; dropping it would detach the probe.
        let _keep_bpf_alive = bpf;
        let mut dropped: u64 = 0;

        loop {
            let mut guard = match ring_buf_poll.readable_mut().await {
                Ok(guard) => guard,
                Err(err) => {
                    warn!("Ring buffer poll failed, stopping capture: {err}");
                    return;
                }
            };

            while let Some(item) = guard.get_inner_mut().next() {
                if item.len() < std::mem::size_of::<RawFlowEvent>() {
                    debug!("Skipping short ring item of {} bytes", item.len());
                    continue;
                }
                let raw =
                    unsafe { std::ptr::read_unaligned(item.as_ptr() as *const RawFlowEvent) };
                if i32::from(raw.proto) != libc::IPPROTO_TCP {
                    debug!("Skipping non-TCP item (proto {})", raw.proto);
                    continue;
                }

                match tx.try_send(normalize(&raw)) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        dropped += 1;
                        if dropped % 256 == 1 {
                            warn!("Event channel full, {dropped} events dropped so far");
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!("Event consumer gone, stopping capture");
                        return;
                    }
                }
            }

            guard.clear_ready();
        }
    });

    Ok(stream)
}
