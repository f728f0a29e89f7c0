#![no_std]

/// Ring buffer map the probe submits flow events into.
pub const FLOW_EVENT_MAP: &str = "FLOW_EVENTS";

/// Kprobe program the agent looks up in the loaded object.
pub const TCP_CONNECT_PROGRAM: &str = "gantry_tcp_connect";

/// Kernel symbol the program attaches to.
pub const TCP_CONNECT_SYMBOL: &str = "tcp_connect";

/// One established TCP connection, exactly as the probe lays it out.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RawFlowEvent {
    pub pid: u32,
    pub saddr: u32, // capture (network) byte order, read as a native integer
    pub daddr: u32, // capture (network) byte order, read as a native integer
    pub sport: u16, // host order at the capture site (skc_num)
    pub dport: u16, // big-endian
    pub proto: u8,
}
