use std::net::Ipv4Addr;

/// Render a capture-order IPv4 address, low byte first.
pub fn ipv4_from_capture(raw: u32) -> Ipv4Addr {
    Ipv4Addr::from(raw.to_le_bytes())
}

/// Destination ports are captured big-endian.
pub fn dport_from_capture(raw: u16) -> u16 {
    u16::from_be(raw)
}
