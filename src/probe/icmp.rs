use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{IcmpCode, IcmpPacket, IcmpTypes, checksum};
use pnet::packet::ipv4::Ipv4Packet;
use rand::Rng;

/// ICMP header size (fixed)
pub const ICMP_HEADER_SIZE: usize = 8;
/// Minimum IPv4 header size
pub const IPV4_HEADER_SIZE: usize = 20;
/// Fixed prefix identifying our payloads among unrelated ICMP traffic
pub const PAYLOAD_MARKER: &[u8] = b"mping-probe";
/// Marker plus the 8-byte little-endian send timestamp
pub const PAYLOAD_HEADER_LEN: usize = PAYLOAD_MARKER.len() + 8;
/// Default payload size
pub const DEFAULT_PAYLOAD_SIZE: usize = 64;

/// Get process identifier for ICMP identification field
pub fn get_identifier() -> u16 {
    (std::process::id() & 0xffff) as u16
}

/// Clamp a configured payload size up to what the payload layout needs
pub fn clamp_payload_size(size: usize) -> usize {
    size.max(PAYLOAD_HEADER_LEN)
}

/// Echo payload: `[marker][send timestamp, ns, LE][random filler]`
///
/// Built once per run; the sender re-stamps the timestamp field per round and
/// the receiver compares returned filler against [`ProbePayload::filler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbePayload {
    buf: Vec<u8>,
}

impl ProbePayload {
    /// Build a payload of `size` bytes (clamped) with random filler
    pub fn new(size: usize) -> Self {
        let mut buf = vec![0u8; clamp_payload_size(size)];
        buf[..PAYLOAD_MARKER.len()].copy_from_slice(PAYLOAD_MARKER);
        rand::thread_rng().fill(&mut buf[PAYLOAD_HEADER_LEN..]);
        Self { buf }
    }

    /// Overwrite the send timestamp field
    pub fn stamp(&mut self, timestamp_ns: i64) {
        self.buf[PAYLOAD_MARKER.len()..PAYLOAD_HEADER_LEN]
            .copy_from_slice(&(timestamp_ns as u64).to_le_bytes());
    }

    pub fn filler(&self) -> &[u8] {
        &self.buf[PAYLOAD_HEADER_LEN..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Decode the embedded send timestamp, rejecting short or foreign payloads
pub fn decode_payload_timestamp(payload: &[u8]) -> Option<i64> {
    if payload.len() < PAYLOAD_HEADER_LEN || !payload.starts_with(PAYLOAD_MARKER) {
        return None;
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&payload[PAYLOAD_MARKER.len()..PAYLOAD_HEADER_LEN]);
    Some(u64::from_le_bytes(raw) as i64)
}

/// Build an ICMP Echo Request packet carrying `payload`
pub fn build_echo_request(identifier: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
    let mut buffer = vec![0u8; ICMP_HEADER_SIZE + payload.len()];

    if let Some(mut packet) = MutableEchoRequestPacket::new(&mut buffer) {
        packet.set_icmp_type(IcmpTypes::EchoRequest);
        packet.set_icmp_code(IcmpCode::new(0));
        packet.set_identifier(identifier);
        packet.set_sequence_number(sequence);
        packet.set_payload(payload);
    }

    if let Some(icmp) = IcmpPacket::new(&buffer) {
        let cksum = checksum(&icmp);
        buffer[2..4].copy_from_slice(&cksum.to_be_bytes());
    }

    buffer
}

/// Fields of a received Echo Reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoReply<'a> {
    pub identifier: u16,
    pub sequence: u16,
    pub payload: &'a [u8],
    /// ICMP checksum verified; RAW sockets see packets before the kernel checks it
    pub checksum_valid: bool,
}

/// Parse a received datagram as an ICMP Echo Reply
///
/// RAW IPv4 sockets deliver the IP header; DGRAM sockets do not.
/// Anything that is not structurally an echo reply yields `None`. A bad
/// checksum is reported, not rejected, so corrupted payloads can be counted.
pub fn parse_echo_reply(data: &[u8], is_dgram: bool) -> Option<EchoReply<'_>> {
    let icmp_data = if is_dgram {
        data
    } else {
        if data.len() < IPV4_HEADER_SIZE {
            return None;
        }
        let ip_packet = Ipv4Packet::new(data)?;
        let ip_header_len = (ip_packet.get_header_length() as usize) * 4;
        if ip_header_len < IPV4_HEADER_SIZE || data.len() < ip_header_len {
            return None;
        }
        &data[ip_header_len..]
    };

    if icmp_data.len() < ICMP_HEADER_SIZE {
        return None;
    }
    let icmp_packet = IcmpPacket::new(icmp_data)?;
    if icmp_packet.get_icmp_type() != IcmpTypes::EchoReply {
        return None;
    }

    Some(EchoReply {
        identifier: u16::from_be_bytes([icmp_data[4], icmp_data[5]]),
        sequence: u16::from_be_bytes([icmp_data[6], icmp_data[7]]),
        payload: &icmp_data[ICMP_HEADER_SIZE..],
        checksum_valid: validate_icmp_checksum(icmp_data),
    })
}

/// Validate ICMP checksum (RFC 1071 one's complement sum)
fn validate_icmp_checksum(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }

    let mut sum: u32 = 0;
    let mut i = 0;
    while i + 1 < data.len() {
        sum += u16::from_be_bytes([data[i], data[i + 1]]) as u32;
        i += 2;
    }
    if i < data.len() {
        sum += (data[i] as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    sum == 0xFFFF || sum == 0x0000
}
