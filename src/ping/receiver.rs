use anyhow::Result;
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::probe::{PAYLOAD_HEADER_LEN, ProbeSocket, decode_payload_timestamp, parse_echo_reply};
use crate::state::{BucketKey, ProbeResult, Session, bucket_key};

/// Maximum consecutive errors before stopping the receiver
const MAX_CONSECUTIVE_ERRORS: u32 = 50;

/// Large enough for any IPv4 datagram
const RECV_BUFFER_SIZE: usize = 65536;

/// Match a received datagram against this session's probes
///
/// Returns the bucket the reply belongs to (from its embedded send time) and
/// the reply record. Foreign or malformed packets yield `None`.
pub fn match_reply(
    session: &Session,
    source: Ipv4Addr,
    data: &[u8],
    is_dgram: bool,
    rx_ns: i64,
) -> Option<(BucketKey, ProbeResult)> {
    if !session.is_target(&source) {
        return None;
    }

    let reply = parse_echo_reply(data, is_dgram)?;
    // DGRAM sockets have the kernel rewrite and demultiplex the identifier
    if !is_dgram && reply.identifier != session.identifier {
        return None;
    }

    // A failed checksum is corruption in flight; only the bitflip check wants it
    if !reply.checksum_valid && !session.config.bitflip_check {
        return None;
    }

    let tx_ns = decode_payload_timestamp(reply.payload)?;
    let bitflip = session.config.bitflip_check
        && (!reply.checksum_valid
            || filler_differs(&reply.payload[PAYLOAD_HEADER_LEN..], session.payload().filler()));

    let result = ProbeResult::reply(source, reply.sequence, tx_ns, rx_ns, bitflip);
    Some((bucket_key(tx_ns), result))
}

/// True if returned filler is not byte-for-byte what was sent
fn filler_differs(returned: &[u8], sent: &[u8]) -> bool {
    returned != sent
}

/// The receiver reads echo replies and merges them into the session's buckets
pub struct Receiver {
    session: Arc<Session>,
    socket: Arc<ProbeSocket>,
    cancel: CancellationToken,
    consecutive_errors: u32,
}

impl Receiver {
    pub fn new(session: Arc<Session>, socket: Arc<ProbeSocket>, cancel: CancellationToken) -> Self {
        Self {
            session,
            socket,
            cancel,
            consecutive_errors: 0,
        }
    }

    /// Run the receiver on a dedicated thread (blocking I/O)
    ///
    /// Each read is bounded by the socket's read timeout, so cancellation is
    /// observed within one timeout. Returns the number of matched replies.
    pub fn run_blocking(mut self) -> Result<u64> {
        let is_dgram = self.socket.is_dgram();
        let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
        let mut matched: u64 = 0;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.socket.recv(&mut buffer) {
                Ok(received) => {
                    self.consecutive_errors = 0;

                    let data = &buffer[..received.len];
                    match match_reply(
                        &self.session,
                        received.source,
                        data,
                        is_dgram,
                        received.timestamp_ns,
                    ) {
                        Some((key, result)) => {
                            if result.bitflip {
                                warn!(addr = %result.target, seq = result.seq, "Payload bitflip detected");
                            }
                            self.session.buckets.add_reply(key, result);
                            matched += 1;
                        }
                        None => {
                            trace!(source = %received.source, len = received.len, "Dropped foreign packet");
                        }
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    self.consecutive_errors = 0;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    self.consecutive_errors += 1;
                    warn!(
                        errors = self.consecutive_errors,
                        max = MAX_CONSECUTIVE_ERRORS,
                        error = %e,
                        "Receive error"
                    );
                    if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        return Err(anyhow::anyhow!(
                            "Receiver stopped: {} consecutive errors (last: {})",
                            self.consecutive_errors,
                            e
                        ));
                    }
                }
            }
        }

        debug!(matched, "Receiver stopped");
        Ok(matched)
    }
}

/// Spawn the receiver on a dedicated OS thread
///
/// A fatal receiver error cancels the shared token so the other roles stop too.
pub fn spawn_receiver(
    session: Arc<Session>,
    socket: Arc<ProbeSocket>,
    cancel: CancellationToken,
) -> std::thread::JoinHandle<Result<u64>> {
    std::thread::spawn(move || {
        let receiver = Receiver::new(session, socket, cancel.clone());

        // Catch panics and convert to error with details
        let result =
            match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| receiver.run_blocking())) {
                Ok(result) => result,
                Err(panic_payload) => {
                    let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "unknown panic".to_string()
                    };
                    Err(anyhow::anyhow!("Receiver panicked: {}", msg))
                }
            };

        if let Err(ref e) = result {
            error!(error = %e, "Receiver failed, shutting down");
            cancel.cancel();
        }
        result
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::probe::{IPV4_HEADER_SIZE, build_echo_request};
    use pnet::packet::icmp::{IcmpPacket, checksum};

    const TARGET: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
    const ID: u16 = 0x4242;

    fn session(bitflip_check: bool) -> Session {
        let config = Config {
            bitflip_check,
            ..Config::default()
        };
        Session::with_identifier(config, vec![TARGET], ID).unwrap()
    }

    /// Turn an echo request into the reply a peer would send back
    fn echo_reply(identifier: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
        let mut packet = build_echo_request(identifier, seq, payload);
        packet[0] = 0;
        packet[2] = 0;
        packet[3] = 0;
        let cksum = checksum(&IcmpPacket::new(&packet).unwrap());
        packet[2..4].copy_from_slice(&cksum.to_be_bytes());
        packet
    }

    fn stamped(session: &Session, ts: i64) -> Vec<u8> {
        let mut payload = session.payload().clone();
        payload.stamp(ts);
        payload.as_bytes().to_vec()
    }

    #[test]
    fn test_matching_reply() {
        let session = session(false);
        let sent_at = 5_000_000_100;
        let packet = echo_reply(ID, 7, &stamped(&session, sent_at));

        let (key, result) = match_reply(&session, TARGET, &packet, true, sent_at + 1_500).unwrap();
        assert_eq!(key, 5);
        assert_eq!(result.seq, 7);
        assert!(result.received);
        assert_eq!(result.latency.as_nanos(), 1_500);
        assert!(!result.bitflip);
    }

    #[test]
    fn test_raw_reply_with_ip_header() {
        let session = session(false);
        let mut data = vec![0u8; IPV4_HEADER_SIZE];
        data[0] = 0x45;
        data.extend(echo_reply(ID, 1, &stamped(&session, 1_000)));

        assert!(match_reply(&session, TARGET, &data, false, 2_000).is_some());
    }

    #[test]
    fn test_foreign_identifier_dropped_on_raw() {
        let session = session(false);
        let mut data = vec![0u8; IPV4_HEADER_SIZE];
        data[0] = 0x45;
        data.extend(echo_reply(ID + 1, 1, &stamped(&session, 1_000)));

        assert!(match_reply(&session, TARGET, &data, false, 2_000).is_none());
    }

    #[test]
    fn test_unknown_source_dropped() {
        let session = session(false);
        let packet = echo_reply(ID, 1, &stamped(&session, 1_000));
        assert!(match_reply(&session, Ipv4Addr::new(203, 0, 113, 9), &packet, true, 2_000).is_none());
    }

    #[test]
    fn test_missing_marker_dropped() {
        let session = session(false);
        let mut payload = stamped(&session, 1_000);
        payload[0] ^= 0xff;
        let packet = echo_reply(ID, 1, &payload);
        assert!(match_reply(&session, TARGET, &packet, true, 2_000).is_none());
    }

    #[test]
    fn test_short_payload_dropped() {
        let session = session(false);
        let payload = stamped(&session, 1_000);
        let packet = echo_reply(ID, 1, &payload[..PAYLOAD_HEADER_LEN - 1]);
        assert!(match_reply(&session, TARGET, &packet, true, 2_000).is_none());
    }

    #[test]
    fn test_bitflip_flagged_only_when_enabled() {
        for enabled in [false, true] {
            let session = session(enabled);
            let mut payload = stamped(&session, 1_000);
            let last = payload.len() - 1;
            payload[last] ^= 0x01;
            let packet = echo_reply(ID, 1, &payload);

            let (_, result) = match_reply(&session, TARGET, &packet, true, 2_000).unwrap();
            assert_eq!(result.bitflip, enabled);
        }
    }

    #[test]
    fn test_truncated_filler_counts_as_bitflip() {
        let session = session(true);
        let payload = stamped(&session, 1_000);
        let packet = echo_reply(ID, 1, &payload[..payload.len() - 4]);

        let (_, result) = match_reply(&session, TARGET, &packet, true, 2_000).unwrap();
        assert!(result.bitflip);
    }

    #[test]
    fn test_corrupted_reply_with_stale_checksum() {
        // Filler flipped in flight; the peer's checksum no longer matches
        let corrupt = |session: &Session| {
            let mut packet = echo_reply(ID, 3, &stamped(session, 1_000));
            let last = packet.len() - 1;
            packet[last] ^= 0x01;
            let mut data = vec![0u8; IPV4_HEADER_SIZE];
            data[0] = 0x45;
            data.extend(packet);
            data
        };

        let checking = session(true);
        let (_, result) = match_reply(&checking, TARGET, &corrupt(&checking), false, 2_000).unwrap();
        assert!(result.received);
        assert!(result.bitflip);

        let plain = session(false);
        assert!(match_reply(&plain, TARGET, &corrupt(&plain), false, 2_000).is_none());
    }
}
