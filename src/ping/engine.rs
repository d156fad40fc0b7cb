use anyhow::{Context, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::probe::{ProbeSocket, ProbeTransport, TxStamp, build_echo_request, wall_clock_nanos};
use crate::state::{BucketKey, ProbeKey, ProbeResult, Session, bucket_key};

/// Sends awaiting a TX stamp before the oldest is forgotten
const MAX_PENDING_TX: usize = 4096;

/// Largest gap between a send's wall clock and its TX stamp that is trusted
const MAX_TX_SKEW_NS: i64 = 1_000_000_000;

/// Totals reported when the sender stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendSummary {
    pub rounds: u64,
    pub sent: u64,
    pub failed: u64,
}

/// Next value of the shared per-round sequence counter (wraps past 65535)
pub fn next_sequence(seq: u16) -> u16 {
    seq.wrapping_add(1)
}

#[derive(Debug, Clone, Copy)]
struct PendingTx {
    key: BucketKey,
    probe: ProbeKey,
    sent_at: i64,
    hardware: bool,
}

/// Maps the kernel's per-send counter back to the send it belongs to
///
/// The socket numbers each successful send from 0 once TX stamps with
/// IDs are enabled, so the tracker numbers its own sends the same way.
#[derive(Debug, Default)]
pub struct TxStampTracker {
    next_id: u32,
    pending: HashMap<u32, PendingTx>,
    order: VecDeque<u32>,
}

impl TxStampTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a send that reached the socket and return its stamp ID
    pub fn record_send(&mut self, key: BucketKey, probe: ProbeKey, sent_at: i64) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        self.pending.insert(
            id,
            PendingTx {
                key,
                probe,
                sent_at,
                hardware: false,
            },
        );
        self.order.push_back(id);
        while self.order.len() > MAX_PENDING_TX {
            if let Some(old) = self.order.pop_front() {
                self.pending.remove(&old);
            }
        }
        id
    }

    /// The send a stamp belongs to, or `None` if it should not be applied
    ///
    /// A software stamp never overrides a hardware one already applied to
    /// the same send.
    pub fn resolve(&mut self, stamp: &TxStamp) -> Option<(BucketKey, ProbeKey)> {
        let pending = self.pending.get_mut(&stamp.id)?;
        if pending.hardware && !stamp.hardware {
            return None;
        }
        if (stamp.timestamp_ns - pending.sent_at).abs() > MAX_TX_SKEW_NS {
            debug!(
                id = stamp.id,
                skew_ns = stamp.timestamp_ns - pending.sent_at,
                "TX stamp too far from send time, ignoring"
            );
            return None;
        }
        pending.hardware |= stamp.hardware;
        Some((pending.key, pending.probe))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// State a send round needs; moved onto the blocking pool and back each round
struct SendRound<T> {
    session: Arc<Session>,
    transport: Arc<T>,
    tracker: TxStampTracker,
    summary: SendSummary,
}

impl<T: ProbeTransport> SendRound<T> {
    /// Send `packet` to every target, recording each send before the write
    fn send(&mut self, packet: &[u8], seq: u16, sent_at: i64) {
        let key = bucket_key(sent_at);
        let buckets = &self.session.buckets;
        let stamped = self.transport.tx_stamps_enabled();

        for &target in self.session.targets() {
            let probe = ProbeKey::new(target, seq);
            buckets.add(key, ProbeResult::sent(target, seq, sent_at));

            if let Err(e) = self.transport.send_to(packet, target) {
                // Not on the wire, so it must not count as loss
                buckets.remove(key, &probe);
                self.summary.failed += 1;
                warn!(addr = %target, seq, error = %e, "Failed to send probe");
                continue;
            }
            self.summary.sent += 1;

            if stamped {
                self.tracker.record_send(key, probe, sent_at);
            }
        }

        if stamped {
            self.apply_tx_stamps();
        }
    }

    fn apply_tx_stamps(&mut self) {
        for stamp in self.transport.drain_tx_stamps() {
            let Some((key, probe)) = self.tracker.resolve(&stamp) else {
                trace!(id = stamp.id, "Unmatched TX stamp");
                continue;
            };
            if !self.session.buckets.refine_send(key, &probe, stamp.timestamp_ns) {
                debug!(addr = %probe.target, seq = probe.seq, "TX timestamp arrived after record was evicted");
            }
        }
    }
}

/// The probe engine sends one echo request per target on every round
pub struct ProbeEngine<T: ProbeTransport = ProbeSocket> {
    session: Arc<Session>,
    transport: Arc<T>,
    cancel: CancellationToken,
}

impl<T: ProbeTransport> ProbeEngine<T> {
    pub fn new(session: Arc<Session>, transport: Arc<T>, cancel: CancellationToken) -> Self {
        Self {
            session,
            transport,
            cancel,
        }
    }

    /// Run the sender until cancelled or the configured count is reached
    ///
    /// Socket writes block, so each round runs on the blocking pool. With a
    /// finite count, waits `delay + 1` seconds after the last round so
    /// in-flight replies land, then cancels the shared token.
    pub async fn run(self) -> Result<SendSummary> {
        let config = &self.session.config;
        let mut payload = self.session.payload().clone();
        let mut seq: u16 = 0;
        let mut round = SendRound {
            session: self.session.clone(),
            transport: self.transport.clone(),
            tracker: TxStampTracker::new(),
            summary: SendSummary::default(),
        };

        let mut interval = tokio::time::interval(config.round_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Ok(round.summary);
                }
                _ = interval.tick() => {
                    seq = next_sequence(seq);
                    let sent_at = wall_clock_nanos();
                    payload.stamp(sent_at);
                    let packet = build_echo_request(self.session.identifier, seq, payload.as_bytes());

                    round = tokio::task::spawn_blocking(move || {
                        round.send(&packet, seq, sent_at);
                        round
                    })
                    .await
                    .context("Send round panicked")?;
                    round.summary.rounds += 1;

                    if config.count.is_some_and(|count| round.summary.rounds >= count) {
                        break;
                    }
                }
            }
        }

        let summary = round.summary;
        info!(
            rounds = summary.rounds,
            sent = summary.sent,
            "Send count reached, waiting for late replies"
        );
        let drain = config.delay + Duration::from_secs(1);
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(drain) => {}
        }
        self.cancel.cancel();
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::probe::{ICMP_HEADER_SIZE, PAYLOAD_HEADER_LEN, decode_payload_timestamp};
    use parking_lot::Mutex;
    use std::io;
    use std::net::Ipv4Addr;

    const A: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);
    const B: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 2);

    #[derive(Debug, Clone, Copy)]
    struct SentPacket {
        target: Ipv4Addr,
        seq: u16,
        sent_at: i64,
        recorded_first: bool,
    }

    /// In-memory socket: logs writes and hands back stamps one send late
    struct MockTransport {
        session: Arc<Session>,
        fail: Option<Ipv4Addr>,
        stamps: bool,
        writes: Mutex<Vec<SentPacket>>,
        queued: Mutex<Vec<TxStamp>>,
    }

    impl MockTransport {
        fn new(session: Arc<Session>) -> Self {
            Self {
                session,
                fail: None,
                stamps: false,
                writes: Mutex::new(Vec::new()),
                queued: Mutex::new(Vec::new()),
            }
        }

        fn stamp_for(id: u32, sent_at: i64) -> i64 {
            sent_at + 500 + id as i64 * 1_000
        }
    }

    impl ProbeTransport for MockTransport {
        fn send_to(&self, packet: &[u8], target: Ipv4Addr) -> io::Result<usize> {
            let seq = u16::from_be_bytes([packet[6], packet[7]]);
            let sent_at = decode_payload_timestamp(&packet[ICMP_HEADER_SIZE..]).unwrap();
            let recorded_first = self
                .session
                .buckets
                .get(bucket_key(sent_at), &ProbeKey::new(target, seq))
                .is_some();

            let mut writes = self.writes.lock();
            writes.push(SentPacket {
                target,
                seq,
                sent_at,
                recorded_first,
            });
            if self.fail == Some(target) {
                return Err(io::Error::new(io::ErrorKind::HostUnreachable, "unreachable"));
            }

            if self.stamps {
                let id = writes.iter().filter(|w| Some(w.target) != self.fail).count() as u32 - 1;
                self.queued.lock().push(TxStamp {
                    id,
                    timestamp_ns: Self::stamp_for(id, sent_at),
                    hardware: false,
                });
            }
            Ok(packet.len())
        }

        fn tx_stamps_enabled(&self) -> bool {
            self.stamps
        }

        fn drain_tx_stamps(&self) -> Vec<TxStamp> {
            // The newest stamp is still in flight
            let mut queued = self.queued.lock();
            let ready = queued.len().saturating_sub(1);
            queued.drain(..ready).collect()
        }
    }

    fn session(targets: Vec<Ipv4Addr>, rate: u32, count: u64) -> Arc<Session> {
        let config = Config {
            rate,
            count: Some(count),
            packet_size: PAYLOAD_HEADER_LEN,
            ..Config::default()
        };
        Arc::new(Session::with_identifier(config, targets, 7).unwrap())
    }

    fn stamp(id: u32, timestamp_ns: i64, hardware: bool) -> TxStamp {
        TxStamp {
            id,
            timestamp_ns,
            hardware,
        }
    }

    #[test]
    fn test_first_sequence_is_one() {
        assert_eq!(next_sequence(0), 1);
    }

    #[test]
    fn test_sequence_wraps() {
        assert_eq!(next_sequence(u16::MAX), 0);
        assert_eq!(next_sequence(next_sequence(u16::MAX)), 1);
    }

    #[test]
    fn test_tracker_matches_stamps_by_id() {
        let mut tracker = TxStampTracker::new();
        let first = tracker.record_send(10, ProbeKey::new(A, 1), 10_000);
        let second = tracker.record_send(10, ProbeKey::new(B, 1), 20_000);
        assert_eq!((first, second), (0, 1));

        // Out of order delivery still lands on the right send
        assert_eq!(tracker.resolve(&stamp(1, 20_100, false)), Some((10, ProbeKey::new(B, 1))));
        assert_eq!(tracker.resolve(&stamp(0, 10_100, false)), Some((10, ProbeKey::new(A, 1))));
        assert_eq!(tracker.resolve(&stamp(2, 30_000, false)), None);
    }

    #[test]
    fn test_tracker_software_never_overrides_hardware() {
        let mut tracker = TxStampTracker::new();
        tracker.record_send(1, ProbeKey::new(A, 1), 1_000);

        assert!(tracker.resolve(&stamp(0, 1_200, true)).is_some());
        assert_eq!(tracker.resolve(&stamp(0, 1_100, false)), None);
        assert!(tracker.resolve(&stamp(0, 1_300, true)).is_some());
    }

    #[test]
    fn test_tracker_rejects_skewed_stamp() {
        let mut tracker = TxStampTracker::new();
        tracker.record_send(1, ProbeKey::new(A, 1), 5 * MAX_TX_SKEW_NS);
        assert_eq!(tracker.resolve(&stamp(0, 3 * MAX_TX_SKEW_NS, false)), None);
        assert!(tracker.resolve(&stamp(0, 5 * MAX_TX_SKEW_NS + 10, false)).is_some());
    }

    #[test]
    fn test_tracker_is_bounded() {
        let mut tracker = TxStampTracker::new();
        for seq in 0..(MAX_PENDING_TX + 10) as u32 {
            tracker.record_send(0, ProbeKey::new(A, seq as u16), 0);
        }
        assert_eq!(tracker.len(), MAX_PENDING_TX);
        assert_eq!(tracker.resolve(&stamp(0, 0, false)), None);
        assert!(tracker.resolve(&stamp(MAX_PENDING_TX as u32 + 9, 0, false)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sends_exact_count_at_rate() {
        let session = session(vec![A], 100, 500);
        let transport = Arc::new(MockTransport::new(session.clone()));
        let cancel = CancellationToken::new();
        let engine = ProbeEngine::new(session.clone(), transport.clone(), cancel.clone());

        let start = tokio::time::Instant::now();
        let summary = engine.run().await.unwrap();
        let elapsed = start.elapsed();

        assert_eq!(
            summary,
            SendSummary {
                rounds: 500,
                sent: 500,
                failed: 0
            }
        );
        let writes = transport.writes.lock();
        assert_eq!(writes.len(), 500);
        assert!(writes.iter().all(|w| w.recorded_first));
        assert_eq!(writes[0].seq, 1);
        assert_eq!(writes[499].seq, 500);

        // 499 intervals of 10ms, then delay + 1s
        assert!(elapsed >= Duration::from_millis(4_990) + Duration::from_secs(4));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_send_leaves_no_record() {
        let session = session(vec![A, B], 100, 20);
        let mut transport = MockTransport::new(session.clone());
        transport.fail = Some(B);
        let transport = Arc::new(transport);
        let engine = ProbeEngine::new(session.clone(), transport.clone(), CancellationToken::new());

        let summary = engine.run().await.unwrap();
        assert_eq!(summary.sent, 20);
        assert_eq!(summary.failed, 20);

        for w in transport.writes.lock().iter() {
            let record = session
                .buckets
                .get(bucket_key(w.sent_at), &ProbeKey::new(w.target, w.seq));
            assert_eq!(record.is_some(), w.target == A, "{:?}", w);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_tx_stamps_refine_their_own_send() {
        let session = session(vec![A], 100, 50);
        let mut transport = MockTransport::new(session.clone());
        transport.stamps = true;
        let transport = Arc::new(transport);
        let engine = ProbeEngine::new(session.clone(), transport.clone(), CancellationToken::new());

        engine.run().await.unwrap();

        let writes = transport.writes.lock();
        for (id, w) in writes.iter().enumerate() {
            let record = session
                .buckets
                .get(bucket_key(w.sent_at), &ProbeKey::new(A, w.seq))
                .unwrap();
            // The last stamp never left the queue
            let expected = if id + 1 == writes.len() {
                w.sent_at
            } else {
                MockTransport::stamp_for(id as u32, w.sent_at)
            };
            assert_eq!(record.tx_ns, expected, "seq {}", w.seq);
        }
    }
}
