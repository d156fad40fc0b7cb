use serde::Serialize;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Truncated send second a probe is bucketed under
pub type BucketKey = i64;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Bucket key for a send timestamp in nanoseconds since the epoch
pub fn bucket_key(timestamp_ns: i64) -> BucketKey {
    timestamp_ns.div_euclid(NANOS_PER_SEC)
}

/// Latency between two timestamps, clamped at zero
pub fn latency_between(tx_ns: i64, rx_ns: i64) -> Duration {
    Duration::from_nanos(rx_ns.saturating_sub(tx_ns).max(0) as u64)
}

/// Identifies one probe within a bucket
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize)]
pub struct ProbeKey {
    pub target: Ipv4Addr,
    pub seq: u16,
}

impl ProbeKey {
    pub fn new(target: Ipv4Addr, seq: u16) -> Self {
        Self { target, seq }
    }
}

/// One probe/reply record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub target: Ipv4Addr,
    pub seq: u16,
    /// Send timestamp (ns since epoch); kernel TX stamp when available
    pub tx_ns: i64,
    /// Receive timestamp (ns since epoch)
    pub rx_ns: Option<i64>,
    pub latency: Duration,
    pub received: bool,
    /// Returned filler differed from what was sent
    pub bitflip: bool,
}

impl ProbeResult {
    /// Record for a probe that has been sent but not answered
    pub fn sent(target: Ipv4Addr, seq: u16, tx_ns: i64) -> Self {
        Self {
            target,
            seq,
            tx_ns,
            rx_ns: None,
            latency: Duration::ZERO,
            received: false,
            bitflip: false,
        }
    }

    /// Record for a reply; `tx_ns` is the send time decoded from the payload
    pub fn reply(target: Ipv4Addr, seq: u16, tx_ns: i64, rx_ns: i64, bitflip: bool) -> Self {
        Self {
            target,
            seq,
            tx_ns,
            rx_ns: Some(rx_ns),
            latency: latency_between(tx_ns, rx_ns),
            received: true,
            bitflip,
        }
    }

    pub fn key(&self) -> ProbeKey {
        ProbeKey::new(self.target, self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_key_truncates_to_second() {
        assert_eq!(bucket_key(1_700_000_000_999_999_999), 1_700_000_000);
        assert_eq!(bucket_key(1_700_000_001_000_000_000), 1_700_000_001);
        assert_eq!(bucket_key(0), 0);
    }

    #[test]
    fn test_latency_clamped_at_zero() {
        assert_eq!(latency_between(100, 350), Duration::from_nanos(250));
        assert_eq!(latency_between(500, 100), Duration::ZERO);
    }

    #[test]
    fn test_reply_computes_latency() {
        let target = Ipv4Addr::new(8, 8, 8, 8);
        let reply = ProbeResult::reply(target, 3, 1_000, 6_000, false);
        assert!(reply.received);
        assert_eq!(reply.latency, Duration::from_nanos(5_000));
        assert_eq!(reply.key(), ProbeKey::new(target, 3));
    }
}
