use serde::Serialize;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use super::result::{BucketKey, ProbeResult};

/// Per-target sums for one reported second
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TargetStats {
    pub received: u64,
    pub lost: u64,
    pub total_latency: Duration,
    pub bitflips: u64,
}

impl TargetStats {
    pub fn record(&mut self, result: &ProbeResult) {
        if result.received {
            self.received += 1;
            self.total_latency += result.latency;
        } else {
            self.lost += 1;
        }
        if result.bitflip {
            self.bitflips += 1;
        }
    }

    pub fn sent(&self) -> u64 {
        self.received + self.lost
    }

    /// Fraction of probes lost, 0 when nothing was sent
    pub fn loss_rate(&self) -> f64 {
        let sent = self.sent();
        if sent == 0 {
            0.0
        } else {
            (self.lost as f64 / sent as f64).clamp(0.0, 1.0)
        }
    }

    pub fn loss_pct(&self) -> f64 {
        self.loss_rate() * 100.0
    }

    /// Mean latency over received probes, zero when none were received
    pub fn mean_latency(&self) -> Duration {
        if self.received == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total_latency.as_nanos() / self.received as u128;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }
}

/// Report for one evicted bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalReport {
    pub key: BucketKey,
    /// Ordered by target address
    pub targets: BTreeMap<Ipv4Addr, TargetStats>,
}

impl IntervalReport {
    /// Group a bucket's records by target
    pub fn summarize(key: BucketKey, results: &[ProbeResult]) -> Self {
        let mut targets: BTreeMap<Ipv4Addr, TargetStats> = BTreeMap::new();
        for result in results {
            targets.entry(result.target).or_default().record(result);
        }
        Self { key, targets }
    }
}
