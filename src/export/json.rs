use anyhow::Result;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::io::Write;
use std::net::Ipv4Addr;

use crate::state::{BucketKey, IntervalReport};

/// One JSON report line
#[derive(Debug, Serialize)]
pub struct JsonTargetReport {
    pub time: String,
    /// Send second the line covers (seconds since epoch)
    pub bucket: BucketKey,
    pub target: Ipv4Addr,
    pub sent: u64,
    pub received: u64,
    pub loss_pct: f64,
    pub latency_ns: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitflips: Option<u64>,
}

/// Write one JSON object per target, newline-delimited
pub fn export_json<W: Write>(
    report: &IntervalReport,
    bitflip_check: bool,
    at: DateTime<Local>,
    mut writer: W,
) -> Result<()> {
    let time = at.to_rfc3339();
    for (target, stats) in &report.targets {
        let line = JsonTargetReport {
            time: time.clone(),
            bucket: report.key,
            target: *target,
            sent: stats.sent(),
            received: stats.received,
            loss_pct: stats.loss_pct(),
            latency_ns: stats.mean_latency().as_nanos() as u64,
            bitflips: bitflip_check.then_some(stats.bitflips),
        };
        serde_json::to_writer(&mut writer, &line)?;
        writeln!(writer)?;
    }
    Ok(())
}
