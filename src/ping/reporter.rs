use anyhow::Result;
use chrono::Local;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::config::{Config, OutputFormat};
use crate::export::{export_json, generate_report};
use crate::probe::wall_clock_nanos;
use crate::state::{BucketKey, IntervalReport, Session, bucket_key};

/// How often closed buckets are checked for
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Evicts closed buckets in key order and turns them into report lines
pub struct StatsReporter {
    session: Arc<Session>,
    cancel: CancellationToken,
    /// Key of the most recently reported bucket
    last_key: Option<BucketKey>,
    out: Box<dyn Write + Send>,
}

impl StatsReporter {
    pub fn new(session: Arc<Session>, cancel: CancellationToken) -> Self {
        Self {
            session,
            cancel,
            last_key: None,
            out: Box::new(std::io::stdout()),
        }
    }

    /// Write reports to `out` instead of stdout
    pub fn with_writer(mut self, out: impl Write + Send + 'static) -> Self {
        self.out = Box::new(out);
        self
    }

    pub fn last_key(&self) -> Option<BucketKey> {
        self.last_key
    }

    /// Evict every bucket that has closed as of `now_secs`
    ///
    /// Buckets whose key was already reported are late arrivals and are
    /// dropped. A bucket is closed once `now_secs - key >= delay`.
    pub fn tick(&mut self, now_secs: i64) -> Vec<IntervalReport> {
        let buckets = &self.session.buckets;
        let delay = self.session.config.delay_secs();
        let mut reports = Vec::new();

        while let Some(key) = buckets.last() {
            if self.last_key.is_some_and(|last| key <= last) {
                if let Some(stale) = buckets.pop() {
                    trace!(key = stale.key(), records = stale.len(), "Dropped late bucket");
                }
                continue;
            }

            if now_secs - key < delay {
                break;
            }

            // An older bucket appeared since the peek; look again
            let Some(bucket) = buckets.pop_if_oldest(key) else {
                continue;
            };

            self.last_key = Some(key);
            reports.push(IntervalReport::summarize(key, &bucket.take_results()));
        }

        reports
    }

    /// Write reports in the configured format
    pub fn write_reports<W: Write>(&self, reports: &[IntervalReport], writer: W) -> Result<()> {
        write_reports(&self.session.config, reports, writer)
    }

    fn report_closed(&mut self) -> Result<()> {
        let reports = self.tick(bucket_key(wall_clock_nanos()));
        if !reports.is_empty() {
            write_reports(&self.session.config, &reports, &mut self.out)?;
        }
        Ok(())
    }

    /// Report once per second until cancelled, then make one final pass
    ///
    /// A failed write cancels the shared token so the other roles stop too.
    pub async fn run(mut self) -> Result<()> {
        let result = self.report_loop().await;
        if let Err(ref e) = result {
            error!(error = %e, "Failed to write report, shutting down");
            self.cancel.cancel();
        }
        result
    }

    async fn report_loop(&mut self) -> Result<()> {
        let mut interval = tokio::time::interval(REPORT_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.report_closed()?;
                    break;
                }
                _ = interval.tick() => {
                    self.report_closed()?;
                }
            }
        }

        debug!(last_key = ?self.last_key, pending = self.session.buckets.len(), "Reporter stopped");
        Ok(())
    }
}

fn write_reports<W: Write>(config: &Config, reports: &[IntervalReport], mut writer: W) -> Result<()> {
    let now = Local::now();
    for report in reports {
        match config.output {
            OutputFormat::Text => generate_report(report, config.bitflip_check, now, &mut writer)?,
            OutputFormat::Json => export_json(report, config.bitflip_check, now, &mut writer)?,
        }
    }
    writer.flush()?;
    Ok(())
}
