use chrono::{DateTime, Local};
use std::io::Write;
use std::net::Ipv4Addr;

use crate::state::{IntervalReport, TargetStats};

/// One report line (without the time prefix)
pub fn format_target_line(target: Ipv4Addr, stats: &TargetStats, bitflip_check: bool) -> String {
    let mut line = format!(
        "{}: sent:{}, recv:{}, loss rate: {:.2}%, latency: {:?}",
        target,
        stats.sent(),
        stats.received,
        stats.loss_pct(),
        stats.mean_latency()
    );
    if bitflip_check {
        line.push_str(&format!(", bitflip: {}", stats.bitflips));
    }
    line
}

/// Write one text line per target, prefixed with the local wall-clock time
pub fn generate_report<W: Write>(
    report: &IntervalReport,
    bitflip_check: bool,
    at: DateTime<Local>,
    mut writer: W,
) -> std::io::Result<()> {
    let time = at.format("%H:%M:%S");
    for (target, stats) in &report.targets {
        writeln!(writer, "{} {}", time, format_target_line(*target, stats, bitflip_check))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ProbeResult;
    use chrono::TimeZone;

    const TARGET: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

    #[test]
    fn test_line_with_replies() {
        let results = vec![
            ProbeResult::reply(TARGET, 1, 0, 2_000_000, false),
            ProbeResult::reply(TARGET, 2, 0, 4_000_000, false),
            ProbeResult::sent(TARGET, 3, 0),
        ];
        let report = IntervalReport::summarize(1, &results);
        let line = format_target_line(TARGET, &report.targets[&TARGET], false);
        assert_eq!(line, "8.8.8.8: sent:3, recv:2, loss rate: 33.33%, latency: 3ms");
    }

    #[test]
    fn test_line_without_replies() {
        let report = IntervalReport::summarize(1, &[ProbeResult::sent(TARGET, 1, 0)]);
        let line = format_target_line(TARGET, &report.targets[&TARGET], true);
        assert_eq!(
            line,
            "8.8.8.8: sent:1, recv:0, loss rate: 100.00%, latency: 0ns, bitflip: 0"
        );
    }

    #[test]
    fn test_report_has_time_prefix() {
        let report = IntervalReport::summarize(
            1,
            &[
                ProbeResult::sent(Ipv4Addr::new(9, 9, 9, 9), 1, 0),
                ProbeResult::sent(TARGET, 1, 0),
            ],
        );
        let at = Local.with_ymd_and_hms(2024, 5, 1, 13, 4, 5).unwrap();
        let mut buf = Vec::new();
        generate_report(&report, false, at, &mut buf).unwrap();
        let out = String::from_utf8(buf).unwrap();
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("13:04:05 8.8.8.8: "));
        assert!(lines[1].starts_with("13:04:05 9.9.9.9: "));
    }
}
