use clap::Parser;
use std::time::Duration;

/// Multi-target ICMP latency/loss probe with per-second reports
#[derive(Parser, Debug, Clone)]
#[command(name = "mping")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Target hosts (IP address or hostname; comma-separated lists accepted)
    #[arg(required = true, value_delimiter = ',')]
    pub targets: Vec<String>,

    /// Number of send rounds (0 = unbounded)
    #[arg(short = 'c', long = "count", default_value = "0")]
    pub count: u64,

    /// IP Type-of-Service value (0 = leave unset)
    #[arg(short = 'z', long = "tos", default_value = "0")]
    pub tos: u8,

    /// ICMP payload size in bytes
    #[arg(short = 's', long = "size", default_value = "64")]
    pub size: usize,

    /// Per-operation I/O timeout in seconds
    #[arg(short = 't', long = "timeout", default_value = "1.0")]
    pub timeout: f64,

    /// Send rounds per second (each round probes every target once)
    #[arg(short = 'r', long = "rate", default_value = "100")]
    pub rate: u32,

    /// Seconds to wait for late replies before reporting a second
    #[arg(short = 'd', long = "delay", default_value = "3")]
    pub delay: u64,

    /// Check returned payloads for bit flips
    #[arg(long = "bitflip")]
    pub bitflip: bool,

    /// Emit JSON report lines instead of text
    #[arg(long = "json")]
    pub json: bool,

    /// Bind the probe socket to a specific network interface (e.g., eth0)
    #[arg(long = "interface")]
    pub interface: Option<String>,
}

/// Highest accepted send-round rate
pub const MAX_RATE: u32 = 1_000_000;
/// Shortest I/O timeout; shorter values round to "no timeout" in the kernel
pub const MIN_TIMEOUT: Duration = Duration::from_millis(1);
pub const MAX_TIMEOUT: Duration = Duration::from_secs(86_400);

impl Args {
    /// Get timeout as Duration, clamped to the accepted range
    pub fn timeout_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout)
            .unwrap_or(MAX_TIMEOUT)
            .clamp(MIN_TIMEOUT, MAX_TIMEOUT)
    }

    /// Validate arguments
    pub fn validate(&self) -> Result<(), String> {
        if self.rate == 0 || self.rate > MAX_RATE {
            return Err(format!("Rate must be between 1 and {}", MAX_RATE));
        }

        if !self.timeout.is_finite()
            || self.timeout < MIN_TIMEOUT.as_secs_f64()
            || self.timeout > MAX_TIMEOUT.as_secs_f64()
        {
            return Err(format!(
                "Timeout must be between {} and {} seconds",
                MIN_TIMEOUT.as_secs_f64(),
                MAX_TIMEOUT.as_secs()
            ));
        }

        if self.targets.iter().all(|t| t.trim().is_empty()) {
            return Err("At least one target is required".into());
        }

        if let Some(ref iface) = self.interface {
            if iface.is_empty() {
                return Err("Interface name cannot be empty".into());
            }
            // IFNAMSIZ on Linux is 16 including null terminator
            if iface.len() > 15 {
                return Err(format!("Interface name too long: {} (max 15 chars)", iface));
            }
        }

        Ok(())
    }
}
