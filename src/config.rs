use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cli::Args;
use crate::probe::{DEFAULT_PAYLOAD_SIZE, clamp_payload_size};

/// How report lines are rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Runtime configuration derived from CLI args
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Number of send rounds (None = unbounded)
    pub count: Option<u64>,
    /// Send rounds per second; each round probes every target once
    pub rate: u32,
    /// ICMP payload size, already clamped to the payload header length
    pub packet_size: usize,
    /// Per-operation I/O timeout (read deadline and send bound)
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    /// Grace period before a second's bucket is finalized
    #[serde(with = "duration_serde")]
    pub delay: Duration,
    /// IP Type-of-Service value
    pub tos: Option<u8>,
    /// Compare returned filler against what was sent
    pub bitflip_check: bool,
    pub output: OutputFormat,
    /// Network interface to bind the probe socket to
    pub interface: Option<String>,
}

impl Config {
    /// Delay window in whole seconds, as compared against bucket keys
    pub fn delay_secs(&self) -> i64 {
        self.delay.as_secs() as i64
    }

    /// Interval between send rounds
    pub fn round_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate.max(1) as f64).max(Duration::from_nanos(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            count: None,
            rate: 100,
            packet_size: clamp_payload_size(DEFAULT_PAYLOAD_SIZE),
            timeout: Duration::from_secs(1),
            delay: Duration::from_secs(3),
            tos: None,
            bitflip_check: false,
            output: OutputFormat::Text,
            interface: None,
        }
    }
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        Self {
            count: if args.count == 0 { None } else { Some(args.count) },
            rate: args.rate,
            packet_size: clamp_payload_size(args.size),
            timeout: args.timeout_duration(),
            delay: Duration::from_secs(args.delay),
            tos: if args.tos == 0 { None } else { Some(args.tos) },
            bitflip_check: args.bitflip,
            output: if args.json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
            interface: args.interface.clone(),
        }
    }
}

/// Serde helper for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
