use anyhow::{Result, bail};
use std::collections::HashSet;
use std::net::Ipv4Addr;

use crate::config::Config;
use crate::probe::{ProbePayload, get_identifier};
use crate::state::buckets::BucketAggregator;

/// Per-run probing context shared by the sender, receiver, and reporter
///
/// Built once at startup and handed out behind an `Arc`; everything here is
/// immutable except the bucket store, which does its own locking.
#[derive(Debug)]
pub struct Session {
    pub config: Config,
    /// ICMP identifier for this run
    pub identifier: u16,
    targets: Vec<Ipv4Addr>,
    target_set: HashSet<Ipv4Addr>,
    /// Payload template: marker, timestamp slot, filler
    payload: ProbePayload,
    pub buckets: BucketAggregator,
}

impl Session {
    pub fn new(config: Config, targets: Vec<Ipv4Addr>) -> Result<Self> {
        Self::with_identifier(config, targets, get_identifier())
    }

    pub fn with_identifier(config: Config, targets: Vec<Ipv4Addr>, identifier: u16) -> Result<Self> {
        let mut target_set = HashSet::with_capacity(targets.len());
        let targets: Vec<Ipv4Addr> = targets
            .into_iter()
            .filter(|t| target_set.insert(*t))
            .collect();

        if targets.is_empty() {
            bail!("No valid targets specified");
        }

        let payload = ProbePayload::new(config.packet_size);

        Ok(Self {
            config,
            identifier,
            targets,
            target_set,
            payload,
            buckets: BucketAggregator::new(),
        })
    }

    /// Targets in the order they were configured
    pub fn targets(&self) -> &[Ipv4Addr] {
        &self.targets
    }

    pub fn is_target(&self, addr: &Ipv4Addr) -> bool {
        self.target_set.contains(addr)
    }

    pub fn payload(&self) -> &ProbePayload {
        &self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::PAYLOAD_HEADER_LEN;

    #[test]
    fn test_empty_targets_rejected() {
        assert!(Session::new(Config::default(), vec![]).is_err());
    }

    #[test]
    fn test_duplicate_targets_collapsed() {
        let a = Ipv4Addr::new(1, 1, 1, 1);
        let b = Ipv4Addr::new(8, 8, 8, 8);
        let session = Session::new(Config::default(), vec![a, b, a]).unwrap();
        assert_eq!(session.targets(), &[a, b]);
        assert!(session.is_target(&b));
        assert!(!session.is_target(&Ipv4Addr::new(9, 9, 9, 9)));
    }

    #[test]
    fn test_payload_sized_from_config() {
        let config = Config {
            packet_size: 200,
            ..Config::default()
        };
        let session = Session::with_identifier(config, vec![Ipv4Addr::LOCALHOST], 42).unwrap();
        assert_eq!(session.identifier, 42);
        assert_eq!(session.payload().len(), 200);
        assert_eq!(session.payload().filler().len(), 200 - PAYLOAD_HEADER_LEN);
    }
}
