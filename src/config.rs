use crate::{
    common::Address,
    error::{Error, Result},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How peers treat a member that announced it is leaving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeavePolicy {
    /// Mark it inactive and let the eviction window remove it, exactly like a
    /// member that crashed.
    AwaitEviction,
    /// Remove it this long after the leave was observed.
    Grace(Duration),
}

impl Default for LeavePolicy {
    fn default() -> Self {
        LeavePolicy::AwaitEviction
    }
}

/// Which bootstrap strategy resolves the initial peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryConfig {
    Static { seeds: Vec<Address> },
    /// Announce on the broadcast transport and collect replies for `window`.
    Multicast { window: Duration },
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig::Static { seeds: Vec::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gossip_interval: Duration,
    /// Peers contacted per gossip round.
    pub gossip_fanout: usize,
    pub max_digest_entries: usize,
    /// Byte budget for records piggy-backed on one push.
    pub max_gossip_bytes: usize,
    pub max_transmits: u64,
    pub request_timeout: Duration,
    /// Per-seed timeout of the join exchange.
    pub join_timeout: Duration,
    pub sweep_interval: Duration,
    pub suspect_timeout: Duration,
    pub evict_timeout: Duration,
    pub leave_policy: LeavePolicy,
    pub tombstone_ttl: Duration,
    /// Capacity of each listener's event queue.
    pub event_buffer: usize,
    pub discovery: DiscoveryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gossip_interval: Duration::from_millis(200),
            gossip_fanout: 3,
            max_digest_entries: 256,
            max_gossip_bytes: 1400,
            max_transmits: 5,
            request_timeout: Duration::from_millis(500),
            join_timeout: Duration::from_secs(1),
            sweep_interval: Duration::from_millis(100),
            suspect_timeout: Duration::from_secs(5),
            evict_timeout: Duration::from_secs(10),
            leave_policy: LeavePolicy::default(),
            tombstone_ttl: Duration::from_secs(60),
            event_buffer: 256,
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: &str) -> Result<()> {
            Err(Error::new_config(Some(msg.to_string().into())))
        }

        if self.gossip_interval == Duration::from_secs(0)
            || self.sweep_interval == Duration::from_secs(0)
        {
            return invalid("gossip and sweep intervals must be non-zero");
        }

        if self.gossip_fanout == 0 {
            return invalid("gossip fanout must be at least one");
        }

        if self.max_transmits == 0 || self.max_digest_entries == 0 || self.event_buffer == 0 {
            return invalid("transmit, digest and event limits must be non-zero");
        }

        if self.suspect_timeout >= self.evict_timeout {
            return invalid("suspect timeout must be shorter than evict timeout");
        }

        if let LeavePolicy::Grace(grace) = self.leave_policy {
            if grace > self.evict_timeout {
                return invalid("leave grace must not exceed evict timeout");
            }
        }

        if self.tombstone_ttl < self.evict_timeout {
            return invalid("tombstone ttl must cover the evict timeout");
        }

        Ok(())
    }
}
