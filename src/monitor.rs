//! Timeout-based failure detection.
//!
//! The detector keeps, for every peer in the store, the last time this node
//! heard from or about it. Direct messages count as contact, and so does a
//! heartbeat counter higher than any seen before, no matter which peer
//! relayed it. A periodic sweep turns silence into verdicts: past the
//! suspicion window the peer is flagged unreachable but kept, past the
//! eviction window it is removed from the store.

use crate::{
    common::{Heartbeat, MemberId},
    config::{Config, LeavePolicy},
    listener::lock,
    store::MembershipStore,
};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug)]
struct Health {
    last_seen: Instant,
    heartbeat: Heartbeat,
    reachable: bool,
    left_at: Option<Instant>,
}

impl Health {
    fn new(now: Instant) -> Self {
        Self {
            last_seen: now,
            heartbeat: 0,
            reachable: true,
            left_at: None,
        }
    }
}

/// Verdicts produced by one sweep.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Sweep {
    pub(crate) suspected: Vec<MemberId>,
    pub(crate) evicted: Vec<MemberId>,
}

#[derive(Debug)]
pub(crate) struct FailureDetector {
    local: MemberId,
    store: Arc<MembershipStore>,
    suspect_timeout: Duration,
    evict_timeout: Duration,
    leave_policy: LeavePolicy,
    tombstone_ttl: Duration,
    peers: Mutex<HashMap<MemberId, Health>>,
}

impl FailureDetector {
    pub(crate) fn new(local: MemberId, store: Arc<MembershipStore>, config: &Config) -> Self {
        Self {
            local,
            store,
            suspect_timeout: config.suspect_timeout,
            evict_timeout: config.evict_timeout,
            leave_policy: config.leave_policy,
            tombstone_ttl: config.tombstone_ttl,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Record a message received directly from `id`.
    pub(crate) fn contact(&self, id: &MemberId) {
        if *id == self.local || !self.store.contains(id) {
            return;
        }

        let now = Instant::now();
        let recovered = {
            let mut peers = lock(&self.peers);
            let health = peers.entry(id.clone()).or_insert_with(|| Health::new(now));
            health.last_seen = now;
            !std::mem::replace(&mut health.reachable, true)
        };

        if recovered {
            self.recovered(id);
        }
    }

    /// Record a heartbeat for `id`, seen directly or relayed by any peer.
    ///
    /// Only a counter higher than the last one observed is evidence of life.
    pub(crate) fn observe(&self, id: &MemberId, heartbeat: Heartbeat) {
        if *id == self.local || !self.store.contains(id) {
            return;
        }

        let now = Instant::now();
        let recovered = {
            let mut peers = lock(&self.peers);
            let health = peers.entry(id.clone()).or_insert_with(|| Health::new(now));

            if heartbeat <= health.heartbeat {
                return;
            }

            health.heartbeat = heartbeat;
            health.last_seen = now;
            !std::mem::replace(&mut health.reachable, true)
        };

        if recovered {
            self.recovered(id);
        }
    }

    /// The highest heartbeat observed for `id`.
    pub(crate) fn heartbeat(&self, id: &MemberId) -> Heartbeat {
        lock(&self.peers).get(id).map(|h| h.heartbeat).unwrap_or(0)
    }

    /// `id` announced that it is leaving the cluster.
    pub(crate) fn left(&self, id: &MemberId) {
        if *id == self.local {
            return;
        }

        let now = Instant::now();
        let mut peers = lock(&self.peers);
        let health = peers.entry(id.clone()).or_insert_with(|| Health::new(now));
        health.left_at.get_or_insert(now);
    }

    /// `id` is active again after having left.
    pub(crate) fn rejoined(&self, id: &MemberId) {
        if let Some(health) = lock(&self.peers).get_mut(id) {
            health.left_at = None;
        }
    }

    /// Turn elapsed silence into suspicion and eviction, then apply the
    /// verdicts to the store.
    pub(crate) fn sweep(&self) -> Sweep {
        let verdicts = self.judge();
        self.enforce(verdicts)
    }

    fn judge(&self) -> Sweep {
        let now = Instant::now();
        let members = self.store.list();
        let known: HashSet<&MemberId> = members.iter().map(|m| m.id()).collect();
        let mut sweep = Sweep::default();

        {
            let mut peers = lock(&self.peers);
            peers.retain(|id, _| known.contains(id));

            for member in members.iter().filter(|m| *m.id() != self.local) {
                let health = peers
                    .entry(member.id().clone())
                    .or_insert_with(|| Health::new(now));

                let idle = now.duration_since(health.last_seen);
                let departed = match (self.leave_policy, health.left_at) {
                    (LeavePolicy::Grace(grace), Some(left_at)) => {
                        now.duration_since(left_at) >= grace
                    }
                    _ => false,
                };

                if idle >= self.evict_timeout || departed {
                    sweep.evicted.push(member.id().clone());
                } else if idle >= self.suspect_timeout && health.reachable {
                    health.reachable = false;
                    sweep.suspected.push(member.id().clone());
                }
            }

            for id in &sweep.evicted {
                peers.remove(id);
            }
        }

        sweep
    }

    fn enforce(&self, mut sweep: Sweep) -> Sweep {
        for id in &sweep.suspected {
            if self.store.set_reachable(id, false) {
                info!(member = %id, "member unreachable");
            }
        }

        sweep.evicted.retain(|id| {
            // A contact since the verdict puts the peer back under watch.
            let peers = lock(&self.peers);
            if peers.contains_key(id) {
                debug!(member = %id, "eviction cancelled by fresh contact");
                return false;
            }

            if self.store.evict(id).is_some() {
                info!(member = %id, "member evicted");
            }
            true
        });

        self.store.purge_tombstones(self.tombstone_ttl);

        sweep
    }

    fn recovered(&self, id: &MemberId) {
        if self.store.set_reachable(id, true) {
            debug!(member = %id, "member reachable again");
        }
    }
}
