use crate::{
    common::{epoch_millis, Heartbeat, Incarnation, MemberId},
    config::Config,
    gossip::queue::TransmitQueue,
    listener::{lock, EventBus},
    member::{Member, State},
    monitor::FailureDetector,
    protocol::{Digest, DigestEntry, GossipPullResponse, GossipPush, Join, JoinResponse, Leave},
    store::{Change, MembershipStore},
};
use rand::seq::SliceRandom;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use tracing_attributes::instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Not yet part of any cluster; the local record is private.
    Detached,
    Joined,
    Leaving,
}

/// Membership state shared by every task of one service.
///
/// Owns the local member record and funnels everything learned from the
/// network through the store, the failure detector and the transmit queue.
#[derive(Debug)]
pub(crate) struct Node {
    config: Config,
    id: MemberId,
    local: Mutex<Member>,
    phase: Mutex<Phase>,
    heartbeat: AtomicU64,
    store: Arc<MembershipStore>,
    detector: FailureDetector,
    queue: Mutex<TransmitQueue>,
    /// Wakes the gossip loop for an immediate push.
    pub(crate) push: Notify,
}

impl Node {
    pub(crate) fn new(mut local: Member, config: Config, events: EventBus) -> Self {
        let now = epoch_millis();
        local.incarnation = local.incarnation.max(now);
        local.state = State::Inactive;
        local.reachable = true;

        let id = local.id().clone();
        let store = Arc::new(MembershipStore::new(events));
        let detector = FailureDetector::new(id.clone(), store.clone(), &config);
        let queue = Mutex::new(TransmitQueue::new(config.max_transmits));

        Self {
            config,
            id,
            local: Mutex::new(local),
            phase: Mutex::new(Phase::Detached),
            heartbeat: AtomicU64::new(now),
            store,
            detector,
            queue,
            push: Notify::new(),
        }
    }

    pub(crate) fn id(&self) -> &MemberId {
        &self.id
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn store(&self) -> &MembershipStore {
        &self.store
    }

    pub(crate) fn detector(&self) -> &FailureDetector {
        &self.detector
    }

    pub(crate) fn local(&self) -> Member {
        lock(&self.local).clone()
    }

    pub(crate) fn phase(&self) -> Phase {
        *lock(&self.phase)
    }

    /// Make the local record visible in the store and to peers.
    pub(crate) fn publish(&self) {
        let local = {
            let local = lock(&self.local);
            *lock(&self.phase) = Phase::Joined;
            self.store.put(local.clone());
            local.clone()
        };

        lock(&self.queue).enqueue(local);
    }

    /// Mark the local member inactive before it leaves the cluster.
    pub(crate) fn leave(&self) -> Member {
        *lock(&self.phase) = Phase::Leaving;

        self.mutate_local(|local| {
            let active = local.state == State::Active;
            local.state = State::Inactive;
            active
        })
        .unwrap_or_else(|| self.local())
    }

    pub(crate) fn put_metadata(&self, key: String, value: String) -> Member {
        self.mutate_local(|local| {
            let previous = local.metadata.insert(key, value.clone());
            previous.as_ref() != Some(&value)
        })
        .unwrap_or_else(|| self.local())
    }

    /// Apply `f` to the local record. When it reports a change, the record
    /// moves to a new incarnation, replaces the stored copy and is queued for
    /// an immediate push.
    fn mutate_local<F>(&self, f: F) -> Option<Member>
    where
        F: FnOnce(&mut Member) -> bool,
    {
        let updated = {
            let mut local = lock(&self.local);
            let mut next = local.clone();

            if !f(&mut next) {
                return None;
            }

            next.incarnation = local.incarnation + 1;
            *local = next.clone();

            if self.phase() != Phase::Detached {
                self.store.put(next.clone());
            }

            next
        };

        debug!(incarnation = updated.incarnation(), state = ?updated.state(), "local member changed");

        lock(&self.queue).enqueue(updated.clone());
        self.push.notify_one();

        Some(updated)
    }

    /// Merge a record received from the network.
    ///
    /// Returns whether the store accepted it. Records about the local member
    /// are never stored; a newer or conflicting one is refuted instead.
    pub(crate) fn apply(&self, candidate: Member) -> bool {
        if *candidate.id() == self.id {
            self.refute(&candidate);
            return false;
        }

        let id = candidate.id().clone();
        let state = candidate.state();

        let change = match self.store.put_change(candidate.clone()) {
            Some(change) => change,
            None => return false,
        };

        match (change, state) {
            (Change::Updated { previous: State::Active }, State::Inactive) => {
                info!(member = %id, "member left");
                self.detector.left(&id);
            }
            (Change::Added, _) => info!(member = %id, ?state, "member added"),
            (_, State::Active) => self.detector.rejoined(&id),
            _ => {}
        }

        lock(&self.queue).enqueue(candidate);
        self.maybe_activate();

        true
    }

    fn refute(&self, candidate: &Member) {
        if self.phase() != Phase::Joined {
            return;
        }

        let refuted = {
            let mut local = lock(&self.local);

            let newer = candidate.incarnation() > local.incarnation();
            let conflicting =
                candidate.incarnation() == local.incarnation() && candidate.differs(&local);

            if !newer && !conflicting {
                return;
            }

            local.incarnation = candidate.incarnation() + 1;
            self.store.put(local.clone());
            local.clone()
        };

        warn!(incarnation = refuted.incarnation(), "refuting record of the local member");

        lock(&self.queue).enqueue(refuted);
        self.push.notify_one();
    }

    /// The local member turns active as soon as it knows a peer.
    fn maybe_activate(&self) {
        if self.phase() != Phase::Joined || self.is_alone() {
            return;
        }

        let activated = self.mutate_local(|local| {
            let inactive = local.state == State::Inactive;
            local.state = State::Active;
            inactive
        });

        if activated.is_some() {
            info!("local member active");
        }
    }

    /// Whether the store knows no member besides the local one.
    pub(crate) fn is_alone(&self) -> bool {
        self.store.list().iter().all(|m| *m.id() == self.id)
    }

    pub(crate) fn tick_heartbeat(&self) -> Heartbeat {
        self.heartbeat.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The local record plus a sample of the versions this node knows.
    pub(crate) fn digest(&self) -> Digest {
        let local = self.local();

        let mut entries = vec![DigestEntry {
            id: self.id.clone(),
            incarnation: local.incarnation(),
            heartbeat: self.heartbeat.load(Ordering::SeqCst),
        }];

        let mut others: Vec<Member> = self
            .store
            .list()
            .into_iter()
            .filter(|m| *m.id() != self.id)
            .collect();

        let room = self.config.max_digest_entries.saturating_sub(1);
        if others.len() > room {
            others.shuffle(&mut rand::thread_rng());
            others.truncate(room);
        }

        entries.extend(others.into_iter().map(|m| DigestEntry {
            heartbeat: self.detector.heartbeat(m.id()),
            incarnation: m.incarnation(),
            id: m.id,
        }));

        Digest {
            member: local,
            entries,
        }
    }

    /// Members the author of `digest` is missing or holds an older version of.
    pub(crate) fn diff(&self, digest: &Digest) -> Vec<Member> {
        let known: HashMap<&MemberId, Incarnation> = digest
            .entries
            .iter()
            .map(|e| (&e.id, e.incarnation))
            .collect();

        self.store
            .list()
            .into_iter()
            .filter(|m| m.id() != digest.member.id())
            .filter(|m| known.get(m.id()).map_or(true, |inc| m.incarnation() > *inc))
            .collect()
    }

    /// Heartbeats relayed in a digest are evidence of life.
    pub(crate) fn observe(&self, entries: &[DigestEntry]) {
        for entry in entries {
            self.detector.observe(&entry.id, entry.heartbeat);
        }
    }

    #[instrument(level = "debug", skip(self, join), fields(member = %join.member.id()))]
    pub(crate) fn receive_join(&self, join: Join) -> JoinResponse {
        let id = join.member.id().clone();

        let mut members = self.store.list();
        members.extend(self.obituary(&join.member));

        self.apply(join.member);
        self.detector.contact(&id);

        JoinResponse {
            member: self.local(),
            members,
        }
    }

    pub(crate) fn receive_push(&self, push: GossipPush) -> GossipPullResponse {
        let GossipPush { digest, updates } = push;
        let sender = digest.member.id().clone();

        self.apply(digest.member.clone());
        for member in updates {
            self.apply(member);
        }

        self.detector.contact(&sender);
        self.observe(&digest.entries);

        let mut members = self.diff(&digest);
        members.extend(self.obituary(&digest.member));

        GossipPullResponse {
            members,
            entries: self.digest().entries,
        }
    }

    /// An evicted member that is still talking to us gets its own record back
    /// as inactive at the evicted incarnation, which makes it refute with a
    /// newer one that passes the tombstone.
    fn obituary(&self, member: &Member) -> Option<Member> {
        let incarnation = self.store.tombstone(member.id())?;

        if member.incarnation() > incarnation {
            return None;
        }

        let mut evicted = member.clone();
        evicted.state = State::Inactive;
        evicted.incarnation = incarnation;
        Some(evicted)
    }

    #[instrument(level = "debug", skip(self, leave), fields(member = %leave.member.id()))]
    pub(crate) fn receive_leave(&self, leave: Leave) {
        let id = leave.member.id().clone();
        if id == self.id || !self.store.contains(&id) {
            return;
        }
        self.apply(leave.member);

        if self.store.get(&id).map_or(false, |m| !m.is_active()) {
            self.detector.left(&id);
        }
    }

    /// Up to `n` random active peers.
    pub(crate) fn gossip_targets(&self, n: usize) -> Vec<Member> {
        let peers: Vec<Member> = self
            .store
            .list()
            .into_iter()
            .filter(|m| *m.id() != self.id && m.is_active())
            .collect();

        peers
            .choose_multiple(&mut rand::thread_rng(), n)
            .cloned()
            .collect()
    }

    /// The push sent to every target of one round.
    pub(crate) fn gossip_push(&self) -> GossipPush {
        let updates = lock(&self.queue)
            .get_updates(self.config.max_gossip_bytes)
            .unwrap_or_else(|e| {
                warn!("unable to collect updates: {}", e);
                Vec::new()
            });

        GossipPush {
            digest: self.digest(),
            updates,
        }
    }
}
