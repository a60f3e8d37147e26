use crate::{
    common::{Incarnation, MemberId},
    event::MembershipEvent,
    listener::EventBus,
    member::{Member, State},
};
use std::{
    collections::HashMap,
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};
use tokio::time::Instant;
use tracing::debug;

/// What a successful `put` did to the store.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Change {
    Added,
    /// The record was replaced; carries the state it had before.
    Updated { previous: State },
}

#[derive(Debug)]
struct Tombstone {
    incarnation: Incarnation,
    evicted_at: Instant,
}

#[derive(Debug, Default)]
struct Members {
    members: HashMap<MemberId, Member>,
    tombstones: HashMap<MemberId, Tombstone>,
}

/// The authoritative view of the cluster on this node.
///
/// All writes go through [`MembershipStore::put`] (or eviction), which
/// compares incarnations and applies a candidate under one write lock, so two
/// concurrent writers for the same member can never both win. Every change is
/// published on the event bus before the write lock is released, which keeps
/// the event order identical to the order of the mutations.
#[derive(Debug)]
pub struct MembershipStore {
    inner: RwLock<Members>,
    events: EventBus,
}

impl MembershipStore {
    pub fn new(events: EventBus) -> Self {
        Self {
            inner: RwLock::new(Members::default()),
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Apply `candidate` if it is newer than what the store holds.
    ///
    /// Returns whether the store changed. Stale candidates are discarded
    /// silently, and a candidate for an evicted member needs a strictly
    /// higher incarnation than the one it was evicted with.
    pub fn put(&self, candidate: Member) -> bool {
        self.put_change(candidate).is_some()
    }

    pub(crate) fn put_change(&self, mut candidate: Member) -> Option<Change> {
        let mut inner = self.write();
        let id = candidate.id().clone();

        let change = match inner.members.get(&id) {
            Some(stored) => {
                if !candidate.supersedes(stored) {
                    return None;
                }

                candidate.reachable = stored.reachable;
                let notify = candidate.differs(stored);
                let previous = stored.state;

                inner.members.insert(id.clone(), candidate.clone());

                if notify {
                    self.events.publish(MembershipEvent::updated(candidate));
                }

                Change::Updated { previous }
            }
            None => {
                if let Some(tombstone) = inner.tombstones.get(&id) {
                    if candidate.incarnation() <= tombstone.incarnation {
                        debug!(member = %id, incarnation = candidate.incarnation(), "ignoring record of evicted member");
                        return None;
                    }
                    inner.tombstones.remove(&id);
                }

                candidate.reachable = true;
                inner.members.insert(id.clone(), candidate.clone());
                self.events.publish(MembershipEvent::added(candidate));

                Change::Added
            }
        };

        Some(change)
    }

    pub fn get(&self, id: &MemberId) -> Option<Member> {
        self.read().members.get(id).cloned()
    }

    pub fn contains(&self, id: &MemberId) -> bool {
        self.read().members.contains_key(id)
    }

    /// A consistent snapshot of every member.
    pub fn list(&self) -> Vec<Member> {
        let mut members: Vec<_> = self.read().members.values().cloned().collect();
        members.sort_by(|a, b| a.id().cmp(b.id()));
        members
    }

    pub fn len(&self) -> usize {
        self.read().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove a member and remember its incarnation so stale gossip cannot
    /// bring it back.
    pub fn evict(&self, id: &MemberId) -> Option<Member> {
        let mut inner = self.write();
        let member = inner.members.remove(id)?;

        inner.tombstones.insert(
            id.clone(),
            Tombstone {
                incarnation: member.incarnation(),
                evicted_at: Instant::now(),
            },
        );
        self.events.publish(MembershipEvent::removed(member.clone()));

        Some(member)
    }

    /// The incarnation `id` was evicted with, if it is still remembered.
    pub(crate) fn tombstone(&self, id: &MemberId) -> Option<Incarnation> {
        self.read().tombstones.get(id).map(|t| t.incarnation)
    }

    /// Flip the local reachability verdict for a member. Returns whether the
    /// flag changed.
    pub(crate) fn set_reachable(&self, id: &MemberId, reachable: bool) -> bool {
        let mut inner = self.write();

        let member = match inner.members.get_mut(id) {
            Some(member) if member.reachable != reachable => member,
            _ => return false,
        };

        member.reachable = reachable;
        let subject = member.clone();
        self.events
            .publish(MembershipEvent::reachability_changed(subject));

        true
    }

    /// Forget tombstones older than `ttl`.
    pub(crate) fn purge_tombstones(&self, ttl: Duration) {
        let now = Instant::now();
        self.write()
            .tombstones
            .retain(|_, t| now.duration_since(t.evicted_at) < ttl);
    }

    #[cfg(test)]
    pub(crate) fn tombstone_count(&self) -> usize {
        self.read().tombstones.len()
    }

    fn read(&self) -> RwLockReadGuard<'_, Members> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Members> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{common::Address, event::EventKind, listener::Subscription};
    use std::{sync::Arc, thread};

    fn store() -> (MembershipStore, Subscription) {
        let bus = EventBus::new(64);
        let sub = bus.subscribe();
        (MembershipStore::new(bus), sub)
    }

    fn member(id: &str, incarnation: Incarnation, state: State) -> Member {
        let mut m = Member::new(id, Address::new("localhost", 1));
        m.incarnation = incarnation;
        m.state = state;
        m
    }

    #[tokio::test]
    async fn first_put_adds() {
        let (store, mut events) = store();

        assert!(store.put(member("a", 1, State::Active)));
        assert_eq!(store.len(), 1);

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::MemberAdded);
        assert_eq!(event.subject().id().as_str(), "a");
    }

    #[tokio::test]
    async fn stale_put_is_discarded() {
        let (store, mut events) = store();

        assert!(store.put(member("a", 5, State::Active)));
        assert!(!store.put(member("a", 5, State::Active)));
        assert!(!store.put(member("a", 4, State::Inactive)));

        assert_eq!(store.get(&"a".into()).unwrap().incarnation(), 5);

        events.recv().await.unwrap();
        assert!(store.put(member("a", 6, State::Inactive)));
        let event = events.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::MemberUpdated);
        assert_eq!(event.subject().state(), State::Inactive);
    }

    #[tokio::test]
    async fn tie_prefers_active() {
        let (store, _events) = store();

        assert!(store.put(member("a", 3, State::Inactive)));
        assert!(store.put(member("a", 3, State::Active)));
        assert!(!store.put(member("a", 3, State::Inactive)));
        assert!(store.get(&"a".into()).unwrap().is_active());
    }

    #[tokio::test]
    async fn update_event_carries_written_metadata() {
        let (store, mut events) = store();
        store.put(member("a", 1, State::Active));
        events.recv().await.unwrap();

        let mut next = member("a", 2, State::Active);
        next.metadata.insert("foo".into(), "bar".into());
        assert!(store.put(next));

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::MemberUpdated);
        assert_eq!(
            event.subject().metadata().get("foo").map(String::as_str),
            Some("bar")
        );
    }

    #[tokio::test]
    async fn incarnation_only_bump_is_silent() {
        let (store, mut events) = store();
        store.put(member("a", 1, State::Active));
        events.recv().await.unwrap();

        assert!(store.put(member("a", 2, State::Active)));
        store.evict(&"a".into());

        // The next event is the removal, no update was published in between.
        let event = events.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::MemberRemoved);
    }

    #[tokio::test]
    async fn evicted_member_is_not_resurrected() {
        let (store, mut events) = store();
        store.put(member("a", 7, State::Active));

        let evicted = store.evict(&"a".into()).unwrap();
        assert_eq!(evicted.incarnation(), 7);
        assert!(store.get(&"a".into()).is_none());
        assert!(store.evict(&"a".into()).is_none());

        assert!(!store.put(member("a", 7, State::Active)));
        assert!(!store.put(member("a", 3, State::Active)));
        assert!(store.get(&"a".into()).is_none());

        assert_eq!(store.tombstone(&"a".into()), Some(7));
        assert!(store.put(member("a", 8, State::Active)));
        assert_eq!(store.tombstone_count(), 0);

        let kinds: Vec<_> = vec![
            events.recv().await.unwrap().kind(),
            events.recv().await.unwrap().kind(),
            events.recv().await.unwrap().kind(),
        ];
        assert_eq!(
            kinds,
            vec![
                EventKind::MemberAdded,
                EventKind::MemberRemoved,
                EventKind::MemberAdded
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn tombstones_expire() {
        let (store, _events) = store();
        store.put(member("a", 7, State::Active));
        store.evict(&"a".into());

        store.purge_tombstones(Duration::from_secs(60));
        assert_eq!(store.tombstone_count(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        store.purge_tombstones(Duration::from_secs(60));
        assert_eq!(store.tombstone_count(), 0);
    }

    #[tokio::test]
    async fn reachability_is_local_and_preserved() {
        let (store, mut events) = store();
        store.put(member("a", 1, State::Active));
        events.recv().await.unwrap();

        assert!(store.set_reachable(&"a".into(), false));
        assert!(!store.set_reachable(&"a".into(), false));

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind(), EventKind::ReachabilityChanged);
        assert!(!event.subject().is_reachable());

        // A newer record from gossip does not override the local verdict.
        store.put(member("a", 2, State::Active));
        assert!(!store.get(&"a".into()).unwrap().is_reachable());
    }

    #[test]
    fn concurrent_puts_have_one_winner() {
        let store = Arc::new(MembershipStore::new(EventBus::new(16)));
        store.put(member("a", 1, State::Active));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || store.put(member("a", 2, State::Inactive)))
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
    }
}
