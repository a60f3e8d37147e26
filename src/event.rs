use crate::member::Member;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MemberAdded,
    MemberRemoved,
    MemberUpdated,
    ReachabilityChanged,
}

/// A change to the local view of the cluster.
///
/// `subject` is the member as it was right after the change; for removals it
/// is the last record the store held.
#[derive(Debug, Clone, PartialEq)]
pub struct MembershipEvent {
    kind: EventKind,
    subject: Member,
}

impl MembershipEvent {
    pub fn new(kind: EventKind, subject: Member) -> Self {
        Self { kind, subject }
    }

    pub fn added(subject: Member) -> Self {
        Self::new(EventKind::MemberAdded, subject)
    }

    pub fn removed(subject: Member) -> Self {
        Self::new(EventKind::MemberRemoved, subject)
    }

    pub fn updated(subject: Member) -> Self {
        Self::new(EventKind::MemberUpdated, subject)
    }

    pub fn reachability_changed(subject: Member) -> Self {
        Self::new(EventKind::ReachabilityChanged, subject)
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn subject(&self) -> &Member {
        &self.subject
    }

    pub fn into_subject(self) -> Member {
        self.subject
    }
}
