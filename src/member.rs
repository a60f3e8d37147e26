use crate::common::{Address, Incarnation, MemberId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type Metadata = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum State {
    Active,
    Inactive,
}

/// A snapshot of one cluster participant.
///
/// `Member` values handed out by the service are immutable copies; the
/// membership store owns the authoritative records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub(crate) id: MemberId,
    pub(crate) address: Address,
    pub(crate) state: State,
    pub(crate) metadata: Metadata,
    pub(crate) incarnation: Incarnation,
    /// Local failure-detector verdict, never sent on the wire.
    #[serde(skip, default = "reachable")]
    pub(crate) reachable: bool,
}

fn reachable() -> bool {
    true
}

impl Member {
    pub fn builder() -> MemberBuilder {
        MemberBuilder::default()
    }

    pub fn new(id: impl Into<MemberId>, address: Address) -> Self {
        Self {
            id: id.into(),
            address,
            state: State::Inactive,
            metadata: Metadata::new(),
            incarnation: 0,
            reachable: true,
        }
    }

    pub fn id(&self) -> &MemberId {
        &self.id
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn incarnation(&self) -> Incarnation {
        self.incarnation
    }

    pub fn is_active(&self) -> bool {
        self.state == State::Active
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    /// Whether `self` should replace `stored` under the merge rule: the
    /// higher incarnation wins, and on a tie an active record beats an
    /// inactive one.
    pub fn supersedes(&self, stored: &Member) -> bool {
        self.incarnation > stored.incarnation
            || (self.incarnation == stored.incarnation
                && self.state == State::Active
                && stored.state == State::Inactive)
    }

    /// Whether the replicated part of the record differs from `other`.
    pub(crate) fn differs(&self, other: &Member) -> bool {
        self.state != other.state
            || self.metadata != other.metadata
            || self.address != other.address
    }
}

#[derive(Debug, Default)]
pub struct MemberBuilder {
    id: Option<MemberId>,
    address: Option<Address>,
    metadata: Metadata,
}

impl MemberBuilder {
    pub fn id(mut self, id: impl Into<MemberId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn address(mut self, address: Address) -> Self {
        self.address = Some(address);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Builds the member; without an id an anonymous one is generated, and
    /// without an address the builder falls back to `localhost:0`.
    pub fn build(self) -> Member {
        let mut member = Member::new(
            self.id.unwrap_or_else(MemberId::anonymous),
            self.address.unwrap_or_else(|| Address::new("localhost", 0)),
        );
        member.metadata = self.metadata;
        member
    }
}
