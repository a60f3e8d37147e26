//! Messages exchanged between membership services and their encoding.
//!
//! Point-to-point traffic is a `Request` answered by a `Response`; traffic on
//! the broadcast transport is an `Announcement`. Every message that carries a
//! member carries the full record `(id, address, state, metadata,
//! incarnation)`. Messages are encoded with bincode.

use crate::{
    common::{Address, Heartbeat, Incarnation, MemberId},
    error::Result,
    member::Member,
};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Join(Join),
    Gossip(GossipPush),
    Leave(Leave),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Join(JoinResponse),
    Gossip(GossipPullResponse),
    Ack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Announcement {
    Leave(Leave),
    /// A starting node looking for peers.
    Discover { address: Address },
    /// Reply to `Discover` from a running node.
    Advertise { address: Address },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Join {
    pub member: Member,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinResponse {
    /// The responding member.
    pub member: Member,
    pub members: Vec<Member>,
}

/// The versions a node knows about, used to find what a peer is missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Digest {
    /// The sender's own record.
    pub member: Member,
    /// The sender's entry comes first and carries its current heartbeat.
    pub entries: Vec<DigestEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestEntry {
    pub id: MemberId,
    pub incarnation: Incarnation,
    pub heartbeat: Heartbeat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipPush {
    pub digest: Digest,
    /// Recently changed records piggy-backed on the push.
    pub updates: Vec<Member>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipPullResponse {
    /// Records the responder holds at a newer incarnation than the digest
    /// showed, or that the digest did not mention.
    pub members: Vec<Member>,
    pub entries: Vec<DigestEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leave {
    pub member: Member,
}

pub fn encode<T: Serialize>(message: &T) -> Result<Bytes> {
    Ok(Bytes::from(bincode::serialize(message)?))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}
