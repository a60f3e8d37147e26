//! Decentralized cluster membership.
//!
//! Every participant runs a [`MembershipService`]. Services find each other
//! through a [`Discovery`] strategy, exchange membership state by push-pull
//! gossip and detect failed peers on their own. Each service exposes an
//! eventually consistent view of the cluster and notifies registered
//! listeners of every change it observes.

#[cfg(test)]
#[macro_use]
extern crate tokio_test;

mod builder;
mod cluster;
mod common;
mod config;
mod discovery;
mod error;
mod event;
mod gossip;
mod join;
mod listener;
mod member;
mod monitor;
mod node;
pub mod protocol;
mod store;
pub mod transport;

#[cfg(test)]
mod test_utils;

pub use self::{
    builder::Builder,
    cluster::{MembershipService, Status},
    common::{Address, Heartbeat, IdKind, Incarnation, MemberId},
    config::{Config, DiscoveryConfig, LeavePolicy},
    discovery::{Discovery, MulticastDiscovery, StaticDiscovery},
    error::{Error, ErrorKind, Result},
    event::{EventKind, MembershipEvent},
    listener::{EventBus, Listener, ListenerId, Subscription},
    member::{Member, MemberBuilder, Metadata, State},
    store::MembershipStore,
};
