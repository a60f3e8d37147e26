//! Periodic push-pull gossip.
//!
//! Every round the node advances its heartbeat and pushes its digest plus
//! the freshest queued records to a few random active peers. Each peer
//! answers with whatever the digest showed to be missing or outdated, so
//! both sides converge in one exchange. A node that knows no peer instead
//! retries the join procedure against its seeds.

pub(crate) mod queue;

use crate::{
    common::Address,
    error::{Error, Result},
    join::Join,
    member::Member,
    node::Node,
    protocol::{decode, encode, Request, Response},
    transport::Messaging,
};
use bytes::Bytes;
use futures::future::join_all;
use std::{collections::HashSet, sync::Arc};
use tokio::time::{self, MissedTickBehavior};
use tracing::{trace, warn};

pub(crate) struct Gossip {
    node: Arc<Node>,
    messaging: Arc<dyn Messaging>,
    seeds: HashSet<Address>,
}

impl Gossip {
    pub(crate) fn new(
        node: Arc<Node>,
        messaging: Arc<dyn Messaging>,
        seeds: HashSet<Address>,
    ) -> Self {
        Self {
            node,
            messaging,
            seeds,
        }
    }

    /// Gossip until the task is cancelled. Local changes trigger an extra
    /// round right away instead of waiting for the next tick.
    pub(crate) async fn run(self) {
        let mut interval = time::interval(self.node.config().gossip_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.node.push.notified() => {}
            }

            self.round().await;
        }
    }

    pub(crate) async fn round(&self) {
        self.node.tick_heartbeat();

        if self.node.is_alone() {
            if !self.seeds.is_empty() {
                Join::new(self.node.clone(), self.messaging.clone())
                    .run(&self.seeds)
                    .await;
            }
            return;
        }

        let targets = self.node.gossip_targets(self.node.config().gossip_fanout);
        if targets.is_empty() {
            return;
        }

        let push = Request::Gossip(self.node.gossip_push());
        let payload = match encode(&push) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("unable to encode gossip push: {}", e);
                return;
            }
        };

        let exchanges = targets
            .iter()
            .map(|target| self.exchange(target, payload.clone()));

        join_all(exchanges).await;
    }

    async fn exchange(&self, target: &Member, payload: Bytes) {
        if let Err(e) = self.try_exchange(target, payload).await {
            trace!(member = %target.id(), error = %e, "gossip exchange failed");
        }
    }

    async fn try_exchange(&self, target: &Member, payload: Bytes) -> Result<()> {
        let res = time::timeout(
            self.node.config().request_timeout,
            self.messaging.send(target.address(), payload),
        )
        .await
        .map_err(|_| Error::new_timeout())??;

        let pull = match decode(&res)? {
            Response::Gossip(pull) => pull,
            other => {
                return Err(Error::new_unexpected_message(Some(
                    format!("expected gossip response, got {:?}", other).into(),
                )))
            }
        };

        self.node.detector().contact(target.id());
        for member in pull.members {
            self.node.apply(member);
        }
        self.node.observe(&pull.entries);

        Ok(())
    }
}

/// Run the failure detector until the task is cancelled.
pub(crate) async fn sweep(node: Arc<Node>) {
    let mut interval = time::interval(node.config().sweep_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        let sweep = node.detector().sweep();
        if !sweep.suspected.is_empty() || !sweep.evicted.is_empty() {
            trace!(
                suspected = sweep.suspected.len(),
                evicted = sweep.evicted.len(),
                "failure detector sweep"
            );
        }
    }
}
