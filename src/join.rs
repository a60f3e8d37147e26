use crate::{
    common::Address,
    error::{Error, Result},
    node::Node,
    protocol::{self, decode, encode, Request, Response},
    transport::Messaging,
};
use futures::future::join_all;
use std::{collections::HashSet, sync::Arc};
use tokio::time;
use tracing::debug;
use tracing_attributes::instrument;

/// The bootstrap exchange with a set of seed addresses.
///
/// Every seed is asked concurrently for its view of the cluster; seeds that
/// fail or time out are skipped.
pub(crate) struct Join {
    node: Arc<Node>,
    messaging: Arc<dyn Messaging>,
}

impl Join {
    pub(crate) fn new(node: Arc<Node>, messaging: Arc<dyn Messaging>) -> Self {
        Self { node, messaging }
    }

    async fn join_attempt(&self, seed: &Address) -> Result<usize> {
        let req = Request::Join(protocol::Join {
            member: self.node.local(),
        });

        let res = time::timeout(
            self.node.config().join_timeout,
            self.messaging.send(seed, encode(&req)?),
        )
        .await
        .map_err(|_| Error::new_timeout())??;

        let join_res = match decode(&res)? {
            Response::Join(res) => res,
            other => {
                return Err(Error::new_unexpected_message(Some(
                    format!("expected join response, got {:?}", other).into(),
                )))
            }
        };

        let responder = join_res.member.id().clone();
        self.node.apply(join_res.member);

        let learned = join_res
            .members
            .into_iter()
            .map(|member| self.node.apply(member))
            .filter(|applied| *applied)
            .count();

        self.node.detector().contact(&responder);

        Ok(learned)
    }

    /// Returns how many seeds answered.
    #[instrument(skip(self, seeds), fields(seeds = seeds.len()))]
    pub(crate) async fn run(&self, seeds: &HashSet<Address>) -> usize {
        let own = self.messaging.address();

        let attempts = seeds.iter().filter(|seed| *seed != own).map(|seed| async move {
            match self.join_attempt(seed).await {
                Ok(learned) => {
                    debug!(%seed, learned, "joined through seed");
                    true
                }
                Err(e) => {
                    debug!(%seed, error = %e, "seed did not answer");
                    false
                }
            }
        });

        join_all(attempts).await.into_iter().filter(|ok| *ok).count()
    }
}
