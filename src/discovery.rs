//! Bootstrap strategies resolving the addresses a starting node joins.

use crate::{
    common::Address,
    config::DiscoveryConfig,
    error::{Error, Result},
    protocol::{decode, encode, Announcement},
    transport::Broadcaster,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::time::{self, Instant};
use tracing::debug;

#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    /// Addresses to attempt a join with. Invoked once per start.
    async fn resolve_seeds(&self) -> Result<HashSet<Address>>;
}

/// A fixed list of seed addresses.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    seeds: HashSet<Address>,
}

impl StaticDiscovery {
    pub fn new(seeds: impl IntoIterator<Item = Address>) -> Self {
        Self {
            seeds: seeds.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn resolve_seeds(&self) -> Result<HashSet<Address>> {
        Ok(self.seeds.clone())
    }
}

/// Finds running members by announcing itself on the broadcast transport
/// and collecting the addresses that answer within `window`.
pub struct MulticastDiscovery {
    address: Address,
    broadcaster: Arc<dyn Broadcaster>,
    window: Duration,
}

impl MulticastDiscovery {
    pub fn new(address: Address, broadcaster: Arc<dyn Broadcaster>, window: Duration) -> Self {
        Self {
            address,
            broadcaster,
            window,
        }
    }
}

#[async_trait]
impl Discovery for MulticastDiscovery {
    async fn resolve_seeds(&self) -> Result<HashSet<Address>> {
        let mut replies = self
            .broadcaster
            .subscribe()
            .map_err(|e| Error::new_discovery(Some(Box::new(e))))?;

        let discover = encode(&Announcement::Discover {
            address: self.address.clone(),
        })?;
        self.broadcaster
            .broadcast(discover)
            .await
            .map_err(|e| Error::new_discovery(Some(Box::new(e))))?;

        let deadline = Instant::now() + self.window;
        let mut seeds = HashSet::new();

        while let Ok(Some(frame)) = time::timeout_at(deadline, replies.next()).await {
            match decode::<Announcement>(&frame) {
                Ok(Announcement::Advertise { address }) if address != self.address => {
                    seeds.insert(address);
                }
                Ok(_) => {}
                Err(e) => debug!("ignoring malformed announcement: {}", e),
            }
        }

        debug!(found = seeds.len(), "multicast discovery finished");
        Ok(seeds)
    }
}

pub(crate) fn from_config(
    config: &DiscoveryConfig,
    address: &Address,
    broadcaster: Option<Arc<dyn Broadcaster>>,
) -> Result<Arc<dyn Discovery>> {
    match config {
        DiscoveryConfig::Static { seeds } => Ok(Arc::new(StaticDiscovery::new(seeds.clone()))),
        DiscoveryConfig::Multicast { window } => match broadcaster {
            Some(broadcaster) => Ok(Arc::new(MulticastDiscovery::new(
                address.clone(),
                broadcaster,
                *window,
            ))),
            None => Err(Error::new_config(Some(
                "multicast discovery needs a broadcaster".into(),
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ErrorKind, transport::local::LocalNetwork};

    fn addr(port: u16) -> Address {
        Address::new("localhost", port)
    }

    #[tokio::test]
    async fn static_seeds() {
        let discovery = StaticDiscovery::new(vec![addr(1), addr(2), addr(1)]);
        let seeds = discovery.resolve_seeds().await.unwrap();

        assert_eq!(seeds.len(), 2);
        assert!(seeds.contains(&addr(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn multicast_collects_advertisements() {
        let network = LocalNetwork::new();

        for port in &[2u16, 3] {
            let broadcaster = network.broadcaster(addr(*port));
            let mut frames = broadcaster.subscribe().unwrap();
            let port = *port;

            tokio::spawn(async move {
                while let Some(frame) = frames.next().await {
                    if let Ok(Announcement::Discover { .. }) = decode(&frame) {
                        let advertise = encode(&Announcement::Advertise { address: addr(port) });
                        broadcaster.broadcast(advertise.unwrap()).await.unwrap();
                    }
                }
            });
        }

        let discovery = MulticastDiscovery::new(
            addr(1),
            Arc::new(network.broadcaster(addr(1))),
            Duration::from_millis(500),
        );

        let seeds = discovery.resolve_seeds().await.unwrap();
        let expected: HashSet<_> = vec![addr(2), addr(3)].into_iter().collect();
        assert_eq!(seeds, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn multicast_alone_finds_nothing() {
        let network = LocalNetwork::new();
        let discovery = MulticastDiscovery::new(
            addr(1),
            Arc::new(network.broadcaster(addr(1))),
            Duration::from_millis(500),
        );

        assert!(discovery.resolve_seeds().await.unwrap().is_empty());
    }

    #[test]
    fn multicast_needs_broadcaster() {
        let config = DiscoveryConfig::Multicast {
            window: Duration::from_secs(1),
        };

        let err = from_config(&config, &addr(1), None).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
