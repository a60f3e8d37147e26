//! An in-process network for running several services in one runtime.
//!
//! Every endpoint bound on a [`LocalNetwork`] gets a request queue; sends are
//! routed by address. Addresses can be cut off and healed again to simulate
//! crashes and partitions.

use super::{Broadcaster, Incoming, Messaging, Request};
use crate::{
    common::Address,
    error::{Error, Result},
    listener::lock,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::trace;

const QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Default)]
struct Shared {
    endpoints: HashMap<Address, mpsc::Sender<Request>>,
    cut: HashSet<Address>,
}

#[derive(Debug, Clone)]
pub struct LocalNetwork {
    shared: Arc<Mutex<Shared>>,
    group: broadcast::Sender<(Address, Bytes)>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        let (group, _) = broadcast::channel(QUEUE_DEPTH);

        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            group,
        }
    }

    pub fn messaging(&self, address: Address) -> LocalMessaging {
        LocalMessaging {
            address,
            network: self.clone(),
        }
    }

    pub fn broadcaster(&self, address: Address) -> LocalBroadcaster {
        LocalBroadcaster {
            address,
            network: self.clone(),
        }
    }

    /// Drop all traffic to and from `address` until it is healed.
    pub fn cut(&self, address: &Address) {
        lock(&self.shared).cut.insert(address.clone());
    }

    pub fn heal(&self, address: &Address) {
        lock(&self.shared).cut.remove(address);
    }

    fn is_cut(&self, address: &Address) -> bool {
        lock(&self.shared).cut.contains(address)
    }

    fn route(&self, from: &Address, to: &Address) -> Result<mpsc::Sender<Request>> {
        let shared = lock(&self.shared);

        if shared.cut.contains(from) || shared.cut.contains(to) {
            return Err(Error::new_unreachable(Some(
                format!("{} is cut off", to).into(),
            )));
        }

        match shared.endpoints.get(to) {
            Some(tx) if !tx.is_closed() => Ok(tx.clone()),
            _ => Err(Error::new_unreachable(Some(
                format!("nothing listens on {}", to).into(),
            ))),
        }
    }
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct LocalMessaging {
    address: Address,
    network: LocalNetwork,
}

#[async_trait]
impl Messaging for LocalMessaging {
    fn address(&self) -> &Address {
        &self.address
    }

    async fn send(&self, target: &Address, payload: Bytes) -> Result<Bytes> {
        let tx = self.network.route(&self.address, target)?;
        let (res_tx, res_rx) = oneshot::channel();

        trace!(from = %self.address, to = %target, len = payload.len(), "sending request");

        tx.send(Request::new(self.address.clone(), payload, res_tx))
            .await
            .map_err(|_| Error::new_unreachable(Some(format!("{} went away", target).into())))?;

        res_rx.await.map_err(|_| Error::new_broken_pipe(None))
    }

    async fn listen(&self) -> Result<Incoming> {
        let mut shared = lock(&self.network.shared);

        if let Some(tx) = shared.endpoints.get(&self.address) {
            if !tx.is_closed() {
                return Err(Error::new_start(Some(
                    format!("{} is already bound", self.address).into(),
                )));
            }
        }

        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        shared.endpoints.insert(self.address.clone(), tx);

        let incoming = stream::unfold(rx, |mut rx| async move {
            let req = rx.recv().await?;
            Some((req, rx))
        });

        Ok(incoming.boxed())
    }
}

#[derive(Debug, Clone)]
pub struct LocalBroadcaster {
    address: Address,
    network: LocalNetwork,
}

#[async_trait]
impl Broadcaster for LocalBroadcaster {
    async fn broadcast(&self, payload: Bytes) -> Result<()> {
        if self.network.is_cut(&self.address) {
            return Ok(());
        }

        // Nobody subscribed is not an error, the frame is simply lost.
        let _ = self.network.group.send((self.address.clone(), payload));
        Ok(())
    }

    fn subscribe(&self) -> Result<BoxStream<'static, Bytes>> {
        let rx = self.network.group.subscribe();
        let state = (rx, self.network.clone(), self.address.clone());

        let frames = stream::unfold(state, |(mut rx, network, address)| async move {
            loop {
                match rx.recv().await {
                    Ok((from, payload)) => {
                        if from == address || network.is_cut(&from) || network.is_cut(&address)
                        {
                            continue;
                        }
                        return Some((payload, (rx, network, address)));
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Ok(frames.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn addr(port: u16) -> Address {
        Address::new("localhost", port)
    }

    fn echo(mut incoming: Incoming) {
        tokio::spawn(async move {
            while let Some(req) = incoming.next().await {
                let payload = req.payload().clone();
                req.respond(payload).unwrap();
            }
        });
    }

    #[tokio::test]
    async fn request_reply() {
        let network = LocalNetwork::new();
        let a = network.messaging(addr(1));
        let b = network.messaging(addr(2));

        echo(b.listen().await.unwrap());

        let res = a.send(&addr(2), Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(&res[..], b"ping");
    }

    #[tokio::test]
    async fn unbound_address_is_unreachable() {
        let network = LocalNetwork::new();
        let a = network.messaging(addr(1));

        let err = a.send(&addr(9), Bytes::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unreachable);
    }

    #[tokio::test]
    async fn address_binds_once() {
        let network = LocalNetwork::new();
        let first = network.messaging(addr(1)).listen().await.unwrap();

        match network.messaging(addr(1)).listen().await {
            Ok(_) => panic!("address bound twice"),
            Err(err) => assert_eq!(err.kind(), ErrorKind::Start),
        }

        // Dropping the listener frees the address.
        drop(first);
        assert!(network.messaging(addr(1)).listen().await.is_ok());
    }

    #[tokio::test]
    async fn cut_and_heal() {
        let network = LocalNetwork::new();
        let a = network.messaging(addr(1));
        let b = network.messaging(addr(2));
        echo(b.listen().await.unwrap());

        network.cut(&addr(2));
        let err = a.send(&addr(2), Bytes::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unreachable);

        network.heal(&addr(2));
        assert!(a.send(&addr(2), Bytes::new()).await.is_ok());
    }

    #[tokio::test]
    async fn broadcast_skips_sender() {
        let network = LocalNetwork::new();
        let a = network.broadcaster(addr(1));
        let b = network.broadcaster(addr(2));

        let mut from_a = a.subscribe().unwrap();
        let mut from_b = b.subscribe().unwrap();

        a.broadcast(Bytes::from_static(b"hello")).await.unwrap();
        b.broadcast(Bytes::from_static(b"world")).await.unwrap();

        assert_eq!(&from_b.next().await.unwrap()[..], b"hello");
        assert_eq!(&from_a.next().await.unwrap()[..], b"world");
    }
}
