//! Transport seams used by the membership service.
//!
//! The service never touches sockets. Point-to-point exchanges go through a
//! [`Messaging`] implementation and cluster-wide announcements through a
//! [`Broadcaster`]; both carry opaque encoded frames.

pub mod local;

use crate::{
    common::Address,
    error::{Error, Result},
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::sync::oneshot;

pub type Incoming = BoxStream<'static, Request>;

/// Request/response messaging between members.
#[async_trait]
pub trait Messaging: Send + Sync + 'static {
    /// The address this endpoint is reachable on.
    fn address(&self) -> &Address;

    /// Send `payload` to `target` and wait for its reply.
    async fn send(&self, target: &Address, payload: Bytes) -> Result<Bytes>;

    /// Start accepting requests on [`Messaging::address`].
    ///
    /// Fails if the address cannot be bound.
    async fn listen(&self) -> Result<Incoming>;
}

/// Fire-and-forget announcements to every member of a broadcast group.
#[async_trait]
pub trait Broadcaster: Send + Sync + 'static {
    async fn broadcast(&self, payload: Bytes) -> Result<()>;

    /// Frames broadcast by other members from now on.
    fn subscribe(&self) -> Result<BoxStream<'static, Bytes>>;
}

/// An inbound request awaiting its reply.
#[derive(Debug)]
pub struct Request {
    from: Address,
    payload: Bytes,
    res_tx: oneshot::Sender<Bytes>,
}

impl Request {
    pub fn new(from: Address, payload: Bytes, res_tx: oneshot::Sender<Bytes>) -> Self {
        Self {
            from,
            payload,
            res_tx,
        }
    }

    pub fn sender(&self) -> &Address {
        &self.from
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn respond(self, res: Bytes) -> Result<()> {
        self.res_tx
            .send(res)
            .map_err(|_| Error::new_broken_pipe(None))
    }
}
