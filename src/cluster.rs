use crate::{
    builder::Builder,
    common::{Address, MemberId},
    config::Config,
    discovery::Discovery,
    error::{Error, Result},
    gossip::{self, Gossip},
    join::Join,
    listener::{lock, EventBus, Listener, ListenerId, Subscription},
    member::Member,
    node::Node,
    protocol::{decode, encode, Announcement, Leave, Request, Response},
    transport::{self, Broadcaster, Messaging},
};
use futures::{future::join_all, stream::BoxStream, StreamExt};
use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex},
};
use tokio::{sync::watch, task::JoinHandle, time};
use tracing::{debug, info, info_span, trace, warn, Span};
use tracing_futures::Instrument;

/// Lifecycle of a [`MembershipService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Inactive,
    /// Resolving seeds and joining.
    Starting,
    /// Gossip is running.
    Active,
    Stopping,
    /// Terminal; a stopped service cannot be started again.
    Stopped,
}

/// The membership service of one cluster participant.
///
/// Cloning yields another handle to the same service.
#[derive(Clone)]
pub struct MembershipService {
    inner: Arc<Inner>,
}

struct Inner {
    node: Arc<Node>,
    messaging: Arc<dyn Messaging>,
    broadcaster: Option<Arc<dyn Broadcaster>>,
    discovery: Arc<dyn Discovery>,
    events: EventBus,
    status: watch::Sender<Status>,
    tasks: Mutex<Tasks>,
    span: Span,
}

#[derive(Default)]
struct Tasks {
    /// Inbound request and announcement handling.
    server: Vec<JoinHandle<()>>,
    /// Gossip rounds and failure detection.
    periodic: Vec<JoinHandle<()>>,
}

impl MembershipService {
    pub fn builder() -> Builder {
        Builder::default()
    }

    pub(crate) fn new(
        member: Member,
        config: Config,
        messaging: Arc<dyn Messaging>,
        broadcaster: Option<Arc<dyn Broadcaster>>,
        discovery: Arc<dyn Discovery>,
    ) -> Self {
        let events = EventBus::new(config.event_buffer);
        let node = Arc::new(Node::new(member, config, events.clone()));
        let span = info_span!("member", id = %node.id());
        let (status, _) = watch::channel(Status::Inactive);

        Self {
            inner: Arc::new(Inner {
                node,
                messaging,
                broadcaster,
                discovery,
                events,
                status,
                tasks: Mutex::new(Tasks::default()),
                span,
            }),
        }
    }

    pub fn local_member(&self) -> Member {
        self.inner.node.local()
    }

    /// Look up a member by id. The local member is only listed once the
    /// service has started.
    pub fn member(&self, id: &MemberId) -> Option<Member> {
        self.inner.node.store().get(id)
    }

    /// A snapshot of every known member, the local one included once the
    /// service has started.
    pub fn members(&self) -> Vec<Member> {
        self.inner.node.store().list()
    }

    /// Set a metadata entry on the local member and push it to peers right
    /// away. Returns the updated local member.
    pub fn put_metadata(&self, key: impl Into<String>, value: impl Into<String>) -> Member {
        self.inner.node.put_metadata(key.into(), value.into())
    }

    /// Must be called from within a Tokio runtime.
    pub fn add_listener<L: Listener>(&self, listener: L) -> ListenerId {
        self.inner.events.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.events.remove_listener(id)
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.events.subscribe()
    }

    pub fn status(&self) -> Status {
        *self.inner.status.borrow()
    }

    /// Bind the transport, join the seeds and start gossiping.
    ///
    /// Returns once the service is active. Calling it while the service is
    /// starting or active is a no-op; calling it on a stopping or stopped
    /// service fails with [`ErrorKind::InvalidState`]. If the transport
    /// cannot be bound the service goes back to `Inactive` and the error is
    /// returned. Dropping the returned future does not abort the launch; the
    /// service still settles in `Active` or `Inactive`.
    ///
    /// [`ErrorKind::InvalidState`]: crate::ErrorKind::InvalidState
    pub async fn start(&self) -> Result<()> {
        let mut status = self.inner.status.subscribe();

        loop {
            match self.inner.transition(Status::Inactive, Status::Starting) {
                Status::Inactive => break,
                Status::Active => return Ok(()),
                Status::Starting => {
                    if status.changed().await.is_err() {
                        return Err(Error::new_invalid_state(None));
                    }
                }
                Status::Stopping | Status::Stopped => {
                    return Err(Error::new_invalid_state(Some(
                        "service is stopping or stopped".into(),
                    )))
                }
            }
        }

        // The launch runs to completion even if the caller stops waiting.
        let inner = self.inner.clone();
        let launch = tokio::spawn(async move {
            let span = inner.span.clone();
            let res = inner.launch().instrument(span).await;

            match &res {
                Ok(()) => {
                    inner.status.send_replace(Status::Active);
                }
                Err(e) => {
                    warn!(parent: &inner.span, error = %e, "unable to start");
                    inner.status.send_replace(Status::Inactive);
                }
            }

            res
        });

        match launch.await {
            Ok(res) => res,
            Err(e) => {
                self.inner.abort_tasks();
                self.inner.status.send_replace(Status::Inactive);
                Err(Error::new_start(Some(Box::new(e))))
            }
        }
    }

    /// Announce the departure, halt every background task and move to the
    /// terminal `Stopped` state. A no-op unless the service is active; while
    /// it is starting or stopping this waits for that to finish first.
    pub async fn stop(&self) -> Result<()> {
        let mut status = self.inner.status.subscribe();

        loop {
            match self.inner.transition(Status::Active, Status::Stopping) {
                Status::Active => break,
                Status::Inactive | Status::Stopped => return Ok(()),
                Status::Starting | Status::Stopping => {
                    if status.changed().await.is_err() {
                        return Ok(());
                    }
                }
            }
        }

        let span = self.inner.span.clone();
        self.inner.shutdown().instrument(span).await;
        self.inner.status.send_replace(Status::Stopped);

        Ok(())
    }
}

impl Inner {
    /// Move from `from` to `to` if the service is in `from`. Returns the
    /// status observed before the attempt.
    fn transition(&self, from: Status, to: Status) -> Status {
        let mut observed = from;

        self.status.send_if_modified(|status| {
            observed = *status;
            if *status == from {
                *status = to;
                true
            } else {
                false
            }
        });

        observed
    }

    async fn launch(&self) -> Result<()> {
        let incoming = self
            .messaging
            .listen()
            .await
            .map_err(|e| Error::new_start(Some(Box::new(e))))?;

        let announcements = match &self.broadcaster {
            Some(broadcaster) => Some(
                broadcaster
                    .subscribe()
                    .map_err(|e| Error::new_start(Some(Box::new(e))))?,
            ),
            None => None,
        };

        self.node.publish();

        let mut server = vec![tokio::spawn(
            serve(self.node.clone(), incoming).instrument(self.span.clone()),
        )];

        if let (Some(broadcaster), Some(frames)) = (&self.broadcaster, announcements) {
            let announce = announce(
                self.node.clone(),
                broadcaster.clone(),
                self.messaging.address().clone(),
                frames,
            );
            server.push(tokio::spawn(announce.instrument(self.span.clone())));
        }

        lock(&self.tasks).server = server;

        let seeds = match self.discovery.resolve_seeds().await {
            Ok(seeds) => seeds,
            Err(e) => {
                warn!(error = %e, "seed resolution failed, starting alone");
                HashSet::new()
            }
        };

        let joined = Join::new(self.node.clone(), self.messaging.clone())
            .run(&seeds)
            .await;

        info!(
            seeds = seeds.len(),
            joined,
            members = self.node.store().len(),
            "membership started"
        );

        let gossip = Gossip::new(self.node.clone(), self.messaging.clone(), seeds);

        lock(&self.tasks).periodic = vec![
            tokio::spawn(gossip.run().instrument(self.span.clone())),
            tokio::spawn(gossip::sweep(self.node.clone()).instrument(self.span.clone())),
        ];

        Ok(())
    }

    fn abort_tasks(&self) {
        let mut guard = lock(&self.tasks);
        let tasks = &mut *guard;
        for task in tasks.server.drain(..).chain(tasks.periodic.drain(..)) {
            task.abort();
        }
    }

    async fn shutdown(&self) {
        let periodic = std::mem::take(&mut lock(&self.tasks).periodic);
        for task in &periodic {
            task.abort();
        }
        join_all(periodic).await;

        let leave = Leave {
            member: self.node.leave(),
        };

        if let Some(broadcaster) = &self.broadcaster {
            match encode(&Announcement::Leave(leave.clone())) {
                Ok(frame) => {
                    if let Err(e) = broadcaster.broadcast(frame).await {
                        debug!(error = %e, "leave broadcast failed");
                    }
                }
                Err(e) => warn!("unable to encode leave: {}", e),
            }
        }

        let config = self.node.config();
        let targets = self.node.gossip_targets(config.gossip_fanout);

        match encode(&Request::Leave(leave)) {
            Ok(payload) => {
                let sends = targets.iter().map(|target| {
                    time::timeout(
                        config.request_timeout,
                        self.messaging.send(target.address(), payload.clone()),
                    )
                });
                join_all(sends).await;
            }
            Err(e) => warn!("unable to encode leave: {}", e),
        }

        let server = std::mem::take(&mut lock(&self.tasks).server);
        for task in &server {
            task.abort();
        }
        join_all(server).await;

        info!("membership stopped");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

impl fmt::Debug for MembershipService {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MembershipService")
            .field("member", self.inner.node.id())
            .field("status", &self.status())
            .finish()
    }
}

async fn serve(node: Arc<Node>, incoming: transport::Incoming) {
    incoming
        .for_each_concurrent(None, |req| {
            let node = node.clone();
            async move { handle(&node, req) }
        })
        .await;

    debug!("transport closed");
}

fn handle(node: &Node, req: transport::Request) {
    let res = match decode::<Request>(req.payload()) {
        Ok(Request::Join(join)) => Response::Join(node.receive_join(join)),
        Ok(Request::Gossip(push)) => Response::Gossip(node.receive_push(push)),
        Ok(Request::Leave(leave)) => {
            node.receive_leave(leave);
            Response::Ack
        }
        Err(e) => {
            debug!(from = %req.sender(), "dropping malformed request: {}", e);
            return;
        }
    };

    match encode(&res) {
        Ok(payload) => {
            if req.respond(payload).is_err() {
                trace!("requester went away");
            }
        }
        Err(e) => warn!("unable to encode response: {}", e),
    }
}

async fn announce(
    node: Arc<Node>,
    broadcaster: Arc<dyn Broadcaster>,
    address: Address,
    mut frames: BoxStream<'static, bytes::Bytes>,
) {
    while let Some(frame) = frames.next().await {
        match decode::<Announcement>(&frame) {
            Ok(Announcement::Leave(leave)) => node.receive_leave(leave),
            Ok(Announcement::Discover { address: from }) => {
                trace!(%from, "answering discovery");

                let advertise = Announcement::Advertise {
                    address: address.clone(),
                };
                let sent = match encode(&advertise) {
                    Ok(frame) => broadcaster.broadcast(frame).await,
                    Err(e) => Err(e),
                };

                if let Err(e) = sent {
                    debug!(error = %e, "unable to advertise");
                }
            }
            Ok(Announcement::Advertise { .. }) => {}
            Err(e) => debug!("ignoring malformed announcement: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ErrorKind, member::State, test_utils::trace_init,
        transport::local::LocalNetwork, StaticDiscovery,
    };
    use std::time::Duration;

    fn addr(port: u16) -> Address {
        Address::new("localhost", port)
    }

    fn service(network: &LocalNetwork, id: &str, port: u16) -> MembershipService {
        MembershipService::builder()
            .member(Member::new(id, addr(port)))
            .messaging(network.messaging(addr(port)))
            .discovery(StaticDiscovery::new(vec![]))
            .finish()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn lone_node_stays_inactive() {
        trace_init();
        let network = LocalNetwork::new();
        let service = service(&network, "a", 1);

        assert_eq!(service.status(), Status::Inactive);
        assert_ok!(service.start().await);
        assert_eq!(service.status(), Status::Active);

        time::sleep(Duration::from_secs(1)).await;

        let members = service.members();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].state(), State::Inactive);
    }

    #[tokio::test(start_paused = true)]
    async fn unstarted_service_lists_nobody() {
        let network = LocalNetwork::new();
        let service = service(&network, "a", 1);

        assert!(service.member(&"a".into()).is_none());
        assert!(service.members().is_empty());
        assert_eq!(service.local_member().id(), &MemberId::from("a"));

        service.start().await.unwrap();
        assert!(service.member(&"a".into()).is_some());
        assert_eq!(service.members().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_are_idempotent() {
        let network = LocalNetwork::new();
        let service = service(&network, "a", 1);

        assert_ok!(service.stop().await);
        assert_eq!(service.status(), Status::Inactive);

        assert_ok!(service.start().await);
        assert_ok!(service.start().await);

        assert_ok!(service.stop().await);
        assert_ok!(service.stop().await);
        assert_eq!(service.status(), Status::Stopped);
        assert_eq!(service.local_member().state(), State::Inactive);

        let err = service.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_start_still_settles() {
        trace_init();
        let network = LocalNetwork::new();
        let _silent = network.messaging(addr(2)).listen().await.unwrap();
        let service = MembershipService::builder()
            .member(Member::new("a", addr(1)))
            .messaging(network.messaging(addr(1)))
            .discovery(StaticDiscovery::new(vec![addr(2)]))
            .finish()
            .unwrap();

        let pending = time::timeout(Duration::from_millis(100), service.start()).await;
        assert_err!(pending);
        assert_eq!(service.status(), Status::Starting);

        // The join gives up on the silent seed and the launch completes.
        let stopped = time::timeout(Duration::from_secs(30), service.stop()).await;
        assert_ok!(assert_ok!(stopped));
        assert_eq!(service.status(), Status::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_start_can_be_awaited_again() {
        let network = LocalNetwork::new();
        let _silent = network.messaging(addr(2)).listen().await.unwrap();
        let service = MembershipService::builder()
            .member(Member::new("a", addr(1)))
            .messaging(network.messaging(addr(1)))
            .discovery(StaticDiscovery::new(vec![addr(2)]))
            .finish()
            .unwrap();

        assert_err!(time::timeout(Duration::from_millis(100), service.start()).await);

        let again = time::timeout(Duration::from_secs(30), service.start()).await;
        assert_ok!(assert_ok!(again));
        assert_eq!(service.status(), Status::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn bind_failure_is_fatal() {
        let network = LocalNetwork::new();
        let _taken = network.messaging(addr(1)).listen().await.unwrap();
        let service = service(&network, "a", 1);

        trace_init();
        let err = assert_err!(service.start().await);
        assert_eq!(err.kind(), ErrorKind::Start);
        assert_eq!(service.status(), Status::Inactive);
    }

    #[tokio::test(start_paused = true)]
    async fn metadata_before_start_is_kept() {
        let network = LocalNetwork::new();
        let service = service(&network, "a", 1);

        let before = service.local_member().incarnation();
        let member = service.put_metadata("role", "web");
        assert_eq!(member.incarnation(), before + 1);

        service.start().await.unwrap();
        let stored = service.member(&"a".into()).unwrap();
        assert_eq!(stored.metadata().get("role").map(String::as_str), Some("web"));
    }
}
