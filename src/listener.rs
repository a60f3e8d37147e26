//! Fan-out of membership events to registered listeners.
//!
//! Every listener owns a bounded queue fed from a single broadcast channel
//! and drained by its own delivery task, so a slow listener never blocks the
//! membership store. When a listener falls more than the queue capacity
//! behind, the oldest undelivered events are dropped and a warning is logged.

use crate::event::MembershipEvent;
use futures::stream::{self, Stream};
use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{trace, warn};

/// Receives membership events in the order the local store produced them.
pub trait Listener: Send + Sync + 'static {
    fn on_event(&self, event: MembershipEvent);
}

impl<F> Listener for F
where
    F: Fn(MembershipEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: MembershipEvent) {
        (self)(event)
    }
}

impl Listener for mpsc::UnboundedSender<MembershipEvent> {
    fn on_event(&self, event: MembershipEvent) {
        let _ = self.send(event);
    }
}

/// Opaque handle returned when registering a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MembershipEvent>,
    listeners: Arc<Mutex<HashMap<ListenerId, JoinHandle<()>>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a bus whose per-listener queues hold `capacity` events.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));

        Self {
            tx,
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queue `event` for every registered listener without waiting on any of
    /// them.
    pub fn publish(&self, event: MembershipEvent) {
        trace!(kind = ?event.kind(), member = %event.subject().id(), "publishing event");
        // No receivers is not an error, nobody is listening yet.
        let _ = self.tx.send(event);
    }

    /// Register `listener`; it sees every event published after this call.
    ///
    /// Must be called from within a Tokio runtime, the delivery task is
    /// spawned on it.
    pub fn add_listener<L: Listener>(&self, listener: L) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut rx = self.tx.subscribe();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => listener.on_event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(listener = id.0, skipped, "listener lagged, dropping oldest events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        lock(&self.listeners).insert(id, task);
        id
    }

    /// Deregister a listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        match lock(&self.listeners).remove(&id) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// A pull-based subscription with the same queueing policy as listeners.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<MembershipEvent>,
}

impl Subscription {
    /// Wait for the next event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<MembershipEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscription lagged, dropping oldest events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = MembershipEvent> {
        stream::unfold(self, |mut sub| async move {
            let event = sub.recv().await?;
            Some((event, sub))
        })
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Subscription").finish()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        common::Address,
        event::EventKind,
        member::Member,
    };
    use futures::StreamExt;
    use std::time::Duration;

    fn member(id: &str, port: u16) -> Member {
        Member::new(id, Address::new("localhost", port))
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = EventBus::new(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.add_listener(tx);

        for i in 0..5 {
            bus.publish(MembershipEvent::added(member(&i.to_string(), i)));
        }

        for i in 0..5 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.kind(), EventKind::MemberAdded);
            assert_eq!(event.subject().id().as_str(), i.to_string());
        }
    }

    #[tokio::test]
    async fn removed_listener_stops_receiving() {
        let bus = EventBus::new(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = bus.add_listener(tx);

        bus.publish(MembershipEvent::added(member("a", 1)));
        assert!(rx.recv().await.is_some());

        assert!(bus.remove_listener(id));
        assert!(!bus.remove_listener(id));
        assert_eq!(bus.listener_count(), 0);

        bus.publish(MembershipEvent::added(member("b", 2)));
        // The sender was dropped with the aborted delivery task.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn closure_listener() {
        let bus = EventBus::new(16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        bus.add_listener(move |event: MembershipEvent| {
            lock(&sink).push(event.kind());
        });

        bus.publish(MembershipEvent::updated(member("a", 1)));
        bus.publish(MembershipEvent::removed(member("a", 1)));

        for _ in 0..100 {
            if lock(&seen).len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert_eq!(
            *lock(&seen),
            vec![EventKind::MemberUpdated, EventKind::MemberRemoved]
        );
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe();

        for i in 0..5 {
            bus.publish(MembershipEvent::added(member(&i.to_string(), i)));
        }

        // Only the newest two survive.
        assert_eq!(sub.recv().await.unwrap().subject().id().as_str(), "3");
        assert_eq!(sub.recv().await.unwrap().subject().id().as_str(), "4");
    }

    #[tokio::test]
    async fn subscription_stream_ends_with_bus() {
        let bus = EventBus::new(4);
        let stream = bus.subscribe().into_stream();

        bus.publish(MembershipEvent::added(member("a", 1)));
        drop(bus);

        let events: Vec<_> = stream.collect().await;
        assert_eq!(events.len(), 1);
    }
}
