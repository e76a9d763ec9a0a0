use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread::JoinHandle,
};

use bytes::Bytes;
use crossbeam::channel::{unbounded, Receiver, Sender};
use log::debug;

use crate::{
    document::DocId,
    types::{Lsn, TxnId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OpType::Insert => write!(f, "INSERT"),
            OpType::Update => write!(f, "UPDATE"),
            OpType::Delete => write!(f, "DELETE"),
        }
    }
}

/// One committed document operation, as delivered to subscribers.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub lsn: Lsn,
    pub unix_millis: i64,
    pub txn_id: TxnId,
    pub collection: String,
    pub op: OpType,
    pub doc_id: DocId,

    /// Captured only while at least one subscriber of the collection
    /// asked for payloads.
    pub payload: Option<Bytes>,
}

struct Subscriber {
    id: u64,
    capture_payload: bool,
    sink: Sender<ChangeEvent>,
}

#[derive(Default)]
struct Registry {
    /// Per-collection subscriber sinks.
    by_collection: HashMap<String, Vec<Subscriber>>,
}

impl Registry {
    fn payload_wanted(&self, collection: &str) -> bool {
        self.by_collection
            .get(collection)
            .map(|subs| subs.iter().any(|s| s.capture_payload))
            .unwrap_or(false)
    }

    fn remove(&mut self, collection: &str, id: u64) {
        if let Some(subs) = self.by_collection.get_mut(collection) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                self.by_collection.remove(collection);
            }
        }
    }
}

enum Fanout {
    Batch(Vec<ChangeEvent>),
    Stop,
}

/// In-process fan-out of commit-time events.
///
/// The commit path hands a batch of events (one commit, already in
/// operation order) to an unbounded inbox and returns; a single
/// consumer thread clones each event into every matching subscriber's
/// unbounded sink. A slow subscriber therefore never blocks a
/// committer, it only grows its own sink.
pub struct Dispatcher {
    inbox: Sender<Fanout>,
    registry: Arc<Mutex<Registry>>,
    next_subscriber_id: AtomicU64,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        let (inbox, events) = unbounded();
        let registry = Arc::new(Mutex::new(Registry::default()));
        let consumer_registry = Arc::clone(&registry);

        let handle = std::thread::Builder::new()
            .name("small-doc-dispatch".to_string())
            .spawn(move || Self::consume(events, consumer_registry))
            .expect("failed to spawn dispatcher thread");

        Self {
            inbox,
            registry,
            next_subscriber_id: AtomicU64::new(1),
            handle: Mutex::new(Some(handle)),
        }
    }

    fn consume(events: Receiver<Fanout>, registry: Arc<Mutex<Registry>>) {
        while let Ok(msg) = events.recv() {
            let batch = match msg {
                Fanout::Batch(batch) => batch,
                Fanout::Stop => break,
            };
            let registry = registry.lock().unwrap();
            for event in batch {
                if let Some(subs) = registry.by_collection.get(&event.collection) {
                    for sub in subs {
                        let mut event = event.clone();
                        if !sub.capture_payload {
                            event.payload = None;
                        }
                        // a closed sink just means the subscription is
                        // mid-drop; the registry catches up later
                        let _ = sub.sink.send(event);
                    }
                }
            }
        }
        debug!("dispatcher thread stopped");
    }

    /// Register a subscriber for one collection. Events arrive on the
    /// returned subscription's channel in commit-LSN order.
    pub fn subscribe(&self, collection: &str, capture_payload: bool) -> Subscription {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (sink, events) = unbounded();

        self.registry
            .lock()
            .unwrap()
            .by_collection
            .entry(collection.to_string())
            .or_insert_with(Vec::new)
            .push(Subscriber {
                id,
                capture_payload,
                sink,
            });

        debug!(
            "subscribed {} to collection {} (payload: {})",
            id, collection, capture_payload
        );

        Subscription {
            id,
            collection: collection.to_string(),
            events,
            registry: Arc::clone(&self.registry),
        }
    }

    /// Whether the document store must capture payloads for events of
    /// this collection. Checked per operation so that collections with
    /// no payload subscriber skip the copy entirely.
    pub fn payload_wanted(&self, collection: &str) -> bool {
        self.registry.lock().unwrap().payload_wanted(collection)
    }

    /// Whether any subscriber listens to this collection at all.
    pub fn has_subscribers(&self, collection: &str) -> bool {
        self.registry
            .lock()
            .unwrap()
            .by_collection
            .contains_key(collection)
    }

    /// Called by the commit path after the commit record is durable.
    /// Never blocks: the inbox is unbounded.
    pub fn publish(&self, batch: Vec<ChangeEvent>) {
        if batch.is_empty() {
            return;
        }
        let _ = self.inbox.send(Fanout::Batch(batch));
    }

    /// Stop the consumer and drop whatever it has not fanned out yet.
    pub fn shutdown(&self) {
        let _ = self.inbox.send(Fanout::Stop);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A live subscription. Dropping it removes the sink from the
/// dispatcher; events already fanned out stay readable until the
/// receiver is dropped too.
pub struct Subscription {
    id: u64,
    collection: String,
    events: Receiver<ChangeEvent>,
    registry: Arc<Mutex<Registry>>,
}

impl Subscription {
    pub fn events(&self) -> &Receiver<ChangeEvent> {
        &self.events
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.lock().unwrap().remove(&self.collection, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocId;
    use std::time::Duration;

    fn event(lsn: Lsn, collection: &str, key: i64) -> ChangeEvent {
        ChangeEvent {
            lsn,
            unix_millis: 0,
            txn_id: lsn,
            collection: collection.to_string(),
            op: OpType::Insert,
            doc_id: DocId::Int64(key),
            payload: Some(Bytes::from_static(b"payload")),
        }
    }

    #[test]
    fn test_fan_out_in_order() {
        let dispatcher = Dispatcher::new();
        let sub = dispatcher.subscribe("users", false);

        dispatcher.publish(vec![event(1, "users", 1)]);
        dispatcher.publish(vec![event(2, "users", 2), event(2, "users", 3)]);

        let mut lsns = Vec::new();
        for _ in 0..3 {
            let e = sub.events().recv_timeout(Duration::from_secs(1)).unwrap();
            lsns.push(e.lsn);
        }
        assert_eq!(lsns, vec![1, 2, 2]);
    }

    #[test]
    fn test_payload_gating() {
        let dispatcher = Dispatcher::new();
        assert!(!dispatcher.payload_wanted("users"));

        let plain = dispatcher.subscribe("users", false);
        assert!(!dispatcher.payload_wanted("users"));

        let capturing = dispatcher.subscribe("users", true);
        assert!(dispatcher.payload_wanted("users"));

        dispatcher.publish(vec![event(1, "users", 1)]);

        let e = plain.events().recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(e.payload.is_none());
        let e = capturing
            .events()
            .recv_timeout(Duration::from_secs(1))
            .unwrap();
        assert!(e.payload.is_some());

        drop(capturing);
        assert!(!dispatcher.payload_wanted("users"));
    }

    #[test]
    fn test_unsubscribed_collection_receives_nothing() {
        let dispatcher = Dispatcher::new();
        let sub = dispatcher.subscribe("users", false);

        dispatcher.publish(vec![event(1, "orders", 1)]);
        dispatcher.publish(vec![event(2, "users", 2)]);

        let e = sub.events().recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(e.lsn, 2);
        assert!(sub.events().try_recv().is_err());
    }

    #[test]
    fn test_drop_subscription_removes_sink() {
        let dispatcher = Dispatcher::new();
        let sub = dispatcher.subscribe("users", false);
        assert!(dispatcher.has_subscribers("users"));
        drop(sub);
        assert!(!dispatcher.has_subscribers("users"));
    }
}
