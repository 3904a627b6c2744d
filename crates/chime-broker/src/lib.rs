// In-process push broker: connections, per-topic fan-out, and fault injection.
// Each connection owns one bounded inbox; topics keep a slab of subscribed
// connections plus an ArcSwap snapshot so publish never holds a lock while sending.
use arc_swap::ArcSwap;
use bytes::Bytes;
use parking_lot::Mutex;
use slab::Slab;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

pub type Result<T> = std::result::Result<T, BrokerError>;

pub const DEFAULT_INBOX_CAPACITY: usize = 1024;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker is unreachable")]
    Unreachable,
    #[error("connection {0} is closed")]
    ConnectionClosed(u64),
    #[error("invalid topic {0:?}")]
    InvalidTopic(String),
}

/// One event delivered to a connection's inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub event: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone)]
struct Subscriber {
    connection_id: u64,
    sender: mpsc::Sender<Delivery>,
}

#[derive(Debug)]
struct TopicState {
    subscribers: Mutex<Slab<Subscriber>>,
    // Read by publish without taking the registry lock.
    snapshot: ArcSwap<Vec<Subscriber>>,
}

impl TopicState {
    fn new() -> Self {
        Self {
            subscribers: Mutex::new(Slab::new()),
            snapshot: ArcSwap::from_pointee(Vec::new()),
        }
    }

    fn insert(&self, subscriber: Subscriber) -> usize {
        let mut subscribers = self.subscribers.lock();
        let key = subscribers.insert(subscriber);
        self.rebuild_snapshot(&subscribers);
        key
    }

    // Returns true when the topic has no subscribers left.
    fn remove(&self, key: usize) -> bool {
        let mut subscribers = self.subscribers.lock();
        if subscribers.contains(key) {
            subscribers.remove(key);
            self.rebuild_snapshot(&subscribers);
        }
        subscribers.is_empty()
    }

    fn rebuild_snapshot(&self, subscribers: &Slab<Subscriber>) {
        let snapshot = subscribers
            .iter()
            .map(|(_, subscriber)| subscriber.clone())
            .collect::<Vec<_>>();
        self.snapshot.store(Arc::new(snapshot));
    }

    fn len(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[derive(Debug)]
struct ConnectionEntry {
    sender: mpsc::Sender<Delivery>,
    // topic -> slab key inside that topic's registry
    subscriptions: HashMap<String, usize>,
}

/// In-process push broker.
///
/// ```
/// use bytes::Bytes;
/// use chime_broker::Broker;
/// use std::sync::Arc;
///
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let broker = Arc::new(Broker::new());
///     let mut connection = broker.connect().expect("connect");
///     connection.subscribe("user.42").expect("subscribe");
///     broker.publish("user.42", "notification.created", Bytes::from_static(b"{}"));
///     let delivery = connection.recv().await.expect("delivery");
///     assert_eq!(delivery.event, "notification.created");
/// });
/// ```
#[derive(Debug)]
pub struct Broker {
    // Lock order: connections before topics.
    connections: Mutex<HashMap<u64, ConnectionEntry>>,
    topics: Mutex<HashMap<String, Arc<TopicState>>>,
    next_connection_id: AtomicU64,
    reachable: AtomicBool,
    inbox_capacity: usize,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            topics: Mutex::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
            reachable: AtomicBool::new(true),
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
        }
    }

    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity.max(1);
        self
    }

    /// Open a new connection. Fails while the broker is marked unreachable.
    pub fn connect(self: &Arc<Self>) -> Result<BrokerConnection> {
        if !self.is_reachable() {
            return Err(BrokerError::Unreachable);
        }
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (sender, inbox) = mpsc::channel(self.inbox_capacity);
        let mut connections = self.connections.lock();
        connections.insert(
            id,
            ConnectionEntry {
                sender,
                subscriptions: HashMap::new(),
            },
        );
        metrics::gauge!("chime_broker_connections").set(connections.len() as f64);
        tracing::debug!(connection_id = id, "broker connection opened");
        Ok(BrokerConnection {
            id,
            inbox,
            broker: Arc::downgrade(self),
        })
    }

    /// Fan an event out to every connection subscribed to `topic`.
    ///
    /// Full inboxes drop the new event. Returns the number of inboxes that
    /// accepted it.
    pub fn publish(&self, topic: &str, event: &str, payload: Bytes) -> usize {
        let Some(state) = self.topics.lock().get(topic).cloned() else {
            return 0;
        };
        let subscribers = state.snapshot.load_full();
        let mut delivered = 0usize;
        for subscriber in subscribers.iter() {
            let delivery = Delivery {
                topic: topic.to_string(),
                event: event.to_string(),
                payload: payload.clone(),
            };
            match subscriber.sender.try_send(delivery) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    metrics::counter!("chime_broker_dropped_total").increment(1);
                    tracing::debug!(
                        connection_id = subscriber.connection_id,
                        topic,
                        "inbox full, dropping event"
                    );
                }
                // The connection is being torn down; its registry entry goes with it.
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .get(topic)
            .map(|state| state.len())
            .unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Sever every open connection. Their inboxes close once drained.
    pub fn disconnect_all(&self) -> usize {
        let ids = self.connections.lock().keys().copied().collect::<Vec<_>>();
        for id in &ids {
            self.disconnect(*id);
        }
        if !ids.is_empty() {
            tracing::info!(count = ids.len(), "broker severed all connections");
        }
        ids.len()
    }

    /// While unreachable, `connect` fails. Existing connections are untouched.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    fn subscribe(&self, connection_id: u64, topic: &str) -> Result<()> {
        if topic.is_empty() {
            return Err(BrokerError::InvalidTopic(topic.to_string()));
        }
        let mut connections = self.connections.lock();
        let entry = connections
            .get_mut(&connection_id)
            .ok_or(BrokerError::ConnectionClosed(connection_id))?;
        if entry.subscriptions.contains_key(topic) {
            return Ok(());
        }
        let state = Arc::clone(
            self.topics
                .lock()
                .entry(topic.to_string())
                .or_insert_with(|| Arc::new(TopicState::new())),
        );
        let key = state.insert(Subscriber {
            connection_id,
            sender: entry.sender.clone(),
        });
        entry.subscriptions.insert(topic.to_string(), key);
        Ok(())
    }

    fn unsubscribe(&self, connection_id: u64, topic: &str) -> Result<()> {
        let mut connections = self.connections.lock();
        let entry = connections
            .get_mut(&connection_id)
            .ok_or(BrokerError::ConnectionClosed(connection_id))?;
        if let Some(key) = entry.subscriptions.remove(topic) {
            self.release(topic, key);
        }
        Ok(())
    }

    fn disconnect(&self, connection_id: u64) {
        let mut connections = self.connections.lock();
        let Some(entry) = connections.remove(&connection_id) else {
            return;
        };
        for (topic, key) in entry.subscriptions {
            self.release(&topic, key);
        }
        metrics::gauge!("chime_broker_connections").set(connections.len() as f64);
        tracing::debug!(connection_id, "broker connection closed");
    }

    fn release(&self, topic: &str, key: usize) {
        let mut topics = self.topics.lock();
        if let Some(state) = topics.get(topic)
            && state.remove(key)
        {
            topics.remove(topic);
        }
    }
}

/// Client side of a broker connection. Dropping it unregisters every subscription.
#[derive(Debug)]
pub struct BrokerConnection {
    id: u64,
    inbox: mpsc::Receiver<Delivery>,
    broker: Weak<Broker>,
}

impl BrokerConnection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn subscribe(&self, topic: &str) -> Result<()> {
        self.broker()?.subscribe(self.id, topic)
    }

    pub fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.broker()?.unsubscribe(self.id, topic)
    }

    /// Next delivery, or `None` once the broker severed this connection.
    ///
    /// Cancel safe.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.inbox.recv().await
    }

    pub fn try_recv(&mut self) -> std::result::Result<Delivery, mpsc::error::TryRecvError> {
        self.inbox.try_recv()
    }

    fn broker(&self) -> Result<Arc<Broker>> {
        self.broker
            .upgrade()
            .ok_or(BrokerError::ConnectionClosed(self.id))
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        if let Some(broker) = self.broker.upgrade() {
            broker.disconnect(self.id);
        }
    }
}
