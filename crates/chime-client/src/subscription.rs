// Channel subscriptions: the registry the connection manager reconciles against,
// and the caller-facing handle.
use crate::connection::Shared;
use chime_common::Topic;
use chime_transport::PushEvent;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Inactive,
    Active,
    Error,
}

/// Descriptor of one registered interest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSubscription {
    pub topic: Topic,
    pub event_name: String,
    pub state: SubscriptionState,
}

pub type EventCallback = Arc<dyn Fn(&PushEvent) + Send + Sync>;

struct Registration {
    topic: Topic,
    event_name: String,
    state: SubscriptionState,
    on_event: EventCallback,
}

#[derive(Default)]
pub(crate) struct Registry {
    next_id: u64,
    entries: BTreeMap<u64, Registration>,
}

impl Registry {
    pub(crate) fn register(
        &mut self,
        topic: Topic,
        event_name: String,
        on_event: EventCallback,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            Registration {
                topic,
                event_name,
                state: SubscriptionState::Inactive,
                on_event,
            },
        );
        id
    }

    pub(crate) fn remove(&mut self, id: u64) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub(crate) fn state_of(&self, id: u64) -> Option<SubscriptionState> {
        self.entries.get(&id).map(|entry| entry.state)
    }

    /// Topics at least one registration wants on the wire.
    pub(crate) fn wanted_topics(&self) -> BTreeSet<Topic> {
        self.entries
            .values()
            .map(|entry| entry.topic.clone())
            .collect()
    }

    pub(crate) fn invalidate_all(&mut self) {
        for entry in self.entries.values_mut() {
            entry.state = SubscriptionState::Inactive;
        }
    }

    /// Align registration states with what the live connection holds.
    pub(crate) fn sync_states(&mut self, subscribed: &BTreeSet<Topic>, refused: &BTreeSet<Topic>) {
        for entry in self.entries.values_mut() {
            entry.state = if refused.contains(&entry.topic) {
                SubscriptionState::Error
            } else if subscribed.contains(&entry.topic) {
                SubscriptionState::Active
            } else {
                SubscriptionState::Inactive
            };
        }
    }

    pub(crate) fn callbacks_for(&self, topic: &str, event_name: &str) -> Vec<EventCallback> {
        self.entries
            .values()
            .filter(|entry| entry.topic.as_str() == topic && entry.event_name == event_name)
            .map(|entry| Arc::clone(&entry.on_event))
            .collect()
    }

    pub(crate) fn descriptors(&self) -> Vec<ChannelSubscription> {
        self.entries
            .values()
            .map(|entry| ChannelSubscription {
                topic: entry.topic.clone(),
                event_name: entry.event_name.clone(),
                state: entry.state,
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Returned by [`ConnectionManager::subscribe`](crate::ConnectionManager::subscribe).
///
/// `cancel` is idempotent and also runs on drop, so a subscription never
/// outlives its owner.
pub struct SubscriptionHandle {
    id: u64,
    topic: Topic,
    event_name: String,
    cancelled: AtomicBool,
    shared: Weak<Shared>,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: u64, topic: Topic, event_name: String, shared: Weak<Shared>) -> Self {
        Self {
            id,
            topic,
            event_name,
            cancelled: AtomicBool::new(false),
            shared,
        }
    }

    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.unregister(self.id);
        }
        tracing::debug!(topic = %self.topic, event = %self.event_name, "subscription cancelled");
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn state(&self) -> SubscriptionState {
        if self.is_cancelled() {
            return SubscriptionState::Inactive;
        }
        self.shared
            .upgrade()
            .and_then(|shared| shared.registration_state(self.id))
            .unwrap_or(SubscriptionState::Inactive)
    }

    pub fn descriptor(&self) -> ChannelSubscription {
        ChannelSubscription {
            topic: self.topic.clone(),
            event_name: self.event_name.clone(),
            state: self.state(),
        }
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("topic", &self.topic)
            .field("event_name", &self.event_name)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}
