// Connection lifecycle: open, reconnect with backoff, resubscribe, close.
//
// One background task owns the transport connection. Callers talk to it through
// the shared registry plus a reconcile channel; state is published on a
// broadcast channel so every observer sees each transition in order.
use crate::backoff::BackoffPolicy;
use crate::subscription::{
    ChannelSubscription, EventCallback, Registry, SubscriptionHandle, SubscriptionState,
};
use chime_common::{Topic, UserId};
use chime_transport::{Inbound, PushConnection, PushEvent, PushTransport, TransportError};
use futures::Stream;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const STATE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection manager is closed")]
    Closed,
    #[error("connection manager is already open")]
    AlreadyOpen,
}

#[derive(Debug)]
enum Command {
    Reconcile,
}

pub(crate) struct Shared {
    // Lock order: state before registry.
    state: Mutex<ConnectionState>,
    registry: Mutex<Registry>,
    transitions: broadcast::Sender<ConnectionState>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Shared {
    /// Returns false when the move is refused (already there, or Closed).
    fn transition(&self, next: ConnectionState) -> bool {
        let mut state = self.state.lock();
        let previous = *state;
        if previous == next || previous == ConnectionState::Closed {
            return false;
        }
        *state = next;
        if matches!(
            next,
            ConnectionState::Reconnecting | ConnectionState::Closed
        ) {
            self.registry.lock().invalidate_all();
        }
        // Sent under the lock so observers see transitions in order.
        let _ = self.transitions.send(next);
        tracing::debug!(from = ?previous, to = ?next, "connection state changed");
        true
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    fn request_reconcile(&self) {
        let _ = self.commands.send(Command::Reconcile);
    }

    // Registration states only go Active while actually connected.
    fn publish_wire_states(&self, subscribed: &BTreeSet<Topic>, refused: &BTreeSet<Topic>) {
        let state = self.state.lock();
        if *state == ConnectionState::Connected {
            self.registry.lock().sync_states(subscribed, refused);
        }
    }

    pub(crate) fn unregister(&self, id: u64) {
        if self.registry.lock().remove(id) {
            self.request_reconcile();
        }
    }

    pub(crate) fn registration_state(&self, id: u64) -> Option<SubscriptionState> {
        self.registry.lock().state_of(id)
    }
}

/// Owns the push connection for one session.
///
/// ```
/// use chime_broker::Broker;
/// use chime_client::{BackoffPolicy, ConnectionManager, ConnectionState};
/// use chime_transport::InProcessTransport;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let transport = Arc::new(InProcessTransport::new(Arc::new(Broker::new())));
/// let manager = ConnectionManager::new(
///     transport,
///     BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(100)),
/// );
/// assert_eq!(manager.state(), ConnectionState::Disconnected);
/// manager.close();
/// assert_eq!(manager.state(), ConnectionState::Closed);
/// ```
pub struct ConnectionManager {
    shared: Arc<Shared>,
    transport: Arc<dyn PushTransport>,
    policy: BackoffPolicy,
    cancel: CancellationToken,
    // Taken by `open`; its presence means the manager has never been opened.
    commands: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn PushTransport>, policy: BackoffPolicy) -> Self {
        let (transitions, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ConnectionState::Disconnected),
                registry: Mutex::new(Registry::default()),
                transitions,
                commands: commands_tx,
            }),
            transport,
            policy,
            cancel: CancellationToken::new(),
            commands: Mutex::new(Some(commands_rx)),
            task: Mutex::new(None),
        }
    }

    /// Start connecting for `user` in the background. Must be called from
    /// within a Tokio runtime.
    pub fn open(&self, user: UserId) -> Result<(), ConnectionError> {
        if self.shared.state() == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }
        let Some(commands) = self.commands.lock().take() else {
            return Err(ConnectionError::AlreadyOpen);
        };
        let driver = Driver {
            shared: Arc::clone(&self.shared),
            transport: Arc::clone(&self.transport),
            policy: self.policy,
            user,
            cancel: self.cancel.clone(),
            commands,
        };
        *self.task.lock() = Some(tokio::spawn(driver.run()));
        Ok(())
    }

    /// Tear down unconditionally. Closed is terminal.
    pub fn close(&self) {
        self.cancel.cancel();
        self.commands.lock().take();
        self.shared.transition(ConnectionState::Closed);
    }

    /// `close`, then wait for the background task to release the transport.
    pub async fn shutdown(&self) {
        self.close();
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(err) = task.await
        {
            tracing::warn!(error = %err, "connection task ended abnormally");
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Fresh stream per call: yields the current state, then each transition,
    /// and ends after yielding `Closed`.
    pub fn state_changes(&self) -> impl Stream<Item = ConnectionState> + Send + 'static {
        // Subscribe before reading so nothing slips between the two.
        let receiver = self.shared.transitions.subscribe();
        let current = self.shared.state();
        futures::stream::unfold(
            StateStream {
                receiver,
                pending: Some(current),
                last: None,
                done: false,
            },
            |mut stream| async move {
                let next = stream.next().await?;
                Some((next, stream))
            },
        )
    }

    /// Register interest in `event_name` on `topic`. Allowed in any state but
    /// Closed; the wire subscription follows whenever the manager is Connected.
    pub fn subscribe<F>(
        &self,
        topic: Topic,
        event_name: impl Into<String>,
        on_event: F,
    ) -> Result<SubscriptionHandle, ConnectionError>
    where
        F: Fn(&PushEvent) + Send + Sync + 'static,
    {
        let event_name = event_name.into();
        let on_event: EventCallback = Arc::new(on_event);
        let id = {
            let state = self.shared.state.lock();
            if *state == ConnectionState::Closed {
                return Err(ConnectionError::Closed);
            }
            self.shared
                .registry
                .lock()
                .register(topic.clone(), event_name.clone(), on_event)
        };
        self.shared.request_reconcile();
        tracing::debug!(topic = %topic, event = %event_name, "subscription registered");
        Ok(SubscriptionHandle::new(
            id,
            topic,
            event_name,
            Arc::downgrade(&self.shared),
        ))
    }

    pub fn subscriptions(&self) -> Vec<ChannelSubscription> {
        self.shared.registry.lock().descriptors()
    }

    pub fn registration_count(&self) -> usize {
        self.shared.registry.lock().len()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}

struct StateStream {
    receiver: broadcast::Receiver<ConnectionState>,
    pending: Option<ConnectionState>,
    last: Option<ConnectionState>,
    done: bool,
}

impl StateStream {
    async fn next(&mut self) -> Option<ConnectionState> {
        if self.done {
            return None;
        }
        loop {
            let next = match self.pending.take() {
                Some(state) => state,
                None => match self.receiver.recv().await {
                    Ok(state) => state,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "state observer lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            };
            if self.last == Some(next) {
                continue;
            }
            self.last = Some(next);
            self.done = next == ConnectionState::Closed;
            return Some(next);
        }
    }
}

enum DriveOutcome {
    Cancelled,
    Lost(String),
}

// Topics the live connection holds, and those the server refused.
#[derive(Default)]
struct WireTopics {
    subscribed: BTreeSet<Topic>,
    refused: BTreeSet<Topic>,
}

struct Driver {
    shared: Arc<Shared>,
    transport: Arc<dyn PushTransport>,
    policy: BackoffPolicy,
    user: UserId,
    cancel: CancellationToken,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Driver {
    async fn run(mut self) {
        let mut backoff = self.policy.backoff();
        let mut connected_before = false;
        self.shared.transition(ConnectionState::Connecting);
        loop {
            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => break,
                attempt = self.transport.connect(&self.user) => attempt,
            };
            match attempt {
                Ok(mut connection) => {
                    if !self.shared.transition(ConnectionState::Connected) {
                        connection.close().await;
                        break;
                    }
                    if connected_before {
                        metrics::counter!("chime_reconnects_total").increment(1);
                    }
                    connected_before = true;
                    backoff.reset();
                    tracing::info!(user = %self.user, "push connection established");
                    let outcome = self.drive(connection.as_mut()).await;
                    connection.close().await;
                    match outcome {
                        DriveOutcome::Cancelled => break,
                        DriveOutcome::Lost(reason) => {
                            tracing::warn!(user = %self.user, reason = %reason, "push connection lost");
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        user = %self.user,
                        attempt = backoff.attempt(),
                        error = %err,
                        "push connect failed"
                    );
                }
            }
            self.shared.transition(ConnectionState::Reconnecting);
            let delay = backoff.next_delay();
            tracing::debug!(delay_ms = delay.as_millis() as u64, "reconnecting after delay");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.shared.transition(ConnectionState::Closed);
        tracing::debug!(user = %self.user, "connection task finished");
    }

    async fn drive(&mut self, connection: &mut dyn PushConnection) -> DriveOutcome {
        let mut wire = WireTopics::default();
        // Registrations made while disconnected are picked up here.
        if let Err(err) = self.reconcile(connection, &mut wire).await {
            return DriveOutcome::Lost(err.to_string());
        }
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return DriveOutcome::Cancelled,
                command = self.commands.recv() => {
                    let Some(Command::Reconcile) = command else {
                        return DriveOutcome::Cancelled;
                    };
                    let reconciled = tokio::select! {
                        _ = self.cancel.cancelled() => return DriveOutcome::Cancelled,
                        result = self.reconcile(connection, &mut wire) => result,
                    };
                    if let Err(err) = reconciled {
                        return DriveOutcome::Lost(err.to_string());
                    }
                }
                inbound = connection.next_inbound() => match inbound {
                    Ok(Some(Inbound::Event(event))) => self.dispatch(&event),
                    Ok(Some(Inbound::SubscriptionFailed { topic, reason })) => {
                        tracing::warn!(topic = %topic, reason = %reason, "subscription refused");
                        if let Ok(topic) = Topic::new(topic) {
                            wire.refused.insert(topic);
                        }
                        self.shared.publish_wire_states(&wire.subscribed, &wire.refused);
                    }
                    Ok(None) => return DriveOutcome::Lost("closed by peer".into()),
                    Err(err) => return DriveOutcome::Lost(err.to_string()),
                },
            }
        }
    }

    async fn reconcile(
        &self,
        connection: &mut dyn PushConnection,
        wire: &mut WireTopics,
    ) -> Result<(), TransportError> {
        let wanted = self.shared.registry.lock().wanted_topics();
        let stale = wire
            .subscribed
            .difference(&wanted)
            .cloned()
            .collect::<Vec<_>>();
        for topic in stale {
            connection.unsubscribe(&topic).await?;
            wire.subscribed.remove(&topic);
            wire.refused.remove(&topic);
            tracing::debug!(topic = %topic, "unsubscribed");
        }
        let missing = wanted
            .difference(&wire.subscribed)
            .cloned()
            .collect::<Vec<_>>();
        for topic in missing {
            connection.subscribe(&topic).await?;
            tracing::debug!(topic = %topic, "subscribed");
            wire.subscribed.insert(topic);
        }
        self.shared
            .publish_wire_states(&wire.subscribed, &wire.refused);
        Ok(())
    }

    fn dispatch(&self, event: &PushEvent) {
        metrics::counter!("chime_push_events_total").increment(1);
        // Cloned out so callbacks run without the registry lock.
        let callbacks = self
            .shared
            .registry
            .lock()
            .callbacks_for(&event.topic, &event.event);
        if callbacks.is_empty() {
            tracing::debug!(topic = %event.topic, event = %event.event, "no subscriber for event");
        }
        for callback in callbacks {
            callback(event);
        }
    }
}
