use super::*;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chime_broker::Broker;
use chime_common::{NotificationRecord, PulledRecord, SendCommand, SendReceipt, UserId};
use chime_transport::InProcessTransport;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

const TOPIC: &str = "user.42";
const EVENT: &str = "notification.created";

// In-memory backend with a gate that can hold pulls in flight.
struct ScriptedBackend {
    records: Mutex<Vec<NotificationRecord>>,
    failing_pulls: AtomicUsize,
    failing_sends: AtomicUsize,
    pulls: AtomicUsize,
    sends: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    gate: watch::Sender<bool>,
}

impl ScriptedBackend {
    fn new() -> Arc<Self> {
        let (gate, _) = watch::channel(true);
        Arc::new(Self {
            records: Mutex::new(Vec::new()),
            failing_pulls: AtomicUsize::new(0),
            failing_sends: AtomicUsize::new(0),
            pulls: AtomicUsize::new(0),
            sends: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            gate,
        })
    }

    fn set_records(&self, records: Vec<NotificationRecord>) {
        *self.records.lock() = records;
    }

    fn hold(&self) {
        self.gate.send_replace(false);
    }

    fn release(&self) {
        self.gate.send_replace(true);
    }

    fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl NotificationBackend for ScriptedBackend {
    async fn pull(&self, _user: &UserId) -> Result<Vec<PulledRecord>, BackendError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if take_one(&self.failing_pulls) {
            return Err(BackendError::Status {
                status: 503,
                body: "scripted failure".into(),
            });
        }
        Ok(self.records.lock().iter().cloned().map(Ok).collect())
    }

    async fn send(&self, _command: &SendCommand) -> Result<SendReceipt, BackendError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.failing_sends) {
            return Err(BackendError::Status {
                status: 500,
                body: "scripted failure".into(),
            });
        }
        Ok(SendReceipt {
            message: "Notification sent".into(),
        })
    }
}

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, minute, 0)
        .single()
        .expect("timestamp")
}

fn record(id: i64, message: &str, minute: u32) -> NotificationRecord {
    NotificationRecord::new(id, message, at(minute))
}

fn user() -> UserId {
    UserId::new("42").expect("user")
}

fn fast_config() -> SyncConfig {
    SyncConfig {
        backoff_base: Duration::from_millis(5),
        backoff_cap: Duration::from_millis(40),
        pull_failure_threshold: 2,
        ..SyncConfig::default()
    }
}

struct Fixture {
    broker: Arc<Broker>,
    backend: Arc<ScriptedBackend>,
    transport: Arc<InProcessTransport>,
}

impl Fixture {
    fn new() -> Self {
        let broker = Arc::new(Broker::new());
        Self {
            transport: Arc::new(InProcessTransport::new(Arc::clone(&broker))),
            broker,
            backend: ScriptedBackend::new(),
        }
    }

    fn dispatcher(&self) -> SyncDispatcher {
        SyncDispatcher::new(
            &fast_config(),
            self.backend.clone(),
            self.transport.clone(),
        )
    }

    fn session(&self) -> NotificationSession {
        NotificationSession::new(
            &fast_config(),
            self.backend.clone(),
            self.transport.clone(),
        )
    }

    fn manager(&self) -> ConnectionManager {
        ConnectionManager::new(self.transport.clone(), fast_config().backoff_policy())
    }

    fn push(&self) -> usize {
        self.broker.publish(TOPIC, EVENT, Bytes::from_static(b"{}"))
    }
}

async fn eventually(what: &str, check: impl Fn() -> bool) -> Result<()> {
    timeout(Duration::from_secs(5), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .with_context(|| format!("timed out waiting for {what}"))
}

fn messages(snapshot: &Snapshot) -> Vec<String> {
    snapshot.iter().map(|record| record.message.clone()).collect()
}

fn subscription_active(dispatcher: &SyncDispatcher) -> bool {
    dispatcher
        .subscription()
        .is_some_and(|subscription| subscription.state == SubscriptionState::Active)
}

#[tokio::test]
async fn push_trigger_pulls_and_merges_newest_first() -> Result<()> {
    let fixture = Fixture::new();
    fixture
        .backend
        .set_records(vec![record(1, "A", 1), record(2, "B", 2)]);
    let dispatcher = fixture.dispatcher();
    dispatcher.start(user())?;

    eventually("initial pull", || dispatcher.snapshot().version == 1).await?;
    assert_eq!(messages(&dispatcher.snapshot()), vec!["B", "A"]);

    eventually("active subscription", || subscription_active(&dispatcher)).await?;
    fixture
        .backend
        .set_records(vec![record(1, "A", 1), record(3, "C", 3)]);
    assert_eq!(fixture.push(), 1);

    eventually("second merge", || dispatcher.snapshot().version == 2).await?;
    assert_eq!(messages(&dispatcher.snapshot()), vec!["C", "B", "A"]);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(dispatcher.snapshot().version, 2);
    dispatcher.stop();
    Ok(())
}

#[tokio::test]
async fn burst_during_pull_collapses_to_one_follow_up() -> Result<()> {
    let fixture = Fixture::new();
    fixture.backend.set_records(vec![record(1, "A", 1)]);
    fixture.backend.hold();
    let dispatcher = fixture.dispatcher();
    dispatcher.start(user())?;

    eventually("initial pull in flight", || fixture.backend.pulls() == 1).await?;
    eventually("active subscription", || subscription_active(&dispatcher)).await?;
    for _ in 0..10 {
        fixture.push();
    }
    // Give the connection task time to run every callback.
    sleep(Duration::from_millis(200)).await;
    assert_eq!(fixture.backend.pulls(), 1);

    fixture.backend.release();
    eventually("follow-up pull", || fixture.backend.pulls() == 2).await?;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(fixture.backend.pulls(), 2);
    assert_eq!(fixture.backend.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(dispatcher.snapshot().version, 1);
    dispatcher.stop();
    Ok(())
}

#[tokio::test]
async fn stop_right_after_start_leaves_nothing_behind() -> Result<()> {
    let fixture = Fixture::new();
    fixture.backend.set_records(vec![record(1, "A", 1)]);
    fixture.backend.hold();
    let dispatcher = fixture.dispatcher();
    dispatcher.start(user())?;
    dispatcher.stop();
    fixture.backend.release();

    sleep(Duration::from_millis(200)).await;
    let snapshot = dispatcher.snapshot();
    assert_eq!(snapshot.version, 0);
    assert!(snapshot.is_empty());
    eventually("broker released", || {
        fixture.broker.subscriber_count(TOPIC) == 0 && fixture.broker.connection_count() == 0
    })
    .await?;
    assert_eq!(dispatcher.connection_state(), ConnectionState::Closed);
    assert!(dispatcher.subscription().is_none());
    assert!(matches!(dispatcher.start(user()), Err(SyncError::Stopped)));
    Ok(())
}

#[tokio::test]
async fn failed_pull_finishing_after_stop_keeps_health() -> Result<()> {
    for _ in 0..20 {
        let fixture = Fixture::new();
        fixture
            .backend
            .failing_pulls
            .store(usize::MAX, Ordering::SeqCst);
        fixture.backend.hold();
        let config = SyncConfig {
            pull_failure_threshold: 1,
            ..fast_config()
        };
        let dispatcher = SyncDispatcher::new(
            &config,
            fixture.backend.clone(),
            fixture.transport.clone(),
        );
        dispatcher.start(user())?;
        eventually("pull in flight", || fixture.backend.pulls() == 1).await?;

        dispatcher.stop();
        fixture.backend.release();
        sleep(Duration::from_millis(20)).await;
        assert_eq!(*dispatcher.health().borrow(), SyncHealth::Healthy);
        assert_eq!(fixture.backend.pulls(), 1);
    }
    Ok(())
}

#[tokio::test]
async fn dropped_connection_resubscribes_and_still_triggers() -> Result<()> {
    let fixture = Fixture::new();
    fixture.backend.set_records(vec![record(1, "A", 1)]);
    let dispatcher = fixture.dispatcher();
    dispatcher.start(user())?;
    eventually("active subscription", || subscription_active(&dispatcher)).await?;
    eventually("initial pull", || dispatcher.snapshot().version == 1).await?;
    let before = dispatcher.subscription().context("subscription")?;

    let mut states = Box::pin(dispatcher.connection().state_changes());
    assert_eq!(states.next().await, Some(ConnectionState::Connected));
    assert_eq!(fixture.broker.disconnect_all(), 1);

    let seen = timeout(Duration::from_secs(5), async {
        let mut seen = Vec::new();
        while let Some(state) = states.next().await {
            seen.push(state);
            if state == ConnectionState::Connected {
                break;
            }
        }
        seen
    })
    .await
    .context("reconnect")?;
    assert_eq!(seen.first(), Some(&ConnectionState::Reconnecting));
    assert_eq!(seen.last(), Some(&ConnectionState::Connected));

    eventually("resubscribed", || {
        subscription_active(&dispatcher) && fixture.broker.subscriber_count(TOPIC) == 1
    })
    .await?;
    let after = dispatcher.subscription().context("subscription")?;
    assert_eq!(after.topic, before.topic);
    assert_eq!(after.event_name, before.event_name);

    let pulls = fixture.backend.pulls();
    fixture
        .backend
        .set_records(vec![record(1, "A", 1), record(2, "B", 2)]);
    fixture.push();
    eventually("pull after reconnect", || fixture.backend.pulls() > pulls).await?;
    eventually("merge after reconnect", || dispatcher.snapshot().version == 2).await?;
    dispatcher.stop();
    Ok(())
}

#[tokio::test]
async fn failing_pulls_degrade_health_but_keep_connection() -> Result<()> {
    let fixture = Fixture::new();
    fixture.backend.set_records(vec![record(1, "A", 1)]);
    fixture
        .backend
        .failing_pulls
        .store(usize::MAX, Ordering::SeqCst);
    let dispatcher = fixture.dispatcher();
    let mut health = dispatcher.health();
    dispatcher.start(user())?;

    timeout(
        Duration::from_secs(5),
        health.wait_for(|health| {
            matches!(
                health,
                SyncHealth::Degraded { consecutive_failures } if *consecutive_failures >= 2
            )
        }),
    )
    .await
    .context("degraded")??;
    eventually("connected", || {
        dispatcher.connection_state() == ConnectionState::Connected
    })
    .await?;
    assert_eq!(dispatcher.snapshot().version, 0);

    fixture.backend.failing_pulls.store(0, Ordering::SeqCst);
    timeout(
        Duration::from_secs(5),
        health.wait_for(|health| *health == SyncHealth::Healthy),
    )
    .await
    .context("healthy")??;
    eventually("merge after recovery", || dispatcher.snapshot().version == 1).await?;
    assert_eq!(dispatcher.connection_state(), ConnectionState::Connected);
    assert_eq!(fixture.broker.connection_count(), 1);
    dispatcher.stop();
    Ok(())
}

#[tokio::test]
async fn unreachable_broker_retries_while_pulls_proceed() -> Result<()> {
    let fixture = Fixture::new();
    fixture.backend.set_records(vec![record(1, "A", 1)]);
    fixture.broker.set_reachable(false);
    let dispatcher = fixture.dispatcher();
    dispatcher.start(user())?;

    eventually("initial pull", || dispatcher.snapshot().version == 1).await?;
    eventually("reconnecting", || {
        dispatcher.connection_state() == ConnectionState::Reconnecting
    })
    .await?;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(
        dispatcher.connection_state(),
        ConnectionState::Reconnecting
    );
    assert_eq!(
        dispatcher.subscription().map(|subscription| subscription.state),
        Some(SubscriptionState::Inactive)
    );

    fixture.broker.set_reachable(true);
    eventually("recovered", || subscription_active(&dispatcher)).await?;
    assert_eq!(dispatcher.connection_state(), ConnectionState::Connected);
    dispatcher.stop();
    Ok(())
}

#[tokio::test]
async fn send_failure_surfaces_once() -> Result<()> {
    let fixture = Fixture::new();
    fixture.backend.failing_sends.store(1, Ordering::SeqCst);
    let dispatcher = fixture.dispatcher();
    dispatcher.start(user())?;

    let result = dispatcher.send(&SendCommand::new(user())).await;
    assert!(matches!(
        result,
        Err(SyncError::Send(BackendError::Status { status: 500, .. }))
    ));
    sleep(Duration::from_millis(100)).await;
    assert_eq!(fixture.backend.sends(), 1);
    dispatcher.stop();
    Ok(())
}

#[tokio::test]
async fn send_and_refresh_pulls_without_push() -> Result<()> {
    let fixture = Fixture::new();
    fixture.backend.set_records(vec![record(1, "A", 1)]);
    let dispatcher = fixture.dispatcher();
    dispatcher.start(user())?;
    eventually("initial pull", || dispatcher.snapshot().version == 1).await?;

    fixture
        .backend
        .set_records(vec![record(1, "A", 1), record(2, "mine", 2)]);
    let receipt = dispatcher
        .send_and_refresh(&SendCommand::new(user()))
        .await?;
    assert_eq!(receipt.message, "Notification sent");
    eventually("refresh", || dispatcher.snapshot().version == 2).await?;
    assert_eq!(messages(&dispatcher.snapshot()), vec!["mine", "A"]);
    dispatcher.stop();
    Ok(())
}

#[tokio::test]
async fn session_start_twice_subscribes_once() -> Result<()> {
    let fixture = Fixture::new();
    let session = fixture.session();
    session.start(user())?;
    session.start(user())?;
    assert_eq!(session.phase(), SessionPhase::Running { user: user() });

    eventually("subscribed", || fixture.broker.subscriber_count(TOPIC) == 1).await?;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(fixture.broker.connection_count(), 1);
    assert_eq!(session.dispatcher().connection().registration_count(), 1);
    session.stop();
    Ok(())
}

#[tokio::test]
async fn session_lifecycle_guards() -> Result<()> {
    let fixture = Fixture::new();
    let session = fixture.session();
    session.stop();
    assert_eq!(session.phase(), SessionPhase::NotStarted);
    assert!(matches!(
        session.send_to_self().await,
        Err(SessionError::NotRunning)
    ));

    session.start(user())?;
    eventually("connected", || fixture.broker.connection_count() == 1).await?;
    session.stop();
    session.stop();
    assert_eq!(session.phase(), SessionPhase::Stopped);

    session.start(user())?;
    assert_eq!(session.phase(), SessionPhase::Stopped);
    eventually("released", || fixture.broker.connection_count() == 0).await?;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(fixture.broker.connection_count(), 0);
    Ok(())
}

#[tokio::test]
async fn dropping_session_tears_down() -> Result<()> {
    let fixture = Fixture::new();
    let session = fixture.session();
    session.start(user())?;
    eventually("subscribed", || fixture.broker.subscriber_count(TOPIC) == 1).await?;
    drop(session);
    eventually("released", || {
        fixture.broker.subscriber_count(TOPIC) == 0 && fixture.broker.connection_count() == 0
    })
    .await
}

#[tokio::test]
async fn session_changes_fire_on_new_versions() -> Result<()> {
    let fixture = Fixture::new();
    fixture.backend.set_records(vec![record(1, "A", 1)]);
    let session = fixture.session();
    let mut changes = session.changes();
    session.start(user())?;

    timeout(Duration::from_secs(5), changes.changed())
        .await
        .context("change")??;
    assert_eq!(changes.borrow_and_update().version, 1);

    assert!(session.mark_read(&chime_common::NotificationId::Int(1)));
    timeout(Duration::from_secs(5), changes.changed())
        .await
        .context("read change")??;
    let snapshot = changes.borrow_and_update().clone();
    assert_eq!(snapshot.version, 2);
    assert_eq!(
        snapshot.records[0].read_state,
        chime_common::ReadState::Read
    );
    Ok(())
}

#[tokio::test]
async fn manager_open_and_close_rules() -> Result<()> {
    let fixture = Fixture::new();
    let manager = fixture.manager();
    manager.open(user())?;
    assert_eq!(manager.open(user()), Err(ConnectionError::AlreadyOpen));
    manager.shutdown().await;
    assert_eq!(manager.state(), ConnectionState::Closed);
    assert_eq!(manager.open(user()), Err(ConnectionError::Closed));
    let topic = chime_common::Topic::new(TOPIC)?;
    assert!(matches!(
        manager.subscribe(topic, EVENT, |_| {}),
        Err(ConnectionError::Closed)
    ));
    assert_eq!(fixture.broker.connection_count(), 0);
    Ok(())
}

#[tokio::test]
async fn state_changes_end_after_close() -> Result<()> {
    let fixture = Fixture::new();
    let manager = fixture.manager();
    let mut states = Box::pin(manager.state_changes());
    assert_eq!(states.next().await, Some(ConnectionState::Disconnected));

    manager.open(user())?;
    assert_eq!(states.next().await, Some(ConnectionState::Connecting));
    assert_eq!(states.next().await, Some(ConnectionState::Connected));
    manager.close();
    assert_eq!(states.next().await, Some(ConnectionState::Closed));
    assert_eq!(states.next().await, None);

    // A stream taken after close yields Closed once and ends.
    let late = manager.state_changes().collect::<Vec<_>>().await;
    assert_eq!(late, vec![ConnectionState::Closed]);
    Ok(())
}

#[tokio::test]
async fn registrations_share_one_wire_subscription() -> Result<()> {
    let fixture = Fixture::new();
    let manager = fixture.manager();
    let hits = Arc::new(AtomicUsize::new(0));
    let first_hits = Arc::clone(&hits);
    let first = manager.subscribe(chime_common::Topic::new(TOPIC)?, EVENT, move |_| {
        first_hits.fetch_add(1, Ordering::SeqCst);
    })?;
    let second = manager.subscribe(chime_common::Topic::new(TOPIC)?, "other.event", |_| {})?;
    manager.open(user())?;

    eventually("both active", || {
        first.state() == SubscriptionState::Active && second.state() == SubscriptionState::Active
    })
    .await?;
    assert_eq!(fixture.broker.subscriber_count(TOPIC), 1);

    fixture.push();
    eventually("callback", || hits.load(Ordering::SeqCst) == 1).await?;

    first.cancel();
    first.cancel();
    assert!(first.is_cancelled());
    assert_eq!(first.state(), SubscriptionState::Inactive);
    sleep(Duration::from_millis(50)).await;
    assert_eq!(fixture.broker.subscriber_count(TOPIC), 1);

    drop(second);
    eventually("unsubscribed", || fixture.broker.subscriber_count(TOPIC) == 0).await?;
    assert_eq!(manager.registration_count(), 0);
    assert!(manager.subscriptions().is_empty());
    manager.close();
    Ok(())
}
