// Sync orchestration: push events trigger pulls, pulls merge into the store.
//
// A single worker task per start owns every pull, so at most one is in flight.
// Triggers go through a `Notify`, which holds at most one permit: any number of
// events during a pull collapse into exactly one follow-up pass.
use crate::backend::{BackendError, NotificationBackend};
use crate::backoff::BackoffPolicy;
use crate::config::SyncConfig;
use crate::connection::{ConnectionError, ConnectionManager, ConnectionState};
use crate::store::{NotificationStore, Snapshot};
use crate::subscription::{ChannelSubscription, SubscriptionHandle};
use chime_common::{NotificationId, PulledRecord, SendCommand, SendReceipt, Topic, UserId};
use chime_transport::PushTransport;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncHealth {
    Healthy,
    Degraded { consecutive_failures: u32 },
}

#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("dispatcher already started")]
    AlreadyStarted,
    #[error("dispatcher is stopped")]
    Stopped,
    #[error("send failed")]
    Send(#[source] BackendError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    InvalidTopic(#[from] chime_common::Error),
}

struct SyncShared {
    store: Mutex<NotificationStore>,
    // Bumped on every start/stop; a pull whose epoch no longer matches is discarded.
    epoch: AtomicU64,
    trigger: Notify,
    snapshot: watch::Sender<Snapshot>,
    health: watch::Sender<SyncHealth>,
}

impl SyncShared {
    fn request_sync(&self) {
        self.trigger.notify_one();
    }

    fn publish(&self, store: &NotificationStore) {
        let snapshot = store.snapshot();
        metrics::gauge!("chime_store_records").set(snapshot.len() as f64);
        metrics::gauge!("chime_store_version").set(snapshot.version as f64);
        self.snapshot.send_replace(snapshot);
    }
}

struct Running {
    user: UserId,
    subscription: SubscriptionHandle,
    worker: CancellationToken,
}

/// Keeps one user's store in sync with the backend, driven by push triggers.
pub struct SyncDispatcher {
    topic_prefix: String,
    event_name: String,
    pull_policy: BackoffPolicy,
    pull_failure_threshold: u32,
    backend: Arc<dyn NotificationBackend>,
    connection: ConnectionManager,
    shared: Arc<SyncShared>,
    running: Mutex<Option<Running>>,
    stopped: AtomicBool,
}

impl SyncDispatcher {
    pub fn new(
        config: &SyncConfig,
        backend: Arc<dyn NotificationBackend>,
        transport: Arc<dyn PushTransport>,
    ) -> Self {
        let (snapshot, _) = watch::channel(Snapshot::empty());
        let (health, _) = watch::channel(SyncHealth::Healthy);
        Self {
            topic_prefix: config.topic_prefix.clone(),
            event_name: config.event_name.clone(),
            pull_policy: config.backoff_policy(),
            pull_failure_threshold: config.pull_failure_threshold.max(1),
            backend,
            connection: ConnectionManager::new(transport, config.backoff_policy()),
            shared: Arc::new(SyncShared {
                store: Mutex::new(NotificationStore::new()),
                epoch: AtomicU64::new(0),
                trigger: Notify::new(),
                snapshot,
                health,
            }),
            running: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Schedule the initial pull, open the connection, and subscribe to the
    /// user's topic. Returns without waiting on the network.
    pub fn start(&self, user: UserId) -> Result<(), SyncError> {
        let mut running = self.running.lock();
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SyncError::Stopped);
        }
        if running.is_some() {
            return Err(SyncError::AlreadyStarted);
        }
        let topic = Topic::for_user(&self.topic_prefix, &user)?;
        let epoch = {
            let _store = self.shared.store.lock();
            self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1
        };

        let worker = CancellationToken::new();
        tokio::spawn(
            SyncWorker {
                shared: Arc::clone(&self.shared),
                backend: Arc::clone(&self.backend),
                user: user.clone(),
                epoch,
                pull_policy: self.pull_policy,
                failure_threshold: self.pull_failure_threshold,
                consecutive_failures: 0,
                cancel: worker.clone(),
            }
            .run(),
        );
        // The initial pull goes through the worker like any other trigger.
        self.shared.request_sync();

        let shared = Arc::clone(&self.shared);
        let subscribed = self.connection.open(user.clone()).and_then(|()| {
            self.connection
                .subscribe(topic, self.event_name.clone(), move |event| {
                    // The payload is only a signal; the pull is the source of truth.
                    tracing::trace!(topic = %event.topic, "push trigger");
                    shared.request_sync();
                })
        });
        let subscription = match subscribed {
            Ok(subscription) => subscription,
            Err(err) => {
                worker.cancel();
                return Err(err.into());
            }
        };
        tracing::info!(user = %user, topic = %subscription.topic(), "sync started");
        *running = Some(Running {
            user,
            subscription,
            worker,
        });
        Ok(())
    }

    /// Cancel the subscription, close the connection, and discard any pull
    /// still in flight. Terminal and idempotent.
    pub fn stop(&self) {
        let running = {
            let mut running = self.running.lock();
            self.stopped.store(true, Ordering::SeqCst);
            running.take()
        };
        {
            // Under the store lock so no merge can land after this returns.
            let _store = self.shared.store.lock();
            self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        }
        match running {
            Some(running) => {
                running.subscription.cancel();
                self.connection.close();
                running.worker.cancel();
                tracing::info!(user = %running.user, "sync stopped");
            }
            None => self.connection.close(),
        }
    }

    /// Force a resync; coalesced like push triggers.
    pub fn request_sync(&self) {
        if self.is_running() {
            self.shared.request_sync();
        }
    }

    pub async fn send(&self, command: &SendCommand) -> Result<SendReceipt, SyncError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SyncError::Stopped);
        }
        metrics::counter!("chime_send_total").increment(1);
        match self.backend.send(command).await {
            Ok(receipt) => {
                tracing::debug!(user = %command.user_id, receipt = %receipt, "send accepted");
                Ok(receipt)
            }
            Err(err) => {
                metrics::counter!("chime_send_failures_total").increment(1);
                tracing::warn!(user = %command.user_id, error = %err, "send failed");
                Err(SyncError::Send(err))
            }
        }
    }

    /// `send`, then schedule a resync so self-triggered notifications show up
    /// without waiting for the push round trip.
    pub async fn send_and_refresh(&self, command: &SendCommand) -> Result<SendReceipt, SyncError> {
        let receipt = self.send(command).await?;
        self.request_sync();
        Ok(receipt)
    }

    /// Local read acknowledgement.
    pub fn mark_read(&self, id: &NotificationId) -> bool {
        let mut store = self.shared.store.lock();
        let changed = store.mark_read(id);
        if changed {
            self.shared.publish(&store);
        }
        changed
    }

    pub fn snapshot(&self) -> Snapshot {
        self.shared.snapshot.borrow().clone()
    }

    /// Fires on every version increment.
    pub fn changes(&self) -> watch::Receiver<Snapshot> {
        self.shared.snapshot.subscribe()
    }

    pub fn health(&self) -> watch::Receiver<SyncHealth> {
        self.shared.health.subscribe()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscription(&self) -> Option<ChannelSubscription> {
        self.running
            .lock()
            .as_ref()
            .map(|running| running.subscription.descriptor())
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn dropped_records(&self) -> u64 {
        self.shared.store.lock().dropped_total()
    }
}

impl Drop for SyncDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

struct SyncWorker {
    shared: Arc<SyncShared>,
    backend: Arc<dyn NotificationBackend>,
    user: UserId,
    epoch: u64,
    pull_policy: BackoffPolicy,
    failure_threshold: u32,
    consecutive_failures: u32,
    cancel: CancellationToken,
}

impl SyncWorker {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.shared.trigger.notified() => {}
            }
            if !self.resync().await {
                break;
            }
        }
        tracing::debug!(user = %self.user, "sync worker finished");
    }

    fn is_current(&self) -> bool {
        self.shared.epoch.load(Ordering::SeqCst) == self.epoch
    }

    // Pull until one succeeds. False once this worker has been superseded.
    async fn resync(&mut self) -> bool {
        let mut backoff = self.pull_policy.backoff();
        loop {
            if !self.is_current() {
                return false;
            }
            metrics::counter!("chime_pull_total").increment(1);
            let pulled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                pulled = self.backend.pull(&self.user) => pulled,
            };
            // A result that lands after stop must not reach health or the store.
            if !self.is_current() {
                tracing::debug!(user = %self.user, "discarding pull from a previous run");
                return false;
            }
            match pulled {
                Ok(batch) => {
                    self.record_success();
                    return self.apply(batch);
                }
                Err(err) => {
                    self.record_failure(&err);
                    let delay = backoff.next_delay();
                    tracing::debug!(delay_ms = delay.as_millis() as u64, "retrying pull");
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return false,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn apply(&self, batch: Vec<PulledRecord>) -> bool {
        let mut store = self.shared.store.lock();
        if !self.is_current() {
            tracing::debug!(user = %self.user, "discarding pull from a previous run");
            return false;
        }
        let outcome = store.merge(batch);
        if outcome.dropped > 0 {
            metrics::counter!("chime_merge_dropped_total").increment(outcome.dropped as u64);
        }
        if outcome.changed {
            tracing::debug!(
                user = %self.user,
                version = outcome.version,
                inserted = outcome.inserted,
                updated = outcome.updated,
                "store updated"
            );
            self.shared.publish(&store);
        }
        true
    }

    fn record_success(&mut self) {
        if self.consecutive_failures > 0 {
            tracing::info!(
                user = %self.user,
                failures = self.consecutive_failures,
                "pull recovered"
            );
        }
        self.consecutive_failures = 0;
        self.shared.health.send_if_modified(|health| {
            let changed = *health != SyncHealth::Healthy;
            *health = SyncHealth::Healthy;
            changed
        });
    }

    fn record_failure(&mut self, err: &BackendError) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        metrics::counter!("chime_pull_failures_total").increment(1);
        tracing::warn!(
            user = %self.user,
            attempt = self.consecutive_failures,
            error = %err,
            "pull failed"
        );
        if self.consecutive_failures >= self.failure_threshold {
            self.shared.health.send_replace(SyncHealth::Degraded {
                consecutive_failures: self.consecutive_failures,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use async_trait::async_trait;
    use chime_common::NotificationRecord;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    struct NeverBackend;

    #[async_trait]
    impl NotificationBackend for NeverBackend {
        async fn pull(&self, _user: &UserId) -> Result<Vec<PulledRecord>, BackendError> {
            Ok(Vec::new())
        }

        async fn send(&self, _command: &SendCommand) -> Result<SendReceipt, BackendError> {
            Err(BackendError::MalformedBody("unused".into()))
        }
    }

    // Simulates `stop()` landing while its pull is on the wire.
    struct SupersededDuringPull {
        shared: Arc<SyncShared>,
        fail: bool,
    }

    #[async_trait]
    impl NotificationBackend for SupersededDuringPull {
        async fn pull(&self, _user: &UserId) -> Result<Vec<PulledRecord>, BackendError> {
            self.shared.epoch.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(BackendError::Status {
                    status: 503,
                    body: String::new(),
                })
            } else {
                Ok(batch())
            }
        }

        async fn send(&self, _command: &SendCommand) -> Result<SendReceipt, BackendError> {
            Err(BackendError::MalformedBody("unused".into()))
        }
    }

    fn worker(shared: &Arc<SyncShared>, epoch: u64) -> SyncWorker {
        worker_with(shared, epoch, Arc::new(NeverBackend))
    }

    fn worker_with(
        shared: &Arc<SyncShared>,
        epoch: u64,
        backend: Arc<dyn NotificationBackend>,
    ) -> SyncWorker {
        SyncWorker {
            shared: Arc::clone(shared),
            backend,
            user: UserId::new("42").expect("user"),
            epoch,
            pull_policy: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(2)),
            failure_threshold: 2,
            consecutive_failures: 0,
            cancel: CancellationToken::new(),
        }
    }

    fn shared() -> Arc<SyncShared> {
        let (snapshot, _) = watch::channel(Snapshot::empty());
        let (health, _) = watch::channel(SyncHealth::Healthy);
        Arc::new(SyncShared {
            store: Mutex::new(NotificationStore::new()),
            epoch: AtomicU64::new(1),
            trigger: Notify::new(),
            snapshot,
            health,
        })
    }

    fn batch() -> Vec<PulledRecord> {
        let at = Utc
            .with_ymd_and_hms(2024, 5, 1, 10, 0, 0)
            .single()
            .expect("timestamp");
        vec![Ok(NotificationRecord::new(1_i64, "A", at))]
    }

    #[test]
    fn superseded_pull_is_discarded() {
        let shared = shared();
        let stale = worker(&shared, 1);
        shared.epoch.fetch_add(1, Ordering::SeqCst);

        assert!(!stale.apply(batch()));
        assert!(shared.store.lock().is_empty());
        assert_eq!(shared.snapshot.borrow().version, 0);
    }

    #[test]
    fn current_pull_is_published() {
        let shared = shared();
        let current = worker(&shared, 1);

        assert!(current.apply(batch()));
        assert_eq!(shared.snapshot.borrow().version, 1);
        // Same content again publishes nothing new.
        assert!(current.apply(batch()));
        assert_eq!(shared.snapshot.borrow().version, 1);
    }

    #[test]
    fn health_degrades_at_threshold_and_recovers() {
        let shared = shared();
        let mut worker = worker(&shared, 1);
        let err = BackendError::Status {
            status: 503,
            body: String::new(),
        };

        worker.record_failure(&err);
        assert_eq!(*shared.health.borrow(), SyncHealth::Healthy);
        worker.record_failure(&err);
        assert_eq!(
            *shared.health.borrow(),
            SyncHealth::Degraded {
                consecutive_failures: 2
            }
        );
        worker.record_success();
        assert_eq!(*shared.health.borrow(), SyncHealth::Healthy);
    }

    #[tokio::test]
    async fn failure_after_stop_leaves_health_alone() {
        let shared = shared();
        let backend = Arc::new(SupersededDuringPull {
            shared: Arc::clone(&shared),
            fail: true,
        });
        let mut worker = worker_with(&shared, 1, backend);
        worker.failure_threshold = 1;

        assert!(!worker.resync().await);
        assert_eq!(*shared.health.borrow(), SyncHealth::Healthy);
        assert_eq!(worker.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn success_after_stop_leaves_health_and_store_alone() {
        let shared = shared();
        shared.health.send_replace(SyncHealth::Degraded {
            consecutive_failures: 4,
        });
        let backend = Arc::new(SupersededDuringPull {
            shared: Arc::clone(&shared),
            fail: false,
        });
        let mut worker = worker_with(&shared, 1, backend);

        assert!(!worker.resync().await);
        assert_eq!(
            *shared.health.borrow(),
            SyncHealth::Degraded {
                consecutive_failures: 4
            }
        );
        assert!(shared.store.lock().is_empty());
    }

    #[tokio::test]
    async fn cancelled_worker_never_polls_the_pull() {
        let shared = shared();
        let backend = Arc::new(SupersededDuringPull {
            shared: Arc::clone(&shared),
            fail: false,
        });
        let mut worker = worker_with(&shared, 1, backend);
        worker.cancel.cancel();

        assert!(!worker.resync().await);
        // The pull body bumps the epoch when polled; it never ran.
        assert_eq!(shared.epoch.load(Ordering::SeqCst), 1);
        assert!(shared.store.lock().is_empty());
    }
}
