// Session boundary: ties the sync machinery to the owning view's lifetime.
use crate::backend::{BackendError, HttpBackend, NotificationBackend};
use crate::config::SyncConfig;
use crate::connection::ConnectionState;
use crate::dispatcher::{SyncDispatcher, SyncError, SyncHealth};
use crate::store::Snapshot;
use crate::subscription::ChannelSubscription;
use chime_common::{NotificationId, SendCommand, SendReceipt, UserId};
use chime_transport::{PushTransport, WsConfig, WsTransport};
use futures::Stream;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    NotStarted,
    Running { user: UserId },
    Stopped,
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("session is not running")]
    NotRunning,
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// `NotStarted -> start -> Running -> stop -> Stopped`.
///
/// `start` outside NotStarted and `stop` outside Running are no-ops, so
/// overlapping lifecycle calls never double-subscribe. Dropping the session
/// stops it.
pub struct NotificationSession {
    dispatcher: SyncDispatcher,
    phase: Mutex<SessionPhase>,
    refresh_after_send: bool,
}

impl NotificationSession {
    pub fn new(
        config: &SyncConfig,
        backend: Arc<dyn NotificationBackend>,
        transport: Arc<dyn PushTransport>,
    ) -> Self {
        Self {
            dispatcher: SyncDispatcher::new(config, backend, transport),
            phase: Mutex::new(SessionPhase::NotStarted),
            refresh_after_send: config.refresh_after_send,
        }
    }

    /// HTTP backend plus WebSocket push, both taken from `config`.
    pub fn from_config(config: &SyncConfig) -> Result<Self, SessionError> {
        let backend = HttpBackend::new(&config.backend_url, config.request_timeout)?;
        let mut ws = WsConfig::new(config.push_url.clone());
        ws.handshake_timeout = config.request_timeout;
        Ok(Self::new(
            config,
            Arc::new(backend),
            Arc::new(WsTransport::new(ws)),
        ))
    }

    pub fn start(&self, user: UserId) -> Result<(), SessionError> {
        let mut phase = self.phase.lock();
        if *phase != SessionPhase::NotStarted {
            tracing::debug!(phase = ?*phase, "start ignored");
            return Ok(());
        }
        if let Err(err) = self.dispatcher.start(user.clone()) {
            self.dispatcher.stop();
            *phase = SessionPhase::Stopped;
            return Err(err.into());
        }
        *phase = SessionPhase::Running { user };
        Ok(())
    }

    pub fn stop(&self) {
        let mut phase = self.phase.lock();
        if matches!(*phase, SessionPhase::Running { .. }) {
            self.dispatcher.stop();
            *phase = SessionPhase::Stopped;
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase.lock().clone()
    }

    pub fn user(&self) -> Option<UserId> {
        match &*self.phase.lock() {
            SessionPhase::Running { user } => Some(user.clone()),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.dispatcher.snapshot()
    }

    pub fn changes(&self) -> watch::Receiver<Snapshot> {
        self.dispatcher.changes()
    }

    pub fn health(&self) -> watch::Receiver<SyncHealth> {
        self.dispatcher.health()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.dispatcher.connection_state()
    }

    pub fn connection_states(&self) -> impl Stream<Item = ConnectionState> + Send + 'static {
        self.dispatcher.connection().state_changes()
    }

    pub fn subscription(&self) -> Option<ChannelSubscription> {
        self.dispatcher.subscription()
    }

    pub fn mark_read(&self, id: &NotificationId) -> bool {
        self.dispatcher.mark_read(id)
    }

    pub fn request_sync(&self) {
        self.dispatcher.request_sync();
    }

    /// Send per configuration: refreshes afterwards when `refresh_after_send` is set.
    pub async fn send(&self, command: &SendCommand) -> Result<SendReceipt, SessionError> {
        self.ensure_running()?;
        let receipt = if self.refresh_after_send {
            self.dispatcher.send_and_refresh(command).await?
        } else {
            self.dispatcher.send(command).await?
        };
        Ok(receipt)
    }

    pub async fn send_and_refresh(&self, command: &SendCommand) -> Result<SendReceipt, SessionError> {
        self.ensure_running()?;
        Ok(self.dispatcher.send_and_refresh(command).await?)
    }

    /// Ask the backend to create a notification for the session's own user.
    pub async fn send_to_self(&self) -> Result<SendReceipt, SessionError> {
        let user = self.user().ok_or(SessionError::NotRunning)?;
        self.send(&SendCommand::new(user)).await
    }

    pub fn dispatcher(&self) -> &SyncDispatcher {
        &self.dispatcher
    }

    fn ensure_running(&self) -> Result<(), SessionError> {
        match *self.phase.lock() {
            SessionPhase::Running { .. } => Ok(()),
            _ => Err(SessionError::NotRunning),
        }
    }
}

impl Drop for NotificationSession {
    fn drop(&mut self) {
        self.stop();
    }
}
