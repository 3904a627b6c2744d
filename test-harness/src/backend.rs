// In-memory REST backend: `GET /notifications/{userId}` and `POST /notifications/send`.
use anyhow::{Context, Result};
use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use chime_broker::Broker;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const SEND_RECEIPT_MESSAGE: &str = "Notification sent";

#[derive(Default)]
struct BackendState {
    notifications: Mutex<HashMap<String, Vec<Value>>>,
    // Replaces every pull body when set.
    raw_pull_body: Mutex<Option<String>>,
    pull_delay: Mutex<Duration>,
    pulls: AtomicUsize,
    sends: AtomicUsize,
    failing_pulls: AtomicUsize,
    failing_sends: AtomicUsize,
    next_id: AtomicI64,
    push: Option<PushTarget>,
}

struct PushTarget {
    broker: Arc<Broker>,
    topic_prefix: String,
    event_name: String,
}

/// Scriptable stand-in for the notification REST API.
#[derive(Clone)]
pub struct FakeBackend {
    state: Arc<BackendState>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Backend whose `send` publishes a trigger on `{topic_prefix}{userId}`.
    pub fn with_push(
        broker: Arc<Broker>,
        topic_prefix: impl Into<String>,
        event_name: impl Into<String>,
    ) -> Self {
        Self::build(Some(PushTarget {
            broker,
            topic_prefix: topic_prefix.into(),
            event_name: event_name.into(),
        }))
    }

    fn build(push: Option<PushTarget>) -> Self {
        Self {
            state: Arc::new(BackendState {
                next_id: AtomicI64::new(1000),
                push,
                ..BackendState::default()
            }),
        }
    }

    pub fn insert(&self, user: &str, id: i64, message: &str, created_at: DateTime<Utc>) {
        self.insert_raw(
            user,
            json!({
                "id": id,
                "message": message,
                "createdAt": created_at.to_rfc3339(),
                "readState": "unread",
            }),
        );
    }

    /// Append an arbitrary JSON element, malformed ones included.
    pub fn insert_raw(&self, user: &str, element: Value) {
        self.state
            .notifications
            .lock()
            .entry(user.to_string())
            .or_default()
            .push(element);
    }

    pub fn set_raw_pull_body(&self, body: Option<&str>) {
        *self.state.raw_pull_body.lock() = body.map(str::to_string);
    }

    pub fn set_pull_delay(&self, delay: Duration) {
        *self.state.pull_delay.lock() = delay;
    }

    pub fn fail_next_pulls(&self, count: usize) {
        self.state.failing_pulls.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_sends(&self, count: usize) {
        self.state.failing_sends.store(count, Ordering::SeqCst);
    }

    pub fn pull_count(&self) -> usize {
        self.state.pulls.load(Ordering::SeqCst)
    }

    pub fn send_count(&self) -> usize {
        self.state.sends.load(Ordering::SeqCst)
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/notifications/send", post(send_notification))
            .route("/notifications/{user_id}", get(pull_notifications))
            .with_state(self.clone())
    }

    /// Serve on an ephemeral localhost port.
    pub async fn spawn(&self) -> Result<RunningBackend> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind fake backend")?;
        let addr = listener.local_addr().context("fake backend addr")?;
        let app = self.router();
        let handle = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                tracing::warn!(error = %err, "fake backend stopped");
            }
        });
        Ok(RunningBackend { addr, handle })
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}

async fn pull_notifications(
    State(backend): State<FakeBackend>,
    Path(user_id): Path<String>,
) -> Response {
    let state = &backend.state;
    state.pulls.fetch_add(1, Ordering::SeqCst);
    let delay = *state.pull_delay.lock();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    if take_failure(&state.failing_pulls) {
        return (StatusCode::SERVICE_UNAVAILABLE, "backend unavailable").into_response();
    }
    if let Some(raw) = state.raw_pull_body.lock().clone() {
        return ([(header::CONTENT_TYPE, "application/json")], raw).into_response();
    }
    let records = state
        .notifications
        .lock()
        .get(&user_id)
        .cloned()
        .unwrap_or_default();
    Json(Value::Array(records)).into_response()
}

async fn send_notification(State(backend): State<FakeBackend>, Json(body): Json<Value>) -> Response {
    let state = &backend.state;
    state.sends.fetch_add(1, Ordering::SeqCst);
    if take_failure(&state.failing_sends) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "send rejected").into_response();
    }
    let Some(user_id) = body.get("userId").and_then(Value::as_str).map(str::to_string) else {
        return (StatusCode::UNPROCESSABLE_ENTITY, "missing userId").into_response();
    };
    let id = state.next_id.fetch_add(1, Ordering::SeqCst);
    let record = json!({
        "id": id,
        "message": format!("Notification #{id}"),
        "createdAt": Utc::now().to_rfc3339(),
        "readState": "unread",
    });
    backend.insert_raw(&user_id, record.clone());
    if let Some(push) = &state.push {
        let topic = format!("{}{}", push.topic_prefix, user_id);
        push.broker
            .publish(&topic, &push.event_name, Bytes::from(record.to_string()));
    }
    Json(json!({ "message": SEND_RECEIPT_MESSAGE })).into_response()
}

/// A spawned backend; aborted on drop.
pub struct RunningBackend {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl RunningBackend {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for RunningBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
