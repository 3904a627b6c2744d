// REST collaborator: pull the canonical list, trigger a send.
use async_trait::async_trait;
use chime_common::{NotificationRecord, PulledRecord, SendCommand, SendReceipt, UserId};
use reqwest::Url;
use serde_json::Value;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("request failed")]
    Transport(#[source] reqwest::Error),
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response body: {0}")]
    MalformedBody(String),
    #[error("invalid backend url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

#[async_trait]
pub trait NotificationBackend: Send + Sync {
    /// `GET /notifications/{userId}`. Element-level problems come back as
    /// `Err` items; only transport, status and body-shape problems fail the pull.
    async fn pull(&self, user: &UserId) -> Result<Vec<PulledRecord>, BackendError>;

    /// `POST /notifications/send`. Never retried.
    async fn send(&self, command: &SendCommand) -> Result<SendReceipt, BackendError>;
}

#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpBackend {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(BackendError::Transport)?;
        Self::with_client(client, base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Result<Self, BackendError> {
        let invalid = |reason: String| BackendError::InvalidUrl {
            url: base_url.to_string(),
            reason,
        };
        let base_url = Url::parse(base_url).map_err(|err| invalid(err.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(invalid("cannot be a base".into()));
        }
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    // Each segment is percent-encoded, so ids containing `/`, `#` or `?` stay
    // inside their own path segment.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| BackendError::InvalidUrl {
                url: self.base_url.to_string(),
                reason: "cannot be a base".into(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

#[async_trait]
impl NotificationBackend for HttpBackend {
    async fn pull(&self, user: &UserId) -> Result<Vec<PulledRecord>, BackendError> {
        let url = self.endpoint(&["notifications", user.as_str()])?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(BackendError::Transport)?;
        let body: Value = checked(response).await?.json().await.map_err(body_error)?;
        let Value::Array(elements) = body else {
            return Err(BackendError::MalformedBody(format!(
                "expected an array, got {}",
                kind_of(&body)
            )));
        };
        Ok(elements
            .into_iter()
            .map(NotificationRecord::from_json)
            .collect())
    }

    async fn send(&self, command: &SendCommand) -> Result<SendReceipt, BackendError> {
        let url = self.endpoint(&["notifications", "send"])?;
        let response = self
            .client
            .post(url)
            .json(command)
            .send()
            .await
            .map_err(BackendError::Transport)?;
        checked(response).await?.json().await.map_err(body_error)
    }
}

async fn checked(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(BackendError::Status {
        status: status.as_u16(),
        body,
    })
}

fn body_error(err: reqwest::Error) -> BackendError {
    if err.is_decode() {
        BackendError::MalformedBody(err.to_string())
    } else {
        BackendError::Transport(err)
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
