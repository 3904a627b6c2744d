// Client-side defaults plus env and YAML overrides.
use crate::backoff::BackoffPolicy;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

pub const DEFAULT_BACKEND_URL: &str = "http://127.0.0.1:8000/api";
pub const DEFAULT_PUSH_URL: &str = "ws://127.0.0.1:6001/app/chime";
pub const DEFAULT_TOPIC_PREFIX: &str = "user.";
pub const DEFAULT_EVENT_NAME: &str = "notification.created";
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_CAP_MS: u64 = 30_000;
pub const DEFAULT_PULL_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Everything a session needs to reach the backend and the push channel.
///
/// ```
/// use chime_client::SyncConfig;
///
/// let config = SyncConfig::default();
/// assert_eq!(config.topic_prefix, "user.");
/// assert_eq!(config.backoff_cap.as_secs(), 30);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub backend_url: String,
    pub push_url: String,
    pub topic_prefix: String,
    pub event_name: String,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    // Consecutive pull failures before health turns Degraded.
    pub pull_failure_threshold: u32,
    pub request_timeout: Duration,
    pub refresh_after_send: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            push_url: DEFAULT_PUSH_URL.to_string(),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            event_name: DEFAULT_EVENT_NAME.to_string(),
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            backoff_cap: Duration::from_millis(DEFAULT_BACKOFF_CAP_MS),
            pull_failure_threshold: DEFAULT_PULL_FAILURE_THRESHOLD,
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            refresh_after_send: false,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct SyncConfigOverride {
    backend_url: Option<String>,
    push_url: Option<String>,
    topic_prefix: Option<String>,
    event_name: Option<String>,
    backoff_base_ms: Option<u64>,
    backoff_cap_ms: Option<u64>,
    pull_failure_threshold: Option<u32>,
    request_timeout_ms: Option<u64>,
    refresh_after_send: Option<bool>,
}

impl SyncConfig {
    /// Defaults, then `CHIME_*` env vars, then the YAML file at `config_path`
    /// (or `CHIME_CLIENT_CONFIG`) when one is given.
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("CHIME_CLIENT_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents =
                fs::read_to_string(path).with_context(|| format!("read client config: {path}"))?;
            let override_cfg: SyncConfigOverride =
                serde_yaml::from_str(&contents).context("parse client config yaml")?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = read_string_env("CHIME_BACKEND_URL") {
            config.backend_url = value;
        }
        if let Some(value) = read_string_env("CHIME_PUSH_URL") {
            config.push_url = value;
        }
        if let Some(value) = read_string_env("CHIME_TOPIC_PREFIX") {
            config.topic_prefix = value;
        }
        if let Some(value) = read_string_env("CHIME_EVENT_NAME") {
            config.event_name = value;
        }
        if let Some(value) = read_u64_env("CHIME_BACKOFF_BASE_MS") {
            config.backoff_base = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("CHIME_BACKOFF_CAP_MS") {
            config.backoff_cap = Duration::from_millis(value);
        }
        if let Some(value) = read_u64_env("CHIME_PULL_FAILURE_THRESHOLD")
            && let Ok(value) = u32::try_from(value)
        {
            config.pull_failure_threshold = value;
        }
        if let Some(value) = read_u64_env("CHIME_REQUEST_TIMEOUT_MS") {
            config.request_timeout = Duration::from_millis(value);
        }
        if let Some(value) = read_bool_env("CHIME_REFRESH_AFTER_SEND") {
            config.refresh_after_send = value;
        }
        config
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.backoff_base, self.backoff_cap)
    }
}

impl SyncConfigOverride {
    fn apply(&self, config: &mut SyncConfig) {
        if let Some(value) = non_empty(&self.backend_url) {
            config.backend_url = value;
        }
        if let Some(value) = non_empty(&self.push_url) {
            config.push_url = value;
        }
        if let Some(value) = non_empty(&self.topic_prefix) {
            config.topic_prefix = value;
        }
        if let Some(value) = non_empty(&self.event_name) {
            config.event_name = value;
        }
        if let Some(value) = self.backoff_base_ms
            && value > 0
        {
            config.backoff_base = Duration::from_millis(value);
        }
        if let Some(value) = self.backoff_cap_ms
            && value > 0
        {
            config.backoff_cap = Duration::from_millis(value);
        }
        if let Some(value) = self.pull_failure_threshold
            && value > 0
        {
            config.pull_failure_threshold = value;
        }
        if let Some(value) = self.request_timeout_ms
            && value > 0
        {
            config.request_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.refresh_after_send {
            config.refresh_after_send = value;
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn read_string_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn read_bool_env(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
}
