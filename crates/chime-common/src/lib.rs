// Shared data types and small helpers used across crates.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use ids::{NotificationId, Topic, UserId};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid id: {0:?}")]
    InvalidId(String),
    #[error("invalid topic: {0:?}")]
    InvalidTopic(String),
    #[error("config error: {0}")]
    Config(String),
}

pub mod ids {
    // Strongly typed identifiers so user ids, topics and notification ids never mix.
    use super::{Error, Result};
    use serde::{Deserialize, Serialize};
    use std::cmp::Ordering;
    use std::fmt;
    use std::str::FromStr;

    macro_rules! name_type {
        ($name:ident, $err:ident) => {
            #[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
            #[serde(transparent)]
            pub struct $name(String);

            impl $name {
                pub fn new(value: impl Into<String>) -> Result<Self> {
                    let value = value.into();
                    // Empty or whitespace-bearing names cannot be routed by the broker.
                    if value.is_empty() || value.chars().any(char::is_whitespace) {
                        return Err(Error::$err(value));
                    }
                    Ok(Self(value))
                }

                pub fn as_str(&self) -> &str {
                    &self.0
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(&self.0)
                }
            }

            impl FromStr for $name {
                type Err = Error;

                fn from_str(input: &str) -> Result<Self> {
                    Self::new(input)
                }
            }

            impl<'de> Deserialize<'de> for $name {
                fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
                where
                    D: serde::Deserializer<'de>,
                {
                    let raw = String::deserialize(deserializer)?;
                    Self::new(raw).map_err(serde::de::Error::custom)
                }
            }
        };
    }

    name_type!(UserId, InvalidId);
    name_type!(Topic, InvalidTopic);

    impl Topic {
        /// Per-user topic: `{prefix}{user}`, e.g. `user.42`.
        ///
        /// ```
        /// use chime_common::{Topic, UserId};
        ///
        /// let user = UserId::new("42").expect("user");
        /// let topic = Topic::for_user("user.", &user).expect("topic");
        /// assert_eq!(topic.as_str(), "user.42");
        /// ```
        pub fn for_user(prefix: &str, user: &UserId) -> Result<Self> {
            Self::new(format!("{prefix}{user}"))
        }
    }

    /// Backend-assigned notification identifier.
    ///
    /// Integers order numerically, strings lexicographically, and every integer
    /// sorts before every string.
    #[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
    #[serde(untagged)]
    pub enum NotificationId {
        Int(i64),
        Text(String),
    }

    impl Ord for NotificationId {
        fn cmp(&self, other: &Self) -> Ordering {
            match (self, other) {
                (Self::Int(a), Self::Int(b)) => a.cmp(b),
                (Self::Text(a), Self::Text(b)) => a.cmp(b),
                (Self::Int(_), Self::Text(_)) => Ordering::Less,
                (Self::Text(_), Self::Int(_)) => Ordering::Greater,
            }
        }
    }

    impl PartialOrd for NotificationId {
        fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
            Some(self.cmp(other))
        }
    }

    impl fmt::Display for NotificationId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::Int(value) => write!(f, "{value}"),
                Self::Text(value) => f.write_str(value),
            }
        }
    }

    impl From<i64> for NotificationId {
        fn from(value: i64) -> Self {
            Self::Int(value)
        }
    }

    impl From<&str> for NotificationId {
        fn from(value: &str) -> Self {
            Self::Text(value.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadState {
    #[default]
    Unread,
    Read,
}

impl<'de> Deserialize<'de> for ReadState {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        match raw.to_ascii_lowercase().as_str() {
            "unread" => Ok(Self::Unread),
            "read" => Ok(Self::Read),
            other => Err(serde::de::Error::custom(format!(
                "unknown read state {other:?}"
            ))),
        }
    }
}

/// One notification as the presentation layer sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: NotificationId,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub read_state: ReadState,
}

/// A pulled element that could not be turned into a [`NotificationRecord`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed notification record: {reason}")]
pub struct MalformedRecord {
    pub reason: String,
}

impl MalformedRecord {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Result of decoding one element of a pull response.
pub type PulledRecord = std::result::Result<NotificationRecord, MalformedRecord>;

// Lenient shape of one array element; required fields are checked afterwards so
// that a missing id is reported as such rather than as a generic serde error.
#[derive(Debug, Deserialize)]
struct RecordFields {
    id: Option<NotificationId>,
    message: Option<String>,
    #[serde(rename = "createdAt", alias = "created_at")]
    created_at: Option<DateTime<Utc>>,
    #[serde(rename = "readState", alias = "read_state")]
    read_state: Option<ReadState>,
    #[serde(rename = "readAt", alias = "read_at", default)]
    read_at: Option<serde_json::Value>,
}

impl NotificationRecord {
    pub fn new(
        id: impl Into<NotificationId>,
        message: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
            created_at,
            read_state: ReadState::Unread,
        }
    }

    pub fn with_read_state(mut self, read_state: ReadState) -> Self {
        self.read_state = read_state;
        self
    }

    /// Decode one element of a pull response.
    ///
    /// ```
    /// use chime_common::{NotificationId, NotificationRecord, ReadState};
    ///
    /// let value = serde_json::json!({
    ///     "id": 7,
    ///     "message": "hello",
    ///     "createdAt": "2024-05-01T10:00:00Z",
    ///     "readState": "read"
    /// });
    /// let record = NotificationRecord::from_json(value).expect("record");
    /// assert_eq!(record.id, NotificationId::Int(7));
    /// assert_eq!(record.read_state, ReadState::Read);
    ///
    /// let missing_id = serde_json::json!({ "message": "x", "createdAt": "2024-05-01T10:00:00Z" });
    /// assert!(NotificationRecord::from_json(missing_id).is_err());
    /// ```
    pub fn from_json(value: serde_json::Value) -> PulledRecord {
        if !value.is_object() {
            return Err(MalformedRecord::new("element is not an object"));
        }
        let fields: RecordFields =
            serde_json::from_value(value).map_err(|err| MalformedRecord::new(err.to_string()))?;
        let id = fields.id.ok_or_else(|| MalformedRecord::new("missing id"))?;
        let message = fields
            .message
            .ok_or_else(|| MalformedRecord::new(format!("missing message for id {id}")))?;
        let created_at = fields
            .created_at
            .ok_or_else(|| MalformedRecord::new(format!("missing createdAt for id {id}")))?;
        let read_state = match fields.read_state {
            Some(state) => state,
            None if fields.read_at.as_ref().is_some_and(|v| !v.is_null()) => ReadState::Read,
            None => ReadState::Unread,
        };
        Ok(Self {
            id,
            message,
            created_at,
            read_state,
        })
    }
}

/// Outbound creation request for `POST /notifications/send`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendCommand {
    pub user_id: UserId,
}

impl SendCommand {
    pub fn new(user_id: UserId) -> Self {
        Self { user_id }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message: String,
}

impl fmt::Display for SendReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}
