// Push-channel wire format: Pusher-compatible JSON text frames.
//
// Every frame is an envelope `{"event": .., "channel": .., "data": ..}`. Protocol
// events carry a `pusher:` / `pusher_internal:` prefix; anything else on a channel
// is an application event. Servers in the wild send `data` either as an object or
// as a JSON-encoded string, so decoding accepts both and encoding emits one
// canonical form per message.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const EVENT_CONNECTION_ESTABLISHED: &str = "pusher:connection_established";
pub const EVENT_SUBSCRIBE: &str = "pusher:subscribe";
pub const EVENT_UNSUBSCRIBE: &str = "pusher:unsubscribe";
pub const EVENT_SUBSCRIPTION_SUCCEEDED: &str = "pusher_internal:subscription_succeeded";
pub const EVENT_SUBSCRIPTION_ERROR: &str = "pusher:subscription_error";
pub const EVENT_PING: &str = "pusher:ping";
pub const EVENT_PONG: &str = "pusher:pong";
pub const EVENT_ERROR: &str = "pusher:error";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to serialize message")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to deserialize message")]
    Deserialize(#[source] serde_json::Error),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("unsupported protocol event {0:?}")]
    UnsupportedEvent(String),
}

/// Messages exchanged on the push channel.
///
/// ```
/// use chime_wire::Message;
///
/// let message = Message::Subscribe {
///     channel: "user.42".to_string(),
/// };
/// let text = message.encode().expect("encode");
/// assert_eq!(text, r#"{"event":"pusher:subscribe","data":{"channel":"user.42"}}"#);
/// assert_eq!(Message::decode(&text).expect("decode"), message);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    // First frame sent by the server after the socket opens.
    ConnectionEstablished {
        socket_id: String,
        activity_timeout: Option<u64>,
    },
    Subscribe {
        channel: String,
    },
    Unsubscribe {
        channel: String,
    },
    SubscriptionSucceeded {
        channel: String,
    },
    SubscriptionError {
        channel: Option<String>,
        message: String,
        status: Option<u16>,
    },
    Ping,
    Pong,
    // Protocol-level error; the server usually closes the socket afterwards.
    Error {
        code: Option<u16>,
        message: String,
    },
    // Application event published on a channel. `data` is passed through untouched.
    Event {
        channel: String,
        event: String,
        data: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    channel: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    data: Value,
}

impl Message {
    pub fn encode(&self) -> Result<String> {
        let envelope = match self {
            Message::ConnectionEstablished {
                socket_id,
                activity_timeout,
            } => {
                let mut data = Map::new();
                data.insert("socket_id".into(), Value::from(socket_id.as_str()));
                if let Some(timeout) = activity_timeout {
                    data.insert("activity_timeout".into(), Value::from(*timeout));
                }
                Envelope {
                    event: EVENT_CONNECTION_ESTABLISHED.into(),
                    channel: None,
                    data: stringified(Value::Object(data))?,
                }
            }
            Message::Subscribe { channel } => Envelope {
                event: EVENT_SUBSCRIBE.into(),
                channel: None,
                data: channel_object(channel),
            },
            Message::Unsubscribe { channel } => Envelope {
                event: EVENT_UNSUBSCRIBE.into(),
                channel: None,
                data: channel_object(channel),
            },
            Message::SubscriptionSucceeded { channel } => Envelope {
                event: EVENT_SUBSCRIPTION_SUCCEEDED.into(),
                channel: Some(channel.clone()),
                data: Value::String("{}".into()),
            },
            Message::SubscriptionError {
                channel,
                message,
                status,
            } => {
                let mut data = Map::new();
                data.insert("type".into(), Value::from("SubscriptionError"));
                data.insert("error".into(), Value::from(message.as_str()));
                if let Some(status) = status {
                    data.insert("status".into(), Value::from(*status));
                }
                Envelope {
                    event: EVENT_SUBSCRIPTION_ERROR.into(),
                    channel: channel.clone(),
                    data: Value::Object(data),
                }
            }
            Message::Ping => Envelope {
                event: EVENT_PING.into(),
                channel: None,
                data: Value::Object(Map::new()),
            },
            Message::Pong => Envelope {
                event: EVENT_PONG.into(),
                channel: None,
                data: Value::Object(Map::new()),
            },
            Message::Error { code, message } => {
                let mut data = Map::new();
                data.insert("message".into(), Value::from(message.as_str()));
                data.insert("code".into(), code.map(Value::from).unwrap_or(Value::Null));
                Envelope {
                    event: EVENT_ERROR.into(),
                    channel: None,
                    data: Value::Object(data),
                }
            }
            Message::Event {
                channel,
                event,
                data,
            } => Envelope {
                event: event.clone(),
                channel: Some(channel.clone()),
                data: Value::String(data.clone()),
            },
        };
        serde_json::to_string(&envelope).map_err(Error::Serialize)
    }

    pub fn decode(text: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(text).map_err(Error::Deserialize)?;
        let Envelope {
            event,
            channel,
            data,
        } = envelope;
        if !is_protocol_event(&event) {
            let channel = channel.ok_or(Error::MissingField("channel"))?;
            let data = match data {
                Value::String(raw) => raw,
                Value::Null => String::new(),
                other => other.to_string(),
            };
            return Ok(Message::Event {
                channel,
                event,
                data,
            });
        }
        match event.as_str() {
            EVENT_CONNECTION_ESTABLISHED => {
                let data = data_object(data)?;
                let socket_id = data
                    .get("socket_id")
                    .and_then(Value::as_str)
                    .ok_or(Error::MissingField("socket_id"))?
                    .to_string();
                let activity_timeout = data.get("activity_timeout").and_then(Value::as_u64);
                Ok(Message::ConnectionEstablished {
                    socket_id,
                    activity_timeout,
                })
            }
            EVENT_SUBSCRIBE => Ok(Message::Subscribe {
                channel: data_channel(data)?,
            }),
            EVENT_UNSUBSCRIBE => Ok(Message::Unsubscribe {
                channel: data_channel(data)?,
            }),
            EVENT_SUBSCRIPTION_SUCCEEDED => Ok(Message::SubscriptionSucceeded {
                channel: channel.ok_or(Error::MissingField("channel"))?,
            }),
            EVENT_SUBSCRIPTION_ERROR => {
                let data = data_object(data).unwrap_or_default();
                let message = data
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("subscription rejected")
                    .to_string();
                let status = data
                    .get("status")
                    .and_then(Value::as_u64)
                    .and_then(|value| u16::try_from(value).ok());
                Ok(Message::SubscriptionError {
                    channel,
                    message,
                    status,
                })
            }
            EVENT_PING => Ok(Message::Ping),
            EVENT_PONG => Ok(Message::Pong),
            EVENT_ERROR => {
                let data = data_object(data).unwrap_or_default();
                let message = data
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let code = data
                    .get("code")
                    .and_then(Value::as_u64)
                    .and_then(|value| u16::try_from(value).ok());
                Ok(Message::Error { code, message })
            }
            other => Err(Error::UnsupportedEvent(other.to_string())),
        }
    }
}

/// Close codes 4000-4099 mean the server does not want the client back with the
/// same settings; everything else is worth a retry.
pub fn is_fatal_error_code(code: u16) -> bool {
    (4000..4100).contains(&code)
}

pub fn is_protocol_event(name: &str) -> bool {
    name.starts_with("pusher:") || name.starts_with("pusher_internal:")
}

fn channel_object(channel: &str) -> Value {
    let mut data = Map::new();
    data.insert("channel".into(), Value::from(channel));
    Value::Object(data)
}

fn stringified(value: Value) -> Result<Value> {
    serde_json::to_string(&value)
        .map(Value::String)
        .map_err(Error::Serialize)
}

fn data_object(data: Value) -> Result<Map<String, Value>> {
    match data {
        Value::Object(map) => Ok(map),
        Value::String(raw) => match serde_json::from_str(&raw).map_err(Error::Deserialize)? {
            Value::Object(map) => Ok(map),
            _ => Err(Error::MissingField("data")),
        },
        _ => Err(Error::MissingField("data")),
    }
}

fn data_channel(data: Value) -> Result<String> {
    data_object(data)?
        .get("channel")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(Error::MissingField("channel"))
}
