// WebSocket transport speaking the Pusher-compatible protocol from `chime-wire`.
use crate::{Inbound, PushConnection, PushEvent, PushTransport, Result, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use chime_common::{Topic, UserId};
use chime_wire::Message as WireMessage;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport settings.
///
/// ```
/// use chime_transport::WsConfig;
///
/// let config = WsConfig::new("ws://127.0.0.1:6001/app/chime");
/// assert_eq!(config.handshake_timeout.as_secs(), 10);
/// ```
#[derive(Debug, Clone)]
pub struct WsConfig {
    pub url: String,
    pub handshake_timeout: Duration,
    // Used when the server does not announce one in `connection_established`.
    pub activity_timeout: Duration,
    pub pong_timeout: Duration,
}

impl WsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            handshake_timeout: Duration::from_secs(10),
            activity_timeout: Duration::from_secs(120),
            pong_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WsTransport {
    config: WsConfig,
}

impl WsTransport {
    pub fn new(config: WsConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WsConfig {
        &self.config
    }
}

#[async_trait]
impl PushTransport for WsTransport {
    async fn connect(&self, user: &UserId) -> Result<Box<dyn PushConnection>> {
        let (mut socket, _) = tokio::time::timeout(
            self.config.handshake_timeout,
            connect_async(self.config.url.as_str()),
        )
        .await
        .map_err(|_| TransportError::Timeout(self.config.handshake_timeout))?
        .map_err(|err| TransportError::Connect(err.to_string()))?;

        let established = tokio::time::timeout(
            self.config.handshake_timeout,
            wait_for_established(&mut socket),
        )
        .await
        .map_err(|_| {
            TransportError::Handshake("timed out waiting for connection_established".into())
        })??;

        let activity_timeout = established
            .activity_timeout
            .map(Duration::from_secs)
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or(self.config.activity_timeout);
        tracing::debug!(
            user = %user,
            url = %self.config.url,
            socket_id = %established.socket_id,
            activity_timeout_s = activity_timeout.as_secs(),
            "push socket established"
        );
        Ok(Box::new(WsConnection {
            socket,
            activity_timeout,
            pong_timeout: self.config.pong_timeout,
            last_activity: Instant::now(),
            pong_deadline: None,
            pong_owed: false,
            closed: false,
        }))
    }
}

struct Established {
    socket_id: String,
    activity_timeout: Option<u64>,
}

async fn wait_for_established(socket: &mut Socket) -> Result<Established> {
    while let Some(frame) = socket.next().await {
        let frame = frame.map_err(|err| TransportError::Handshake(err.to_string()))?;
        let WsMessage::Text(text) = frame else {
            continue;
        };
        match WireMessage::decode(text.as_str())? {
            WireMessage::ConnectionEstablished {
                socket_id,
                activity_timeout,
            } => {
                return Ok(Established {
                    socket_id,
                    activity_timeout,
                });
            }
            WireMessage::Error { code, message } => {
                return Err(TransportError::Protocol { code, message });
            }
            other => {
                tracing::debug!(message = ?other, "ignoring frame before connection_established");
            }
        }
    }
    Err(TransportError::Handshake(
        "socket closed before connection_established".into(),
    ))
}

struct WsConnection {
    socket: Socket,
    activity_timeout: Duration,
    pong_timeout: Duration,
    // Keepalive state lives here rather than in `next_inbound` locals so a
    // cancelled call loses nothing.
    last_activity: Instant,
    pong_deadline: Option<Instant>,
    // Set when a server ping is read, cleared once the pong is written.
    pong_owed: bool,
    closed: bool,
}

impl WsConnection {
    async fn send(&mut self, message: WireMessage) -> Result<()> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let text = message.encode()?;
        self.socket
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|err| TransportError::WebSocket(err.to_string()))
    }

    fn next_deadline(&self) -> Instant {
        self.pong_deadline
            .unwrap_or(self.last_activity + self.activity_timeout)
    }

    fn record_activity(&mut self) {
        self.last_activity = Instant::now();
        self.pong_deadline = None;
    }

    async fn on_idle(&mut self) -> Result<()> {
        if self.pong_deadline.is_some() {
            tracing::warn!(
                pong_timeout_ms = self.pong_timeout.as_millis() as u64,
                "push socket unresponsive"
            );
            return Err(TransportError::Timeout(self.pong_timeout));
        }
        self.send(WireMessage::Ping).await?;
        self.pong_deadline = Some(Instant::now() + self.pong_timeout);
        Ok(())
    }

    async fn flush_pong(&mut self) -> Result<()> {
        if self.pong_owed {
            self.send(WireMessage::Pong).await?;
            self.pong_owed = false;
        }
        Ok(())
    }

    // Some(item) to hand to the caller, None to keep reading.
    fn on_text(&mut self, text: &str) -> Result<Option<Inbound>> {
        let message = match WireMessage::decode(text) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(error = %err, "dropping undecodable push frame");
                return Ok(None);
            }
        };
        match message {
            WireMessage::Event {
                channel,
                event,
                data,
            } => Ok(Some(Inbound::Event(PushEvent {
                topic: channel,
                event,
                payload: Bytes::from(data),
            }))),
            WireMessage::Ping => {
                self.pong_owed = true;
                Ok(None)
            }
            WireMessage::SubscriptionError {
                channel, message, ..
            } => Ok(Some(Inbound::SubscriptionFailed {
                topic: channel.unwrap_or_default(),
                reason: message,
            })),
            WireMessage::Error { code, message } => {
                Err(TransportError::Protocol { code, message })
            }
            WireMessage::SubscriptionSucceeded { channel } => {
                tracing::debug!(topic = %channel, "subscription confirmed");
                Ok(None)
            }
            WireMessage::Pong
            | WireMessage::ConnectionEstablished { .. }
            | WireMessage::Subscribe { .. }
            | WireMessage::Unsubscribe { .. } => Ok(None),
        }
    }
}

#[async_trait]
impl PushConnection for WsConnection {
    async fn subscribe(&mut self, topic: &Topic) -> Result<()> {
        self.send(WireMessage::Subscribe {
            channel: topic.to_string(),
        })
        .await
    }

    async fn unsubscribe(&mut self, topic: &Topic) -> Result<()> {
        self.send(WireMessage::Unsubscribe {
            channel: topic.to_string(),
        })
        .await
    }

    async fn next_inbound(&mut self) -> Result<Option<Inbound>> {
        if self.closed {
            return Ok(None);
        }
        loop {
            self.flush_pong().await?;
            let deadline = self.next_deadline();
            let frame = tokio::select! {
                frame = self.socket.next() => frame,
                _ = tokio::time::sleep_until(deadline) => {
                    self.on_idle().await?;
                    continue;
                }
            };
            let frame = match frame {
                None => {
                    self.closed = true;
                    return Ok(None);
                }
                Some(Err(err)) => {
                    self.closed = true;
                    return Err(TransportError::WebSocket(err.to_string()));
                }
                Some(Ok(frame)) => frame,
            };
            self.record_activity();
            match frame {
                WsMessage::Text(text) => {
                    if let Some(inbound) = self.on_text(text.as_str())? {
                        return Ok(Some(inbound));
                    }
                }
                WsMessage::Close(frame) => {
                    tracing::debug!(frame = ?frame, "push socket closed by peer");
                    self.closed = true;
                    return Ok(None);
                }
                // Control frames are answered by tungstenite itself.
                WsMessage::Ping(_)
                | WsMessage::Pong(_)
                | WsMessage::Binary(_)
                | WsMessage::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = self.socket.close(None).await {
            tracing::debug!(error = %err, "push socket close failed");
        }
    }
}
