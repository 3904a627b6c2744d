// WebSocket push gateway bridging the wire protocol onto an in-process broker.
use anyhow::{Context, Result};
use chime_broker::{Broker, BrokerConnection};
use chime_wire::Message as WireMessage;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Channels with this prefix are refused with `subscription_error`.
pub const REJECTED_CHANNEL_PREFIX: &str = "private-";

/// Error code sent when the broker refuses a new connection.
pub const UNAVAILABLE_CODE: u16 = 4201;

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub activity_timeout: u64,
    // When false, protocol pings go unanswered (simulates a hung server).
    pub answer_pings: bool,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            activity_timeout: 120,
            answer_pings: true,
        }
    }
}

#[derive(Default)]
struct GatewayStats {
    next_socket: AtomicU64,
    pings: AtomicUsize,
    subscribes: AtomicUsize,
}

/// A running gateway; aborted on drop.
pub struct Gateway {
    addr: SocketAddr,
    broker: Arc<Broker>,
    stats: Arc<GatewayStats>,
    handle: JoinHandle<()>,
}

impl Gateway {
    pub async fn spawn(broker: Arc<Broker>) -> Result<Self> {
        Self::spawn_with(broker, GatewayOptions::default()).await
    }

    pub async fn spawn_with(broker: Arc<Broker>, options: GatewayOptions) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind gateway")?;
        let addr = listener.local_addr().context("gateway addr")?;
        let stats = Arc::new(GatewayStats::default());
        let handle = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&broker),
            Arc::clone(&stats),
            options,
        ));
        Ok(Self {
            addr,
            broker,
            stats,
            handle,
        })
    }

    pub fn url(&self) -> String {
        format!("ws://{}/app/chime", self.addr)
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Protocol pings received from clients.
    pub fn ping_count(&self) -> usize {
        self.stats.pings.load(Ordering::SeqCst)
    }

    pub fn subscribe_count(&self) -> usize {
        self.stats.subscribes.load(Ordering::SeqCst)
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    broker: Arc<Broker>,
    stats: Arc<GatewayStats>,
    options: GatewayOptions,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(error = %err, "gateway accept failed");
                continue;
            }
        };
        let broker = Arc::clone(&broker);
        let stats = Arc::clone(&stats);
        let options = options.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_socket(stream, broker, stats, options).await {
                tracing::debug!(peer = %peer, error = %err, "gateway socket ended");
            }
        });
    }
}

async fn serve_socket(
    stream: TcpStream,
    broker: Arc<Broker>,
    stats: Arc<GatewayStats>,
    options: GatewayOptions,
) -> Result<()> {
    let mut socket = tokio_tungstenite::accept_async(stream)
        .await
        .context("websocket accept")?;
    let mut connection = match broker.connect() {
        Ok(connection) => connection,
        Err(err) => {
            send(
                &mut socket,
                WireMessage::Error {
                    code: Some(UNAVAILABLE_CODE),
                    message: err.to_string(),
                },
            )
            .await?;
            let _ = socket.close(None).await;
            return Ok(());
        }
    };
    let socket_id = format!(
        "{}.{}",
        stats.next_socket.fetch_add(1, Ordering::SeqCst),
        connection.id()
    );
    send(
        &mut socket,
        WireMessage::ConnectionEstablished {
            socket_id,
            activity_timeout: Some(options.activity_timeout),
        },
    )
    .await?;

    loop {
        tokio::select! {
            delivery = connection.recv() => {
                let Some(delivery) = delivery else {
                    // Severed by the broker.
                    let _ = socket.close(None).await;
                    return Ok(());
                };
                send(
                    &mut socket,
                    WireMessage::Event {
                        channel: delivery.topic,
                        event: delivery.event,
                        data: String::from_utf8_lossy(&delivery.payload).into_owned(),
                    },
                )
                .await?;
            }
            frame = socket.next() => {
                let Some(frame) = frame else {
                    return Ok(());
                };
                match frame.context("gateway read")? {
                    WsMessage::Text(text) => {
                        on_client_frame(&mut socket, &connection, &stats, &options, text.as_str())
                            .await?;
                    }
                    WsMessage::Close(_) => return Ok(()),
                    _ => {}
                }
            }
        }
    }
}

async fn on_client_frame(
    socket: &mut WebSocketStream<TcpStream>,
    connection: &BrokerConnection,
    stats: &GatewayStats,
    options: &GatewayOptions,
    text: &str,
) -> Result<()> {
    match WireMessage::decode(text).context("decode client frame")? {
        WireMessage::Subscribe { channel } => {
            stats.subscribes.fetch_add(1, Ordering::SeqCst);
            if channel.starts_with(REJECTED_CHANNEL_PREFIX) {
                return send(
                    socket,
                    WireMessage::SubscriptionError {
                        channel: Some(channel),
                        message: "channel requires authorization".into(),
                        status: Some(403),
                    },
                )
                .await;
            }
            connection.subscribe(&channel)?;
            send(socket, WireMessage::SubscriptionSucceeded { channel }).await
        }
        WireMessage::Unsubscribe { channel } => {
            connection.unsubscribe(&channel)?;
            Ok(())
        }
        WireMessage::Ping => {
            stats.pings.fetch_add(1, Ordering::SeqCst);
            if options.answer_pings {
                send(socket, WireMessage::Pong).await
            } else {
                Ok(())
            }
        }
        other => {
            tracing::debug!(message = ?other, "gateway ignoring client frame");
            Ok(())
        }
    }
}

async fn send(socket: &mut WebSocketStream<TcpStream>, message: WireMessage) -> Result<()> {
    let text = message.encode()?;
    socket
        .send(WsMessage::Text(text.into()))
        .await
        .context("gateway send")
}
