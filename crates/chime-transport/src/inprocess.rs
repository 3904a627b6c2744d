// In-process transport over a shared `Broker`.
use crate::{Inbound, PushConnection, PushEvent, PushTransport, Result, TransportError};
use async_trait::async_trait;
use chime_broker::{Broker, BrokerConnection, BrokerError};
use chime_common::{Topic, UserId};
use std::sync::Arc;

/// Transport whose connections live inside one process.
///
/// ```
/// use chime_broker::Broker;
/// use chime_transport::{InProcessTransport, PushTransport};
/// use std::sync::Arc;
///
/// let broker = Arc::new(Broker::new());
/// let transport = InProcessTransport::new(Arc::clone(&broker));
/// let rt = tokio::runtime::Runtime::new().expect("rt");
/// rt.block_on(async {
///     let user = chime_common::UserId::new("42").expect("user");
///     let _connection = transport.connect(&user).await.expect("connect");
///     assert_eq!(broker.connection_count(), 1);
/// });
/// ```
#[derive(Debug, Clone)]
pub struct InProcessTransport {
    broker: Arc<Broker>,
}

impl InProcessTransport {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }
}

#[async_trait]
impl PushTransport for InProcessTransport {
    async fn connect(&self, user: &UserId) -> Result<Box<dyn PushConnection>> {
        let connection = self.broker.connect()?;
        tracing::debug!(user = %user, connection_id = connection.id(), "in-process connection opened");
        Ok(Box::new(InProcessConnection {
            connection: Some(connection),
        }))
    }
}

#[derive(Debug)]
struct InProcessConnection {
    // None after close.
    connection: Option<BrokerConnection>,
}

impl InProcessConnection {
    fn live(&self) -> Result<&BrokerConnection> {
        self.connection.as_ref().ok_or(TransportError::Closed)
    }
}

fn closed_or(err: BrokerError) -> TransportError {
    match err {
        BrokerError::ConnectionClosed(_) => TransportError::Closed,
        other => TransportError::Broker(other),
    }
}

#[async_trait]
impl PushConnection for InProcessConnection {
    async fn subscribe(&mut self, topic: &Topic) -> Result<()> {
        self.live()?.subscribe(topic.as_str()).map_err(closed_or)
    }

    async fn unsubscribe(&mut self, topic: &Topic) -> Result<()> {
        self.live()?.unsubscribe(topic.as_str()).map_err(closed_or)
    }

    async fn next_inbound(&mut self) -> Result<Option<Inbound>> {
        let Some(connection) = self.connection.as_mut() else {
            return Ok(None);
        };
        Ok(connection.recv().await.map(|delivery| {
            Inbound::Event(PushEvent {
                topic: delivery.topic,
                event: delivery.event,
                payload: delivery.payload,
            })
        }))
    }

    async fn close(&mut self) {
        self.connection = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::time::timeout;

    fn user() -> UserId {
        UserId::new("7").expect("user")
    }

    #[tokio::test]
    async fn events_flow_from_broker_to_connection() {
        let broker = Arc::new(Broker::new());
        let transport = InProcessTransport::new(Arc::clone(&broker));
        let mut connection = transport.connect(&user()).await.expect("connect");
        let topic = Topic::new("user.7").expect("topic");
        connection.subscribe(&topic).await.expect("subscribe");

        broker.publish("user.7", "notification.created", Bytes::from_static(b"{}"));
        let inbound = timeout(Duration::from_secs(1), connection.next_inbound())
            .await
            .expect("timely")
            .expect("inbound");
        assert_eq!(
            inbound,
            Some(Inbound::Event(PushEvent {
                topic: "user.7".into(),
                event: "notification.created".into(),
                payload: Bytes::from_static(b"{}"),
            }))
        );
    }

    #[tokio::test]
    async fn severed_connection_reports_peer_close() {
        let broker = Arc::new(Broker::new());
        let transport = InProcessTransport::new(Arc::clone(&broker));
        let mut connection = transport.connect(&user()).await.expect("connect");
        broker.disconnect_all();
        let inbound = connection.next_inbound().await.expect("inbound");
        assert!(inbound.is_none());
        let topic = Topic::new("user.7").expect("topic");
        assert!(matches!(
            connection.subscribe(&topic).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn unreachable_broker_fails_connect() {
        let broker = Arc::new(Broker::new());
        broker.set_reachable(false);
        let transport = InProcessTransport::new(broker);
        assert!(matches!(
            transport.connect(&user()).await,
            Err(TransportError::Broker(BrokerError::Unreachable))
        ));
    }

    #[tokio::test]
    async fn close_releases_broker_connection() {
        let broker = Arc::new(Broker::new());
        let transport = InProcessTransport::new(Arc::clone(&broker));
        let mut connection = transport.connect(&user()).await.expect("connect");
        assert_eq!(broker.connection_count(), 1);
        connection.close().await;
        assert_eq!(broker.connection_count(), 0);
        assert!(connection.next_inbound().await.expect("inbound").is_none());
    }
}
