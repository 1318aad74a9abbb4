//! The seam between a [`TransportConnection`](crate::TransportConnection) and the wire.
//!
//! A link is split the way MQTT client libraries split it: a cloneable request
//! side that enqueues packets, and an event side that must be polled for
//! anything to happen. Polling a driver whose link is down (re)connects it.

use async_trait::async_trait;

use crate::error::Result;
use crate::message::{InboundMessage, QoS};

/// Something the event side observed.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The broker accepted the connection.
    Connected,
    /// A message arrived on a subscribed topic.
    Message(InboundMessage),
    /// A queued publish left the client with the given packet id (0 for QoS 0).
    PublishSent { pkid: u16 },
    /// The broker completed delivery of a QoS 1/2 publish (PUBACK / PUBCOMP).
    PublishAcked { pkid: u16 },
    /// An explicit disconnect was flushed.
    Closed,
    /// Protocol traffic with no meaning to the connection (pings, sub acks, ...).
    Idle,
}

/// Request side of a link.
#[async_trait]
pub trait LinkClient: Send + Sync + 'static {
    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<()>;

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()>;

    /// Queue a subscription without waiting. Fails when the request queue is full.
    fn try_subscribe(&self, filter: &str, qos: QoS) -> Result<()>;

    async fn unsubscribe(&self, filter: &str) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}

/// Event side of a link.
#[async_trait]
pub trait LinkDriver: Send + 'static {
    /// Wait for the next event, connecting first if the link is down.
    async fn poll(&mut self) -> Result<LinkEvent>;
}

