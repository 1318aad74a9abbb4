//! MQTT link over TLS, backed by rumqttc.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet};

use crate::config::{TlsRoots, TransportConfig};
use crate::error::{Result, TransportError};
use crate::link::{LinkClient, LinkDriver, LinkEvent};
use crate::message::{InboundMessage, QoS};

/// Request side of an MQTT link.
#[derive(Clone)]
pub struct MqttLinkClient {
    client: AsyncClient,
}

/// Event side of an MQTT link.
pub struct MqttLinkDriver {
    eventloop: EventLoop,
}

/// Build the request and event halves of a TLS-secured MQTT link.
///
/// Nothing touches the network until the driver is first polled.
pub fn mqtt_link(config: &TransportConfig) -> Result<(MqttLinkClient, MqttLinkDriver)> {
    let options = mqtt_options(config)?;
    let (client, eventloop) = AsyncClient::new(options, config.request_capacity.max(1));
    Ok((MqttLinkClient { client }, MqttLinkDriver { eventloop }))
}

fn mqtt_options(config: &TransportConfig) -> Result<MqttOptions> {
    let mut options = MqttOptions::new(config.client_id_or_random(), &config.host, config.port);

    options.set_max_packet_size(config.max_packet_size, config.max_packet_size);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
    options.set_clean_session(true);

    if let (Some(user), Some(pass)) = (&config.username, &config.password) {
        options.set_credentials(user, pass);
    }

    let transport = match &config.tls {
        TlsRoots::Native => rumqttc::Transport::tls_with_default_config(),
        TlsRoots::CaFile(path) => {
            let ca = std::fs::read(path).map_err(|e| {
                TransportError::Connection(format!(
                    "cannot read CA file {}: {}",
                    path.display(),
                    e
                ))
            })?;
            rumqttc::Transport::tls(ca, None, None)
        }
    };
    options.set_transport(transport);

    Ok(options)
}

#[async_trait]
impl LinkClient for MqttLinkClient {
    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<()> {
        self.client.publish(topic, qos.into(), false, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        self.client.subscribe(filter, qos.into()).await?;
        Ok(())
    }

    fn try_subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        self.client.try_subscribe(filter, qos.into())?;
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<()> {
        self.client.unsubscribe(filter).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.client.disconnect().await?;
        Ok(())
    }
}

#[async_trait]
impl LinkDriver for MqttLinkDriver {
    async fn poll(&mut self) -> Result<LinkEvent> {
        let event = self.eventloop.poll().await?;
        Ok(translate(event))
    }
}

fn translate(event: Event) -> LinkEvent {
    match event {
        Event::Incoming(Packet::ConnAck(ack)) if ack.code == ConnectReturnCode::Success => {
            LinkEvent::Connected
        }
        Event::Incoming(Packet::Publish(publish)) => LinkEvent::Message(InboundMessage {
            topic: publish.topic,
            payload: publish.payload.to_vec(),
            qos: publish.qos.into(),
            retain: publish.retain,
            received_at: chrono::Utc::now(),
        }),
        Event::Incoming(Packet::PubAck(ack)) => LinkEvent::PublishAcked { pkid: ack.pkid },
        Event::Incoming(Packet::PubComp(comp)) => LinkEvent::PublishAcked { pkid: comp.pkid },
        Event::Outgoing(Outgoing::Publish(pkid)) => LinkEvent::PublishSent { pkid },
        Event::Outgoing(Outgoing::Disconnect) => LinkEvent::Closed,
        _ => LinkEvent::Idle,
    }
}
