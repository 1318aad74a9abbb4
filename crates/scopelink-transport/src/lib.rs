//! ScopeLink transport layer.
//!
//! Secured publish/subscribe connections to the broker that sits between
//! callers and instruments:
//!
//! - [`TransportConnection`]: connect, publish with acknowledgement,
//!   subscribe with wildcard filters, background dispatch
//! - [`ReconnectSupervisor`]: fixed-interval reconnection with
//!   resubscription, reported on a watch channel
//! - [`LinkClient`] / [`LinkDriver`]: the wire seam, implemented over rumqttc
//!   (feature `mqtt`) and by an in-memory broker (feature `loopback`)
//!
//! ## Example
//!
//! ```rust,no_run
//! use scopelink_transport::{QoS, TransportConfig, TransportConnection};
//!
//! # async fn demo() -> scopelink_transport::Result<()> {
//! let config = TransportConfig::new("broker.example.com").with_auth("user", "pass");
//! let conn = TransportConnection::connect(&config).await?;
//! let mut returns = conn.subscribe("microscope2/return", QoS::ExactlyOnce).await?;
//! conn.publish("microscope2/command", r#"{"command":"get_pos"}"#, QoS::ExactlyOnce).await?;
//! let reply = returns.recv().await;
//! # let _ = reply;
//! conn.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod link;
pub mod message;
pub mod supervisor;
pub mod topic;

#[cfg(feature = "loopback")]
pub mod loopback;
#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use config::{TlsRoots, TransportConfig};
pub use connection::{ConnectionState, MessageCallback, RouteId, Subscription, TransportConnection};
pub use error::{Result, TransportError};
pub use link::{LinkClient, LinkDriver, LinkEvent};
pub use message::{InboundMessage, QoS};
pub use supervisor::{ReconnectSupervisor, Recovery, RestoreHook};
pub use topic::{command_topic, return_topic, status_device_id, TopicFilter, STATUS_FILTER};

#[cfg(feature = "loopback")]
pub use loopback::{LoopbackBroker, LoopbackClient, LoopbackDriver};
#[cfg(feature = "mqtt")]
pub use mqtt::{mqtt_link, MqttLinkClient, MqttLinkDriver};
