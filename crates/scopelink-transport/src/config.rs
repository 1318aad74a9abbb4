//! Broker connection configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the TLS trust roots are obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "kind", content = "path")]
pub enum TlsRoots {
    /// Platform certificate store.
    #[default]
    Native,
    /// PEM file holding the CA certificate(s) of the broker.
    CaFile(PathBuf),
}

/// Configuration for one broker connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Broker host name
    pub host: String,

    /// Broker TLS port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Client ID (auto-generated if not provided)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Username for authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Password for authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Maximum incoming/outgoing packet size in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,

    /// TLS trust roots
    #[serde(default)]
    pub tls: TlsRoots,

    /// Upper bound for the initial connection attempt in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Fixed delay between reconnection attempts in seconds
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,

    /// Capacity of the request channel towards the event loop
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
}

fn default_port() -> u16 {
    8883
}
fn default_keep_alive() -> u64 {
    60
}
fn default_max_packet_size() -> usize {
    // Scans carry many base64 images in a single response.
    10 * 1024 * 1024
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_reconnect_interval() -> u64 {
    5
}
fn default_request_capacity() -> usize {
    10
}

impl TransportConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive(),
            max_packet_size: default_max_packet_size(),
            tls: TlsRoots::Native,
            connect_timeout_secs: default_connect_timeout(),
            reconnect_interval_secs: default_reconnect_interval(),
            request_capacity: default_request_capacity(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.tls = TlsRoots::CaFile(path.into());
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval_secs = interval.as_secs().max(1);
        self
    }

    pub fn full_broker_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Client id, generating a random one when none was configured.
    pub fn client_id_or_random(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("scopelink-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new("localhost")
    }
}
