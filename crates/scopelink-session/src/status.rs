//! Device status registry.
//!
//! Devices publish a plain status string on `devices/<id>/status`. The
//! registry keeps the latest one per device.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use scopelink_transport::{status_device_id, QoS, RouteId, TransportConnection, STATUS_FILTER};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

/// Latest status reported by one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

/// Status of every device seen so far.
pub struct StatusRegistry {
    conn: TransportConnection,
    route: RouteId,
    statuses: Arc<RwLock<BTreeMap<String, DeviceStatus>>>,
}

impl StatusRegistry {
    /// Start tracking status messages on `conn`.
    pub async fn attach(conn: &TransportConnection) -> Result<Self> {
        let statuses: Arc<RwLock<BTreeMap<String, DeviceStatus>>> = Arc::default();

        let sink = statuses.clone();
        let route = conn
            .on_message(STATUS_FILTER, QoS::AtLeastOnce, move |msg| {
                let Some(device_id) = status_device_id(&msg.topic) else {
                    return;
                };
                let status = msg.payload_str().into_owned();
                debug!("Device {} reported status {}", device_id, status);
                sink.write().insert(
                    device_id.to_string(),
                    DeviceStatus {
                        device_id: device_id.to_string(),
                        status,
                        updated_at: msg.received_at,
                    },
                );
            })
            .await?;

        Ok(Self {
            conn: conn.clone(),
            route,
            statuses,
        })
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceStatus> {
        self.statuses.read().get(device_id).cloned()
    }

    /// Copy of the current statuses, ordered by device id.
    pub fn snapshot(&self) -> BTreeMap<String, DeviceStatus> {
        self.statuses.read().clone()
    }

    pub fn len(&self) -> usize {
        self.statuses.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.read().is_empty()
    }

    /// Human-readable listing, one device per line.
    pub fn render(&self) -> String {
        let statuses = self.statuses.read();
        if statuses.is_empty() {
            return "No devices connected".to_string();
        }
        let mut text = String::from("Device Status:\n");
        for (device, status) in statuses.iter() {
            text.push_str(&format!("{}: {}\n", device, status.status));
        }
        text
    }

    /// Stop tracking. The collected statuses are returned.
    pub async fn detach(self) -> Result<BTreeMap<String, DeviceStatus>> {
        self.conn.remove(self.route).await?;
        Ok(self.snapshot())
    }
}
