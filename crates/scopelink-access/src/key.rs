//! Access keys and issuance policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Length of generated key values.
pub const KEY_LENGTH: usize = 20;

/// A key granting control of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessKey {
    pub device_id: String,
    pub value: String,
    pub issued_at: DateTime<Utc>,
    /// Hard expiry, if the policy has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// No new key for the device before this instant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl AccessKey {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |expires| now >= expires)
    }
}

/// Random alphanumeric key value from the OS generator.
pub fn generate_key_value() -> String {
    rand::rngs::OsRng
        .sample_iter(&Alphanumeric)
        .take(KEY_LENGTH)
        .map(char::from)
        .collect()
}

/// Broker account a device key is provisioned under.
pub fn broker_username(device_id: &str) -> String {
    format!("{}clientuser", device_id)
}

/// How a gate issues keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPolicy {
    /// Key lifetime; `None` keys never expire on their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifetime: Option<Duration>,
    /// Minimum interval between two issuances for the same device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown: Option<Duration>,
    /// Create a broker account with the key as password
    #[serde(default)]
    pub provision: bool,
    /// Drop earlier key records of the device on re-issue
    #[serde(default)]
    pub revoke_previous: bool,
}

impl KeyPolicy {
    /// Short-lived keys: 30 minutes, no cooldown, no broker account.
    pub fn ephemeral() -> Self {
        Self {
            lifetime: Some(Duration::from_secs(1800)),
            cooldown: None,
            provision: false,
            revoke_previous: false,
        }
    }

    /// Broker-account keys: re-issuable every 3 minutes, previous key revoked.
    pub fn provisioned() -> Self {
        Self {
            lifetime: None,
            cooldown: Some(Duration::from_secs(180)),
            provision: true,
            revoke_previous: true,
        }
    }

    pub fn with_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Option<Duration>) -> Self {
        self.cooldown = cooldown;
        self
    }
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self::ephemeral()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys() {
        let a = generate_key_value();
        let b = generate_key_value();
        assert_eq!(a.len(), KEY_LENGTH);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_policies() {
        let ephemeral = KeyPolicy::ephemeral();
        assert_eq!(ephemeral.lifetime, Some(Duration::from_secs(1800)));
        assert!(ephemeral.cooldown.is_none());
        assert!(!ephemeral.provision);

        let provisioned = KeyPolicy::provisioned();
        assert!(provisioned.lifetime.is_none());
        assert_eq!(provisioned.cooldown, Some(Duration::from_secs(180)));
        assert!(provisioned.provision && provisioned.revoke_previous);
    }

    #[test]
    fn test_expiry_boundary() {
        let issued = Utc::now();
        let key = AccessKey {
            device_id: "microscope2".into(),
            value: generate_key_value(),
            issued_at: issued,
            expires_at: Some(issued + chrono::Duration::seconds(60)),
            cooldown_until: None,
        };
        assert!(!key.is_expired_at(issued + chrono::Duration::milliseconds(59_999)));
        assert!(key.is_expired_at(issued + chrono::Duration::seconds(60)));
        assert_eq!(broker_username("microscope2"), "microscope2clientuser");
    }
}
