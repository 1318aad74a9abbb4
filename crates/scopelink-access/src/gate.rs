//! Access key issuance and validation.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::error::{AccessError, Result};
use crate::key::{broker_username, generate_key_value, AccessKey, KeyPolicy};
use crate::provision::CredentialProvisioner;
use crate::store::{KeyStore, MemoryKeyStore};

/// Outcome of a key request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issuance {
    Issued(AccessKey),
    /// A key was issued for the device too recently.
    Cooldown { remaining: Duration },
}

impl Issuance {
    pub fn key(&self) -> Option<&AccessKey> {
        match self {
            Issuance::Issued(key) => Some(key),
            Issuance::Cooldown { .. } => None,
        }
    }
}

/// Issues and validates device access keys under one [`KeyPolicy`].
///
/// Issue and validate are serialised so the cooldown check and the mint that
/// follows it cannot interleave with another request.
pub struct AccessGate {
    policy: KeyPolicy,
    store: Arc<dyn KeyStore>,
    clock: Arc<dyn Clock>,
    provisioner: Option<Arc<dyn CredentialProvisioner>>,
    lock: Mutex<()>,
}

impl AccessGate {
    /// In-memory gate on the system clock.
    pub fn new(policy: KeyPolicy) -> Self {
        Self {
            policy,
            store: Arc::new(MemoryKeyStore::new()),
            clock: Arc::new(SystemClock),
            provisioner: None,
            lock: Mutex::new(()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn KeyStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn CredentialProvisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    pub fn policy(&self) -> &KeyPolicy {
        &self.policy
    }

    /// Request a key with the policy's lifetime.
    pub async fn issue(&self, device_id: &str) -> Result<Issuance> {
        self.mint(device_id, self.policy.lifetime).await
    }

    /// Request a key that expires after `lifetime`.
    pub async fn issue_for(&self, device_id: &str, lifetime: Duration) -> Result<Issuance> {
        self.mint(device_id, Some(lifetime)).await
    }

    async fn mint(&self, device_id: &str, lifetime: Option<Duration>) -> Result<Issuance> {
        let _guard = self.lock.lock().await;
        let now = self.clock.now();

        if let Some(cooldown) = self.policy.cooldown {
            if let Some(last) = self.store.last_issued(device_id)? {
                // A clock that went backwards counts as no time elapsed.
                let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
                if elapsed < cooldown {
                    let remaining = cooldown - elapsed;
                    debug!(
                        "Key for {} refused, cooldown {:?} remaining",
                        device_id,
                        remaining
                    );
                    return Ok(Issuance::Cooldown { remaining });
                }
            }
        }

        let expires_at = match lifetime {
            Some(lifetime) if lifetime.is_zero() => {
                return Err(AccessError::InvalidPolicy(
                    "key lifetime must be positive".to_string(),
                ))
            }
            Some(lifetime) => Some(add_to(now, lifetime)?),
            None => None,
        };
        let cooldown_until = match self.policy.cooldown {
            Some(cooldown) => Some(add_to(now, cooldown)?),
            None => None,
        };

        let key = AccessKey {
            device_id: device_id.to_string(),
            value: generate_key_value(),
            issued_at: now,
            expires_at,
            cooldown_until,
        };

        // Nothing is recorded unless the broker account exists.
        if self.policy.provision {
            let provisioner = self.provisioner.as_ref().ok_or_else(|| {
                AccessError::InvalidPolicy(
                    "provisioning policy without a credential provisioner".to_string(),
                )
            })?;
            provisioner
                .provision(&broker_username(device_id), &key.value)
                .await?;
        }

        if self.policy.revoke_previous {
            let revoked = self.revoke_locked(device_id)?;
            if revoked > 0 {
                info!("Revoked {} previous key(s) for {}", revoked, device_id);
            }
        }

        self.store.put_key(&key)?;
        self.store.set_last_issued(device_id, now)?;
        info!("Issued access key for {}", device_id);

        Ok(Issuance::Issued(key))
    }

    /// Device the key grants access to, if it is known and unexpired.
    ///
    /// Expired keys are removed on lookup.
    pub async fn validate(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;

        let Some(record) = self.store.get_key(key)? else {
            info!("Rejected unknown access key");
            return Ok(None);
        };

        if record.is_expired_at(self.clock.now()) {
            self.store.remove_key(key)?;
            info!("Access key for {} expired", record.device_id);
            return Ok(None);
        }

        Ok(Some(record.device_id))
    }

    pub async fn check_access(&self, key: &str, device_id: &str) -> Result<bool> {
        Ok(self.validate(key).await?.as_deref() == Some(device_id))
    }

    /// Drop every key record of a device. Returns how many were removed.
    pub async fn revoke_device(&self, device_id: &str) -> Result<usize> {
        let _guard = self.lock.lock().await;
        self.revoke_locked(device_id)
    }

    fn revoke_locked(&self, device_id: &str) -> Result<usize> {
        let mut removed = 0;
        for key in self.store.keys_for_device(device_id)? {
            if self.store.remove_key(&key.value)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// `at + duration`, rejecting durations that leave the calendar.
fn add_to(at: DateTime<Utc>, duration: Duration) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .ok_or_else(|| AccessError::InvalidPolicy(format!("duration {:?} out of range", duration)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;

    #[derive(Default)]
    struct RecordingProvisioner {
        calls: SyncMutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl CredentialProvisioner for RecordingProvisioner {
        async fn provision(&self, username: &str, password: &str) -> Result<()> {
            if self.fail {
                return Err(AccessError::Provisioning("broker unavailable".to_string()));
            }
            self.calls
                .lock()
                .push((username.to_string(), password.to_string()));
            Ok(())
        }
    }

    fn gate(policy: KeyPolicy) -> (AccessGate, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        let gate = AccessGate::new(policy).with_clock(Arc::new(clock.clone()));
        (gate, clock)
    }

    fn issued(issuance: Issuance) -> AccessKey {
        match issuance {
            Issuance::Issued(key) => key,
            other => panic!("expected a key, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lifetime_boundaries() {
        let (gate, clock) = gate(KeyPolicy::ephemeral());
        let key = issued(
            gate.issue_for("microscope2", Duration::from_secs(60))
                .await
                .unwrap(),
        );
        assert_eq!(key.value.len(), crate::key::KEY_LENGTH);

        assert_eq!(
            gate.validate(&key.value).await.unwrap().as_deref(),
            Some("microscope2")
        );
        clock.advance(Duration::from_millis(59_999));
        assert_eq!(
            gate.validate(&key.value).await.unwrap().as_deref(),
            Some("microscope2")
        );

        clock.advance(Duration::from_millis(1));
        assert_eq!(gate.validate(&key.value).await.unwrap(), None);

        // Purged: rewinding the clock does not bring it back.
        clock.set(key.issued_at);
        assert_eq!(gate.validate(&key.value).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_check_access_matches_validate() {
        let (gate, _clock) = gate(KeyPolicy::ephemeral());
        let key = issued(gate.issue("microscope2").await.unwrap());

        assert!(gate.check_access(&key.value, "microscope2").await.unwrap());
        assert!(!gate
            .check_access(&key.value, "deltastagereflection")
            .await
            .unwrap());
        assert!(!gate.check_access("nonsense", "microscope2").await.unwrap());
    }

    #[tokio::test]
    async fn test_ephemeral_has_no_cooldown() {
        let (gate, _clock) = gate(KeyPolicy::ephemeral());
        let a = issued(gate.issue("microscope2").await.unwrap());
        let b = issued(gate.issue("microscope2").await.unwrap());

        assert_ne!(a.value, b.value);
        assert_eq!(a.expires_at, Some(a.issued_at + chrono::Duration::seconds(1800)));
        // Both stay valid without revocation.
        assert!(gate.check_access(&a.value, "microscope2").await.unwrap());
        assert!(gate.check_access(&b.value, "microscope2").await.unwrap());
    }

    #[tokio::test]
    async fn test_cooldown_decreases_then_reissues() {
        let provisioner = Arc::new(RecordingProvisioner::default());
        let (gate, clock) = gate(KeyPolicy::provisioned());
        let gate = gate.with_provisioner(provisioner.clone());

        let first = issued(gate.issue("microscope2").await.unwrap());
        assert_eq!(first.expires_at, None);
        assert_eq!(
            first.cooldown_until,
            Some(first.issued_at + chrono::Duration::seconds(180))
        );

        let mut last = Duration::from_secs(180);
        for _ in 0..5 {
            clock.advance(Duration::from_secs(30));
            match gate.issue("microscope2").await.unwrap() {
                Issuance::Cooldown { remaining } => {
                    assert!(remaining < last);
                    last = remaining;
                }
                other => panic!("expected cooldown, got {:?}", other),
            }
        }
        assert_eq!(last, Duration::from_secs(30));

        // Other devices are unaffected.
        assert!(gate.issue("deltastagereflection").await.unwrap().key().is_some());

        clock.advance(Duration::from_secs(30));
        let second = issued(gate.issue("microscope2").await.unwrap());
        assert_ne!(first.value, second.value);

        let calls = provisioner.calls.lock().clone();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0], ("microscope2clientuser".to_string(), first.value.clone()));
        assert_eq!(calls[2], ("microscope2clientuser".to_string(), second.value.clone()));
    }

    #[tokio::test]
    async fn test_reissue_revokes_previous_key() {
        let (gate, clock) = gate(KeyPolicy::provisioned());
        let gate = gate.with_provisioner(Arc::new(RecordingProvisioner::default()));

        let first = issued(gate.issue("microscope2").await.unwrap());
        clock.advance(Duration::from_secs(180));
        let second = issued(gate.issue("microscope2").await.unwrap());

        assert_eq!(gate.validate(&first.value).await.unwrap(), None);
        assert!(gate.check_access(&second.value, "microscope2").await.unwrap());

        assert_eq!(gate.revoke_device("microscope2").await.unwrap(), 1);
        assert!(!gate.check_access(&second.value, "microscope2").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_provisioning_records_nothing() {
        let store = Arc::new(MemoryKeyStore::new());
        let (gate, _clock) = gate(KeyPolicy::provisioned());
        let gate = gate
            .with_store(store.clone())
            .with_provisioner(Arc::new(RecordingProvisioner {
                fail: true,
                ..Default::default()
            }));

        let err = gate.issue("microscope2").await.unwrap_err();
        assert!(matches!(err, AccessError::Provisioning(_)));
        assert!(store.last_issued("microscope2").unwrap().is_none());
        assert!(store.keys_for_device("microscope2").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_provisioning_requires_provisioner() {
        let (gate, _clock) = gate(KeyPolicy::provisioned());
        let err = gate.issue("microscope2").await.unwrap_err();
        assert!(matches!(err, AccessError::InvalidPolicy(_)));
    }

    #[tokio::test]
    async fn test_zero_lifetime_rejected() {
        let (gate, _clock) = gate(KeyPolicy::ephemeral());
        let err = gate
            .issue_for("microscope2", Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, AccessError::InvalidPolicy(_)));
    }

    #[tokio::test]
    async fn test_lifetime_past_the_calendar_rejected() {
        let store = Arc::new(MemoryKeyStore::new());
        let (gate, _clock) = gate(KeyPolicy::ephemeral());
        let gate = gate.with_store(store.clone());

        // Representable as a chrono duration, but not once added to today.
        for secs in [9_000_000_000_000, 10_000_000_000_000] {
            let err = gate
                .issue_for("microscope2", Duration::from_secs(secs))
                .await
                .unwrap_err();
            assert!(matches!(err, AccessError::InvalidPolicy(_)));
        }
        assert!(store.keys_for_device("microscope2").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cooldown_past_the_calendar_rejected() {
        let (gate, _clock) = gate(
            KeyPolicy::ephemeral().with_cooldown(Some(Duration::from_secs(9_000_000_000_000))),
        );
        let err = gate.issue("microscope2").await.unwrap_err();
        assert!(matches!(err, AccessError::InvalidPolicy(_)));
        assert!(gate.issue("microscope2").await.is_err());
    }
}
