//! # ScopeLink Access
//!
//! Per-device access keys: who may drive a microscope, and for how long.
//!
//! A gate runs under one [`KeyPolicy`]:
//!
//! - [`KeyPolicy::ephemeral`]: keys expire after 30 minutes, any number may be issued
//! - [`KeyPolicy::provisioned`]: one key per device every 3 minutes, backed by a
//!   broker account named `<device>clientuser` with the key as its password
//!
//! ```no_run
//! use scopelink_access::{AccessGate, Issuance, KeyPolicy};
//!
//! # async fn demo() -> scopelink_access::Result<()> {
//! let gate = AccessGate::new(KeyPolicy::ephemeral());
//! if let Issuance::Issued(key) = gate.issue("microscope2").await? {
//!     assert!(gate.check_access(&key.value, "microscope2").await?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod error;
pub mod gate;
pub mod key;
pub mod provision;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{AccessError, Result};
pub use gate::{AccessGate, Issuance};
pub use key::{broker_username, generate_key_value, AccessKey, KeyPolicy, KEY_LENGTH};
pub use provision::{AdminConfig, BrokerAdminClient, CredentialProvisioner};
pub use store::{KeyStore, MemoryKeyStore, RedbKeyStore};
