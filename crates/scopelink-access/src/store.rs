//! Key record storage.
//!
//! Two kinds of records, both with upsert semantics: key records by key value
//! and the last issuance instant per device.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use crate::error::Result;
use crate::key::AccessKey;

pub trait KeyStore: Send + Sync {
    fn put_key(&self, key: &AccessKey) -> Result<()>;

    fn get_key(&self, value: &str) -> Result<Option<AccessKey>>;

    /// Returns whether a record was removed.
    fn remove_key(&self, value: &str) -> Result<bool>;

    fn keys_for_device(&self, device_id: &str) -> Result<Vec<AccessKey>>;

    fn last_issued(&self, device_id: &str) -> Result<Option<DateTime<Utc>>>;

    fn set_last_issued(&self, device_id: &str, at: DateTime<Utc>) -> Result<()>;
}

/// Store that lives as long as the process.
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: RwLock<HashMap<String, AccessKey>>,
    issuance: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn put_key(&self, key: &AccessKey) -> Result<()> {
        self.keys.write().insert(key.value.clone(), key.clone());
        Ok(())
    }

    fn get_key(&self, value: &str) -> Result<Option<AccessKey>> {
        Ok(self.keys.read().get(value).cloned())
    }

    fn remove_key(&self, value: &str) -> Result<bool> {
        Ok(self.keys.write().remove(value).is_some())
    }

    fn keys_for_device(&self, device_id: &str) -> Result<Vec<AccessKey>> {
        Ok(self
            .keys
            .read()
            .values()
            .filter(|k| k.device_id == device_id)
            .cloned()
            .collect())
    }

    fn last_issued(&self, device_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.issuance.read().get(device_id).copied())
    }

    fn set_last_issued(&self, device_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.issuance.write().insert(device_id.to_string(), at);
        Ok(())
    }
}

// Keys table: key = key value, value = AccessKey (JSON)
const KEYS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("access_keys");

// Issuance table: key = device_id, value = RFC 3339 timestamp
const ISSUANCE_TABLE: TableDefinition<&str, &str> = TableDefinition::new("last_issuance");

/// Key store persisted in a redb file.
pub struct RedbKeyStore {
    db: Arc<Database>,
    path: PathBuf,
}

impl RedbKeyStore {
    /// Open or create a key store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        // Make sure both tables exist so read transactions never miss them.
        let write_txn = db.begin_write()?;
        {
            let _keys = write_txn.open_table(KEYS_TABLE)?;
            let _issuance = write_txn.open_table(ISSUANCE_TABLE)?;
        }
        write_txn.commit()?;

        debug!("Opened key store at {}", path.display());
        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyStore for RedbKeyStore {
    fn put_key(&self, key: &AccessKey) -> Result<()> {
        let json = serde_json::to_string(key)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(KEYS_TABLE)?;
            table.insert(key.value.as_str(), json.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get_key(&self, value: &str) -> Result<Option<AccessKey>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(KEYS_TABLE)?;
        let record = table.get(value)?;
        match record {
            Some(json) => Ok(Some(serde_json::from_str(json.value())?)),
            None => Ok(None),
        }
    }

    fn remove_key(&self, value: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(KEYS_TABLE)?;
            let previous = table.remove(value)?;
            previous.is_some()
        };
        write_txn.commit()?;
        Ok(removed)
    }

    fn keys_for_device(&self, device_id: &str) -> Result<Vec<AccessKey>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(KEYS_TABLE)?;

        let mut keys = Vec::new();
        for entry in table.iter()? {
            let (_value, json) = entry?;
            let key: AccessKey = serde_json::from_str(json.value())?;
            if key.device_id == device_id {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    fn last_issued(&self, device_id: &str) -> Result<Option<DateTime<Utc>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ISSUANCE_TABLE)?;
        let record = table.get(device_id)?;
        match record {
            Some(ts) => Ok(Some(
                DateTime::parse_from_rfc3339(ts.value())?.with_timezone(&Utc),
            )),
            None => Ok(None),
        }
    }

    fn set_last_issued(&self, device_id: &str, at: DateTime<Utc>) -> Result<()> {
        let ts = at.to_rfc3339();
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(ISSUANCE_TABLE)?;
            table.insert(device_id, ts.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}
