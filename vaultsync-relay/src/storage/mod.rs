//! SQLite storage backend for the relay.

pub mod models;
pub mod secrets;

pub use secrets::SqliteSecretStore;

use crate::error::RelayError;
use models::{DeviceKey, StoredDevice};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Thread-safe relay storage.
#[derive(Clone)]
pub struct RelayStorage {
    conn: Arc<Mutex<Connection>>,
}

/// Outcome of a device registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Created,
    /// Same device, owner and key as already on record.
    Unchanged,
}

impl RelayStorage {
    pub fn open(path: &Path) -> Result<Self, anyhow::Error> {
        let conn = Connection::open(path)?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self, anyhow::Error> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;

        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.initialize_schema()?;
        Ok(storage)
    }

    fn initialize_schema(&self) -> Result<(), anyhow::Error> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("{}", e))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS devices (
                device_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                device_name TEXT NOT NULL,
                device_type TEXT NOT NULL,
                public_key BLOB NOT NULL,
                registered_at INTEGER NOT NULL,
                revoked INTEGER NOT NULL DEFAULT 0,
                revoked_at INTEGER,
                FOREIGN KEY (user_id) REFERENCES users(user_id)
            );

            CREATE TABLE IF NOT EXISTS secrets (
                secret_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                data BLOB NOT NULL,
                version TEXT NOT NULL,
                PRIMARY KEY (user_id, secret_id)
            );

            CREATE TABLE IF NOT EXISTS seen_nonces (
                nonce TEXT PRIMARY KEY,
                device_id TEXT NOT NULL,
                seen_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_secrets_user_version
                ON secrets(user_id, version);
            CREATE INDEX IF NOT EXISTS idx_devices_user
                ON devices(user_id);
            CREATE INDEX IF NOT EXISTS idx_seen_nonces_seen_at
                ON seen_nonces(seen_at);",
        )?;
        Ok(())
    }

    pub fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, RelayError> {
        self.conn
            .lock()
            .map_err(|e| RelayError::Internal(format!("Lock error: {}", e)))
    }

    /// Register the first device of a new owner.
    ///
    /// Re-registering a device is only accepted when nothing changes. An
    /// owner that already exists gets further devices through
    /// [`RelayStorage::enroll_device`] only.
    pub fn register_device(
        &self,
        device_id: Uuid,
        user_id: Uuid,
        device_name: &str,
        device_type: &str,
        public_key: &[u8],
        now: i64,
    ) -> Result<Registration, RelayError> {
        self.add_device(device_id, user_id, device_name, device_type, public_key, now, true)
    }

    /// Add a device to an existing owner, on behalf of one of its devices.
    pub fn enroll_device(
        &self,
        device_id: Uuid,
        user_id: Uuid,
        device_name: &str,
        device_type: &str,
        public_key: &[u8],
        now: i64,
    ) -> Result<Registration, RelayError> {
        self.add_device(device_id, user_id, device_name, device_type, public_key, now, false)
    }

    #[allow(clippy::too_many_arguments)]
    fn add_device(
        &self,
        device_id: Uuid,
        user_id: Uuid,
        device_name: &str,
        device_type: &str,
        public_key: &[u8],
        now: i64,
        new_owner: bool,
    ) -> Result<Registration, RelayError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let existing: Option<(String, Vec<u8>, bool)> = tx
            .query_row(
                "SELECT user_id, public_key, revoked FROM devices WHERE device_id = ?1",
                [device_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        if let Some((owner, key, revoked)) = existing {
            if revoked {
                return Err(RelayError::Conflict("Device has been revoked".to_string()));
            }
            if owner != user_id.to_string() || key != public_key {
                return Err(RelayError::Conflict(
                    "Device is already registered".to_string(),
                ));
            }
            return Ok(Registration::Unchanged);
        }

        let owner_exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE user_id = ?1)",
            [user_id.to_string()],
            |row| row.get(0),
        )?;
        match (new_owner, owner_exists) {
            (true, true) => {
                return Err(RelayError::Conflict(
                    "Owner already exists; enroll the device from one of its devices".to_string(),
                ))
            }
            (false, false) => {
                return Err(RelayError::NotFound(format!("Unknown owner {}", user_id)))
            }
            (true, false) => {
                tx.execute(
                    "INSERT INTO users (user_id, created_at) VALUES (?1, ?2)",
                    rusqlite::params![user_id.to_string(), now],
                )?;
            }
            (false, true) => {}
        }

        tx.execute(
            "INSERT INTO devices (device_id, user_id, device_name, device_type, public_key, registered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                device_id.to_string(),
                user_id.to_string(),
                device_name,
                device_type,
                public_key,
                now,
            ],
        )?;
        tx.commit()?;

        Ok(Registration::Created)
    }

    /// Key material and owner used to authenticate a device.
    pub fn device_key(&self, device_id: Uuid) -> Result<Option<DeviceKey>, RelayError> {
        let conn = self.conn()?;
        let row: Option<(String, Vec<u8>, bool)> = conn
            .query_row(
                "SELECT user_id, public_key, revoked FROM devices WHERE device_id = ?1",
                [device_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        row.map(|(user_id, public_key, revoked)| {
            Ok(DeviceKey {
                user_id: parse_uuid(&user_id)?,
                public_key,
                revoked,
            })
        })
        .transpose()
    }

    pub fn list_devices(&self, user_id: Uuid) -> Result<Vec<StoredDevice>, RelayError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT device_id, user_id, device_name, device_type, registered_at, revoked, revoked_at
             FROM devices WHERE user_id = ?1 ORDER BY registered_at, device_id",
        )?;

        let devices = stmt
            .query_map([user_id.to_string()], |row| {
                Ok(StoredDevice {
                    device_id: row.get(0)?,
                    user_id: row.get(1)?,
                    device_name: row.get(2)?,
                    device_type: row.get(3)?,
                    registered_at: row.get(4)?,
                    revoked: row.get(5)?,
                    revoked_at: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(devices)
    }

    /// Mark a device of `user_id` revoked. `NotFound` for foreign devices.
    pub fn revoke_device(&self, user_id: Uuid, device_id: Uuid, now: i64) -> Result<(), RelayError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE devices SET revoked = 1, revoked_at = ?1
             WHERE device_id = ?2 AND user_id = ?3 AND revoked = 0",
            rusqlite::params![now, device_id.to_string(), user_id.to_string()],
        )?;

        if changed == 0 {
            return Err(RelayError::NotFound(format!(
                "No active device {}",
                device_id
            )));
        }
        Ok(())
    }

    /// Record a nonce. `false` when it was seen before.
    pub fn record_nonce(&self, nonce: &str, device_id: Uuid, now: i64) -> Result<bool, RelayError> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO seen_nonces (nonce, device_id, seen_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![nonce, device_id.to_string(), now],
        )?;
        Ok(inserted == 1)
    }

    /// Drop nonces seen before `cutoff`. Returns how many were removed.
    pub fn prune_nonces(&self, cutoff: i64) -> Result<usize, RelayError> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM seen_nonces WHERE seen_at < ?1", [cutoff])?)
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid, RelayError> {
    Uuid::parse_str(raw).map_err(|e| RelayError::Database(format!("Corrupt id {}: {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [7; 32];

    #[test]
    fn test_register_creates_user_and_is_idempotent() {
        let storage = RelayStorage::in_memory().unwrap();
        let (device, user) = (Uuid::new_v4(), Uuid::new_v4());

        let first = storage
            .register_device(device, user, "laptop", "desktop", &KEY, 100)
            .unwrap();
        assert_eq!(first, Registration::Created);

        let again = storage
            .register_device(device, user, "laptop", "desktop", &KEY, 200)
            .unwrap();
        assert_eq!(again, Registration::Unchanged);

        let key = storage.device_key(device).unwrap().unwrap();
        assert_eq!(key.user_id, user);
        assert_eq!(key.public_key, KEY);
        assert!(!key.revoked);
    }

    #[test]
    fn test_register_rejects_takeover() {
        let storage = RelayStorage::in_memory().unwrap();
        let device = Uuid::new_v4();
        storage
            .register_device(device, Uuid::new_v4(), "a", "desktop", &KEY, 1)
            .unwrap();

        let other_owner = storage.register_device(device, Uuid::new_v4(), "a", "desktop", &KEY, 2);
        assert!(matches!(other_owner, Err(RelayError::Conflict(_))));
    }

    #[test]
    fn test_register_refuses_existing_owner() {
        let storage = RelayStorage::in_memory().unwrap();
        let owner = Uuid::new_v4();
        storage
            .register_device(Uuid::new_v4(), owner, "laptop", "desktop", &KEY, 1)
            .unwrap();

        let intruder = storage.register_device(Uuid::new_v4(), owner, "evil", "desktop", &[9; 32], 2);
        assert!(matches!(intruder, Err(RelayError::Conflict(_))));
        assert_eq!(storage.list_devices(owner).unwrap().len(), 1);
    }

    #[test]
    fn test_enroll_requires_existing_owner() {
        let storage = RelayStorage::in_memory().unwrap();
        let owner = Uuid::new_v4();

        let orphan = storage.enroll_device(Uuid::new_v4(), owner, "phone", "mobile", &KEY, 1);
        assert!(matches!(orphan, Err(RelayError::NotFound(_))));

        storage
            .register_device(Uuid::new_v4(), owner, "laptop", "desktop", &KEY, 2)
            .unwrap();
        let phone = Uuid::new_v4();
        let enrolled = storage
            .enroll_device(phone, owner, "phone", "mobile", &[8; 32], 3)
            .unwrap();
        assert_eq!(enrolled, Registration::Created);
        assert_eq!(storage.device_key(phone).unwrap().unwrap().user_id, owner);
    }

    #[test]
    fn test_revoke_is_owner_scoped() {
        let storage = RelayStorage::in_memory().unwrap();
        let (device, owner) = (Uuid::new_v4(), Uuid::new_v4());
        storage
            .register_device(device, owner, "phone", "mobile", &KEY, 1)
            .unwrap();

        assert!(matches!(
            storage.revoke_device(Uuid::new_v4(), device, 2),
            Err(RelayError::NotFound(_))
        ));
        storage.revoke_device(owner, device, 3).unwrap();
        assert!(storage.device_key(device).unwrap().unwrap().revoked);

        let listed = storage.list_devices(owner).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].revoked_at, Some(3));
    }

    #[test]
    fn test_nonces_are_single_use_until_pruned() {
        let storage = RelayStorage::in_memory().unwrap();
        let device = Uuid::new_v4();

        assert!(storage.record_nonce("n1", device, 100).unwrap());
        assert!(!storage.record_nonce("n1", device, 101).unwrap());

        assert_eq!(storage.prune_nonces(50).unwrap(), 0);
        assert_eq!(storage.prune_nonces(150).unwrap(), 1);
        assert!(storage.record_nonce("n1", device, 200).unwrap());
    }

    #[test]
    fn test_unknown_device_has_no_key() {
        let storage = RelayStorage::in_memory().unwrap();
        assert!(storage.device_key(Uuid::new_v4()).unwrap().is_none());
    }
}
