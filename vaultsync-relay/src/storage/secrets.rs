//! SQLite-backed secret store.
//!
//! Versions are stored in their fixed-width textual form, so SQL text
//! comparison orders them correctly.

use crate::storage::RelayStorage;
use async_trait::async_trait;
use rusqlite::Connection;
use std::sync::MutexGuard;
use uuid::Uuid;
use vaultsync_core::{Secret, SecretKind, SecretStore, StoreError, Version, VersionClock};

/// Durable [`SecretStore`] on the relay database.
pub struct SqliteSecretStore {
    storage: RelayStorage,
    clock: VersionClock,
}

impl SqliteSecretStore {
    /// Open the store, resuming the version clock after the newest stored
    /// version.
    pub fn open(storage: RelayStorage) -> Result<Self, StoreError> {
        let newest: Option<String> = {
            let conn = lock(&storage)?;
            conn.query_row("SELECT MAX(version) FROM secrets", [], |row| row.get(0))
                .map_err(storage_err)?
        };

        let clock = match newest {
            Some(raw) => VersionClock::resume_after(raw.parse()?),
            None => VersionClock::new(),
        };
        Ok(Self { storage, clock })
    }
}

fn lock(storage: &RelayStorage) -> Result<MutexGuard<'_, Connection>, StoreError> {
    storage.conn().map_err(storage_err)
}

fn storage_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Storage(e.to_string())
}

fn read_secret(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, Vec<u8>, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode_secret(raw: (String, String, Vec<u8>, String)) -> Result<Secret, StoreError> {
    let (id, kind, data, version) = raw;
    Ok(Secret {
        id: Uuid::parse_str(&id).map_err(storage_err)?,
        kind: kind.parse::<SecretKind>().map_err(storage_err)?,
        data,
        version: Some(version.parse::<Version>()?),
    })
}

#[async_trait]
impl SecretStore for SqliteSecretStore {
    async fn add_secret(&self, owner: Uuid, secret: &Secret) -> Result<(Uuid, Version), StoreError> {
        let conn = lock(&self.storage)?;
        let id = Uuid::new_v4();
        let version = self.clock.tick();

        conn.execute(
            "INSERT INTO secrets (secret_id, user_id, kind, data, version) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                id.to_string(),
                owner.to_string(),
                secret.kind.as_str(),
                secret.data,
                version.to_string(),
            ],
        )
        .map_err(storage_err)?;

        Ok((id, version))
    }

    async fn update_secret(&self, owner: Uuid, secret: &Secret) -> Result<Version, StoreError> {
        let conn = lock(&self.storage)?;
        let version = self.clock.tick();

        let changed = conn
            .execute(
                "UPDATE secrets SET kind = ?1, data = ?2, version = ?3
                 WHERE user_id = ?4 AND secret_id = ?5",
                rusqlite::params![
                    secret.kind.as_str(),
                    secret.data,
                    version.to_string(),
                    owner.to_string(),
                    secret.id.to_string(),
                ],
            )
            .map_err(storage_err)?;

        if changed == 0 {
            return Err(StoreError::NotFound(secret.id));
        }
        Ok(version)
    }

    async fn remove_secret(&self, owner: Uuid, id: Uuid) -> Result<Version, StoreError> {
        let conn = lock(&self.storage)?;
        let changed = conn
            .execute(
                "DELETE FROM secrets WHERE user_id = ?1 AND secret_id = ?2",
                [owner.to_string(), id.to_string()],
            )
            .map_err(storage_err)?;

        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(self.clock.tick())
    }

    async fn secrets_above_version(
        &self,
        owner: Uuid,
        known_version: Version,
    ) -> Result<Vec<Secret>, StoreError> {
        let conn = lock(&self.storage)?;
        let mut stmt = conn
            .prepare(
                "SELECT secret_id, kind, data, version FROM secrets
                 WHERE user_id = ?1 AND version > ?2
                 ORDER BY version ASC",
            )
            .map_err(storage_err)?;

        let rows = stmt
            .query_map([owner.to_string(), known_version.to_string()], read_secret)
            .map_err(storage_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage_err)?;

        rows.into_iter().map(decode_secret).collect()
    }

    async fn delete_unknown_secrets_before_version(
        &self,
        owner: Uuid,
        known_version: Version,
        known_ids: &[Uuid],
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut conn = lock(&self.storage)?;
        let tx = conn.transaction().map_err(storage_err)?;

        let candidates: Vec<String> = {
            let mut stmt = tx
                .prepare(
                    "SELECT secret_id FROM secrets
                     WHERE user_id = ?1 AND version <= ?2
                     ORDER BY version ASC",
                )
                .map_err(storage_err)?;
            let ids = stmt
                .query_map([owner.to_string(), known_version.to_string()], |row| row.get(0))
                .map_err(storage_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(storage_err)?;
            ids
        };

        let mut deleted = Vec::new();
        for raw in candidates {
            let id = Uuid::parse_str(&raw).map_err(storage_err)?;
            if known_ids.binary_search(&id).is_ok() {
                continue;
            }
            tx.execute(
                "DELETE FROM secrets WHERE user_id = ?1 AND secret_id = ?2",
                [owner.to_string(), raw],
            )
            .map_err(storage_err)?;
            deleted.push(id);
        }
        tx.commit().map_err(storage_err)?;

        Ok(deleted)
    }

    async fn secret_ids(&self, owner: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let conn = lock(&self.storage)?;
        let mut stmt = conn
            .prepare("SELECT secret_id FROM secrets WHERE user_id = ?1")
            .map_err(storage_err)?;

        let raw: Vec<String> = stmt
            .query_map([owner.to_string()], |row| row.get(0))
            .map_err(storage_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage_err)?;

        raw.iter()
            .map(|id| Uuid::parse_str(id).map_err(storage_err))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memo(data: &[u8]) -> Secret {
        Secret::new(SecretKind::Memo, data.to_vec())
    }

    #[tokio::test]
    async fn test_versions_increase_across_updates() {
        let store = SqliteSecretStore::open(RelayStorage::in_memory().unwrap()).unwrap();
        let owner = Uuid::new_v4();
        let (id, mut prev) = store.add_secret(owner, &memo(b"0")).await.unwrap();

        for i in 1..20 {
            let mut secret = memo(format!("{i}").as_bytes());
            secret.id = id;
            let next = store.update_secret(owner, &secret).await.unwrap();
            assert!(next.is_after(&prev));
            prev = next;
        }

        let stored = store.secrets_above_version(owner, Version::epoch()).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].data, b"19");
        assert_eq!(stored[0].kind, SecretKind::Memo);
        assert_eq!(stored[0].version, Some(prev));
    }

    #[tokio::test]
    async fn test_missing_secret_is_not_found() {
        let store = SqliteSecretStore::open(RelayStorage::in_memory().unwrap()).unwrap();
        let owner = Uuid::new_v4();
        let (id, _) = store.add_secret(owner, &memo(b"mine")).await.unwrap();

        let mut foreign = memo(b"theirs");
        foreign.id = id;
        assert!(matches!(
            store.update_secret(Uuid::new_v4(), &foreign).await,
            Err(StoreError::NotFound(missing)) if missing == id
        ));
        assert!(matches!(
            store.remove_secret(Uuid::new_v4(), id).await,
            Err(StoreError::NotFound(_))
        ));

        store.remove_secret(owner, id).await.unwrap();
        assert!(store.secret_ids(owner).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reconciliation_queries() {
        let store = SqliteSecretStore::open(RelayStorage::in_memory().unwrap()).unwrap();
        let owner = Uuid::new_v4();
        let (forgotten, _) = store.add_secret(owner, &memo(b"f")).await.unwrap();
        let (known, watermark) = store.add_secret(owner, &memo(b"k")).await.unwrap();
        let (newer, _) = store.add_secret(owner, &memo(b"n")).await.unwrap();

        let above = store.secrets_above_version(owner, watermark).await.unwrap();
        assert_eq!(above.iter().map(|s| s.id).collect::<Vec<_>>(), vec![newer]);

        let deleted = store
            .delete_unknown_secrets_before_version(owner, watermark, &[known])
            .await
            .unwrap();
        assert_eq!(deleted, vec![forgotten]);

        let mut remaining = store.secret_ids(owner).await.unwrap();
        remaining.sort();
        let mut expected = vec![known, newer];
        expected.sort();
        assert_eq!(remaining, expected);
    }

    #[tokio::test]
    async fn test_clock_resumes_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");
        let owner = Uuid::new_v4();

        let far_future: Version = "2200-01-01T00:00:00.000000000Z".parse().unwrap();
        {
            let storage = RelayStorage::open(&path).unwrap();
            storage
                .conn()
                .unwrap()
                .execute(
                    "INSERT INTO secrets (secret_id, user_id, kind, data, version) VALUES (?1, ?2, 'memo', x'00', ?3)",
                    [Uuid::new_v4().to_string(), owner.to_string(), far_future.to_string()],
                )
                .unwrap();
        }

        let store = SqliteSecretStore::open(RelayStorage::open(&path).unwrap()).unwrap();
        let (_, version) = store.add_secret(owner, &memo(b"later")).await.unwrap();
        assert!(version.is_after(&far_future));
    }
}
