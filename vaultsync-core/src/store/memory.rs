//! In-memory secret store. Nothing survives a restart.

use crate::store::{SecretStore, StoreError};
use crate::sync::models::Secret;
use crate::sync::version::{Version, VersionClock};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

/// Secrets of one owner, keyed by id.
type OwnerSecrets = HashMap<Uuid, Secret>;

/// Owner-scoped secrets held in process memory.
pub struct MemorySecretStore {
    /// owner -> id -> secret
    owners: RwLock<HashMap<Uuid, OwnerSecrets>>,
    clock: VersionClock,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self {
            owners: RwLock::new(HashMap::new()),
            clock: VersionClock::new(),
        }
    }

    /// Number of secrets held for `owner` (for diagnostics).
    pub fn secret_count(&self, owner: Uuid) -> usize {
        self.owners.read().get(&owner).map_or(0, HashMap::len)
    }
}

impl Default for MemorySecretStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn add_secret(&self, owner: Uuid, secret: &Secret) -> Result<(Uuid, Version), StoreError> {
        let mut owners = self.owners.write();
        let secrets = owners.entry(owner).or_default();

        let mut id = Uuid::new_v4();
        while secrets.contains_key(&id) {
            id = Uuid::new_v4();
        }
        let version = self.clock.tick();

        let mut stored = secret.clone();
        stored.id = id;
        stored.version = Some(version);
        secrets.insert(id, stored);

        Ok((id, version))
    }

    async fn update_secret(&self, owner: Uuid, secret: &Secret) -> Result<Version, StoreError> {
        let mut owners = self.owners.write();
        let stored = owners
            .get_mut(&owner)
            .and_then(|secrets| secrets.get_mut(&secret.id))
            .ok_or(StoreError::NotFound(secret.id))?;

        let version = self.clock.tick();
        stored.kind = secret.kind;
        stored.data = secret.data.clone();
        stored.version = Some(version);

        Ok(version)
    }

    async fn remove_secret(&self, owner: Uuid, id: Uuid) -> Result<Version, StoreError> {
        let mut owners = self.owners.write();
        owners
            .get_mut(&owner)
            .and_then(|secrets| secrets.remove(&id))
            .ok_or(StoreError::NotFound(id))?;

        Ok(self.clock.tick())
    }

    async fn secrets_above_version(
        &self,
        owner: Uuid,
        known_version: Version,
    ) -> Result<Vec<Secret>, StoreError> {
        let owners = self.owners.read();
        let mut newer: Vec<Secret> = owners
            .get(&owner)
            .into_iter()
            .flat_map(|secrets| secrets.values())
            .filter(|s| s.version.is_some_and(|v| v.is_after(&known_version)))
            .cloned()
            .collect();
        newer.sort_by_key(|s| s.version);

        Ok(newer)
    }

    async fn delete_unknown_secrets_before_version(
        &self,
        owner: Uuid,
        known_version: Version,
        known_ids: &[Uuid],
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut owners = self.owners.write();
        let Some(secrets) = owners.get_mut(&owner) else {
            return Ok(Vec::new());
        };

        let mut doomed: Vec<(Option<Version>, Uuid)> = secrets
            .values()
            .filter(|s| !s.version.is_some_and(|v| v.is_after(&known_version)))
            .filter(|s| known_ids.binary_search(&s.id).is_err())
            .map(|s| (s.version, s.id))
            .collect();
        doomed.sort();

        for (_, id) in &doomed {
            secrets.remove(id);
        }

        Ok(doomed.into_iter().map(|(_, id)| id).collect())
    }

    async fn secret_ids(&self, owner: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let owners = self.owners.read();
        Ok(owners
            .get(&owner)
            .map(|secrets| secrets.keys().copied().collect())
            .unwrap_or_default())
    }
}
