//! Secret store contract consumed by the synchronization controller.

pub mod memory;

pub use memory::MemorySecretStore;

use crate::sync::models::Secret;
use crate::sync::version::{Version, VersionError};
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Store-layer failure. `NotFound` is distinguishable from storage faults.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Secret not found: {0}")]
    NotFound(Uuid),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Stored version is corrupt: {0}")]
    CorruptVersion(#[from] VersionError),
}

/// Durable, owner-scoped storage of secrets.
///
/// Every version handed out must come from a single strictly monotonic
/// clock per store, so that versions of different secrets of one owner
/// are comparable.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Store a new secret. Returns the assigned id and version.
    async fn add_secret(&self, owner: Uuid, secret: &Secret) -> Result<(Uuid, Version), StoreError>;

    /// Replace the secret with `secret.id`. Returns the new version.
    async fn update_secret(&self, owner: Uuid, secret: &Secret) -> Result<Version, StoreError>;

    /// Remove a secret. Returns the version of the deletion event.
    async fn remove_secret(&self, owner: Uuid, id: Uuid) -> Result<Version, StoreError>;

    /// Secrets whose version is strictly after `known_version`, in
    /// ascending version order.
    async fn secrets_above_version(
        &self,
        owner: Uuid,
        known_version: Version,
    ) -> Result<Vec<Secret>, StoreError>;

    /// Delete secrets whose id is not in `known_ids` (sorted) and whose
    /// version is not after `known_version`. Returns the deleted ids.
    async fn delete_unknown_secrets_before_version(
        &self,
        owner: Uuid,
        known_version: Version,
        known_ids: &[Uuid],
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Ids of every secret the owner currently has.
    async fn secret_ids(&self, owner: Uuid) -> Result<Vec<Uuid>, StoreError>;
}
