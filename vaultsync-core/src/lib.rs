//! VaultSync Core Library
//!
//! This library provides the synchronization engine behind the relay:
//! versioned secret records, the secret store contract, live per-user
//! fan-out of updates and version-watermark reconciliation for
//! reconnecting devices.

pub mod store;
pub mod sync;

pub use store::{MemorySecretStore, SecretStore, StoreError};
pub use sync::{
    parse_known_ids, CatchUpDeletionRouting, CatchUpReport, MakeUpdateOutcome, Secret,
    SecretKind, SecretsController, Update, UpdateAction, UpdateManager, UpdateReceiver, Version,
    VersionClock, VersionError,
};

use thiserror::Error;
use uuid::Uuid;

/// Result type for synchronization operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// General error type for synchronization operations
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Client {client_id} of user {user_id} is already subscribed")]
    AlreadySubscribed { user_id: Uuid, client_id: Uuid },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unknown update action: {0}")]
    UnknownAction(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Version error: {0}")]
    Version(#[from] VersionError),

    #[error("Operation cancelled")]
    Cancelled,
}
