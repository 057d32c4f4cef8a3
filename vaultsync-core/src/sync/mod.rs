//! Multi-device synchronization of secrets.
//!
//! Clients write secrets through the [`SecretsController`], which persists
//! them through a [`crate::SecretStore`] and pushes each stored change to the
//! owner's other live clients. A client that (re)connects subscribes with
//! the version watermark and ids it already holds, and receives a catch-up
//! of what it missed before the live stream.

pub mod controller;
pub mod models;
pub mod reconcile;
pub mod update_manager;
pub mod version;

pub use controller::{MakeUpdateOutcome, SecretsController};
pub use models::{parse_known_ids, Secret, SecretKind, Update, UpdateAction};
pub use reconcile::{CatchUpDeletionRouting, CatchUpReport};
pub use update_manager::{UpdateManager, UpdateReceiver, MAILBOX_CAPACITY};
pub use version::{Version, VersionClock, VersionError};
