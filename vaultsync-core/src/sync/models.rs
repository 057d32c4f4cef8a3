//! Sync data models: secret records and update events.

use crate::sync::version::Version;
use crate::SyncError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Informational kind of a secret. The payload is never interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretKind {
    #[default]
    Credentials,
    CreditCard,
    Memo,
    FileInfo,
}

impl SecretKind {
    /// Convert the kind to its string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credentials => "credentials",
            Self::CreditCard => "credit_card",
            Self::Memo => "memo",
            Self::FileInfo => "file_info",
        }
    }
}

impl FromStr for SecretKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "credentials" => Ok(Self::Credentials),
            "credit_card" => Ok(Self::CreditCard),
            "memo" => Ok(Self::Memo),
            "file_info" => Ok(Self::FileInfo),
            other => Err(SyncError::InvalidArgument(format!(
                "unknown secret kind: {other}"
            ))),
        }
    }
}

/// An opaque, versioned secret record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    /// Assigned by the store on creation.
    pub id: Uuid,
    pub kind: SecretKind,
    /// Encrypted client payload; opaque to the server.
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// `None` until the store has stamped the record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
}

impl Secret {
    /// A fresh, not yet stored secret.
    pub fn new(kind: SecretKind, data: Vec<u8>) -> Self {
        Self {
            id: Uuid::nil(),
            kind,
            data,
            version: None,
        }
    }

    /// Reference to a secret by id only, as carried by delete events.
    pub fn id_only(id: Uuid) -> Self {
        Self {
            id,
            kind: SecretKind::default(),
            data: Vec::new(),
            version: None,
        }
    }
}

/// State transition carried by an [`Update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateAction {
    Create,
    Update,
    Delete,
}

impl UpdateAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl FromStr for UpdateAction {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(SyncError::UnknownAction(other.to_string())),
        }
    }
}

/// One state transition of one secret, as written by a client or replayed
/// during catch-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    pub user_id: Uuid,
    /// Originating client; excluded from the live broadcast.
    pub client_id: Uuid,
    pub action: UpdateAction,
    pub secret: Secret,
}

impl Update {
    pub fn new(user_id: Uuid, client_id: Uuid, action: UpdateAction, secret: Secret) -> Self {
        Self {
            user_id,
            client_id,
            action,
            secret,
        }
    }
}

/// Parse client-supplied known ids, skipping entries that are not UUIDs.
pub fn parse_known_ids<S: AsRef<str>>(raw: &[S]) -> Vec<Uuid> {
    raw.iter()
        .filter_map(|s| match Uuid::parse_str(s.as_ref()) {
            Ok(id) => Some(id),
            Err(_) => {
                tracing::warn!(known_id = s.as_ref(), "Skipping unparseable known secret id");
                None
            }
        })
        .collect()
}

/// Custom base64 serialization for `Vec<u8>`.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
