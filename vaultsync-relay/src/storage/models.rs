//! Relay storage model types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDevice {
    pub device_id: String,
    pub user_id: String,
    pub device_name: String,
    pub device_type: String,
    pub registered_at: i64,
    pub revoked: bool,
    pub revoked_at: Option<i64>,
}

/// What request authentication needs to know about a device.
#[derive(Debug, Clone)]
pub struct DeviceKey {
    pub user_id: Uuid,
    pub public_key: Vec<u8>,
    pub revoked: bool,
}
