//! Device system data reported to the server.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Device and SDK facts sent with the system data request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemData {
    /// SDK version.
    pub sdk_version: String,
    /// Operating system version.
    pub os_version: String,
    /// Device model.
    pub device_model: String,
    /// Host application version.
    pub app_version: String,
    /// Whether the user allows notifications.
    pub notifications_enabled: bool,
    /// Carrier name, if the host allows sending it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub carrier: Option<String>,
}

impl SystemData {
    /// Canonical JSON body.
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Hex-encoded SHA-256 of the canonical JSON body.
    ///
    /// Struct fields serialize in declaration order, so equal data always
    /// hashes equal.
    pub fn hash_hex(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&bytes);
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}
