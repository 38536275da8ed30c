use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version counter and audit trail carried by every stored entity.
///
/// Records written before versioning existed deserialize with
/// `version == 0` and no audit fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditMeta {
    #[serde(default)]
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_at: Option<DateTime<Utc>>,
}

impl AuditMeta {
    pub fn is_versioned(&self) -> bool {
        self.version > 0
    }

    /// First stamp: version 1, creation fields mirrored into modification fields.
    pub fn stamp_for_create(&mut self, actor: &str, now: DateTime<Utc>) {
        self.version = 1;
        self.created_by = Some(actor.to_string());
        self.created_at = Some(now);
        self.modified_by = Some(actor.to_string());
        self.last_modified_at = Some(now);
    }

    /// Advances from the version currently held here, which must be the
    /// stored one. Creation fields are left alone.
    pub fn stamp_for_update(&mut self, actor: &str, now: DateTime<Utc>) {
        self.version += 1;
        self.modified_by = Some(actor.to_string());
        self.last_modified_at = Some(now);
    }
}
