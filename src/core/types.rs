use serde::{Deserialize, Serialize};
use std::fmt;

/// A stored record as the backends see it: one JSON object.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Field names every stored document may carry outside its business payload.
pub const ID_FIELD: &str = "id";
pub const VERSION_FIELD: &str = "version";
pub const ENVELOPE_FIELDS: [&str; 6] = [
    ID_FIELD,
    VERSION_FIELD,
    "createdBy",
    "createdAt",
    "modifiedBy",
    "lastModifiedAt",
];

/// The entity types the CRM stores, one collection each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityKind {
    Customer,
    Enquiry,
    Fee,
    Note,
    Product,
    StageHistory,
    User,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        Self::Customer,
        Self::Enquiry,
        Self::Fee,
        Self::Note,
        Self::Product,
        Self::StageHistory,
        Self::User,
    ];

    /// Collection (file / document collection) name.
    pub fn collection(self) -> &'static str {
        match self {
            Self::Customer => "customers",
            Self::Enquiry => "enquiries",
            Self::Fee => "fees",
            Self::Note => "notes",
            Self::Product => "products",
            Self::StageHistory => "stage_history",
            Self::User => "users",
        }
    }

    /// Human readable type name used in conflict and not-found messages.
    pub fn label(self) -> &'static str {
        match self {
            Self::Customer => "Customer",
            Self::Enquiry => "Enquiry",
            Self::Fee => "Fee",
            Self::Note => "Note",
            Self::Product => "Product",
            Self::StageHistory => "StageHistory",
            Self::User => "User",
        }
    }

    pub fn id_format(self) -> IdFormat {
        match self {
            Self::Customer => IdFormat::padded("GKF", 5),
            Self::Enquiry => IdFormat::padded("ENQ", 3),
            Self::Product => IdFormat::padded("PRD", 3),
            Self::User => IdFormat::padded("USR", 3),
            Self::Fee => IdFormat::plain("FEE"),
            Self::Note => IdFormat::plain("NOTE"),
            Self::StageHistory => IdFormat::plain("SH"),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Prefix plus minimum digit count of a human-readable sequential id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdFormat {
    pub prefix: &'static str,
    pub width: usize,
}

impl IdFormat {
    pub const fn padded(prefix: &'static str, width: usize) -> Self {
        Self { prefix, width }
    }

    pub const fn plain(prefix: &'static str) -> Self {
        Self { prefix, width: 0 }
    }

    pub fn format(&self, number: u64) -> String {
        format!("{}{:0width$}", self.prefix, number, width = self.width)
    }
}
