use crate::core::{Document, ENVELOPE_FIELDS, EntityKind};
use crate::model::AuditMeta;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// Business field set of one entity type.
///
/// Implementors define the schema through serde; `validate` covers the rules
/// serde cannot express.
pub trait EntityFields:
    Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
    const KIND: EntityKind;

    fn validate(&self) -> Result<(), String>;

    /// Writes the acting user into the entity's own author field, if it has one.
    fn attribute_creation(&mut self, _actor: &str) {}

    /// Customer or enquiry this record hangs off, used by list filters.
    fn owner_ref(&self) -> Option<&str> {
        None
    }

    /// Field no two records of this type may share.
    const UNIQUE_FIELD: Option<&'static str> = None;

    /// Normalized value of [`Self::UNIQUE_FIELD`].
    fn unique_key(&self) -> Option<String> {
        None
    }

    /// Rewrites raw client input (create body or update patch) before parsing.
    /// May block, e.g. to hash a password.
    fn prepare_input(_input: &mut Document) -> Result<(), String> {
        Ok(())
    }

    /// Removes fields that never leave the server.
    fn redact(_doc: &mut Document) {}
}

/// Versioned envelope around a business field set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<T> {
    pub id: String,
    #[serde(flatten)]
    pub audit: AuditMeta,
    #[serde(flatten)]
    pub fields: T,
}

impl<T: EntityFields> Record<T> {
    pub fn new(id: impl Into<String>, fields: T) -> Self {
        Self {
            id: id.into(),
            audit: AuditMeta::default(),
            fields,
        }
    }

    pub fn version(&self) -> u64 {
        self.audit.version
    }

    pub fn to_document(&self) -> Result<Document, serde_json::Error> {
        match serde_json::to_value(self)? {
            JsonValue::Object(doc) => Ok(doc),
            _ => Err(<serde_json::Error as serde::ser::Error>::custom(
                "record did not serialize to an object",
            )),
        }
    }

    pub fn from_document(doc: Document) -> Result<Self, serde_json::Error> {
        serde_json::from_value(JsonValue::Object(doc))
    }

    /// Document form with server-only fields removed.
    pub fn to_public(&self) -> Result<Document, serde_json::Error> {
        let mut doc = self.to_document()?;
        T::redact(&mut doc);
        Ok(doc)
    }
}

/// Drops envelope keys and applies the entity's own input rewrite.
pub fn sanitize_input<T: EntityFields>(mut input: Document) -> Result<Document, String> {
    for key in ENVELOPE_FIELDS {
        input.remove(key);
    }
    T::prepare_input(&mut input)?;
    Ok(input)
}

/// Decodes sanitized create input into a validated field set.
pub fn fields_from_input<T: EntityFields>(input: Document) -> Result<T, String> {
    let fields: T = serde_json::from_value(JsonValue::Object(input))
        .map_err(|err| format!("invalid {} payload: {err}", T::KIND.label()))?;
    fields.validate()?;
    Ok(fields)
}

/// Overlays a sanitized patch on the current field set and re-validates.
///
/// `null` clears optional fields.
pub fn apply_patch<T: EntityFields>(current: &T, patch: Document) -> Result<T, String> {
    let mut merged = match serde_json::to_value(current) {
        Ok(JsonValue::Object(doc)) => doc,
        Ok(_) => return Err(format!("{} fields are not an object", T::KIND.label())),
        Err(err) => return Err(err.to_string()),
    };
    for (key, value) in patch {
        merged.insert(key, value);
    }
    fields_from_input(merged)
}

/// Parses a create payload into a validated field set.
pub fn parse_fields<T: EntityFields>(input: Document) -> Result<T, String> {
    fields_from_input(sanitize_input::<T>(input)?)
}

/// Sanitizes a patch and overlays it on the current field set.
pub fn merge_patch<T: EntityFields>(current: &T, patch: Document) -> Result<T, String> {
    apply_patch(current, sanitize_input::<T>(patch)?)
}

/// Field must be present and not blank.
pub(crate) fn require_text(value: &str, field: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field} must not be blank"));
    }
    Ok(())
}
