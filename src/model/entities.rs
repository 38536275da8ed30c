//! Business field sets of the CRM collections.

use crate::core::{Document, EntityKind};
use crate::model::record::{EntityFields, require_text};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

fn default_customer_status() -> String {
    "Active".to_string()
}

fn default_enquiry_status() -> String {
    "New".to_string()
}

fn default_fee_status() -> String {
    "Pending".to_string()
}

fn default_role() -> String {
    ROLE_BROKER.to_string()
}

const NOTE_AUTHOR_FIELD: &str = "author";
const STAGE_USER_FIELD: &str = "user";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default = "default_customer_status")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
}

impl EntityFields for Customer {
    const KIND: EntityKind = EntityKind::Customer;

    fn validate(&self) -> Result<(), String> {
        require_text(&self.name, "name")?;
        if let Some(email) = self.email.as_deref()
            && !email.is_empty()
            && !email.contains('@')
        {
            return Err("email must be a valid address".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enquiry {
    pub customer_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enquiry_type: Option<String>,
    #[serde(default = "default_enquiry_status")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loan_amount: Option<f64>,
}

impl EntityFields for Enquiry {
    const KIND: EntityKind = EntityKind::Enquiry;

    fn validate(&self) -> Result<(), String> {
        require_text(&self.customer_name, "customerName")?;
        if let Some(amount) = self.loan_amount
            && (amount.is_nan() || amount < 0.0)
        {
            return Err("loanAmount must be a non-negative number".to_string());
        }
        Ok(())
    }

    fn owner_ref(&self) -> Option<&str> {
        self.customer_id.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fee {
    pub customer_id: String,
    #[serde(default)]
    pub description: String,
    pub amount: f64,
    #[serde(default = "default_fee_status")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDate>,
}

impl EntityFields for Fee {
    const KIND: EntityKind = EntityKind::Fee;

    fn validate(&self) -> Result<(), String> {
        require_text(&self.customer_id, "customerId")?;
        if self.amount.is_nan() || self.amount < 0.0 {
            return Err("amount must be a non-negative number".to_string());
        }
        Ok(())
    }

    fn owner_ref(&self) -> Option<&str> {
        Some(&self.customer_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub reference_id: String,
    pub content: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub pinned: bool,
}

impl EntityFields for Note {
    const KIND: EntityKind = EntityKind::Note;

    fn validate(&self) -> Result<(), String> {
        require_text(&self.reference_id, "referenceId")?;
        require_text(&self.content, "content")
    }

    fn attribute_creation(&mut self, actor: &str) {
        self.author = actor.to_string();
    }

    /// The author is whoever created the note.
    fn prepare_input(input: &mut Document) -> Result<(), String> {
        input.remove(NOTE_AUTHOR_FIELD);
        Ok(())
    }

    fn owner_ref(&self) -> Option<&str> {
        Some(&self.reference_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub customer_id: String,
    pub product_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub premium: Option<f64>,
}

impl EntityFields for Product {
    const KIND: EntityKind = EntityKind::Product;

    fn validate(&self) -> Result<(), String> {
        require_text(&self.customer_id, "customerId")?;
        require_text(&self.product_type, "productType")
    }

    fn owner_ref(&self) -> Option<&str> {
        Some(&self.customer_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageHistoryEntry {
    pub customer_id: String,
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default)]
    pub user: String,
}

impl EntityFields for StageHistoryEntry {
    const KIND: EntityKind = EntityKind::StageHistory;

    fn validate(&self) -> Result<(), String> {
        require_text(&self.customer_id, "customerId")?;
        require_text(&self.stage, "stage")
    }

    fn attribute_creation(&mut self, actor: &str) {
        self.user = actor.to_string();
    }

    fn prepare_input(input: &mut Document) -> Result<(), String> {
        input.remove(STAGE_USER_FIELD);
        Ok(())
    }

    fn owner_ref(&self) -> Option<&str> {
        Some(&self.customer_id)
    }
}

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_BROKER: &str = "broker";
pub const ROLE_VIEWER: &str = "viewer";

const PASSWORD_FIELD: &str = "password";
const PASSWORD_HASH_FIELD: &str = "passwordHash";
const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub password_hash: String,
}

impl User {
    pub fn verify_password(&self, password: &str) -> bool {
        bcrypt::verify(password, &self.password_hash).unwrap_or(false)
    }
}

impl EntityFields for User {
    const KIND: EntityKind = EntityKind::User;
    const UNIQUE_FIELD: Option<&'static str> = Some("email");

    fn unique_key(&self) -> Option<String> {
        Some(self.email.trim().to_lowercase())
    }

    fn validate(&self) -> Result<(), String> {
        require_text(&self.email, "email")?;
        if !self.email.contains('@') {
            return Err("email must be a valid address".to_string());
        }
        if ![ROLE_ADMIN, ROLE_BROKER, ROLE_VIEWER].contains(&self.role.as_str()) {
            return Err(format!(
                "role must be one of: {ROLE_ADMIN}, {ROLE_BROKER}, {ROLE_VIEWER}"
            ));
        }
        if self.password_hash.is_empty() {
            return Err("password is required".to_string());
        }
        Ok(())
    }

    /// Hashes a plain `password` into `passwordHash`; raw hashes are refused.
    fn prepare_input(input: &mut Document) -> Result<(), String> {
        if input.remove(PASSWORD_HASH_FIELD).is_some() {
            return Err("passwordHash cannot be set directly".to_string());
        }
        let Some(password) = input.remove(PASSWORD_FIELD) else {
            return Ok(());
        };
        let JsonValue::String(password) = password else {
            return Err("password must be a string".to_string());
        };
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(format!(
                "password must be at least {MIN_PASSWORD_LEN} characters"
            ));
        }
        let hash = bcrypt::hash(&password, bcrypt::DEFAULT_COST)
            .map_err(|err| format!("failed to hash password: {err}"))?;
        input.insert(PASSWORD_HASH_FIELD.to_string(), JsonValue::String(hash));
        Ok(())
    }

    fn redact(doc: &mut Document) {
        doc.remove(PASSWORD_HASH_FIELD);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::record::{merge_patch, parse_fields};
    use serde_json::json;

    fn doc(value: JsonValue) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn required_fields_are_enforced() {
        assert!(parse_fields::<Fee>(doc(json!({ "amount": 10.0 }))).is_err());
        assert!(parse_fields::<Fee>(doc(json!({ "customerId": "GKF00001", "amount": -1 }))).is_err());
        assert!(parse_fields::<Note>(doc(json!({ "referenceId": "ENQ001", "content": " " }))).is_err());
        assert!(parse_fields::<Product>(doc(json!({ "customerId": "GKF00001" }))).is_err());

        let fee = parse_fields::<Fee>(doc(json!({ "customerId": "GKF00001", "amount": 250 })))
            .unwrap();
        assert_eq!(fee.status, "Pending");
        assert_eq!(fee.owner_ref(), Some("GKF00001"));
    }

    #[test]
    fn notes_and_stage_history_carry_the_acting_user() {
        let mut note =
            parse_fields::<Note>(doc(json!({ "referenceId": "ENQ001", "content": "called" })))
                .unwrap();
        note.attribute_creation("Jane Broker");
        assert_eq!(note.author, "Jane Broker");

        let mut entry =
            parse_fields::<StageHistoryEntry>(doc(json!({ "customerId": "GKF00001", "stage": "Lead" })))
                .unwrap();
        entry.attribute_creation("System");
        assert_eq!(entry.user, "System");
    }

    #[test]
    fn patches_cannot_reattribute_notes_or_stage_changes() {
        let mut note =
            parse_fields::<Note>(doc(json!({ "referenceId": "ENQ001", "content": "called" })))
                .unwrap();
        note.attribute_creation("Jane Broker");
        let edited =
            merge_patch(&note, doc(json!({ "content": "called back", "author": "Mallory" })))
                .unwrap();
        assert_eq!(edited.author, "Jane Broker");
        assert_eq!(edited.content, "called back");

        let mut entry = parse_fields::<StageHistoryEntry>(doc(json!({
            "customerId": "GKF00001",
            "stage": "Lead",
            "user": "Mallory"
        })))
        .unwrap();
        assert_eq!(entry.user, "");
        entry.attribute_creation("Jane Broker");
        let moved = merge_patch(&entry, doc(json!({ "user": "Mallory" }))).unwrap();
        assert_eq!(moved.user, "Jane Broker");
    }

    #[test]
    fn user_email_key_ignores_case_and_padding() {
        let user = parse_fields::<User>(doc(json!({
            "email": " Jane@Example.com",
            "password": "correct horse"
        })))
        .unwrap();
        assert_eq!(user.unique_key().as_deref(), Some("jane@example.com"));
        assert_eq!(User::UNIQUE_FIELD, Some("email"));
        assert_eq!(Note::UNIQUE_FIELD, None);
    }

    #[test]
    fn user_password_is_hashed_and_redacted() {
        let user = parse_fields::<User>(doc(json!({
            "email": "jane@example.com",
            "password": "correct horse"
        })))
        .unwrap();
        assert_ne!(user.password_hash, "correct horse");
        assert!(user.verify_password("correct horse"));
        assert!(!user.verify_password("wrong password"));
        assert_eq!(user.role, ROLE_BROKER);

        let mut public = serde_json::to_value(&user).unwrap().as_object().cloned().unwrap();
        User::redact(&mut public);
        assert!(!public.contains_key("passwordHash"));
    }

    #[test]
    fn user_rejects_raw_hash_and_short_password() {
        let raw = parse_fields::<User>(doc(json!({
            "email": "jane@example.com",
            "passwordHash": "$2b$12$forged"
        })));
        assert!(raw.is_err());

        let short = parse_fields::<User>(doc(json!({
            "email": "jane@example.com",
            "password": "short"
        })));
        assert!(short.is_err());

        let missing = parse_fields::<User>(doc(json!({ "email": "jane@example.com" })));
        assert_eq!(missing.unwrap_err(), "password is required");
    }

    #[test]
    fn user_patch_keeps_hash_when_password_absent() {
        let user = parse_fields::<User>(doc(json!({
            "email": "jane@example.com",
            "password": "correct horse"
        })))
        .unwrap();
        let patched = merge_patch(&user, doc(json!({ "role": "admin" }))).unwrap();
        assert_eq!(patched.password_hash, user.password_hash);
        assert_eq!(patched.role, ROLE_ADMIN);

        assert!(merge_patch(&user, doc(json!({ "role": "owner" }))).is_err());
    }
}
