use serde::{Deserialize, Serialize};

/// Name stamped into audit fields when no authenticated user is attached.
pub const SYSTEM_ACTOR: &str = "System";

/// Authenticated identity attached to a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub role: String,
}

impl Actor {
    /// Display name, falling back to the email address.
    pub fn name(&self) -> &str {
        match self.display_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name,
            _ => &self.email,
        }
    }
}

/// Resolves the audit name for a mutation. Called once per mutation.
pub fn actor_name(actor: Option<&Actor>) -> String {
    match actor {
        Some(actor) if !actor.name().trim().is_empty() => actor.name().to_string(),
        _ => SYSTEM_ACTOR.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(display_name: Option<&str>, email: &str) -> Actor {
        Actor {
            id: "USR001".to_string(),
            email: email.to_string(),
            display_name: display_name.map(str::to_string),
            role: "broker".to_string(),
        }
    }

    #[test]
    fn prefers_display_name_then_email_then_system() {
        assert_eq!(
            actor_name(Some(&actor(Some("Jane Broker"), "jane@example.com"))),
            "Jane Broker"
        );
        assert_eq!(
            actor_name(Some(&actor(Some("  "), "jane@example.com"))),
            "jane@example.com"
        );
        assert_eq!(actor_name(Some(&actor(None, ""))), SYSTEM_ACTOR);
        assert_eq!(actor_name(None), SYSTEM_ACTOR);
    }
}
