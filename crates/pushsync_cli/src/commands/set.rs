//! Set command implementation.

use crate::session::Session;
use pushsync_core::{AttrValue, AttributeKey, EntityKind};

/// Runs the set command: stores `value` as a dirty attribute.
pub fn run(
    session: &Session,
    entity: &str,
    key: &str,
    value: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let kind = parse_kind(entity)?;
    let key = AttributeKey::from_wire_name(kind, key)
        .ok_or_else(|| format!("Unknown {kind} attribute: {key}"))?;
    let value = parse_value(value);

    let tracker = match kind {
        EntityKind::Installation => session.context().installation(),
        EntityKind::User => session.context().user(),
    };
    tracker.set(key, value.clone())?;
    tracing::debug!(entity = %kind, ?key, "attribute set");

    Ok(format!("{kind}.{} = {value} (dirty)", super::key_name(key)))
}

fn parse_kind(entity: &str) -> Result<EntityKind, String> {
    match entity {
        "installation" | "instance" => Ok(EntityKind::Installation),
        "user" => Ok(EntityKind::User),
        other => Err(format!("Unknown entity: {other} (expected installation or user)")),
    }
}

/// JSON if it parses, otherwise the raw text as a string.
fn parse_value(raw: &str) -> AttrValue {
    serde_json::from_str(raw).unwrap_or_else(|_| AttrValue::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_session;
    use serde_json::json;

    #[test]
    fn values_fall_back_to_strings() {
        assert_eq!(parse_value("42"), json!(42));
        assert_eq!(parse_value("[\"a\"]"), json!(["a"]));
        assert_eq!(parse_value("Ana"), json!("Ana"));
    }

    #[tokio::test]
    async fn set_marks_the_attribute_dirty() {
        let (_dir, session) = test_session();
        let line = run(&session, "user", "firstName", "Ana").unwrap();
        assert_eq!(line, "user.firstName = \"Ana\" (dirty)");
        assert!(session.context().user().is_dirty(AttributeKey::FirstName));
    }

    #[tokio::test]
    async fn unknown_keys_and_entities_are_rejected() {
        let (_dir, session) = test_session();
        assert!(run(&session, "user", "isPrimary", "true").is_err());
        assert!(run(&session, "device", "firstName", "Ana").is_err());
    }
}
