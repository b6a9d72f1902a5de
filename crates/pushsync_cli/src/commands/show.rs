//! Show command implementation.

use super::key_name;
use crate::session::Session;
use pushsync_core::Entity;
use serde::Serialize;
use std::fmt::Write;

/// Local client state.
#[derive(Debug, Serialize)]
pub struct ShowResult {
    /// Push registration id, if registered.
    pub registration_id: Option<String>,
    /// Badge number.
    pub badge_number: u32,
    /// The installation entity.
    pub installation: Entity,
    /// The user entity.
    pub user: Entity,
}

/// Runs the show command.
pub fn run(session: &Session, format: &str) -> Result<String, Box<dyn std::error::Error>> {
    let context = session.context();
    let result = ShowResult {
        registration_id: context.registration_id(),
        badge_number: context.badge_number(),
        installation: context.installation().snapshot(),
        user: context.user().snapshot(),
    };

    match format {
        "json" => Ok(serde_json::to_string_pretty(&result)?),
        _ => Ok(text_output(&result)),
    }
}

fn text_output(result: &ShowResult) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Registration: {}",
        result.registration_id.as_deref().unwrap_or("(none)")
    );
    let _ = writeln!(out, "Badge:        {}", result.badge_number);
    for entity in [&result.installation, &result.user] {
        let _ = writeln!(out, "\n[{}]", entity.kind());
        write_entity(&mut out, entity);
    }
    out.trim_end().to_string()
}

fn write_entity(out: &mut String, entity: &Entity) {
    if entity.is_empty() {
        let _ = writeln!(out, "  (empty)");
        return;
    }
    for (key, value) in entity.current_values() {
        if !entity.is_dirty(*key) {
            let _ = writeln!(out, "  {:<24} {}", key_name(*key), value);
        }
    }
    for (key, value) in entity.dirty_values() {
        let _ = writeln!(out, "  {:<24} {} (dirty)", key_name(*key), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_session;
    use pushsync_core::AttributeKey;
    use serde_json::json;

    #[tokio::test]
    async fn text_marks_dirty_values() {
        let (_dir, session) = test_session();
        let user = session.context().user();
        user.set_current(AttributeKey::LastName, json!("Lee")).unwrap();
        user.set(AttributeKey::FirstName, json!("Ana")).unwrap();

        let text = run(&session, "text").unwrap();
        assert!(text.contains("Registration: (none)"));
        assert!(text.contains("[installation]\n  (empty)"));
        assert!(text.contains("lastName"));
        assert!(text.contains("\"Ana\" (dirty)"));
    }

    #[tokio::test]
    async fn json_output_parses() {
        let (_dir, session) = test_session();
        session.context().set_badge_number(4).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&run(&session, "json").unwrap()).unwrap();
        assert_eq!(value["badge_number"], json!(4));
        assert_eq!(value["registration_id"], json!(null));
    }
}
