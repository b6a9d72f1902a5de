//! Message commands.

use super::describe_result;
use crate::session::Session;

/// Puts a message in the fake server inbox.
pub fn deliver(session: &Session, message_id: &str, body: &str) -> String {
    session.api().deliver(message_id, body);
    format!("queued {message_id} on the server")
}

/// Fetches messages from the server.
pub async fn fetch(session: &Session) -> Result<String, Box<dyn std::error::Error>> {
    Ok(describe_result(session.context().fetch_messages().await)?)
}
