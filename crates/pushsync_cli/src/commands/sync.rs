//! Register and sync command implementations.

use super::{describe, NOT_REGISTERED};
use crate::session::Session;
use pushsync_core::AttributeKey;

/// Registers `token` with the server.
pub async fn register(session: &Session, token: &str) -> Result<String, Box<dyn std::error::Error>> {
    let outcome = session.context().register(token).await?;
    let registration = session
        .context()
        .registration_id()
        .unwrap_or_else(|| "(none)".to_string());
    Ok(format!("{}; registration {registration}", describe(&outcome)))
}

/// Registers if a token is pending, then syncs installation and user.
pub async fn run(session: &Session) -> Result<String, Box<dyn std::error::Error>> {
    let context = session.context();
    if context.registration_id().is_none()
        && context
            .installation()
            .get(AttributeKey::PushServiceToken)
            .is_none()
    {
        return Ok(NOT_REGISTERED.to_string());
    }

    context.on_start().await?;
    Ok(format!(
        "synced registration {}",
        context.registration_id().unwrap_or_default()
    ))
}
