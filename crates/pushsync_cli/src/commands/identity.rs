//! Personalize, depersonalize and primary device commands.

use super::{describe, describe_result, NOT_REGISTERED};
use crate::session::Session;
use pushsync_engine::UserIdentity;
use std::collections::BTreeMap;

/// Binds the user to the given identity keys.
pub async fn personalize(
    session: &Session,
    external_user_id: Option<String>,
    emails: Vec<String>,
    phones: Vec<String>,
    force: bool,
) -> Result<String, Box<dyn std::error::Error>> {
    let identity = UserIdentity {
        external_user_id,
        emails,
        phones,
    };
    let result = session
        .context()
        .personalize(&identity, BTreeMap::new(), force)
        .await;
    Ok(describe_result(result)?)
}

/// Unbinds the user; local user data is dropped on success.
pub async fn depersonalize(session: &Session) -> Result<String, Box<dyn std::error::Error>> {
    Ok(describe_result(session.context().depersonalize().await)?)
}

/// Sets the primary flag of `registration`, or of this installation.
pub async fn primary(
    session: &Session,
    registration: Option<String>,
    is_primary: bool,
) -> Result<String, Box<dyn std::error::Error>> {
    let context = session.context();
    let Some(registration) = registration.or_else(|| context.registration_id()) else {
        return Ok(NOT_REGISTERED.to_string());
    };
    let outcome = context
        .set_installation_primary(&registration, is_primary)
        .await?;
    Ok(format!(
        "{registration} primary={is_primary}: {}",
        describe(&outcome)
    ))
}
