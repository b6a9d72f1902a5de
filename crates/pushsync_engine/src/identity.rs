//! Identity precondition collaborator.

use pushsync_core::{AttributeKey, AttributeTracker, ResourceId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Decides whether a resource has an established identity.
pub trait IdentityCheck: Send + Sync {
    /// Returns true if operations against `resource` may hit the network.
    fn is_resource_healthy(&self, resource: &ResourceId) -> bool;
}

/// Healthy when the installation holds a push registration id equal to the
/// resource's root id.
#[derive(Debug, Clone)]
pub struct RegistrationHealth {
    installation: Arc<AttributeTracker>,
}

impl RegistrationHealth {
    /// Creates a check over the installation tracker.
    pub fn new(installation: Arc<AttributeTracker>) -> Self {
        Self { installation }
    }
}

impl IdentityCheck for RegistrationHealth {
    fn is_resource_healthy(&self, resource: &ResourceId) -> bool {
        self.installation
            .get_string(AttributeKey::PushRegistrationId)
            .is_some_and(|reg| !reg.is_empty() && reg == resource.root())
    }
}

/// A switchable answer, for tests.
#[derive(Debug)]
pub struct StaticIdentity(AtomicBool);

impl StaticIdentity {
    /// Creates a check answering `healthy`.
    pub fn new(healthy: bool) -> Self {
        Self(AtomicBool::new(healthy))
    }

    /// Changes the answer.
    pub fn set(&self, healthy: bool) {
        self.0.store(healthy, Ordering::SeqCst);
    }
}

impl IdentityCheck for StaticIdentity {
    fn is_resource_healthy(&self, _resource: &ResourceId) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pushsync_core::{EntityKind, MemoryEntityStore};
    use serde_json::json;

    #[test]
    fn registration_health_follows_installation() {
        let store = Arc::new(MemoryEntityStore::new());
        let installation =
            Arc::new(AttributeTracker::open(EntityKind::Installation, store).unwrap());
        let check = RegistrationHealth::new(installation.clone());
        let reg = ResourceId::new("reg-1");

        assert!(!check.is_resource_healthy(&reg));

        installation
            .set_current(AttributeKey::PushRegistrationId, json!("reg-1"))
            .unwrap();
        assert!(check.is_resource_healthy(&reg));
        assert!(check.is_resource_healthy(&reg.child("messages")));
        assert!(!check.is_resource_healthy(&ResourceId::new("reg-2")));
    }

    #[test]
    fn static_identity_switches() {
        let check = StaticIdentity::new(false);
        assert!(!check.is_resource_healthy(&ResourceId::new("x")));
        check.set(true);
        assert!(check.is_resource_healthy(&ResourceId::new("x")));
    }
}
