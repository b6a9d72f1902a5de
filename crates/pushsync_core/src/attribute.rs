//! Attribute keys and attribute sets.

use serde::{Deserialize, Serialize};
use std::collections::btree_set;
use std::collections::BTreeSet;
use std::fmt;

/// The kind of locally tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// The current application installation.
    Installation,
    /// The user profile bound to the installation.
    User,
}

impl EntityKind {
    /// Stable lowercase name, used for file names and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Installation => "installation",
            EntityKind::User => "user",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fixed identifier for one logical field of an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKey {
    /// Server-assigned push registration id.
    PushRegistrationId,
    /// Platform push service token.
    PushServiceToken,
    /// Application-level user id.
    ApplicationUserId,
    /// Whether push registration is enabled.
    RegistrationEnabled,
    /// Whether this installation is the user's primary device.
    IsPrimaryDevice,
    /// Custom installation attributes (object).
    CustomInstanceAttributes,
    /// Hash of the last system data reported to the server. Local only.
    SystemDataHash,
    /// Application badge number. Local only.
    BadgeNumber,

    /// External user id.
    ExternalUserId,
    /// First name.
    FirstName,
    /// Middle name.
    MiddleName,
    /// Last name.
    LastName,
    /// Gender.
    Gender,
    /// Birthday (`YYYY-MM-DD`).
    Birthday,
    /// Email addresses (array).
    Emails,
    /// Phone numbers (array).
    Phones,
    /// Tags (array).
    Tags,
    /// Custom user attributes (object).
    CustomUserAttributes,
    /// Installations belonging to the user (array).
    Installations,
    /// Local depersonalization status. Local only.
    DepersonalizeStatus,
    /// Failed depersonalization attempts. Local only.
    DepersonalizeFailCounter,
}

impl AttributeKey {
    /// Every attribute key, in declaration order.
    pub const ALL: [AttributeKey; 21] = [
        AttributeKey::PushRegistrationId,
        AttributeKey::PushServiceToken,
        AttributeKey::ApplicationUserId,
        AttributeKey::RegistrationEnabled,
        AttributeKey::IsPrimaryDevice,
        AttributeKey::CustomInstanceAttributes,
        AttributeKey::SystemDataHash,
        AttributeKey::BadgeNumber,
        AttributeKey::ExternalUserId,
        AttributeKey::FirstName,
        AttributeKey::MiddleName,
        AttributeKey::LastName,
        AttributeKey::Gender,
        AttributeKey::Birthday,
        AttributeKey::Emails,
        AttributeKey::Phones,
        AttributeKey::Tags,
        AttributeKey::CustomUserAttributes,
        AttributeKey::Installations,
        AttributeKey::DepersonalizeStatus,
        AttributeKey::DepersonalizeFailCounter,
    ];

    /// Returns the entity kind this key belongs to.
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            AttributeKey::PushRegistrationId
            | AttributeKey::PushServiceToken
            | AttributeKey::ApplicationUserId
            | AttributeKey::RegistrationEnabled
            | AttributeKey::IsPrimaryDevice
            | AttributeKey::CustomInstanceAttributes
            | AttributeKey::SystemDataHash
            | AttributeKey::BadgeNumber => EntityKind::Installation,
            _ => EntityKind::User,
        }
    }

    /// Returns the field name used on the wire, or `None` for local-only keys.
    pub fn wire_name(&self) -> Option<&'static str> {
        let name = match self {
            AttributeKey::PushRegistrationId => "pushRegistrationId",
            AttributeKey::PushServiceToken => "pushServiceToken",
            AttributeKey::ApplicationUserId => "applicationUserId",
            AttributeKey::RegistrationEnabled => "regEnabled",
            AttributeKey::IsPrimaryDevice => "isPrimary",
            AttributeKey::CustomInstanceAttributes => "customAttributes",
            AttributeKey::ExternalUserId => "externalUserId",
            AttributeKey::FirstName => "firstName",
            AttributeKey::MiddleName => "middleName",
            AttributeKey::LastName => "lastName",
            AttributeKey::Gender => "gender",
            AttributeKey::Birthday => "birthday",
            AttributeKey::Emails => "emails",
            AttributeKey::Phones => "phones",
            AttributeKey::Tags => "tags",
            AttributeKey::CustomUserAttributes => "customAttributes",
            AttributeKey::Installations => "instances",
            AttributeKey::SystemDataHash
            | AttributeKey::BadgeNumber
            | AttributeKey::DepersonalizeStatus
            | AttributeKey::DepersonalizeFailCounter => return None,
        };
        Some(name)
    }

    /// Resolves a wire field name for the given entity kind.
    ///
    /// Unknown names return `None`; callers drop them so that fields added
    /// by newer servers do not break older clients.
    pub fn from_wire_name(kind: EntityKind, name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|key| key.entity_kind() == kind && key.wire_name() == Some(name))
    }

    /// Returns true if the key is never sent to the server.
    pub fn is_local_only(&self) -> bool {
        self.wire_name().is_none()
    }
}

/// An ordered set of attribute keys.
///
/// Iteration order is the declaration order of `AttributeKey`, so anything
/// built by walking a set (request bodies in particular) is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributesSet(BTreeSet<AttributeKey>);

impl AttributesSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// All keys belonging to `kind`.
    pub fn of_kind(kind: EntityKind) -> Self {
        AttributeKey::ALL
            .iter()
            .copied()
            .filter(|k| k.entity_kind() == kind)
            .collect()
    }

    /// All keys of `kind` that the server knows about.
    pub fn syncable(kind: EntityKind) -> Self {
        AttributeKey::ALL
            .iter()
            .copied()
            .filter(|k| k.entity_kind() == kind && !k.is_local_only())
            .collect()
    }

    /// Inserts a key. Returns false if it was already present.
    pub fn insert(&mut self, key: AttributeKey) -> bool {
        self.0.insert(key)
    }

    /// Removes a key. Returns true if it was present.
    pub fn remove(&mut self, key: AttributeKey) -> bool {
        self.0.remove(&key)
    }

    /// Returns true if the key is in the set.
    pub fn contains(&self, key: AttributeKey) -> bool {
        self.0.contains(&key)
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of keys in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterates keys in order.
    pub fn iter(&self) -> impl Iterator<Item = AttributeKey> + '_ {
        self.0.iter().copied()
    }

    /// Keys in either set.
    pub fn union(&self, other: &AttributesSet) -> AttributesSet {
        Self(self.0.union(&other.0).copied().collect())
    }

    /// Keys in both sets.
    pub fn intersection(&self, other: &AttributesSet) -> AttributesSet {
        Self(self.0.intersection(&other.0).copied().collect())
    }

    /// Keys in `self` but not in `other`.
    pub fn difference(&self, other: &AttributesSet) -> AttributesSet {
        Self(self.0.difference(&other.0).copied().collect())
    }

    /// Returns true if every key belongs to `kind`.
    pub fn is_of_kind(&self, kind: EntityKind) -> bool {
        self.0.iter().all(|k| k.entity_kind() == kind)
    }
}

impl FromIterator<AttributeKey> for AttributesSet {
    fn from_iter<I: IntoIterator<Item = AttributeKey>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<AttributeKey> for AttributesSet {
    fn extend<I: IntoIterator<Item = AttributeKey>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl<const N: usize> From<[AttributeKey; N]> for AttributesSet {
    fn from(keys: [AttributeKey; N]) -> Self {
        keys.into_iter().collect()
    }
}

impl IntoIterator for AttributesSet {
    type Item = AttributeKey;
    type IntoIter = btree_set::IntoIter<AttributeKey>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a AttributesSet {
    type Item = &'a AttributeKey;
    type IntoIter = btree_set::Iter<'a, AttributeKey>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_key_has_one_kind() {
        let installation = AttributesSet::of_kind(EntityKind::Installation);
        let user = AttributesSet::of_kind(EntityKind::User);
        assert_eq!(installation.len() + user.len(), AttributeKey::ALL.len());
        assert!(installation.intersection(&user).is_empty());
    }

    #[test]
    fn wire_names_resolve_per_kind() {
        assert_eq!(
            AttributeKey::from_wire_name(EntityKind::Installation, "customAttributes"),
            Some(AttributeKey::CustomInstanceAttributes)
        );
        assert_eq!(
            AttributeKey::from_wire_name(EntityKind::User, "customAttributes"),
            Some(AttributeKey::CustomUserAttributes)
        );
        assert_eq!(
            AttributeKey::from_wire_name(EntityKind::User, "isPrimary"),
            None
        );
        assert_eq!(
            AttributeKey::from_wire_name(EntityKind::Installation, "someFutureField"),
            None
        );
    }

    #[test]
    fn local_only_keys_are_not_syncable() {
        let syncable = AttributesSet::syncable(EntityKind::Installation);
        assert!(syncable.contains(AttributeKey::PushRegistrationId));
        assert!(!syncable.contains(AttributeKey::SystemDataHash));
        assert!(!syncable.contains(AttributeKey::BadgeNumber));
    }

    #[test]
    fn set_algebra() {
        let a = AttributesSet::from([AttributeKey::FirstName, AttributeKey::LastName]);
        let b = AttributesSet::from([AttributeKey::LastName, AttributeKey::Tags]);

        assert_eq!(a.union(&b).len(), 3);
        assert_eq!(
            a.intersection(&b),
            AttributesSet::from([AttributeKey::LastName])
        );
        assert_eq!(a.difference(&b), AttributesSet::from([AttributeKey::FirstName]));
    }

    #[test]
    fn iteration_order_is_stable() {
        let a = AttributesSet::from([
            AttributeKey::Tags,
            AttributeKey::FirstName,
            AttributeKey::Emails,
        ]);
        let keys: Vec<_> = a.iter().collect();
        assert_eq!(
            keys,
            vec![
                AttributeKey::FirstName,
                AttributeKey::Emails,
                AttributeKey::Tags
            ]
        );
    }

    #[test]
    fn serializes_as_plain_array() {
        let a = AttributesSet::from([AttributeKey::IsPrimaryDevice]);
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, r#"["is_primary_device"]"#);
    }
}
