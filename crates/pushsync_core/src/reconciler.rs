//! Merging server responses into local entities.

use crate::attribute::{AttributeKey, AttributesSet, EntityKind};
use crate::entity::Entity;
use crate::AttrValue;
use std::collections::BTreeMap;

/// What to do with one attribute when a response is merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    /// Overwrite current with the server value when the response carries it.
    TakeServer,
    /// The server never returns this key; promote the local value.
    KeepLocal,
    /// The key is not supported for this entity; leave it alone.
    Ignore,
}

/// Summary of one merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Keys whose current value now holds the server value.
    pub overwritten: AttributesSet,
    /// Keys acknowledged without a server value (local value retained).
    pub retained: AttributesSet,
    /// Keys whose dirty mark was cleared.
    pub cleared: AttributesSet,
    /// In-scope keys skipped because they are unsupported for the entity.
    pub ignored: AttributesSet,
    /// In-scope keys edited again after the request was built; their newer
    /// local value stays dirty.
    pub superseded: AttributesSet,
}

impl ReconcileReport {
    /// Keys whose stored state changed in any way.
    pub fn changed(&self) -> AttributesSet {
        self.overwritten.union(&self.cleared)
    }
}

/// Applies server responses to entities field by field.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reconciler;

impl Reconciler {
    /// The attribute→action mapping for an entity kind.
    pub fn merge_action(kind: EntityKind, key: AttributeKey) -> MergeAction {
        if key.entity_kind() != kind {
            MergeAction::Ignore
        } else if key.is_local_only() {
            MergeAction::KeepLocal
        } else {
            MergeAction::TakeServer
        }
    }

    /// Merges `fields` into `entity`, restricted to `scope`.
    ///
    /// For every in-scope key the dirty mark is cleared. The current value is
    /// overwritten only when the response carries the key; otherwise the
    /// locally held value is kept as current. Response keys outside the
    /// scope are not touched.
    pub fn apply(
        fields: &BTreeMap<AttributeKey, AttrValue>,
        entity: &mut Entity,
        scope: &AttributesSet,
    ) -> ReconcileReport {
        Self::merge(fields, entity, scope, None)
    }

    /// Like [`Reconciler::apply`], but aware of the values the request sent.
    ///
    /// An in-scope key whose dirty value no longer equals the sent one was
    /// edited while the request was in flight. It keeps its dirty overlay;
    /// a server value for it only lands in current. Keys absent from `sent`
    /// count as not sent, so any dirty mark on them is newer.
    pub fn apply_sent(
        fields: &BTreeMap<AttributeKey, AttrValue>,
        entity: &mut Entity,
        scope: &AttributesSet,
        sent: &BTreeMap<AttributeKey, AttrValue>,
    ) -> ReconcileReport {
        Self::merge(fields, entity, scope, Some(sent))
    }

    fn merge(
        fields: &BTreeMap<AttributeKey, AttrValue>,
        entity: &mut Entity,
        scope: &AttributesSet,
        sent: Option<&BTreeMap<AttributeKey, AttrValue>>,
    ) -> ReconcileReport {
        let kind = entity.kind();
        let mut report = ReconcileReport::default();

        for key in scope.iter() {
            let action = Self::merge_action(kind, key);
            if action == MergeAction::Ignore {
                report.ignored.insert(key);
                continue;
            }

            let superseded = match (sent, entity.dirty_value(key)) {
                (Some(sent), Some(local)) => sent.get(&key) != Some(local),
                _ => false,
            };
            if superseded {
                if action == MergeAction::TakeServer {
                    if let Some(value) = fields.get(&key) {
                        entity.write_current(key, value.clone());
                        report.overwritten.insert(key);
                    }
                }
                report.superseded.insert(key);
                continue;
            }

            match action {
                MergeAction::TakeServer => {
                    let was_dirty = entity.is_dirty(key);
                    match fields.get(&key) {
                        Some(value) => {
                            entity.commit_server_value(key, value.clone());
                            report.overwritten.insert(key);
                        }
                        None => {
                            entity.acknowledge(key);
                            report.retained.insert(key);
                        }
                    }
                    if was_dirty {
                        report.cleared.insert(key);
                    }
                }
                MergeAction::KeepLocal => {
                    if entity.acknowledge(key) {
                        report.cleared.insert(key);
                    }
                    report.retained.insert(key);
                }
                MergeAction::Ignore => {}
            }
        }

        tracing::trace!(
            kind = %kind,
            overwritten = report.overwritten.len(),
            retained = report.retained.len(),
            ignored = report.ignored.len(),
            superseded = report.superseded.len(),
            "response reconciled"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(AttributeKey, AttrValue)]) -> BTreeMap<AttributeKey, AttrValue> {
        pairs.iter().cloned().collect()
    }

    #[test]
    fn clearing_follows_scope_overwrite_follows_presence() {
        let mut entity = Entity::empty(EntityKind::Installation);
        entity.set(AttributeKey::PushRegistrationId, json!("local-reg"));
        entity.set(AttributeKey::IsPrimaryDevice, json!(true));
        let scope = entity.dirty_keys();

        let response = fields(&[(AttributeKey::PushRegistrationId, json!("server-reg"))]);
        let report = Reconciler::apply(&response, &mut entity, &scope);

        assert!(entity.dirty_keys().is_empty());
        assert_eq!(
            entity.current(AttributeKey::PushRegistrationId),
            Some(&json!("server-reg"))
        );
        assert_eq!(
            entity.current(AttributeKey::IsPrimaryDevice),
            Some(&json!(true))
        );
        assert_eq!(
            report.overwritten,
            AttributesSet::from([AttributeKey::PushRegistrationId])
        );
        assert_eq!(
            report.retained,
            AttributesSet::from([AttributeKey::IsPrimaryDevice])
        );
    }

    #[test]
    fn out_of_scope_keys_untouched() {
        let mut entity = Entity::empty(EntityKind::User);
        entity.set(AttributeKey::FirstName, json!("A"));
        entity.set(AttributeKey::LastName, json!("B"));

        let response = fields(&[
            (AttributeKey::FirstName, json!("A")),
            (AttributeKey::LastName, json!("server")),
        ]);
        Reconciler::apply(
            &response,
            &mut entity,
            &AttributesSet::from([AttributeKey::FirstName]),
        );

        assert!(entity.is_dirty(AttributeKey::LastName));
        assert_eq!(entity.get(AttributeKey::LastName), Some(&json!("B")));
        assert!(entity.current(AttributeKey::LastName).is_none());
    }

    #[test]
    fn server_may_coerce_values() {
        let mut entity = Entity::empty(EntityKind::User);
        entity.set(AttributeKey::Gender, json!("f"));
        let scope = entity.dirty_keys();

        Reconciler::apply(
            &fields(&[(AttributeKey::Gender, json!("Female"))]),
            &mut entity,
            &scope,
        );
        assert_eq!(entity.get(AttributeKey::Gender), Some(&json!("Female")));
    }

    #[test]
    fn foreign_keys_are_ignored() {
        let mut entity = Entity::empty(EntityKind::Installation);
        let scope = AttributesSet::from([AttributeKey::FirstName]);
        let report = Reconciler::apply(
            &fields(&[(AttributeKey::FirstName, json!("x"))]),
            &mut entity,
            &scope,
        );
        assert!(entity.is_empty());
        assert_eq!(report.ignored, scope);
    }

    #[test]
    fn local_only_keys_keep_local_value() {
        let mut entity = Entity::empty(EntityKind::Installation);
        entity.set(AttributeKey::SystemDataHash, json!("abc"));
        let scope = entity.dirty_keys();

        Reconciler::apply(
            &fields(&[(AttributeKey::SystemDataHash, json!("server"))]),
            &mut entity,
            &scope,
        );
        assert_eq!(
            entity.current(AttributeKey::SystemDataHash),
            Some(&json!("abc"))
        );
        assert!(!entity.is_dirty(AttributeKey::SystemDataHash));
    }

    #[test]
    fn edit_after_send_stays_dirty() {
        let mut entity = Entity::empty(EntityKind::User);
        entity.set(AttributeKey::FirstName, json!("Ana"));
        entity.set(AttributeKey::LastName, json!("Ruiz"));
        let scope = entity.dirty_keys();
        let sent = entity.values_for(&scope);

        entity.set(AttributeKey::FirstName, json!("Anna"));
        let response = fields(&[
            (AttributeKey::FirstName, json!("Ana")),
            (AttributeKey::LastName, json!("Ruiz")),
        ]);
        let report = Reconciler::apply_sent(&response, &mut entity, &scope, &sent);

        assert_eq!(entity.get(AttributeKey::FirstName), Some(&json!("Anna")));
        assert_eq!(entity.current(AttributeKey::FirstName), Some(&json!("Ana")));
        assert!(entity.is_dirty(AttributeKey::FirstName));
        assert!(!entity.is_dirty(AttributeKey::LastName));
        assert_eq!(
            report.superseded,
            AttributesSet::from([AttributeKey::FirstName])
        );
        assert_eq!(report.cleared, AttributesSet::from([AttributeKey::LastName]));
    }

    #[test]
    fn edit_after_send_survives_a_response_without_the_key() {
        let mut entity = Entity::empty(EntityKind::User);
        entity.set(AttributeKey::Emails, json!("a@x.io"));
        let scope = entity.dirty_keys();
        let sent = entity.values_for(&scope);
        entity.set(AttributeKey::Emails, json!("b@x.io"));

        Reconciler::apply_sent(&BTreeMap::new(), &mut entity, &scope, &sent);

        assert_eq!(entity.dirty_value(AttributeKey::Emails), Some(&json!("b@x.io")));
        assert!(entity.current(AttributeKey::Emails).is_none());
    }

    #[test]
    fn edit_during_fetch_is_not_overwritten() {
        let mut entity = Entity::empty(EntityKind::User);
        let scope = AttributesSet::from([AttributeKey::Phones]);
        entity.set(AttributeKey::Phones, json!("385"));

        Reconciler::apply_sent(
            &fields(&[(AttributeKey::Phones, json!("100"))]),
            &mut entity,
            &scope,
            &BTreeMap::new(),
        );
        assert_eq!(entity.get(AttributeKey::Phones), Some(&json!("385")));
        assert_eq!(entity.current(AttributeKey::Phones), Some(&json!("100")));
    }

    #[test]
    fn merge_action_table() {
        assert_eq!(
            Reconciler::merge_action(EntityKind::User, AttributeKey::Tags),
            MergeAction::TakeServer
        );
        assert_eq!(
            Reconciler::merge_action(EntityKind::User, AttributeKey::DepersonalizeStatus),
            MergeAction::KeepLocal
        );
        assert_eq!(
            Reconciler::merge_action(EntityKind::User, AttributeKey::IsPrimaryDevice),
            MergeAction::Ignore
        );
    }
}
