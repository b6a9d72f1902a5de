//! Property-based test generators using proptest.

use proptest::prelude::*;
use pushsync_core::{AttrValue, AttributeKey, AttributesSet, DeliveryMethod, EntityKind, Message};
use serde_json::json;

/// Strategy for any key of `kind`.
pub fn attribute_key_strategy(kind: EntityKind) -> impl Strategy<Value = AttributeKey> {
    let keys: Vec<AttributeKey> = AttributesSet::of_kind(kind).into_iter().collect();
    prop::sample::select(keys)
}

/// Strategy for keys of `kind` the server knows about.
pub fn syncable_key_strategy(kind: EntityKind) -> impl Strategy<Value = AttributeKey> {
    let keys: Vec<AttributeKey> = AttributesSet::syncable(kind).into_iter().collect();
    prop::sample::select(keys)
}

/// Strategy for scalar attribute values.
pub fn attribute_value_strategy() -> impl Strategy<Value = AttrValue> {
    prop_oneof![
        any::<bool>().prop_map(AttrValue::from),
        any::<i32>().prop_map(AttrValue::from),
        "[a-zA-Z0-9 ]{0,16}".prop_map(AttrValue::from),
        Just(AttrValue::Null),
    ]
}

/// Strategy for a batch of edits to one entity.
pub fn edits_strategy(
    kind: EntityKind,
    max: usize,
) -> impl Strategy<Value = Vec<(AttributeKey, AttrValue)>> {
    prop::collection::vec(
        (syncable_key_strategy(kind), attribute_value_strategy()),
        0..=max,
    )
}

/// Strategy for an attribute set of `kind`.
pub fn attributes_set_strategy(kind: EntityKind) -> impl Strategy<Value = AttributesSet> {
    prop::collection::vec(attribute_key_strategy(kind), 0..8)
        .prop_map(|keys| keys.into_iter().collect())
}

/// Strategy for server messages with ids drawn from a small pool, so that
/// duplicates are common.
pub fn message_strategy() -> impl Strategy<Value = Message> {
    (0..16u8, any::<bool>(), any::<bool>()).prop_map(|(id, silent, push)| {
        let method = if push {
            DeliveryMethod::Push
        } else {
            DeliveryMethod::Pull
        };
        Message::new(format!("m{id}"), silent, method, json!({ "messageId": format!("m{id}") }))
    })
}

/// Strategy for a batch of messages.
pub fn message_batch_strategy(max: usize) -> impl Strategy<Value = Vec<Message>> {
    prop::collection::vec(message_strategy(), 0..=max)
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn keys_belong_to_their_kind(key in attribute_key_strategy(EntityKind::User)) {
            prop_assert_eq!(key.entity_kind(), EntityKind::User);
        }

        #[test]
        fn syncable_keys_have_wire_names(key in syncable_key_strategy(EntityKind::Installation)) {
            prop_assert!(key.wire_name().is_some());
        }
    }
}
