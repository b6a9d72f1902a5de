//! Response payload decoding.

use crate::error::{ProtocolError, ProtocolResult};
use crate::request::RequestKind;
use pushsync_core::{
    AttrValue, AttributeKey, AttributesSet, DeliveryMethod, EntityKind, Message, MoMessage,
    MoStatus,
};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Attribute values returned for one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeFields {
    /// Entity the fields belong to.
    pub kind: EntityKind,
    /// Known fields present in the response.
    pub fields: BTreeMap<AttributeKey, AttrValue>,
}

impl AttributeFields {
    /// Creates an empty field set.
    pub fn empty(kind: EntityKind) -> Self {
        Self {
            kind,
            fields: BTreeMap::new(),
        }
    }

    /// Parses a JSON object, dropping unknown and foreign fields.
    pub fn from_object(kind: EntityKind, object: &Map<String, Value>) -> Self {
        let fields = object
            .iter()
            .filter_map(|(name, value)| {
                AttributeKey::from_wire_name(kind, name).map(|key| (key, value.clone()))
            })
            .collect();
        Self { kind, fields }
    }

    /// Keys present in the response.
    pub fn present_fields(&self) -> AttributesSet {
        self.fields.keys().copied().collect()
    }

    /// Returns a field value.
    pub fn get(&self, key: AttributeKey) -> Option<&AttrValue> {
        self.fields.get(&key)
    }

    /// Encodes the fields as a wire JSON object.
    pub fn to_wire(&self) -> Value {
        crate::request::attributes_body(&self.fields)
    }
}

/// A decoded API response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    /// No payload of interest.
    Empty,
    /// Entity attributes.
    Attributes(AttributeFields),
    /// Messages fetched from the server.
    Messages(Vec<Message>),
    /// Per-message results of a mobile-originated send.
    MoResults(Vec<MoMessage>),
}

impl ResponsePayload {
    /// Decodes the body returned for `kind`.
    ///
    /// An empty body decodes to an empty payload of the expected shape.
    pub fn decode(kind: RequestKind, body: &[u8]) -> ProtocolResult<Self> {
        let value: Option<Value> = if body.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            Some(serde_json::from_slice(body)?)
        };
        Self::from_json(kind, value.as_ref())
    }

    /// Interprets an already parsed body.
    pub fn from_json(kind: RequestKind, value: Option<&Value>) -> ProtocolResult<Self> {
        match kind {
            RequestKind::Registration
            | RequestKind::FetchInstance
            | RequestKind::PatchInstance
            | RequestKind::PatchOtherInstance => {
                decode_attributes(kind, EntityKind::Installation, value)
            }
            RequestKind::FetchUser | RequestKind::PatchUser | RequestKind::Personalize => {
                decode_attributes(kind, EntityKind::User, value)
            }
            RequestKind::SyncMessages => decode_messages(kind, value),
            RequestKind::MoMessages => decode_mo(kind, value),
            RequestKind::Depersonalize | RequestKind::SeenMessages | RequestKind::SystemData => {
                Ok(ResponsePayload::Empty)
            }
        }
    }

    /// Returns the attribute fields, if this is an attributes payload.
    pub fn attributes(&self) -> Option<&AttributeFields> {
        match self {
            ResponsePayload::Attributes(fields) => Some(fields),
            _ => None,
        }
    }
}

fn as_object<'a>(
    kind: RequestKind,
    value: &'a Value,
) -> ProtocolResult<&'a Map<String, Value>> {
    value
        .as_object()
        .ok_or_else(|| ProtocolError::malformed(kind.name(), "expected a JSON object"))
}

fn decode_attributes(
    kind: RequestKind,
    entity: EntityKind,
    value: Option<&Value>,
) -> ProtocolResult<ResponsePayload> {
    let fields = match value {
        None => AttributeFields::empty(entity),
        Some(value) => AttributeFields::from_object(entity, as_object(kind, value)?),
    };
    Ok(ResponsePayload::Attributes(fields))
}

fn decode_messages(kind: RequestKind, value: Option<&Value>) -> ProtocolResult<ResponsePayload> {
    let Some(value) = value else {
        return Ok(ResponsePayload::Messages(Vec::new()));
    };
    let object = as_object(kind, value)?;
    let Some(payloads) = object.get("payloads") else {
        return Ok(ResponsePayload::Messages(Vec::new()));
    };
    let payloads = payloads
        .as_array()
        .ok_or_else(|| ProtocolError::malformed(kind.name(), "payloads is not an array"))?;

    let mut messages = Vec::with_capacity(payloads.len());
    for payload in payloads {
        let item = as_object(kind, payload)?;
        let message_id = item
            .get("messageId")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::malformed(kind.name(), "message without messageId"))?;
        let silent = item.get("silent").and_then(Value::as_bool).unwrap_or(false);
        messages.push(Message::new(
            message_id,
            silent,
            DeliveryMethod::Pull,
            payload.clone(),
        ));
    }
    Ok(ResponsePayload::Messages(messages))
}

fn decode_mo(kind: RequestKind, value: Option<&Value>) -> ProtocolResult<ResponsePayload> {
    let Some(value) = value else {
        return Ok(ResponsePayload::MoResults(Vec::new()));
    };
    let object = as_object(kind, value)?;
    let items = object
        .get("messages")
        .and_then(Value::as_array)
        .ok_or_else(|| ProtocolError::malformed(kind.name(), "missing messages array"))?;

    items
        .iter()
        .map(|item| {
            let item = as_object(kind, item)?;
            let message_id = item
                .get("messageId")
                .and_then(Value::as_str)
                .ok_or_else(|| ProtocolError::malformed(kind.name(), "result without messageId"))?;
            let code = item.get("statusCode").and_then(Value::as_i64).unwrap_or(-1);
            Ok(MoMessage {
                message_id: message_id.to_string(),
                destination: item
                    .get("destination")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                text: item
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                custom_payload: item.get("customPayload").cloned(),
                status: MoStatus::from_code(code),
            })
        })
        .collect::<ProtocolResult<Vec<_>>>()
        .map(ResponsePayload::MoResults)
}
