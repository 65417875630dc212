//! Strict text codec for protocol messages
//!
//! Decoding works on the raw JSON object rather than through a derived
//! `Deserialize`, so that every structural rule of the protocol is checked and
//! reported with a precise reason: exact key set, id presence and type, and the
//! payload shape required by each message type.

use serde_json::{Map, Value};

use crate::error::DecodeError;
use crate::message::{Message, MessageType, Payload, SubscribePayload};
use crate::result::{ExecutionResult, GraphQLError};

/// Decode one text frame into a [`Message`]
pub fn decode(raw: &str) -> Result<Message, DecodeError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
    let Value::Object(mut object) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let message_type = match object.remove("type") {
        Some(Value::String(tag)) => {
            MessageType::parse(&tag).ok_or(DecodeError::UnknownType(tag))?
        }
        Some(_) => return Err(DecodeError::UnknownType("<non-string>".to_string())),
        None => return Err(DecodeError::MissingField("type")),
    };

    if let Some(field) = object.keys().find(|k| *k != "id" && *k != "payload") {
        return Err(DecodeError::UnexpectedField {
            message_type,
            field: field.clone(),
        });
    }

    let id = take_id(&mut object, message_type)?;
    let payload = object.remove("payload");

    let message = match message_type {
        MessageType::ConnectionInit => Message::ConnectionInit {
            payload: optional_object(message_type, payload)?,
        },
        MessageType::ConnectionAck => Message::ConnectionAck {
            payload: optional_object(message_type, payload)?,
        },
        MessageType::Ping => Message::Ping {
            payload: optional_object(message_type, payload)?,
        },
        MessageType::Pong => Message::Pong {
            payload: optional_object(message_type, payload)?,
        },
        MessageType::Subscribe => Message::Subscribe {
            id: required(id),
            payload: subscribe_payload(payload)?,
        },
        MessageType::Next => Message::Next {
            id: required(id),
            payload: next_payload(payload)?,
        },
        MessageType::Error => Message::Error {
            id: required(id),
            payload: error_payload(payload)?,
        },
        MessageType::Complete => {
            if payload.is_some() {
                return Err(DecodeError::UnexpectedField {
                    message_type,
                    field: "payload".to_string(),
                });
            }
            Message::Complete { id: required(id) }
        }
    };

    Ok(message)
}

/// Encode a [`Message`] as wire text
///
/// Encoding is total: every payload is built from strings and JSON values.
pub fn encode(message: &Message) -> String {
    serde_json::to_string(message).unwrap_or_default()
}

fn take_id(
    object: &mut Map<String, Value>,
    message_type: MessageType,
) -> Result<Option<String>, DecodeError> {
    let id = object.remove("id");
    if !message_type.requires_id() {
        return match id {
            Some(_) => Err(DecodeError::UnexpectedField {
                message_type,
                field: "id".to_string(),
            }),
            None => Ok(None),
        };
    }

    match id {
        Some(Value::String(id)) if !id.is_empty() => Ok(Some(id)),
        Some(Value::String(_)) => Err(DecodeError::invalid(
            message_type,
            "id",
            "must not be empty",
        )),
        Some(_) => Err(DecodeError::invalid(message_type, "id", "must be a string")),
        None => Err(DecodeError::MissingField("id")),
    }
}

// Only called after take_id has enforced presence for id-bearing types.
fn required(id: Option<String>) -> String {
    id.unwrap_or_default()
}

fn optional_object(
    message_type: MessageType,
    payload: Option<Value>,
) -> Result<Option<Payload>, DecodeError> {
    match payload {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(DecodeError::invalid(
            message_type,
            "payload",
            "must be an object",
        )),
    }
}

fn subscribe_payload(payload: Option<Value>) -> Result<SubscribePayload, DecodeError> {
    const TYPE: MessageType = MessageType::Subscribe;

    let mut object = match payload {
        Some(Value::Object(map)) => map,
        Some(_) => return Err(DecodeError::invalid(TYPE, "payload", "must be an object")),
        None => return Err(DecodeError::MissingField("payload")),
    };

    let query = match object.remove("query") {
        Some(Value::String(query)) => query,
        Some(_) => return Err(DecodeError::invalid(TYPE, "query", "must be a string")),
        None => return Err(DecodeError::MissingField("query")),
    };

    let operation_name = match object.remove("operationName") {
        None | Some(Value::Null) => None,
        Some(Value::String(name)) => Some(name),
        Some(_) => {
            return Err(DecodeError::invalid(
                TYPE,
                "operationName",
                "must be a string or null",
            ));
        }
    };

    let variables = match object.remove("variables") {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => Some(map),
        Some(_) => {
            return Err(DecodeError::invalid(
                TYPE,
                "variables",
                "must be an object or null",
            ));
        }
    };

    let extensions = match object.remove("extensions") {
        None | Some(Value::Null) => None,
        Some(Value::Object(map)) => Some(map),
        Some(_) => {
            return Err(DecodeError::invalid(
                TYPE,
                "extensions",
                "must be an object or null",
            ));
        }
    };

    if let Some(field) = object.keys().next() {
        return Err(DecodeError::invalid(
            TYPE,
            "payload",
            format!("unexpected property '{}'", field),
        ));
    }

    Ok(SubscribePayload {
        query,
        operation_name,
        variables,
        extensions,
    })
}

fn next_payload(payload: Option<Value>) -> Result<ExecutionResult, DecodeError> {
    const TYPE: MessageType = MessageType::Next;

    match payload {
        Some(value @ Value::Object(_)) => serde_json::from_value(value)
            .map_err(|e| DecodeError::invalid(TYPE, "payload", e.to_string())),
        Some(_) => Err(DecodeError::invalid(TYPE, "payload", "must be an object")),
        None => Err(DecodeError::MissingField("payload")),
    }
}

fn error_payload(payload: Option<Value>) -> Result<Vec<GraphQLError>, DecodeError> {
    const TYPE: MessageType = MessageType::Error;

    let items = match payload {
        Some(Value::Array(items)) if !items.is_empty() => items,
        Some(Value::Array(_)) => {
            return Err(DecodeError::invalid(TYPE, "payload", "must not be empty"));
        }
        Some(_) => return Err(DecodeError::invalid(TYPE, "payload", "must be an array")),
        None => return Err(DecodeError::MissingField("payload")),
    };

    items
        .into_iter()
        .map(|item| {
            if !item.get("message").is_some_and(Value::is_string) {
                return Err(DecodeError::invalid(
                    TYPE,
                    "payload",
                    "every error must be an object with a string 'message'",
                ));
            }
            serde_json::from_value(item)
                .map_err(|e| DecodeError::invalid(TYPE, "payload", e.to_string()))
        })
        .collect()
}
