use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::result::{ExecutionResult, GraphQLError};

/// Free-form object payload carried by init, ack, ping and pong messages
pub type Payload = Map<String, Value>;

/// Discriminant of a protocol message (the `type` property on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    ConnectionInit,
    ConnectionAck,
    Ping,
    Pong,
    Subscribe,
    Next,
    Error,
    Complete,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::ConnectionInit => "connection_init",
            MessageType::ConnectionAck => "connection_ack",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Subscribe => "subscribe",
            MessageType::Next => "next",
            MessageType::Error => "error",
            MessageType::Complete => "complete",
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "connection_init" => Some(MessageType::ConnectionInit),
            "connection_ack" => Some(MessageType::ConnectionAck),
            "ping" => Some(MessageType::Ping),
            "pong" => Some(MessageType::Pong),
            "subscribe" => Some(MessageType::Subscribe),
            "next" => Some(MessageType::Next),
            "error" => Some(MessageType::Error),
            "complete" => Some(MessageType::Complete),
            _ => None,
        }
    }

    /// Whether messages of this type must carry an operation `id`
    pub fn requires_id(&self) -> bool {
        matches!(
            self,
            MessageType::Subscribe | MessageType::Next | MessageType::Error | MessageType::Complete
        )
    }

    pub fn is_client_message(&self) -> bool {
        matches!(
            self,
            MessageType::ConnectionInit
                | MessageType::Ping
                | MessageType::Pong
                | MessageType::Subscribe
                | MessageType::Complete
        )
    }

    pub fn is_server_message(&self) -> bool {
        matches!(
            self,
            MessageType::ConnectionAck
                | MessageType::Ping
                | MessageType::Pong
                | MessageType::Next
                | MessageType::Error
                | MessageType::Complete
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// GraphQL request carried by a `subscribe` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePayload {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl SubscribePayload {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            operation_name: None,
            variables: None,
            extensions: None,
        }
    }

    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    pub fn with_variables(mut self, variables: Map<String, Value>) -> Self {
        self.variables = Some(variables);
        self
    }

    pub fn with_extensions(mut self, extensions: Map<String, Value>) -> Self {
        self.extensions = Some(extensions);
        self
    }
}

/// A `graphql-transport-ws` protocol message
///
/// Messages are immutable values; the payload shape is fixed by the variant.
/// Use [`crate::decode`] to parse untrusted text, which enforces the full set of
/// structural rules that plain deserialization would not.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    ConnectionInit {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Payload>,
    },
    ConnectionAck {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Payload>,
    },
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Payload>,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Payload>,
    },
    Subscribe {
        id: String,
        payload: SubscribePayload,
    },
    Next {
        id: String,
        payload: ExecutionResult,
    },
    Error {
        id: String,
        payload: Vec<GraphQLError>,
    },
    Complete {
        id: String,
    },
}

impl Message {
    pub fn connection_init(payload: Option<Payload>) -> Self {
        Message::ConnectionInit { payload }
    }

    pub fn connection_ack(payload: Option<Payload>) -> Self {
        Message::ConnectionAck { payload }
    }

    pub fn ping(payload: Option<Payload>) -> Self {
        Message::Ping { payload }
    }

    pub fn pong(payload: Option<Payload>) -> Self {
        Message::Pong { payload }
    }

    pub fn subscribe(id: impl Into<String>, payload: SubscribePayload) -> Self {
        Message::Subscribe {
            id: id.into(),
            payload,
        }
    }

    pub fn next(id: impl Into<String>, payload: ExecutionResult) -> Self {
        Message::Next {
            id: id.into(),
            payload,
        }
    }

    pub fn error(id: impl Into<String>, payload: Vec<GraphQLError>) -> Self {
        Message::Error {
            id: id.into(),
            payload,
        }
    }

    pub fn complete(id: impl Into<String>) -> Self {
        Message::Complete { id: id.into() }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Message::ConnectionInit { .. } => MessageType::ConnectionInit,
            Message::ConnectionAck { .. } => MessageType::ConnectionAck,
            Message::Ping { .. } => MessageType::Ping,
            Message::Pong { .. } => MessageType::Pong,
            Message::Subscribe { .. } => MessageType::Subscribe,
            Message::Next { .. } => MessageType::Next,
            Message::Error { .. } => MessageType::Error,
            Message::Complete { .. } => MessageType::Complete,
        }
    }

    /// Operation id for id-bearing messages
    pub fn id(&self) -> Option<&str> {
        match self {
            Message::Subscribe { id, .. }
            | Message::Next { id, .. }
            | Message::Error { id, .. }
            | Message::Complete { id } => Some(id),
            _ => None,
        }
    }

    /// Serialize to wire text, see [`crate::encode`]
    pub fn encode(&self) -> String {
        crate::codec::encode(self)
    }
}

impl std::str::FromStr for Message {
    type Err = crate::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        crate::codec::decode(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_type_tags() {
        for message_type in [
            MessageType::ConnectionInit,
            MessageType::ConnectionAck,
            MessageType::Ping,
            MessageType::Pong,
            MessageType::Subscribe,
            MessageType::Next,
            MessageType::Error,
            MessageType::Complete,
        ] {
            assert_eq!(MessageType::parse(message_type.as_str()), Some(message_type));
        }
        assert_eq!(MessageType::parse("start"), None);
        assert_eq!(MessageType::parse("ConnectionInit"), None);
    }

    #[test]
    fn test_direction_classification() {
        assert!(MessageType::Ping.is_client_message() && MessageType::Ping.is_server_message());
        assert!(MessageType::Complete.is_client_message() && MessageType::Complete.is_server_message());
        assert!(!MessageType::Next.is_client_message());
        assert!(!MessageType::Subscribe.is_server_message());
        assert!(!MessageType::ConnectionAck.is_client_message());
    }

    #[test]
    fn test_id_accessor() {
        assert_eq!(Message::complete("7").id(), Some("7"));
        assert_eq!(Message::ping(None).id(), None);
        assert_eq!(
            Message::subscribe("a", SubscribePayload::new("{ a }")).message_type(),
            MessageType::Subscribe
        );
    }

    #[test]
    fn test_subscribe_serialization_uses_camel_case() {
        let message = Message::subscribe(
            "1",
            SubscribePayload::new("query Q { a }").with_operation_name("Q"),
        );
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json,
            json!({
                "type": "subscribe",
                "id": "1",
                "payload": {"query": "query Q { a }", "operationName": "Q"}
            })
        );
    }
}
