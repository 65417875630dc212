use thiserror::Error;

use crate::message::MessageType;

/// Structural violation found while decoding an inbound frame
///
/// Decode errors are protocol violations, not transport failures: the server
/// closes the connection with `4400` and the error text as the close reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Message is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Message must be a JSON object")]
    NotAnObject,

    #[error("Message is missing the '{0}' property")]
    MissingField(&'static str),

    #[error("Unknown message type '{0}'")]
    UnknownType(String),

    #[error("'{message_type}' message has unexpected property '{field}'")]
    UnexpectedField {
        message_type: MessageType,
        field: String,
    },

    #[error("Invalid '{field}' property in '{message_type}' message: {reason}")]
    InvalidField {
        message_type: MessageType,
        field: &'static str,
        reason: String,
    },
}

impl DecodeError {
    pub(crate) fn invalid(
        message_type: MessageType,
        field: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        DecodeError::InvalidField {
            message_type,
            field,
            reason: reason.into(),
        }
    }
}
