//! # graphql-transport-ws Protocol
//!
//! Transport-agnostic types for the `graphql-transport-ws` WebSocket sub-protocol.
//! This crate contains the wire messages, the strict codec and the close-code
//! taxonomy, without any runtime or socket code.
//!
//! ## Features
//! - All eight protocol message shapes as a single [`Message`] enum
//! - Strict decoding: unknown types, extra properties and malformed payloads are rejected
//! - Total encoding for well-formed messages
//! - Connection-level close codes with canonical reasons

pub mod close_code;
pub mod codec;
pub mod error;
pub mod message;
pub mod prelude;
pub mod result;

// Re-export main types
pub use close_code::CloseCode;
pub use codec::{decode, encode};
pub use error::DecodeError;
pub use message::{Message, MessageType, Payload, SubscribePayload};
pub use result::{ExecutionResult, GraphQLError, SourceLocation};

/// WebSocket sub-protocol identifier negotiated during the HTTP upgrade
pub const GRAPHQL_TRANSPORT_WS_PROTOCOL: &str = "graphql-transport-ws";

/// Maximum length in bytes of a WebSocket close reason (RFC 6455, section 5.5)
pub const MAX_CLOSE_REASON_BYTES: usize = 123;
