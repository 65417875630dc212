//! # Protocol Prelude
//!
//! Convenient re-exports of the most commonly used protocol types.
//!
//! ```rust
//! use gqlws_protocol::prelude::*;
//! ```

pub use crate::close_code::CloseCode;
pub use crate::codec::{decode, encode};
pub use crate::error::DecodeError;
pub use crate::message::{Message, MessageType, Payload, SubscribePayload};
pub use crate::result::{ExecutionResult, GraphQLError, SourceLocation};
pub use crate::GRAPHQL_TRANSPORT_WS_PROTOCOL;
