//! # Server Prelude
//!
//! Convenient re-exports for hosts implementing an engine or hooks.
//!
//! ```rust
//! use gqlws_server::prelude::*;
//! ```

pub use crate::config::ServerConfig;
pub use crate::context::ConnectionContext;
pub use crate::execution::{
    BoxedResultSequence, ChannelSequence, ExecutionArgs, ExecutionOutcome, GraphQLEngine,
    OperationKind, ParsedDocument, ResultSequence, SequenceItem, SequenceSender, SingleResult,
    StreamSequence,
};
pub use crate::hooks::{ConnectDecision, HookError, NoopHooks, PingReply, ServerHooks, SubscribeDecision};
pub use crate::server::{GraphQLWsServer, GraphQLWsServerBuilder, ServerHandle};
pub use crate::transport::{Acceptor, TcpAcceptor, Transport, TransportInfo};
pub use crate::{Result, ServerError};

pub use gqlws_protocol::prelude::*;
