//! Per-connection context shared with hooks and the engine

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{Map, Value};

use gqlws_protocol::Payload;

use crate::transport::TransportInfo;

/// Connection context handed to every hook
///
/// Cheap to clone. The `state` map is the context value passed to the engine
/// on each operation; `onConnect` can augment it.
#[derive(Clone)]
pub struct ConnectionContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    connection_id: String,
    connected_at: DateTime<Utc>,
    transport: TransportInfo,
    connection_params: RwLock<Option<Payload>>,
    acknowledged: AtomicBool,
    state: RwLock<Map<String, Value>>,
    extra: Option<Arc<dyn Any + Send + Sync>>,
}

impl ConnectionContext {
    pub fn new(transport: TransportInfo) -> Self {
        Self::with_extra(transport, None)
    }

    /// Create a context carrying an opaque, host-supplied value
    pub fn with_extra(
        transport: TransportInfo,
        extra: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                connection_id: uuid::Uuid::now_v7().to_string(),
                connected_at: Utc::now(),
                transport,
                connection_params: RwLock::new(None),
                acknowledged: AtomicBool::new(false),
                state: RwLock::new(Map::new()),
                extra,
            }),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.inner.connection_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.inner.connected_at
    }

    pub fn transport(&self) -> &TransportInfo {
        &self.inner.transport
    }

    /// Payload of the client's `connection_init`, once received
    pub fn connection_params(&self) -> Option<Payload> {
        self.inner.connection_params.read().clone()
    }

    pub(crate) fn set_connection_params(&self, params: Option<Payload>) {
        *self.inner.connection_params.write() = params;
    }

    pub fn is_acknowledged(&self) -> bool {
        self.inner.acknowledged.load(Ordering::Acquire)
    }

    pub(crate) fn mark_acknowledged(&self) {
        self.inner.acknowledged.store(true, Ordering::Release);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.state.read().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.inner.state.write().insert(key.into(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.state.write().remove(key)
    }

    /// Merge entries into the context state, overwriting existing keys
    pub fn extend(&self, entries: Map<String, Value>) {
        self.inner.state.write().extend(entries);
    }

    /// Copy of the context state, used as the engine's context value
    pub fn snapshot(&self) -> Map<String, Value> {
        self.inner.state.read().clone()
    }

    pub fn extra<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.inner.extra.as_deref()?.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("connection_id", &self.inner.connection_id)
            .field("acknowledged", &self.is_acknowledged())
            .field("transport", &self.inner.transport)
            .finish()
    }
}
