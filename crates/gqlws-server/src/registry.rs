//! Subscription registry
//!
//! Tracks the active operations of one connection by client-chosen id. Every
//! registration gets a fresh generation number so that a finishing operation
//! can never remove a newer registration that reused its id.

use std::collections::HashMap;

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::cancellation::{CancelHandle, CancelReason};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Subscriber for {0} already exists")]
    AlreadyExists(String),

    #[error("No active operation with id {0}")]
    NotFound(String),
}

struct OperationEntry {
    generation: u64,
    cancel: CancelHandle,
    task: Option<JoinHandle<()>>,
}

/// Active operations of a single connection
#[derive(Default)]
pub struct SubscriptionRegistry {
    operations: HashMap<String, OperationEntry>,
    next_generation: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation id, returning its generation
    pub fn register(&mut self, id: &str, cancel: CancelHandle) -> Result<u64, RegistryError> {
        if self.operations.contains_key(id) {
            return Err(RegistryError::AlreadyExists(id.to_string()));
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        self.operations.insert(
            id.to_string(),
            OperationEntry {
                generation,
                cancel,
                task: None,
            },
        );
        Ok(generation)
    }

    /// Attach the task driving an operation so it can be awaited on close
    pub fn attach_task(&mut self, id: &str, generation: u64, task: JoinHandle<()>) {
        match self.operations.get_mut(id) {
            Some(entry) if entry.generation == generation => entry.task = Some(task),
            // Already finished or replaced; the task winds down on its own
            _ => drop(task),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.operations.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.operations.keys().cloned().collect()
    }

    /// Signal cancellation for one operation and remove it
    pub fn cancel(&mut self, id: &str, reason: CancelReason) -> Result<(), RegistryError> {
        let entry = self
            .operations
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        entry.cancel.cancel(reason);
        Ok(())
    }

    /// Remove an operation that ended on its own
    ///
    /// Returns `false` when the id was already cancelled or now belongs to a
    /// newer registration.
    pub fn finish(&mut self, id: &str, generation: u64) -> bool {
        match self.operations.get(id) {
            Some(entry) if entry.generation == generation => {
                self.operations.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Cancel every operation and hand back their tasks to await
    pub fn drain(&mut self, reason: CancelReason) -> Vec<JoinHandle<()>> {
        self.operations
            .drain()
            .filter_map(|(_, entry)| {
                entry.cancel.cancel(reason);
                entry.task
            })
            .collect()
    }

    /// Cancel every operation without waiting for them
    pub fn cancel_all(&mut self, reason: CancelReason) {
        drop(self.drain(reason));
    }
}
