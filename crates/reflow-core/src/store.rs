//! Context store
//!
//! Transactional persistence for execution contexts and their event lists.
//! `save` is an idempotent upsert: events are deduplicated on the
//! `(source_id, type)` pair within one execution, which is what makes replay
//! safe to re-run against the same storage.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::context::ExecutionContext;
use crate::event::ExecutionEventKind;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Execution context not found
    #[error("execution context not found: {0}")]
    ContextNotFound(String),

    /// Constraint violation that could not be resolved as a no-op
    #[error("storage conflict: {0}")]
    Conflict(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Store for execution contexts and their append-only event logs
///
/// Implementations must be thread-safe. Concurrent `save` calls for the same
/// execution id must be serialized (the Postgres implementation locks the
/// execution row; the in-memory implementation holds a write lock).
#[async_trait]
pub trait ContextStore: Send + Sync + 'static {
    /// Upsert a context.
    ///
    /// If the context does not exist, insert it and all of its events. If it
    /// exists, append exactly the events whose `(source_id, type)` pair is
    /// not already persisted. Atomic per call.
    async fn save(&self, ctx: &ExecutionContext) -> Result<(), StoreError>;

    /// Point lookup by execution id
    async fn get(&self, execution_id: &str) -> Result<ExecutionContext, StoreError>;
}

/// In-memory implementation of [`ContextStore`]
///
/// This is primarily for tests and single-process runs. It provides the same
/// dedup semantics as the PostgreSQL implementation.
#[derive(Default)]
pub struct InMemoryContextStore {
    contexts: RwLock<HashMap<String, ExecutionContext>>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored contexts
    pub fn len(&self) -> usize {
        self.contexts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.read().is_empty()
    }

    /// Drop all data (for tests)
    pub fn clear(&self) {
        self.contexts.write().clear();
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn save(&self, ctx: &ExecutionContext) -> Result<(), StoreError> {
        let mut contexts = self.contexts.write();

        match contexts.get_mut(&ctx.execution_id) {
            None => {
                let mut stored = ctx.clone();
                dedup_in_place(&mut stored);
                contexts.insert(ctx.execution_id.clone(), stored);
            }
            Some(existing) => {
                existing.input = ctx.input.clone();

                let mut seen: HashSet<(String, ExecutionEventKind)> = existing
                    .events
                    .iter()
                    .map(|e| e.dedup_key())
                    .collect();

                for event in &ctx.events {
                    if seen.insert(event.dedup_key()) {
                        existing.events.push(event.clone());
                    }
                }
            }
        }

        Ok(())
    }

    async fn get(&self, execution_id: &str) -> Result<ExecutionContext, StoreError> {
        self.contexts
            .read()
            .get(execution_id)
            .cloned()
            .ok_or_else(|| StoreError::ContextNotFound(execution_id.to_string()))
    }
}

/// Collapse duplicate `(source_id, type)` pairs, keeping first occurrences.
/// Mirrors the composite primary key of the SQL event table.
fn dedup_in_place(ctx: &mut ExecutionContext) {
    let mut seen: HashSet<(String, ExecutionEventKind)> = HashSet::new();
    ctx.events.retain(|e| seen.insert(e.dedup_key()));
}
