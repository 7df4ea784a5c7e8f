//! The executor seam: the engine dispatches nodes to registered executors
//! and alone applies the resulting status transitions. Executors are pure
//! with respect to the store; everything they may need from upstream nodes
//! is resolved and handed to them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use crate::model::{NodeId, NodeRecord};

/// A pluggable handler for one node kind.
///
/// `upstream` maps each dependency id to that dependency's recorded result
/// (`Null` when a dependency has none). Returning `Err` records the failure
/// on the node; it never aborts the scheduler loop. Any numeric `cost` field
/// in the returned value is accumulated onto the node's cost.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn execute(
        &self,
        node: &NodeRecord,
        upstream: &HashMap<NodeId, Value>,
    ) -> anyhow::Result<Value>;
}

/// Registry mapping node kinds to executors.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: DashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an executor for a kind, replacing any previous registration.
    pub fn register(&self, kind: &str, executor: Arc<dyn Executor>) {
        debug!(kind, "executor registered");
        self.executors.insert(kind.to_string(), executor);
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(kind).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.executors.contains_key(kind)
    }
}
