//! Control-plane facade: submit workflows, query them, unblock human gates,
//! apply manual corrections, extend live graphs, and run ad-hoc nodes.

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::core::config::EngineConfig;
use crate::core::errors::{EngineError, Result};
use crate::executor::ExecutorRegistry;
use crate::model::{
    GraphDefinition, NodeDef, NodeId, NodeRecord, NodeStatus, TaskId, TaskStatus, TaskView,
};
use crate::recovery::{Recovery, RecoveryStats};
use crate::scheduler::Scheduler;
use crate::store::GraphStore;

pub struct Engine {
    store: Arc<GraphStore>,
    registry: Arc<ExecutorRegistry>,
    scheduler: Arc<Scheduler>,
    config: Arc<EngineConfig>,
}

impl Engine {
    /// Engine over an in-memory store. State does not survive a restart.
    pub fn new(config: EngineConfig, registry: Arc<ExecutorRegistry>) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(GraphStore::new(config.clone()));
        Ok(Self::assemble(store, registry, config))
    }

    /// Engine over a durable store at `path`; previously persisted state is
    /// loaded before the engine is handed out. Call [`Engine::recover`]
    /// afterwards to resume interrupted tasks.
    pub fn open(config: EngineConfig, path: &Path, registry: Arc<ExecutorRegistry>) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(GraphStore::open(config.clone(), path)?);
        Ok(Self::assemble(store, registry, config))
    }

    fn assemble(
        store: Arc<GraphStore>,
        registry: Arc<ExecutorRegistry>,
        config: EngineConfig,
    ) -> Self {
        let config = Arc::new(config);
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            registry.clone(),
            config.clone(),
        ));
        Self {
            store,
            registry,
            scheduler,
            config,
        }
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry> {
        &self.registry
    }

    /// Reconciles persisted state and restarts scheduler loops for every
    /// task with outstanding work.
    pub fn recover(&self) -> Result<RecoveryStats> {
        Recovery::new(self.store.clone(), self.scheduler.clone()).recover()
    }

    // ---- control plane ------------------------------------------------------

    /// Materializes a task from a declarative plan. The caller drives it
    /// with [`Engine::run`] or [`Engine::spawn`].
    pub fn submit(&self, definition: GraphDefinition) -> Result<TaskId> {
        let name = definition
            .task_name
            .clone()
            .unwrap_or_else(|| "workflow".to_string());
        self.store.create_task(&name, definition)
    }

    /// Parses and submits a JSON plan document.
    pub fn submit_json(&self, raw: &Value) -> Result<TaskId> {
        let definition: GraphDefinition = serde_json::from_value(raw.clone())
            .map_err(|err| EngineError::InvalidDefinition(err.to_string()))?;
        self.submit(definition)
    }

    /// Drives the task to COMPLETED, FAILED, or PAUSED and returns that
    /// status.
    pub async fn run(&self, task_id: &str) -> Result<TaskStatus> {
        self.scheduler.run_task(task_id).await
    }

    /// Detached scheduler loop for the task.
    pub fn spawn(&self, task_id: &str) -> JoinHandle<()> {
        let scheduler = self.scheduler.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = scheduler.run_task(&task_id).await {
                warn!(task = %task_id, error = %err, "scheduler loop failed");
            }
        })
    }

    pub fn task_view(&self, task_id: &str) -> Result<TaskView> {
        self.store.task_view(task_id)
    }

    pub fn list_tasks(&self) -> Vec<crate::model::TaskRecord> {
        self.store.list_tasks()
    }

    /// Manual correction: given a FAILED node, splices a corrective
    /// replacement of its first dependency carrying the caller-supplied
    /// input, marks the failed node MANUALLY_OVERRIDDEN, and restarts the
    /// task's scheduler loop. Returns the replacement's id.
    pub fn override_node(&self, node_id: &str, corrected_input: Value) -> Result<NodeId> {
        let node = self.store.get_node(node_id)?;
        if node.status != NodeStatus::Failed {
            return Err(EngineError::InvalidState(format!(
                "node {} is {:?}, only FAILED nodes can be overridden",
                node_id, node.status
            )));
        }
        let upstream_id = node.depends_on.first().cloned().ok_or_else(|| {
            EngineError::InvalidState(format!("node {} has no dependency to correct", node_id))
        })?;

        // The splice marks the failed node SKIPPED_RETRY with a pointer to
        // its corrected copy; relabel it MANUALLY_OVERRIDDEN afterwards so
        // the pointer survives.
        let replacement = self
            .store
            .create_corrective_node(&upstream_id, corrected_input)?;
        self.store.mark_lineage_skipped(node_id, &replacement.id)?;
        self.store
            .update_node_status(node_id, NodeStatus::ManuallyOverridden, None, 0.0)?;
        self.store
            .set_task_status(&node.task_id, TaskStatus::Running)?;

        info!(node = %node_id, replacement = %replacement.id, "manual override applied");
        self.spawn(&node.task_id);
        Ok(replacement.id)
    }

    /// Flips a PAUSED human-gate node to SUCCESS and restarts the task's
    /// scheduler loop.
    pub fn unblock(&self, node_id: &str, approval: Option<Value>) -> Result<()> {
        let node = self.store.get_node(node_id)?;
        if node.status != NodeStatus::Paused {
            return Err(EngineError::InvalidState(format!(
                "node {} is {:?}, only PAUSED nodes can be unblocked",
                node_id, node.status
            )));
        }
        let result = approval.unwrap_or_else(|| json!({ "status": "APPROVED" }));
        self.store
            .update_node_status(node_id, NodeStatus::Success, Some(result), 0.0)?;
        self.store
            .set_task_status(&node.task_id, TaskStatus::Running)?;

        info!(node = %node_id, task = %node.task_id, "human gate unblocked");
        self.spawn(&node.task_id);
        Ok(())
    }

    pub fn delete_task(&self, task_id: &str) -> Result<()> {
        self.store.delete_task(task_id)
    }

    /// Appends caller-declared nodes to a live task.
    pub fn extend_graph(&self, task_id: &str, defs: Vec<NodeDef>) -> Result<Vec<NodeId>> {
        self.store.extend_graph(task_id, defs)
    }

    /// Persists opaque side-channel data on a task.
    pub fn set_extension_state(&self, task_id: &str, value: Value) -> Result<()> {
        self.store.set_extension_state(task_id, value)
    }

    /// Executes a one-shot temporary node inline and returns its final
    /// record. The node never counts toward task completion; callers remove
    /// it with [`Engine::remove_node`] once the result is consumed.
    pub async fn run_adhoc(
        &self,
        task_id: &str,
        kind: &str,
        input: Value,
        depends_on: Vec<NodeId>,
    ) -> Result<NodeRecord> {
        let node = self
            .store
            .create_temporary_node(task_id, kind, input, depends_on)?;
        self.scheduler.run_node(&node).await
    }

    pub fn remove_node(&self, node_id: &str) -> Result<()> {
        self.store.remove_node(node_id)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::executor::Executor;

    struct Echo;

    #[async_trait]
    impl Executor for Echo {
        async fn execute(
            &self,
            node: &NodeRecord,
            upstream: &HashMap<NodeId, Value>,
        ) -> anyhow::Result<Value> {
            Ok(json!({ "node": node.id, "upstream_count": upstream.len() }))
        }
    }

    fn registry() -> Arc<ExecutorRegistry> {
        let registry = Arc::new(ExecutorRegistry::new());
        registry.register("writer", Arc::new(Echo));
        registry.register("publisher", Arc::new(Echo));
        registry
    }

    fn gated_plan() -> GraphDefinition {
        GraphDefinition {
            task_name: Some("gated".to_string()),
            nodes: vec![
                NodeDef {
                    id: "draft".to_string(),
                    kind: "writer".to_string(),
                    input: json!({}),
                    depends_on: vec![],
                },
                NodeDef {
                    id: "approve".to_string(),
                    kind: "human_gate".to_string(),
                    input: json!({"reason": "editorial sign-off"}),
                    depends_on: vec!["draft".to_string()],
                },
                NodeDef {
                    id: "publish".to_string(),
                    kind: "publisher".to_string(),
                    input: json!({}),
                    depends_on: vec!["approve".to_string()],
                },
            ],
        }
    }

    async fn wait_for_status(engine: &Engine, task_id: &str, want: TaskStatus) {
        for _ in 0..200 {
            if engine.task_view(task_id).unwrap().status == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "task {} never reached {:?} (currently {:?})",
            task_id,
            want,
            engine.task_view(task_id).unwrap().status
        );
    }

    #[tokio::test]
    async fn human_gate_pauses_then_unblock_completes() {
        let engine = Engine::new(EngineConfig::default(), registry()).unwrap();
        let task_id = engine.submit(gated_plan()).unwrap();

        let status = engine.run(&task_id).await.unwrap();
        assert_eq!(status, TaskStatus::Paused);

        let view = engine.task_view(&task_id).unwrap();
        let gate = view.nodes.iter().find(|n| n.kind == "human_gate").unwrap();
        assert_eq!(gate.status, NodeStatus::Paused);
        let publish = view.nodes.iter().find(|n| n.kind == "publisher").unwrap();
        assert_eq!(publish.status, NodeStatus::Planned);

        engine
            .unblock(&gate.id.clone(), Some(json!({"reviewed_by": "editor"})))
            .unwrap();
        wait_for_status(&engine, &task_id, TaskStatus::Completed).await;

        let view = engine.task_view(&task_id).unwrap();
        let gate = view.nodes.iter().find(|n| n.kind == "human_gate").unwrap();
        assert_eq!(gate.status, NodeStatus::Success);
        assert_eq!(gate.result.as_ref().unwrap()["reviewed_by"], json!("editor"));
    }

    #[tokio::test]
    async fn unblock_rejects_nodes_that_are_not_paused() {
        let engine = Engine::new(EngineConfig::default(), registry()).unwrap();
        let task_id = engine.submit(gated_plan()).unwrap();
        let draft = format!("{}:draft", task_id);
        assert!(matches!(
            engine.unblock(&draft, None).unwrap_err(),
            EngineError::InvalidState(_)
        ));
    }

    #[tokio::test]
    async fn manual_override_replays_lineage() {
        let registry = registry();
        struct ApproveAll;
        #[async_trait]
        impl Executor for ApproveAll {
            async fn execute(
                &self,
                _node: &NodeRecord,
                _upstream: &HashMap<NodeId, Value>,
            ) -> anyhow::Result<Value> {
                Ok(json!({ "approved": true }))
            }
        }
        registry.register("guard", Arc::new(ApproveAll));

        let engine = Engine::new(EngineConfig::default(), registry).unwrap();
        let task_id = engine
            .submit(GraphDefinition {
                task_name: None,
                nodes: vec![
                    NodeDef {
                        id: "writer".to_string(),
                        kind: "writer".to_string(),
                        input: json!({"topic": "a"}),
                        depends_on: vec![],
                    },
                    NodeDef {
                        id: "guard".to_string(),
                        kind: "guard".to_string(),
                        input: json!({}),
                        depends_on: vec!["writer".to_string()],
                    },
                ],
            })
            .unwrap();
        let writer = format!("{}:writer", task_id);
        let guard = format!("{}:guard", task_id);

        // Arrange a failed validator directly.
        engine
            .store()
            .update_node_status(&writer, NodeStatus::Success, None, 0.0)
            .unwrap();
        engine
            .store()
            .update_node_status(
                &guard,
                NodeStatus::Failed,
                Some(json!({"reason": "rejected"})),
                0.0,
            )
            .unwrap();

        let replacement = engine
            .override_node(&guard, json!({"topic": "a", "prompt_override": "redo"}))
            .unwrap();
        wait_for_status(&engine, &task_id, TaskStatus::Completed).await;

        let view = engine.task_view(&task_id).unwrap();
        let old_guard = view.nodes.iter().find(|n| n.id == guard).unwrap();
        assert_eq!(old_guard.status, NodeStatus::ManuallyOverridden);
        let old_writer = view.nodes.iter().find(|n| n.id == writer).unwrap();
        assert_eq!(old_writer.status, NodeStatus::SkippedRetry);
        let new_writer = view.nodes.iter().find(|n| n.id == replacement).unwrap();
        assert_eq!(new_writer.status, NodeStatus::Success);
        assert_eq!(new_writer.input["prompt_override"], json!("redo"));
    }

    #[tokio::test]
    async fn adhoc_nodes_run_inline_and_are_removable() {
        let engine = Engine::new(EngineConfig::default(), registry()).unwrap();
        let task_id = engine.submit(gated_plan()).unwrap();

        let node = engine
            .run_adhoc(&task_id, "writer", json!({"prompt": "cover image"}), vec![])
            .await
            .unwrap();
        assert!(node.temporary);
        assert_eq!(node.status, NodeStatus::Success);

        engine.remove_node(&node.id).unwrap();
        assert!(engine.store().get_node(&node.id).is_err());
    }

    #[tokio::test]
    async fn adhoc_nodes_share_the_scheduled_cost_and_failure_conventions() {
        struct Priced;

        #[async_trait]
        impl Executor for Priced {
            async fn execute(
                &self,
                _node: &NodeRecord,
                _upstream: &HashMap<NodeId, Value>,
            ) -> anyhow::Result<Value> {
                Ok(json!({ "image": "cover.png", "cost": 1.5 }))
            }
        }

        let registry = registry();
        registry.register("painter", Arc::new(Priced));
        let engine = Engine::new(EngineConfig::default(), registry).unwrap();
        let task_id = engine.submit(gated_plan()).unwrap();

        let node = engine
            .run_adhoc(&task_id, "painter", json!({}), vec![])
            .await
            .unwrap();
        assert_eq!(node.status, NodeStatus::Success);
        assert!((node.cost - 1.5).abs() < f64::EPSILON);

        // Unregistered kinds fail on record, exactly like queued jobs.
        let node = engine
            .run_adhoc(&task_id, "sculptor", json!({}), vec![])
            .await
            .unwrap();
        assert_eq!(node.status, NodeStatus::Failed);
        assert!(node
            .failure_reason()
            .unwrap()
            .contains("no executor registered"));
    }

    #[tokio::test]
    async fn submit_json_rejects_malformed_documents() {
        let engine = Engine::new(EngineConfig::default(), registry()).unwrap();
        let err = engine
            .submit_json(&json!({"nodes": "not-a-list"}))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidDefinition(_)));
    }
}
