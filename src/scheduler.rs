//! Per-task control loop: compute ready nodes, dispatch them through the
//! queue one at a time, interpret results, and drive the retry/correction
//! protocol until the task reaches a terminal status or pauses.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::core::config::EngineConfig;
use crate::core::errors::Result;
use crate::executor::ExecutorRegistry;
use crate::model::{NodeRecord, NodeStatus, TaskStatus};
use crate::queue::{DispatchQueue, Job};
use crate::store::GraphStore;

pub struct Scheduler {
    store: Arc<GraphStore>,
    registry: Arc<ExecutorRegistry>,
    config: Arc<EngineConfig>,
}

impl Scheduler {
    pub fn new(
        store: Arc<GraphStore>,
        registry: Arc<ExecutorRegistry>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// Drives one task until it completes, fails, or pauses. Returns the
    /// status the task ended the run in.
    pub async fn run_task(&self, task_id: &str) -> Result<TaskStatus> {
        let task = self.store.get_task(task_id)?;
        if task.status == TaskStatus::Created {
            self.store.set_task_status(task_id, TaskStatus::Running)?;
        }
        info!(task = %task_id, "scheduler loop started");

        let mut queue = DispatchQueue::new();
        loop {
            let ready = self.store.get_ready_nodes(task_id)?;
            let mut dispatched = false;
            for node in ready {
                if node.kind == self.config.gate_kind {
                    // Human gates never enter the queue: they pause their
                    // branch the moment they become ready.
                    let reason = node
                        .input
                        .get("reason")
                        .and_then(Value::as_str)
                        .unwrap_or("awaiting human review")
                        .to_string();
                    info!(task = %task_id, node = %node.id, reason, "human gate reached; pausing");
                    self.store.update_node_status(
                        &node.id,
                        NodeStatus::Paused,
                        Some(json!({ "reason": reason })),
                        0.0,
                    )?;
                } else {
                    debug!(task = %task_id, node = %node.id, kind = %node.kind, "dispatching");
                    queue.push(Job::for_node(&node));
                    dispatched = true;
                }
            }

            while let Some(job) = queue.pop() {
                self.process_job(task_id, job, &mut queue).await?;
            }

            let status = self.store.get_task(task_id)?.status;
            if matches!(
                status,
                TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Paused
            ) {
                info!(task = %task_id, status = ?status, "scheduler loop finished");
                return Ok(status);
            }

            if !dispatched {
                // Nothing became runnable this pass and the queue is drained.
                // Remaining PLANNED work has no path to readiness (a
                // dependency failed), so the task is failed eagerly.
                if self.store.planned_nodes_remain(task_id)? {
                    warn!(task = %task_id, "planned nodes remain but none can become ready; failing task");
                    self.store.set_task_status(task_id, TaskStatus::Failed)?;
                    return Ok(TaskStatus::Failed);
                }
                return Ok(status);
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Executes one queued job and interprets its result. Executor errors
    /// are recorded on the node and never abort the loop.
    async fn process_job(
        &self,
        task_id: &str,
        job: Job,
        queue: &mut DispatchQueue,
    ) -> Result<()> {
        let node = match self.store.get_node(&job.node_id) {
            Ok(node) => node,
            Err(_) => {
                warn!(node = %job.node_id, "queued node vanished before execution");
                return Ok(());
            }
        };

        match self.invoke(&node).await? {
            Ok(result) if job.kind == self.config.corrector_kind => {
                self.apply_correction(&node, result)?;
            }
            outcome => {
                let failed = outcome.is_err();
                self.record_outcome(&node.id, outcome)?;
                if failed && job.kind == self.config.validator_kind {
                    match self.store.create_retry_trigger(task_id, &node.id)? {
                        Some(trigger) => {
                            // The trigger's dependency is the FAILED validator,
                            // so readiness would never surface it; dispatch
                            // directly.
                            info!(task = %task_id, trigger = %trigger.id, "dispatching corrector");
                            queue.push(Job::for_node(&trigger));
                        }
                        None => {
                            warn!(task = %task_id, node = %node.id, "retry budget exhausted; failing task");
                            self.store.set_task_status(task_id, TaskStatus::Failed)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Executes one node outside the dispatch loop (temporary nodes) and
    /// records its outcome. Same invocation and cost conventions as queued
    /// jobs.
    pub(crate) async fn run_node(&self, node: &NodeRecord) -> Result<NodeRecord> {
        let outcome = self.invoke(node).await?;
        self.record_outcome(&node.id, outcome)
    }

    /// Marks the node RUNNING, resolves its upstream results, and calls its
    /// registered executor. A missing registration is an executor failure,
    /// not an engine error.
    async fn invoke(&self, node: &NodeRecord) -> Result<anyhow::Result<Value>> {
        self.store
            .update_node_status(&node.id, NodeStatus::Running, None, 0.0)?;
        let upstream = self.store.resolve_upstream(node);
        Ok(match self.registry.get(&node.kind) {
            Some(executor) => executor.execute(node, &upstream).await,
            None => Err(anyhow::anyhow!(
                "no executor registered for kind '{}'",
                node.kind
            )),
        })
    }

    /// Records a plain outcome: SUCCESS with any declared cost accumulated,
    /// or FAILED with the error on the node's result.
    fn record_outcome(
        &self,
        node_id: &str,
        outcome: anyhow::Result<Value>,
    ) -> Result<NodeRecord> {
        match outcome {
            Ok(result) => {
                let cost = extract_cost(&result);
                self.store
                    .update_node_status(node_id, NodeStatus::Success, Some(result), cost)
            }
            Err(err) => {
                warn!(node = %node_id, error = %err, "executor failed");
                self.store.update_node_status(
                    node_id,
                    NodeStatus::Failed,
                    Some(json!({ "error": err.to_string() })),
                    0.0,
                )
            }
        }
    }

    /// Completes a successful corrector node: splices the corrected
    /// replacement into the graph and retires the failed lineage.
    fn apply_correction(&self, trigger: &NodeRecord, result: Value) -> Result<()> {
        let corrected = result.get("corrected_input").cloned();
        let target = trigger
            .input
            .get("original_node_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let failed = trigger
            .input
            .get("failed_node_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        let (Some(corrected), Some(target), Some(failed)) = (corrected, target, failed) else {
            self.store.update_node_status(
                &trigger.id,
                NodeStatus::Failed,
                Some(json!({
                    "error": "corrector did not produce corrected_input for a known lineage"
                })),
                0.0,
            )?;
            return Ok(());
        };

        let replacement = self.store.create_corrective_node(&target, corrected)?;
        self.store.mark_lineage_skipped(&failed, &replacement.id)?;

        let cost = extract_cost(&result);
        let mut merged = result;
        if let Value::Object(map) = &mut merged {
            map.insert("corrective_node_id".to_string(), json!(replacement.id));
        }
        self.store
            .update_node_status(&trigger.id, NodeStatus::Success, Some(merged), cost)?;
        Ok(())
    }
}

fn extract_cost(result: &Value) -> f64 {
    result.get("cost").and_then(Value::as_f64).unwrap_or(0.0)
}
