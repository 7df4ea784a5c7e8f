//! Authoritative in-memory graph store with write-through snapshots.
//!
//! All mutation goes through one mutex; the full store is re-snapshotted
//! after every mutating call. Snapshot writes are best-effort: a failed
//! write is logged and the in-memory state stays authoritative.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::core::config::EngineConfig;
use crate::core::errors::{EngineError, Result};
use crate::model::{
    derive_task_status, GraphDefinition, NodeDef, NodeId, NodeRecord, NodeStatus, TaskId,
    TaskRecord, TaskStatus, TaskView,
};

mod persistence;
use persistence::SnapshotStore;

/// The entire persisted document: id-generation counter plus every task and
/// node in the store.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct StoreState {
    counter: u64,
    tasks: HashMap<TaskId, TaskRecord>,
    nodes: HashMap<NodeId, NodeRecord>,
}

impl StoreState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{}_{}", prefix, self.counter)
    }
}

pub struct GraphStore {
    state: Mutex<StoreState>,
    snapshots: Option<SnapshotStore>,
    config: EngineConfig,
}

impl GraphStore {
    /// In-memory store without durability. Used by tests and callers that
    /// manage persistence themselves.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            snapshots: None,
            config,
        }
    }

    /// Opens the snapshot database at `path` and loads the last persisted
    /// state: nodes whose owning task is gone are dropped and every task
    /// status is re-derived before the store is handed out.
    pub fn open(config: EngineConfig, path: &Path) -> Result<Self> {
        let snapshots = SnapshotStore::open(path)?;
        let mut state = snapshots.load()?.unwrap_or_default();

        let task_ids: HashSet<TaskId> = state.tasks.keys().cloned().collect();
        let before = state.nodes.len();
        state.nodes.retain(|_, node| task_ids.contains(&node.task_id));
        let dropped = before - state.nodes.len();
        if dropped > 0 {
            warn!(dropped, "dropped orphaned nodes during snapshot load");
        }

        let ids: Vec<TaskId> = state.tasks.keys().cloned().collect();
        for task_id in ids {
            Self::recompute_task_status_locked(&mut state, &task_id);
        }

        info!(
            tasks = state.tasks.len(),
            nodes = state.nodes.len(),
            "graph store loaded from snapshot"
        );
        Ok(Self {
            state: Mutex::new(state),
            snapshots: Some(snapshots),
            config,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        // A poisoned lock means a panic mid-mutation; propagating the panic
        // is the only sound option for a single-writer store.
        self.state.lock().expect("graph store lock poisoned")
    }

    fn persist(&self, state: &StoreState) {
        if let Some(snapshots) = &self.snapshots {
            if let Err(err) = snapshots.save(state) {
                warn!(error = %err, "snapshot write failed; latest mutation is not durable");
            }
        }
    }

    // ---- task/node creation -------------------------------------------------

    /// Materializes a task and its PLANNED nodes from a declarative plan.
    /// Declared node ids become store ids of the form `{task}:{declared}`.
    pub fn create_task(&self, name: &str, definition: GraphDefinition) -> Result<TaskId> {
        validate_definition(&definition)?;

        let mut state = self.lock();
        let task_id = state.next_id("task");
        let now = Utc::now();

        let mut node_ids = Vec::with_capacity(definition.nodes.len());
        for def in &definition.nodes {
            let node_id = scoped_node_id(&task_id, &def.id);
            let depends_on = def
                .depends_on
                .iter()
                .map(|dep| scoped_node_id(&task_id, dep))
                .collect();
            state.nodes.insert(
                node_id.clone(),
                NodeRecord {
                    id: node_id.clone(),
                    task_id: task_id.clone(),
                    kind: def.kind.clone(),
                    status: NodeStatus::Planned,
                    input: def.input.clone(),
                    depends_on,
                    result: None,
                    cost: 0.0,
                    attempt: 1,
                    retry_root: None,
                    temporary: false,
                    created_at: now,
                    updated_at: now,
                },
            );
            node_ids.push(node_id);
        }

        state.tasks.insert(
            task_id.clone(),
            TaskRecord {
                id: task_id.clone(),
                name: name.to_string(),
                status: TaskStatus::Created,
                node_ids,
                definition,
                extension_state: None,
                created_at: now,
                updated_at: now,
            },
        );

        info!(task = %task_id, name, "task created");
        self.persist(&state);
        Ok(task_id)
    }

    /// Appends caller-declared nodes to a live task. Dependencies may name
    /// other nodes of the batch (by declared id) or any existing node of the
    /// task (by store id or declared id).
    pub fn extend_graph(&self, task_id: &str, defs: Vec<NodeDef>) -> Result<Vec<NodeId>> {
        if defs.is_empty() {
            return Err(EngineError::InvalidDefinition(
                "graph extension declares no nodes".to_string(),
            ));
        }

        let mut state = self.lock();
        let task = state
            .tasks
            .get(task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        if task.status.is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "cannot extend task {} in status {:?}",
                task_id, task.status
            )));
        }

        let mut batch_ids = HashSet::new();
        for def in &defs {
            let node_id = scoped_node_id(task_id, &def.id);
            if state.nodes.contains_key(&node_id) || !batch_ids.insert(node_id.clone()) {
                return Err(EngineError::InvalidDefinition(format!(
                    "node id '{}' already exists in task {}",
                    def.id, task_id
                )));
            }
        }

        let now = Utc::now();
        let mut created = Vec::with_capacity(defs.len());
        for def in &defs {
            let node_id = scoped_node_id(task_id, &def.id);
            let mut depends_on = Vec::with_capacity(def.depends_on.len());
            for dep in &def.depends_on {
                let scoped = scoped_node_id(task_id, dep);
                if batch_ids.contains(&scoped) || state.nodes.contains_key(&scoped) {
                    depends_on.push(scoped);
                } else if state.nodes.contains_key(dep) {
                    depends_on.push(dep.clone());
                } else {
                    return Err(EngineError::InvalidDefinition(format!(
                        "dependency '{}' of extension node '{}' is unknown",
                        dep, def.id
                    )));
                }
            }
            state.nodes.insert(
                node_id.clone(),
                NodeRecord {
                    id: node_id.clone(),
                    task_id: task_id.to_string(),
                    kind: def.kind.clone(),
                    status: NodeStatus::Planned,
                    input: def.input.clone(),
                    depends_on,
                    result: None,
                    cost: 0.0,
                    attempt: 1,
                    retry_root: None,
                    temporary: false,
                    created_at: now,
                    updated_at: now,
                },
            );
            created.push(node_id);
        }

        let task = state.tasks.get_mut(task_id).expect("task checked above");
        task.node_ids.extend(created.iter().cloned());
        task.updated_at = now;

        info!(task = %task_id, nodes = created.len(), "graph extended");
        self.persist(&state);
        Ok(created)
    }

    /// One-shot node for out-of-band generation requests. Never counted
    /// toward task completion; the caller removes it once consumed.
    pub fn create_temporary_node(
        &self,
        task_id: &str,
        kind: &str,
        input: Value,
        depends_on: Vec<NodeId>,
    ) -> Result<NodeRecord> {
        let mut state = self.lock();
        if !state.tasks.contains_key(task_id) {
            return Err(EngineError::TaskNotFound(task_id.to_string()));
        }
        for dep in &depends_on {
            if !state.nodes.contains_key(dep) {
                return Err(EngineError::NodeNotFound(dep.clone()));
            }
        }

        let node_id = state.next_id("tmp");
        let now = Utc::now();
        let node = NodeRecord {
            id: node_id.clone(),
            task_id: task_id.to_string(),
            kind: kind.to_string(),
            status: NodeStatus::Planned,
            input,
            depends_on,
            result: None,
            cost: 0.0,
            attempt: 1,
            retry_root: None,
            temporary: true,
            created_at: now,
            updated_at: now,
        };
        state.nodes.insert(node_id.clone(), node.clone());
        let task = state.tasks.get_mut(task_id).expect("task checked above");
        task.node_ids.push(node_id);
        task.updated_at = now;

        self.persist(&state);
        Ok(node)
    }

    pub fn remove_node(&self, node_id: &str) -> Result<()> {
        let mut state = self.lock();
        let node = state
            .nodes
            .remove(node_id)
            .ok_or_else(|| EngineError::NodeNotFound(node_id.to_string()))?;
        if let Some(task) = state.tasks.get_mut(&node.task_id) {
            task.node_ids.retain(|id| id != node_id);
            task.updated_at = Utc::now();
        }
        if !node.temporary {
            Self::recompute_task_status_locked(&mut state, &node.task_id);
        }
        self.persist(&state);
        Ok(())
    }

    /// Removes a task and every node it owns, temporary nodes included.
    pub fn delete_task(&self, task_id: &str) -> Result<()> {
        let mut state = self.lock();
        state
            .tasks
            .remove(task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        state.nodes.retain(|_, node| node.task_id != task_id);
        info!(task = %task_id, "task deleted");
        self.persist(&state);
        Ok(())
    }

    // ---- queries ------------------------------------------------------------

    pub fn get_task(&self, task_id: &str) -> Result<TaskRecord> {
        self.lock()
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))
    }

    pub fn get_node(&self, node_id: &str) -> Result<NodeRecord> {
        self.lock()
            .nodes
            .get(node_id)
            .cloned()
            .ok_or_else(|| EngineError::NodeNotFound(node_id.to_string()))
    }

    pub fn list_tasks(&self) -> Vec<TaskRecord> {
        let mut tasks: Vec<TaskRecord> = self.lock().tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }

    pub fn task_view(&self, task_id: &str) -> Result<TaskView> {
        let state = self.lock();
        let task = state
            .tasks
            .get(task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        let nodes = task
            .node_ids
            .iter()
            .filter_map(|id| state.nodes.get(id))
            .cloned()
            .collect();
        Ok(TaskView {
            id: task.id.clone(),
            name: task.name.clone(),
            status: task.status,
            nodes,
            extension_state: task.extension_state.clone(),
        })
    }

    /// PLANNED, non-temporary nodes of a CREATED/RUNNING task whose every
    /// dependency is SUCCESS, in creation order. Empty for any other task
    /// status, so a PAUSED task never surfaces work.
    pub fn get_ready_nodes(&self, task_id: &str) -> Result<Vec<NodeRecord>> {
        let state = self.lock();
        let task = state
            .tasks
            .get(task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        if !matches!(task.status, TaskStatus::Created | TaskStatus::Running) {
            return Ok(Vec::new());
        }

        let mut ready = Vec::new();
        for node_id in &task.node_ids {
            let Some(node) = state.nodes.get(node_id) else { continue };
            if node.temporary || node.status != NodeStatus::Planned {
                continue;
            }
            let deps_met = node.depends_on.iter().all(|dep| {
                state
                    .nodes
                    .get(dep)
                    .is_some_and(|d| d.status == NodeStatus::Success)
            });
            if deps_met {
                ready.push(node.clone());
            }
        }
        Ok(ready)
    }

    /// Dependency results for one node, keyed by dependency id. Missing or
    /// resultless dependencies map to `Null`.
    pub fn resolve_upstream(&self, node: &NodeRecord) -> HashMap<NodeId, Value> {
        let state = self.lock();
        node.depends_on
            .iter()
            .map(|dep| {
                let value = state
                    .nodes
                    .get(dep)
                    .and_then(|d| d.result.clone())
                    .unwrap_or(Value::Null);
                (dep.clone(), value)
            })
            .collect()
    }

    pub fn planned_nodes_remain(&self, task_id: &str) -> Result<bool> {
        let state = self.lock();
        let task = state
            .tasks
            .get(task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        Ok(task.node_ids.iter().any(|id| {
            state
                .nodes
                .get(id)
                .is_some_and(|n| !n.temporary && n.status == NodeStatus::Planned)
        }))
    }

    pub fn has_paused_node(&self, task_id: &str) -> Result<bool> {
        let state = self.lock();
        let task = state
            .tasks
            .get(task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        Ok(task.node_ids.iter().any(|id| {
            state
                .nodes
                .get(id)
                .is_some_and(|n| n.status == NodeStatus::Paused)
        }))
    }

    // ---- mutation -----------------------------------------------------------

    /// Applies a status transition, shallow-merges `result_delta` into the
    /// node's result (new keys override), accumulates cost, then re-derives
    /// the owning task's status.
    pub fn update_node_status(
        &self,
        node_id: &str,
        status: NodeStatus,
        result_delta: Option<Value>,
        cost_delta: f64,
    ) -> Result<NodeRecord> {
        let mut state = self.lock();
        let task_id = {
            let node = state
                .nodes
                .get_mut(node_id)
                .ok_or_else(|| EngineError::NodeNotFound(node_id.to_string()))?;
            apply_node_update(node, status, result_delta, cost_delta);
            node.task_id.clone()
        };
        Self::recompute_task_status_locked(&mut state, &task_id);

        let node = state.nodes[node_id].clone();
        debug!(node = %node_id, status = ?status, "node status updated");
        self.persist(&state);
        Ok(node)
    }

    /// Explicit task transition for the scheduler's own moves (RUNNING at
    /// loop start, FAILED on an exhausted retry budget or a blocked graph).
    pub fn set_task_status(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        let mut state = self.lock();
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        task.status = status;
        task.updated_at = Utc::now();
        debug!(task = %task_id, status = ?status, "task status set");
        self.persist(&state);
        Ok(())
    }

    pub fn set_extension_state(&self, task_id: &str, value: Value) -> Result<()> {
        let mut state = self.lock();
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        task.extension_state = Some(value);
        task.updated_at = Utc::now();
        self.persist(&state);
        Ok(())
    }

    // ---- retry/correction surgery -------------------------------------------

    /// Creates the next-version replacement for a failed lineage.
    ///
    /// The new node clones the original's kind and dependencies but carries
    /// `new_input` and the next attempt number. Every direct dependent of the
    /// original (the validator, typically) gets a parallel corrected copy
    /// pointed at the new node; the old dependent is marked SKIPPED_RETRY and
    /// every other node that referenced it is rewired to the copy, so no
    /// active dependency is left pointing at a skipped node.
    pub fn create_corrective_node(
        &self,
        original_node_id: &str,
        new_input: Value,
    ) -> Result<NodeRecord> {
        let mut state = self.lock();
        let original = state
            .nodes
            .get(original_node_id)
            .cloned()
            .ok_or_else(|| EngineError::NodeNotFound(original_node_id.to_string()))?;
        let task_id = original.task_id.clone();
        let root = original.lineage_root().clone();

        let next_attempt = 1 + state
            .nodes
            .values()
            .filter(|n| n.task_id == task_id && in_lineage(n, &root))
            .map(|n| n.attempt)
            .max()
            .unwrap_or(1);

        let now = Utc::now();
        let new_id = format!("{}_v{}", root, next_attempt);
        let replacement = NodeRecord {
            id: new_id.clone(),
            task_id: task_id.clone(),
            kind: original.kind.clone(),
            status: NodeStatus::Planned,
            input: new_input,
            depends_on: original.depends_on.clone(),
            result: None,
            cost: 0.0,
            attempt: next_attempt,
            retry_root: Some(root.clone()),
            temporary: false,
            created_at: now,
            updated_at: now,
        };
        state.nodes.insert(new_id.clone(), replacement.clone());
        if let Some(task) = state.tasks.get_mut(&task_id) {
            task.node_ids.push(new_id.clone());
        }

        // Corrected copies for direct dependents. Corrector trigger nodes and
        // already-skipped versions stay as they are.
        let dependents: Vec<NodeId> = state
            .nodes
            .values()
            .filter(|n| {
                n.task_id == task_id
                    && n.id != new_id
                    && n.status != NodeStatus::SkippedRetry
                    && n.kind != self.config.corrector_kind
                    && n.depends_on.iter().any(|dep| dep == original_node_id)
            })
            .map(|n| n.id.clone())
            .collect();

        for dependent_id in dependents {
            let dependent = state.nodes[&dependent_id].clone();
            let dependent_root = dependent.lineage_root().clone();
            let copy_id = format!("{}_v{}", dependent_root, next_attempt);

            let copy = NodeRecord {
                id: copy_id.clone(),
                task_id: task_id.clone(),
                kind: dependent.kind.clone(),
                status: NodeStatus::Planned,
                input: dependent.input.clone(),
                depends_on: dependent
                    .depends_on
                    .iter()
                    .map(|dep| {
                        if dep == original_node_id {
                            new_id.clone()
                        } else {
                            dep.clone()
                        }
                    })
                    .collect(),
                result: None,
                cost: 0.0,
                attempt: next_attempt,
                retry_root: Some(dependent_root),
                temporary: false,
                created_at: now,
                updated_at: now,
            };
            state.nodes.insert(copy_id.clone(), copy);
            if let Some(task) = state.tasks.get_mut(&task_id) {
                task.node_ids.push(copy_id.clone());
            }

            if let Some(old) = state.nodes.get_mut(&dependent_id) {
                apply_node_update(
                    old,
                    NodeStatus::SkippedRetry,
                    Some(json!({ "next_attempt": copy_id })),
                    0.0,
                );
            }

            // Third parties that depended on the old dependent now follow the
            // corrected copy.
            for node in state.nodes.values_mut() {
                if node.task_id == task_id && node.id != copy_id && node.id != dependent_id {
                    for dep in node.depends_on.iter_mut() {
                        if dep == &dependent_id {
                            *dep = copy_id.clone();
                        }
                    }
                }
            }
        }

        Self::recompute_task_status_locked(&mut state, &task_id);
        info!(
            task = %task_id,
            original = %original_node_id,
            replacement = %new_id,
            attempt = next_attempt,
            "corrective node spliced into graph"
        );
        self.persist(&state);
        Ok(replacement)
    }

    /// Creates a corrector trigger depending on the failed validator, or
    /// `None` once the lineage has used up its retry budget. The trigger
    /// input carries everything the corrector needs (failed node, original
    /// node, its current input, and the failure reason) so the corrector
    /// never has to reach back into the store.
    pub fn create_retry_trigger(
        &self,
        task_id: &str,
        failed_node_id: &str,
    ) -> Result<Option<NodeRecord>> {
        let mut state = self.lock();
        if !state.tasks.contains_key(task_id) {
            return Err(EngineError::TaskNotFound(task_id.to_string()));
        }
        let failed = state
            .nodes
            .get(failed_node_id)
            .cloned()
            .ok_or_else(|| EngineError::NodeNotFound(failed_node_id.to_string()))?;
        if failed.kind == self.config.corrector_kind {
            return Ok(None);
        }

        let root = failed.lineage_root().clone();
        let prior_attempts = state
            .nodes
            .values()
            .filter(|n| n.task_id == task_id && n.kind == failed.kind && in_lineage(n, &root))
            .count() as u32;
        if prior_attempts >= self.config.max_retry_attempts {
            warn!(
                task = %task_id,
                lineage = %root,
                attempts = prior_attempts,
                cap = self.config.max_retry_attempts,
                "retry budget exhausted"
            );
            return Ok(None);
        }

        let upstream_id = failed.depends_on.first().cloned().ok_or_else(|| {
            EngineError::InvalidState(format!(
                "failed node {} has no dependency to correct",
                failed_node_id
            ))
        })?;
        let upstream = state
            .nodes
            .get(&upstream_id)
            .cloned()
            .ok_or_else(|| EngineError::NodeNotFound(upstream_id.clone()))?;

        let now = Utc::now();
        let trigger_id = format!("retry_{}_v{}", root, prior_attempts);
        let trigger = NodeRecord {
            id: trigger_id.clone(),
            task_id: task_id.to_string(),
            kind: self.config.corrector_kind.clone(),
            status: NodeStatus::Planned,
            input: json!({
                "failed_node_id": failed.id,
                "original_node_id": upstream_id,
                "original_input": upstream.input,
                "failure_reason": failed.failure_reason().unwrap_or_else(|| "unknown failure".to_string()),
            }),
            depends_on: vec![failed.id.clone()],
            result: None,
            cost: 0.0,
            attempt: prior_attempts + 1,
            retry_root: None,
            temporary: false,
            created_at: now,
            updated_at: now,
        };
        state.nodes.insert(trigger_id.clone(), trigger.clone());
        if let Some(task) = state.tasks.get_mut(task_id) {
            task.node_ids.push(trigger_id.clone());
            task.updated_at = now;
        }

        info!(
            task = %task_id,
            failed = %failed_node_id,
            trigger = %trigger_id,
            attempt = prior_attempts + 1,
            "retry trigger created"
        );
        self.persist(&state);
        Ok(Some(trigger))
    }

    /// Marks the failed validator and the node it was validating as
    /// SKIPPED_RETRY, each annotated with a pointer to the replacement.
    /// Nodes the corrective splice already skipped keep their own pointer.
    pub fn mark_lineage_skipped(&self, failed_node_id: &str, replacement_id: &str) -> Result<()> {
        let mut state = self.lock();
        let (task_id, upstream_id) = {
            let failed = state
                .nodes
                .get_mut(failed_node_id)
                .ok_or_else(|| EngineError::NodeNotFound(failed_node_id.to_string()))?;
            if failed.status != NodeStatus::SkippedRetry {
                apply_node_update(
                    failed,
                    NodeStatus::SkippedRetry,
                    Some(json!({ "next_attempt": replacement_id })),
                    0.0,
                );
            }
            (failed.task_id.clone(), failed.depends_on.first().cloned())
        };
        if let Some(upstream_id) = upstream_id {
            if let Some(upstream) = state.nodes.get_mut(&upstream_id) {
                if upstream.status != NodeStatus::SkippedRetry {
                    apply_node_update(
                        upstream,
                        NodeStatus::SkippedRetry,
                        Some(json!({ "next_attempt": replacement_id })),
                        0.0,
                    );
                }
            }
        }
        Self::recompute_task_status_locked(&mut state, &task_id);
        self.persist(&state);
        Ok(())
    }

    // ---- startup reconciliation ---------------------------------------------

    /// Resets every node left RUNNING by a dead process back to PLANNED with
    /// its result cleared, then re-derives all task statuses. Returns the
    /// number of nodes reset.
    pub fn reset_running_nodes(&self) -> Result<usize> {
        let mut state = self.lock();
        let mut touched_tasks = HashSet::new();
        let mut reset = 0;
        for node in state.nodes.values_mut() {
            if node.status == NodeStatus::Running {
                node.status = NodeStatus::Planned;
                node.result = None;
                node.updated_at = Utc::now();
                touched_tasks.insert(node.task_id.clone());
                reset += 1;
            }
        }
        for task_id in &touched_tasks {
            Self::recompute_task_status_locked(&mut state, task_id);
        }
        if reset > 0 {
            info!(reset, "reset interrupted nodes to PLANNED");
            self.persist(&state);
        }
        Ok(reset)
    }

    fn recompute_task_status_locked(state: &mut StoreState, task_id: &str) {
        let Some((previous, node_ids)) = state
            .tasks
            .get(task_id)
            .map(|t| (t.status, t.node_ids.clone()))
        else {
            return;
        };
        let derived = derive_task_status(
            previous,
            node_ids
                .iter()
                .filter_map(|id| state.nodes.get(id))
                .filter(|n| !n.temporary),
        );
        if derived != previous {
            if let Some(task) = state.tasks.get_mut(task_id) {
                task.status = derived;
                task.updated_at = Utc::now();
            }
        }
    }
}

fn scoped_node_id(task_id: &str, declared: &str) -> NodeId {
    format!("{}:{}", task_id, declared)
}

fn in_lineage(node: &NodeRecord, root: &str) -> bool {
    node.id == root || node.retry_root.as_deref() == Some(root)
}

fn apply_node_update(
    node: &mut NodeRecord,
    status: NodeStatus,
    result_delta: Option<Value>,
    cost_delta: f64,
) {
    node.status = status;
    if let Some(delta) = result_delta {
        node.result = Some(match (node.result.take(), delta) {
            (Some(Value::Object(mut base)), Value::Object(additions)) => {
                for (key, value) in additions {
                    base.insert(key, value);
                }
                Value::Object(base)
            }
            (_, delta) => delta,
        });
    }
    node.cost += cost_delta;
    node.updated_at = Utc::now();
}

fn validate_definition(definition: &GraphDefinition) -> Result<()> {
    if definition.nodes.is_empty() {
        return Err(EngineError::InvalidDefinition(
            "graph definition declares no nodes".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    for def in &definition.nodes {
        if def.id.is_empty() {
            return Err(EngineError::InvalidDefinition(
                "node with empty id".to_string(),
            ));
        }
        if !seen.insert(def.id.as_str()) {
            return Err(EngineError::InvalidDefinition(format!(
                "duplicate node id '{}'",
                def.id
            )));
        }
    }
    for def in &definition.nodes {
        for dep in &def.depends_on {
            if !seen.contains(dep.as_str()) {
                return Err(EngineError::InvalidDefinition(format!(
                    "node '{}' depends on undeclared node '{}'",
                    def.id, dep
                )));
            }
        }
    }
    Ok(())
}
