use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type TaskId = String;
pub type NodeId = String;

/// Task lifecycle status. Always derivable from the statuses of the task's
/// non-temporary nodes, except for the explicit transitions the scheduler
/// makes (RUNNING at loop start, FAILED on exhausted retry budget).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Node lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Planned,
    Running,
    Success,
    Failed,
    Paused,
    SkippedRetry,
    ManuallyOverridden,
}

impl NodeStatus {
    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Success
                | NodeStatus::Failed
                | NodeStatus::SkippedRetry
                | NodeStatus::ManuallyOverridden
        )
    }
}

/// A single node declaration inside a submitted graph definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDef {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// A declarative workflow plan as submitted by the caller. Stored verbatim
/// on the task for audit and replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDefinition {
    #[serde(default)]
    pub task_name: Option<String>,
    pub nodes: Vec<NodeDef>,
}

/// The persistent record for one workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    /// Node ids in creation order. Append-only.
    pub node_ids: Vec<NodeId>,
    /// The original submitted plan, untouched after creation.
    pub definition: GraphDefinition,
    /// Opaque side-channel data persisted on the task's behalf. The engine
    /// never interprets it.
    #[serde(default)]
    pub extension_state: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The persistent record for one unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub task_id: TaskId,
    /// Selects which registered executor handles this node.
    pub kind: String,
    pub status: NodeStatus,
    pub input: Value,
    pub depends_on: Vec<NodeId>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub cost: f64,
    /// 1 for originals, incremented per corrective regeneration of the lineage.
    pub attempt: u32,
    /// Id of the version-1 node in this lineage. Absent on originals.
    #[serde(default)]
    pub retry_root: Option<NodeId>,
    /// Temporary nodes never participate in task-completion accounting.
    #[serde(default)]
    pub temporary: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NodeRecord {
    /// The id of the version-1 node in this node's lineage.
    pub fn lineage_root(&self) -> &NodeId {
        self.retry_root.as_ref().unwrap_or(&self.id)
    }

    /// The failure reason recorded on this node, if any.
    pub fn failure_reason(&self) -> Option<String> {
        let result = self.result.as_ref()?;
        for key in ["reason", "error"] {
            if let Some(v) = result.get(key).and_then(Value::as_str) {
                return Some(v.to_string());
            }
        }
        None
    }
}

/// Read-model returned by task queries: status, resolved nodes, and the
/// opaque extension state.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub nodes: Vec<NodeRecord>,
    pub extension_state: Option<Value>,
}

/// Pure derivation of a task's status from its nodes, kept in one place so
/// it can never drift from what the store writes. Temporary nodes must be
/// filtered out by the caller.
pub fn derive_task_status<'a, I>(previous: TaskStatus, nodes: I) -> TaskStatus
where
    I: IntoIterator<Item = &'a NodeRecord>,
{
    let mut any = false;
    let mut all_terminal = true;
    let mut any_failed = false;
    let mut any_paused = false;
    let mut any_running = false;

    for node in nodes {
        any = true;
        match node.status {
            NodeStatus::Failed => any_failed = true,
            NodeStatus::Paused => {
                any_paused = true;
                all_terminal = false;
            }
            NodeStatus::Running => {
                any_running = true;
                all_terminal = false;
            }
            NodeStatus::Planned => all_terminal = false,
            NodeStatus::Success | NodeStatus::SkippedRetry | NodeStatus::ManuallyOverridden => {}
        }
    }

    if !any {
        return TaskStatus::Created;
    }
    if all_terminal {
        return if any_failed {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        };
    }
    if any_paused && !any_running {
        return TaskStatus::Paused;
    }
    if any_running {
        return TaskStatus::Running;
    }
    // Some PLANNED remain with nothing running or paused.
    match previous {
        TaskStatus::Created | TaskStatus::Running => TaskStatus::Running,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn node(status: NodeStatus) -> NodeRecord {
        let now = Utc::now();
        NodeRecord {
            id: "n".to_string(),
            task_id: "t".to_string(),
            kind: "writer".to_string(),
            status,
            input: json!({}),
            depends_on: vec![],
            result: None,
            cost: 0.0,
            attempt: 1,
            retry_root: None,
            temporary: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn empty_node_set_is_created() {
        assert_eq!(derive_task_status(TaskStatus::Running, []), TaskStatus::Created);
    }

    #[test]
    fn all_terminal_without_failure_is_completed() {
        let nodes = [
            node(NodeStatus::Success),
            node(NodeStatus::SkippedRetry),
            node(NodeStatus::ManuallyOverridden),
        ];
        assert_eq!(
            derive_task_status(TaskStatus::Running, nodes.iter()),
            TaskStatus::Completed
        );
    }

    #[test]
    fn all_terminal_with_failure_is_failed() {
        let nodes = [node(NodeStatus::Success), node(NodeStatus::Failed)];
        assert_eq!(
            derive_task_status(TaskStatus::Running, nodes.iter()),
            TaskStatus::Failed
        );
    }

    #[test]
    fn paused_beats_planned_when_nothing_runs() {
        let nodes = [node(NodeStatus::Paused), node(NodeStatus::Planned)];
        assert_eq!(
            derive_task_status(TaskStatus::Running, nodes.iter()),
            TaskStatus::Paused
        );
    }

    #[test]
    fn running_node_beats_paused() {
        let nodes = [node(NodeStatus::Paused), node(NodeStatus::Running)];
        assert_eq!(
            derive_task_status(TaskStatus::Paused, nodes.iter()),
            TaskStatus::Running
        );
    }

    #[test]
    fn planned_remainder_keeps_prior_status_unless_active() {
        let nodes = [node(NodeStatus::Success), node(NodeStatus::Planned)];
        assert_eq!(
            derive_task_status(TaskStatus::Created, nodes.iter()),
            TaskStatus::Running
        );
        assert_eq!(
            derive_task_status(TaskStatus::Running, nodes.iter()),
            TaskStatus::Running
        );
        // An explicitly failed task stays failed even though planned nodes remain.
        assert_eq!(
            derive_task_status(TaskStatus::Failed, nodes.iter()),
            TaskStatus::Failed
        );
    }

    #[test]
    fn failure_reason_prefers_reason_over_error() {
        let mut n = node(NodeStatus::Failed);
        n.result = Some(json!({"reason": "too short", "error": "validation"}));
        assert_eq!(n.failure_reason().as_deref(), Some("too short"));
        n.result = Some(json!({"error": "boom"}));
        assert_eq!(n.failure_reason().as_deref(), Some("boom"));
    }

    #[test]
    fn lineage_root_defaults_to_own_id() {
        let mut n = node(NodeStatus::Planned);
        assert_eq!(n.lineage_root(), "n");
        n.retry_root = Some("root".to_string());
        assert_eq!(n.lineage_root(), "root");
    }
}
