//! Startup reconciliation. Runs once after the store is loaded: nodes left
//! RUNNING by a dead process go back to PLANNED, task statuses are
//! re-derived, and every task with outstanding work gets its scheduler loop
//! restarted.

use std::sync::Arc;

use tracing::{debug, info};

use crate::core::errors::Result;
use crate::model::{NodeStatus, TaskId, TaskStatus};
use crate::scheduler::Scheduler;
use crate::store::GraphStore;

/// Outcome of one recovery pass.
#[derive(Debug, Default, Clone)]
pub struct RecoveryStats {
    /// Tasks inspected.
    pub tasks_scanned: usize,
    /// Nodes reset from RUNNING to PLANNED.
    pub nodes_reset: usize,
    /// Tasks whose scheduler loop was restarted.
    pub tasks_resumed: usize,
}

pub struct Recovery {
    store: Arc<GraphStore>,
    scheduler: Arc<Scheduler>,
}

impl Recovery {
    pub fn new(store: Arc<GraphStore>, scheduler: Arc<Scheduler>) -> Self {
        Self { store, scheduler }
    }

    /// Reconciles persisted state and spawns a scheduler loop for every task
    /// that still has runnable work. Terminal tasks are left untouched.
    pub fn recover(&self) -> Result<RecoveryStats> {
        let mut stats = RecoveryStats::default();
        stats.nodes_reset = self.store.reset_running_nodes()?;

        for task_id in self.resumable_tasks()? {
            info!(task = %task_id, "resuming interrupted task");
            let scheduler = self.scheduler.clone();
            tokio::spawn(async move {
                if let Err(err) = scheduler.run_task(&task_id).await {
                    tracing::error!(task = %task_id, error = %err, "resumed scheduler loop failed");
                }
            });
            stats.tasks_resumed += 1;
        }

        stats.tasks_scanned = self.store.list_tasks().len();
        info!(
            scanned = stats.tasks_scanned,
            reset = stats.nodes_reset,
            resumed = stats.tasks_resumed,
            "recovery complete"
        );
        Ok(stats)
    }

    /// Tasks in CREATED/RUNNING with PLANNED work remaining.
    fn resumable_tasks(&self) -> Result<Vec<TaskId>> {
        let mut resumable = Vec::new();
        for task in self.store.list_tasks() {
            if !matches!(task.status, TaskStatus::Created | TaskStatus::Running) {
                debug!(task = %task.id, status = ?task.status, "not resumable");
                continue;
            }
            if self.store.has_paused_node(&task.id)? {
                debug!(task = %task.id, "waiting on a human gate; not resuming");
                continue;
            }
            if self.store.planned_nodes_remain(&task.id)? {
                resumable.push(task.id);
            }
        }
        Ok(resumable)
    }
}
