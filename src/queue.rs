//! FIFO buffer of dispatch requests, decoupling "node became ready" from
//! "node gets executed". No priority, no deduplication: the scheduler only
//! ever enqueues nodes the readiness computation returned, plus the retry
//! triggers it creates itself.

use std::collections::VecDeque;

use crate::model::{NodeId, NodeRecord};

/// A single dispatch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub node_id: NodeId,
    pub kind: String,
}

impl Job {
    pub fn for_node(node: &NodeRecord) -> Self {
        Self {
            node_id: node.id.clone(),
            kind: node.kind.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct DispatchQueue {
    jobs: VecDeque<Job>,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job: Job) {
        self.jobs.push_back(job);
    }

    pub fn pop(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }
}
