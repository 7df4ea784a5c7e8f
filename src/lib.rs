// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
}

pub mod engine; // control-plane facade
pub mod executor; // executor trait and registry
pub mod model; // tasks, nodes, statuses
pub mod queue; // FIFO dispatch queue
pub mod recovery; // startup reconciliation
pub mod scheduler; // per-task control loop
pub mod store; // graph store and persistence

// Re-exports for convenience
pub use core::config::EngineConfig;
pub use core::errors::{EngineError, Result};
pub use engine::Engine;
pub use executor::{Executor, ExecutorRegistry};
pub use model::{
    GraphDefinition, NodeDef, NodeRecord, NodeStatus, TaskRecord, TaskStatus, TaskView,
};
pub use recovery::RecoveryStats;
pub use store::GraphStore;
