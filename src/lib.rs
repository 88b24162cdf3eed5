//! taskspace: a master/worker space for recursively decomposable
//! computations.
//!
//! A client submits a root task to the [`Space`]; registered compute nodes
//! pull ready tasks, execute them, and report back either a final value or a
//! further decomposition into children plus a join node. Join nodes barrier on
//! their children's results and then run themselves. An application-defined
//! shared value (typically a branch-and-bound bound) is replicated to every
//! node through the space and merged monotonically, so pruning decisions may
//! be stale but never wrong.

// Core coordination layer
pub mod config;
pub mod error;
pub mod join;
pub mod metrics;
pub mod model;
pub mod node;
pub mod proxy;
pub mod ready_queue;
pub mod shared;
pub mod space;
pub mod wire;

// Demo problem implementations
pub mod apps;

// Re-exports for convenience
pub use config::{NodeConfig, SpaceConfig, DEFAULT_PORT};
pub use error::{Result, SpaceError};
pub use model::{ComposeId, Decomposition, Outcome, TaskHeader, TaskId, TaskUnit, WorkItem};
pub use node::ComputeNode;
pub use shared::{SharedValue, TaskContext, Unshared};
pub use space::Space;
