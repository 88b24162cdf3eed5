use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::shared::{SharedValue, TaskContext};

/// Coordinator-assigned task identity, unique within one coordinator lifetime.
pub type TaskId = u64;

/// Identity of the join node a task's result feeds.
///
/// `ComposeId::FINAL` is the sentinel meaning "this task's result is the
/// client-visible final answer", not a join-slot write. Real task ids start at
/// 1, so the zero value can never collide with a live join node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComposeId(pub u64);

impl ComposeId {
    pub const FINAL: ComposeId = ComposeId(0);

    pub fn is_final(self) -> bool {
        self == Self::FINAL
    }
}

impl fmt::Display for ComposeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_final() {
            write!(f, "FINAL")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Routing data attached to every unit of work.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TaskHeader {
    pub id: TaskId,
    /// Join node this task's result feeds, or [`ComposeId::FINAL`].
    pub compose_id: ComposeId,
    /// Slot index within the join node's argument list. Meaningless when
    /// `compose_id` is the sentinel.
    pub arg_slot: u32,
}

/// Application contract for one unit of a decomposable computation.
///
/// Implementors decide per instance whether the unit is indivisible
/// ([`is_atomic`](TaskUnit::is_atomic) returns true, [`solve`](TaskUnit::solve)
/// runs) or splits further ([`decompose`](TaskUnit::decompose) runs). The
/// compose task produced by a decomposition is of the same type and has its
/// [`compose`](TaskUnit::compose) invoked once every child slot has filled.
///
/// The node-local shared value is reached only through the [`TaskContext`]
/// handed to `solve`; tasks hold no back-references into the runtime.
pub trait TaskUnit:
    fmt::Debug + Clone + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Result type produced by atomic solves and by composes.
    type Value: fmt::Debug + Clone + Send + Sync + Serialize + DeserializeOwned + 'static;
    /// Replicated pruning value this task family reads and improves.
    type Shared: SharedValue;

    fn is_atomic(&self) -> bool;

    /// Compute this unit directly. Only called when `is_atomic()` is true.
    fn solve(&self, ctx: &TaskContext<Self::Shared>) -> Self::Value;

    /// Split this unit into children plus the join node that aggregates them.
    /// Only called when `is_atomic()` is false.
    fn decompose(&self) -> Decomposition<Self>;

    /// Aggregate the filled argument slots of a ready join node. `args` is
    /// ordered by slot index. Only called on compose tasks.
    fn compose(&self, args: Vec<Self::Value>) -> Self::Value;
}

/// A join node plus the child tasks whose results it will aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "T: TaskUnit")]
pub struct Decomposition<T: TaskUnit> {
    pub compose: T,
    pub children: Vec<T>,
}

impl<T: TaskUnit> Decomposition<T> {
    pub fn new(compose: T, children: Vec<T>) -> Self {
        Self { compose, children }
    }
}

/// Timing accumulated by a join node, shipped with it once it becomes ready.
///
/// `sum_child_t1` is the total serial work below the node, `max_child_t_inf`
/// the critical path below it; `decompose` is the wall time of the
/// decomposition that created the node. The node's own compose run time is
/// added on top when its value result is processed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct JoinTiming {
    pub decompose: Duration,
    pub sum_child_t1: Duration,
    pub max_child_t_inf: Duration,
}

/// A dispatchable unit of work as it travels coordinator -> node.
///
/// A ready join node re-enters the ready queue as `Join`, carrying its filled
/// argument list and accumulated timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "T: TaskUnit")]
pub enum WorkItem<T: TaskUnit> {
    Task {
        header: TaskHeader,
        task: T,
    },
    Join {
        header: TaskHeader,
        task: T,
        args: Vec<T::Value>,
        timing: JoinTiming,
    },
}

impl<T: TaskUnit> WorkItem<T> {
    pub fn header(&self) -> &TaskHeader {
        match self {
            WorkItem::Task { header, .. } | WorkItem::Join { header, .. } => header,
        }
    }

    pub fn id(&self) -> TaskId {
        self.header().id
    }
}

/// What a task execution produced: a value destined for one argument slot (or
/// the client), or a further decomposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "T: TaskUnit")]
pub enum Outcome<T: TaskUnit> {
    Value(T::Value),
    Decompose(Decomposition<T>),
}
