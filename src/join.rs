use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;

use crate::model::{ComposeId, JoinTiming, TaskHeader, TaskUnit, WorkItem};

/// One pending join node: a compose task waiting for its argument slots.
///
/// Slot indices are assigned disjointly by the parent at decomposition time,
/// so two children never write the same slot; each slot is a write-once cell.
/// The unset counter's decrement-to-zero is the single readiness transition,
/// performed by whichever child result drains it.
pub struct JoinEntry<T: TaskUnit> {
    /// Routing for the join node itself once it becomes runnable: its own id,
    /// plus the compose id / slot of the *parent* join it feeds.
    header: TaskHeader,
    task: T,
    slots: Box<[OnceLock<T::Value>]>,
    unset: AtomicUsize,
    /// Wall time of the decomposition that created this node, in nanos.
    decompose_nanos: u64,
    /// Sum of children's serial running times, in nanos.
    sum_child_t1: AtomicU64,
    /// Max of children's critical-path running times, in nanos.
    max_child_t_inf: AtomicU64,
}

impl<T: TaskUnit> JoinEntry<T> {
    pub fn new(header: TaskHeader, task: T, num_args: usize, decompose_time: Duration) -> Self {
        assert!(num_args > 0, "join node must aggregate at least one child");
        let mut slots = Vec::with_capacity(num_args);
        slots.resize_with(num_args, OnceLock::new);
        Self {
            header,
            task,
            slots: slots.into_boxed_slice(),
            unset: AtomicUsize::new(num_args),
            decompose_nanos: duration_nanos(decompose_time),
            sum_child_t1: AtomicU64::new(0),
            max_child_t_inf: AtomicU64::new(0),
        }
    }

    fn into_work_item(self: Arc<Self>) -> WorkItem<T> {
        let args = self
            .slots
            .iter()
            .map(|slot| {
                slot.get()
                    .expect("join readiness reached with an unset slot")
                    .clone()
            })
            .collect();
        WorkItem::Join {
            header: self.header,
            task: self.task.clone(),
            args,
            timing: JoinTiming {
                decompose: Duration::from_nanos(self.decompose_nanos),
                sum_child_t1: Duration::from_nanos(self.sum_child_t1.load(Ordering::Acquire)),
                max_child_t_inf: Duration::from_nanos(
                    self.max_child_t_inf.load(Ordering::Acquire),
                ),
            },
        }
    }
}

/// Table of join nodes awaiting completion, keyed by their compose id.
///
/// Entries are added exactly once at decomposition time and removed exactly
/// once when the node becomes ready. Violations of the DAG invariants abort:
/// they are programming errors, never runtime conditions to recover from.
pub struct JoinTable<T: TaskUnit> {
    entries: DashMap<ComposeId, Arc<JoinEntry<T>>>,
}

impl<T: TaskUnit> Default for JoinTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TaskUnit> JoinTable<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn insert(&self, entry: JoinEntry<T>) {
        let id = ComposeId(entry.header.id);
        let previous = self.entries.insert(id, Arc::new(entry));
        assert!(
            previous.is_none(),
            "join node {id} inserted into the pending table twice"
        );
    }

    pub fn contains(&self, id: ComposeId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write one child's value result into its argument slot and fold its
    /// timing into the accumulators.
    ///
    /// Returns the join node as a runnable work item when this write fills the
    /// last slot; the caller enqueues it. The decrement-and-test makes the
    /// transition fire exactly once even under concurrent completions.
    pub fn complete_slot(
        &self,
        id: ComposeId,
        arg_slot: u32,
        value: T::Value,
        child_t1: Duration,
        child_t_inf: Duration,
    ) -> Option<WorkItem<T>> {
        let entry = {
            let guard = self
                .entries
                .get(&id)
                .unwrap_or_else(|| panic!("result addressed to unknown join node {id}"));
            Arc::clone(&guard)
        };

        let slot = entry
            .slots
            .get(arg_slot as usize)
            .unwrap_or_else(|| panic!("join node {id} has no argument slot {arg_slot}"));
        if slot.set(value).is_err() {
            panic!("argument slot {arg_slot} of join node {id} written twice");
        }

        entry
            .sum_child_t1
            .fetch_add(duration_nanos(child_t1), Ordering::AcqRel);
        entry
            .max_child_t_inf
            .fetch_max(duration_nanos(child_t_inf), Ordering::AcqRel);

        if entry.unset.fetch_sub(1, Ordering::AcqRel) == 1 {
            let (_, removed) = self
                .entries
                .remove(&id)
                .expect("ready join node vanished from the pending table");
            Some(removed.into_work_item())
        } else {
            None
        }
    }
}

fn duration_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::{TaskContext, Unshared};
    use crate::model::Decomposition;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Sum;

    impl TaskUnit for Sum {
        type Value = u64;
        type Shared = Unshared;

        fn is_atomic(&self) -> bool {
            true
        }

        fn solve(&self, _ctx: &TaskContext<Unshared>) -> u64 {
            0
        }

        fn decompose(&self) -> Decomposition<Self> {
            unreachable!("atomic")
        }

        fn compose(&self, args: Vec<u64>) -> u64 {
            args.iter().sum()
        }
    }

    fn header(id: u64) -> TaskHeader {
        TaskHeader {
            id,
            compose_id: ComposeId::FINAL,
            arg_slot: 0,
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn ready_iff_all_slots_filled_regardless_of_order() {
        let table = JoinTable::new();
        table.insert(JoinEntry::new(header(1), Sum, 3, ms(0)));

        assert!(table.complete_slot(ComposeId(1), 2, 30, ms(1), ms(1)).is_none());
        assert!(table.complete_slot(ComposeId(1), 0, 10, ms(1), ms(1)).is_none());
        let ready = table
            .complete_slot(ComposeId(1), 1, 20, ms(1), ms(1))
            .expect("last slot write must produce the runnable join");

        match ready {
            WorkItem::Join { args, .. } => assert_eq!(args, vec![10, 20, 30]),
            WorkItem::Task { .. } => panic!("join readiness produced a plain task"),
        }
        assert!(table.is_empty(), "ready join must leave the pending table");
    }

    #[test]
    fn timing_accumulators_fold_sum_and_max() {
        let table = JoinTable::new();
        table.insert(JoinEntry::new(header(1), Sum, 3, ms(7)));

        table.complete_slot(ComposeId(1), 0, 1, ms(10), ms(10));
        table.complete_slot(ComposeId(1), 1, 2, ms(20), ms(20));
        let ready = table
            .complete_slot(ComposeId(1), 2, 3, ms(15), ms(15))
            .unwrap();

        match ready {
            WorkItem::Join { timing, .. } => {
                assert_eq!(timing.decompose, ms(7));
                assert_eq!(timing.sum_child_t1, ms(45));
                assert_eq!(timing.max_child_t_inf, ms(20));
            }
            WorkItem::Task { .. } => unreachable!(),
        }
    }

    #[test]
    fn readiness_fires_exactly_once_under_concurrent_completions() {
        use std::sync::atomic::AtomicUsize;

        let num_children = 16;
        let table = Arc::new(JoinTable::new());
        table.insert(JoinEntry::new(header(1), Sum, num_children, ms(0)));
        let ready_count = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for slot in 0..num_children {
            let table = Arc::clone(&table);
            let ready_count = Arc::clone(&ready_count);
            handles.push(std::thread::spawn(move || {
                let ready = table.complete_slot(
                    ComposeId(1),
                    slot as u32,
                    slot as u64,
                    ms(1),
                    ms(1),
                );
                if ready.is_some() {
                    ready_count.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(
            ready_count.load(Ordering::SeqCst),
            1,
            "exactly one completer may observe readiness"
        );
        assert!(table.is_empty());
    }

    #[test]
    #[should_panic(expected = "inserted into the pending table twice")]
    fn double_insert_aborts() {
        let table = JoinTable::new();
        table.insert(JoinEntry::new(header(1), Sum, 2, ms(0)));
        table.insert(JoinEntry::new(header(1), Sum, 2, ms(0)));
    }

    #[test]
    #[should_panic(expected = "unknown join node")]
    fn result_for_unknown_join_aborts() {
        let table: JoinTable<Sum> = JoinTable::new();
        table.complete_slot(ComposeId(9), 0, 1, ms(1), ms(1));
    }

    #[test]
    #[should_panic(expected = "written twice")]
    fn double_slot_write_aborts() {
        let table = JoinTable::new();
        table.insert(JoinEntry::new(header(1), Sum, 2, ms(0)));
        table.complete_slot(ComposeId(1), 0, 1, ms(1), ms(1));
        table.complete_slot(ComposeId(1), 0, 2, ms(1), ms(1));
    }
}
