use std::fmt;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// Application contract for the replicated shared value.
///
/// `Clone` doubles as the duplicate operation: only duplicates ever travel
/// across the network, so clones must be deep and wire-transmissible.
/// `is_older_than` must be a strict partial order; a copy is only ever
/// overwritten by a value it is older than, so consumers can rely on the value
/// never regressing (a branch-and-bound bound only tightens).
pub trait SharedValue:
    fmt::Debug + Clone + Send + Sync + Serialize + DeserializeOwned + 'static
{
    fn is_older_than(&self, other: &Self) -> bool;
}

/// Placeholder shared value for task families that do not prune.
///
/// Never considers itself older than anything, so merges are always no-ops and
/// nothing is ever propagated.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Unshared;

impl SharedValue for Unshared {
    fn is_older_than(&self, _other: &Self) -> bool {
        false
    }
}

/// One locally-owned copy of the replicated value.
///
/// Every node and the coordinator hold exactly one cell; no copy ever holds a
/// reference to another's. Merge-and-compare is a single step under the cell
/// lock, so concurrent merges never interleave a read of one value with a
/// write of another.
#[derive(Debug)]
pub struct SharedCell<S: SharedValue> {
    inner: Mutex<Option<S>>,
}

impl<S: SharedValue> Default for SharedCell<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: SharedValue> SharedCell<S> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Install `value` unconditionally, discarding any previous copy. Used
    /// when a root computation seeds the shared state.
    pub fn seed(&self, value: S) {
        *self.lock() = Some(value);
    }

    /// Monotone merge: adopt `that` only if the current copy is older than it
    /// (or absent). Returns true if the local copy changed.
    pub fn merge(&self, that: S) -> bool {
        let mut guard = self.lock();
        match guard.as_ref() {
            None => {
                *guard = Some(that);
                true
            }
            Some(current) if current.is_older_than(&that) => {
                *guard = Some(that);
                true
            }
            Some(_) => false,
        }
    }

    /// A duplicate of the current copy, if seeded.
    pub fn snapshot(&self) -> Option<S> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<S>> {
        // A poisoned cell means a panic mid-merge; the invariants are gone.
        self.inner.lock().expect("shared cell poisoned")
    }
}

/// Execution context injected into a task's `solve` invocation.
///
/// Carries the node-local shared value handle explicitly; tasks never store a
/// back-pointer to the node that runs them.
#[derive(Debug, Clone)]
pub struct TaskContext<S: SharedValue> {
    cell: Arc<SharedCell<S>>,
    dirty: Arc<Notify>,
}

impl<S: SharedValue> TaskContext<S> {
    pub fn new(cell: Arc<SharedCell<S>>, dirty: Arc<Notify>) -> Self {
        Self { cell, dirty }
    }

    /// Duplicate of the node's current copy, or `None` if the computation runs
    /// without shared state.
    pub fn shared(&self) -> Option<S> {
        self.cell.snapshot()
    }

    /// Offer a candidate value observed by the running task. Merges locally;
    /// if the merge improved the copy, schedules one coalesced upstream
    /// notification (duplicates while one is pending collapse).
    pub fn push_shared(&self, value: S) {
        if self.cell.merge(value) {
            self.dirty.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    struct Best(u64);

    impl SharedValue for Best {
        // Lower is better; older means strictly worse.
        fn is_older_than(&self, other: &Self) -> bool {
            self.0 > other.0
        }
    }

    #[test]
    fn merge_is_monotone() {
        let cell = SharedCell::new();
        assert!(cell.merge(Best(50)));
        assert!(!cell.merge(Best(70)), "worse value must not replace");
        assert!(!cell.merge(Best(50)), "equal value must not replace");
        assert!(cell.merge(Best(10)));
        assert_eq!(cell.snapshot(), Some(Best(10)));
    }

    #[test]
    fn seed_overwrites_unconditionally() {
        let cell = SharedCell::new();
        cell.seed(Best(10));
        cell.seed(Best(99));
        assert_eq!(cell.snapshot(), Some(Best(99)));
    }

    #[tokio::test]
    async fn duplicate_push_leaves_copy_unchanged_and_quiet() {
        use std::time::Duration;
        use tokio::time::timeout;

        let cell = Arc::new(SharedCell::new());
        let dirty = Arc::new(Notify::new());
        let ctx = TaskContext::new(Arc::clone(&cell), Arc::clone(&dirty));

        ctx.push_shared(Best(5));
        timeout(Duration::from_millis(50), dirty.notified())
            .await
            .expect("improving push must notify upstream");

        ctx.push_shared(Best(5));
        assert_eq!(cell.snapshot(), Some(Best(5)));
        assert!(
            timeout(Duration::from_millis(50), dirty.notified())
                .await
                .is_err(),
            "non-improving push must not notify upstream"
        );
    }

    #[test]
    fn concurrent_merges_converge_to_dominant_value() {
        let cell = Arc::new(SharedCell::new());
        let mut handles = Vec::new();
        for candidate in [40u64, 10, 90, 25, 10, 3, 77] {
            let cell = Arc::clone(&cell);
            handles.push(std::thread::spawn(move || {
                cell.merge(Best(candidate));
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cell.snapshot(), Some(Best(3)));
    }
}
