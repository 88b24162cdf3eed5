use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SpaceError};
use crate::join::{JoinEntry, JoinTable};
use crate::metrics::ComputeStats;
use crate::model::{ComposeId, Decomposition, Outcome, TaskHeader, TaskId, TaskUnit, WorkItem};
use crate::proxy::NodeProxy;
use crate::ready_queue::ReadyQueue;
use crate::shared::SharedCell;
use crate::wire::{read_frame, write_frame, Frame};

pub type NodeId = Uuid;

/// The root result together with its bottom-up timing, handed to the waiting
/// client.
pub(crate) struct Delivery<T: TaskUnit> {
    pub value: T::Value,
    pub t1: Duration,
    pub t_inf: Duration,
}

/// The coordinator: owns the ready-task queue, the pending-join table,
/// task-id allocation, the registry of connected compute nodes, and the
/// distribution hub for the shared replicated value.
///
/// One root computation occupies the space at a time; the delivery receiver
/// doubles as the lock enforcing that discipline.
pub struct Space<T: TaskUnit> {
    task_ids: AtomicU64,
    ready: ReadyQueue<WorkItem<T>>,
    joins: JoinTable<T>,
    nodes: DashMap<NodeId, Arc<NodeProxy<T>>>,
    shared: SharedCell<T::Shared>,
    stats: ComputeStats,
    /// Worker slots idle until this flips true at the start of a root
    /// computation; late-registered nodes observe the current state and join
    /// in immediately (elastic scale-out).
    active: watch::Sender<bool>,
    delivery_tx: mpsc::UnboundedSender<Delivery<T>>,
    delivery_rx: Mutex<mpsc::UnboundedReceiver<Delivery<T>>>,
    /// Serializes result processing end-to-end, keeping the timing
    /// accumulators and table mutations consistent.
    result_section: StdMutex<()>,
}

impl<T: TaskUnit> Space<T> {
    pub fn new() -> Arc<Self> {
        let (active, _) = watch::channel(false);
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            task_ids: AtomicU64::new(0),
            ready: ReadyQueue::new(),
            joins: JoinTable::new(),
            nodes: DashMap::new(),
            shared: SharedCell::new(),
            stats: ComputeStats::new(),
            active,
            delivery_tx,
            delivery_rx: Mutex::new(delivery_rx),
            result_section: StdMutex::new(()),
        })
    }

    /// Run a root computation to completion and return its final value.
    pub async fn submit(&self, task: T) -> Result<T::Value> {
        self.submit_inner(task, None).await
    }

    /// As [`submit`](Space::submit), additionally seeding the shared value and
    /// pushing it to every currently-registered node before work begins.
    pub async fn submit_with_shared(&self, task: T, shared: T::Shared) -> Result<T::Value> {
        self.submit_inner(task, Some(shared)).await
    }

    async fn submit_inner(&self, task: T, seed: Option<T::Shared>) -> Result<T::Value> {
        // Holding the receiver is the single-job-at-a-time discipline.
        let mut delivery_rx = self.delivery_rx.lock().await;
        // A previous submission abandoned mid-flight may have left its result
        // behind; it belongs to nobody now.
        while delivery_rx.try_recv().is_ok() {
            warn!("discarding stale delivery from an abandoned computation");
        }

        self.stats.reset();
        if let Some(value) = seed {
            self.init_shared(value);
        }
        self.active.send_replace(true);

        let header = TaskHeader {
            id: self.next_task_id(),
            compose_id: ComposeId::FINAL,
            arg_slot: 0,
        };
        self.enqueue(WorkItem::Task { header, task });

        let delivered = delivery_rx.recv().await.ok_or(SpaceError::Shutdown)?;
        let snapshot = self.stats.snapshot();
        info!(
            total_tasks = snapshot.tasks,
            t1_ms = delivered.t1.as_millis() as u64,
            t_inf_ms = delivered.t_inf.as_millis() as u64,
            "computation complete"
        );
        Ok(delivered.value)
    }

    /// Accept node registrations and client submissions forever.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "space listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let space = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(error) = space.handle_connection(stream, peer).await {
                    warn!(%peer, %error, "connection ended with error");
                }
            });
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();
        match read_frame::<T, _>(&mut reader).await? {
            Frame::Register { workers } => {
                self.register_node(reader, writer, workers);
                Ok(())
            }
            Frame::Submit { task, shared } => {
                info!(%peer, "client submission accepted");
                let value = match shared {
                    Some(seed) => self.submit_with_shared(task, seed).await?,
                    None => self.submit(task).await?,
                };
                write_frame(&mut writer, &Frame::<T>::Final { value }).await
            }
            _ => Err(SpaceError::UnexpectedFrame {
                expected: "Register or Submit",
            }),
        }
    }

    /// Admit a compute node and start its worker-pool proxy, sized to
    /// `workers` parallel fetch-execute cycles. May be called at any time,
    /// including mid-computation.
    pub fn register_node(
        self: &Arc<Self>,
        reader: tokio::net::tcp::OwnedReadHalf,
        writer: tokio::net::tcp::OwnedWriteHalf,
        workers: usize,
    ) -> NodeId {
        let proxy = NodeProxy::start(Arc::clone(self), reader, writer, workers);
        let id = proxy.id;
        // A node arriving mid-computation gets the current shared value
        // before its slots can pull work.
        if self.shared.snapshot().is_some() {
            proxy.mark_shared_dirty();
        }
        self.nodes.insert(id, proxy);
        info!(node = %id, workers, "node registered");
        id
    }

    pub(crate) fn deregister_node(&self, id: NodeId) {
        if self.nodes.remove(&id).is_some() {
            warn!(node = %id, "node deregistered");
            if self.nodes.is_empty() {
                warn!("no compute nodes remain; work will wait for a replacement");
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Place a task on the ready queue. The task must already carry a valid
    /// compose id: a live pending join, or the sentinel.
    pub(crate) fn enqueue(&self, item: WorkItem<T>) {
        let compose_id = item.header().compose_id;
        debug_assert!(
            compose_id.is_final() || self.joins.contains(compose_id),
            "task {} enqueued with dead compose id {compose_id}",
            item.id(),
        );
        self.ready.push(item);
    }

    pub(crate) async fn next_ready(&self) -> WorkItem<T> {
        self.ready.pop_wait().await
    }

    pub(crate) fn activation(&self) -> watch::Receiver<bool> {
        self.active.subscribe()
    }

    /// The single serialization point for result processing.
    pub(crate) fn process_result(&self, parent: &WorkItem<T>, outcome: Outcome<T>, run_time: Duration) {
        let _section = self
            .result_section
            .lock()
            .expect("result section poisoned");
        self.stats.record_result(run_time);
        match outcome {
            Outcome::Value(value) => self.process_value(parent, value, run_time),
            Outcome::Decompose(decomposition) => {
                self.process_decomposition(parent, decomposition, run_time)
            }
        }
    }

    fn process_value(&self, parent: &WorkItem<T>, value: T::Value, run_time: Duration) {
        // Bottom-up timing: a join's value folds in its decomposition time and
        // its children's accumulated times; an atomic task is its own T1 and
        // critical path.
        let (t1, t_inf) = match parent {
            WorkItem::Join { timing, .. } => {
                let common = timing.decompose + run_time;
                (common + timing.sum_child_t1, common + timing.max_child_t_inf)
            }
            WorkItem::Task { .. } => (run_time, run_time),
        };

        let header = parent.header();
        if header.compose_id.is_final() {
            self.stats.set_t_inf(t_inf);
            if self
                .delivery_tx
                .send(Delivery { value, t1, t_inf })
                .is_err()
            {
                warn!("final value produced with no client waiting");
            }
            return;
        }

        if let Some(ready_join) =
            self.joins
                .complete_slot(header.compose_id, header.arg_slot, value, t1, t_inf)
        {
            debug!(join = %header.compose_id, "join node ready");
            self.enqueue(ready_join);
        }
    }

    fn process_decomposition(
        &self,
        parent: &WorkItem<T>,
        decomposition: Decomposition<T>,
        run_time: Duration,
    ) {
        let Decomposition { compose, children } = decomposition;
        let compose_id = ComposeId(self.next_task_id());
        let parent_header = parent.header();

        // The join node inherits the parent's routing: its value will feed the
        // same slot the parent's value would have.
        self.joins.insert(JoinEntry::new(
            TaskHeader {
                id: compose_id.0,
                compose_id: parent_header.compose_id,
                arg_slot: parent_header.arg_slot,
            },
            compose,
            children.len(),
            run_time,
        ));

        for (slot, child) in children.into_iter().enumerate() {
            let header = TaskHeader {
                id: self.next_task_id(),
                compose_id,
                arg_slot: slot as u32,
            };
            self.enqueue(WorkItem::Task { header, task: child });
        }
    }

    /// Upstream shared-value arrival: merge into the space's copy and, only if
    /// that changed it, fan the new duplicate out to every other node.
    pub(crate) fn up_shared(&self, value: T::Shared, from: Option<NodeId>) {
        if self.shared.merge(value) {
            for entry in self.nodes.iter() {
                if Some(*entry.key()) != from {
                    entry.value().mark_shared_dirty();
                }
            }
        }
    }

    pub(crate) fn shared_snapshot(&self) -> Option<T::Shared> {
        self.shared.snapshot()
    }

    fn init_shared(&self, value: T::Shared) {
        self.shared.seed(value);
        for entry in self.nodes.iter() {
            entry.value().mark_shared_dirty();
        }
    }

    /// Orderly teardown: tell every node to exit and drop the proxies. No new
    /// work is accepted through the queue after the nodes are gone.
    pub fn shutdown(&self) {
        for entry in self.nodes.iter() {
            entry.value().send(Frame::Shutdown);
        }
        self.nodes.clear();
    }

    fn next_task_id(&self) -> TaskId {
        self.task_ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[cfg(test)]
    pub(crate) fn pending_joins(&self) -> usize {
        self.joins.len()
    }

    #[cfg(test)]
    pub(crate) fn ready_len(&self) -> usize {
        self.ready.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Decomposition;
    use crate::shared::{TaskContext, Unshared};
    use serde::{Deserialize, Serialize};

    /// Sums the leaves 1..=width by decomposing once.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    enum FanOut {
        Root { width: u64 },
        Leaf { value: u64 },
        Sum,
    }

    impl TaskUnit for FanOut {
        type Value = u64;
        type Shared = Unshared;

        fn is_atomic(&self) -> bool {
            !matches!(self, FanOut::Root { .. })
        }

        fn solve(&self, _ctx: &TaskContext<Unshared>) -> u64 {
            match self {
                FanOut::Leaf { value } => *value,
                _ => unreachable!("only leaves solve"),
            }
        }

        fn decompose(&self) -> Decomposition<Self> {
            match self {
                FanOut::Root { width } => Decomposition::new(
                    FanOut::Sum,
                    (1..=*width).map(|value| FanOut::Leaf { value }).collect(),
                ),
                _ => unreachable!("only the root decomposes"),
            }
        }

        fn compose(&self, args: Vec<u64>) -> u64 {
            args.iter().sum()
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    /// Drive the space's result loop directly, standing in for worker slots.
    fn drain_one(space: &Space<FanOut>, run_time: Duration) -> WorkItem<FanOut> {
        let item = space.ready.pop().expect("ready queue unexpectedly empty");
        let ctx = TaskContext::new(
            Arc::new(SharedCell::new()),
            Arc::new(tokio::sync::Notify::new()),
        );
        let outcome = match &item {
            WorkItem::Task { task, .. } => {
                if task.is_atomic() {
                    Outcome::Value(task.solve(&ctx))
                } else {
                    Outcome::Decompose(task.decompose())
                }
            }
            WorkItem::Join { task, args, .. } => Outcome::Value(task.compose(args.clone())),
        };
        space.process_result(&item, outcome, run_time);
        item
    }

    #[tokio::test]
    async fn sentinel_delivery_returns_exactly_the_solved_value() {
        let space = Space::<FanOut>::new();
        let submission = {
            let space = Arc::clone(&space);
            tokio::spawn(async move { space.submit(FanOut::Leaf { value: 77 }).await })
        };

        // Wait for the root to land on the ready queue, then execute it.
        while space.ready_len() == 0 {
            tokio::time::sleep(ms(1)).await;
        }
        drain_one(&space, ms(3));

        assert_eq!(submission.await.unwrap().unwrap(), 77);
    }

    #[tokio::test]
    async fn decomposition_joins_and_delivers() {
        let space = Space::<FanOut>::new();
        let submission = {
            let space = Arc::clone(&space);
            tokio::spawn(async move { space.submit(FanOut::Root { width: 4 }).await })
        };

        while space.ready_len() == 0 {
            tokio::time::sleep(ms(1)).await;
        }

        // Root decomposes into 4 leaves plus a pending join.
        drain_one(&space, ms(2));
        assert_eq!(space.pending_joins(), 1);
        assert_eq!(space.ready_len(), 4);

        // Children complete in arbitrary order; the last one readies the join.
        for _ in 0..4 {
            drain_one(&space, ms(1));
        }
        assert_eq!(space.pending_joins(), 0);
        assert_eq!(space.ready_len(), 1);

        // The ready join composes and delivers.
        drain_one(&space, ms(2));
        assert_eq!(submission.await.unwrap().unwrap(), 1 + 2 + 3 + 4);
    }

    #[tokio::test]
    async fn timing_aggregates_sum_and_critical_path() {
        let space = Space::<FanOut>::new();
        let submission = {
            let space = Arc::clone(&space);
            tokio::spawn(async move { space.submit(FanOut::Root { width: 3 }).await })
        };
        while space.ready_len() == 0 {
            tokio::time::sleep(ms(1)).await;
        }

        // Decompose with run time D = 2ms.
        drain_one(&space, ms(2));
        // Children with serial (= critical-path) times 10, 20, 15.
        for child_time in [10, 20, 15] {
            drain_one(&space, ms(child_time));
        }

        // The ready join carries sum = 45 and max = 20 plus its decompose time.
        let join_item = space.ready.pop().expect("join should be ready");
        match &join_item {
            WorkItem::Join { timing, .. } => {
                assert_eq!(timing.sum_child_t1, ms(45));
                assert_eq!(timing.max_child_t_inf, ms(20));
                assert_eq!(timing.decompose, ms(2));
            }
            WorkItem::Task { .. } => panic!("expected a ready join"),
        }

        // Completing the join with compose run time 1ms delivers
        // T1 = 2 + 1 + 45 and Tinf = 2 + 1 + 20.
        let args = match &join_item {
            WorkItem::Join { args, task, .. } => Outcome::Value(task.compose(args.clone())),
            WorkItem::Task { .. } => unreachable!(),
        };
        space.process_result(&join_item, args, ms(1));

        assert_eq!(submission.await.unwrap().unwrap(), 6);
        let snapshot = space.stats.snapshot();
        assert_eq!(snapshot.t_inf, ms(23));
        assert_eq!(snapshot.tasks, 5);
    }
}
