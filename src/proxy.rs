use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, info, warn};

use crate::error::SpaceError;
use crate::model::{Outcome, TaskId, TaskUnit};
use crate::space::{NodeId, Space};
use crate::wire::{read_frame, write_frame, Frame};

/// Outcome of one remote execution, as reported by the node.
pub(crate) struct ExecReport<T: TaskUnit> {
    pub outcome: Outcome<T>,
    pub run_time: Duration,
}

/// Per-node bridge between the space's shared ready queue and the node's pool
/// of execution slots.
///
/// Each slot loops: wait for activation, pull the next ready task, dispatch it
/// over the node connection, await the report, feed it to result processing.
/// A dispatch or report failure returns the in-flight task to the ready queue
/// once and retires the slot; when the last slot retires the node is
/// deregistered.
pub struct NodeProxy<T: TaskUnit> {
    pub(crate) id: NodeId,
    out: mpsc::UnboundedSender<Frame<T>>,
    pending: DashMap<TaskId, oneshot::Sender<ExecReport<T>>>,
    down_dirty: Notify,
    dead: watch::Sender<bool>,
    live_slots: AtomicUsize,
}

impl<T: TaskUnit> NodeProxy<T> {
    pub(crate) fn start(
        space: Arc<Space<T>>,
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        workers: usize,
    ) -> Arc<Self> {
        let (out, out_rx) = mpsc::unbounded_channel();
        let (dead, _) = watch::channel(false);
        let proxy = Arc::new(Self {
            id: NodeId::new_v4(),
            out,
            pending: DashMap::new(),
            down_dirty: Notify::new(),
            dead,
            live_slots: AtomicUsize::new(workers),
        });

        tokio::spawn(write_loop(Arc::clone(&proxy), out_rx, writer));
        tokio::spawn(read_loop(Arc::clone(&space), Arc::clone(&proxy), reader));
        tokio::spawn(down_shared_loop(Arc::clone(&space), Arc::clone(&proxy)));
        for slot in 0..workers {
            tokio::spawn(slot_loop(Arc::clone(&space), Arc::clone(&proxy), slot));
        }
        proxy
    }

    /// Queue a frame for the connection writer. False once the node is gone.
    pub(crate) fn send(&self, frame: Frame<T>) -> bool {
        self.out.send(frame).is_ok()
    }

    /// Coalescing downstream signal: however many times the shared value
    /// improves while a push is in flight, the node gets one fresh duplicate.
    pub(crate) fn mark_shared_dirty(&self) {
        self.down_dirty.notify_one();
    }

    fn watch_dead(&self) -> watch::Receiver<bool> {
        self.dead.subscribe()
    }
}

/// Resolves once the node connection is known dead.
async fn dead(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn write_loop<T: TaskUnit>(
    proxy: Arc<NodeProxy<T>>,
    mut out_rx: mpsc::UnboundedReceiver<Frame<T>>,
    mut writer: OwnedWriteHalf,
) {
    let dead_rx = proxy.watch_dead();
    loop {
        tokio::select! {
            maybe_frame = out_rx.recv() => match maybe_frame {
                Some(frame) => {
                    if let Err(error) = write_frame(&mut writer, &frame).await {
                        warn!(node = %proxy.id, %error, "write to node failed");
                        break;
                    }
                }
                None => break,
            },
            _ = dead(dead_rx.clone()) => break,
        }
    }
    // Dropping the receiver closes the channel; dispatch attempts now fail.
}

async fn read_loop<T: TaskUnit>(
    space: Arc<Space<T>>,
    proxy: Arc<NodeProxy<T>>,
    mut reader: OwnedReadHalf,
) {
    loop {
        match read_frame::<T, _>(&mut reader).await {
            Ok(Frame::Report {
                task_id,
                outcome,
                run_time,
            }) => {
                if let Some((_, report_tx)) = proxy.pending.remove(&task_id) {
                    let _ = report_tx.send(ExecReport { outcome, run_time });
                } else {
                    warn!(node = %proxy.id, task = task_id, "report for task not in flight");
                }
            }
            Ok(Frame::SharedUp(value)) => space.up_shared(value, Some(proxy.id)),
            Ok(_) => warn!(node = %proxy.id, "unexpected frame from node"),
            Err(SpaceError::ConnectionClosed) => {
                info!(node = %proxy.id, "node disconnected");
                break;
            }
            Err(error) => {
                warn!(node = %proxy.id, %error, "node connection failed");
                break;
            }
        }
    }
    // Death order matters: mark dead first so no new dispatch enters flight,
    // then fail everything already in flight.
    let _ = proxy.dead.send(true);
    proxy.pending.clear();
}

async fn down_shared_loop<T: TaskUnit>(space: Arc<Space<T>>, proxy: Arc<NodeProxy<T>>) {
    let dead_rx = proxy.watch_dead();
    loop {
        tokio::select! {
            _ = proxy.down_dirty.notified() => {
                let Some(value) = space.shared_snapshot() else { continue };
                if !proxy.send(Frame::SharedDown(value)) {
                    break;
                }
            }
            _ = dead(dead_rx.clone()) => break,
        }
    }
}

async fn slot_loop<T: TaskUnit>(space: Arc<Space<T>>, proxy: Arc<NodeProxy<T>>, slot: usize) {
    slot_cycles(&space, &proxy, slot).await;
    // Retire; the last slot out deregisters the node.
    if proxy.live_slots.fetch_sub(1, Ordering::AcqRel) == 1 {
        space.deregister_node(proxy.id);
    }
}

async fn slot_cycles<T: TaskUnit>(space: &Arc<Space<T>>, proxy: &Arc<NodeProxy<T>>, slot: usize) {
    let dead_rx = proxy.watch_dead();

    // Freshly registered slots stay idle until a root computation activates
    // the pool, so work never races ahead of shared-state seeding.
    let mut activation = space.activation();
    while !*activation.borrow() {
        tokio::select! {
            changed = activation.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = dead(dead_rx.clone()) => return,
        }
    }
    debug!(node = %proxy.id, slot, "execution slot active");

    loop {
        let item = tokio::select! {
            item = space.next_ready() => item,
            _ = dead(dead_rx.clone()) => return,
        };
        let task_id = item.id();

        let (report_tx, report_rx) = oneshot::channel();
        proxy.pending.insert(task_id, report_tx);
        let dispatch = Frame::Execute {
            item: item.clone(),
            shared: space.shared_snapshot(),
        };
        if !proxy.send(dispatch) {
            proxy.pending.remove(&task_id);
            warn!(node = %proxy.id, task = task_id, "dispatch failed; task returned to ready queue");
            space.enqueue(item);
            return;
        }

        // Biased: a report that raced the node's death still counts as
        // processed; requeueing it would execute the task twice.
        tokio::select! {
            biased;
            report = report_rx => match report {
                Ok(report) => space.process_result(&item, report.outcome, report.run_time),
                Err(_) => {
                    warn!(node = %proxy.id, task = task_id, "node lost with task in flight; task returned to ready queue");
                    space.enqueue(item);
                    return;
                }
            },
            _ = dead(dead_rx.clone()) => {
                proxy.pending.remove(&task_id);
                warn!(node = %proxy.id, task = task_id, "node lost with task in flight; task returned to ready queue");
                space.enqueue(item);
                return;
            }
        }
    }
}
