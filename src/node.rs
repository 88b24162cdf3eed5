use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tracing::{error, info, warn};

use crate::config::NodeConfig;
use crate::error::{Result, SpaceError};
use crate::model::{Outcome, TaskUnit, WorkItem};
use crate::shared::{SharedCell, TaskContext};
use crate::wire::{read_frame, write_frame, Frame};

/// A compute node: executes dispatched work items and owns the single local
/// copy of the replicated shared value.
pub struct ComputeNode<T: TaskUnit> {
    shared: Arc<SharedCell<T::Shared>>,
    /// Set when a local merge improved the copy; drained by the upstream
    /// notifier, one push per dirty period.
    up_dirty: Arc<Notify>,
    tasks_executed: AtomicU64,
}

impl<T: TaskUnit> Default for ComputeNode<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TaskUnit> ComputeNode<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(SharedCell::new()),
            up_dirty: Arc::new(Notify::new()),
            tasks_executed: AtomicU64::new(0),
        }
    }

    pub fn tasks_executed(&self) -> u64 {
        self.tasks_executed.load(Ordering::Relaxed)
    }

    /// Accept a value pushed down from the space: monotone merge into the
    /// local copy; a non-newer value is a no-op.
    pub fn pull_shared(&self, value: T::Shared) {
        self.shared.merge(value);
    }

    /// Register with the space and serve fetch-execute-report cycles until the
    /// space shuts down or the connection drops.
    pub async fn run(self: Arc<Self>, config: &NodeConfig) -> Result<()> {
        let stream = TcpStream::connect(config.space_addr()).await?;
        info!(space = %config.space_addr(), workers = config.workers, "node connected");
        let (mut reader, writer) = stream.into_split();

        let (out, out_rx) = mpsc::unbounded_channel::<Frame<T>>();
        let writer_task = tokio::spawn(write_outbound(out_rx, writer));

        out.send(Frame::Register {
            workers: config.workers,
        })
        .map_err(|_| SpaceError::ConnectionClosed)?;

        // Upstream notifier: one coalesced push per dirty period.
        {
            let node = Arc::clone(&self);
            let out = out.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = node.up_dirty.notified() => {
                            let Some(value) = node.shared.snapshot() else { continue };
                            if out.send(Frame::SharedUp(value)).is_err() {
                                break;
                            }
                        }
                        _ = out.closed() => break,
                    }
                }
            });
        }

        // A task panic is indistinguishable from node failure as far as the
        // space is concerned; hang up so the task is re-dispatched elsewhere.
        let hangup = Arc::new(Notify::new());

        let outcome = loop {
            let frame = tokio::select! {
                frame = read_frame::<T, _>(&mut reader) => frame,
                _ = hangup.notified() => break Err(SpaceError::ExecutionPanicked(
                    "task execution panicked".to_string(),
                )),
            };
            match frame {
                Ok(Frame::Execute { item, shared }) => {
                    if let Some(update) = shared {
                        self.pull_shared(update);
                    }
                    let node = Arc::clone(&self);
                    let out = out.clone();
                    let hangup = Arc::clone(&hangup);
                    tokio::spawn(async move {
                        let task_id = item.id();
                        match node.execute(item).await {
                            Ok((outcome, run_time)) => {
                                let _ = out.send(Frame::Report {
                                    task_id,
                                    outcome,
                                    run_time,
                                });
                            }
                            Err(err) => {
                                error!(task = task_id, %err, "task execution failed; dropping connection");
                                hangup.notify_one();
                            }
                        }
                    });
                }
                Ok(Frame::SharedDown(value)) => self.pull_shared(value),
                Ok(Frame::Shutdown) => {
                    info!(tasks = self.tasks_executed(), "node shutting down");
                    break Ok(());
                }
                Ok(_) => warn!("unexpected frame from space"),
                Err(SpaceError::ConnectionClosed) => {
                    info!(tasks = self.tasks_executed(), "space hung up");
                    break Ok(());
                }
                Err(error) => break Err(error),
            }
        };

        drop(out);
        writer_task.abort();
        outcome
    }

    /// Execute one work item: install the shared-value handle as the task's
    /// view of shared state, dispatch on the item kind, measure wall time.
    pub async fn execute(&self, item: WorkItem<T>) -> Result<(Outcome<T>, Duration)> {
        let ctx = TaskContext::new(Arc::clone(&self.shared), Arc::clone(&self.up_dirty));
        let executed = tokio::task::spawn_blocking(move || {
            let started = Instant::now();
            let outcome = match item {
                WorkItem::Task { task, .. } => {
                    if task.is_atomic() {
                        Outcome::Value(task.solve(&ctx))
                    } else {
                        Outcome::Decompose(task.decompose())
                    }
                }
                WorkItem::Join { task, args, .. } => Outcome::Value(task.compose(args)),
            };
            (outcome, started.elapsed())
        })
        .await;

        match executed {
            Ok(pair) => {
                self.tasks_executed.fetch_add(1, Ordering::Relaxed);
                Ok(pair)
            }
            Err(join_error) => Err(SpaceError::ExecutionPanicked(join_error.to_string())),
        }
    }
}

async fn write_outbound<T: TaskUnit>(
    mut out_rx: mpsc::UnboundedReceiver<Frame<T>>,
    mut writer: tokio::net::tcp::OwnedWriteHalf,
) {
    while let Some(frame) = out_rx.recv().await {
        if let Err(error) = write_frame(&mut writer, &frame).await {
            warn!(%error, "write to space failed");
            break;
        }
    }
}
