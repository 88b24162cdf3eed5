use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, SpaceError};
use crate::model::{Outcome, TaskId, TaskUnit, WorkItem};

/// Hard cap on a single frame. Large enough for a sizeable result grid,
/// small enough to reject a corrupt length prefix outright.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Everything that travels between a compute node (or client) and the space.
///
/// One TCP connection carries one peer; the first frame identifies it:
/// `Register` for a compute node, `Submit` for a remote client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "T: TaskUnit")]
pub enum Frame<T: TaskUnit> {
    /// Node -> space. Admits the node with `workers` parallel execution slots.
    Register { workers: usize },
    /// Space -> node. Dispatch one unit of work, opportunistically
    /// piggybacking the space's current shared value so the node merges it
    /// before executing.
    Execute {
        item: WorkItem<T>,
        shared: Option<T::Shared>,
    },
    /// Node -> space. Outcome of a dispatched unit, with its wall time.
    Report {
        task_id: TaskId,
        outcome: Outcome<T>,
        run_time: std::time::Duration,
    },
    /// Node -> space. The node's copy improved; here is a duplicate.
    SharedUp(T::Shared),
    /// Space -> node. The space's copy improved (or was seeded).
    SharedDown(T::Shared),
    /// Client -> space. Run a root computation to completion.
    Submit {
        task: T,
        shared: Option<T::Shared>,
    },
    /// Space -> client. The client-visible final answer.
    Final { value: T::Value },
    /// Space -> node. Orderly teardown.
    Shutdown,
}

/// Write one length-prefixed bincode frame.
pub async fn write_frame<T, W>(writer: &mut W, frame: &Frame<T>) -> Result<()>
where
    T: TaskUnit,
    W: AsyncWrite + Unpin,
{
    let payload = bincode::serialize(frame)?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(SpaceError::FrameTooLarge {
            length: payload.len(),
            limit: MAX_FRAME_BYTES,
        });
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed bincode frame.
///
/// A peer hanging up between frames surfaces as
/// [`SpaceError::ConnectionClosed`], which callers treat as an orderly end of
/// stream rather than a protocol fault.
pub async fn read_frame<T, R>(reader: &mut R) -> Result<Frame<T>>
where
    T: TaskUnit,
    R: AsyncRead + Unpin,
{
    let mut length_buf = [0u8; 4];
    if let Err(error) = reader.read_exact(&mut length_buf).await {
        return Err(match error.kind() {
            std::io::ErrorKind::UnexpectedEof => SpaceError::ConnectionClosed,
            _ => SpaceError::Io(error),
        });
    }
    let length = u32::from_be_bytes(length_buf) as usize;
    if length > MAX_FRAME_BYTES {
        return Err(SpaceError::FrameTooLarge {
            length,
            limit: MAX_FRAME_BYTES,
        });
    }

    let mut payload = vec![0u8; length];
    if let Err(error) = reader.read_exact(&mut payload).await {
        return Err(match error.kind() {
            std::io::ErrorKind::UnexpectedEof => SpaceError::ConnectionClosed,
            _ => SpaceError::Io(error),
        });
    }
    Ok(bincode::deserialize(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ComposeId, TaskHeader};
    use crate::shared::{TaskContext, Unshared};
    use crate::model::Decomposition;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Echo(String);

    impl TaskUnit for Echo {
        type Value = String;
        type Shared = Unshared;

        fn is_atomic(&self) -> bool {
            true
        }

        fn solve(&self, _ctx: &TaskContext<Unshared>) -> String {
            self.0.clone()
        }

        fn decompose(&self) -> Decomposition<Self> {
            unreachable!()
        }

        fn compose(&self, args: Vec<String>) -> String {
            args.join("")
        }
    }

    #[tokio::test]
    async fn frames_round_trip_over_a_duplex_pipe() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let sent = Frame::Execute {
            item: WorkItem::Task {
                header: TaskHeader {
                    id: 3,
                    compose_id: ComposeId(2),
                    arg_slot: 1,
                },
                task: Echo("hello".into()),
            },
            shared: None,
        };
        write_frame(&mut client, &sent).await.unwrap();
        write_frame(&mut client, &Frame::<Echo>::Shutdown).await.unwrap();

        match read_frame::<Echo, _>(&mut server).await.unwrap() {
            Frame::Execute {
                item: WorkItem::Task { header, task },
                shared: None,
            } => {
                assert_eq!(header.id, 3);
                assert_eq!(header.compose_id, ComposeId(2));
                assert_eq!(header.arg_slot, 1);
                assert_eq!(task, Echo("hello".into()));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert!(matches!(
            read_frame::<Echo, _>(&mut server).await.unwrap(),
            Frame::Shutdown
        ));
    }

    #[tokio::test]
    async fn hangup_between_frames_reads_as_connection_closed() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(matches!(
            read_frame::<Echo, _>(&mut server).await,
            Err(SpaceError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn corrupt_length_prefix_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut client, &u32::MAX.to_be_bytes())
            .await
            .unwrap();
        assert!(matches!(
            read_frame::<Echo, _>(&mut server).await,
            Err(SpaceError::FrameTooLarge { .. })
        ));
    }
}
