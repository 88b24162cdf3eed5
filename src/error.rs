use std::io;
use thiserror::Error;

/// Errors surfaced by the coordination layer.
///
/// Join-table invariant violations (double insert, slot double-write, unknown
/// compose id) are deliberately NOT represented here: they indicate a broken
/// task DAG and abort the process instead of propagating.
#[derive(Error, Debug)]
pub enum SpaceError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("frame of {length} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { length: usize, limit: usize },

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("unexpected frame: expected {expected}")]
    UnexpectedFrame { expected: &'static str },

    #[error("space is shutting down")]
    Shutdown,

    #[error("task execution panicked: {0}")]
    ExecutionPanicked(String),
}

pub type Result<T, E = SpaceError> = std::result::Result<T, E>;
