// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Error types.
//!
//! `TaskError` is a fault inside one task. It travels up that task's frame
//! stack and, if nobody handles it, kills only that task. `SchedulerError`
//! aborts the reactor loop itself.

use std::io;

use crate::syscall::{Direction, Handle};
use crate::task::TaskId;

/// A fault raised by a frame.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("{op} on handle {handle} failed: {source}")]
    Io {
        handle: Handle,
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{frame} was resumed with {got}, expected {expected}")]
    UnexpectedResume {
        frame: &'static str,
        expected: &'static str,
        got: &'static str,
    },

    #[error("{0}")]
    Custom(String),
}

impl TaskError {
    pub fn io(handle: Handle, op: &'static str, source: io::Error) -> Self {
        TaskError::Io { handle, op, source }
    }

    pub fn custom(msg: impl Into<String>) -> Self {
        TaskError::Custom(msg.into())
    }

    /// The OS error kind, for I/O faults.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            TaskError::Io { source, .. } => Some(source.kind()),
            _ => None,
        }
    }
}

/// Errors that stop the reactor loop.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Two tasks asked to wait on the same handle in the same direction.
    #[error("{requester} asked to {direction}-wait on handle {handle}, already held by {waiting}")]
    WaitConflict {
        handle: Handle,
        direction: Direction,
        waiting: TaskId,
        requester: TaskId,
    },

    /// The multiplexer failed (bad descriptor, OS error).
    #[error("readiness poll failed: {0}")]
    Poll(#[source] io::Error),
}
