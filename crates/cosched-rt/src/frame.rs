// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Frames: the resumable computations a task is made of.
//!
//! A frame is an explicit state machine. Each `resume` runs it up to its next
//! suspension point and reports what it wants via `Step`. Frames never touch
//! the scheduler directly.

use std::fmt;
use std::net::SocketAddr;

use crate::error::TaskError;
use crate::socket::CoSocket;
use crate::syscall::{Handle, SystemCall};
use crate::task::TaskId;

/// One suspendable computation.
pub trait Frame: fmt::Debug {
    /// Advance to the next suspension point.
    fn resume(&mut self, input: Resume) -> Step;
}

/// What a frame is handed when it is resumed.
#[derive(Debug)]
pub enum Resume {
    /// First step, after pushing a child, or after a wait completed.
    Nothing,
    /// A child frame returned, or a spawn produced a task id.
    Value(Value),
    /// A child frame failed and the fault was not handled below us.
    Fault(TaskError),
}

impl Resume {
    /// Turn a child's fault into an `Err` so frames can match on one shape.
    pub fn into_result(self) -> Result<Option<Value>, TaskError> {
        match self {
            Resume::Nothing => Ok(None),
            Resume::Value(v) => Ok(Some(v)),
            Resume::Fault(err) => Err(err),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Resume::Nothing => "nothing",
            Resume::Value(v) => v.kind(),
            Resume::Fault(_) => "fault",
        }
    }
}

/// What a frame produced on its step.
#[derive(Debug)]
pub enum Step {
    /// Hand a system call to the scheduler.
    Call(SystemCall),
    /// Suspend beneath a new child frame.
    Delegate(Box<dyn Frame>),
    /// Go to the back of the ready queue without waiting on anything.
    Yield,
    /// Final value; the frame is done.
    Return(Value),
    /// Unrecoverable fault; the frame is done.
    Fail(TaskError),
}

impl Step {
    pub fn read_wait(handle: Handle) -> Self {
        Step::Call(SystemCall::ReadWait(handle))
    }

    pub fn write_wait(handle: Handle) -> Self {
        Step::Call(SystemCall::WriteWait(handle))
    }

    pub fn spawn(frame: impl Frame + 'static) -> Self {
        Step::Call(SystemCall::Spawn(Box::new(frame)))
    }

    pub fn delegate(frame: impl Frame + 'static) -> Self {
        Step::Delegate(Box::new(frame))
    }
}

/// Values passed between frames.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unit,
    Int(i64),
    Bytes(Vec<u8>),
    Text(String),
    Task(TaskId),
    Socket(CoSocket),
    Accepted { socket: CoSocket, peer: SocketAddr },
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Unit => "unit",
            Value::Int(_) => "int",
            Value::Bytes(_) => "bytes",
            Value::Text(_) => "text",
            Value::Task(_) => "task",
            Value::Socket(_) => "socket",
            Value::Accepted { .. } => "accepted",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_task(&self) -> Option<TaskId> {
        match self {
            Value::Task(id) => Some(*id),
            _ => None,
        }
    }

    pub fn into_accepted(self) -> Option<(CoSocket, SocketAddr)> {
        match self {
            Value::Accepted { socket, peer } => Some((socket, peer)),
            _ => None,
        }
    }
}

/// Frame built from a closure. Handy for small tasks and tests.
pub struct FnFrame<F> {
    name: &'static str,
    f: F,
}

/// Wrap `f` as a frame. `name` shows up in logs.
pub fn from_fn<F>(name: &'static str, f: F) -> FnFrame<F>
where
    F: FnMut(Resume) -> Step,
{
    FnFrame { name, f }
}

impl<F> Frame for FnFrame<F>
where
    F: FnMut(Resume) -> Step,
{
    fn resume(&mut self, input: Resume) -> Step {
        (self.f)(input)
    }
}

impl<F> fmt::Debug for FnFrame<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnFrame").field("name", &self.name).finish()
    }
}
