// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! System calls: the only way a task talks to the scheduler.

use std::fmt;
use std::os::unix::io::RawFd;

use crate::frame::Frame;

/// Stable identity of a raw byte-stream handle. Used as the wait-registry key.
///
/// For OS sockets this is the file descriptor; the simulated network hands
/// out its own numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Handle(u64);

impl Handle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn from_raw_fd(fd: RawFd) -> Self {
        Self(fd as u64)
    }

    pub fn as_raw_fd(self) -> RawFd {
        self.0 as RawFd
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which readiness a task is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => write!(f, "read"),
            Direction::Write => write!(f, "write"),
        }
    }
}

/// A scheduling request emitted by a frame instead of a value.
///
/// Consumed exactly once by the scheduler's dispatch.
#[derive(Debug)]
pub enum SystemCall {
    /// Park the task until `Handle` is readable.
    ReadWait(Handle),
    /// Park the task until `Handle` is writable.
    WriteWait(Handle),
    /// Start a new task rooted at the given frame. The caller keeps running
    /// and is resumed with `Value::Task(new_id)`.
    Spawn(Box<dyn Frame>),
}

impl SystemCall {
    /// The handle and direction for the two wait calls.
    pub fn wait_target(&self) -> Option<(Direction, Handle)> {
        match self {
            SystemCall::ReadWait(handle) => Some((Direction::Read, *handle)),
            SystemCall::WriteWait(handle) => Some((Direction::Write, *handle)),
            SystemCall::Spawn(_) => None,
        }
    }
}
