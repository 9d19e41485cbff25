// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Socket adapter.
//!
//! `CoSocket` wraps a raw non-blocking stream. bind/listen/close are plain
//! calls. connect/accept/send/recv return frames that wait for readiness via
//! system calls and then issue the raw operation; a task delegates to them
//! with `Step::delegate`.
//!
//! A raw call that still reports `WouldBlock` after readiness (spurious
//! wakeup, connect in progress) waits again. Any other error fails the frame
//! with `TaskError::Io`, which unwinds into the delegating frame.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use crate::error::TaskError;
use crate::frame::{Frame, Resume, Step, Value};
use crate::syscall::Handle;

/// Raw byte-stream primitive. None of these calls suspend.
///
/// Implementations are non-blocking: an operation that can't make progress
/// returns `io::ErrorKind::WouldBlock`.
pub trait RawStream: fmt::Debug {
    /// Stable identity, used as the wait-registry key.
    fn handle(&self) -> Handle;
    fn bind(&self, addr: SocketAddr) -> io::Result<()>;
    fn listen(&self, backlog: u32) -> io::Result<()>;
    fn accept(&self) -> io::Result<(Rc<dyn RawStream>, SocketAddr)>;
    /// Start or finish connecting. `Ok` once connected.
    fn connect(&self, addr: SocketAddr) -> io::Result<()>;
    /// Read at most `max` bytes. Empty means the peer closed its side.
    fn read(&self, max: usize) -> io::Result<Vec<u8>>;
    /// Write a prefix of `buf`, returning how much was taken.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;
    fn close(&self) -> io::Result<()>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Socket wrapper whose suspending operations are frames.
#[derive(Clone)]
pub struct CoSocket {
    raw: Rc<dyn RawStream>,
}

impl CoSocket {
    pub fn new(raw: impl RawStream + 'static) -> Self {
        Self { raw: Rc::new(raw) }
    }

    pub fn from_shared(raw: Rc<dyn RawStream>) -> Self {
        Self { raw }
    }

    pub fn handle(&self) -> Handle {
        self.raw.handle()
    }

    pub fn raw(&self) -> &Rc<dyn RawStream> {
        &self.raw
    }

    pub fn bind(&self, addr: SocketAddr) -> Result<(), TaskError> {
        self.raw.bind(addr).map_err(|e| self.fault("bind", e))
    }

    pub fn listen(&self, backlog: u32) -> Result<(), TaskError> {
        self.raw.listen(backlog).map_err(|e| self.fault("listen", e))
    }

    pub fn close(&self) -> Result<(), TaskError> {
        self.raw.close().map_err(|e| self.fault("close", e))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TaskError> {
        self.raw.local_addr().map_err(|e| self.fault("local_addr", e))
    }

    /// Wait for writability, then connect. Returns `Value::Unit`.
    pub fn connect(&self, addr: SocketAddr) -> Connect {
        Connect {
            socket: self.clone(),
            addr,
            waited: false,
        }
    }

    /// Wait for readability, then accept. Returns `Value::Accepted`.
    pub fn accept(&self) -> Accept {
        Accept {
            socket: self.clone(),
            waited: false,
        }
    }

    /// Write all of `data`, one readiness wait per partial write.
    /// Returns `Value::Int(total)`.
    pub fn send(&self, data: impl Into<Vec<u8>>) -> SendAll {
        SendAll {
            socket: self.clone(),
            data: data.into(),
            cursor: 0,
            waited: false,
        }
    }

    /// Wait for readability, then read at most `max` bytes.
    /// Returns `Value::Bytes`; empty means end of stream.
    pub fn recv(&self, max: usize) -> Recv {
        Recv {
            socket: self.clone(),
            max,
            waited: false,
        }
    }

    fn fault(&self, op: &'static str, err: io::Error) -> TaskError {
        TaskError::io(self.handle(), op, err)
    }
}

impl fmt::Debug for CoSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoSocket").field("handle", &self.handle()).finish()
    }
}

impl PartialEq for CoSocket {
    fn eq(&self, other: &Self) -> bool {
        self.handle() == other.handle()
    }
}

fn would_block(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Adapter frames never delegate; any fault they are handed goes straight up.
fn forward_fault(input: Resume) -> Option<Step> {
    match input {
        Resume::Fault(err) => Some(Step::Fail(err)),
        _ => None,
    }
}

#[derive(Debug)]
pub struct Connect {
    socket: CoSocket,
    addr: SocketAddr,
    waited: bool,
}

impl Frame for Connect {
    fn resume(&mut self, input: Resume) -> Step {
        if let Some(step) = forward_fault(input) {
            return step;
        }
        let handle = self.socket.handle();
        if !self.waited {
            self.waited = true;
            return Step::write_wait(handle);
        }
        match self.socket.raw.connect(self.addr) {
            Ok(()) => Step::Return(Value::Unit),
            Err(e) if would_block(&e) => Step::write_wait(handle),
            Err(e) => Step::Fail(TaskError::io(handle, "connect", e)),
        }
    }
}

#[derive(Debug)]
pub struct Accept {
    socket: CoSocket,
    waited: bool,
}

impl Frame for Accept {
    fn resume(&mut self, input: Resume) -> Step {
        if let Some(step) = forward_fault(input) {
            return step;
        }
        let handle = self.socket.handle();
        if !self.waited {
            self.waited = true;
            return Step::read_wait(handle);
        }
        match self.socket.raw.accept() {
            Ok((raw, peer)) => Step::Return(Value::Accepted {
                socket: CoSocket::from_shared(raw),
                peer,
            }),
            Err(e) if would_block(&e) => Step::read_wait(handle),
            Err(e) => Step::Fail(TaskError::io(handle, "accept", e)),
        }
    }
}

#[derive(Debug)]
pub struct SendAll {
    socket: CoSocket,
    data: Vec<u8>,
    /// First byte not yet written.
    cursor: usize,
    waited: bool,
}

impl SendAll {
    /// Bytes not yet accepted by the stream.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }
}

impl Frame for SendAll {
    fn resume(&mut self, input: Resume) -> Step {
        if let Some(step) = forward_fault(input) {
            return step;
        }
        let handle = self.socket.handle();
        if self.cursor >= self.data.len() {
            return Step::Return(Value::Int(self.data.len() as i64));
        }
        if !self.waited {
            self.waited = true;
            return Step::write_wait(handle);
        }
        self.waited = false;
        match self.socket.raw.write(&self.data[self.cursor..]) {
            Ok(0) => {
                return Step::Fail(TaskError::io(handle, "send", io::ErrorKind::WriteZero.into()));
            }
            Ok(n) => self.cursor += n,
            Err(e) if would_block(&e) => {}
            Err(e) => return Step::Fail(TaskError::io(handle, "send", e)),
        }
        if self.cursor >= self.data.len() {
            return Step::Return(Value::Int(self.data.len() as i64));
        }
        self.waited = true;
        Step::write_wait(handle)
    }
}

#[derive(Debug)]
pub struct Recv {
    socket: CoSocket,
    max: usize,
    waited: bool,
}

impl Frame for Recv {
    fn resume(&mut self, input: Resume) -> Step {
        if let Some(step) = forward_fault(input) {
            return step;
        }
        let handle = self.socket.handle();
        if !self.waited {
            self.waited = true;
            return Step::read_wait(handle);
        }
        match self.socket.raw.read(self.max) {
            Ok(bytes) => Step::Return(Value::Bytes(bytes)),
            Err(e) if would_block(&e) => Step::read_wait(handle),
            Err(e) => Step::Fail(TaskError::io(handle, "recv", e)),
        }
    }
}
