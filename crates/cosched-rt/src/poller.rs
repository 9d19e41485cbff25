// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Readiness multiplexer.
//!
//! The scheduler only sees the `Multiplexer` trait. `PollMultiplexer` is the
//! OS implementation over `poll(2)`; the simulated network has its own.

use std::io;
use std::time::Duration;

use crate::syscall::Handle;

/// Handles found ready by one poll, in the order they were asked about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: Vec<Handle>,
    pub writable: Vec<Handle>,
}

impl Readiness {
    pub fn is_empty(&self) -> bool {
        self.readable.is_empty() && self.writable.is_empty()
    }
}

/// Blocks until at least one handle is ready or the timeout elapses.
///
/// `None` blocks indefinitely, `Some(Duration::ZERO)` returns immediately.
/// A timeout with nothing ready yields an empty `Readiness`.
pub trait Multiplexer {
    fn poll(
        &mut self,
        reads: &[Handle],
        writes: &[Handle],
        timeout: Option<Duration>,
    ) -> io::Result<Readiness>;
}

impl<M: Multiplexer + ?Sized> Multiplexer for Box<M> {
    fn poll(
        &mut self,
        reads: &[Handle],
        writes: &[Handle],
        timeout: Option<Duration>,
    ) -> io::Result<Readiness> {
        (**self).poll(reads, writes, timeout)
    }
}

/// `poll(2)` over raw file descriptors.
///
/// Level-triggered. A handle present in both sets shares one `pollfd`.
/// `POLLHUP`/`POLLERR` count as ready in whichever direction was asked for,
/// so the waiting task resumes and sees the error from its raw call.
#[derive(Debug, Default)]
pub struct PollMultiplexer {
    fds: Vec<libc::pollfd>,
}

impl PollMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }
}

const READ_READY: libc::c_short = libc::POLLIN | libc::POLLHUP | libc::POLLERR;
const WRITE_READY: libc::c_short = libc::POLLOUT | libc::POLLHUP | libc::POLLERR;

impl Multiplexer for PollMultiplexer {
    fn poll(
        &mut self,
        reads: &[Handle],
        writes: &[Handle],
        timeout: Option<Duration>,
    ) -> io::Result<Readiness> {
        self.fds.clear();
        for h in reads {
            self.fds.push(libc::pollfd {
                fd: h.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
        }
        let mut write_slots = Vec::with_capacity(writes.len());
        for h in writes {
            let fd = h.as_raw_fd();
            let slot = match self.fds[..reads.len()].iter().position(|p| p.fd == fd) {
                Some(i) => {
                    self.fds[i].events |= libc::POLLOUT;
                    i
                }
                None => {
                    self.fds.push(libc::pollfd {
                        fd,
                        events: libc::POLLOUT,
                        revents: 0,
                    });
                    self.fds.len() - 1
                }
            };
            write_slots.push(slot);
        }

        let n = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_millis(timeout),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Readiness::default()); // EINTR: caller polls again next pass.
            }
            return Err(err);
        }

        let mut ready = Readiness::default();
        if n == 0 {
            return Ok(ready);
        }

        if let Some(bad) = self.fds.iter().find(|p| p.revents & libc::POLLNVAL != 0) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("handle {} is not an open descriptor", Handle::from_raw_fd(bad.fd)),
            ));
        }

        for (i, h) in reads.iter().enumerate() {
            if self.fds[i].revents & READ_READY != 0 {
                ready.readable.push(*h);
            }
        }
        for (h, &slot) in writes.iter().zip(&write_slots) {
            if self.fds[slot].revents & WRITE_READY != 0 {
                ready.writable.push(*h);
            }
        }
        Ok(ready)
    }
}

/// poll(2) takes milliseconds; round up so short timeouts don't spin.
fn timeout_millis(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let ms = d.as_nanos().div_ceil(1_000_000);
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}
