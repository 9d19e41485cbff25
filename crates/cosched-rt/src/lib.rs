// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative task scheduler over an I/O readiness reactor.
//!
//! One thread, many tasks. A task is a stack of frames; the active frame is
//! resumed once per step and answers with a `Step`: a system call, a nested
//! frame to delegate to, a value for its parent, or a fault. The scheduler
//! owns the ready queue and the read/write wait registries and alternates
//! between polling the multiplexer and draining the ready queue.
//!
//! Components:
//! - `frame`: Frame trait, Resume/Step vocabulary, Value
//! - `syscall`: Handle and the closed SystemCall set
//! - `task`: Task, delegation stack, Outcome
//! - `scheduler`: reactor loop, dispatch, stats
//! - `config`: scheduler knobs
//! - `poller`: Multiplexer trait + poll(2) implementation
//! - `socket`: RawStream trait + CoSocket adapter frames
//! - `net`: non-blocking TCP handle over libc
//! - `sim`: in-memory network for deterministic runs
//! - `error`: task faults and scheduler-fatal errors

pub mod config;
pub mod error;
pub mod frame;
pub mod net;
pub mod poller;
pub mod scheduler;
pub mod sim;
pub mod socket;
pub mod syscall;
pub mod task;

pub use config::SchedulerConfig;
pub use error::{SchedulerError, TaskError};
pub use frame::{from_fn, FnFrame, Frame, Resume, Step, Value};
pub use net::TcpSocket;
pub use poller::{Multiplexer, PollMultiplexer, Readiness};
pub use scheduler::{Exit, RunReport, Scheduler, SchedulerStats};
pub use socket::{Accept, CoSocket, Connect, RawStream, Recv, SendAll};
pub use syscall::{Direction, Handle, SystemCall};
pub use task::{Outcome, Task, TaskId};
