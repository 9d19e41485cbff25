// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Single-threaded reactor scheduler.
//!
//! Each pass: if any task waits on a handle, poll the multiplexer (without
//! blocking when something is already runnable) and promote ready waiters;
//! then drain the ready queue, stepping each task once per turn in FIFO
//! order. The loop returns when no task is left or the pass budget runs out.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use indexmap::IndexMap;
use log::{debug, trace, warn};

use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, TaskError};
use crate::frame::{Frame, Resume, Value};
use crate::poller::Multiplexer;
use crate::syscall::{Direction, Handle, SystemCall};
use crate::task::{Outcome, Task, TaskId};

/// Counters kept across runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SchedulerStats {
    pub spawned: u64,
    pub completed: u64,
    pub failed: u64,
    pub steps: u64,
    pub passes: u64,
    pub polls: u64,
    pub read_waits: u64,
    pub write_waits: u64,
}

/// Why `run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Exit {
    /// Every task completed.
    Drained,
    /// The pass budget ran out with tasks still alive.
    BudgetExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct RunReport {
    pub exit: Exit,
    /// Passes made by this call.
    pub passes: u64,
    /// Tasks still alive.
    pub live: usize,
    pub stats: SchedulerStats,
}

/// Owns every task from spawn to completion.
///
/// A task is always in exactly one place: the ready queue, one wait map, or
/// the local variable of the pass currently stepping it.
pub struct Scheduler<M> {
    poller: M,
    config: SchedulerConfig,
    ready: VecDeque<Task>,
    read_waiting: IndexMap<Handle, Task>,
    write_waiting: IndexMap<Handle, Task>,
    live: usize,
    next_id: u64,
    stats: SchedulerStats,
}

impl<M: Multiplexer> Scheduler<M> {
    pub fn new(poller: M) -> Self {
        Self::with_config(poller, SchedulerConfig::default())
    }

    pub fn with_config(poller: M, config: SchedulerConfig) -> Self {
        Self {
            poller,
            config,
            ready: VecDeque::new(),
            read_waiting: IndexMap::new(),
            write_waiting: IndexMap::new(),
            live: 0,
            next_id: 1,
            stats: SchedulerStats::default(),
        }
    }

    /// Create a task rooted at `frame` and queue it.
    pub fn spawn(&mut self, frame: impl Frame + 'static) -> TaskId {
        self.spawn_boxed(Box::new(frame))
    }

    pub fn spawn_boxed(&mut self, frame: Box<dyn Frame>) -> TaskId {
        let id = TaskId::new(self.next_id);
        self.next_id += 1;
        self.live += 1;
        self.stats.spawned += 1;
        debug!("spawned {} ({:?})", id, frame);
        self.ready.push_back(Task::new(id, frame));
        id
    }

    /// Tasks created and not yet completed.
    pub fn live_tasks(&self) -> usize {
        self.live
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn is_waiting(&self, direction: Direction, handle: Handle) -> bool {
        match direction {
            Direction::Read => self.read_waiting.contains_key(&handle),
            Direction::Write => self.write_waiting.contains_key(&handle),
        }
    }

    /// Handles currently parked in the read-wait map, in registration order.
    pub fn read_waiters(&self) -> impl Iterator<Item = Handle> + '_ {
        self.read_waiting.keys().copied()
    }

    /// Handles currently parked in the write-wait map, in registration order.
    pub fn write_waiters(&self) -> impl Iterator<Item = Handle> + '_ {
        self.write_waiting.keys().copied()
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn poller(&self) -> &M {
        &self.poller
    }

    pub fn poller_mut(&mut self) -> &mut M {
        &mut self.poller
    }

    /// Run with the configured pass budget.
    pub fn run(&mut self) -> Result<RunReport, SchedulerError> {
        self.run_passes(self.config.pass_budget)
    }

    /// Run at most `budget` passes (`None`: until every task completed).
    ///
    /// Returning on budget leaves all tasks in place; calling again resumes.
    pub fn run_passes(&mut self, budget: Option<usize>) -> Result<RunReport, SchedulerError> {
        let mut passes = 0u64;
        let mut remaining = budget;

        while self.live > 0 {
            if remaining == Some(0) {
                return Ok(self.report(Exit::BudgetExhausted, passes));
            }
            debug_assert!(
                !self.ready.is_empty()
                    || !self.read_waiting.is_empty()
                    || !self.write_waiting.is_empty(),
                "{} live tasks but none queued or waiting",
                self.live
            );

            if !self.read_waiting.is_empty() || !self.write_waiting.is_empty() {
                self.poll_readiness()?;
            }
            self.drain_ready()?;

            passes += 1;
            self.stats.passes += 1;
            if let Some(n) = remaining.as_mut() {
                *n -= 1;
            }
        }

        Ok(self.report(Exit::Drained, passes))
    }

    fn report(&self, exit: Exit, passes: u64) -> RunReport {
        RunReport {
            exit,
            passes,
            live: self.live,
            stats: self.stats,
        }
    }

    /// Ask the multiplexer which waited-on handles are ready and move their
    /// tasks to the ready queue. Reads are promoted before writes; within a
    /// map, in registration order.
    fn poll_readiness(&mut self) -> Result<(), SchedulerError> {
        let timeout = if self.ready.is_empty() {
            self.config.poll_timeout
        } else {
            Some(Duration::ZERO)
        };
        let reads: Vec<Handle> = self.read_waiting.keys().copied().collect();
        let writes: Vec<Handle> = self.write_waiting.keys().copied().collect();

        self.stats.polls += 1;
        let readiness = self
            .poller
            .poll(&reads, &writes, timeout)
            .map_err(SchedulerError::Poll)?;
        trace!(
            "poll: {} readable, {} writable (timeout {:?})",
            readiness.readable.len(),
            readiness.writable.len(),
            timeout
        );

        promote(&mut self.read_waiting, &readiness.readable, &mut self.ready);
        promote(&mut self.write_waiting, &readiness.writable, &mut self.ready);
        Ok(())
    }

    fn drain_ready(&mut self) -> Result<(), SchedulerError> {
        while let Some(mut task) = self.ready.pop_front() {
            self.stats.steps += 1;
            let outcome = task.step();
            trace!("{} step {}: {:?}", task.id(), task.steps(), outcome);

            if outcome.is_terminal() {
                self.retire(task.id(), outcome);
                continue;
            }
            match outcome {
                Outcome::SystemCallRequested(call) => self.dispatch(call, task)?,
                _ => self.ready.push_back(task),
            }
        }
        Ok(())
    }

    fn retire(&mut self, id: TaskId, outcome: Outcome) {
        match outcome {
            Outcome::Crashed(err) => {
                warn!("{} died: {}", id, err);
                self.stats.failed += 1;
            }
            other => {
                debug!("{} finished: {:?}", id, other);
                self.stats.completed += 1;
            }
        }
        self.live -= 1;
    }

    fn dispatch(&mut self, call: SystemCall, mut task: Task) -> Result<(), SchedulerError> {
        if let Some((direction, handle)) = call.wait_target() {
            return self.park(direction, handle, task);
        }
        if let SystemCall::Spawn(frame) = call {
            let child = self.spawn_boxed(frame);
            task.set_resume(Resume::Value(Value::Task(child)));
        }
        self.ready.push_back(task);
        Ok(())
    }

    /// On a conflict the requester goes back to the front of the ready queue
    /// with the conflict as its pending fault, so a later `run` picks up
    /// where this one stopped.
    fn park(&mut self, direction: Direction, handle: Handle, mut task: Task) -> Result<(), SchedulerError> {
        let (waiting, counter) = match direction {
            Direction::Read => (&mut self.read_waiting, &mut self.stats.read_waits),
            Direction::Write => (&mut self.write_waiting, &mut self.stats.write_waits),
        };
        if let Some(holder) = waiting.get(&handle) {
            let err = SchedulerError::WaitConflict {
                handle,
                direction,
                waiting: holder.id(),
                requester: task.id(),
            };
            task.set_resume(Resume::Fault(TaskError::custom(err.to_string())));
            self.ready.push_front(task);
            return Err(err);
        }
        *counter += 1;
        debug!("{} waits to {} {}", task.id(), direction, handle);
        waiting.insert(handle, task);
        Ok(())
    }
}

/// Move the tasks parked on `ready` handles to the back of `queue`,
/// preserving the map's registration order.
fn promote(waiting: &mut IndexMap<Handle, Task>, ready: &[Handle], queue: &mut VecDeque<Task>) {
    if ready.is_empty() {
        return;
    }
    let ready: HashSet<Handle> = ready.iter().copied().collect();
    let parked = std::mem::take(waiting);
    for (handle, task) in parked {
        if ready.contains(&handle) {
            trace!("{} ready on {}", task.id(), handle);
            queue.push_back(task);
        } else {
            waiting.insert(handle, task);
        }
    }
}
