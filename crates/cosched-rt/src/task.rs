// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task representation.
//!
//! A task is an active frame plus a stack of suspended parents. `step()`
//! resumes the active frame once and does the stack bookkeeping for
//! delegation, returns and faults. It never touches scheduler state.

use std::fmt;
use std::mem;

use crate::error::TaskError;
use crate::frame::{Frame, Resume, Step, Value};
use crate::syscall::SystemCall;

/// Task identity. Assigned by the scheduler, never reused within one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TaskId(u64);

impl TaskId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Result of one `Task::step`.
#[derive(Debug)]
pub enum Outcome {
    /// The frame emitted a system call. The caller owns placement of the task.
    SystemCallRequested(SystemCall),
    /// A child frame was pushed and is now active.
    Delegated,
    /// The active frame returned into its parent.
    Returned,
    /// The active frame failed into its parent.
    Failed,
    /// The frame gave up the processor.
    Yielded,
    /// The bottom frame returned; the task is complete.
    Finished(Value),
    /// The bottom frame failed; the task is complete.
    Crashed(TaskError),
}

impl Outcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Outcome::Finished(_) | Outcome::Crashed(_))
    }
}

/// A unit of concurrency with its own delegation stack.
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    active: Option<Box<dyn Frame>>,
    /// Fed to the active frame on its next step.
    pending: Resume,
    /// Suspended parents, most recent last.
    stack: Vec<Box<dyn Frame>>,
    steps: u64,
}

impl Task {
    pub fn new(id: TaskId, frame: Box<dyn Frame>) -> Self {
        Self {
            id,
            active: Some(frame),
            pending: Resume::Nothing,
            stack: Vec::new(),
            steps: 0,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Frames alive in this task, active one included.
    pub fn depth(&self) -> usize {
        self.stack.len() + usize::from(self.active.is_some())
    }

    pub fn is_complete(&self) -> bool {
        self.active.is_none()
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// The value the active frame will see on its next step.
    pub fn pending(&self) -> &Resume {
        &self.pending
    }

    pub(crate) fn set_resume(&mut self, input: Resume) {
        self.pending = input;
    }

    /// Resume the active frame once.
    ///
    /// # Panics
    ///
    /// Panics if the task already completed.
    pub fn step(&mut self) -> Outcome {
        let Some(frame) = self.active.as_mut() else {
            panic!("{} was resumed after it completed", self.id);
        };
        self.steps += 1;

        let input = mem::replace(&mut self.pending, Resume::Nothing);
        match frame.resume(input) {
            Step::Call(call) => Outcome::SystemCallRequested(call),
            Step::Yield => Outcome::Yielded,
            Step::Delegate(child) => {
                if let Some(parent) = self.active.replace(child) {
                    self.stack.push(parent);
                }
                Outcome::Delegated
            }
            Step::Return(value) => match self.stack.pop() {
                Some(parent) => {
                    self.active = Some(parent);
                    self.pending = Resume::Value(value);
                    Outcome::Returned
                }
                None => {
                    self.active = None;
                    Outcome::Finished(value)
                }
            },
            Step::Fail(err) => match self.stack.pop() {
                Some(parent) => {
                    self.active = Some(parent);
                    self.pending = Resume::Fault(err);
                    Outcome::Failed
                }
                None => {
                    self.active = None;
                    Outcome::Crashed(err)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::from_fn;
    use crate::syscall::Handle;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn task(frame: impl Frame + 'static) -> Task {
        Task::new(TaskId::new(1), Box::new(frame))
    }

    #[test]
    fn single_frame_finishes() {
        let mut t = task(from_fn("leaf", |_| Step::Return(Value::Int(7))));
        assert_eq!(t.depth(), 1);
        match t.step() {
            Outcome::Finished(Value::Int(7)) => {}
            other => panic!("expected Finished(7), got {:?}", other),
        }
        assert!(t.is_complete());
        assert_eq!(t.depth(), 0);
    }

    #[test]
    fn delegation_round_trip_delivers_child_value() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = seen.clone();
        let mut delegated = false;
        let parent = from_fn("parent", move |input| {
            log.borrow_mut().push(input.kind());
            if !delegated {
                delegated = true;
                return Step::delegate(from_fn("child", |_| Step::Return(Value::Int(42))));
            }
            match input {
                Resume::Value(v) => Step::Return(v),
                other => Step::Fail(TaskError::custom(format!("got {:?}", other))),
            }
        });

        let mut t = task(parent);
        assert!(matches!(t.step(), Outcome::Delegated));
        assert_eq!(t.depth(), 2);
        assert!(matches!(t.pending(), Resume::Nothing));

        assert!(matches!(t.step(), Outcome::Returned));
        assert_eq!(t.depth(), 1);
        assert!(matches!(t.pending(), Resume::Value(Value::Int(42))));

        assert!(matches!(t.step(), Outcome::Finished(Value::Int(42))));
        assert_eq!(*seen.borrow(), vec!["nothing", "int"]);
    }

    #[test]
    fn fault_unwinds_to_parent_that_handles_it() {
        let mut delegated = false;
        let parent = from_fn("parent", move |input| {
            if !delegated {
                delegated = true;
                return Step::delegate(from_fn("child", |_| {
                    Step::Fail(TaskError::custom("child broke"))
                }));
            }
            match input.into_result() {
                Err(err) => Step::Return(Value::Text(err.to_string())),
                Ok(_) => Step::Return(Value::Unit),
            }
        });

        let mut t = task(parent);
        assert!(matches!(t.step(), Outcome::Delegated));
        assert!(matches!(t.step(), Outcome::Failed));
        match t.step() {
            Outcome::Finished(Value::Text(msg)) => assert_eq!(msg, "child broke"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn unhandled_fault_crashes_task() {
        let mut delegated = false;
        let parent = from_fn("rethrow", move |input| {
            if !delegated {
                delegated = true;
                return Step::delegate(from_fn("child", |_| Step::Fail(TaskError::custom("deep"))));
            }
            match input.into_result() {
                Err(err) => Step::Fail(err),
                Ok(_) => Step::Return(Value::Unit),
            }
        });

        let mut t = task(parent);
        t.step();
        t.step();
        match t.step() {
            Outcome::Crashed(err) => assert_eq!(err.to_string(), "deep"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(t.is_complete());
    }

    #[test]
    fn system_call_leaves_stack_alone() {
        let mut t = task(from_fn("reader", |_| Step::read_wait(Handle::new(5))));
        match t.step() {
            Outcome::SystemCallRequested(SystemCall::ReadWait(h)) => assert_eq!(h, Handle::new(5)),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(t.depth(), 1);
        assert_eq!(t.steps(), 1);
    }

    #[test]
    #[should_panic(expected = "resumed after it completed")]
    fn stepping_completed_task_panics() {
        let mut t = task(from_fn("once", |_| Step::Return(Value::Unit)));
        t.step();
        t.step();
    }
}
