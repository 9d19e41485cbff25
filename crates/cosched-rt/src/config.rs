// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler configuration.

use std::time::Duration;

/// Knobs for the reactor loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SchedulerConfig {
    /// How long the multiplexer may block when no task is runnable.
    /// `None` blocks until some handle is ready.
    pub poll_timeout: Option<Duration>,
    /// Stop after this many passes and hand control back to the caller.
    /// `None` runs until every task has completed.
    pub pass_budget: Option<usize>,
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    pub fn with_pass_budget(mut self, passes: usize) -> Self {
        self.pass_budget = Some(passes);
        self
    }
}
