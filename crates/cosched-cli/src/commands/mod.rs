// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! CLI command implementations.

pub mod command_server;
pub mod echo;
pub mod spawn_tree;
pub mod time_server;

use anyhow::Context;
use cosched_rt::{Multiplexer, RunReport, Scheduler, SchedulerConfig};

/// Settings shared by every subcommand.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub config: SchedulerConfig,
    pub json: bool,
}

/// Run the loop under the configured budget, with context on fatal errors.
pub fn drive<M: Multiplexer>(sched: &mut Scheduler<M>, what: &str) -> anyhow::Result<RunReport> {
    let report = sched
        .run()
        .with_context(|| format!("{} scheduler aborted", what))?;
    log::debug!("{} finished after {} passes: {:?}", what, report.passes, report.exit);
    Ok(report)
}
