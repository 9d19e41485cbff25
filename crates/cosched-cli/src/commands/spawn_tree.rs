// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `cosched spawn-tree`: root tasks that each spawn one child.

use anyhow::Result;
use cosched_rt::sim::SimNet;
use cosched_rt::{from_fn, Frame, Resume, Scheduler, Step, TaskError, Value};
use serde::Serialize;

use super::RunOptions;
use crate::output;

/// Spawns one child, then returns the child's id as an integer.
fn root() -> impl Frame {
    let mut spawned = false;
    from_fn("root", move |input| {
        if !spawned {
            spawned = true;
            return Step::spawn(from_fn("child", |_| Step::Return(Value::Unit)));
        }
        match input {
            Resume::Value(Value::Task(child)) => {
                log::info!("spawned {}", child);
                Step::Return(Value::Int(child.raw() as i64))
            }
            other => Step::Fail(TaskError::UnexpectedResume {
                frame: "root",
                expected: "task",
                got: other.kind(),
            }),
        }
    })
}

#[derive(Serialize)]
struct SpawnDetail {
    roots: usize,
    completions: u64,
}

pub fn cmd_spawn_tree(opts: &RunOptions, roots: usize) -> Result<()> {
    // No task waits on a handle, so the multiplexer is never polled.
    let net = SimNet::new();
    let mut sched = Scheduler::with_config(net.multiplexer(), opts.config);
    for _ in 0..roots {
        sched.spawn(root());
    }
    let report = super::drive(&mut sched, "spawn-tree")?;

    let detail = SpawnDetail {
        roots,
        completions: report.stats.completed,
    };
    if !opts.json {
        println!("{} {}", output::label("completions"), output::count(detail.completions));
    }
    output::print_report("spawn-tree", &report, &detail, opts.json)
}
