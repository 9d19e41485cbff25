// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! CLI output formatting with colors and styling.
//!
//! Respects NO_COLOR and FORCE_COLOR environment variables.

use colored::{ColoredString, Colorize};
use cosched_rt::{Exit, RunReport};
use serde::Serialize;

/// Initialize color support based on environment.
/// Call once at startup.
pub fn init() {
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    } else if std::env::var("FORCE_COLOR").is_ok() {
        colored::control::set_override(true);
    }
}

pub fn banner_ok(name: &str) -> String {
    format!(
        "{} {} {}",
        "===".dimmed(),
        format!("{} OK", name).green().bold(),
        "===".dimmed()
    )
}

pub fn banner_fail(name: &str, failed: u64) -> String {
    let msg = if failed == 1 {
        format!("{} FAILED: 1 task died", name)
    } else {
        format!("{} FAILED: {} tasks died", name, failed)
    };
    format!("{} {} {}", "===".dimmed(), msg.red().bold(), "===".dimmed())
}

pub fn banner_paused(name: &str, live: usize) -> String {
    format!(
        "{} {} {}",
        "===".dimmed(),
        format!("{} PAUSED: {} tasks alive", name, live).yellow().bold(),
        "===".dimmed()
    )
}

pub fn label(name: &str) -> ColoredString {
    name.cyan()
}

pub fn count(n: u64) -> ColoredString {
    n.to_string().bold()
}

#[derive(Serialize)]
struct JsonSummary<'a, D: Serialize> {
    command: &'a str,
    report: &'a RunReport,
    detail: D,
}

/// Print the banner and counters, or one JSON document with `detail` attached.
pub fn print_report<D: Serialize>(name: &str, report: &RunReport, detail: D, json: bool) -> anyhow::Result<()> {
    if json {
        let summary = JsonSummary {
            command: name,
            report,
            detail,
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let banner = match report.exit {
        Exit::BudgetExhausted => banner_paused(name, report.live),
        Exit::Drained if report.stats.failed > 0 => banner_fail(name, report.stats.failed),
        Exit::Drained => banner_ok(name),
    };
    println!("{}", banner);

    let s = &report.stats;
    println!(
        "  {} {}  {} {}  {} {}",
        label("spawned"),
        count(s.spawned),
        label("completed"),
        count(s.completed),
        label("failed"),
        count(s.failed)
    );
    println!(
        "  {} {}  {} {}  {} {}  {} {}",
        label("passes"),
        count(s.passes),
        label("steps"),
        count(s.steps),
        label("read waits"),
        count(s.read_waits),
        label("write waits"),
        count(s.write_waits)
    );
    Ok(())
}
