// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Integration tests for the `cosched` binary.
//! Only the in-memory and loopback demos run here; the servers bind fixed ports.

use std::process::{Command, Output};

fn cosched(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_cosched"))
        .args(args)
        .env("NO_COLOR", "1")
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run cosched")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

#[test]
fn spawn_tree_reports_completions() {
    let out = cosched(&["spawn-tree", "--roots", "3"]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let text = stdout(&out);
    assert!(text.contains("completions 6"), "{}", text);
    assert!(text.contains("=== spawn-tree OK ==="), "{}", text);
}

#[test]
fn sim_echo_json_report() {
    let out = cosched(&["--json", "echo", "--sim", "--payload", "PING"]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let doc: serde_json::Value = serde_json::from_slice(&out.stdout).expect("valid JSON");
    assert_eq!(doc["command"], "echo");
    assert_eq!(doc["detail"]["received"], "PING");
    assert_eq!(doc["detail"]["network"], "sim");
    assert_eq!(doc["report"]["exit"], "Drained");
    assert_eq!(doc["report"]["stats"]["completed"], 2);
}

#[test]
fn loopback_echo() {
    let out = cosched(&["echo", "--payload", "hello there"]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert!(stdout(&out).contains("\"hello there\""));
}

#[test]
fn zero_pass_budget_pauses() {
    let out = cosched(&["--pass-budget", "0", "spawn-tree"]);
    assert!(out.status.success());
    assert!(stdout(&out).contains("PAUSED: 3 tasks alive"), "{}", stdout(&out));
}
