// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `cosched time-server`: accept loop that hands each client the time.
//!
//! The acceptor task never touches a client socket itself; every accepted
//! connection gets its own task, so a slow reader can't hold up the accept
//! loop.

use std::net::SocketAddr;
use std::rc::Rc;

use anyhow::{Context, Result};
use cosched_rt::{CoSocket, Frame, PollMultiplexer, Resume, Scheduler, Step, TaskError, TcpSocket, Value};
use serde::Serialize;

use super::RunOptions;
use crate::output;

/// Produces the text sent to a client, without the line ending.
pub type Clock = Rc<dyn Fn() -> String>;

/// Local time in `ctime(3)` layout, e.g. `Sun Oct 18 09:05:03 2026`.
pub fn ctime_now() -> String {
    chrono::Local::now().format("%a %b %e %H:%M:%S %Y").to_string()
}

/// Sends one timestamp line and closes the connection.
#[derive(Debug)]
pub struct SendTime {
    conn: CoSocket,
    line: Vec<u8>,
    sent: bool,
}

impl SendTime {
    pub fn new(conn: CoSocket, stamp: String) -> Self {
        Self {
            conn,
            line: format!("{}\r\n", stamp).into_bytes(),
            sent: false,
        }
    }
}

impl Frame for SendTime {
    fn resume(&mut self, input: Resume) -> Step {
        if let Resume::Fault(err) = input {
            // Peer went away mid-send; don't leak the descriptor.
            let _ = self.conn.close();
            return Step::Fail(err);
        }
        if !self.sent {
            self.sent = true;
            return Step::delegate(self.conn.send(std::mem::take(&mut self.line)));
        }
        match self.conn.close() {
            Ok(()) => Step::Return(Value::Unit),
            Err(e) => Step::Fail(e),
        }
    }
}

/// Accepts clients forever, or until `max_clients` have been handed off.
pub struct TimeServer {
    listener: CoSocket,
    clock: Clock,
    max_clients: Option<usize>,
    served: usize,
}

impl std::fmt::Debug for TimeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeServer")
            .field("listener", &self.listener)
            .field("served", &self.served)
            .finish()
    }
}

impl TimeServer {
    pub fn new(listener: CoSocket, clock: Clock, max_clients: Option<usize>) -> Self {
        Self {
            listener,
            clock,
            max_clients,
            served: 0,
        }
    }

    fn done(&self) -> bool {
        self.max_clients.is_some_and(|max| self.served >= max)
    }

    fn finish(&mut self) -> Step {
        match self.listener.close() {
            Ok(()) => Step::Return(Value::Int(self.served as i64)),
            Err(e) => Step::Fail(e),
        }
    }
}

impl Frame for TimeServer {
    fn resume(&mut self, input: Resume) -> Step {
        let value = match input.into_result() {
            Ok(v) => v,
            Err(e) => return Step::Fail(e),
        };
        match value {
            None | Some(Value::Task(_)) if self.done() => self.finish(),
            None => Step::delegate(self.listener.accept()),
            Some(Value::Task(id)) => {
                log::debug!("client handed to {}", id);
                Step::delegate(self.listener.accept())
            }
            Some(Value::Accepted { socket, peer }) => {
                log::info!("got a connection from {}", peer);
                self.served += 1;
                Step::spawn(SendTime::new(socket, (self.clock)()))
            }
            Some(other) => Step::Fail(TaskError::UnexpectedResume {
                frame: "time-server",
                expected: "accepted",
                got: other.kind(),
            }),
        }
    }
}

#[derive(Serialize)]
struct TimeDetail {
    bind: String,
    served: u64,
}

pub fn cmd_time_server(
    opts: &RunOptions,
    bind: SocketAddr,
    backlog: u32,
    max_clients: Option<usize>,
) -> Result<()> {
    let listener = CoSocket::new(TcpSocket::for_addr(&bind).context("creating socket")?);
    listener.bind(bind).with_context(|| format!("binding {}", bind))?;
    listener.listen(backlog).context("listening")?;
    log::info!("time server on {}", listener.local_addr()?);

    let mut sched = Scheduler::with_config(PollMultiplexer::new(), opts.config);
    sched.spawn(TimeServer::new(listener, Rc::new(ctime_now), max_clients));
    let report = super::drive(&mut sched, "time-server")?;

    // Every served client cost one spawned task.
    let detail = TimeDetail {
        bind: bind.to_string(),
        served: report.stats.spawned.saturating_sub(1),
    };
    output::print_report("time-server", &report, &detail, opts.json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::echo::Exchange;
    use cosched_rt::sim::SimNet;
    use cosched_rt::Exit;
    use std::cell::RefCell;

    #[test]
    fn ctime_layout() {
        let stamp = ctime_now();
        // "Www Mmm dd hh:mm:ss yyyy"
        assert_eq!(stamp.len(), 24, "{:?}", stamp);
        assert_eq!(&stamp[3..4], " ");
        assert_eq!(&stamp[13..14], ":");
    }

    #[test]
    fn serves_each_client_then_stops() {
        let net = SimNet::new();
        let listener = CoSocket::new(net.socket());
        let addr: SocketAddr = "0.0.0.0:8888".parse().unwrap();
        listener.bind(addr).unwrap();
        listener.listen(2).unwrap();

        let clock: Clock = Rc::new(|| "Sun Oct 18 09:05:03 2026".to_string());
        let mut sched = Scheduler::new(net.multiplexer());
        sched.spawn(TimeServer::new(listener, clock, Some(2)));

        let outs: Vec<_> = (0..2).map(|_| Rc::new(RefCell::new(Vec::new()))).collect();
        for out in &outs {
            sched.spawn(Exchange::new(
                CoSocket::new(net.socket()),
                "127.0.0.1:8888".parse().unwrap(),
                Vec::new(),
                out.clone(),
            ));
        }

        let report = sched.run().unwrap();
        assert_eq!(report.exit, Exit::Drained);
        // acceptor + 2 clients + 2 per-connection tasks
        assert_eq!(report.stats.completed, 5);
        assert_eq!(report.stats.failed, 0);
        for out in &outs {
            assert_eq!(out.borrow().as_slice(), b"Sun Oct 18 09:05:03 2026\r\n");
        }
    }
}
