// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `cosched command-server`: request/response protocol for one client.
//!
//! Each request is one `recv(64)` holding `Cmd: N`:
//! - `0` current time, `ctime` layout plus CRLF
//! - `1` comma-joined sensor readings
//! - `2` `cmdNum = 2`
//! - `9` `cmdNum = 9; shutting down`, then the session ends
//!
//! Anything else gets `*** Unexpected command number`. The session also ends
//! when the client half-closes.

use std::net::SocketAddr;
use std::rc::Rc;

use anyhow::{Context, Result};
use cosched_rt::{CoSocket, Frame, PollMultiplexer, Resume, Scheduler, Step, TaskError, TcpSocket, Value};
use serde::Serialize;

use super::time_server::{ctime_now, Clock};
use super::RunOptions;
use crate::output;

const REQUEST_MAX: usize = 64;
pub const UNEXPECTED: &str = "*** Unexpected command number";

/// Where `Cmd: 1` gets its numbers.
pub trait ReadingSource {
    fn read_all(&mut self) -> Vec<f64>;
}

/// Returns the same readings every time.
#[derive(Debug, Clone, PartialEq)]
pub struct FixedReadings(pub Vec<f64>);

impl ReadingSource for FixedReadings {
    fn read_all(&mut self) -> Vec<f64> {
        self.0.clone()
    }
}

/// `Some(n)` for a well-formed `Cmd: n` request.
pub fn parse_command(request: &[u8]) -> Option<i64> {
    let text = std::str::from_utf8(request).ok()?;
    let mut words = text.split_whitespace();
    if words.next()? != "Cmd:" {
        return None;
    }
    words.next()?.parse().ok()
}

/// Reply text, and whether the session ends after sending it.
pub fn respond(command: Option<i64>, readings: &mut dyn ReadingSource, clock: &dyn Fn() -> String) -> (String, bool) {
    match command {
        Some(0) => (format!("{}\r\n", clock()), false),
        Some(1) => {
            let joined = readings
                .read_all()
                .iter()
                .map(f64::to_string)
                .collect::<Vec<_>>()
                .join(",");
            (joined, false)
        }
        Some(2) => ("cmdNum = 2".to_string(), false),
        Some(9) => ("cmdNum = 9; shutting down".to_string(), true),
        Some(n) => {
            log::warn!("unexpected command number {}", n);
            (UNEXPECTED.to_string(), false)
        }
        None => {
            log::warn!("malformed command");
            (UNEXPECTED.to_string(), false)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Session {
    Accepting,
    Reading,
    Replying { last: bool },
}

/// Serves one client until `Cmd: 9` or end of stream. Returns the number of
/// requests handled.
pub struct CommandServer {
    listener: CoSocket,
    conn: Option<CoSocket>,
    readings: Box<dyn ReadingSource>,
    clock: Clock,
    state: Session,
    handled: i64,
}

impl std::fmt::Debug for CommandServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandServer")
            .field("listener", &self.listener)
            .field("conn", &self.conn)
            .field("state", &self.state)
            .field("handled", &self.handled)
            .finish()
    }
}

impl CommandServer {
    pub fn new(listener: CoSocket, readings: Box<dyn ReadingSource>, clock: Clock) -> Self {
        Self {
            listener,
            conn: None,
            readings,
            clock,
            state: Session::Accepting,
            handled: 0,
        }
    }

    fn read_next(&mut self, conn: &CoSocket) -> Step {
        self.state = Session::Reading;
        Step::delegate(conn.recv(REQUEST_MAX))
    }

    fn hang_up(&mut self) -> Step {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.close() {
                return Step::Fail(e);
            }
        }
        log::info!("client closed after {} requests", self.handled);
        match self.listener.close() {
            Ok(()) => Step::Return(Value::Int(self.handled)),
            Err(e) => Step::Fail(e),
        }
    }

    /// Releases both sockets and fails with `err`.
    fn abandon(&mut self, err: TaskError) -> Step {
        log::warn!("session failed after {} requests: {}", self.handled, err);
        let sockets = self.conn.take().into_iter().chain(Some(self.listener.clone()));
        for sock in sockets {
            if let Err(e) = sock.close() {
                log::warn!("closing {} after failure: {}", sock.handle(), e);
            }
        }
        Step::Fail(err)
    }
}

impl Frame for CommandServer {
    fn resume(&mut self, input: Resume) -> Step {
        let value = match input.into_result() {
            Ok(v) => v,
            Err(e) => return self.abandon(e),
        };
        match (self.state, value) {
            (Session::Accepting, None) => Step::delegate(self.listener.accept()),
            (Session::Accepting, Some(Value::Accepted { socket, peer })) => {
                log::info!("got a connection from {}", peer);
                let step = self.read_next(&socket);
                self.conn = Some(socket);
                step
            }
            (Session::Reading, Some(Value::Bytes(request))) => {
                let Some(conn) = self.conn.clone() else {
                    return Step::Fail(TaskError::custom("no client connection"));
                };
                if request.is_empty() {
                    return self.hang_up();
                }
                let command = parse_command(&request);
                log::debug!("request {:?} -> {:?}", String::from_utf8_lossy(&request).trim(), command);
                let (reply, last) = respond(command, self.readings.as_mut(), &*self.clock);
                self.handled += 1;
                self.state = Session::Replying { last };
                Step::delegate(conn.send(reply))
            }
            (Session::Replying { last: true }, Some(Value::Int(_))) => self.hang_up(),
            (Session::Replying { last: false }, Some(Value::Int(_))) => match self.conn.clone() {
                Some(conn) => self.read_next(&conn),
                None => Step::Fail(TaskError::custom("no client connection")),
            },
            (state, other) => Step::Fail(TaskError::custom(format!(
                "command server {:?} got {:?}",
                state, other
            ))),
        }
    }
}

#[derive(Serialize)]
struct CommandDetail {
    bind: String,
    readings: Vec<f64>,
}

pub fn cmd_command_server(opts: &RunOptions, bind: SocketAddr, backlog: u32, readings: Vec<f64>) -> Result<()> {
    let listener = CoSocket::new(TcpSocket::for_addr(&bind).context("creating socket")?);
    listener.bind(bind).with_context(|| format!("binding {}", bind))?;
    listener.listen(backlog).context("listening")?;
    log::info!("command server on {}", listener.local_addr()?);

    let mut sched = Scheduler::with_config(PollMultiplexer::new(), opts.config);
    sched.spawn(CommandServer::new(
        listener,
        Box::new(FixedReadings(readings.clone())),
        Rc::new(ctime_now),
    ));
    let report = super::drive(&mut sched, "command-server")?;

    let detail = CommandDetail {
        bind: bind.to_string(),
        readings,
    };
    output::print_report("command-server", &report, &detail, opts.json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosched_rt::sim::SimNet;
    use cosched_rt::{Exit, Multiplexer};
    use std::cell::RefCell;

    fn fixed_clock() -> String {
        "Sun Oct 18 09:05:03 2026".to_string()
    }

    #[test]
    fn parses_well_formed_commands() {
        assert_eq!(parse_command(b"Cmd: 0"), Some(0));
        assert_eq!(parse_command(b"Cmd: 9\r\n"), Some(9));
        assert_eq!(parse_command(b"  Cmd:   12 extra"), Some(12));
    }

    #[test]
    fn rejects_malformed_commands() {
        assert_eq!(parse_command(b""), None);
        assert_eq!(parse_command(b"cmd: 1"), None);
        assert_eq!(parse_command(b"Cmd:"), None);
        assert_eq!(parse_command(b"Cmd: x"), None);
        assert_eq!(parse_command(&[0xff, 0xfe]), None);
    }

    #[test]
    fn replies_match_protocol() {
        let mut src = FixedReadings(vec![65.3, -999.0, 70.0]);
        assert_eq!(respond(Some(0), &mut src, &fixed_clock), ("Sun Oct 18 09:05:03 2026\r\n".into(), false));
        assert_eq!(respond(Some(1), &mut src, &fixed_clock), ("65.3,-999,70".into(), false));
        assert_eq!(respond(Some(2), &mut src, &fixed_clock), ("cmdNum = 2".into(), false));
        assert_eq!(respond(Some(9), &mut src, &fixed_clock), ("cmdNum = 9; shutting down".into(), true));
        assert_eq!(respond(Some(5), &mut src, &fixed_clock), (UNEXPECTED.into(), false));
        assert_eq!(respond(None, &mut src, &fixed_clock), (UNEXPECTED.into(), false));
    }

    /// Sends each request, records the reply chunk that follows, then either
    /// waits for the server to hang up or hangs up itself.
    #[derive(Debug)]
    struct Dialogue {
        sock: CoSocket,
        addr: SocketAddr,
        requests: Vec<&'static str>,
        next: usize,
        hang_up_first: bool,
        replies: Rc<RefCell<Vec<String>>>,
    }

    impl Dialogue {
        fn new(net: &SimNet, requests: Vec<&'static str>, hang_up_first: bool) -> (Self, Rc<RefCell<Vec<String>>>) {
            let replies = Rc::new(RefCell::new(Vec::new()));
            let frame = Self {
                sock: CoSocket::new(net.socket()),
                addr: "127.0.0.1:8888".parse().unwrap(),
                requests,
                next: 0,
                hang_up_first,
                replies: replies.clone(),
            };
            (frame, replies)
        }

        fn send_next_or_finish(&mut self) -> Step {
            if let Some(req) = self.requests.get(self.next) {
                return Step::delegate(self.sock.send(*req));
            }
            if self.hang_up_first {
                self.sock.close().unwrap();
                return Step::Return(Value::Unit);
            }
            Step::delegate(self.sock.recv(128))
        }
    }

    impl Frame for Dialogue {
        fn resume(&mut self, input: Resume) -> Step {
            match input.into_result() {
                Ok(None) => Step::delegate(self.sock.connect(self.addr)),
                Ok(Some(Value::Unit)) => self.send_next_or_finish(),
                Ok(Some(Value::Int(_))) => Step::delegate(self.sock.recv(128)),
                Ok(Some(Value::Bytes(reply))) if !reply.is_empty() => {
                    self.replies
                        .borrow_mut()
                        .push(String::from_utf8(reply).unwrap());
                    self.next += 1;
                    self.send_next_or_finish()
                }
                Ok(Some(Value::Bytes(_))) => {
                    self.sock.close().unwrap();
                    Step::Return(Value::Unit)
                }
                other => panic!("dialogue got {:?}", other),
            }
        }
    }

    fn server(net: &SimNet) -> CommandServer {
        let listener = CoSocket::new(net.socket());
        listener.bind("0.0.0.0:8888".parse().unwrap()).unwrap();
        listener.listen(2).unwrap();
        CommandServer::new(
            listener,
            Box::new(FixedReadings(vec![65.3, 142.7])),
            Rc::new(fixed_clock),
        )
    }

    #[test]
    fn session_runs_until_shutdown_command() {
        let net = SimNet::new();
        let mut sched = Scheduler::new(net.multiplexer());
        sched.spawn(server(&net));
        let (client, replies) = Dialogue::new(&net, vec!["Cmd: 0", "Cmd: 1", "Cmd: 2", "Hello", "Cmd: 7", "Cmd: 9"], false);
        sched.spawn(client);

        let report = sched.run().unwrap();
        assert_eq!(report.exit, Exit::Drained);
        assert_eq!(report.stats.failed, 0);
        assert_eq!(
            *replies.borrow(),
            vec![
                "Sun Oct 18 09:05:03 2026\r\n",
                "65.3,142.7",
                "cmdNum = 2",
                UNEXPECTED,
                UNEXPECTED,
                "cmdNum = 9; shutting down",
            ]
        );
    }

    #[test]
    fn fault_closes_both_sockets() {
        let net = SimNet::new();
        let mut srv = server(&net);
        let listener = srv.listener.handle();
        let (conn, _peer) = net.pair();
        let conn = CoSocket::new(conn);
        let conn_handle = conn.handle();
        srv.conn = Some(conn);
        srv.state = Session::Reading;

        let fault = TaskError::custom("peer reset");
        match srv.resume(Resume::Fault(fault)) {
            Step::Fail(err) => assert_eq!(err.to_string(), "peer reset"),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(srv.conn.is_none());
        let mut mux = net.multiplexer();
        for handle in [listener, conn_handle] {
            let err = mux.poll(&[handle], &[], None).unwrap_err();
            assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
        }
    }

    #[test]
    fn client_half_close_ends_session() {
        let net = SimNet::new();
        let mut sched = Scheduler::new(net.multiplexer());
        sched.spawn(server(&net));
        let (client, replies) = Dialogue::new(&net, vec!["Cmd: 2"], true);
        sched.spawn(client);

        let report = sched.run().unwrap();
        assert_eq!(report.exit, Exit::Drained);
        assert_eq!(report.stats.completed, 2);
        assert_eq!(*replies.borrow(), vec!["cmdNum = 2"]);
    }
}
