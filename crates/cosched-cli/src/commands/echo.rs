// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `cosched echo`: one listener task echoes a client's payload.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use cosched_rt::sim::SimNet;
use cosched_rt::{
    CoSocket, Frame, Multiplexer, PollMultiplexer, Resume, Scheduler, Step, TaskError, TcpSocket,
    Value,
};
use serde::Serialize;

use super::RunOptions;
use crate::output;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EchoStage {
    Accept,
    Recv,
    Send,
    Close,
}

/// Accepts one connection, sends back the first chunk it reads, closes.
#[derive(Debug)]
pub struct EchoOnce {
    listener: CoSocket,
    conn: Option<CoSocket>,
    stage: EchoStage,
}

impl EchoOnce {
    pub fn new(listener: CoSocket) -> Self {
        Self {
            listener,
            conn: None,
            stage: EchoStage::Accept,
        }
    }

    fn shut(&mut self) -> Result<(), TaskError> {
        if let Some(conn) = self.conn.take() {
            conn.close()?;
        }
        self.listener.close()
    }
}

impl Frame for EchoOnce {
    fn resume(&mut self, input: Resume) -> Step {
        let value = match input.into_result() {
            Ok(v) => v,
            Err(e) => return Step::Fail(e),
        };
        match (self.stage, value) {
            (EchoStage::Accept, None) => {
                self.stage = EchoStage::Recv;
                Step::delegate(self.listener.accept())
            }
            (EchoStage::Recv, Some(accepted)) => {
                let Some((conn, peer)) = accepted.into_accepted() else {
                    return Step::Fail(TaskError::custom("accept returned no connection"));
                };
                log::info!("echo: connection from {}", peer);
                self.stage = EchoStage::Send;
                let step = Step::delegate(conn.recv(1024));
                self.conn = Some(conn);
                step
            }
            (EchoStage::Send, Some(Value::Bytes(bytes))) => match &self.conn {
                Some(conn) => {
                    self.stage = EchoStage::Close;
                    Step::delegate(conn.send(bytes))
                }
                None => Step::Fail(TaskError::custom("echo lost its connection")),
            },
            (EchoStage::Close, Some(Value::Int(sent))) => match self.shut() {
                Ok(()) => Step::Return(Value::Int(sent)),
                Err(e) => Step::Fail(e),
            },
            (stage, other) => Step::Fail(TaskError::custom(format!(
                "echo server in {:?} stage got {:?}",
                stage, other
            ))),
        }
    }
}

/// Connects, sends `payload` (if any), then reads until end of stream.
/// The bytes read land in the shared buffer when the peer hangs up.
#[derive(Debug)]
pub struct Exchange {
    sock: CoSocket,
    addr: SocketAddr,
    payload: Vec<u8>,
    received: Vec<u8>,
    connected: bool,
    out: Rc<RefCell<Vec<u8>>>,
}

impl Exchange {
    pub fn new(sock: CoSocket, addr: SocketAddr, payload: Vec<u8>, out: Rc<RefCell<Vec<u8>>>) -> Self {
        Self {
            sock,
            addr,
            payload,
            received: Vec::new(),
            connected: false,
            out,
        }
    }
}

impl Frame for Exchange {
    fn resume(&mut self, input: Resume) -> Step {
        let value = match input.into_result() {
            Ok(v) => v,
            Err(e) => return Step::Fail(e),
        };
        match value {
            None if !self.connected => {
                self.connected = true;
                Step::delegate(self.sock.connect(self.addr))
            }
            Some(Value::Unit) if !self.payload.is_empty() => {
                Step::delegate(self.sock.send(std::mem::take(&mut self.payload)))
            }
            Some(Value::Unit) | Some(Value::Int(_)) => Step::delegate(self.sock.recv(1024)),
            Some(Value::Bytes(bytes)) if !bytes.is_empty() => {
                self.received.extend_from_slice(&bytes);
                Step::delegate(self.sock.recv(1024))
            }
            Some(Value::Bytes(_)) => {
                if let Err(e) = self.sock.close() {
                    return Step::Fail(e);
                }
                let n = self.received.len() as i64;
                *self.out.borrow_mut() = std::mem::take(&mut self.received);
                Step::Return(Value::Int(n))
            }
            other => Step::Fail(TaskError::custom(format!("client got {:?}", other))),
        }
    }
}

#[derive(Serialize)]
struct EchoDetail {
    network: &'static str,
    sent: String,
    received: String,
}

pub fn cmd_echo(opts: &RunOptions, sim: bool, payload: Vec<u8>) -> Result<()> {
    let out = Rc::new(RefCell::new(Vec::new()));
    let report = if sim {
        let net = SimNet::new();
        let listener = CoSocket::new(net.socket());
        let client = CoSocket::new(net.socket());
        run_echo(net.multiplexer(), opts, listener, client, &payload, &out)?
    } else {
        let listener = CoSocket::new(TcpSocket::new_v4().context("creating listener socket")?);
        let client = CoSocket::new(TcpSocket::new_v4().context("creating client socket")?);
        run_echo(PollMultiplexer::new(), opts, listener, client, &payload, &out)?
    };

    let received = out.borrow().clone();
    let detail = EchoDetail {
        network: if sim { "sim" } else { "tcp" },
        sent: String::from_utf8_lossy(&payload).into_owned(),
        received: String::from_utf8_lossy(&received).into_owned(),
    };
    if !opts.json {
        println!("{} {:?}", output::label("received"), detail.received);
    }
    output::print_report("echo", &report, &detail, opts.json)?;

    if report.exit == cosched_rt::Exit::Drained && received != payload {
        bail!("echo mismatch: sent {:?}, got {:?}", detail.sent, detail.received);
    }
    Ok(())
}

fn run_echo<M: Multiplexer>(
    poller: M,
    opts: &RunOptions,
    listener: CoSocket,
    client: CoSocket,
    payload: &[u8],
    out: &Rc<RefCell<Vec<u8>>>,
) -> Result<cosched_rt::RunReport> {
    listener
        .bind("127.0.0.1:0".parse()?)
        .context("binding echo listener")?;
    listener.listen(1).context("listening")?;
    let addr = listener.local_addr()?;
    log::debug!("echo listener on {}", addr);

    let mut sched = Scheduler::with_config(poller, opts.config);
    sched.spawn(EchoOnce::new(listener));
    sched.spawn(Exchange::new(client, addr, payload.to_vec(), out.clone()));
    super::drive(&mut sched, "echo")
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosched_rt::{Exit, SchedulerConfig};

    fn opts() -> RunOptions {
        RunOptions {
            config: SchedulerConfig::default(),
            json: false,
        }
    }

    #[test]
    fn sim_echo_returns_payload() {
        let net = SimNet::new();
        let out = Rc::new(RefCell::new(Vec::new()));
        let report = run_echo(
            net.multiplexer(),
            &opts(),
            CoSocket::new(net.socket()),
            CoSocket::new(net.socket()),
            b"PING",
            &out,
        )
        .unwrap();
        assert_eq!(report.exit, Exit::Drained);
        assert_eq!(report.stats.completed, 2);
        assert_eq!(out.borrow().as_slice(), b"PING");
    }

    #[test]
    fn refused_connect_kills_only_client() {
        let net = SimNet::new();
        let out = Rc::new(RefCell::new(Vec::new()));
        let mut sched = Scheduler::new(net.multiplexer());
        sched.spawn(Exchange::new(
            CoSocket::new(net.socket()),
            "127.0.0.1:4000".parse().unwrap(),
            b"x".to_vec(),
            out.clone(),
        ));
        let report = sched.run().unwrap();
        assert_eq!(report.stats.failed, 1);
        assert!(out.borrow().is_empty());
    }
}
