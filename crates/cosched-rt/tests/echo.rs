// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Echo round trip: one listener task, one client task.
//! Runs over the simulated network and over loopback TCP.

use std::cell::RefCell;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use cosched_rt::sim::SimNet;
use cosched_rt::{
    CoSocket, Exit, Frame, Multiplexer, PollMultiplexer, Resume, Scheduler, SchedulerConfig,
    Step, TaskError, TcpSocket, Value,
};

#[derive(Debug, Clone, Copy)]
enum EchoStage {
    Accept,
    Recv,
    Send,
    Close,
}

/// Accepts one connection, sends back the first chunk it reads, closes.
#[derive(Debug)]
struct EchoOnce {
    listener: CoSocket,
    conn: Option<CoSocket>,
    stage: EchoStage,
}

impl EchoOnce {
    fn new(listener: CoSocket) -> Self {
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
                let Some((conn, _peer)) = accepted.into_accepted() else {
                    return Step::Fail(TaskError::custom("accept returned no connection"));
                };
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
            (stage, other) => Step::Fail(TaskError::custom(format!("{:?} got {:?}", stage, other))),
        }
    }
}

/// Connects, sends `PING`, then reads into `out` until end of stream.
#[derive(Debug)]
struct Client {
    sock: CoSocket,
    addr: SocketAddr,
    out: Rc<RefCell<Vec<u8>>>,
}

impl Frame for Client {
    fn resume(&mut self, input: Resume) -> Step {
        match input.into_result() {
            Ok(None) => Step::delegate(self.sock.connect(self.addr)),
            Ok(Some(Value::Unit)) => Step::delegate(self.sock.send(&b"PING"[..])),
            Ok(Some(Value::Int(_))) => Step::delegate(self.sock.recv(1024)),
            Ok(Some(Value::Bytes(bytes))) if !bytes.is_empty() => {
                self.out.borrow_mut().extend_from_slice(&bytes);
                Step::delegate(self.sock.recv(1024))
            }
            Ok(Some(Value::Bytes(_))) => match self.sock.close() {
                Ok(()) => Step::Return(Value::Unit),
                Err(e) => Step::Fail(e),
            },
            Ok(other) => Step::Fail(TaskError::custom(format!("client got {:?}", other))),
            Err(e) => Step::Fail(e),
        }
    }
}

/// Step one pass at a time, checking no handle sits in both wait maps.
fn run_checked<M: Multiplexer>(sched: &mut Scheduler<M>) -> u64 {
    let mut passes = 0;
    loop {
        let report = sched.run_passes(Some(1)).unwrap();
        passes += report.passes;
        let reads: HashSet<_> = sched.read_waiters().collect();
        assert!(
            sched.write_waiters().all(|h| !reads.contains(&h)),
            "handle in both wait maps"
        );
        if report.exit == Exit::Drained {
            return passes;
        }
        assert!(passes < 500, "echo did not finish");
    }
}

#[test]
fn echo_over_simulated_network() {
    let net = SimNet::new();
    let listener = CoSocket::new(net.socket());
    let addr: SocketAddr = "127.0.0.1:8888".parse().unwrap();
    listener.bind(addr).unwrap();
    listener.listen(2).unwrap();

    let got = Rc::new(RefCell::new(Vec::new()));
    let mut sched = Scheduler::new(net.multiplexer());
    sched.spawn(EchoOnce::new(listener));
    sched.spawn(Client {
        sock: CoSocket::new(net.socket()),
        addr,
        out: got.clone(),
    });

    run_checked(&mut sched);
    assert_eq!(got.borrow().as_slice(), b"PING");
    assert_eq!(sched.live_tasks(), 0);
    assert_eq!(sched.stats().completed, 2);
    assert_eq!(sched.stats().failed, 0);
}

#[test]
fn echo_over_loopback_tcp() {
    let listener = TcpSocket::new_v4().unwrap();
    let listener = CoSocket::new(listener);
    listener.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    listener.listen(2).unwrap();
    let addr = listener.local_addr().unwrap();

    let got = Rc::new(RefCell::new(Vec::new()));
    let config = SchedulerConfig::new().with_poll_timeout(Duration::from_millis(100));
    let mut sched = Scheduler::with_config(PollMultiplexer::new(), config);
    sched.spawn(EchoOnce::new(listener));
    sched.spawn(Client {
        sock: CoSocket::new(TcpSocket::for_addr(&addr).unwrap()),
        addr,
        out: got.clone(),
    });

    run_checked(&mut sched);
    assert_eq!(got.borrow().as_slice(), b"PING");
    assert_eq!(sched.stats().completed, 2);
    assert_eq!(sched.stats().failed, 0);
}
