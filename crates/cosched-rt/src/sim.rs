// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! In-memory network for deterministic scheduler runs.
//!
//! `SimNet` owns every simulated socket. `SimSocket` implements `RawStream`
//! against it and `SimMultiplexer` reports readiness from the same state, so
//! a scheduler driven by the pair never touches the OS. Connects complete
//! immediately when a listener exists. A per-socket write cap forces partial
//! writes.
//!
//! Polling with no timeout when nothing can become ready is an error rather
//! than a hang: nothing outside the simulation will ever make progress.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::time::Duration;

use crate::poller::{Multiplexer, Readiness};
use crate::socket::RawStream;
use crate::syscall::Handle;

const FIRST_EPHEMERAL_PORT: u16 = 40000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SockState {
    Fresh,
    Bound,
    Listening,
    Connected,
    Closed,
}

#[derive(Debug)]
struct SimEntry {
    state: SockState,
    local: Option<SocketAddr>,
    peer: Option<Handle>,
    peer_addr: Option<SocketAddr>,
    /// Bytes written by the peer, not yet read.
    inbox: VecDeque<u8>,
    peer_closed: bool,
    backlog: VecDeque<(Handle, SocketAddr)>,
    backlog_cap: usize,
    write_limit: Option<usize>,
    write_calls: usize,
}

impl SimEntry {
    fn new() -> Self {
        Self {
            state: SockState::Fresh,
            local: None,
            peer: None,
            peer_addr: None,
            inbox: VecDeque::new(),
            peer_closed: false,
            backlog: VecDeque::new(),
            backlog_cap: 0,
            write_limit: None,
            write_calls: 0,
        }
    }

    fn readable(&self) -> bool {
        match self.state {
            SockState::Connected => !self.inbox.is_empty() || self.peer_closed,
            SockState::Listening => !self.backlog.is_empty(),
            _ => false,
        }
    }

    fn writable(&self) -> bool {
        matches!(
            self.state,
            SockState::Fresh | SockState::Bound | SockState::Connected
        )
    }
}

#[derive(Debug)]
struct NetState {
    next_handle: u64,
    next_port: u16,
    sockets: HashMap<Handle, SimEntry>,
    listeners: HashMap<SocketAddr, Handle>,
}

impl NetState {
    fn entry(&mut self, h: Handle) -> io::Result<&mut SimEntry> {
        self.sockets
            .get_mut(&h)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("no simulated socket {}", h)))
    }

    fn open(&mut self) -> Handle {
        let h = Handle::new(self.next_handle);
        self.next_handle += 1;
        self.sockets.insert(h, SimEntry::new());
        h
    }

    fn ephemeral(&mut self) -> SocketAddr {
        let port = self.next_port;
        self.next_port = self.next_port.wrapping_add(1).max(FIRST_EPHEMERAL_PORT);
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn listener_for(&self, addr: SocketAddr) -> Option<Handle> {
        self.listeners.get(&addr).copied().or_else(|| {
            let any = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), addr.port());
            self.listeners.get(&any).copied()
        })
    }

    /// Wire two fresh entries together as a connection.
    fn link(&mut self, a: Handle, b: Handle) -> io::Result<()> {
        let a_local = self.entry(a)?.local;
        let a_addr = match a_local {
            Some(addr) => addr,
            None => self.ephemeral(),
        };
        let b_local = self.entry(b)?.local;
        let b_addr = match b_local {
            Some(addr) => addr,
            None => self.ephemeral(),
        };
        for (me, my_addr, peer, peer_addr) in [(a, a_addr, b, b_addr), (b, b_addr, a, a_addr)] {
            let e = self.entry(me)?;
            e.state = SockState::Connected;
            e.local = Some(my_addr);
            e.peer = Some(peer);
            e.peer_addr = Some(peer_addr);
        }
        Ok(())
    }
}

fn not_connected() -> io::Error {
    io::Error::from(io::ErrorKind::NotConnected)
}

/// Shared handle on one simulated network.
#[derive(Debug, Clone)]
pub struct SimNet {
    state: Rc<RefCell<NetState>>,
}

impl Default for SimNet {
    fn default() -> Self {
        Self::new()
    }
}

impl SimNet {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(NetState {
                next_handle: 1,
                next_port: FIRST_EPHEMERAL_PORT,
                sockets: HashMap::new(),
                listeners: HashMap::new(),
            })),
        }
    }

    pub fn socket(&self) -> SimSocket {
        let handle = self.state.borrow_mut().open();
        SimSocket {
            net: self.clone(),
            handle,
        }
    }

    /// Two sockets already connected to each other.
    pub fn pair(&self) -> (SimSocket, SimSocket) {
        let a = self.socket();
        let b = self.socket();
        let mut st = self.state.borrow_mut();
        // Both handles were just opened.
        let _ = st.link(a.handle, b.handle);
        drop(st);
        (a, b)
    }

    pub fn multiplexer(&self) -> SimMultiplexer {
        SimMultiplexer { net: self.clone() }
    }

    /// Raw write calls made on `handle`, zero for unknown handles.
    pub fn write_calls(&self, handle: Handle) -> usize {
        self.state
            .borrow()
            .sockets
            .get(&handle)
            .map_or(0, |e| e.write_calls)
    }

    /// Bytes sitting unread in `handle`'s receive buffer.
    pub fn pending_bytes(&self, handle: Handle) -> usize {
        self.state
            .borrow()
            .sockets
            .get(&handle)
            .map_or(0, |e| e.inbox.len())
    }
}

#[derive(Debug)]
pub struct SimSocket {
    net: SimNet,
    handle: Handle,
}

impl SimSocket {
    /// Cap every raw write on this socket at `limit` bytes.
    pub fn set_write_limit(&self, limit: Option<usize>) {
        if let Some(e) = self.net.state.borrow_mut().sockets.get_mut(&self.handle) {
            e.write_limit = limit;
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        let mut st = self.net.state.borrow_mut();
        st.entry(self.handle)?.peer_addr.ok_or_else(not_connected)
    }
}

impl RawStream for SimSocket {
    fn handle(&self) -> Handle {
        self.handle
    }

    fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        let mut st = self.net.state.borrow_mut();
        if st.entry(self.handle)?.state != SockState::Fresh {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "socket already bound"));
        }
        let addr = if addr.port() == 0 {
            let port = st.ephemeral().port();
            SocketAddr::new(addr.ip(), port)
        } else {
            addr
        };
        let taken = st
            .sockets
            .values()
            .any(|e| e.state != SockState::Closed && e.state != SockState::Connected && e.local == Some(addr));
        if taken {
            return Err(io::Error::from(io::ErrorKind::AddrInUse));
        }
        let e = st.entry(self.handle)?;
        e.state = SockState::Bound;
        e.local = Some(addr);
        Ok(())
    }

    fn listen(&self, backlog: u32) -> io::Result<()> {
        let mut st = self.net.state.borrow_mut();
        let e = st.entry(self.handle)?;
        let Some(addr) = e.local.filter(|_| e.state == SockState::Bound) else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "listen on unbound socket"));
        };
        e.state = SockState::Listening;
        e.backlog_cap = backlog.max(1) as usize;
        st.listeners.insert(addr, self.handle);
        Ok(())
    }

    fn accept(&self) -> io::Result<(Rc<dyn RawStream>, SocketAddr)> {
        let mut st = self.net.state.borrow_mut();
        let e = st.entry(self.handle)?;
        if e.state != SockState::Listening {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "accept on non-listening socket"));
        }
        let (handle, peer) = e
            .backlog
            .pop_front()
            .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;
        let conn = SimSocket {
            net: self.net.clone(),
            handle,
        };
        Ok((Rc::new(conn), peer))
    }

    fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        let mut st = self.net.state.borrow_mut();
        match st.entry(self.handle)?.state {
            SockState::Connected => return Ok(()),
            SockState::Fresh | SockState::Bound => {}
            SockState::Listening | SockState::Closed => {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "socket can't connect"));
            }
        }
        let listener = st
            .listener_for(addr)
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        let lst = st.entry(listener)?;
        if lst.backlog.len() >= lst.backlog_cap {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
        }
        let server_side = st.open();
        st.entry(server_side)?.local = Some(addr);
        st.link(self.handle, server_side)?;
        let client_addr = st.entry(self.handle)?.local.unwrap_or(addr);
        st.entry(listener)?.backlog.push_back((server_side, client_addr));
        Ok(())
    }

    fn read(&self, max: usize) -> io::Result<Vec<u8>> {
        let mut st = self.net.state.borrow_mut();
        let e = st.entry(self.handle)?;
        if e.state != SockState::Connected {
            return Err(not_connected());
        }
        if e.inbox.is_empty() {
            if e.peer_closed {
                return Ok(Vec::new());
            }
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let n = max.min(e.inbox.len());
        Ok(e.inbox.drain(..n).collect())
    }

    fn write(&self, data: &[u8]) -> io::Result<usize> {
        let mut st = self.net.state.borrow_mut();
        let e = st.entry(self.handle)?;
        e.write_calls += 1;
        if e.state != SockState::Connected {
            return Err(not_connected());
        }
        if e.peer_closed {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        let n = e.write_limit.map_or(data.len(), |cap| cap.min(data.len()));
        let peer = e.peer.ok_or_else(not_connected)?;
        st.entry(peer)?.inbox.extend(&data[..n]);
        Ok(n)
    }

    fn close(&self) -> io::Result<()> {
        let mut st = self.net.state.borrow_mut();
        let e = st.entry(self.handle)?;
        if e.state == SockState::Closed {
            return Ok(());
        }
        let was = e.state;
        e.state = SockState::Closed;
        let (peer, local) = (e.peer, e.local);
        if let Some(peer) = peer {
            st.entry(peer)?.peer_closed = true;
        }
        if was == SockState::Listening {
            if let Some(addr) = local {
                st.listeners.remove(&addr);
            }
        }
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut st = self.net.state.borrow_mut();
        let e = st.entry(self.handle)?;
        Ok(e
            .local
            .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)))
    }
}

/// Readiness straight from `SimNet` state. Never sleeps.
#[derive(Debug)]
pub struct SimMultiplexer {
    net: SimNet,
}

impl Multiplexer for SimMultiplexer {
    fn poll(
        &mut self,
        reads: &[Handle],
        writes: &[Handle],
        timeout: Option<Duration>,
    ) -> io::Result<Readiness> {
        let mut st = self.net.state.borrow_mut();
        let mut ready = Readiness::default();
        for &h in reads {
            let e = open_entry(&mut st, h)?;
            if e.readable() {
                ready.readable.push(h);
            }
        }
        for &h in writes {
            let e = open_entry(&mut st, h)?;
            if e.writable() {
                ready.writable.push(h);
            }
        }
        if ready.is_empty() && timeout.is_none() && !(reads.is_empty() && writes.is_empty()) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "simulated network stalled: no handle can become ready",
            ));
        }
        Ok(ready)
    }
}

fn open_entry(st: &mut NetState, h: Handle) -> io::Result<&mut SimEntry> {
    let e = st.entry(h)?;
    if e.state == SockState::Closed {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("handle {} is closed", h),
        ));
    }
    Ok(e)
}
