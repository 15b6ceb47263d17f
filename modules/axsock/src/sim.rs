//! In-memory engine with uIP-style callback semantics, for hosted tests.
//!
//! Connections between local endpoints are looped back inside the engine.
//! Remote endpoints are played by the test through [`SimControl`]: it can
//! open inbound connections, inject data, close or reset them and inspect
//! what the socket layer sent.
//!
//! Callbacks run without the engine lock held, so a dispatcher blocked in
//! a callback never stalls the controlling test thread.

use core::net::{Ipv4Addr, SocketAddrV4};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::vec::Vec;

use crate::config::{EPHEMERAL_PORT_BASE, MAX_LISTEN_PORTS, MAX_TCP_CONNS, MAX_UDP_CONNS};
use crate::engine::{App, ConnId, Engine, TcpContext, TcpEvents, UdpContext, UdpEvents};
use crate::{NetError, SocketId};

const DEFAULT_MSS: usize = 536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    /// Other end is a local connection.
    Loop(ConnId),
    /// Other end is played by the test.
    External,
}

struct Segment {
    data: Vec<u8>,
    /// Local sender to acknowledge once the segment is consumed.
    from: Option<ConnId>,
}

struct TcpConn {
    app: Option<SocketId>,
    local_port: u16,
    remote: SocketAddrV4,
    link: Link,
    pending: TcpEvents,
    inbound: VecDeque<Segment>,
    peer_closed: bool,
    /// Last submission, until acknowledged.
    outstanding: Option<Vec<u8>>,
}

impl TcpConn {
    fn new(app: Option<SocketId>, local_port: u16, remote: SocketAddrV4, link: Link) -> Self {
        Self {
            app,
            local_port,
            remote,
            link,
            pending: TcpEvents::empty(),
            inbound: VecDeque::new(),
            peer_closed: false,
            outstanding: None,
        }
    }

    fn has_work(&self) -> bool {
        !self.pending.is_empty() || !self.inbound.is_empty() || self.peer_closed
    }
}

struct UdpConn {
    app: Option<SocketId>,
    local_port: u16,
    remote: SocketAddrV4,
    inbound: VecDeque<(SocketAddrV4, Vec<u8>)>,
}

#[derive(Default)]
/// What the test-side peer saw of one connection.
struct PeerLog {
    submissions: Vec<usize>,
    received: Vec<u8>,
    datagrams: Vec<Vec<u8>>,
    closed: bool,
    aborted: bool,
}

struct SimNet {
    addr: Ipv4Addr,
    mss: usize,
    next_conn: ConnId,
    next_port: u16,
    tcp: BTreeMap<ConnId, TcpConn>,
    udp: BTreeMap<ConnId, UdpConn>,
    listening: BTreeSet<u16>,
    /// Remote endpoints that answer active opens.
    reachable: BTreeSet<SocketAddrV4>,
    hold_acks: bool,
    logs: BTreeMap<ConnId, PeerLog>,
    arp_ticks: usize,
    /// Round-robin start for `poll_device`.
    cursor: ConnId,
}

impl SimNet {
    fn conn_id(&mut self) -> ConnId {
        let id = self.next_conn;
        self.next_conn += 1;
        id
    }

    fn ephemeral_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = self.next_port.checked_add(1).unwrap_or(EPHEMERAL_PORT_BASE);
        port
    }

    fn log(&mut self, conn: ConnId) -> &mut PeerLog {
        self.logs.entry(conn).or_default()
    }

    fn acknowledge(&mut self, conn: ConnId) {
        if let Some(tcp) = self.tcp.get_mut(&conn) {
            if let Some(data) = tcp.outstanding.take() {
                tcp.pending |= TcpEvents::ACKED;
                if tcp.link == Link::External {
                    self.log(conn).received.extend_from_slice(&data);
                }
            }
        }
    }

    /// Drop `conn` and tell its loop peer it was reset.
    fn reset(&mut self, conn: ConnId) {
        if let Some(tcp) = self.tcp.remove(&conn) {
            match tcp.link {
                Link::Loop(peer) => {
                    if let Some(peer) = self.tcp.get_mut(&peer) {
                        peer.pending |= TcpEvents::ABORTED;
                    }
                }
                Link::External => self.log(conn).aborted = true,
            }
        }
    }

    /// Drop `conn` after an orderly local close.
    fn close(&mut self, conn: ConnId) {
        if let Some(tcp) = self.tcp.remove(&conn) {
            match tcp.link {
                Link::Loop(peer) => {
                    if let Some(peer) = self.tcp.get_mut(&peer) {
                        peer.peer_closed = true;
                    }
                }
                Link::External => self.log(conn).closed = true,
            }
        }
    }

    fn transmit(&mut self, conn: ConnId, data: Vec<u8>) {
        let hold = self.hold_acks;
        let Some(tcp) = self.tcp.get_mut(&conn) else {
            return;
        };
        let link = tcp.link;
        tcp.outstanding = Some(data.clone());
        self.log(conn).submissions.push(data.len());
        match link {
            Link::Loop(peer) => {
                if let Some(peer) = self.tcp.get_mut(&peer) {
                    peer.inbound.push_back(Segment { data, from: Some(conn) });
                }
            }
            Link::External if !hold => self.acknowledge(conn),
            Link::External => {}
        }
    }

    fn route_udp(&mut self, from: SocketAddrV4, to: SocketAddrV4, data: Vec<u8>) -> bool {
        if *to.ip() != self.addr {
            return false;
        }
        match self.udp.values_mut().find(|udp| udp.local_port == to.port()) {
            Some(udp) => {
                udp.inbound.push_back((from, data));
                true
            }
            None => false,
        }
    }

    /// Next connection with deliverable events, round robin.
    fn next_busy(&mut self) -> Option<Work> {
        let start = self.cursor;
        let tcp = self
            .tcp
            .range(start..)
            .chain(self.tcp.range(..start))
            .find(|(_, tcp)| tcp.has_work())
            .map(|(id, _)| Work::Tcp(*id));
        let work = tcp.or_else(|| {
            self.udp
                .iter()
                .find(|(_, udp)| !udp.inbound.is_empty())
                .map(|(id, _)| Work::Udp(*id))
        });
        if let Some(Work::Tcp(id) | Work::Udp(id)) = work {
            self.cursor = id + 1;
        }
        work
    }

    fn tcp_call(&mut self, conn: ConnId, poll: bool) -> Option<TcpCall> {
        let mss = self.mss;
        let tcp = self.tcp.get_mut(&conn)?;
        let mut events = core::mem::take(&mut tcp.pending);
        let mut data = Vec::new();
        let mut from = None;
        if !events.contains(TcpEvents::ABORTED) {
            if let Some(segment) = tcp.inbound.pop_front() {
                events |= TcpEvents::NEWDATA;
                data = segment.data;
                from = segment.from;
            } else if tcp.peer_closed {
                events |= TcpEvents::CLOSED;
            }
        }
        if poll && events.is_empty() {
            events = TcpEvents::POLL;
        }
        if events.is_empty() {
            return None;
        }
        Some(TcpCall {
            events,
            conn,
            app: tcp.app,
            local_port: tcp.local_port,
            remote: tcp.remote,
            data,
            from,
            mss,
            sent: None,
            close: false,
            abort: false,
        })
    }

    fn apply_tcp(&mut self, call: TcpCall) {
        let conn = call.conn;
        if let Some(tcp) = self.tcp.get_mut(&conn) {
            tcp.app = call.app;
        }
        if call.abort {
            log::debug!("sim: conn {} aborted locally", conn);
            self.reset(conn);
        } else {
            if let Some(from) = call.from {
                self.acknowledge(from);
            }
            if let Some(data) = call.sent {
                self.transmit(conn, data);
            }
            if call.close {
                self.close(conn);
            }
        }
        if call
            .events
            .intersects(TcpEvents::ABORTED | TcpEvents::TIMEDOUT | TcpEvents::CLOSED)
        {
            self.tcp.remove(&conn);
        }
    }

    fn udp_call(&mut self, conn: ConnId, poll: bool) -> Option<UdpCall> {
        let udp = self.udp.get_mut(&conn)?;
        let (events, remote, data) = match udp.inbound.pop_front() {
            Some((from, data)) => (UdpEvents::NEWDATA, from, data),
            None if poll => (UdpEvents::POLL, udp.remote, Vec::new()),
            None => return None,
        };
        Some(UdpCall {
            events,
            conn,
            app: udp.app,
            local_port: udp.local_port,
            remote,
            target: udp.remote,
            data,
            sent: None,
            remove: false,
        })
    }

    fn apply_udp(&mut self, call: UdpCall) {
        let conn = call.conn;
        if let Some(udp) = self.udp.get_mut(&conn) {
            udp.app = call.app;
        }
        if let Some(data) = call.sent {
            let from = SocketAddrV4::new(self.addr, call.local_port);
            if !self.route_udp(from, call.target, data.clone()) {
                self.log(conn).datagrams.push(data);
            }
        }
        if call.remove {
            self.udp.remove(&conn);
        }
    }
}

#[derive(Clone, Copy)]
enum Work {
    Tcp(ConnId),
    Udp(ConnId),
}

struct TcpCall {
    events: TcpEvents,
    conn: ConnId,
    app: Option<SocketId>,
    local_port: u16,
    remote: SocketAddrV4,
    data: Vec<u8>,
    from: Option<ConnId>,
    mss: usize,
    sent: Option<Vec<u8>>,
    close: bool,
    abort: bool,
}

impl TcpContext for TcpCall {
    fn events(&self) -> TcpEvents {
        self.events
    }

    fn conn(&self) -> ConnId {
        self.conn
    }

    fn app(&self) -> Option<SocketId> {
        self.app
    }

    fn set_app(&mut self, app: Option<SocketId>) {
        self.app = app;
    }

    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn remote(&self) -> SocketAddrV4 {
        self.remote
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn mss(&self) -> usize {
        self.mss
    }

    fn send(&mut self, data: &[u8]) -> usize {
        let len = data.len().min(self.mss);
        self.sent = Some(data[..len].to_vec());
        len
    }

    fn close(&mut self) {
        self.close = true;
    }

    fn abort(&mut self) {
        self.abort = true;
    }
}

struct UdpCall {
    events: UdpEvents,
    conn: ConnId,
    app: Option<SocketId>,
    local_port: u16,
    remote: SocketAddrV4,
    target: SocketAddrV4,
    data: Vec<u8>,
    sent: Option<Vec<u8>>,
    remove: bool,
}

impl UdpContext for UdpCall {
    fn events(&self) -> UdpEvents {
        self.events
    }

    fn conn(&self) -> ConnId {
        self.conn
    }

    fn app(&self) -> Option<SocketId> {
        self.app
    }

    fn set_app(&mut self, app: Option<SocketId>) {
        self.app = app;
    }

    fn remote(&self) -> SocketAddrV4 {
        self.remote
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn send(&mut self, data: &[u8]) -> usize {
        self.sent = Some(data.to_vec());
        data.len()
    }

    fn remove(&mut self) {
        self.remove = true;
    }
}

fn lock(net: &Mutex<SimNet>) -> MutexGuard<'_, SimNet> {
    net.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Engine half, owned by the driver task.
pub struct SimEngine {
    net: Arc<Mutex<SimNet>>,
}

/// Test half: plays the remote peers.
#[derive(Clone)]
pub struct SimControl {
    net: Arc<Mutex<SimNet>>,
}

impl SimEngine {
    /// Engine for a host with address `addr`.
    pub fn new(addr: Ipv4Addr) -> (Self, SimControl) {
        let net = Arc::new(Mutex::new(SimNet {
            addr,
            mss: DEFAULT_MSS,
            next_conn: 1,
            next_port: EPHEMERAL_PORT_BASE,
            tcp: BTreeMap::new(),
            udp: BTreeMap::new(),
            listening: BTreeSet::new(),
            reachable: BTreeSet::new(),
            hold_acks: false,
            logs: BTreeMap::new(),
            arp_ticks: 0,
            cursor: 0,
        }));
        (Self { net: net.clone() }, SimControl { net })
    }

    fn run_tcp(&self, conn: ConnId, poll: bool, app: &dyn App) -> bool {
        let call = lock(&self.net).tcp_call(conn, poll);
        let Some(mut call) = call else {
            return false;
        };
        app.on_tcp(&mut call);
        lock(&self.net).apply_tcp(call);
        true
    }

    fn run_udp(&self, conn: ConnId, poll: bool, app: &dyn App) -> bool {
        let call = lock(&self.net).udp_call(conn, poll);
        let Some(mut call) = call else {
            return false;
        };
        app.on_udp(&mut call);
        lock(&self.net).apply_udp(call);
        true
    }

    fn poll_all(&self, app: &dyn App) {
        let (tcp, udp): (Vec<ConnId>, Vec<ConnId>) = {
            let net = lock(&self.net);
            (
                net.tcp
                    .iter()
                    .filter(|(_, tcp)| tcp.app.is_some() && tcp.outstanding.is_none() && !tcp.has_work())
                    .map(|(id, _)| *id)
                    .collect(),
                net.udp
                    .iter()
                    .filter(|(_, udp)| udp.app.is_some())
                    .map(|(id, _)| *id)
                    .collect(),
            )
        };
        for conn in tcp {
            self.run_tcp(conn, true, app);
        }
        for conn in udp {
            self.run_udp(conn, true, app);
        }
    }
}

impl Engine for SimEngine {
    fn tcp_connect(
        &mut self,
        remote: SocketAddrV4,
        local_port: Option<u16>,
        app: SocketId,
    ) -> Result<ConnId, NetError> {
        let mut net = lock(&self.net);
        if net.tcp.len() >= MAX_TCP_CONNS {
            return Err(NetError::NoMem);
        }
        let local_port = match local_port {
            Some(port) => port,
            None => net.ephemeral_port(),
        };
        let id = net.conn_id();
        let local = SocketAddrV4::new(net.addr, local_port);
        let conn = if *remote.ip() == net.addr {
            if net.listening.contains(&remote.port()) {
                let server = net.conn_id();
                let mut accepted = TcpConn::new(None, remote.port(), local, Link::Loop(id));
                accepted.pending = TcpEvents::CONNECTED;
                net.tcp.insert(server, accepted);
                let mut conn = TcpConn::new(Some(app), local_port, remote, Link::Loop(server));
                conn.pending = TcpEvents::CONNECTED;
                conn
            } else {
                let mut conn = TcpConn::new(Some(app), local_port, remote, Link::External);
                conn.pending = TcpEvents::ABORTED;
                conn
            }
        } else {
            // Unknown remotes never answer.
            let mut conn = TcpConn::new(Some(app), local_port, remote, Link::External);
            if net.reachable.contains(&remote) {
                conn.pending = TcpEvents::CONNECTED;
            }
            conn
        };
        log::debug!("sim: conn {} {} -> {}", id, local, remote);
        net.tcp.insert(id, conn);
        Ok(id)
    }

    fn tcp_listen(&mut self, port: u16) -> Result<(), NetError> {
        let mut net = lock(&self.net);
        if net.listening.contains(&port) {
            return Err(NetError::AddrInUse);
        }
        if net.listening.len() >= MAX_LISTEN_PORTS {
            return Err(NetError::NoMem);
        }
        net.listening.insert(port);
        Ok(())
    }

    fn tcp_unlisten(&mut self, port: u16) {
        lock(&self.net).listening.remove(&port);
    }

    fn udp_open(
        &mut self,
        remote: SocketAddrV4,
        local_port: Option<u16>,
        app: SocketId,
    ) -> Result<(ConnId, u16), NetError> {
        let mut net = lock(&self.net);
        if net.udp.len() >= MAX_UDP_CONNS {
            return Err(NetError::NoMem);
        }
        let local_port = match local_port {
            Some(port) => port,
            None => net.ephemeral_port(),
        };
        if net.udp.values().any(|udp| udp.local_port == local_port) {
            return Err(NetError::AddrInUse);
        }
        let id = net.conn_id();
        net.udp.insert(
            id,
            UdpConn {
                app: Some(app),
                local_port,
                remote,
                inbound: VecDeque::new(),
            },
        );
        Ok((id, local_port))
    }

    fn abort(&mut self, conn: ConnId) {
        lock(&self.net).reset(conn);
    }

    fn poll_device(&mut self, _now_ms: u64, app: &dyn App) -> bool {
        let work = lock(&self.net).next_busy();
        match work {
            Some(Work::Tcp(conn)) => self.run_tcp(conn, false, app),
            Some(Work::Udp(conn)) => self.run_udp(conn, false, app),
            None => false,
        }
    }

    fn poll_conns(&mut self, _now_ms: u64, app: &dyn App) {
        self.poll_all(app);
    }

    fn periodic(&mut self, _now_ms: u64, app: &dyn App) {
        self.poll_all(app);
    }

    fn arp_tick(&mut self, _now_ms: u64) {
        lock(&self.net).arp_ticks += 1;
    }
}

impl SimControl {
    /// Local address of the simulated host.
    pub fn addr(&self) -> Ipv4Addr {
        lock(&self.net).addr
    }

    pub fn set_mss(&self, mss: usize) {
        lock(&self.net).mss = mss.max(1);
    }

    /// Let active opens towards `remote` complete.
    pub fn accept_outbound(&self, remote: SocketAddrV4) {
        lock(&self.net).reachable.insert(remote);
    }

    /// Keep submissions to remote peers unacknowledged until released.
    pub fn hold_acks(&self, hold: bool) {
        let mut net = lock(&self.net);
        net.hold_acks = hold;
        if !hold {
            let held: Vec<ConnId> = net
                .tcp
                .iter()
                .filter(|(_, tcp)| tcp.link == Link::External && tcp.outstanding.is_some())
                .map(|(id, _)| *id)
                .collect();
            for conn in held {
                net.acknowledge(conn);
            }
        }
    }

    /// Ask for a retransmission of the unacknowledged submission of `conn`.
    pub fn force_rexmit(&self, conn: ConnId) -> bool {
        let mut net = lock(&self.net);
        match net.tcp.get_mut(&conn) {
            Some(tcp) if tcp.outstanding.is_some() && tcp.link == Link::External => {
                tcp.pending |= TcpEvents::REXMIT;
                true
            }
            _ => false,
        }
    }

    pub fn is_listening(&self, port: u16) -> bool {
        lock(&self.net).listening.contains(&port)
    }

    /// Open a connection from `peer` to local `port`. `None` if nobody
    /// listens there.
    pub fn open_inbound(&self, port: u16, peer: SocketAddrV4) -> Option<ConnId> {
        let mut net = lock(&self.net);
        if !net.listening.contains(&port) {
            return None;
        }
        let id = net.conn_id();
        let mut conn = TcpConn::new(None, port, peer, Link::External);
        conn.pending = TcpEvents::CONNECTED;
        net.tcp.insert(id, conn);
        Some(id)
    }

    /// Data from the remote peer of `conn`.
    pub fn peer_send(&self, conn: ConnId, data: &[u8]) -> bool {
        let mut net = lock(&self.net);
        match net.tcp.get_mut(&conn) {
            Some(tcp) => {
                tcp.inbound.push_back(Segment {
                    data: data.to_vec(),
                    from: None,
                });
                true
            }
            None => false,
        }
    }

    /// Orderly close by the remote peer, after the data sent so far.
    pub fn peer_close(&self, conn: ConnId) -> bool {
        let mut net = lock(&self.net);
        match net.tcp.get_mut(&conn) {
            Some(tcp) => {
                tcp.peer_closed = true;
                true
            }
            None => false,
        }
    }

    /// Acknowledge the held submission of `conn` and close from the remote
    /// side, so both arrive in the same callback.
    pub fn peer_ack_and_close(&self, conn: ConnId) -> bool {
        let mut net = lock(&self.net);
        if !net.tcp.get(&conn).is_some_and(|tcp| tcp.outstanding.is_some()) {
            return false;
        }
        net.acknowledge(conn);
        if let Some(tcp) = net.tcp.get_mut(&conn) {
            tcp.peer_closed = true;
        }
        true
    }

    /// Reset by the remote peer; pending data is lost.
    pub fn peer_abort(&self, conn: ConnId) -> bool {
        let mut net = lock(&self.net);
        match net.tcp.get_mut(&conn) {
            Some(tcp) => {
                tcp.inbound.clear();
                tcp.pending |= TcpEvents::ABORTED;
                true
            }
            None => false,
        }
    }

    /// Datagram from `from` to local `port`.
    pub fn inject_udp(&self, port: u16, from: SocketAddrV4, data: &[u8]) -> bool {
        let mut net = lock(&self.net);
        let to = SocketAddrV4::new(net.addr, port);
        net.route_udp(from, to, data.to_vec())
    }

    /// Engine connection currently attached to socket `sock`.
    pub fn conn_of(&self, sock: SocketId) -> Option<ConnId> {
        let net = lock(&self.net);
        net.tcp
            .iter()
            .find(|(_, tcp)| tcp.app == Some(sock))
            .map(|(id, _)| *id)
            .or_else(|| {
                net.udp
                    .iter()
                    .find(|(_, udp)| udp.app == Some(sock))
                    .map(|(id, _)| *id)
            })
    }

    pub fn is_open(&self, conn: ConnId) -> bool {
        let net = lock(&self.net);
        net.tcp.contains_key(&conn) || net.udp.contains_key(&conn)
    }

    pub fn open_conns(&self) -> usize {
        let net = lock(&self.net);
        net.tcp.len() + net.udp.len()
    }

    /// Sizes of the segments the socket layer submitted on `conn`.
    pub fn submissions(&self, conn: ConnId) -> Vec<usize> {
        lock(&self.net)
            .logs
            .get(&conn)
            .map(|log| log.submissions.clone())
            .unwrap_or_default()
    }

    /// Acknowledged bytes the remote peer of `conn` received.
    pub fn received(&self, conn: ConnId) -> Vec<u8> {
        lock(&self.net)
            .logs
            .get(&conn)
            .map(|log| log.received.clone())
            .unwrap_or_default()
    }

    /// Datagrams `conn` sent to non-local destinations.
    pub fn datagrams(&self, conn: ConnId) -> Vec<Vec<u8>> {
        lock(&self.net)
            .logs
            .get(&conn)
            .map(|log| log.datagrams.clone())
            .unwrap_or_default()
    }

    /// The socket layer closed `conn` in an orderly way.
    pub fn closed_locally(&self, conn: ConnId) -> bool {
        lock(&self.net).logs.get(&conn).is_some_and(|log| log.closed)
    }

    /// The socket layer reset `conn`.
    pub fn aborted_locally(&self, conn: ConnId) -> bool {
        lock(&self.net).logs.get(&conn).is_some_and(|log| log.aborted)
    }

    pub fn arp_ticks(&self) -> usize {
        lock(&self.net).arp_ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;

    /// Records the callbacks it sees and echoes TCP data back.
    #[derive(Default)]
    struct Echo {
        seen: RefCell<Vec<TcpEvents>>,
    }

    impl App for Echo {
        fn on_tcp(&self, ctx: &mut dyn TcpContext) {
            self.seen.borrow_mut().push(ctx.events());
            if ctx.app().is_none() {
                ctx.set_app(Some(7));
            }
            if ctx.events().contains(TcpEvents::NEWDATA) {
                let data = ctx.data().to_vec();
                ctx.send(&data);
            }
        }

        fn on_udp(&self, _ctx: &mut dyn UdpContext) {}
    }

    fn peer() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 4000)
    }

    #[test]
    fn inbound_data_is_echoed_and_acknowledged() {
        let (mut engine, control) = SimEngine::new(Ipv4Addr::new(10, 0, 0, 1));
        let app = Echo::default();
        engine.tcp_listen(80).unwrap();
        let conn = control.open_inbound(80, peer()).unwrap();
        control.peer_send(conn, b"ping");
        assert!(engine.poll_device(0, &app));
        assert_eq!(
            app.seen.borrow()[0],
            TcpEvents::CONNECTED | TcpEvents::NEWDATA
        );
        assert_eq!(control.received(conn), b"ping");
        assert_eq!(control.conn_of(7), Some(conn));
        assert!(engine.poll_device(0, &app));
        assert_eq!(app.seen.borrow()[1], TcpEvents::ACKED);
        assert!(!engine.poll_device(0, &app));
    }

    #[test]
    fn connect_to_closed_local_port_is_reset() {
        let (mut engine, _control) = SimEngine::new(Ipv4Addr::new(10, 0, 0, 1));
        let app = Echo::default();
        let remote = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 81);
        engine.tcp_connect(remote, None, 3).unwrap();
        assert!(engine.poll_device(0, &app));
        assert_eq!(app.seen.borrow()[0], TcpEvents::ABORTED);
        assert!(!engine.poll_device(0, &app));
    }

    #[test]
    fn listen_ports_are_exclusive_and_bounded() {
        let (mut engine, control) = SimEngine::new(Ipv4Addr::new(10, 0, 0, 1));
        engine.tcp_listen(80).unwrap();
        assert_eq!(engine.tcp_listen(80), Err(NetError::AddrInUse));
        for port in 1..MAX_LISTEN_PORTS as u16 {
            engine.tcp_listen(1000 + port).unwrap();
        }
        assert_eq!(engine.tcp_listen(2000), Err(NetError::NoMem));
        engine.tcp_unlisten(80);
        assert!(!control.is_listening(80));
    }
}
