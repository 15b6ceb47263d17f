//! [`Engine`] on top of a smoltcp interface.
//!
//! smoltcp does all protocol work; this module only turns socket state
//! changes into the per-connection callbacks the socket layer expects.
//! Every listened port keeps one socket armed in `Listen`; when it picks
//! up a connection it becomes an inbound connection and a fresh socket is
//! armed for the port.

use core::net::{Ipv4Addr, SocketAddrV4};

use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet, SocketStorage};
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer as TcpSocketBuffer, State as TcpState};
use smoltcp::socket::udp::{PacketBuffer as UdpPacketBuffer, PacketMetadata as UdpPacketMetadata, Socket as UdpSocket};
use smoltcp::time::Instant;
use smoltcp::wire::{EthernetAddress, IpAddress, IpCidr, IpEndpoint, Ipv4Address};

use crate::config::{EPHEMERAL_PORT_BASE, MAX_LISTEN_PORTS, MAX_TCP_CONNS, MAX_UDP_CONNS};
use crate::engine::{App, ConnId, Engine, TcpContext, TcpEvents, UdpContext, UdpEvents};
use crate::{NetDevice, NetError, SocketId};

const NET_MTU: usize = 1500;
const NET_BUF_SIZE: usize = 2048;
const TCP_BUF_LEN: usize = 2048;
const TCP_MSS: usize = 1460;
const UDP_BUF_LEN: usize = 2048;
const UDP_META_LEN: usize = 4;
/// Connections plus one armed listener per port.
const TCP_SLOTS: usize = MAX_TCP_CONNS + MAX_LISTEN_PORTS;
const SOCKET_SLOTS: usize = TCP_SLOTS + MAX_UDP_CONNS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Address plan of the interface.
pub struct IfaceConfig {
    pub addr: Ipv4Addr,
    pub prefix: u8,
    pub gateway: Option<Ipv4Addr>,
}

struct TcpBuffers {
    rx: [u8; TCP_BUF_LEN],
    tx: [u8; TCP_BUF_LEN],
}

struct UdpBuffers {
    rx_meta: [UdpPacketMetadata; UDP_META_LEN],
    rx: [u8; UDP_BUF_LEN],
    tx_meta: [UdpPacketMetadata; UDP_META_LEN],
    tx: [u8; UDP_BUF_LEN],
}

impl TcpBuffers {
    const EMPTY: Self = Self {
        rx: [0; TCP_BUF_LEN],
        tx: [0; TCP_BUF_LEN],
    };
}

impl UdpBuffers {
    const EMPTY: Self = Self {
        rx_meta: [UdpPacketMetadata::EMPTY; UDP_META_LEN],
        rx: [0; UDP_BUF_LEN],
        tx_meta: [UdpPacketMetadata::EMPTY; UDP_META_LEN],
        tx: [0; UDP_BUF_LEN],
    };
}

/// Every buffer the engine needs, allocated once by the caller.
pub struct SmolStorage {
    sockets: [SocketStorage<'static>; SOCKET_SLOTS],
    tcp: [TcpBuffers; TCP_SLOTS],
    udp: [UdpBuffers; MAX_UDP_CONNS],
    rx_frame: [u8; NET_BUF_SIZE],
    tx_frame: [u8; NET_BUF_SIZE],
    scratch: [u8; TCP_BUF_LEN],
}

impl SmolStorage {
    pub const fn new() -> Self {
        Self {
            sockets: [SocketStorage::EMPTY; SOCKET_SLOTS],
            tcp: [TcpBuffers::EMPTY; TCP_SLOTS],
            udp: [UdpBuffers::EMPTY; MAX_UDP_CONNS],
            rx_frame: [0; NET_BUF_SIZE],
            tx_frame: [0; NET_BUF_SIZE],
            scratch: [0; TCP_BUF_LEN],
        }
    }
}

impl Default for SmolStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// smoltcp device over a [`NetDevice`].
pub struct SmolDevice<D: NetDevice> {
    dev: D,
    rx: &'static mut [u8; NET_BUF_SIZE],
    tx: &'static mut [u8; NET_BUF_SIZE],
}

pub struct SmolRxToken<'a> {
    frame: &'a mut [u8],
}

pub struct SmolTxToken<'a, D: NetDevice> {
    dev: &'a D,
    buf: &'a mut [u8],
}

impl<D: NetDevice> Device for SmolDevice<D> {
    type RxToken<'a> = SmolRxToken<'a> where Self: 'a;
    type TxToken<'a> = SmolTxToken<'a, D> where Self: 'a;

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.max_transmission_unit = NET_MTU;
        caps.medium = Medium::Ethernet;
        caps
    }

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        if !self.dev.poll() {
            return None;
        }
        let len = self.dev.recv(&mut self.rx[..]).ok()?.min(NET_BUF_SIZE);
        Some((
            SmolRxToken {
                frame: &mut self.rx[..len],
            },
            SmolTxToken {
                dev: &self.dev,
                buf: &mut self.tx[..],
            },
        ))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(SmolTxToken {
            dev: &self.dev,
            buf: &mut self.tx[..],
        })
    }
}

impl RxToken for SmolRxToken<'_> {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(self.frame)
    }
}

impl<D: NetDevice> TxToken for SmolTxToken<'_, D> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        if len > self.buf.len() {
            log::warn!("smol: dropping oversized frame of {} bytes", len);
            return f(&mut []);
        }
        let buf = &mut self.buf[..len];
        let result = f(&mut *buf);
        if self.dev.send(buf).is_err() {
            log::warn!("smol: device refused a {} byte frame", len);
        }
        result
    }
}

fn endpoint(addr: SocketAddrV4) -> IpEndpoint {
    IpEndpoint::new(IpAddress::Ipv4(Ipv4Address(addr.ip().octets())), addr.port())
}

fn socket_addr(endpoint: Option<IpEndpoint>) -> SocketAddrV4 {
    match endpoint {
        Some(IpEndpoint {
            addr: IpAddress::Ipv4(addr),
            port,
        }) => SocketAddrV4::new(Ipv4Addr::from(addr.0), port),
        #[allow(unreachable_patterns)]
        _ => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TcpRole {
    Free,
    /// Armed for inbound connections on the port.
    Listen(u16),
    Active,
    /// Closed or reset locally; recycled once smoltcp lets go.
    Closing,
}

struct TcpSlot {
    handle: SocketHandle,
    role: TcpRole,
    app: Option<SocketId>,
    established: bool,
    /// A submission is queued and not yet acknowledged.
    sent: bool,
}

impl TcpSlot {
    fn new(handle: SocketHandle) -> Self {
        Self {
            handle,
            role: TcpRole::Free,
            app: None,
            established: false,
            sent: false,
        }
    }
}

struct UdpSlot {
    handle: SocketHandle,
    open: bool,
    app: Option<SocketId>,
    remote: SocketAddrV4,
}

struct SmolTcp<'a> {
    events: TcpEvents,
    conn: ConnId,
    slot: &'a mut TcpSlot,
    socket: &'a mut TcpSocket<'static>,
    data: &'a [u8],
}

impl TcpContext for SmolTcp<'_> {
    fn events(&self) -> TcpEvents {
        self.events
    }

    fn conn(&self) -> ConnId {
        self.conn
    }

    fn app(&self) -> Option<SocketId> {
        self.slot.app
    }

    fn set_app(&mut self, app: Option<SocketId>) {
        self.slot.app = app;
    }

    fn local_port(&self) -> u16 {
        self.socket.local_endpoint().map_or(0, |ep| ep.port)
    }

    fn remote(&self) -> SocketAddrV4 {
        socket_addr(self.socket.remote_endpoint())
    }

    fn data(&self) -> &[u8] {
        self.data
    }

    fn mss(&self) -> usize {
        TCP_MSS
    }

    fn send(&mut self, data: &[u8]) -> usize {
        let len = data.len().min(TCP_MSS);
        match self.socket.send_slice(&data[..len]) {
            Ok(sent) => {
                self.slot.sent |= sent > 0;
                sent
            }
            Err(_) => 0,
        }
    }

    fn close(&mut self) {
        self.socket.close();
        self.slot.role = TcpRole::Closing;
    }

    fn abort(&mut self) {
        self.socket.abort();
        self.slot.role = TcpRole::Closing;
    }
}

struct SmolUdp<'a> {
    events: UdpEvents,
    conn: ConnId,
    slot: &'a mut UdpSlot,
    socket: &'a mut UdpSocket<'static>,
    remote: SocketAddrV4,
    data: &'a [u8],
}

impl UdpContext for SmolUdp<'_> {
    fn events(&self) -> UdpEvents {
        self.events
    }

    fn conn(&self) -> ConnId {
        self.conn
    }

    fn app(&self) -> Option<SocketId> {
        self.slot.app
    }

    fn set_app(&mut self, app: Option<SocketId>) {
        self.slot.app = app;
    }

    fn remote(&self) -> SocketAddrV4 {
        self.remote
    }

    fn data(&self) -> &[u8] {
        self.data
    }

    fn send(&mut self, data: &[u8]) -> usize {
        match self.socket.send_slice(data, endpoint(self.slot.remote)) {
            Ok(()) => data.len(),
            Err(_) => {
                log::warn!("smol: udp conn {} send queue full", self.conn);
                0
            }
        }
    }

    fn remove(&mut self) {
        self.socket.close();
        self.slot.open = false;
    }
}

/// smoltcp interface, sockets and device, owned by the driver task.
pub struct SmolEngine<D: NetDevice> {
    iface: Interface,
    device: SmolDevice<D>,
    sockets: SocketSet<'static>,
    tcp: [TcpSlot; TCP_SLOTS],
    udp: [UdpSlot; MAX_UDP_CONNS],
    listen_ports: [Option<u16>; MAX_LISTEN_PORTS],
    scratch: &'static mut [u8; TCP_BUF_LEN],
    next_port: u16,
}

impl<D: NetDevice> SmolEngine<D> {
    pub fn new(dev: D, storage: &'static mut SmolStorage, config: IfaceConfig, now_ms: u64) -> Self {
        let SmolStorage {
            sockets,
            tcp,
            udp,
            rx_frame,
            tx_frame,
            scratch,
        } = storage;
        let mut set = SocketSet::new(&mut sockets[..]);
        let tcp = tcp.each_mut().map(|bufs| {
            let TcpBuffers { rx, tx } = bufs;
            let socket = TcpSocket::new(TcpSocketBuffer::new(&mut rx[..]), TcpSocketBuffer::new(&mut tx[..]));
            TcpSlot::new(set.add(socket))
        });
        let udp = udp.each_mut().map(|bufs| {
            let UdpBuffers {
                rx_meta,
                rx,
                tx_meta,
                tx,
            } = bufs;
            let socket = UdpSocket::new(
                UdpPacketBuffer::new(&mut rx_meta[..], &mut rx[..]),
                UdpPacketBuffer::new(&mut tx_meta[..], &mut tx[..]),
            );
            UdpSlot {
                handle: set.add(socket),
                open: false,
                app: None,
                remote: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            }
        });

        let mac = dev.mac_address();
        let mut device = SmolDevice {
            dev,
            rx: rx_frame,
            tx: tx_frame,
        };
        let mut iface_config = Config::new(EthernetAddress(mac).into());
        iface_config.random_seed = u64::from_le_bytes([mac[0], mac[1], mac[2], mac[3], mac[4], mac[5], 0x5a, 0xa5]);
        let mut iface = Interface::new(iface_config, &mut device, Instant::from_millis(now_ms as i64));
        let cidr = IpCidr::new(IpAddress::Ipv4(Ipv4Address(config.addr.octets())), config.prefix);
        iface.update_ip_addrs(|addrs| {
            if addrs.push(cidr).is_err() {
                log::warn!("smol: no room for address {}", cidr);
            }
        });
        if let Some(gateway) = config.gateway {
            if iface
                .routes_mut()
                .add_default_ipv4_route(Ipv4Address(gateway.octets()))
                .is_err()
            {
                log::warn!("smol: no room for default route via {}", gateway);
            }
        }
        log::info!("smol: interface up as {}/{}", config.addr, config.prefix);

        Self {
            iface,
            device,
            sockets: set,
            tcp,
            udp,
            listen_ports: [None; MAX_LISTEN_PORTS],
            scratch,
            next_port: EPHEMERAL_PORT_BASE,
        }
    }

    fn ephemeral_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = self.next_port.checked_add(1).unwrap_or(EPHEMERAL_PORT_BASE);
        port
    }

    fn pump(&mut self, now_ms: u64) -> bool {
        self.iface
            .poll(Instant::from_millis(now_ms as i64), &mut self.device, &mut self.sockets)
    }

    /// Put a free socket into `Listen` on `port`.
    fn arm(&mut self, port: u16) -> Result<(), NetError> {
        let Some(slot) = self.tcp.iter_mut().find(|slot| slot.role == TcpRole::Free) else {
            return Err(NetError::NoMem);
        };
        let socket = self.sockets.get_mut::<TcpSocket>(slot.handle);
        socket.listen(port).map_err(|_| NetError::AddrInUse)?;
        slot.role = TcpRole::Listen(port);
        Ok(())
    }

    /// Turn listeners that picked up a connection into inbound connections
    /// and re-arm their ports.
    fn promote_listeners(&mut self) {
        for index in 0..TCP_SLOTS {
            let TcpRole::Listen(port) = self.tcp[index].role else {
                continue;
            };
            let socket = self.sockets.get::<TcpSocket>(self.tcp[index].handle);
            if socket.state() == TcpState::Listen {
                continue;
            }
            let slot = &mut self.tcp[index];
            slot.role = TcpRole::Active;
            slot.app = None;
            slot.established = false;
            slot.sent = false;
            if self.listen_ports.contains(&Some(port)) && self.arm(port).is_err() {
                log::warn!("smol: no socket left to keep listening on {}", port);
            }
        }
    }

    /// Recycle sockets smoltcp has finished with.
    fn sweep(&mut self) {
        for slot in self.tcp.iter_mut().filter(|slot| slot.role == TcpRole::Closing) {
            let socket = self.sockets.get_mut::<TcpSocket>(slot.handle);
            match socket.state() {
                TcpState::Closed => *slot = TcpSlot::new(slot.handle),
                TcpState::TimeWait => socket.abort(),
                _ => {}
            }
        }
    }

    fn dispatch_tcp(&mut self, app: &dyn App, poll: bool) -> bool {
        let mut delivered = false;
        for (conn, slot) in self.tcp.iter_mut().enumerate() {
            if slot.role != TcpRole::Active {
                continue;
            }
            let socket = self.sockets.get_mut::<TcpSocket>(slot.handle);
            let state = socket.state();
            let mut events = TcpEvents::empty();
            if state == TcpState::Closed {
                events |= TcpEvents::ABORTED;
            } else if !slot.established && matches!(state, TcpState::Established | TcpState::CloseWait) {
                slot.established = true;
                events |= TcpEvents::CONNECTED;
            }
            let mut len = 0;
            if slot.established && !events.contains(TcpEvents::ABORTED) {
                if slot.sent && socket.send_queue() == 0 {
                    slot.sent = false;
                    events |= TcpEvents::ACKED;
                }
                if socket.can_recv() {
                    len = socket.recv_slice(&mut self.scratch[..]).unwrap_or(0);
                    if len > 0 {
                        events |= TcpEvents::NEWDATA;
                    }
                } else if !socket.may_recv() {
                    events |= TcpEvents::CLOSED;
                }
            }
            if events.is_empty() && poll && slot.established && !slot.sent && slot.app.is_some() {
                events = TcpEvents::POLL;
            }
            if events.is_empty() {
                continue;
            }
            delivered = true;
            let mut ctx = SmolTcp {
                events,
                conn,
                slot: &mut *slot,
                socket: &mut *socket,
                data: &self.scratch[..len],
            };
            app.on_tcp(&mut ctx);
            if events.intersects(TcpEvents::ABORTED | TcpEvents::CLOSED) && slot.role == TcpRole::Active {
                log::debug!("smol: conn {} done ({:?})", conn, events);
                socket.close();
                slot.role = TcpRole::Closing;
                slot.app = None;
            }
        }
        delivered
    }

    fn dispatch_udp(&mut self, app: &dyn App, poll: bool) -> bool {
        let mut delivered = false;
        for (conn, slot) in self.udp.iter_mut().enumerate() {
            if !slot.open {
                continue;
            }
            let socket = self.sockets.get_mut::<UdpSocket>(slot.handle);
            while slot.open && socket.can_recv() {
                let Ok((len, meta)) = socket.recv_slice(&mut self.scratch[..]) else {
                    break;
                };
                delivered = true;
                let mut ctx = SmolUdp {
                    events: UdpEvents::NEWDATA,
                    conn,
                    slot: &mut *slot,
                    socket: &mut *socket,
                    remote: socket_addr(Some(meta.endpoint)),
                    data: &self.scratch[..len],
                };
                app.on_udp(&mut ctx);
            }
            if poll && slot.open && slot.app.is_some() {
                let remote = slot.remote;
                let mut ctx = SmolUdp {
                    events: UdpEvents::POLL,
                    conn,
                    slot: &mut *slot,
                    socket: &mut *socket,
                    remote,
                    data: &[],
                };
                app.on_udp(&mut ctx);
            }
            if !slot.open {
                slot.app = None;
            }
        }
        delivered
    }

    fn dispatch(&mut self, app: &dyn App, poll: bool) -> bool {
        self.promote_listeners();
        let tcp = self.dispatch_tcp(app, poll);
        let udp = self.dispatch_udp(app, poll);
        self.sweep();
        tcp || udp
    }
}

impl<D: NetDevice> Engine for SmolEngine<D> {
    fn tcp_connect(
        &mut self,
        remote: SocketAddrV4,
        local_port: Option<u16>,
        app: SocketId,
    ) -> Result<ConnId, NetError> {
        let local_port = match local_port {
            Some(port) => port,
            None => self.ephemeral_port(),
        };
        let Some(conn) = self.tcp.iter().position(|slot| slot.role == TcpRole::Free) else {
            return Err(NetError::NoMem);
        };
        let slot = &mut self.tcp[conn];
        let socket = self.sockets.get_mut::<TcpSocket>(slot.handle);
        socket
            .connect(self.iface.context(), endpoint(remote), local_port)
            .map_err(|err| {
                log::warn!("smol: connect to {} failed: {:?}", remote, err);
                NetError::Unreachable
            })?;
        slot.role = TcpRole::Active;
        slot.app = Some(app);
        slot.established = false;
        slot.sent = false;
        Ok(conn)
    }

    fn tcp_listen(&mut self, port: u16) -> Result<(), NetError> {
        if self.listen_ports.contains(&Some(port)) {
            return Err(NetError::AddrInUse);
        }
        let Some(free) = self.listen_ports.iter().position(Option::is_none) else {
            return Err(NetError::NoMem);
        };
        self.arm(port)?;
        self.listen_ports[free] = Some(port);
        Ok(())
    }

    fn tcp_unlisten(&mut self, port: u16) {
        for entry in self.listen_ports.iter_mut().filter(|entry| **entry == Some(port)) {
            *entry = None;
        }
        for slot in self.tcp.iter_mut().filter(|slot| slot.role == TcpRole::Listen(port)) {
            self.sockets.get_mut::<TcpSocket>(slot.handle).close();
            slot.role = TcpRole::Free;
        }
    }

    fn udp_open(
        &mut self,
        remote: SocketAddrV4,
        local_port: Option<u16>,
        app: SocketId,
    ) -> Result<(ConnId, u16), NetError> {
        let local_port = match local_port {
            Some(port) => port,
            None => self.ephemeral_port(),
        };
        let Some(conn) = self.udp.iter().position(|slot| !slot.open) else {
            return Err(NetError::NoMem);
        };
        let slot = &mut self.udp[conn];
        let socket = self.sockets.get_mut::<UdpSocket>(slot.handle);
        socket.bind(local_port).map_err(|_| NetError::AddrInUse)?;
        slot.open = true;
        slot.app = Some(app);
        slot.remote = remote;
        Ok((conn, local_port))
    }

    fn abort(&mut self, conn: ConnId) {
        if let Some(slot) = self.tcp.get_mut(conn) {
            if slot.role == TcpRole::Active {
                self.sockets.get_mut::<TcpSocket>(slot.handle).abort();
                slot.role = TcpRole::Closing;
                slot.app = None;
            }
        }
    }

    fn poll_device(&mut self, now_ms: u64, app: &dyn App) -> bool {
        let activity = self.pump(now_ms);
        let delivered = self.dispatch(app, false);
        if delivered {
            self.pump(now_ms);
        }
        activity || delivered
    }

    fn poll_conns(&mut self, now_ms: u64, app: &dyn App) {
        if self.dispatch(app, true) {
            self.pump(now_ms);
        }
    }

    fn periodic(&mut self, now_ms: u64, app: &dyn App) {
        self.pump(now_ms);
        self.poll_conns(now_ms, app);
    }

    fn arp_tick(&mut self, _now_ms: u64) {
        // smoltcp ages its neighbor cache on every poll.
        log::trace!("smol: arp tick");
    }
}
