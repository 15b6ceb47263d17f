//! Boundary between the socket layer and the protocol engine.
//!
//! The engine is single threaded and only ever driven by the network driver
//! task. It reports progress through one callback per connection event; the
//! callback sees the connection through a [`TcpContext`] or [`UdpContext`]
//! which is valid for that call only.

use core::net::SocketAddrV4;

use crate::{NetError, SocketId};

/// Engine-side connection index.
pub type ConnId = usize;

bitflags::bitflags! {
    /// Conditions reported with one TCP callback. Several may be set at once.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct TcpEvents: u8 {
        /// Handshake completed (active or passive open).
        const CONNECTED = 1 << 0;
        /// Connection reset by the peer.
        const ABORTED = 1 << 1;
        /// Retransmissions exhausted.
        const TIMEDOUT = 1 << 2;
        /// The last submission was acknowledged.
        const ACKED = 1 << 3;
        /// `data()` holds new inbound bytes.
        const NEWDATA = 1 << 4;
        /// The last submission must be sent again.
        const REXMIT = 1 << 5;
        /// The peer closed its side.
        const CLOSED = 1 << 6;
        /// Idle tick; nothing is outstanding.
        const POLL = 1 << 7;
    }
}

bitflags::bitflags! {
    /// Conditions reported with one UDP callback.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct UdpEvents: u8 {
        const NEWDATA = 1 << 0;
        const POLL = 1 << 1;
    }
}

/// One TCP callback's view of its connection.
pub trait TcpContext {
    fn events(&self) -> TcpEvents;
    fn conn(&self) -> ConnId;
    /// Socket attached to this connection, if any.
    fn app(&self) -> Option<SocketId>;
    fn set_app(&mut self, app: Option<SocketId>);
    fn local_port(&self) -> u16;
    fn remote(&self) -> SocketAddrV4;
    /// Inbound bytes; only meaningful with [`TcpEvents::NEWDATA`].
    fn data(&self) -> &[u8];
    /// Largest payload a single [`TcpContext::send`] accepts.
    fn mss(&self) -> usize;
    /// Queue one segment, copying the payload. Returns the bytes taken,
    /// at most `mss()`.
    fn send(&mut self, data: &[u8]) -> usize;
    fn close(&mut self);
    fn abort(&mut self);
}

/// One UDP callback's view of its endpoint.
pub trait UdpContext {
    fn events(&self) -> UdpEvents;
    fn conn(&self) -> ConnId;
    fn app(&self) -> Option<SocketId>;
    fn set_app(&mut self, app: Option<SocketId>);
    fn remote(&self) -> SocketAddrV4;
    fn data(&self) -> &[u8];
    /// Send one datagram to the connected remote, copying the payload.
    fn send(&mut self, data: &[u8]) -> usize;
    /// Release the endpoint.
    fn remove(&mut self);
}

/// Callbacks the engine invokes; implemented by the socket layer.
pub trait App {
    fn on_tcp(&self, ctx: &mut dyn TcpContext);
    fn on_udp(&self, ctx: &mut dyn UdpContext);
}

/// Protocol engine driven by the network driver task.
///
/// Every method runs on the driver task only. Methods taking an [`App`] may
/// invoke its callbacks any number of times before returning.
pub trait Engine {
    /// Start an active open. `CONNECTED` or `ABORTED` follows later.
    fn tcp_connect(
        &mut self,
        remote: SocketAddrV4,
        local_port: Option<u16>,
        app: SocketId,
    ) -> Result<ConnId, NetError>;
    fn tcp_listen(&mut self, port: u16) -> Result<(), NetError>;
    fn tcp_unlisten(&mut self, port: u16);
    /// Open a UDP endpoint; returns it with the local port it is bound to.
    fn udp_open(
        &mut self,
        remote: SocketAddrV4,
        local_port: Option<u16>,
        app: SocketId,
    ) -> Result<(ConnId, u16), NetError>;
    /// Reset a connection and forget its socket without a callback.
    fn abort(&mut self, conn: ConnId);

    /// Poll the device and feed at most one inbound frame through the
    /// engine. Returns true if a frame was delivered.
    fn poll_device(&mut self, now_ms: u64, app: &dyn App) -> bool;
    /// Transmit pass: offer every connection a `POLL` callback.
    fn poll_conns(&mut self, now_ms: u64, app: &dyn App);
    /// Periodic protocol timers.
    fn periodic(&mut self, now_ms: u64, app: &dyn App);
    /// Address-resolution cache aging.
    fn arp_tick(&mut self, now_ms: u64);
}
