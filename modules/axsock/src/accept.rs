//! Hand-over of inbound TCP connections to the socket layer.
//!
//! The first callback of a passively opened connection carries no socket.
//! It is either given to the registered [`AcceptHook`] or parked on the
//! listening record of its port until a task blocked in `accept` takes it.

use core::net::SocketAddrV4;

use axsync::{deadline_ms, Port, Signal};

use crate::engine::TcpContext;
use crate::state::{Inbound, SockState};
use crate::{NetError, NetStack, SocketId};

/// Process-wide acceptor, called on the driver task for every inbound
/// connection. It must not block; typically it hands `sock` to a worker.
pub trait AcceptHook: Sync {
    /// `sock` is allocated, attached and in `Busy`. An error rejects the
    /// connection and releases the socket.
    fn accept(&self, sock: SocketId, local_port: u16, peer: SocketAddrV4) -> Result<(), NetError>;
}

impl<P: Port, const N: usize> NetStack<P, N> {
    /// Give the inbound connection of `ctx` a socket. On failure the
    /// connection is aborted and `None` returned.
    pub(crate) fn rendezvous(&self, ctx: &mut dyn TcpContext) -> Option<SocketId> {
        let port = ctx.local_port();
        let peer = ctx.remote();
        let sock = match self.hook.get() {
            Some(hook) => self.accept_by_hook(*hook, ctx, port, peer),
            None => self.accept_by_listener(ctx, port, peer),
        };
        if sock.is_none() {
            ctx.abort();
        }
        sock
    }

    fn accept_by_hook(
        &self,
        hook: &dyn AcceptHook,
        ctx: &mut dyn TcpContext,
        port: u16,
        peer: SocketAddrV4,
    ) -> Option<SocketId> {
        let sock = match self.table.alloc(SockState::Busy) {
            Ok(sock) => sock,
            Err(_) => {
                log::warn!("accept: no socket for {} on port {}", peer, port);
                return None;
            }
        };
        self.attach(sock, ctx, peer);
        if let Err(err) = hook.accept(sock, port, peer) {
            log::warn!("accept: hook rejected {} on port {}: {}", peer, port, err);
            ctx.set_app(None);
            self.table.discard(sock);
            return None;
        }
        Some(sock)
    }

    fn accept_by_listener(
        &self,
        ctx: &mut dyn TcpContext,
        port: u16,
        peer: SocketAddrV4,
    ) -> Option<SocketId> {
        let Some(lid) = self.table.find_listener(port) else {
            log::warn!("accept: nobody listens on port {}", port);
            return None;
        };
        let slot = self.table.slot(lid);
        let rec = slot.lock();
        let gen = rec.gen;
        let deadline = deadline_ms::<P>(Some(self.config.accept_wait_ms));
        let (rec, ready) = slot.wait(&slot.client, rec, deadline, |rec| {
            !rec.owned_by(gen) || !rec.state.is_listener() || rec.state == SockState::Accepting
        });
        if !ready || rec.state != SockState::Accepting || !rec.owned_by(gen) {
            log::warn!("accept: no acceptor on port {} for {}", port, peer);
            return None;
        }
        // alloc takes every slot lock in turn, the listener's included.
        drop(rec);
        let sock = match self.table.alloc(SockState::Busy) {
            Ok(sock) => sock,
            Err(_) => {
                log::warn!("accept: no socket for {} on port {}", peer, port);
                return None;
            }
        };
        let mut rec = slot.lock();
        if !rec.owned_by(gen) || rec.state != SockState::Accepting {
            drop(rec);
            self.table.discard(sock);
            return None;
        }
        self.attach(sock, ctx, peer);
        rec.listener().pending = Some(Inbound { sock, peer });
        rec.state = SockState::Accepted;
        drop(rec);
        slot.engine.raise();
        log::debug!("accept: {} from {} on port {}", sock, peer, port);
        Some(sock)
    }

    fn attach(&self, sock: SocketId, ctx: &mut dyn TcpContext, peer: SocketAddrV4) {
        let mut rec = self.table.slot(sock).lock();
        rec.conn = Some(ctx.conn());
        let transfer = rec.transfer();
        transfer.remote = Some(peer);
        transfer.local_port = Some(ctx.local_port());
        ctx.set_app(Some(sock));
    }
}
