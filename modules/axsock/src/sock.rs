//! Client-side blocking operations.
//!
//! Every call that waits follows the same shape: check the state under the
//! record lock, move to the in-progress state, raise the client signal,
//! then sleep on the engine signal until the dispatcher or the driver task
//! moves the record on.

use core::net::SocketAddrV4;

use axsync::{deadline_ms, Port, Signal};
use spin::MutexGuard;

use crate::state::{Listener, Record, Request, Role, SockState, Transfer};
use crate::table::Slot;
use crate::{NetError, NetStack, SocketId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Transport of a freshly allocated socket.
pub enum Proto {
    Tcp,
    Udp,
}

impl<P: Port, const N: usize> NetStack<P, N> {
    /// Allocate an unconnected socket.
    pub fn alloc(&self, proto: Proto) -> Result<SocketId, NetError> {
        self.table.alloc(match proto {
            Proto::Tcp => SockState::UndefTcp,
            Proto::Udp => SockState::UndefUdp,
        })
    }

    /// Release a socket that never connected or whose connection is gone.
    pub fn free(&self, id: SocketId) {
        self.table.free(id);
    }

    pub fn state(&self, id: SocketId) -> SockState {
        self.table.state(id)
    }

    /// Bound, listening or locally assigned port.
    pub fn local_port(&self, id: SocketId) -> Option<u16> {
        self.table.slot(id).lock().bound_port()
    }

    /// Remote endpoint of a connected socket; for UDP the sender of the
    /// last datagram read.
    pub fn peer_addr(&self, id: SocketId) -> Option<SocketAddrV4> {
        match &self.table.slot(id).lock().role {
            Role::Conn(transfer) => transfer.remote,
            _ => None,
        }
    }

    /// Timeout applied to `connect`; `None` waits forever.
    pub fn set_timeout(&self, id: SocketId, timeout_ms: Option<u64>) {
        self.table.slot(id).lock().timeout_ms = timeout_ms;
    }

    pub fn bind(&self, id: SocketId, port: u16) -> Result<(), NetError> {
        if port == 0 {
            return Err(NetError::Invalid);
        }
        let mut rec = self.table.slot(id).lock();
        rec.state = match rec.state {
            SockState::UndefTcp => SockState::Bound,
            SockState::UndefUdp => SockState::BoundUdp,
            state => panic!("sock: bind of {} in state {:?}", id, state),
        };
        rec.role = Role::Idle { port: Some(port) };
        Ok(())
    }

    /// Connect a TCP socket, or fix the remote of a UDP socket.
    ///
    /// On failure the socket is released and the handle becomes invalid.
    pub fn connect(&self, id: SocketId, remote: SocketAddrV4) -> Result<(), NetError> {
        let slot = self.table.slot(id);
        let mut rec = slot.lock();
        let local_port = rec.bound_port();
        let request = match rec.state {
            SockState::UndefTcp | SockState::Bound => Request::Connect { remote, local_port },
            SockState::UndefUdp | SockState::BoundUdp => Request::OpenUdp { remote, local_port },
            state => panic!("sock: connect of {} in state {:?}", id, state),
        };
        let gen = rec.gen;
        let mut transfer = Transfer::new();
        transfer.remote = Some(remote);
        transfer.local_port = local_port;
        rec.role = Role::Conn(transfer);
        rec.state = SockState::Connect;
        rec.request = Some(request);
        // Opening a UDP endpoint is local and never times out.
        let deadline = match request {
            Request::Connect { .. } => deadline_ms::<P>(rec.timeout_ms),
            _ => None,
        };
        drop(rec);
        log::debug!("sock: connect {} to {}", id, remote);
        self.kick_request();

        let (mut rec, done) = slot.wait(&slot.engine, slot.lock(), deadline, |rec| {
            !rec.owned_by(gen) || rec.state != SockState::Connect
        });
        if !rec.owned_by(gen) {
            return Err(NetError::Aborted);
        }
        if !done {
            // Have the driver drop the half-open connection, then release.
            rec.request = Some(Request::Abort);
            drop(rec);
            self.kick_request();
            let (rec, _) = slot.wait(&slot.engine, slot.lock(), None, |rec| {
                rec.request.is_none() && rec.conn.is_none()
            });
            drop(rec);
            log::debug!("sock: connect {} timed out", id);
            self.table.free(id);
            return Err(NetError::Timeout);
        }
        let state = rec.state;
        match state {
            SockState::ConnectOk => {
                rec.state = SockState::Busy;
                Ok(())
            }
            // Closed by another task; `close` releases the socket.
            SockState::Close | SockState::CloseOk => Err(NetError::Aborted),
            SockState::PeerClosed | SockState::PeerAborted => {
                let err = rec.error.take().unwrap_or(NetError::ConnRefused);
                drop(rec);
                log::debug!("sock: connect {} failed: {}", id, err);
                self.table.free(id);
                Err(err)
            }
            state => panic!("sock: connect of {} ended in state {:?}", id, state),
        }
    }

    /// Register the bound port with the engine.
    pub fn listen(&self, id: SocketId) -> Result<(), NetError> {
        let slot = self.table.slot(id);
        let mut rec = slot.lock();
        assert!(
            rec.state == SockState::Bound,
            "sock: listen of {} in state {:?}",
            id,
            rec.state
        );
        let Some(port) = rec.bound_port() else {
            panic!("sock: listen of {} without a port", id);
        };
        let gen = rec.gen;
        rec.role = Role::Listener(Listener { port, pending: None });
        rec.state = SockState::Listening;
        rec.request = Some(Request::Listen { port });
        drop(rec);
        self.kick_request();

        let (mut rec, _) = slot.wait(&slot.engine, slot.lock(), None, |rec| {
            !rec.owned_by(gen) || rec.request.is_none()
        });
        if !rec.owned_by(gen) {
            return Err(NetError::Aborted);
        }
        match rec.error.take() {
            None => {
                log::debug!("sock: {} listening on {}", id, port);
                Ok(())
            }
            Some(err) => {
                rec.state = SockState::Bound;
                rec.role = Role::Idle { port: Some(port) };
                Err(err)
            }
        }
    }

    /// Wait for an inbound connection. Returns its socket, already in
    /// `Busy`, and the peer address. Only `close` of the listener ends
    /// the wait early.
    pub fn accept(&self, id: SocketId) -> Result<(SocketId, SocketAddrV4), NetError> {
        let slot = self.table.slot(id);
        let mut rec = slot.lock();
        assert!(
            rec.state == SockState::Listening,
            "sock: accept on {} in state {:?}",
            id,
            rec.state
        );
        let gen = rec.gen;
        rec.state = SockState::Accepting;
        drop(rec);
        slot.client.raise();

        let (mut rec, _) = slot.wait(&slot.engine, slot.lock(), None, |rec| {
            !rec.owned_by(gen) || rec.state != SockState::Accepting
        });
        if !rec.owned_by(gen) || rec.state != SockState::Accepted {
            return Err(NetError::Aborted);
        }
        let Some(inbound) = rec.listener().pending.take() else {
            panic!("sock: {} accepted without a connection", id);
        };
        rec.state = SockState::Listening;
        log::debug!("sock: {} accepted {} from {}", id, inbound.sock, inbound.peer);
        Ok((inbound.sock, inbound.peer))
    }

    /// Read whatever arrives next, at most `buf.len()` bytes. `Ok(0)` is
    /// end of stream.
    pub fn read(
        &self,
        id: SocketId,
        buf: &mut [u8],
        timeout_ms: Option<u64>,
    ) -> Result<usize, NetError> {
        self.read_in(id, SockState::Reading, buf, timeout_ms)
    }

    /// Read up to and including the next LF, dropping CR bytes. Stops early
    /// when `buf` fills up. A timeout after part of a line arrived returns
    /// the partial line.
    pub fn read_line(
        &self,
        id: SocketId,
        buf: &mut [u8],
        timeout_ms: Option<u64>,
    ) -> Result<usize, NetError> {
        self.read_in(id, SockState::ReadingLine, buf, timeout_ms)
    }

    fn read_in(
        &self,
        id: SocketId,
        mode: SockState,
        buf: &mut [u8],
        timeout_ms: Option<u64>,
    ) -> Result<usize, NetError> {
        assert!(!buf.is_empty(), "sock: read of {} into an empty buffer", id);
        let slot = self.table.slot(id);
        let mut rec = slot.lock();
        let state = rec.state;
        match state {
            SockState::Busy => {}
            SockState::PeerClosed => return Ok(0),
            SockState::PeerAborted => return Err(NetError::Aborted),
            state => panic!("sock: read of {} in state {:?}", id, state),
        }
        let gen = rec.gen;
        rec.transfer().lend_read(buf);
        rec.state = mode;
        let deadline = deadline_ms::<P>(timeout_ms);
        drop(rec);
        slot.client.raise();

        let (mut rec, done) = slot.wait(&slot.engine, slot.lock(), deadline, |rec| {
            !rec.owned_by(gen) || rec.state != mode
        });
        if !rec.owned_by(gen) {
            return Err(NetError::Aborted);
        }
        rec.transfer().reclaim();
        if !done {
            let len = rec.transfer().len;
            rec.state = SockState::Busy;
            return if len > 0 { Ok(len) } else { Err(NetError::Timeout) };
        }
        let state = rec.state;
        match state {
            SockState::ReadOk => {
                let transfer = rec.transfer();
                let len = transfer.len;
                let eof = core::mem::take(&mut transfer.eof_pending);
                rec.state = if eof { SockState::PeerClosed } else { SockState::Busy };
                Ok(len)
            }
            SockState::PeerClosed => Ok(0),
            // Aborted by the peer, or closed by another task.
            _ => Err(NetError::Aborted),
        }
    }

    /// Send all of `buf`. Returns once the engine acknowledged the last
    /// byte; `Ok(0)` if the peer closed meanwhile.
    pub fn write(&self, id: SocketId, buf: &[u8]) -> Result<usize, NetError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let slot = self.table.slot(id);
        let mut rec = slot.lock();
        let state = rec.state;
        match state {
            SockState::Busy => {}
            SockState::PeerClosed => return Ok(0),
            SockState::PeerAborted => return Err(NetError::Aborted),
            state => panic!("sock: write of {} in state {:?}", id, state),
        }
        let gen = rec.gen;
        rec.transfer().lend_write(buf);
        rec.state = SockState::Writing;
        drop(rec);
        slot.client.raise();
        self.kick_output();

        let (mut rec, _) = slot.wait(&slot.engine, slot.lock(), None, |rec| {
            !rec.owned_by(gen) || rec.state != SockState::Writing
        });
        if !rec.owned_by(gen) {
            return Err(NetError::Aborted);
        }
        rec.transfer().reclaim();
        let state = rec.state;
        match state {
            SockState::WriteOk => {
                let eof = core::mem::take(&mut rec.transfer().eof_pending);
                rec.state = if eof { SockState::PeerClosed } else { SockState::Busy };
                Ok(buf.len())
            }
            SockState::PeerClosed => Ok(0),
            _ => Err(NetError::Aborted),
        }
    }

    /// Tear down the connection or listener and release the socket.
    ///
    /// A read blocked in another task on the same socket returns
    /// `Aborted`, as does a blocked `accept`.
    pub fn close(&self, id: SocketId) {
        let slot = self.table.slot(id);
        let mut rec = slot.lock();
        let gen = rec.gen;
        let mut orphan = None;
        let state = rec.state;
        match state {
            SockState::Busy
            | SockState::Reading
            | SockState::ReadingLine
            | SockState::ReadOk
            | SockState::WriteOk
            | SockState::ConnectOk
                if rec.conn.is_none() =>
            {
                // Only a parked result is left; the engine already let go.
                rec.transfer().reclaim();
                rec.state = SockState::CloseOk;
            }
            SockState::Busy
            | SockState::Reading
            | SockState::ReadingLine
            | SockState::ReadOk
            | SockState::WriteOk
            | SockState::ConnectOk => {
                rec.transfer().reclaim();
                rec.state = SockState::Close;
                drop(rec);
                // Wakes a blocked reader and a dispatcher waiting for one.
                slot.engine.raise();
                slot.client.raise();
                self.kick_output();
                rec = self.wait_closed(slot, gen);
            }
            SockState::Listening | SockState::Accepting | SockState::Accepted => {
                let listener = rec.listener();
                let port = listener.port;
                orphan = listener.pending.take();
                rec.state = SockState::Close;
                rec.request = Some(Request::Unlisten { port });
                drop(rec);
                slot.engine.raise();
                slot.client.raise();
                self.kick_request();
                rec = self.wait_closed(slot, gen);
            }
            state if state.is_releasable() => {}
            state => panic!("sock: close of {} in state {:?}", id, state),
        }
        drop(rec);
        log::debug!("sock: close {}", id);
        self.table.free(id);
        if let Some(inbound) = orphan {
            self.close(inbound.sock);
        }
    }

    fn wait_closed<'a>(&'a self, slot: &'a Slot<P>, gen: u32) -> MutexGuard<'a, Record> {
        let (rec, _) = slot.wait(&slot.engine, slot.lock(), None, |rec| {
            !rec.owned_by(gen) || (rec.state.is_terminal() && rec.conn.is_none())
        });
        assert!(rec.owned_by(gen), "sock: released during close");
        rec
    }

    /// Allocate a TCP socket and connect it.
    pub fn create_tcp(&self, remote: SocketAddrV4) -> Result<SocketId, NetError> {
        let id = self.alloc(Proto::Tcp)?;
        self.connect(id, remote)?;
        Ok(id)
    }

    /// Allocate a UDP socket sending to `remote`.
    pub fn create_udp(&self, remote: SocketAddrV4) -> Result<SocketId, NetError> {
        let id = self.alloc(Proto::Udp)?;
        self.connect(id, remote)?;
        Ok(id)
    }

    /// Allocate a TCP socket bound to `port`, ready for `listen`.
    pub fn create_tcp_server(&self, port: u16) -> Result<SocketId, NetError> {
        let id = self.alloc(Proto::Tcp)?;
        if let Err(err) = self.bind(id, port) {
            self.free(id);
            return Err(err);
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NetConfig;
    use axsync::host::HostPort;

    type Stack = NetStack<HostPort, 4>;

    fn wait_for(stack: &Stack, id: SocketId, state: SockState) {
        while stack.state(id) != state {
            std::thread::yield_now();
        }
    }

    /// Leave a three-byte read result on the record without waking the
    /// blocked reader, as the dispatcher does just before the reader runs.
    fn park_read_result(stack: &Stack, id: SocketId, eof: bool) {
        let mut rec = stack.table.slot(id).lock();
        let transfer = rec.transfer();
        transfer.len = 3;
        transfer.eof_pending = eof;
        rec.state = SockState::ReadOk;
    }

    #[test]
    fn close_with_detached_read_result_aborts_reader() {
        let stack = Stack::new(NetConfig::new());
        let sock = stack.table.alloc(SockState::Busy).unwrap();
        std::thread::scope(|scope| {
            let reader = scope.spawn(|| {
                let mut buf = [0u8; 8];
                stack.read(sock, &mut buf, None)
            });
            wait_for(&stack, sock, SockState::Reading);
            park_read_result(&stack, sock, true);
            scope.spawn(|| stack.close(sock)).join().unwrap();
            assert_eq!(reader.join().unwrap(), Err(NetError::Aborted));
        });
        assert_eq!(stack.state(sock), SockState::Null);
    }

    #[test]
    fn close_with_attached_read_result_waits_for_engine() {
        let stack = Stack::new(NetConfig::new());
        let sock = stack.table.alloc(SockState::Busy).unwrap();
        stack.table.slot(sock).lock().conn = Some(5);
        std::thread::scope(|scope| {
            let reader = scope.spawn(|| {
                let mut buf = [0u8; 8];
                stack.read(sock, &mut buf, None)
            });
            wait_for(&stack, sock, SockState::Reading);
            park_read_result(&stack, sock, false);
            let closer = scope.spawn(|| stack.close(sock));

            // Play the driver: drop the connection once asked to.
            let slot = stack.table.slot(sock);
            let (mut rec, _) = slot.wait(&slot.client, slot.lock(), None, |rec| {
                rec.state == SockState::Close
            });
            assert_eq!(rec.conn, Some(5));
            rec.conn = None;
            rec.state = SockState::CloseOk;
            drop(rec);
            slot.engine.raise();

            closer.join().unwrap();
            assert_eq!(reader.join().unwrap(), Err(NetError::Aborted));
        });
        assert_eq!(stack.state(sock), SockState::Null);
    }

    #[test]
    fn close_with_unclaimed_write_result_releases_socket() {
        let stack = Stack::new(NetConfig::new());
        let sock = stack.table.alloc(SockState::Busy).unwrap();
        {
            let mut rec = stack.table.slot(sock).lock();
            rec.transfer().eof_pending = true;
            rec.state = SockState::WriteOk;
        }
        stack.close(sock);
        assert_eq!(stack.state(sock), SockState::Null);
        assert_eq!(stack.table.live(), 0);
    }
}
