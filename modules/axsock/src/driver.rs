//! The network driver task: sole owner of the engine.

use axsync::{Port, Semaphore, Signal};
use core::sync::atomic::Ordering;

use crate::engine::Engine;
use crate::state::{Request, SockState};
use crate::{NetStack, SocketId};

/// Runs the engine on behalf of every client task of one [`NetStack`].
pub struct Driver<'a, P: Port, E: Engine, const N: usize> {
    stack: &'a NetStack<P, N>,
    engine: E,
    last_periodic: u64,
    last_arp: u64,
    packet_seen: bool,
}

impl<'a, P: Port, E: Engine, const N: usize> Driver<'a, P, E, N> {
    pub fn new(stack: &'a NetStack<P, N>, engine: E) -> Self {
        let now = P::uptime_ms();
        Self {
            stack,
            engine,
            last_periodic: now,
            last_arp: now,
            packet_seen: false,
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// One loop iteration: sleep until woken or a timer is due, then serve
    /// requests, transmit, receive and run the protocol timers.
    pub fn step(&mut self) {
        let config = *self.stack.config();
        let poll_ms = self.stack.device_poll_ms();
        if !(self.packet_seen && poll_ms.is_some()) {
            let due = (self.last_periodic + config.periodic_ms).saturating_sub(P::uptime_ms());
            let timeout = poll_ms.map_or(due, |poll| poll.min(due));
            self.stack.wake.wait_ms(Some(timeout));
        }

        if self.stack.requests_pending.swap(false, Ordering::AcqRel) {
            self.serve_requests();
        }

        let now = P::uptime_ms();
        if self.stack.send_pending.swap(false, Ordering::AcqRel) {
            self.engine.poll_conns(now, self.stack);
        }

        self.packet_seen = self.engine.poll_device(now, self.stack);

        let now = P::uptime_ms();
        if now.saturating_sub(self.last_periodic) >= config.periodic_ms {
            self.last_periodic = now;
            self.engine.periodic(now, self.stack);
        }
        if now.saturating_sub(self.last_arp) >= config.arp_ms {
            self.last_arp = now;
            self.engine.arp_tick(now);
        }
    }

    pub fn run(mut self) -> ! {
        log::info!("driver: running with {} sockets", N);
        loop {
            self.step();
        }
    }

    fn serve_requests(&mut self) {
        for id in 0..N {
            let request = self.stack.table.slot(id).lock().request;
            if let Some(request) = request {
                self.serve(id, request);
            }
        }
    }

    fn serve(&mut self, id: SocketId, request: Request) {
        let slot = self.stack.table.slot(id);
        log::debug!("driver: {:?} for {}", request, id);
        match request {
            Request::Connect { remote, local_port } => {
                let result = self.engine.tcp_connect(remote, local_port, id);
                let mut rec = slot.lock();
                match result {
                    Ok(conn) => rec.conn = Some(conn),
                    Err(err) => {
                        rec.error = Some(err);
                        rec.state = SockState::PeerAborted;
                    }
                }
                if rec.request == Some(request) {
                    rec.request = None;
                }
            }
            Request::OpenUdp { remote, local_port } => {
                let result = self.engine.udp_open(remote, local_port, id);
                let mut rec = slot.lock();
                match result {
                    Ok((conn, port)) => {
                        rec.conn = Some(conn);
                        rec.transfer().local_port = Some(port);
                        rec.state = SockState::ConnectOk;
                    }
                    Err(err) => {
                        rec.error = Some(err);
                        rec.state = SockState::PeerAborted;
                    }
                }
                rec.request = None;
            }
            Request::Listen { port } => {
                let result = self.engine.tcp_listen(port);
                let mut rec = slot.lock();
                if let Err(err) = result {
                    log::warn!("driver: listen on {} failed: {}", port, err);
                    rec.error = Some(err);
                }
                rec.request = None;
            }
            Request::Unlisten { port } => {
                self.engine.tcp_unlisten(port);
                let mut rec = slot.lock();
                rec.state = SockState::CloseOk;
                rec.request = None;
            }
            Request::Abort => {
                let conn = slot.lock().conn.take();
                if let Some(conn) = conn {
                    self.engine.abort(conn);
                }
                let mut rec = slot.lock();
                if !rec.state.is_terminal() {
                    rec.state = SockState::CloseOk;
                }
                rec.request = None;
            }
        }
        slot.engine.raise();
    }
}
