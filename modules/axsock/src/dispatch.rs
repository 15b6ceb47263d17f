//! Engine callbacks: translate connection events into record transitions.
//!
//! Runs on the driver task only. The dispatcher may sleep briefly on a
//! record's client signal (waiting for a reader or an acceptor) but never
//! holds a record lock while doing so.

use axsync::{deadline_ms, Port, Signal};
use spin::MutexGuard;

use crate::engine::{App, TcpContext, TcpEvents, UdpContext, UdpEvents};
use crate::state::{Record, SockState, Transfer};
use crate::table::Slot;
use crate::NetStack;

/// Detach the record from its connection and park it in `state`.
fn finish<P: Port>(slot: &Slot<P>, rec: &mut Record, state: SockState) {
    rec.conn = None;
    rec.state = state;
    slot.engine.raise();
}

/// Queue the next segment of a pending write.
fn submit(ctx: &mut dyn TcpContext, transfer: &mut Transfer) {
    let mss = ctx.mss();
    let pending = transfer.pending();
    let chunk = &pending[..pending.len().min(mss)];
    transfer.in_flight = ctx.send(chunk);
}

impl<P: Port, const N: usize> NetStack<P, N> {
    /// Hold the record until a reader shows up or the socket is closed.
    /// Returns false if nobody came within the configured bound.
    fn await_reader<'a>(
        &self,
        slot: &'a Slot<P>,
        rec: MutexGuard<'a, Record>,
    ) -> (MutexGuard<'a, Record>, bool) {
        let deadline = deadline_ms::<P>(Some(self.config.reader_wait_ms));
        slot.wait(&slot.client, rec, deadline, |rec| {
            rec.state.is_reading() || rec.state == SockState::Close
        })
    }

    fn tcp_newdata<'a>(
        &self,
        slot: &'a Slot<P>,
        mut rec: MutexGuard<'a, Record>,
        ctx: &mut dyn TcpContext,
    ) -> Option<MutexGuard<'a, Record>> {
        let total = ctx.data().len();
        let mut offset = 0;
        while offset < total {
            let (next, ready) = self.await_reader(slot, rec);
            rec = next;
            if !ready {
                log::warn!(
                    "dispatch: nobody reads conn {}, aborting with {} bytes pending",
                    ctx.conn(),
                    total - offset
                );
                ctx.abort();
                ctx.set_app(None);
                finish(slot, &mut rec, SockState::PeerAborted);
                return None;
            }
            let state = rec.state;
            match state {
                SockState::Close => {
                    log::debug!("dispatch: closing conn {}, {} bytes dropped", ctx.conn(), total - offset);
                    ctx.close();
                    ctx.set_app(None);
                    finish(slot, &mut rec, SockState::CloseOk);
                    return None;
                }
                SockState::Reading => {
                    offset += rec.transfer().fill(&ctx.data()[offset..]);
                    rec.state = SockState::ReadOk;
                    slot.engine.raise();
                }
                _ => {
                    let (used, complete) = rec.transfer().fill_line(&ctx.data()[offset..]);
                    offset += used;
                    if complete {
                        rec.state = SockState::ReadOk;
                        slot.engine.raise();
                    }
                }
            }
        }
        Some(rec)
    }
}

impl<P: Port, const N: usize> App for NetStack<P, N> {
    fn on_tcp(&self, ctx: &mut dyn TcpContext) {
        let events = ctx.events();
        if ctx.app().is_none() {
            if !events.contains(TcpEvents::CONNECTED) || self.rendezvous(ctx).is_none() {
                return;
            }
        }
        let Some(id) = ctx.app() else {
            return;
        };
        let slot = self.table.slot(id);
        let mut rec = slot.lock();
        if rec.conn != Some(ctx.conn()) {
            log::warn!("dispatch: conn {} points at stale socket {}", ctx.conn(), id);
            ctx.set_app(None);
            return;
        }

        if events.intersects(TcpEvents::ABORTED | TcpEvents::TIMEDOUT) {
            log::debug!("dispatch: conn {} of {} aborted ({:?})", ctx.conn(), id, events);
            let next = match rec.state {
                SockState::Close => SockState::CloseOk,
                _ => SockState::PeerAborted,
            };
            ctx.set_app(None);
            finish(slot, &mut rec, next);
            return;
        }

        if events.contains(TcpEvents::CONNECTED) && rec.state == SockState::Connect {
            rec.transfer().local_port = Some(ctx.local_port());
            rec.state = SockState::ConnectOk;
            slot.engine.raise();
        }

        if events.contains(TcpEvents::ACKED) && rec.state == SockState::Writing {
            if rec.transfer().acknowledge() {
                rec.state = SockState::WriteOk;
                slot.engine.raise();
            } else {
                submit(ctx, rec.transfer());
            }
        }

        if events.contains(TcpEvents::NEWDATA) && !ctx.data().is_empty() {
            match self.tcp_newdata(slot, rec, ctx) {
                Some(next) => rec = next,
                None => return,
            }
        }

        if events.contains(TcpEvents::REXMIT) && rec.state == SockState::Writing {
            let transfer = rec.transfer();
            let pending = transfer.pending();
            let chunk = &pending[..transfer.in_flight.min(pending.len())];
            transfer.in_flight = ctx.send(chunk);
        }

        if events.contains(TcpEvents::CLOSED) {
            log::debug!("dispatch: peer closed conn {} of {}", ctx.conn(), id);
            let state = rec.state;
            let next = match state {
                SockState::Close => SockState::CloseOk,
                // Hand out what was read or written first; EOF comes next.
                SockState::ReadOk | SockState::WriteOk => {
                    rec.transfer().eof_pending = true;
                    state
                }
                SockState::ReadingLine if rec.transfer().len > 0 => {
                    rec.transfer().eof_pending = true;
                    SockState::ReadOk
                }
                _ => SockState::PeerClosed,
            };
            ctx.set_app(None);
            finish(slot, &mut rec, next);
            return;
        }

        if events.contains(TcpEvents::POLL) {
            let state = rec.state;
            match state {
                SockState::Close => {
                    ctx.close();
                    ctx.set_app(None);
                    finish(slot, &mut rec, SockState::CloseOk);
                }
                SockState::Writing if rec.transfer().in_flight == 0 => {
                    submit(ctx, rec.transfer());
                }
                _ => {}
            }
        }
    }

    fn on_udp(&self, ctx: &mut dyn UdpContext) {
        let events = ctx.events();
        let Some(id) = ctx.app() else {
            return;
        };
        let slot = self.table.slot(id);
        let mut rec = slot.lock();
        if rec.conn != Some(ctx.conn()) {
            log::warn!("dispatch: udp conn {} points at stale socket {}", ctx.conn(), id);
            ctx.set_app(None);
            return;
        }

        if events.contains(UdpEvents::NEWDATA) {
            let (next, ready) = self.await_reader(slot, rec);
            rec = next;
            if !ready {
                log::warn!(
                    "dispatch: dropped {} byte datagram from {} for {}",
                    ctx.data().len(),
                    ctx.remote(),
                    id
                );
            } else if rec.state.is_reading() {
                let transfer = rec.transfer();
                transfer.fill(ctx.data());
                transfer.remote = Some(ctx.remote());
                rec.state = SockState::ReadOk;
                slot.engine.raise();
            }
        }

        if events.contains(UdpEvents::POLL) {
            let state = rec.state;
            match state {
                SockState::Close => {
                    ctx.remove();
                    ctx.set_app(None);
                    finish(slot, &mut rec, SockState::CloseOk);
                }
                SockState::Writing => {
                    let transfer = rec.transfer();
                    let sent = ctx.send(transfer.pending());
                    if sent < transfer.len {
                        log::warn!("dispatch: datagram of {} truncated to {}", transfer.len, sent);
                    }
                    transfer.in_flight = transfer.len;
                    transfer.acknowledge();
                    rec.state = SockState::WriteOk;
                    slot.engine.raise();
                }
                _ => {}
            }
        }
    }
}
