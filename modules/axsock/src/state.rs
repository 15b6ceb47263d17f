//! Per-socket record: state machine, role data and the borrowed I/O buffer.

use core::net::SocketAddrV4;
use core::ptr::NonNull;

use crate::engine::ConnId;
use crate::{NetError, SocketId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Life-cycle state of one table slot.
pub enum SockState {
    /// Free slot.
    Null,
    UndefTcp,
    UndefUdp,
    Bound,
    BoundUdp,
    Listening,
    Accepting,
    Accepted,
    /// Connected and idle, ready for the next operation.
    Busy,
    Connect,
    ConnectOk,
    Reading,
    ReadingLine,
    ReadOk,
    Writing,
    WriteOk,
    Close,
    CloseOk,
    PeerClosed,
    PeerAborted,
}

impl SockState {
    /// The engine is done with the socket; only `close`/`free` remain.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SockState::CloseOk | SockState::PeerClosed | SockState::PeerAborted
        )
    }

    /// States `free` accepts.
    pub fn is_releasable(self) -> bool {
        self.is_terminal()
            || matches!(
                self,
                SockState::UndefTcp | SockState::UndefUdp | SockState::Bound | SockState::BoundUdp
            )
    }

    pub fn is_listener(self) -> bool {
        matches!(
            self,
            SockState::Listening | SockState::Accepting | SockState::Accepted
        )
    }

    pub fn is_reading(self) -> bool {
        matches!(self, SockState::Reading | SockState::ReadingLine)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Inbound connection handed from the engine to a task blocked in `accept`.
pub struct Inbound {
    pub sock: SocketId,
    pub peer: SocketAddrV4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Listener {
    pub port: u16,
    pub pending: Option<Inbound>,
}

/// Caller buffer lent to the record for one read or write.
#[derive(Clone, Copy)]
struct Lent {
    ptr: NonNull<u8>,
    cap: usize,
}

// SAFETY: the pointer is only dereferenced under the record lock while the
// lending task is blocked inside the operation that lent it.
unsafe impl Send for Lent {}

/// Connected-role I/O parameters.
pub(crate) struct Transfer {
    lent: Option<Lent>,
    /// Bytes copied in (read) or bytes still to send (write).
    pub len: usize,
    /// Read capacity.
    pub max: usize,
    /// Write progress into the lent buffer.
    pub offset: usize,
    /// Size of the last submission not yet acknowledged.
    pub in_flight: usize,
    /// Peer closed while a partial line was delivered; report EOF next.
    pub eof_pending: bool,
    pub remote: Option<SocketAddrV4>,
    pub local_port: Option<u16>,
}

impl Transfer {
    pub const fn new() -> Self {
        Self {
            lent: None,
            len: 0,
            max: 0,
            offset: 0,
            in_flight: 0,
            eof_pending: false,
            remote: None,
            local_port: None,
        }
    }

    /// Lend `buf` for one read. The caller must stay blocked until
    /// [`Transfer::reclaim`] runs under the record lock.
    pub fn lend_read(&mut self, buf: &mut [u8]) {
        self.lent = NonNull::new(buf.as_mut_ptr()).map(|ptr| Lent {
            ptr,
            cap: buf.len(),
        });
        self.max = buf.len();
        self.len = 0;
    }

    /// Lend `buf` for one write; the engine side only ever reads it.
    pub fn lend_write(&mut self, buf: &[u8]) {
        self.lent = NonNull::new(buf.as_ptr() as *mut u8).map(|ptr| Lent {
            ptr,
            cap: buf.len(),
        });
        self.len = buf.len();
        self.offset = 0;
        self.in_flight = 0;
    }

    pub fn reclaim(&mut self) {
        self.lent = None;
        self.in_flight = 0;
    }

    fn lent_mut(&mut self) -> &mut [u8] {
        match self.lent {
            // SAFETY: see `lend_read`; the borrow is tied to `&mut self`,
            // which only exists under the record lock.
            Some(lent) => unsafe { core::slice::from_raw_parts_mut(lent.ptr.as_ptr(), lent.cap) },
            None => &mut [],
        }
    }

    fn lent(&self) -> &[u8] {
        match self.lent {
            // SAFETY: see `lend_write`.
            Some(lent) => unsafe { core::slice::from_raw_parts(lent.ptr.as_ptr(), lent.cap) },
            None => &[],
        }
    }

    /// Unsent part of the lent write buffer.
    pub fn pending(&self) -> &[u8] {
        let end = (self.offset + self.len).min(self.lent().len());
        &self.lent()[self.offset.min(end)..end]
    }

    /// Mark the in-flight submission acknowledged. Returns true once the
    /// whole buffer went out.
    pub fn acknowledge(&mut self) -> bool {
        let acked = self.in_flight.min(self.len);
        self.offset += acked;
        self.len -= acked;
        self.in_flight = 0;
        self.len == 0
    }

    /// Copy one chunk for a plain read. Returns bytes consumed from `data`.
    pub fn fill(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.max);
        self.lent_mut()[..n].copy_from_slice(&data[..n]);
        self.len = n;
        n
    }

    /// Copy towards a line, dropping CR. Returns bytes consumed from `data`
    /// and whether the line is complete (LF seen or buffer full).
    pub fn fill_line(&mut self, data: &[u8]) -> (usize, bool) {
        let max = self.max;
        let mut len = self.len;
        let mut used = 0;
        let mut newline = false;
        {
            let buf = self.lent_mut();
            for &ch in data {
                if len >= max {
                    break;
                }
                used += 1;
                if ch == b'\r' {
                    continue;
                }
                buf[len] = ch;
                len += 1;
                if ch == b'\n' {
                    newline = true;
                    break;
                }
            }
        }
        self.len = len;
        (used, len > 0 && (newline || len == max))
    }
}

/// Work a client hands to the driver task; only the driver touches the
/// engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Request {
    Connect {
        remote: SocketAddrV4,
        local_port: Option<u16>,
    },
    OpenUdp {
        remote: SocketAddrV4,
        local_port: Option<u16>,
    },
    Listen {
        port: u16,
    },
    Unlisten {
        port: u16,
    },
    /// Drop a half-open connection after a local connect timeout.
    Abort,
}

/// Role-dependent fields; which one applies follows from the state.
pub(crate) enum Role {
    Idle { port: Option<u16> },
    Listener(Listener),
    Conn(Transfer),
}

pub(crate) struct Record {
    pub state: SockState,
    /// Bumped on every allocation of the slot.
    pub gen: u32,
    pub role: Role,
    pub timeout_ms: Option<u64>,
    /// Engine connection referencing this slot.
    pub conn: Option<ConnId>,
    pub request: Option<Request>,
    /// Failure of the last request, reported by the driver task.
    pub error: Option<NetError>,
}

impl Record {
    pub const fn new() -> Self {
        Self {
            state: SockState::Null,
            gen: 0,
            role: Role::Idle { port: None },
            timeout_ms: None,
            conn: None,
            request: None,
            error: None,
        }
    }

    /// The record still belongs to the allocation that saw `gen`.
    pub fn owned_by(&self, gen: u32) -> bool {
        self.gen == gen && self.state != SockState::Null
    }

    pub fn reset(&mut self, state: SockState) {
        self.state = state;
        self.gen = self.gen.wrapping_add(1);
        self.role = match state {
            SockState::Busy => Role::Conn(Transfer::new()),
            _ => Role::Idle { port: None },
        };
        self.timeout_ms = None;
        self.conn = None;
        self.request = None;
        self.error = None;
    }

    pub fn transfer(&mut self) -> &mut Transfer {
        match &mut self.role {
            Role::Conn(transfer) => transfer,
            _ => panic!("sock: no transfer in state {:?}", self.state),
        }
    }

    pub fn listener(&mut self) -> &mut Listener {
        match &mut self.role {
            Role::Listener(listener) => listener,
            _ => panic!("sock: not a listener in state {:?}", self.state),
        }
    }

    pub fn bound_port(&self) -> Option<u16> {
        match &self.role {
            Role::Idle { port } => *port,
            Role::Listener(listener) => Some(listener.port),
            Role::Conn(transfer) => transfer.local_port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_fill_drops_cr_and_stops_at_lf() {
        let mut buf = [0u8; 10];
        let mut transfer = Transfer::new();
        transfer.lend_read(&mut buf);
        let (used, complete) = transfer.fill_line(b"abc\r\ndef");
        assert_eq!(used, 5);
        assert!(complete);
        assert_eq!(transfer.len, 4);
        transfer.reclaim();
        assert_eq!(&buf[..4], b"abc\n");

        let mut transfer = Transfer::new();
        transfer.lend_read(&mut buf);
        let (used, complete) = transfer.fill_line(b"def");
        assert_eq!(used, 3);
        assert!(!complete);
        assert_eq!(transfer.len, 3);
        transfer.reclaim();
        assert_eq!(&buf[..3], b"def");
    }

    #[test]
    fn line_fill_completes_on_full_buffer() {
        let mut buf = [0u8; 3];
        let mut transfer = Transfer::new();
        transfer.lend_read(&mut buf);
        let (used, complete) = transfer.fill_line(b"abcdef");
        assert_eq!(used, 3);
        assert!(complete);
        transfer.reclaim();
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn line_fill_accumulates_across_segments() {
        let mut buf = [0u8; 16];
        let mut transfer = Transfer::new();
        transfer.lend_read(&mut buf);
        assert_eq!(transfer.fill_line(b"he"), (2, false));
        assert_eq!(transfer.fill_line(b"llo\r"), (4, false));
        assert_eq!(transfer.fill_line(b"\nrest"), (1, true));
        assert_eq!(transfer.len, 6);
        transfer.reclaim();
        assert_eq!(&buf[..6], b"hello\n");
    }

    #[test]
    fn plain_fill_truncates_to_capacity() {
        let mut buf = [0u8; 4];
        let mut transfer = Transfer::new();
        transfer.lend_read(&mut buf);
        assert_eq!(transfer.fill(b"abcdef"), 4);
        assert_eq!(transfer.len, 4);
        transfer.reclaim();
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn write_progress_follows_acknowledged_submissions() {
        let data = *b"0123456789";
        let mut transfer = Transfer::new();
        transfer.lend_write(&data);
        assert_eq!(transfer.pending(), b"0123456789");
        transfer.in_flight = 4;
        assert!(!transfer.acknowledge());
        assert_eq!(transfer.pending(), b"456789");
        transfer.in_flight = 6;
        assert!(transfer.acknowledge());
        assert!(transfer.pending().is_empty());
    }

    #[test]
    fn terminal_and_releasable_states() {
        assert!(SockState::PeerAborted.is_terminal());
        assert!(SockState::CloseOk.is_releasable());
        assert!(SockState::UndefTcp.is_releasable());
        assert!(!SockState::Busy.is_releasable());
        assert!(!SockState::Null.is_releasable());
        assert!(SockState::Accepting.is_listener());
    }

    #[test]
    fn reset_bumps_generation() {
        let mut record = Record::new();
        record.reset(SockState::UndefTcp);
        let gen = record.gen;
        record.reset(SockState::Busy);
        assert_eq!(record.gen, gen.wrapping_add(1));
        assert!(matches!(record.role, Role::Conn(_)));
    }
}
