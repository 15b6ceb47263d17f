//! Fixed socket table. The slot index doubles as the public handle.

use axsync::{remaining_ms, Port, Signal};
use spin::{Mutex, MutexGuard};

use crate::state::{Record, Role, SockState};
use crate::{NetError, SocketId};

pub(crate) struct Slot<P: Port> {
    pub rec: Mutex<Record>,
    /// Raised by client operations towards the engine side.
    pub client: P::Signal,
    /// Raised by the engine side when a client operation progressed.
    pub engine: P::Signal,
}

impl<P: Port> Slot<P> {
    fn new() -> Self {
        Self {
            rec: Mutex::new(Record::new()),
            client: P::Signal::new(),
            engine: P::Signal::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Record> {
        self.rec.lock()
    }

    /// Sleep on `signal` until `ready` holds for the record or `deadline`
    /// passes. Takes the held guard and hands it back locked; the flag is
    /// false on timeout.
    pub fn wait<'a>(
        &'a self,
        signal: &P::Signal,
        mut rec: MutexGuard<'a, Record>,
        deadline: Option<u64>,
        ready: impl Fn(&Record) -> bool,
    ) -> (MutexGuard<'a, Record>, bool) {
        let mut expired = false;
        loop {
            if ready(&rec) {
                return (rec, true);
            }
            if expired {
                return (rec, false);
            }
            let epoch = signal.epoch();
            drop(rec);
            expired = signal.wait_ms(epoch, remaining_ms::<P>(deadline)).timed_out();
            rec = self.lock();
        }
    }
}

pub struct SocketTable<P: Port, const N: usize> {
    /// Serializes allocation and release; never held across a wait.
    alloc_lock: Mutex<()>,
    slots: [Slot<P>; N],
}

impl<P: Port, const N: usize> SocketTable<P, N> {
    pub fn new() -> Self {
        Self {
            alloc_lock: Mutex::new(()),
            slots: core::array::from_fn(|_| Slot::new()),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub(crate) fn slot(&self, id: SocketId) -> &Slot<P> {
        assert!(id < N, "sock: handle {} out of range", id);
        &self.slots[id]
    }

    /// Claim a free slot in `initial` state.
    pub fn alloc(&self, initial: SockState) -> Result<SocketId, NetError> {
        assert!(
            matches!(
                initial,
                SockState::UndefTcp | SockState::UndefUdp | SockState::Busy
            ),
            "sock: cannot allocate in state {:?}",
            initial
        );
        let _table = self.alloc_lock.lock();
        for (id, slot) in self.slots.iter().enumerate() {
            let mut rec = slot.lock();
            if rec.state == SockState::Null {
                rec.reset(initial);
                log::debug!("sock: alloc {} as {:?}", id, initial);
                return Ok(id);
            }
        }
        log::warn!("sock: table full ({} slots)", N);
        Err(NetError::NoMem)
    }

    /// Return a slot to the pool. The record must have reached a state the
    /// engine no longer acts on and must be detached from its connection.
    pub fn free(&self, id: SocketId) {
        let slot = self.slot(id);
        let _table = self.alloc_lock.lock();
        let mut rec = slot.lock();
        assert!(
            rec.state.is_releasable(),
            "sock: free of {} in state {:?}",
            id,
            rec.state
        );
        assert!(rec.conn.is_none(), "sock: free of {} still attached", id);
        Self::release(&mut rec);
        drop(rec);
        slot.client.raise();
        slot.engine.raise();
        log::debug!("sock: free {}", id);
    }

    /// Drop a slot the dispatcher allocated but could not hand out.
    pub(crate) fn discard(&self, id: SocketId) {
        let slot = self.slot(id);
        let _table = self.alloc_lock.lock();
        let mut rec = slot.lock();
        assert!(rec.state != SockState::Null, "sock: discard of free slot {}", id);
        Self::release(&mut rec);
    }

    fn release(rec: &mut Record) {
        rec.state = SockState::Null;
        rec.conn = None;
        rec.request = None;
        rec.error = None;
        rec.role = Role::Idle { port: None };
    }

    pub fn state(&self, id: SocketId) -> SockState {
        self.slot(id).lock().state
    }

    /// Listening slot bound to `port`.
    pub(crate) fn find_listener(&self, port: u16) -> Option<SocketId> {
        self.slots.iter().position(|slot| {
            let mut rec = slot.lock();
            rec.state.is_listener() && rec.listener().port == port
        })
    }

    pub fn live(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.lock().state != SockState::Null)
            .count()
    }
}

impl<P: Port, const N: usize> Default for SocketTable<P, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axsync::host::HostPort;

    #[test]
    fn alloc_until_full_then_reuse() {
        let table: SocketTable<HostPort, 3> = SocketTable::new();
        let a = table.alloc(SockState::UndefTcp).unwrap();
        let b = table.alloc(SockState::UndefUdp).unwrap();
        let c = table.alloc(SockState::UndefTcp).unwrap();
        assert_eq!([a, b, c], [0, 1, 2]);
        assert_eq!(table.alloc(SockState::UndefTcp), Err(NetError::NoMem));
        table.free(b);
        assert_eq!(table.state(b), SockState::Null);
        assert_eq!(table.alloc(SockState::UndefTcp), Ok(b));
        assert_eq!(table.live(), 3);
    }

    #[test]
    fn handles_never_alias() {
        let table: SocketTable<HostPort, 4> = SocketTable::new();
        let mut live = std::vec::Vec::new();
        for round in 0..64usize {
            if round % 3 == 2 && !live.is_empty() {
                let id = live.remove(round % live.len());
                table.free(id);
            } else if let Ok(id) = table.alloc(SockState::UndefTcp) {
                assert!(!live.contains(&id));
                live.push(id);
            } else {
                assert_eq!(live.len(), 4);
            }
        }
    }

    #[test]
    fn concurrent_alloc_hands_out_distinct_slots() {
        let table: &'static SocketTable<HostPort, 16> = std::boxed::Box::leak(std::boxed::Box::new(SocketTable::new()));
        let workers: std::vec::Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(move || {
                    (0..4)
                        .map(|_| table.alloc(SockState::UndefTcp).unwrap())
                        .collect::<std::vec::Vec<_>>()
                })
            })
            .collect();
        let mut ids: std::vec::Vec<_> = workers
            .into_iter()
            .flat_map(|worker| worker.join().unwrap())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 16);
    }

    #[test]
    #[should_panic(expected = "sock: free of")]
    fn double_free_is_fatal() {
        let table: SocketTable<HostPort, 2> = SocketTable::new();
        let id = table.alloc(SockState::UndefTcp).unwrap();
        table.free(id);
        table.free(id);
    }

    #[test]
    #[should_panic(expected = "sock: free of")]
    fn free_of_live_connection_is_fatal() {
        let table: SocketTable<HostPort, 2> = SocketTable::new();
        let id = table.alloc(SockState::Busy).unwrap();
        table.free(id);
    }

    #[test]
    fn listener_lookup_by_port() {
        let table: SocketTable<HostPort, 2> = SocketTable::new();
        let id = table.alloc(SockState::UndefTcp).unwrap();
        {
            let mut rec = table.slot(id).lock();
            rec.state = SockState::Listening;
            rec.role = Role::Listener(crate::state::Listener {
                port: 80,
                pending: None,
            });
        }
        assert_eq!(table.find_listener(80), Some(id));
        assert_eq!(table.find_listener(81), None);
    }
}
