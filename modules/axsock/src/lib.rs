#![no_std]
//! Blocking socket layer over a single-threaded, event-driven TCP/IP engine.
//!
//! Client tasks block in the calls of [`NetStack`]; one driver task owns the
//! [`Engine`] and runs [`Driver::step`]. The two sides meet in a fixed table
//! of socket records, each guarded by its own lock and a pair of signals.

#[cfg(any(feature = "std", test))]
extern crate std;

mod accept;
pub mod config;
mod dispatch;
mod driver;
pub mod engine;
#[cfg(feature = "std")]
pub mod sim;
#[cfg(feature = "smoltcp")]
pub mod smoltcp_impl;
mod sock;
mod state;
mod table;

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use axsync::{Port, Semaphore};

pub use accept::AcceptHook;
pub use config::{NetConfig, SOCK_TABSIZE};
pub use driver::Driver;
pub use engine::{App, ConnId, Engine, TcpContext, TcpEvents, UdpContext, UdpEvents};
pub use sock::Proto;
pub use state::{Inbound, SockState};
pub use table::SocketTable;

/// Socket handle: index of the record in the socket table.
pub type SocketId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
/// Socket-layer errors surfaced to client tasks.
pub enum NetError {
    #[error("socket table or engine resources exhausted")]
    NoMem,
    #[error("connection aborted")]
    Aborted,
    #[error("operation timed out")]
    Timeout,
    #[error("connection refused")]
    ConnRefused,
    #[error("destination unreachable")]
    Unreachable,
    #[error("port already in use")]
    AddrInUse,
    #[error("invalid argument")]
    Invalid,
}

impl NetError {
    /// Numeric code for callers that speak the classic integer convention:
    /// `-2` for a local timeout, `-1` for everything else.
    pub fn code(self) -> isize {
        match self {
            NetError::Timeout => -2,
            _ => -1,
        }
    }
}

/// Byte count or negative code; `0` is end of stream.
pub fn status_code(result: Result<usize, NetError>) -> isize {
    match result {
        Ok(len) => len as isize,
        Err(err) => err.code(),
    }
}

/// Minimal net device interface for raw frame I/O.
pub trait NetDevice {
    /// Return the device MAC address.
    fn mac_address(&self) -> [u8; 6];
    /// Receive a frame into the provided buffer.
    fn recv(&self, buf: &mut [u8]) -> Result<usize, NetError>;
    /// Send a frame from the provided buffer.
    fn send(&self, buf: &[u8]) -> Result<(), NetError>;
    /// Return true if RX data is pending.
    fn poll(&self) -> bool;
}

/// Shared state of one network stack: the socket table plus the wake-up
/// channel of its driver task.
pub struct NetStack<P: Port, const N: usize = SOCK_TABSIZE> {
    table: SocketTable<P, N>,
    /// Counting wake-up of the driver task.
    wake: P::Semaphore,
    requests_pending: AtomicBool,
    send_pending: AtomicBool,
    /// Device poll interval in ms, 0 while interrupt driven.
    device_poll_ms: AtomicU64,
    hook: spin::Once<&'static dyn AcceptHook>,
    config: NetConfig,
}

impl<P: Port, const N: usize> NetStack<P, N> {
    pub fn new(config: NetConfig) -> Self {
        Self {
            table: SocketTable::new(),
            wake: P::Semaphore::new(0),
            requests_pending: AtomicBool::new(false),
            send_pending: AtomicBool::new(false),
            device_poll_ms: AtomicU64::new(config.device_poll_ms.unwrap_or(0)),
            hook: spin::Once::new(),
            config,
        }
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn table(&self) -> &SocketTable<P, N> {
        &self.table
    }

    /// Wake the driver task from a device interrupt handler.
    pub fn interrupt(&self) {
        self.wake.signal();
    }

    /// Switch the driver task to polling the device every `interval_ms`,
    /// for devices that cannot raise interrupts. `0` turns polling off.
    pub fn enable_device_polling(&self, interval_ms: u64) {
        self.device_poll_ms.store(interval_ms, Ordering::Release);
        self.wake.signal();
    }

    pub(crate) fn device_poll_ms(&self) -> Option<u64> {
        match self.device_poll_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Some(ms),
        }
    }

    /// Route inbound connections through `hook` instead of listening
    /// records. Only the first registration takes effect.
    pub fn set_accept_hook(&self, hook: &'static dyn AcceptHook) {
        self.hook.call_once(|| hook);
    }

    /// Ask the driver task for a transmit pass.
    pub(crate) fn kick_output(&self) {
        self.send_pending.store(true, Ordering::Release);
        self.wake.signal();
    }

    /// Tell the driver task a record carries a request.
    pub(crate) fn kick_request(&self) {
        self.requests_pending.store(true, Ordering::Release);
        self.wake.signal();
    }
}

impl<P: Port, const N: usize> Default for NetStack<P, N> {
    fn default() -> Self {
        Self::new(NetConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_codes() {
        assert_eq!(status_code(Ok(5)), 5);
        assert_eq!(status_code(Ok(0)), 0);
        assert_eq!(status_code(Err(NetError::Aborted)), -1);
        assert_eq!(status_code(Err(NetError::Timeout)), -2);
        assert_eq!(NetError::NoMem.code(), -1);
    }
}
