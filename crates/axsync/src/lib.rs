#![no_std]
//! Blocking primitives the socket layer needs from the underlying RTOS.
//!
//! The socket layer never parks a task itself; it goes through a [`Port`],
//! which bundles the event signal, the counting semaphore and the clock of
//! the target kernel.

#[cfg(feature = "std")]
extern crate std;

#[cfg(feature = "std")]
pub mod host;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Result of a wait operation.
pub enum WaitResult {
    Timeout,
    Notified,
}

impl WaitResult {
    pub fn timed_out(self) -> bool {
        self == WaitResult::Timeout
    }
}

/// Event counter used for the client/engine ping-pong of one socket.
///
/// A waiter samples [`Signal::epoch`] while it still holds the lock that
/// guards the condition it waits for, releases the lock, then calls
/// [`Signal::wait_ms`] with that epoch. Any [`Signal::raise`] after the
/// sample ends the wait, so wakeups are never lost and every waiter sees
/// them.
pub trait Signal: Send + Sync {
    fn new() -> Self;
    fn epoch(&self) -> u32;
    fn raise(&self);
    /// Block until the epoch moves past `epoch`; `None` waits forever.
    fn wait_ms(&self, epoch: u32, timeout_ms: Option<u64>) -> WaitResult;
}

/// Counting semaphore used to wake the network driver task.
pub trait Semaphore: Send + Sync {
    fn new(initial: usize) -> Self;
    fn signal(&self);
    /// Take one unit; `None` waits forever.
    fn wait_ms(&self, timeout_ms: Option<u64>) -> WaitResult;
}

/// Kernel services consumed by the socket layer.
pub trait Port: Send + Sync + 'static {
    type Signal: Signal;
    type Semaphore: Semaphore;

    /// Monotonic milliseconds since an arbitrary epoch.
    fn uptime_ms() -> u64;
}

/// Remaining time until `deadline`, `None` staying infinite.
pub fn remaining_ms<P: Port>(deadline: Option<u64>) -> Option<u64> {
    deadline.map(|at| at.saturating_sub(P::uptime_ms()))
}

/// Absolute deadline for a relative timeout.
pub fn deadline_ms<P: Port>(timeout_ms: Option<u64>) -> Option<u64> {
    timeout_ms.map(|ms| P::uptime_ms().saturating_add(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_result_flags() {
        assert!(WaitResult::Timeout.timed_out());
        assert!(!WaitResult::Notified.timed_out());
    }
}
