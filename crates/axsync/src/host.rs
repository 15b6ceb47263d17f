//! Hosted port on top of `std` threads, used by tests and simulations.

use std::sync::{Condvar, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use crate::{Port, Semaphore, Signal, WaitResult};

/// [`Port`] backed by `std::sync` and `std::time`.
pub struct HostPort;

impl Port for HostPort {
    type Signal = HostSignal;
    type Semaphore = HostSemaphore;

    fn uptime_ms() -> u64 {
        static START: OnceLock<Instant> = OnceLock::new();
        START.get_or_init(Instant::now).elapsed().as_millis() as u64
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct HostSignal {
    epoch: Mutex<u32>,
    cond: Condvar,
}

impl Signal for HostSignal {
    fn new() -> Self {
        Self {
            epoch: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    fn epoch(&self) -> u32 {
        *lock(&self.epoch)
    }

    fn raise(&self) {
        let mut epoch = lock(&self.epoch);
        *epoch = epoch.wrapping_add(1);
        self.cond.notify_all();
    }

    fn wait_ms(&self, epoch: u32, timeout_ms: Option<u64>) -> WaitResult {
        let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        let mut current = lock(&self.epoch);
        while *current == epoch {
            match deadline {
                None => {
                    current = self
                        .cond
                        .wait(current)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                Some(at) => {
                    let now = Instant::now();
                    if now >= at {
                        return WaitResult::Timeout;
                    }
                    current = self
                        .cond
                        .wait_timeout(current, at - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0;
                }
            }
        }
        WaitResult::Notified
    }
}

pub struct HostSemaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore for HostSemaphore {
    fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    fn signal(&self) {
        *lock(&self.count) += 1;
        self.cond.notify_one();
    }

    fn wait_ms(&self, timeout_ms: Option<u64>) -> WaitResult {
        let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        let mut count = lock(&self.count);
        while *count == 0 {
            match deadline {
                None => {
                    count = self
                        .cond
                        .wait(count)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
                Some(at) => {
                    let now = Instant::now();
                    if now >= at {
                        return WaitResult::Timeout;
                    }
                    count = self
                        .cond
                        .wait_timeout(count, at - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0;
                }
            }
        }
        *count -= 1;
        WaitResult::Notified
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    #[test]
    fn signal_times_out_without_raise() {
        let signal = HostSignal::new();
        let epoch = signal.epoch();
        assert_eq!(signal.wait_ms(epoch, Some(10)), WaitResult::Timeout);
    }

    #[test]
    fn raise_before_wait_is_not_lost() {
        let signal = HostSignal::new();
        let epoch = signal.epoch();
        signal.raise();
        assert_eq!(signal.wait_ms(epoch, Some(0)), WaitResult::Notified);
    }

    #[test]
    fn raise_wakes_every_waiter() {
        let signal = Arc::new(HostSignal::new());
        let epoch = signal.epoch();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let signal = signal.clone();
                thread::spawn(move || signal.wait_ms(epoch, Some(5_000)))
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        signal.raise();
        for waiter in waiters {
            assert_eq!(waiter.join().unwrap(), WaitResult::Notified);
        }
    }

    #[test]
    fn semaphore_counts() {
        let sema = HostSemaphore::new(0);
        sema.signal();
        sema.signal();
        assert_eq!(sema.wait_ms(Some(0)), WaitResult::Notified);
        assert_eq!(sema.wait_ms(Some(0)), WaitResult::Notified);
        assert_eq!(sema.wait_ms(Some(5)), WaitResult::Timeout);
    }

    #[test]
    fn uptime_is_monotonic() {
        let a = HostPort::uptime_ms();
        thread::sleep(Duration::from_millis(5));
        assert!(HostPort::uptime_ms() >= a + 5);
    }
}
