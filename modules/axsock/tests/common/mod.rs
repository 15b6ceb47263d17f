#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use axsock::{Driver, Engine, NetConfig, NetStack};
use axsync::host::HostPort;

pub type Stack = NetStack<HostPort, 16>;

/// A stack plus a driver thread stepping its engine.
pub struct Harness {
    pub stack: &'static Stack,
    stop: Arc<AtomicBool>,
    driver: Option<JoinHandle<()>>,
}

pub fn start<E: Engine + Send + 'static>(engine: E) -> Harness {
    start_with(engine, NetConfig::new())
}

pub fn start_with<E: Engine + Send + 'static>(engine: E, config: NetConfig) -> Harness {
    let stack: &'static Stack = Box::leak(Box::new(Stack::new(config)));
    stack.enable_device_polling(1);
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    let driver = thread::spawn(move || {
        let mut driver = Driver::new(stack, engine);
        while !flag.load(Ordering::Acquire) {
            driver.step();
        }
    });
    Harness {
        stack,
        stop,
        driver: Some(driver),
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.stack.interrupt();
        if let Some(driver) = self.driver.take() {
            let _ = driver.join();
        }
    }
}

/// Poll `cond` until it holds, failing the test after a few seconds.
pub fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}
