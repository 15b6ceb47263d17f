//! Socket layer capacities and timing defaults.

/// Concurrent TCP connections the engine is configured for.
pub const MAX_TCP_CONNS: usize = 8;
/// UDP endpoints the engine is configured for.
pub const MAX_UDP_CONNS: usize = 4;
/// Ports that can be listened on at once.
pub const MAX_LISTEN_PORTS: usize = 4;
/// One table slot per connection, endpoint and listener.
pub const SOCK_TABSIZE: usize = MAX_TCP_CONNS + MAX_UDP_CONNS + MAX_LISTEN_PORTS;

/// Protocol timer interval.
pub const DEFAULT_PERIODIC_MS: u64 = 500;
/// Address-resolution cache aging interval.
pub const DEFAULT_ARP_MS: u64 = 10_000;
/// How long the dispatcher holds new data while waiting for a reader.
pub const DEFAULT_READER_WAIT_MS: u64 = 500;
/// How long an inbound connection waits for a task blocked in `accept`.
pub const DEFAULT_ACCEPT_WAIT_MS: u64 = 200;

/// First local port handed out for active opens.
pub const EPHEMERAL_PORT_BASE: u16 = 49152;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Runtime tunables of a [`crate::NetStack`].
pub struct NetConfig {
    pub periodic_ms: u64,
    pub arp_ms: u64,
    pub reader_wait_ms: u64,
    pub accept_wait_ms: u64,
    /// Device poll interval for drivers without interrupts; `None` relies on
    /// [`crate::NetStack::interrupt`].
    pub device_poll_ms: Option<u64>,
}

impl NetConfig {
    pub const fn new() -> Self {
        Self {
            periodic_ms: DEFAULT_PERIODIC_MS,
            arp_ms: DEFAULT_ARP_MS,
            reader_wait_ms: DEFAULT_READER_WAIT_MS,
            accept_wait_ms: DEFAULT_ACCEPT_WAIT_MS,
            device_poll_ms: None,
        }
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self::new()
    }
}
