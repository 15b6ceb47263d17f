#![cfg(feature = "smoltcp")]

mod common;

use core::net::{Ipv4Addr, SocketAddrV4};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;

use axsock::smoltcp_impl::{IfaceConfig, SmolEngine, SmolStorage};
use axsock::{NetDevice, NetError, SockState};
use axsync::host::HostPort;
use axsync::Port;

use common::{eventually, start};

type Queue = Arc<Mutex<VecDeque<Vec<u8>>>>;

/// One end of a point-to-point Ethernet cable.
struct WireEnd {
    mac: [u8; 6],
    inbox: Queue,
    outbox: Queue,
}

fn wire() -> (WireEnd, WireEnd) {
    let ab = Queue::default();
    let ba = Queue::default();
    (
        WireEnd {
            mac: [0x02, 0, 0, 0, 0, 0x01],
            inbox: ba.clone(),
            outbox: ab.clone(),
        },
        WireEnd {
            mac: [0x02, 0, 0, 0, 0, 0x02],
            inbox: ab,
            outbox: ba,
        },
    )
}

impl NetDevice for WireEnd {
    fn mac_address(&self) -> [u8; 6] {
        self.mac
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize, NetError> {
        let frame = self.inbox.lock().unwrap().pop_front().ok_or(NetError::Timeout)?;
        let len = frame.len().min(buf.len());
        buf[..len].copy_from_slice(&frame[..len]);
        Ok(len)
    }

    fn send(&self, buf: &[u8]) -> Result<(), NetError> {
        self.outbox.lock().unwrap().push_back(buf.to_vec());
        Ok(())
    }

    fn poll(&self) -> bool {
        !self.inbox.lock().unwrap().is_empty()
    }
}

fn engine(end: WireEnd, addr: Ipv4Addr) -> SmolEngine<WireEnd> {
    let storage = Box::leak(Box::new(SmolStorage::new()));
    let config = IfaceConfig {
        addr,
        prefix: 24,
        gateway: None,
    };
    SmolEngine::new(end, storage, config, HostPort::uptime_ms())
}

#[test]
fn tcp_line_echo_over_wire() {
    let client_addr = Ipv4Addr::new(10, 0, 2, 1);
    let server_addr = Ipv4Addr::new(10, 0, 2, 2);
    let (a, b) = wire();
    let client = start(engine(a, client_addr));
    let server = start(engine(b, server_addr));
    let (cs, ss) = (client.stack, server.stack);

    let listener = ss.create_tcp_server(7).unwrap();
    ss.listen(listener).unwrap();
    let echo = thread::spawn(move || {
        let (sock, peer) = ss.accept(listener).unwrap();
        let mut line = [0u8; 64];
        let len = ss.read_line(sock, &mut line, None).unwrap();
        ss.write(sock, &line[..len]).unwrap();
        let mut rest = [0u8; 8];
        let eof = ss.read(sock, &mut rest, None).unwrap();
        ss.close(sock);
        (peer, eof)
    });
    eventually("acceptor", || ss.state(listener) == SockState::Accepting);

    let sock = cs.create_tcp(SocketAddrV4::new(server_addr, 7)).unwrap();
    let local_port = cs.local_port(sock).unwrap();
    assert_eq!(cs.write(sock, b"over the wire\r\n").unwrap(), 15);
    let mut buf = [0u8; 64];
    let len = cs.read_line(sock, &mut buf, None).unwrap();
    assert_eq!(&buf[..len], b"over the wire\n");
    cs.close(sock);

    let (peer, eof) = echo.join().unwrap();
    assert_eq!(peer, SocketAddrV4::new(client_addr, local_port));
    assert_eq!(eof, 0);
    ss.close(listener);
}

#[test]
fn udp_datagram_over_wire() {
    let a_addr = Ipv4Addr::new(10, 0, 3, 1);
    let b_addr = Ipv4Addr::new(10, 0, 3, 2);
    let (a, b) = wire();
    let left = start(engine(a, a_addr));
    let right = start(engine(b, b_addr));
    let (ls, rs) = (left.stack, right.stack);

    let receiver = rs.alloc(axsock::Proto::Udp).unwrap();
    rs.bind(receiver, 9000).unwrap();
    rs.connect(receiver, SocketAddrV4::new(a_addr, 9001)).unwrap();
    let sender = ls.alloc(axsock::Proto::Udp).unwrap();
    ls.bind(sender, 9001).unwrap();
    ls.connect(sender, SocketAddrV4::new(b_addr, 9000)).unwrap();

    let reader = thread::spawn(move || {
        let mut buf = [0u8; 32];
        rs.read(receiver, &mut buf, None).map(|len| buf[..len].to_vec())
    });
    eventually("reader", || rs.state(receiver) == SockState::Reading);
    // The first datagram may be lost to address resolution.
    while !reader.is_finished() {
        ls.write(sender, b"ping").unwrap();
        thread::sleep(std::time::Duration::from_millis(50));
    }
    assert_eq!(reader.join().unwrap().unwrap(), b"ping");
    assert_eq!(rs.peer_addr(receiver), Some(SocketAddrV4::new(a_addr, 9001)));

    ls.close(sender);
    rs.close(receiver);
}
