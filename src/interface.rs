//! Packet transport capability.
//!
//! The client drives exactly one [`NetworkInterface`]: it hands typed
//! packets down to be serialized and sent, and drains typed packets back
//! up, each stamped with its source address. [`UdpInterface`] is the real
//! transport; [`crate::simulator`] provides an in-memory one for tests.

use std::cell::RefCell;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::rc::Rc;

use socket2::{Domain, Protocol, Socket, Type};

use crate::consts::{MAX_PACKET_SIZE, SOCKET_RECV_BUF_SIZE, SOCKET_SEND_BUF_SIZE};
use crate::packet::Packet;
use crate::time::TimeBase;

pub trait NetworkInterface {
    /// Queue `packet` for delivery to `to`. The substrate is unreliable;
    /// failures are dropped, not surfaced.
    fn send_packet(&mut self, to: SocketAddr, packet: Packet);

    /// Next inbound packet with its source address, if any arrived.
    fn receive_packet(&mut self) -> Option<(SocketAddr, Packet)>;

    /// Per-tick housekeeping, called once per client update.
    fn update(&mut self, time_base: &TimeBase);

    /// Largest serialized packet this transport can carry.
    fn max_packet_size(&self) -> usize;
}

impl<T: NetworkInterface> NetworkInterface for Rc<RefCell<T>> {
    fn send_packet(&mut self, to: SocketAddr, packet: Packet) {
        self.borrow_mut().send_packet(to, packet)
    }

    fn receive_packet(&mut self) -> Option<(SocketAddr, Packet)> {
        self.borrow_mut().receive_packet()
    }

    fn update(&mut self, time_base: &TimeBase) {
        self.borrow_mut().update(time_base)
    }

    fn max_packet_size(&self) -> usize {
        self.borrow().max_packet_size()
    }
}

#[derive(thiserror::Error, Debug)]
#[error("failed to create and bind udp socket: {0}")]
pub struct BindError(#[from] io::Error);

/// Non-blocking UDP transport.
pub struct UdpInterface {
    socket: UdpSocket,
}

impl UdpInterface {
    pub fn new(addr: impl ToSocketAddrs) -> Result<Self, BindError> {
        let addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no socket addresses found")
        })?;
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        if addr.is_ipv6() {
            socket.set_only_v6(true)?;
        }
        socket.set_send_buffer_size(SOCKET_SEND_BUF_SIZE)?;
        socket.set_recv_buffer_size(SOCKET_RECV_BUF_SIZE)?;
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;
        Ok(UdpInterface {
            socket: socket.into(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr().expect("address should be bound")
    }
}

impl NetworkInterface for UdpInterface {
    fn send_packet(&mut self, to: SocketAddr, packet: Packet) {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let size = match packet.write(&mut buf) {
            Ok(size) => size,
            Err(err) => {
                log::debug!("dropping unserializable packet: {}", err);
                return;
            }
        };
        match self.socket.send_to(&buf[..size], to) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => log::debug!("send to {} failed: {}", to, err),
        }
    }

    fn receive_packet(&mut self) -> Option<(SocketAddr, Packet)> {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        loop {
            let (size, from) = match self.socket.recv_from(&mut buf) {
                Ok((size, from)) => (size, from),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return None,
                Err(err) => {
                    log::debug!("recv failed: {}", err);
                    return None;
                }
            };
            match Packet::read(&buf[..size]) {
                Ok(packet) => return Some((from, packet)),
                Err(err) => {
                    // Malformed datagrams never abort the receive loop.
                    log::debug!("dropping malformed packet from {}: {}", from, err);
                }
            }
        }
    }

    fn update(&mut self, _time_base: &TimeBase) {}

    fn max_packet_size(&self) -> usize {
        MAX_PACKET_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ConnectionRequestPacket;

    #[test]
    fn packets_cross_a_loopback_socket_pair() {
        let mut a = UdpInterface::new("127.0.0.1:0").unwrap();
        let mut b = UdpInterface::new("127.0.0.1:0").unwrap();

        a.send_packet(b.local_addr(), ConnectionRequestPacket::create(0x42));

        // Loopback delivery is fast but not instantaneous.
        for _ in 0..100 {
            if let Some((from, packet)) = b.receive_packet() {
                assert_eq!(from, a.local_addr());
                assert_eq!(packet, ConnectionRequestPacket::create(0x42));
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        panic!("packet never arrived on loopback");
    }

    #[test]
    fn malformed_datagrams_are_skipped() {
        let mut a = UdpInterface::new("127.0.0.1:0").unwrap();
        let b = UdpInterface::new("127.0.0.1:0").unwrap();

        // Raw garbage followed by a valid packet; only the latter surfaces.
        b.socket.send_to(&[0xff, 0xee, 0xdd], a.local_addr()).unwrap();
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let size = ConnectionRequestPacket::create(7).write(&mut buf).unwrap();
        b.socket.send_to(&buf[..size], a.local_addr()).unwrap();

        for _ in 0..100 {
            if let Some((_, packet)) = a.receive_packet() {
                assert_eq!(packet, ConnectionRequestPacket::create(7));
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        panic!("valid packet never arrived");
    }
}
