//! In-memory packet transport for deterministic tests.
//!
//! Endpoints share one [`NetworkSimulator`] through `Rc<RefCell<..>>`; each
//! [`SimulatedInterface`] binds an address to it. The default fault model
//! is a transparent pass-through delivering in send order, which keeps
//! handshake tests deterministic; latency, jitter, loss, and duplication
//! can be dialed in for soak-style runs.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use crate::consts::MAX_PACKET_SIZE;
use crate::interface::NetworkInterface;
use crate::packet::Packet;
use crate::time::TimeBase;

#[derive(Debug, Clone, Default)]
pub struct SimulatorConfig {
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss_percent: f64,
    pub duplicate_packet_percent: f64,
}

#[derive(Debug)]
struct PacketEntry {
    from: SocketAddr,
    to: SocketAddr,
    delivery_time: f64,
    packet: Packet,
}

#[derive(Default)]
pub struct NetworkSimulator {
    config: SimulatorConfig,
    time: f64,
    entries: Vec<PacketEntry>,
}

impl NetworkSimulator {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            time: 0.0,
            entries: Vec::new(),
        }
    }

    /// Move the simulated clock forward; it never runs backwards even if
    /// endpoints tick at different times.
    pub fn advance(&mut self, time: f64) {
        self.time = self.time.max(time);
    }

    pub fn send(&mut self, from: SocketAddr, to: SocketAddr, packet: Packet) {
        if rand_percent() < self.config.packet_loss_percent {
            log::trace!("simulator dropped packet {} -> {}", from, to);
            return;
        }
        let delivery_time = self.time + self.delay();
        if rand_percent() < self.config.duplicate_packet_percent {
            let duplicate_time = delivery_time + self.delay();
            self.entries.push(PacketEntry {
                from,
                to,
                delivery_time: duplicate_time,
                packet: packet.clone(),
            });
        }
        self.entries.push(PacketEntry {
            from,
            to,
            delivery_time,
            packet,
        });
    }

    /// Pop the first deliverable packet addressed to `to`.
    pub fn recv(&mut self, to: SocketAddr) -> Option<(SocketAddr, Packet)> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.to == to && entry.delivery_time <= self.time)?;
        let entry = self.entries.remove(index);
        Some((entry.from, entry.packet))
    }

    fn delay(&self) -> f64 {
        let mut delay = self.config.latency_ms / 1000.0;
        if self.config.jitter_ms > 0.0 {
            delay += (rand::random::<f64>() * 2.0 - 1.0) * self.config.jitter_ms / 1000.0;
        }
        delay.max(0.0)
    }
}

fn rand_percent() -> f64 {
    rand::random::<f64>() * 100.0
}

/// One endpoint's view of a shared simulator.
pub struct SimulatedInterface {
    simulator: Rc<RefCell<NetworkSimulator>>,
    address: SocketAddr,
}

impl SimulatedInterface {
    pub fn new(simulator: Rc<RefCell<NetworkSimulator>>, address: SocketAddr) -> Self {
        Self { simulator, address }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

impl NetworkInterface for SimulatedInterface {
    fn send_packet(&mut self, to: SocketAddr, packet: Packet) {
        self.simulator.borrow_mut().send(self.address, to, packet);
    }

    fn receive_packet(&mut self) -> Option<(SocketAddr, Packet)> {
        self.simulator.borrow_mut().recv(self.address)
    }

    fn update(&mut self, time_base: &TimeBase) {
        self.simulator.borrow_mut().advance(time_base.time);
    }

    fn max_packet_size(&self) -> usize {
        MAX_PACKET_SIZE
    }
}
