//! The client connection state machine.
//!
//! A [`Client`] walks one session from `Disconnected` through the
//! handshake to `Connected`: it resolves the hostname if one was given,
//! repeats the connection request until challenged, answers the challenge,
//! uploads its client data block if configured, and then hands steady-state
//! traffic to the embedded [`Connection`]. Inbound packets are dispatched
//! by `(state, type)` and filtered by address and session guids, so stray
//! or forged datagrams fall on the floor. Every failure funnels through one
//! disconnect-and-latch path; the latched error survives until the next
//! connect.

use std::net::SocketAddr;

use crate::addr::{apply_default_port, generate_guid, parse_address};
use crate::block::{BlockReceiver, BlockSender, SessionInfo};
use crate::connection::Connection;
use crate::consts::{
    DEFAULT_CONNECTED_SEND_RATE, DEFAULT_CONNECTED_TIMEOUT, DEFAULT_CONNECTING_SEND_RATE,
    DEFAULT_CONNECTING_TIMEOUT, DEFAULT_FRAGMENTS_PER_SECOND, DEFAULT_SERVER_PORT,
    MAX_FRAGMENT_SIZE, MAX_HOSTNAME_BYTES,
};
use crate::error::{ClientError, ConfigError};
use crate::interface::NetworkInterface;
use crate::packet::{
    ChallengeResponsePacket, ConnectionChallengePacket, ConnectionDeniedPacket, ConnectionPacket,
    ConnectionRequestPacket, DataBlockFragmentAckPacket, DataBlockFragmentPacket,
    DisconnectedPacket, Packet, ReadyForConnectionPacket,
};
use crate::resolver::{ResolveStatus, Resolver};
use crate::time::TimeBase;

/// Lifecycle of a client session, ordered so comparisons express progress:
/// `Disconnected` sorts below every connecting sub-state, which sort below
/// `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum ClientState {
    Disconnected = 0,
    ResolvingHostname = 1,
    SendingConnectionRequest = 2,
    SendingChallengeResponse = 3,
    SendingClientData = 4,
    ReadyForConnection = 5,
    Connected = 6,
}

/// Tuning knobs and optional capabilities for a [`Client`]. The transport
/// and embedded connection are passed to [`Client::new`] separately.
pub struct ClientConfig {
    connecting_send_rate: f64,
    connected_send_rate: f64,
    connecting_timeout: f64,
    connected_timeout: f64,
    default_server_port: u16,
    max_server_data_size: usize,
    client_data: Option<Vec<u8>>,
    fragment_size: usize,
    fragments_per_second: f64,
    resolver: Option<Box<dyn Resolver>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connecting_send_rate: DEFAULT_CONNECTING_SEND_RATE,
            connected_send_rate: DEFAULT_CONNECTED_SEND_RATE,
            connecting_timeout: DEFAULT_CONNECTING_TIMEOUT,
            connected_timeout: DEFAULT_CONNECTED_TIMEOUT,
            default_server_port: DEFAULT_SERVER_PORT,
            max_server_data_size: 0,
            client_data: None,
            fragment_size: MAX_FRAGMENT_SIZE,
            fragments_per_second: DEFAULT_FRAGMENTS_PER_SECOND,
            resolver: None,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Packets per second while connecting and once connected.
    pub fn send_rates(mut self, connecting: f64, connected: f64) -> Self {
        self.connecting_send_rate = connecting;
        self.connected_send_rate = connected;
        self
    }

    /// Seconds of inbound silence tolerated while connecting and once
    /// connected.
    pub fn timeouts(mut self, connecting: f64, connected: f64) -> Self {
        self.connecting_timeout = connecting;
        self.connected_timeout = connected;
        self
    }

    /// Port applied to resolver results that carry port 0.
    pub fn default_server_port(mut self, port: u16) -> Self {
        self.default_server_port = port;
        self
    }

    /// Accept a server data block up to `max_size` bytes during the
    /// handshake; 0 disables the block receiver.
    pub fn server_data(mut self, max_size: usize) -> Self {
        self.max_server_data_size = max_size;
        self
    }

    /// Upload `data` to the server during the handshake.
    pub fn client_data(mut self, data: Vec<u8>) -> Self {
        self.client_data = Some(data);
        self
    }

    /// Fragment size for both block directions.
    pub fn fragment_size(mut self, size: usize) -> Self {
        self.fragment_size = size;
        self
    }

    /// Block sender rate.
    pub fn fragments_per_second(mut self, rate: f64) -> Self {
        self.fragments_per_second = rate;
        self
    }

    /// Enable hostname connects.
    pub fn resolver(mut self, resolver: impl Resolver + 'static) -> Self {
        self.resolver = Some(Box::new(resolver));
        self
    }
}

pub struct Client<I: NetworkInterface, C: Connection> {
    interface: I,
    connection: C,
    resolver: Option<Box<dyn Resolver>>,
    config: ClientConfig,
    state: ClientState,
    address: Option<SocketAddr>,
    hostname: String,
    client_guid: u64,
    server_guid: u64,
    time_base: TimeBase,
    last_packet_receive_time: f64,
    accumulator: f64,
    error: Option<ClientError>,
    extended_error: u32,
    block_sender: Option<BlockSender>,
    block_receiver: Option<BlockReceiver>,
}

impl<I: NetworkInterface, C: Connection> Client<I, C> {
    pub fn new(interface: I, connection: C, mut config: ClientConfig) -> Result<Self, ConfigError> {
        let uses_blocks = config.max_server_data_size > 0 || config.client_data.is_some();
        if uses_blocks && (config.fragment_size == 0 || config.fragment_size > MAX_FRAGMENT_SIZE) {
            return Err(ConfigError::InvalidFragmentSize(config.fragment_size));
        }
        if config.client_data.is_some() && config.fragments_per_second <= 0.0 {
            return Err(ConfigError::InvalidFragmentRate(config.fragments_per_second));
        }

        let block_sender = config
            .client_data
            .take()
            .map(|data| BlockSender::new(data, config.fragment_size, config.fragments_per_second));
        let block_receiver = (config.max_server_data_size > 0)
            .then(|| BlockReceiver::new(config.fragment_size, config.max_server_data_size));
        let resolver = config.resolver.take();

        Ok(Self {
            interface,
            connection,
            resolver,
            config,
            state: ClientState::Disconnected,
            address: None,
            hostname: String::new(),
            client_guid: 0,
            server_guid: 0,
            time_base: TimeBase::default(),
            last_packet_receive_time: 0.0,
            accumulator: 0.0,
            error: None,
            extended_error: 0,
            block_sender,
            block_receiver,
        })
    }

    /// Begin connecting to a server address. Any in-flight session is torn
    /// down first and any latched error cleared.
    pub fn connect_addr(&mut self, address: SocketAddr) {
        self.disconnect();
        self.clear_error();

        log::info!("client connecting to {}", address);
        self.state = ClientState::SendingConnectionRequest;
        self.address = Some(address);
        self.client_guid = generate_guid();
        self.last_packet_receive_time = self.time_base.time;
    }

    /// Begin connecting to `target`: either textual `ip:port`, or a
    /// hostname for the configured resolver.
    pub fn connect(&mut self, target: &str) {
        self.disconnect();
        self.clear_error();

        if let Some(address) = parse_address(target) {
            self.connect_addr(address);
            return;
        }

        let Some(resolver) = self.resolver.as_mut() else {
            self.disconnect_and_set_error(ClientError::MissingResolver, 0);
            return;
        };

        log::info!("client resolving hostname {:?}", target);
        resolver.resolve(target);
        self.state = ClientState::ResolvingHostname;
        self.hostname = bounded_hostname(target);
        self.last_packet_receive_time = self.time_base.time;
    }

    /// Tear the session down, emitting a single farewell packet when one is
    /// in flight. Idempotent; a latched error survives until the next
    /// connect.
    pub fn disconnect(&mut self) {
        if self.is_disconnected() {
            return;
        }

        log::info!("client disconnecting");
        if let Some(address) = self.address {
            let packet = DisconnectedPacket::create(self.client_guid, self.server_guid);
            self.interface.send_packet(address, packet);
        }

        self.connection.reset();
        if let Some(sender) = self.block_sender.as_mut() {
            sender.clear();
        }
        if let Some(receiver) = self.block_receiver.as_mut() {
            receiver.clear();
        }
        self.clear_session();
        self.state = ClientState::Disconnected;
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_disconnected(&self) -> bool {
        self.state == ClientState::Disconnected
    }

    pub fn is_connecting(&self) -> bool {
        self.state > ClientState::Disconnected && self.state < ClientState::Connected
    }

    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn error(&self) -> Option<ClientError> {
        self.error
    }

    /// Stable numeric error code; 0 when no error is latched.
    pub fn error_code(&self) -> u32 {
        self.error.map_or(0, ClientError::code)
    }

    pub fn extended_error(&self) -> u32 {
        self.extended_error
    }

    pub fn server_address(&self) -> Option<SocketAddr> {
        self.address
    }

    pub fn client_guid(&self) -> u64 {
        self.client_guid
    }

    pub fn server_guid(&self) -> u64 {
        self.server_guid
    }

    /// The server's data block once fully received, else `None`.
    pub fn server_data(&self) -> Option<&[u8]> {
        self.block_receiver.as_ref().and_then(BlockReceiver::block)
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.connection
    }

    pub fn interface(&self) -> &I {
        &self.interface
    }

    pub fn interface_mut(&mut self) -> &mut I {
        &mut self.interface
    }

    /// Advance the session by one tick. Sub-systems run in a fixed order so
    /// the state observable at return reflects every packet drained this
    /// tick and the timeout check that followed them.
    pub fn update(&mut self, time_base: TimeBase) {
        self.time_base = time_base;
        self.update_resolver();
        self.update_connection();
        self.update_send_packets();
        self.interface.update(&self.time_base);
        self.update_receive_packets();
        self.update_send_client_data();
        self.update_timeout();
    }

    fn update_resolver(&mut self) {
        if let Some(resolver) = self.resolver.as_mut() {
            resolver.update(&self.time_base);
        }
        if self.state != ClientState::ResolvingHostname {
            return;
        }
        let entry = self
            .resolver
            .as_ref()
            .and_then(|resolver| resolver.entry(&self.hostname));
        match entry {
            Some(ResolveStatus::Pending) => {}
            Some(ResolveStatus::Succeeded(addresses)) if !addresses.is_empty() => {
                let address = apply_default_port(addresses[0], self.config.default_server_port);
                log::info!("client resolved {:?} to {}", self.hostname, address);
                self.connect_addr(address);
            }
            _ => self.disconnect_and_set_error(ClientError::ResolveHostnameFailed, 0),
        }
    }

    fn update_connection(&mut self) {
        if self.state != ClientState::Connected {
            return;
        }
        self.connection.update(&self.time_base);
        let error = self.connection.error();
        if error != 0 {
            self.disconnect_and_set_error(ClientError::ConnectionError, error);
        }
    }

    fn update_send_packets(&mut self) {
        if self.state < ClientState::SendingConnectionRequest {
            return;
        }
        let Some(address) = self.address else {
            return;
        };

        self.accumulator += self.time_base.delta_time;
        let rate = if self.is_connected() {
            self.config.connected_send_rate
        } else {
            self.config.connecting_send_rate
        };
        let time_between_packets = 1.0 / rate;

        while self.accumulator >= time_between_packets {
            self.accumulator -= time_between_packets;
            let packet = match self.state {
                ClientState::SendingConnectionRequest => {
                    log::debug!("client sending connection request");
                    Some(ConnectionRequestPacket::create(self.client_guid))
                }
                ClientState::SendingChallengeResponse => {
                    log::debug!("client sending challenge response");
                    Some(ChallengeResponsePacket::create(
                        self.client_guid,
                        self.server_guid,
                    ))
                }
                ClientState::ReadyForConnection => Some(ReadyForConnectionPacket::create(
                    self.client_guid,
                    self.server_guid,
                )),
                ClientState::Connected => {
                    log::trace!("client sending connection packet");
                    Some(ConnectionPacket::create(self.connection.write_packet()))
                }
                // The block sender paces itself; the budget still drains so
                // leaving these states does not burst.
                _ => None,
            };
            if let Some(packet) = packet {
                self.interface.send_packet(address, packet);
            }
        }
    }

    fn update_receive_packets(&mut self) {
        while let Some((from, packet)) = self.interface.receive_packet() {
            if let Packet::Disconnected(packet) = &packet {
                self.process_disconnected(from, packet);
                continue;
            }
            match self.state {
                ClientState::SendingConnectionRequest => match packet {
                    Packet::ConnectionChallenge(packet) => {
                        self.process_connection_challenge(from, &packet)
                    }
                    Packet::ConnectionDenied(packet) => {
                        self.process_connection_denied(from, &packet)
                    }
                    _ => {}
                },
                ClientState::SendingChallengeResponse => match packet {
                    Packet::DataBlockFragment(packet) => self.process_data_block_fragment(&packet),
                    Packet::ReadyForConnection(packet) => {
                        self.process_ready_for_connection(from, &packet)
                    }
                    _ => {}
                },
                ClientState::SendingClientData => match packet {
                    Packet::DataBlockFragment(packet) => self.process_data_block_fragment(&packet),
                    Packet::DataBlockFragmentAck(packet) => {
                        self.process_data_block_fragment_ack(&packet)
                    }
                    _ => {}
                },
                ClientState::ReadyForConnection | ClientState::Connected => match packet {
                    Packet::DataBlockFragment(packet) => self.process_data_block_fragment(&packet),
                    Packet::Connection(packet) => self.process_connection_packet(&packet),
                    _ => {}
                },
                _ => {}
            }
        }
    }

    fn update_send_client_data(&mut self) {
        if self.state != ClientState::SendingClientData {
            return;
        }
        let Some(sender) = self.block_sender.as_mut() else {
            return;
        };
        if sender.send_completed() {
            log::debug!("client data upload complete");
            self.state = ClientState::ReadyForConnection;
            return;
        }
        sender.update(&self.time_base, &mut self.interface);
    }

    fn update_timeout(&mut self) {
        if self.is_disconnected() {
            return;
        }
        let timeout = if self.is_connected() {
            self.config.connected_timeout
        } else {
            self.config.connecting_timeout
        };
        if self.last_packet_receive_time + timeout < self.time_base.time {
            log::info!("client timed out in state {:?}", self.state);
            let state = self.state;
            self.disconnect_and_set_error(ClientError::ConnectionTimedOut, state as u32);
        }
    }

    fn process_disconnected(&mut self, from: SocketAddr, packet: &DisconnectedPacket) {
        if self.is_disconnected() {
            return;
        }
        if Some(from) != self.address
            || packet.client_guid != self.client_guid
            || packet.server_guid != self.server_guid
        {
            return;
        }
        log::info!("client received disconnect from server");
        self.disconnect_and_set_error(ClientError::DisconnectedFromServer, 0);
    }

    fn process_connection_challenge(
        &mut self,
        from: SocketAddr,
        packet: &ConnectionChallengePacket,
    ) {
        if Some(from) != self.address || packet.client_guid != self.client_guid {
            return;
        }
        log::debug!("client received connection challenge");
        self.state = ClientState::SendingChallengeResponse;
        self.server_guid = packet.server_guid;
        self.last_packet_receive_time = self.time_base.time;

        // Both guids are fixed now; arm the block endpoints with them.
        let info = SessionInfo {
            address: from,
            client_guid: self.client_guid,
            server_guid: self.server_guid,
        };
        if let Some(sender) = self.block_sender.as_mut() {
            sender.set_info(info);
        }
        if let Some(receiver) = self.block_receiver.as_mut() {
            receiver.set_info(info);
        }
    }

    fn process_connection_denied(&mut self, from: SocketAddr, packet: &ConnectionDeniedPacket) {
        if Some(from) != self.address || packet.client_guid != self.client_guid {
            return;
        }
        log::info!("client connection denied, reason {}", packet.reason);
        self.disconnect_and_set_error(ClientError::ConnectionRequestDenied, packet.reason);
    }

    fn process_ready_for_connection(&mut self, from: SocketAddr, packet: &ReadyForConnectionPacket) {
        if Some(from) != self.address
            || packet.client_guid != self.client_guid
            || packet.server_guid != self.server_guid
        {
            return;
        }
        self.state = if self.block_sender.is_some() {
            log::debug!("client starting data upload");
            ClientState::SendingClientData
        } else {
            ClientState::ReadyForConnection
        };
        self.last_packet_receive_time = self.time_base.time;
    }

    fn process_data_block_fragment(&mut self, packet: &DataBlockFragmentPacket) {
        if packet.client_guid != self.client_guid || packet.server_guid != self.server_guid {
            return;
        }
        let Some(receiver) = self.block_receiver.as_mut() else {
            return;
        };
        receiver.process_fragment(
            packet.block_size,
            packet.num_fragments,
            packet.fragment_id,
            &packet.fragment_data,
            &mut self.interface,
        );
        if let Some(error) = self.block_receiver.as_ref().and_then(BlockReceiver::error) {
            self.disconnect_and_set_error(ClientError::DataBlockError, error.code());
        }
    }

    fn process_data_block_fragment_ack(&mut self, packet: &DataBlockFragmentAckPacket) {
        if packet.client_guid != self.client_guid || packet.server_guid != self.server_guid {
            return;
        }
        if let Some(sender) = self.block_sender.as_mut() {
            sender.process_ack(packet.fragment_id);
        }
    }

    fn process_connection_packet(&mut self, packet: &ConnectionPacket) {
        if self.state == ClientState::ReadyForConnection {
            log::info!("client connected");
            self.state = ClientState::Connected;
        }
        if self.connection.read_packet(&packet.payload) {
            self.last_packet_receive_time = self.time_base.time;
        }
    }

    fn disconnect_and_set_error(&mut self, error: ClientError, extended_error: u32) {
        log::debug!("client error: {}", error);
        self.disconnect();
        self.error = Some(error);
        self.extended_error = extended_error;
    }

    fn clear_error(&mut self) {
        self.error = None;
        self.extended_error = 0;
    }

    fn clear_session(&mut self) {
        self.hostname.clear();
        self.address = None;
        self.client_guid = 0;
        self.server_guid = 0;
    }
}

fn bounded_hostname(hostname: &str) -> String {
    let mut end = hostname.len().min(MAX_HOSTNAME_BYTES);
    while !hostname.is_char_boundary(end) {
        end -= 1;
    }
    hostname[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::NullConnection;
    use crate::simulator::{NetworkSimulator, SimulatedInterface, SimulatorConfig};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn test_client(config: ClientConfig) -> Client<SimulatedInterface, NullConnection> {
        let simulator = Rc::new(RefCell::new(NetworkSimulator::new(SimulatorConfig::default())));
        let interface = SimulatedInterface::new(simulator, "127.0.0.1:30000".parse().unwrap());
        Client::new(interface, NullConnection, config).unwrap()
    }

    #[test]
    fn starts_disconnected_without_error() {
        let client = test_client(ClientConfig::new());
        assert!(client.is_disconnected());
        assert!(!client.is_connecting());
        assert!(!client.is_connected());
        assert!(!client.has_error());
        assert_eq!(client.error_code(), 0);
    }

    #[test]
    fn connect_by_address_enters_request_state() {
        let mut client = test_client(ClientConfig::new());
        client.connect("10.0.0.1:5000");

        assert_eq!(client.state(), ClientState::SendingConnectionRequest);
        assert!(client.is_connecting());
        assert!(!client.is_disconnected());
        assert_ne!(client.client_guid(), 0);
        assert_eq!(client.server_guid(), 0);
        assert_eq!(client.server_address(), Some("10.0.0.1:5000".parse().unwrap()));
    }

    #[test]
    fn reconnect_generates_a_fresh_guid() {
        let mut client = test_client(ClientConfig::new());
        client.connect("10.0.0.1:5000");
        let first = client.client_guid();
        client.connect("10.0.0.1:5000");
        assert_ne!(client.client_guid(), first);
    }

    #[test]
    fn hostname_without_resolver_latches_missing_resolver() {
        let mut client = test_client(ClientConfig::new());
        client.connect("game.example.com");

        assert!(client.is_disconnected());
        assert_eq!(client.error(), Some(ClientError::MissingResolver));
        assert_eq!(client.error_code(), 2);
    }

    #[test]
    fn next_connect_clears_a_latched_error() {
        let mut client = test_client(ClientConfig::new());
        client.connect("game.example.com");
        assert!(client.has_error());

        client.connect("10.0.0.1:5000");
        assert!(!client.has_error());
        assert_eq!(client.extended_error(), 0);
    }

    #[test]
    fn zero_fragment_size_is_rejected_when_blocks_enabled() {
        let simulator = Rc::new(RefCell::new(NetworkSimulator::new(SimulatorConfig::default())));
        let interface = SimulatedInterface::new(simulator, "127.0.0.1:30000".parse().unwrap());
        let config = ClientConfig::new().server_data(4096).fragment_size(0);

        let result = Client::new(interface, NullConnection, config);
        assert!(matches!(result, Err(ConfigError::InvalidFragmentSize(0))));
    }

    #[test]
    fn oversized_fragment_size_is_rejected() {
        let simulator = Rc::new(RefCell::new(NetworkSimulator::new(SimulatorConfig::default())));
        let interface = SimulatedInterface::new(simulator, "127.0.0.1:30000".parse().unwrap());
        let config = ClientConfig::new()
            .client_data(vec![0u8; 16])
            .fragment_size(MAX_FRAGMENT_SIZE + 1);

        assert!(Client::new(interface, NullConnection, config).is_err());
    }

    #[test]
    fn non_positive_fragment_rate_is_rejected() {
        let simulator = Rc::new(RefCell::new(NetworkSimulator::new(SimulatorConfig::default())));
        let interface = SimulatedInterface::new(simulator, "127.0.0.1:30000".parse().unwrap());
        let config = ClientConfig::new()
            .client_data(vec![0u8; 16])
            .fragments_per_second(0.0);

        assert!(matches!(
            Client::new(interface, NullConnection, config),
            Err(ConfigError::InvalidFragmentRate(_))
        ));
    }

    #[test]
    fn disconnect_while_disconnected_is_a_no_op() {
        let mut client = test_client(ClientConfig::new());
        client.disconnect();
        assert!(client.is_disconnected());
        assert!(!client.has_error());
    }

    #[test]
    fn long_hostnames_are_bounded() {
        let long = "a".repeat(2 * MAX_HOSTNAME_BYTES);
        assert_eq!(bounded_hostname(&long).len(), MAX_HOSTNAME_BYTES);
        assert_eq!(bounded_hostname("game.example.com"), "game.example.com");
    }
}
