//! Client-side connection core for UDP game networking.
//!
//! A [`Client`] establishes and maintains a session with one server over an
//! unreliable datagram substrate: GUID challenge/response handshake,
//! optional fragmented block transfer in both directions during setup, send
//! pacing, liveness timeouts, and a latched error surface. Steady-state
//! channel traffic is delegated to whatever implements [`Connection`];
//! packet I/O to whatever implements [`NetworkInterface`].
//!
//! The host drives everything through [`Client::update`] once per tick;
//! nothing in the crate blocks or spawns threads on its own (the optional
//! [`SystemResolver`] keeps its lookups behind a poll-only surface).

mod addr;
mod consts;

pub mod block;
pub mod client;
pub mod connection;
pub mod error;
pub mod interface;
pub mod packet;
pub mod resolver;
pub mod simulator;
pub mod time;

pub use addr::generate_guid;
pub use block::{BlockError, SessionInfo};
pub use client::{Client, ClientConfig, ClientState};
pub use connection::{Connection, NullConnection};
pub use consts::{MAX_FRAGMENT_SIZE, MAX_PACKET_SIZE};
pub use error::{ClientError, ConfigError};
pub use interface::{NetworkInterface, UdpInterface};
pub use packet::Packet;
pub use resolver::{ResolveStatus, Resolver, SystemResolver};
pub use time::TimeBase;
