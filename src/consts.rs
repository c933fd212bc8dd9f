/// Hard ceiling on a serialized packet, including the type tag.
pub const MAX_PACKET_SIZE: usize = 1200;

/// Largest fragment the block-transfer sub-protocol puts on the wire.
pub const MAX_FRAGMENT_SIZE: usize = 1024;

/// Longest hostname the client holds onto while resolving.
pub const MAX_HOSTNAME_BYTES: usize = 256;

pub const DEFAULT_CONNECTING_SEND_RATE: f64 = 10.0;
pub const DEFAULT_CONNECTED_SEND_RATE: f64 = 30.0;
pub const DEFAULT_CONNECTING_TIMEOUT: f64 = 5.0;
pub const DEFAULT_CONNECTED_TIMEOUT: f64 = 10.0;
pub const DEFAULT_SERVER_PORT: u16 = 10000;
pub const DEFAULT_FRAGMENTS_PER_SECOND: f64 = 60.0;

pub(crate) const SOCKET_RECV_BUF_SIZE: usize = 1024 * 1024;
pub(crate) const SOCKET_SEND_BUF_SIZE: usize = 1024 * 1024;
