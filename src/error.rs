use thiserror::Error;

/// Latched session failure surfaced by [`crate::client::Client`].
///
/// Discriminants are stable codes; "no error" is the absence of a latched
/// value and reads back as code 0 through
/// [`crate::client::Client::error_code`]. A latched error always coincides
/// with the `Disconnected` state and survives until the next connect.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ClientError {
    #[error("connect address is not valid")]
    InvalidConnectAddress = 1,
    #[error("cannot resolve hostname without a resolver")]
    MissingResolver = 2,
    #[error("hostname resolution failed")]
    ResolveHostnameFailed = 3,
    #[error("connection request denied by server")]
    ConnectionRequestDenied = 4,
    #[error("connection timed out")]
    ConnectionTimedOut = 5,
    #[error("disconnected by server")]
    DisconnectedFromServer = 6,
    #[error("connection reported an error")]
    ConnectionError = 7,
    #[error("data block transfer failed")]
    DataBlockError = 8,
}

impl ClientError {
    /// Stable numeric code; 0 is reserved for "no error".
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Rejected configuration, reported by [`crate::client::Client::new`]
/// before any session state exists.
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum ConfigError {
    #[error("fragment size {0} is outside 1..={max}", max = crate::consts::MAX_FRAGMENT_SIZE)]
    InvalidFragmentSize(usize),
    #[error("fragments per second must be positive, got {0}")]
    InvalidFragmentRate(f64),
}
