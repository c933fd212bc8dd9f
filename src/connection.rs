//! Seam to the embedded reliable-channel engine.

use crate::time::TimeBase;

/// Contract the client drives once a session is up. Whatever channel
/// structure sits behind it is the implementor's business; the client only
/// ticks it, feeds it inbound connection payloads, asks it for outbound
/// ones, and watches its error surface.
pub trait Connection {
    /// Per-tick processing while the session is connected.
    fn update(&mut self, time_base: &TimeBase);

    /// Consume the payload of an inbound connection packet. Returns whether
    /// the payload was accepted; accepted payloads count toward liveness.
    fn read_packet(&mut self, payload: &[u8]) -> bool;

    /// Produce the payload for the next outbound connection packet.
    fn write_packet(&mut self) -> Vec<u8>;

    /// Drop all in-flight state ahead of reuse.
    fn reset(&mut self);

    /// Non-zero once the engine has failed; the value becomes the client's
    /// extended error.
    fn error(&self) -> u32;
}

/// No channels: accepts every payload, emits empty keep-alives, never
/// fails. For hosts that only need the session handshake.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullConnection;

impl Connection for NullConnection {
    fn update(&mut self, _time_base: &TimeBase) {}

    fn read_packet(&mut self, _payload: &[u8]) -> bool {
        true
    }

    fn write_packet(&mut self) -> Vec<u8> {
        Vec::new()
    }

    fn reset(&mut self) {}

    fn error(&self) -> u32 {
        0
    }
}
