//! Wire packets for the client/server handshake and block transfer.
//!
//! Every handshake packet echoes the session guids so stray or forged
//! datagrams can be filtered before they touch client state. Serialization
//! is symmetric: `read` consumes exactly what `write` produced, and a
//! malformed buffer fails with an `io::Error` instead of panicking, so a
//! receive loop can drop the datagram and move on.

use std::io::{self, Cursor};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::consts::{MAX_FRAGMENT_SIZE, MAX_PACKET_SIZE};

/// Symmetric wire serialization. Implementations read exactly what they
/// write.
pub trait Bytes: Sized {
    fn write(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error>;
    fn read(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error>;
}

fn read_buf(reader: &mut impl ReadBytesExt, len: usize) -> Result<Vec<u8>, io::Error> {
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// First packet of the handshake, repeated until challenged or denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequestPacket {
    pub client_guid: u64,
}

impl ConnectionRequestPacket {
    pub fn create(client_guid: u64) -> Packet {
        Packet::ConnectionRequest(Self { client_guid })
    }
}

impl Bytes for ConnectionRequestPacket {
    fn write(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        writer.write_u64::<LittleEndian>(self.client_guid)
    }

    fn read(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        Ok(Self {
            client_guid: reader.read_u64::<LittleEndian>()?,
        })
    }
}

/// Server refusal; the reason code is opaque to this layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDeniedPacket {
    pub client_guid: u64,
    pub reason: u32,
}

impl ConnectionDeniedPacket {
    pub fn create(client_guid: u64, reason: u32) -> Packet {
        Packet::ConnectionDenied(Self {
            client_guid,
            reason,
        })
    }
}

impl Bytes for ConnectionDeniedPacket {
    fn write(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        writer.write_u64::<LittleEndian>(self.client_guid)?;
        writer.write_u32::<LittleEndian>(self.reason)
    }

    fn read(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        Ok(Self {
            client_guid: reader.read_u64::<LittleEndian>()?,
            reason: reader.read_u32::<LittleEndian>()?,
        })
    }
}

/// Binds the client's guid to the server's; from here on both sides echo
/// the pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionChallengePacket {
    pub client_guid: u64,
    pub server_guid: u64,
}

impl ConnectionChallengePacket {
    pub fn create(client_guid: u64, server_guid: u64) -> Packet {
        Packet::ConnectionChallenge(Self {
            client_guid,
            server_guid,
        })
    }
}

impl Bytes for ConnectionChallengePacket {
    fn write(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        writer.write_u64::<LittleEndian>(self.client_guid)?;
        writer.write_u64::<LittleEndian>(self.server_guid)
    }

    fn read(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        Ok(Self {
            client_guid: reader.read_u64::<LittleEndian>()?,
            server_guid: reader.read_u64::<LittleEndian>()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeResponsePacket {
    pub client_guid: u64,
    pub server_guid: u64,
}

impl ChallengeResponsePacket {
    pub fn create(client_guid: u64, server_guid: u64) -> Packet {
        Packet::ChallengeResponse(Self {
            client_guid,
            server_guid,
        })
    }
}

impl Bytes for ChallengeResponsePacket {
    fn write(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        writer.write_u64::<LittleEndian>(self.client_guid)?;
        writer.write_u64::<LittleEndian>(self.server_guid)
    }

    fn read(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        Ok(Self {
            client_guid: reader.read_u64::<LittleEndian>()?,
            server_guid: reader.read_u64::<LittleEndian>()?,
        })
    }
}

/// Sent by whichever side has finished its part of the handshake,
/// including any block transfer it owed the other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyForConnectionPacket {
    pub client_guid: u64,
    pub server_guid: u64,
}

impl ReadyForConnectionPacket {
    pub fn create(client_guid: u64, server_guid: u64) -> Packet {
        Packet::ReadyForConnection(Self {
            client_guid,
            server_guid,
        })
    }
}

impl Bytes for ReadyForConnectionPacket {
    fn write(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        writer.write_u64::<LittleEndian>(self.client_guid)?;
        writer.write_u64::<LittleEndian>(self.server_guid)
    }

    fn read(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        Ok(Self {
            client_guid: reader.read_u64::<LittleEndian>()?,
            server_guid: reader.read_u64::<LittleEndian>()?,
        })
    }
}

/// One fragment of a block transfer. The descriptor `(block_size,
/// num_fragments)` rides on every fragment so the receiver can allocate on
/// whichever arrives first and reject anything inconsistent later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlockFragmentPacket {
    pub client_guid: u64,
    pub server_guid: u64,
    pub block_size: u32,
    pub num_fragments: u16,
    pub fragment_id: u16,
    pub fragment_data: Vec<u8>,
}

impl DataBlockFragmentPacket {
    pub fn create(
        client_guid: u64,
        server_guid: u64,
        block_size: u32,
        num_fragments: u16,
        fragment_id: u16,
        fragment_data: &[u8],
    ) -> Packet {
        debug_assert!(fragment_data.len() <= MAX_FRAGMENT_SIZE);
        Packet::DataBlockFragment(Self {
            client_guid,
            server_guid,
            block_size,
            num_fragments,
            fragment_id,
            fragment_data: fragment_data.to_vec(),
        })
    }
}

impl Bytes for DataBlockFragmentPacket {
    fn write(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        writer.write_u64::<LittleEndian>(self.client_guid)?;
        writer.write_u64::<LittleEndian>(self.server_guid)?;
        writer.write_u32::<LittleEndian>(self.block_size)?;
        writer.write_u16::<LittleEndian>(self.num_fragments)?;
        writer.write_u16::<LittleEndian>(self.fragment_id)?;
        writer.write_u16::<LittleEndian>(self.fragment_data.len() as u16)?;
        writer.write_all(&self.fragment_data)
    }

    fn read(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        let client_guid = reader.read_u64::<LittleEndian>()?;
        let server_guid = reader.read_u64::<LittleEndian>()?;
        let block_size = reader.read_u32::<LittleEndian>()?;
        let num_fragments = reader.read_u16::<LittleEndian>()?;
        let fragment_id = reader.read_u16::<LittleEndian>()?;
        let fragment_bytes = reader.read_u16::<LittleEndian>()? as usize;
        if fragment_bytes > MAX_FRAGMENT_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "fragment exceeds maximum fragment size",
            ));
        }
        Ok(Self {
            client_guid,
            server_guid,
            block_size,
            num_fragments,
            fragment_id,
            fragment_data: read_buf(reader, fragment_bytes)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlockFragmentAckPacket {
    pub client_guid: u64,
    pub server_guid: u64,
    pub fragment_id: u16,
}

impl DataBlockFragmentAckPacket {
    pub fn create(client_guid: u64, server_guid: u64, fragment_id: u16) -> Packet {
        Packet::DataBlockFragmentAck(Self {
            client_guid,
            server_guid,
            fragment_id,
        })
    }
}

impl Bytes for DataBlockFragmentAckPacket {
    fn write(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        writer.write_u64::<LittleEndian>(self.client_guid)?;
        writer.write_u64::<LittleEndian>(self.server_guid)?;
        writer.write_u16::<LittleEndian>(self.fragment_id)
    }

    fn read(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        Ok(Self {
            client_guid: reader.read_u64::<LittleEndian>()?,
            server_guid: reader.read_u64::<LittleEndian>()?,
            fragment_id: reader.read_u16::<LittleEndian>()?,
        })
    }
}

/// Farewell, sent by either side when tearing a session down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectedPacket {
    pub client_guid: u64,
    pub server_guid: u64,
}

impl DisconnectedPacket {
    pub fn create(client_guid: u64, server_guid: u64) -> Packet {
        Packet::Disconnected(Self {
            client_guid,
            server_guid,
        })
    }
}

impl Bytes for DisconnectedPacket {
    fn write(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        writer.write_u64::<LittleEndian>(self.client_guid)?;
        writer.write_u64::<LittleEndian>(self.server_guid)
    }

    fn read(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        Ok(Self {
            client_guid: reader.read_u64::<LittleEndian>()?,
            server_guid: reader.read_u64::<LittleEndian>()?,
        })
    }
}

/// Carrier for the embedded connection's channel traffic. The payload is
/// opaque here; the connection on each side owns its meaning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionPacket {
    pub payload: Vec<u8>,
}

impl ConnectionPacket {
    pub fn create(payload: Vec<u8>) -> Packet {
        debug_assert!(payload.len() < MAX_PACKET_SIZE);
        Packet::Connection(Self { payload })
    }
}

impl Bytes for ConnectionPacket {
    fn write(&self, writer: &mut impl WriteBytesExt) -> Result<(), io::Error> {
        writer.write_u16::<LittleEndian>(self.payload.len() as u16)?;
        writer.write_all(&self.payload)
    }

    fn read(reader: &mut impl ReadBytesExt) -> Result<Self, io::Error> {
        let len = reader.read_u16::<LittleEndian>()? as usize;
        if len > MAX_PACKET_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "connection payload exceeds maximum packet size",
            ));
        }
        Ok(Self {
            payload: read_buf(reader, len)?,
        })
    }
}

/// Every packet the client/server protocol puts on the wire, tagged with a
/// stable one-byte type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    ConnectionRequest(ConnectionRequestPacket),
    ConnectionDenied(ConnectionDeniedPacket),
    ConnectionChallenge(ConnectionChallengePacket),
    ChallengeResponse(ChallengeResponsePacket),
    ReadyForConnection(ReadyForConnectionPacket),
    DataBlockFragment(DataBlockFragmentPacket),
    DataBlockFragmentAck(DataBlockFragmentAckPacket),
    Disconnected(DisconnectedPacket),
    Connection(ConnectionPacket),
}

impl Packet {
    pub const CONNECTION_REQUEST: u8 = 0;
    pub const CONNECTION_DENIED: u8 = 1;
    pub const CONNECTION_CHALLENGE: u8 = 2;
    pub const CHALLENGE_RESPONSE: u8 = 3;
    pub const READY_FOR_CONNECTION: u8 = 4;
    pub const DATA_BLOCK_FRAGMENT: u8 = 5;
    pub const DATA_BLOCK_FRAGMENT_ACK: u8 = 6;
    pub const DISCONNECTED: u8 = 7;
    pub const CONNECTION: u8 = 8;

    pub fn tag(&self) -> u8 {
        match self {
            Packet::ConnectionRequest(_) => Self::CONNECTION_REQUEST,
            Packet::ConnectionDenied(_) => Self::CONNECTION_DENIED,
            Packet::ConnectionChallenge(_) => Self::CONNECTION_CHALLENGE,
            Packet::ChallengeResponse(_) => Self::CHALLENGE_RESPONSE,
            Packet::ReadyForConnection(_) => Self::READY_FOR_CONNECTION,
            Packet::DataBlockFragment(_) => Self::DATA_BLOCK_FRAGMENT,
            Packet::DataBlockFragmentAck(_) => Self::DATA_BLOCK_FRAGMENT_ACK,
            Packet::Disconnected(_) => Self::DISCONNECTED,
            Packet::Connection(_) => Self::CONNECTION,
        }
    }

    /// Serialize into `buf`, returning the number of bytes written. A
    /// buffer too small for the packet fails without writing past it.
    pub fn write(&self, buf: &mut [u8]) -> Result<usize, io::Error> {
        let mut cursor = Cursor::new(buf);
        cursor.write_u8(self.tag())?;
        match self {
            Packet::ConnectionRequest(packet) => packet.write(&mut cursor)?,
            Packet::ConnectionDenied(packet) => packet.write(&mut cursor)?,
            Packet::ConnectionChallenge(packet) => packet.write(&mut cursor)?,
            Packet::ChallengeResponse(packet) => packet.write(&mut cursor)?,
            Packet::ReadyForConnection(packet) => packet.write(&mut cursor)?,
            Packet::DataBlockFragment(packet) => packet.write(&mut cursor)?,
            Packet::DataBlockFragmentAck(packet) => packet.write(&mut cursor)?,
            Packet::Disconnected(packet) => packet.write(&mut cursor)?,
            Packet::Connection(packet) => packet.write(&mut cursor)?,
        }
        Ok(cursor.position() as usize)
    }

    /// Deserialize one packet from `buf`. Unknown tags, truncation, and
    /// out-of-bound sizes all fail; callers drop the datagram and keep
    /// receiving.
    pub fn read(buf: &[u8]) -> Result<Self, io::Error> {
        let mut cursor = Cursor::new(buf);
        let packet = match cursor.read_u8()? {
            Self::CONNECTION_REQUEST => {
                Packet::ConnectionRequest(ConnectionRequestPacket::read(&mut cursor)?)
            }
            Self::CONNECTION_DENIED => {
                Packet::ConnectionDenied(ConnectionDeniedPacket::read(&mut cursor)?)
            }
            Self::CONNECTION_CHALLENGE => {
                Packet::ConnectionChallenge(ConnectionChallengePacket::read(&mut cursor)?)
            }
            Self::CHALLENGE_RESPONSE => {
                Packet::ChallengeResponse(ChallengeResponsePacket::read(&mut cursor)?)
            }
            Self::READY_FOR_CONNECTION => {
                Packet::ReadyForConnection(ReadyForConnectionPacket::read(&mut cursor)?)
            }
            Self::DATA_BLOCK_FRAGMENT => {
                Packet::DataBlockFragment(DataBlockFragmentPacket::read(&mut cursor)?)
            }
            Self::DATA_BLOCK_FRAGMENT_ACK => {
                Packet::DataBlockFragmentAck(DataBlockFragmentAckPacket::read(&mut cursor)?)
            }
            Self::DISCONNECTED => Packet::Disconnected(DisconnectedPacket::read(&mut cursor)?),
            Self::CONNECTION => Packet::Connection(ConnectionPacket::read(&mut cursor)?),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "unknown packet type",
                ))
            }
        };
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::MAX_PACKET_SIZE;

    #[test]
    fn fragment_survives_the_wire() {
        let data: Vec<u8> = (0..600).map(|i| (i % 256) as u8).collect();
        let packet = DataBlockFragmentPacket::create(0x1122, 0x3344, 4096, 4, 3, &data);

        let mut buf = [0u8; MAX_PACKET_SIZE];
        let size = packet.write(&mut buf).unwrap();
        assert_eq!(Packet::read(&buf[..size]).unwrap(), packet);
    }

    #[test]
    fn truncated_packet_fails_without_panic() {
        let data = vec![0xabu8; 600];
        let packet = DataBlockFragmentPacket::create(1, 2, 4096, 4, 0, &data);

        let mut buf = [0u8; MAX_PACKET_SIZE];
        let size = packet.write(&mut buf).unwrap();
        for cut in [0, 1, 8, size / 2, size - 1] {
            assert!(Packet::read(&buf[..cut]).is_err());
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(Packet::read(&[0xff, 0, 0, 0]).is_err());
        assert!(Packet::read(&[]).is_err());
    }

    #[test]
    fn oversized_fragment_length_is_rejected() {
        // Hand-craft a fragment header whose declared length exceeds the
        // fragment size cap.
        let mut buf = Vec::new();
        buf.push(Packet::DATA_BLOCK_FRAGMENT);
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.extend_from_slice(&2u64.to_le_bytes());
        buf.extend_from_slice(&4096u32.to_le_bytes());
        buf.extend_from_slice(&4u16.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&(MAX_FRAGMENT_SIZE as u16 + 1).to_le_bytes());
        buf.resize(buf.len() + MAX_FRAGMENT_SIZE + 1, 0);

        assert!(Packet::read(&buf).is_err());
    }

    #[test]
    fn write_fails_when_buffer_is_too_small() {
        let packet = ConnectionChallengePacket::create(1, 2);
        let mut buf = [0u8; 8];
        assert!(packet.write(&mut buf).is_err());
    }
}
