//! Packet envelope for the WScp wire protocol.
//!
//! # Packet Format
//!
//! Each packet consists of:
//! - 4 bytes: magic bytes "WSCP"
//! - 1 byte: packet type tag
//! - 4 bytes: payload length (big-endian)
//! - N bytes: payload
//!
//! The meaning of the payload depends entirely on the type tag; see
//! [`crate::messages`] for the payload schemas. The transport is
//! message-oriented, so a buffer handed to [`Packet::decode`] must contain
//! exactly one packet.

use std::fmt;

use crate::error::{ProtocolError, Result};

/// Magic bytes identifying a WScp packet.
pub const PACKET_MAGIC: [u8; 4] = *b"WSCP";

/// Packet header size: 4 (magic) + 1 (type) + 4 (length) = 9 bytes.
pub const PACKET_HEADER_SIZE: usize = 9;

/// Maximum encoded packet size (16 MB).
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Type tag of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Key exchange: public key from the sender, symmetric key in the response.
    Handshake = 0,
    /// Transfer metadata announced by the sender.
    Init = 1,
    /// Acceptance of the previous packet.
    Ack = 2,
    /// Position synchronization.
    Sync = 3,
    /// Request to retransmit the last chunk.
    Replay = 4,
    /// A chunk of file content.
    Content = 5,
}

impl PacketType {
    /// Returns the wire tag of this packet type.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Returns the human-readable name of this packet type.
    pub fn name(self) -> &'static str {
        match self {
            PacketType::Handshake => "Handshake",
            PacketType::Init => "Init",
            PacketType::Ack => "Ack",
            PacketType::Sync => "Sync",
            PacketType::Replay => "Replay",
            PacketType::Content => "Content",
        }
    }
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(PacketType::Handshake),
            1 => Ok(PacketType::Init),
            2 => Ok(PacketType::Ack),
            3 => Ok(PacketType::Sync),
            4 => Ok(PacketType::Replay),
            5 => Ok(PacketType::Content),
            other => Err(ProtocolError::UnknownPacketType(other)),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed packet: the unit exchanged over the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// The packet type tag.
    pub packet_type: PacketType,
    /// The type-dependent payload.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Create a new packet.
    pub fn new(packet_type: PacketType, payload: Vec<u8>) -> Self {
        Self {
            packet_type,
            payload,
        }
    }

    /// Encode the packet into bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let total_size = PACKET_HEADER_SIZE + self.payload.len();
        if total_size > MAX_PACKET_SIZE {
            return Err(ProtocolError::PacketTooLarge {
                size: total_size,
                max: MAX_PACKET_SIZE,
            });
        }

        let mut output = Vec::with_capacity(total_size);
        output.extend_from_slice(&PACKET_MAGIC);
        output.push(self.packet_type.as_byte());
        output.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        output.extend_from_slice(&self.payload);

        Ok(output)
    }

    /// Decode a packet from bytes.
    ///
    /// The buffer must hold exactly one packet: short headers, bad magic,
    /// unknown type tags, truncated payloads and trailing bytes are all
    /// rejected.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let packet_type = Self::peek_type(data)?;

        let length_bytes = [data[5], data[6], data[7], data[8]];
        let payload_len = u32::from_be_bytes(length_bytes) as usize;

        let total_size = PACKET_HEADER_SIZE + payload_len;
        if total_size > MAX_PACKET_SIZE {
            return Err(ProtocolError::PacketTooLarge {
                size: total_size,
                max: MAX_PACKET_SIZE,
            });
        }

        if data.len() < total_size {
            return Err(ProtocolError::Deserialization(format!(
                "truncated packet: need {} bytes, have {}",
                total_size,
                data.len()
            )));
        }

        if data.len() > total_size {
            return Err(ProtocolError::Deserialization(format!(
                "trailing data after packet: {} extra bytes",
                data.len() - total_size
            )));
        }

        Ok(Self {
            packet_type,
            payload: data[PACKET_HEADER_SIZE..].to_vec(),
        })
    }

    /// Read the type tag of an encoded packet without decoding its payload.
    pub fn peek_type(data: &[u8]) -> Result<PacketType> {
        if data.len() < PACKET_HEADER_SIZE {
            return Err(ProtocolError::Deserialization(format!(
                "insufficient data for packet header: need {} bytes, have {}",
                PACKET_HEADER_SIZE,
                data.len()
            )));
        }

        let magic = &data[0..4];
        if magic != PACKET_MAGIC {
            let expected = u32::from_be_bytes(PACKET_MAGIC);
            let got = u32::from_be_bytes([magic[0], magic[1], magic[2], magic[3]]);
            return Err(ProtocolError::Deserialization(format!(
                "invalid packet magic: expected 0x{:08x} (WSCP), got 0x{:08x}",
                expected, got
            )));
        }

        PacketType::try_from(data[4])
    }
}
