//! Protocol message definitions for WScp.
//!
//! Each [`Message`] variant corresponds to one [`PacketType`]. Payloads are
//! serialized using MessagePack; `Ack` carries no payload at all.

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{ProtocolError, Result};
use crate::packet::{Packet, PacketType};

/// Key exchange message.
///
/// The sender fills `public_key` and leaves `symmetric_key` empty; the
/// receiver answers with only `symmetric_key`, encrypted under the sender's
/// public key. Both keys are wiped when the message is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct HandshakeMessage {
    /// DER-encoded (PKIX) public key.
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
    /// Session key chosen by the receiver.
    #[serde(with = "serde_bytes")]
    pub symmetric_key: Option<Vec<u8>>,
}

/// Transfer metadata announced by the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitMessage {
    /// Total file size in bytes.
    pub size: u64,
    /// Base name of the file.
    pub filename: String,
    /// Hex SHA-256 of the whole file.
    pub checksum: String,
    /// Number of content packets that will follow.
    pub packet_count: u64,
    /// Index of the first chunk (always 0 for a fresh transfer).
    pub index: u64,
}

/// Acceptance of the previous packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AckMessage {}

/// Chunk position, used by both `Sync` and `Replay`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    /// Chunk index the message refers to.
    pub index: u64,
    /// Checksum of the chunk as observed by the sender of this message.
    pub checksum: String,
}

/// Request to retransmit the last chunk. Same shape as [`SyncMessage`].
pub type ReplayMessage = SyncMessage;

/// A chunk of file content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentMessage {
    /// Raw chunk bytes.
    #[serde(with = "serde_bytes")]
    pub content: Vec<u8>,
    /// Hex SHA-256 of `content`.
    pub checksum: String,
}

/// Top-level message enum, keyed by packet type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Key exchange.
    Handshake(HandshakeMessage),
    /// Transfer metadata.
    Init(InitMessage),
    /// Acknowledgment.
    Ack(AckMessage),
    /// Position synchronization.
    Sync(SyncMessage),
    /// Retransmission request.
    Replay(ReplayMessage),
    /// File content.
    Content(ContentMessage),
}

impl Message {
    /// Returns the packet type carrying this message.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Message::Handshake(_) => PacketType::Handshake,
            Message::Init(_) => PacketType::Init,
            Message::Ack(_) => PacketType::Ack,
            Message::Sync(_) => PacketType::Sync,
            Message::Replay(_) => PacketType::Replay,
            Message::Content(_) => PacketType::Content,
        }
    }

    /// Serialize the message body into a packet payload.
    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        let payload = match self {
            Message::Handshake(msg) => rmp_serde::to_vec(msg)?,
            Message::Init(msg) => rmp_serde::to_vec(msg)?,
            Message::Ack(_) => Vec::new(),
            Message::Sync(msg) | Message::Replay(msg) => rmp_serde::to_vec(msg)?,
            Message::Content(msg) => rmp_serde::to_vec(msg)?,
        };
        Ok(payload)
    }

    /// Deserialize a packet payload according to its type tag.
    pub fn decode_payload(packet_type: PacketType, payload: &[u8]) -> Result<Self> {
        let message = match packet_type {
            PacketType::Handshake => Message::Handshake(rmp_serde::from_slice(payload)?),
            PacketType::Init => Message::Init(rmp_serde::from_slice(payload)?),
            PacketType::Ack => {
                if !payload.is_empty() {
                    return Err(ProtocolError::Deserialization(format!(
                        "ack payload must be empty, got {} bytes",
                        payload.len()
                    )));
                }
                Message::Ack(AckMessage {})
            }
            PacketType::Sync => Message::Sync(rmp_serde::from_slice(payload)?),
            PacketType::Replay => Message::Replay(rmp_serde::from_slice(payload)?),
            PacketType::Content => Message::Content(rmp_serde::from_slice(payload)?),
        };
        Ok(message)
    }

    /// Wrap the message into a typed packet.
    pub fn to_packet(&self) -> Result<Packet> {
        Ok(Packet::new(self.packet_type(), self.encode_payload()?))
    }

    /// Decode the message carried by a packet.
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        Self::decode_payload(packet.packet_type, &packet.payload)
    }

    /// Encode the message all the way to wire bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.to_packet()?.encode()
    }

    /// Decode a message from wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_packet(&Packet::decode(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::MAX_STRIDE;
    use crate::packet::MAX_PACKET_SIZE;

    /// Helper to test roundtrip serialization through the wire format
    fn roundtrip(msg: Message) {
        let bytes = msg.to_bytes().expect("serialization failed");
        let decoded = Message::from_bytes(&bytes).expect("deserialization failed");
        assert_eq!(msg, decoded);
    }

    fn content(len: usize) -> Message {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        Message::Content(ContentMessage {
            checksum: format!("{:064x}", len),
            content: data,
        })
    }

    #[test]
    fn test_handshake_request_roundtrip() {
        roundtrip(Message::Handshake(HandshakeMessage {
            public_key: vec![0x30, 0x82, 0x02, 0x22],
            symmetric_key: None,
        }));
    }

    #[test]
    fn test_handshake_response_roundtrip() {
        roundtrip(Message::Handshake(HandshakeMessage {
            public_key: Vec::new(),
            symmetric_key: Some(vec![0x42; 32]),
        }));
    }

    #[test]
    fn test_init_roundtrip() {
        roundtrip(Message::Init(InitMessage {
            size: 10,
            filename: "report.pdf".to_string(),
            checksum: "ab".repeat(32),
            packet_count: 3,
            index: 0,
        }));
    }

    #[test]
    fn test_ack_roundtrip() {
        roundtrip(Message::Ack(AckMessage {}));
    }

    #[test]
    fn test_sync_and_replay_keep_their_tags() {
        let body = SyncMessage {
            index: 4,
            checksum: "cd".repeat(32),
        };
        roundtrip(Message::Sync(body.clone()));
        roundtrip(Message::Replay(body.clone()));

        let sync = Message::Sync(body.clone()).to_packet().unwrap();
        let replay = Message::Replay(body).to_packet().unwrap();
        assert_eq!(sync.packet_type, PacketType::Sync);
        assert_eq!(replay.packet_type, PacketType::Replay);
        assert_eq!(sync.payload, replay.payload);
    }

    #[test]
    fn test_content_boundary_sizes_roundtrip() {
        for len in [0, 1, 4096, 256 * 1024, MAX_STRIDE] {
            roundtrip(content(len));
        }
    }

    #[test]
    fn test_max_stride_content_fits_in_packet() {
        let packet = content(MAX_STRIDE).to_packet().unwrap();
        assert!(packet.payload.len() < MAX_PACKET_SIZE);
    }

    #[test]
    fn test_handshake_wipes_key_on_drop() {
        fn assert_zeroize_on_drop<T: ZeroizeOnDrop>() {}
        assert_zeroize_on_drop::<HandshakeMessage>();

        let mut message = HandshakeMessage {
            public_key: vec![1, 2, 3],
            symmetric_key: Some(vec![0x42; 32]),
        };
        message.zeroize();
        assert!(message.public_key.is_empty());
        assert_eq!(message.symmetric_key, None);
    }

    #[test]
    fn test_ack_payload_is_empty() {
        let packet = Message::Ack(AckMessage {}).to_packet().unwrap();
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn test_ack_with_payload_rejected() {
        let result = Message::decode_payload(PacketType::Ack, &[0x90]);
        assert!(matches!(result, Err(ProtocolError::Deserialization(_))));
    }

    #[test]
    fn test_payload_decoded_by_tag() {
        // An Init payload presented under the Content tag must not decode
        let init = Message::Init(InitMessage {
            size: 1,
            filename: "a".to_string(),
            checksum: String::new(),
            packet_count: 1,
            index: 0,
        });
        let payload = init.encode_payload().unwrap();
        let result = Message::decode_payload(PacketType::Content, &payload);
        assert!(matches!(result, Err(ProtocolError::Deserialization(_))));
    }

    #[test]
    fn test_malformed_payload_rejected() {
        let result = Message::decode_payload(PacketType::Handshake, &[0xc1, 0xff]);
        assert!(matches!(result, Err(ProtocolError::Deserialization(_))));
    }

    #[test]
    fn test_unicode_filename() {
        roundtrip(Message::Init(InitMessage {
            size: 0,
            filename: "résumé 日本.txt".to_string(),
            checksum: String::new(),
            packet_count: 1,
            index: 0,
        }));
    }

    #[test]
    fn test_content_overhead_is_small() {
        let msg = content(1024);
        let bytes = msg.to_bytes().unwrap();
        // header + msgpack array marker + bin32 header + str8 checksum
        assert!(bytes.len() < 1024 + 100);
    }
}
