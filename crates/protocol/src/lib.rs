//! # WScp Protocol Library
//!
//! This crate provides the wire protocol, cryptography and transfer state
//! machine for WScp, a point-to-point secure file copy over WebSockets.
//!
//! ## Overview
//!
//! - **Wire Codec**: typed packets with a small binary envelope and
//!   MessagePack payloads
//! - **Hybrid Crypto**: RSA-OAEP (SHA-512) handshake delivering an
//!   AES-256-GCM session key
//! - **Chunk Pipeline**: lazy fixed-stride splitting, durable rejoining and
//!   whole-file SHA-256 verification
//! - **Transfer Session**: sender and receiver state machines with
//!   acknowledgment and replay recovery
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           Transfer Session              │  Handshake → Init → Content
//! ├─────────────────────────────────────────┤
//! │        Messages (MessagePack)           │  Init, Ack, Replay, Content
//! ├─────────────────────────────────────────┤
//! │     RSA-OAEP handshake / AES-GCM        │  nonce-prefixed ciphertext
//! ├─────────────────────────────────────────┤
//! │          Packet envelope                │  magic, type tag, length
//! ├─────────────────────────────────────────┤
//! │        Transport (WebSocket)            │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use protocol::{MemoryTransport, NoProgress, SessionConfig, TransferSession};
//!
//! # async fn demo() -> protocol::Result<()> {
//! let (mut near, mut far) = MemoryTransport::pair();
//!
//! let mut sender = TransferSession::sender("report.pdf", SessionConfig::default())?;
//! let mut receiver = TransferSession::receiver("received", SessionConfig::default())?;
//!
//! let (mut sender_progress, mut receiver_progress) = (NoProgress, NoProgress);
//! let (sent, received) = tokio::join!(
//!     sender.run(&mut near, &mut sender_progress),
//!     receiver.run(&mut far, &mut receiver_progress),
//! );
//! assert_eq!(sent?.checksum, received?.checksum);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`packet`]: Packet envelope and type tags
//! - [`messages`]: Payload schemas
//! - [`crypto`]: Hybrid RSA / AES-GCM encryption
//! - [`chunk`]: Chunk splitting, rejoining and hashing
//! - [`session`]: Transfer state machine
//! - [`transport`]: Transport trait and in-memory implementation
//! - [`error`]: Error types

pub mod chunk;
pub mod crypto;
pub mod error;
pub mod messages;
pub mod packet;
pub mod session;
pub mod transport;

pub use chunk::{
    chunk_checksum, hash_file, hash_reader, packet_count, ChunkJoiner, ChunkSplitter,
    NoProgress, Progress, ProgressObserver, DEFAULT_FLUSH_THRESHOLD, DEFAULT_STRIDE, MAX_STRIDE,
};
pub use crypto::{CryptoContext, DEFAULT_KEY_BITS, MIN_KEY_BITS, SYMMETRIC_KEY_SIZE};
pub use error::{ErrorKind, ProtocolError, Result};
pub use messages::{
    AckMessage, ContentMessage, HandshakeMessage, InitMessage, Message, ReplayMessage,
    SyncMessage,
};
pub use packet::{Packet, PacketType, MAX_PACKET_SIZE, PACKET_HEADER_SIZE, PACKET_MAGIC};
pub use session::{
    Role, SessionConfig, SessionState, TransferReport, TransferSession, DEFAULT_MAX_REPLAYS,
};
pub use transport::{MemoryTransport, Transport, TransportFuture};
