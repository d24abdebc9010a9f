//! Error types for the protocol crate.

use thiserror::Error;

use crate::packet::PacketType;

/// Protocol error type covering all possible failure modes of a transfer.
///
/// Every variant is fatal to the session that produced it. Use
/// [`ProtocolError::kind`] to classify an error without matching on
/// individual variants.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Codec errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// The packet carries a type tag outside the protocol vocabulary.
    #[error("unknown packet type: {0:#04x}")]
    UnknownPacketType(u8),

    /// Packet exceeds the maximum allowed size.
    #[error("packet too large: {size} bytes exceeds maximum of {max} bytes")]
    PacketTooLarge {
        /// Actual packet size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    // Cryptographic errors
    /// Asymmetric key generation failed.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Invalid or malformed public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Invalid symmetric key, or a key was already installed.
    #[error("invalid symmetric key: {0}")]
    InvalidSymmetricKey(String),

    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption operation failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    // Protocol errors
    /// A message of the wrong type arrived for the current session state.
    #[error("unexpected {got} packet while waiting for {expected}")]
    UnexpectedPacket {
        /// The packet type the session was waiting for.
        expected: PacketType,
        /// The packet type that actually arrived.
        got: PacketType,
    },

    /// A session step was invoked from the wrong state.
    #[error("invalid session state: {0}")]
    InvalidState(String),

    /// The handshake completed without producing a usable session key.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The `Init` metadata announced by the sender is not acceptable.
    #[error("invalid transfer metadata: {0}")]
    InvalidMetadata(String),

    /// The peer kept requesting replays of the same chunk.
    #[error("replay limit exceeded for chunk {index} after {attempts} attempts")]
    ReplayLimitExceeded {
        /// Index of the chunk being replayed.
        index: u64,
        /// Number of replays already served.
        attempts: u32,
    },

    // Connection errors
    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    // File errors
    /// File read, write, seek or flush failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Integrity errors
    /// The reconstructed file does not hash to the declared checksum.
    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch {
        /// Checksum announced in the `Init` message.
        expected: String,
        /// Checksum of the bytes actually written.
        actual: String,
    },
}

/// Broad classification of a [`ProtocolError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed packet or message; the stream cannot be trusted past it.
    Codec,
    /// Key generation, cipher initialization, encryption or decryption.
    Crypto,
    /// Message of unexpected type, or misuse of the state machine.
    Protocol,
    /// Local file failure.
    Io,
    /// Transport closed abruptly or did not answer in time.
    Connection,
    /// Whole-file hash differs from the declared checksum.
    Integrity,
}

impl ProtocolError {
    /// Returns the broad category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::Serialization(_)
            | ProtocolError::Deserialization(_)
            | ProtocolError::UnknownPacketType(_)
            | ProtocolError::PacketTooLarge { .. } => ErrorKind::Codec,
            ProtocolError::KeyGeneration(_)
            | ProtocolError::InvalidPublicKey(_)
            | ProtocolError::InvalidSymmetricKey(_)
            | ProtocolError::Encryption(_)
            | ProtocolError::Decryption(_) => ErrorKind::Crypto,
            ProtocolError::UnexpectedPacket { .. }
            | ProtocolError::InvalidState(_)
            | ProtocolError::HandshakeFailed(_)
            | ProtocolError::InvalidMetadata(_)
            | ProtocolError::ReplayLimitExceeded { .. } => ErrorKind::Protocol,
            ProtocolError::ConnectionClosed(_) | ProtocolError::Timeout(_) => {
                ErrorKind::Connection
            }
            ProtocolError::Io(_) => ErrorKind::Io,
            ProtocolError::IntegrityMismatch { .. } => ErrorKind::Integrity,
        }
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}
