//! Transfer session state machine.
//!
//! A [`TransferSession`] drives one file across one [`Transport`], as either
//! the [`Role::Sender`] or the [`Role::Receiver`]. The exchange is strictly
//! turn-taking:
//!
//! ```text
//! Sender                                   Receiver
//!   │── Handshake { public_key } ────────────▶│  plaintext
//!   │◀──────────── Handshake { symmetric_key }│  RSA-OAEP
//!   │── Init { size, filename, ... } ────────▶│  AES-GCM from here on
//!   │◀──────────────────────────────────── Ack│
//!   │── Content { chunk 1 } ─────────────────▶│
//!   │◀─────────────────────────── Ack | Replay│
//!   │   ...                                   │
//!   │── close ───────────────────────────────▶│  whole-file hash check
//! ```
//!
//! Each public step checks that it is called from the right state. Any error
//! moves the session to [`SessionState::Failed`] and releases its file and
//! key material.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::chunk::{
    chunk_checksum, hash_file, packet_count, validate_stride, ChunkJoiner, ChunkSplitter,
    Progress, ProgressObserver, DEFAULT_FLUSH_THRESHOLD, DEFAULT_STRIDE,
};
use crate::crypto::{CryptoContext, DEFAULT_KEY_BITS, MAX_KEY_BITS, MIN_KEY_BITS};
use crate::error::{ProtocolError, Result};
use crate::messages::{AckMessage, HandshakeMessage, InitMessage, Message, SyncMessage};
use crate::packet::{Packet, PacketType};
use crate::transport::Transport;

/// Default number of consecutive replays allowed for a single chunk.
pub const DEFAULT_MAX_REPLAYS: u32 = 8;

/// Which end of the transfer a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Reads a local file and streams it out.
    Sender,
    /// Accepts a stream and writes it under an output directory.
    Receiver,
}

/// Lifecycle of a transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Nothing exchanged yet.
    New,
    /// Sender: public key sent, waiting for the session key.
    HandshakeSent,
    /// Receiver: sender's public key received.
    HandshakeReceived,
    /// Both sides hold the session key.
    KeyEstablished,
    /// Metadata announced and acknowledged.
    InitExchanged,
    /// Content is flowing.
    Transferring,
    /// The transfer finished successfully.
    Complete,
    /// The transfer was aborted. Terminal.
    Failed,
}

impl SessionState {
    /// Returns whether no further step can be taken.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Complete | SessionState::Failed)
    }
}

/// Tunables of a transfer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Content bytes per chunk.
    pub stride: usize,
    /// RSA modulus size for the handshake keypair.
    pub key_bits: usize,
    /// Unflushed bytes that trigger a durable flush on the receiver.
    pub flush_threshold: u64,
    /// Upper bound on every sender wait for a peer response.
    pub ack_timeout: Option<Duration>,
    /// Whether the receiver re-checks each chunk's checksum.
    pub verify_chunks: bool,
    /// Consecutive replays tolerated for a single chunk.
    pub max_replays: u32,
    /// Whether the receiver may replace an existing destination file.
    pub overwrite: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stride: DEFAULT_STRIDE,
            key_bits: DEFAULT_KEY_BITS,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
            ack_timeout: None,
            verify_chunks: true,
            max_replays: DEFAULT_MAX_REPLAYS,
            overwrite: false,
        }
    }
}

impl SessionConfig {
    /// Checks that every tunable is within its accepted range.
    pub fn validate(&self) -> Result<()> {
        validate_stride(self.stride)?;
        if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&self.key_bits) {
            return Err(ProtocolError::KeyGeneration(format!(
                "key size must be between {} and {} bits, got {}",
                MIN_KEY_BITS, MAX_KEY_BITS, self.key_bits
            )));
        }
        if self.ack_timeout == Some(Duration::ZERO) {
            return Err(ProtocolError::InvalidState(
                "ack timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Outcome of a completed session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    /// Role the session played.
    pub role: Role,
    /// Base name announced in `Init`.
    pub filename: String,
    /// Local source (sender) or destination (receiver).
    pub path: PathBuf,
    /// Content bytes moved.
    pub bytes: u64,
    /// Number of content packets.
    pub packet_count: u64,
    /// Hex SHA-256 of the whole file.
    pub checksum: String,
    /// Replays served (sender) or requested (receiver).
    pub replays: u64,
    /// Whether this side re-hashed the file after the transfer.
    pub verified: bool,
}

/// One side of a file transfer.
pub struct TransferSession {
    role: Role,
    state: SessionState,
    config: SessionConfig,

    /// Sender: the source file. Receiver: the output directory until `Init`
    /// arrives, then the destination file.
    path: PathBuf,
    source: Option<File>,
    joiner: Option<ChunkJoiner>,
    created_destination: bool,

    local: Option<CryptoContext>,
    peer: Option<CryptoContext>,

    size: u64,
    filename: String,
    checksum: String,
    packet_count: u64,
    index: u64,
    bytes_transferred: u64,
    replays: u64,

    /// Wire bytes of the last content packet, kept for replays.
    last_sent: Option<Vec<u8>>,
}

impl TransferSession {
    /// Prepares a sender for the file at `path`.
    ///
    /// The file is opened and hashed immediately, so a missing or unreadable
    /// source fails before any network traffic.
    pub fn sender(path: impl AsRef<Path>, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();

        let mut file = File::open(&path)?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(ProtocolError::InvalidMetadata(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| {
                ProtocolError::InvalidMetadata(format!(
                    "{} has no usable file name",
                    path.display()
                ))
            })?
            .to_string();
        validate_filename(&filename)?;

        let size = metadata.len();
        let checksum = hash_file(&mut file)?;
        let packet_count = packet_count(size, config.stride);

        debug!(
            path = %path.display(),
            size,
            packet_count,
            checksum = %checksum,
            "Prepared sender session"
        );

        Ok(Self {
            size,
            filename,
            checksum,
            packet_count,
            source: Some(file),
            ..Self::blank(Role::Sender, path, config)
        })
    }

    /// [`TransferSession::sender`] run on the blocking pool.
    ///
    /// Hashing a large source takes a while; async callers use this so the
    /// runtime keeps serving other tasks meanwhile.
    pub async fn prepare_sender(path: impl AsRef<Path>, config: SessionConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        offload(move || Self::sender(path, config)).await
    }

    /// Prepares a receiver writing into `output_dir`.
    ///
    /// Nothing is touched on disk until the sender's `Init` is accepted.
    pub fn receiver(output_dir: impl AsRef<Path>, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::blank(
            Role::Receiver,
            output_dir.as_ref().to_path_buf(),
            config,
        ))
    }

    fn blank(role: Role, path: PathBuf, config: SessionConfig) -> Self {
        Self {
            role,
            state: SessionState::New,
            config,
            path,
            source: None,
            joiner: None,
            created_destination: false,
            local: None,
            peer: None,
            size: 0,
            filename: String::new(),
            checksum: String::new(),
            packet_count: 0,
            index: 0,
            bytes_transferred: 0,
            replays: 0,
            last_sent: None,
        }
    }

    /// Returns the session's role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Source file (sender), output directory or destination (receiver).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File size in bytes, known to the receiver after `Init`.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Base file name, known to the receiver after `Init`.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Declared whole-file checksum.
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    /// Number of content packets in the transfer.
    pub fn packet_count(&self) -> u64 {
        self.packet_count
    }

    /// Number of chunks sent (sender) or accepted (receiver).
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Content bytes moved so far.
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    /// Replays served (sender) or requested (receiver).
    pub fn replays(&self) -> u64 {
        self.replays
    }

    /// Hex fingerprint of the session key, once established.
    pub fn key_fingerprint(&self) -> Option<String> {
        self.local
            .as_ref()
            .and_then(CryptoContext::symmetric_key_fingerprint)
    }

    /// Runs every step for this session's role and returns the report.
    ///
    /// The sender closes the transport cleanly once all content is
    /// acknowledged; the receiver returns after the peer's clean shutdown
    /// and a successful integrity check.
    pub async fn run<T>(
        &mut self,
        transport: &mut T,
        progress: &mut dyn ProgressObserver,
    ) -> Result<TransferReport>
    where
        T: Transport + ?Sized,
    {
        self.handshake(transport).await?;
        self.exchange_init(transport).await?;
        self.transfer(transport, progress).await?;

        if self.role == Role::Sender {
            if let Err(e) = transport.close().await {
                return Err(self.fail(e));
            }
        }

        self.finalize().await
    }

    /// Establishes the session key.
    pub async fn handshake<T>(&mut self, transport: &mut T) -> Result<()>
    where
        T: Transport + ?Sized,
    {
        let result = match self.role {
            Role::Sender => self.sender_handshake(transport).await,
            Role::Receiver => self.receiver_handshake(transport).await,
        };
        result.map_err(|e| self.fail(e))
    }

    /// Announces (sender) or accepts (receiver) the transfer metadata.
    pub async fn exchange_init<T>(&mut self, transport: &mut T) -> Result<()>
    where
        T: Transport + ?Sized,
    {
        let result = match self.role {
            Role::Sender => self.sender_init(transport).await,
            Role::Receiver => self.receiver_init(transport).await,
        };
        result.map_err(|e| self.fail(e))
    }

    /// Moves the file content.
    ///
    /// For the sender this ends with the session `Complete`. For the
    /// receiver it ends at the peer's clean shutdown, and [`finalize`]
    /// must follow.
    ///
    /// [`finalize`]: TransferSession::finalize
    pub async fn transfer<T>(
        &mut self,
        transport: &mut T,
        progress: &mut dyn ProgressObserver,
    ) -> Result<()>
    where
        T: Transport + ?Sized,
    {
        let result = match self.role {
            Role::Sender => self.send_content(transport, progress).await,
            Role::Receiver => self.receive_content(transport, progress).await,
        };
        result.map_err(|e| self.fail(e))
    }

    /// Completes the session and builds its report.
    ///
    /// The receiver flushes the destination, re-hashes it from the start and
    /// compares the result with the checksum announced in `Init`.
    pub async fn finalize(&mut self) -> Result<TransferReport> {
        let result = match self.role {
            Role::Sender => self.finalize_sender(),
            Role::Receiver => self.finalize_receiver().await,
        };
        result.map_err(|e| self.fail(e))
    }

    // Sender steps

    async fn sender_handshake<T>(&mut self, transport: &mut T) -> Result<()>
    where
        T: Transport + ?Sized,
    {
        self.expect_state(SessionState::New, "handshake")?;

        let bits = self.config.key_bits;
        let local = offload(move || CryptoContext::generate(bits)).await?;
        let request = Message::Handshake(HandshakeMessage {
            public_key: local.public_key_der()?,
            symmetric_key: None,
        });
        self.local = Some(local);

        transport.send(&request.to_bytes()?).await?;
        self.state = SessionState::HandshakeSent;
        debug!(key_bits = self.config.key_bits, "Sent handshake");

        let response = self.recv_required(transport, PacketType::Handshake).await?;
        let local = self.local_mut()?;
        let plaintext = Zeroizing::new(local.force_asymmetric_decrypt(&response)?);
        let packet = Packet::decode(&plaintext)?;

        let mut handshake = match decode_expected(&packet, PacketType::Handshake)? {
            Message::Handshake(msg) => msg,
            other => return Err(unexpected(PacketType::Handshake, other.packet_type())),
        };
        let key = handshake
            .symmetric_key
            .take()
            .filter(|key| !key.is_empty())
            .map(Zeroizing::new)
            .ok_or_else(|| {
                ProtocolError::HandshakeFailed("response carried no session key".to_string())
            })?;
        local.set_symmetric_key(&key)?;

        self.state = SessionState::KeyEstablished;
        debug!(
            fingerprint = self.key_fingerprint().as_deref().unwrap_or_default(),
            "Session key established"
        );
        Ok(())
    }

    async fn sender_init<T>(&mut self, transport: &mut T) -> Result<()>
    where
        T: Transport + ?Sized,
    {
        self.expect_state(SessionState::KeyEstablished, "exchange_init")?;

        let init = Message::Init(InitMessage {
            size: self.size,
            filename: self.filename.clone(),
            checksum: self.checksum.clone(),
            packet_count: self.packet_count,
            index: self.index,
        });
        let sealed = self.seal(&init)?;
        transport.send(&sealed).await?;

        let reply = self.recv_required(transport, PacketType::Ack).await?;
        let packet = self.open(&reply)?;
        decode_expected(&packet, PacketType::Ack)?;

        self.state = SessionState::InitExchanged;
        info!(
            filename = %self.filename,
            size = self.size,
            packets = self.packet_count,
            "Transfer accepted by peer"
        );
        Ok(())
    }

    async fn send_content<T>(
        &mut self,
        transport: &mut T,
        progress: &mut dyn ProgressObserver,
    ) -> Result<()>
    where
        T: Transport + ?Sized,
    {
        self.expect_state(SessionState::InitExchanged, "transfer")?;
        let source = self.source.take().ok_or_else(|| {
            ProtocolError::InvalidState("source file already consumed".to_string())
        })?;
        self.state = SessionState::Transferring;

        for chunk in ChunkSplitter::new(source, self.config.stride) {
            let chunk = chunk?;
            if self.index >= self.packet_count {
                return Err(ProtocolError::InvalidMetadata(format!(
                    "source grew beyond the {} announced chunks",
                    self.packet_count
                )));
            }

            self.index += 1;
            let length = chunk.content.len() as u64;
            let wire = self.seal(&Message::Content(chunk))?;
            let wire = self.last_sent.insert(wire);
            transport.send(wire).await?;

            self.bytes_transferred += length;
            progress.on_chunk(Progress {
                bytes_sent: self.bytes_transferred,
                total_bytes: self.size,
                index: self.index,
                packet_count: self.packet_count,
            });

            self.await_ack(transport).await?;
        }

        if self.index != self.packet_count || self.bytes_transferred != self.size {
            return Err(ProtocolError::InvalidMetadata(format!(
                "source changed during transfer: sent {} bytes in {} chunks, announced {} bytes in {}",
                self.bytes_transferred, self.index, self.size, self.packet_count
            )));
        }

        self.last_sent = None;
        self.state = SessionState::Complete;
        info!(
            filename = %self.filename,
            bytes = self.bytes_transferred,
            replays = self.replays,
            "All chunks acknowledged"
        );
        Ok(())
    }

    /// Waits for the chunk just sent to be acknowledged, serving replays.
    async fn await_ack<T>(&mut self, transport: &mut T) -> Result<()>
    where
        T: Transport + ?Sized,
    {
        let mut attempts: u32 = 0;
        loop {
            let reply = self.recv_required(transport, PacketType::Ack).await?;
            let packet = self.open(&reply)?;

            match packet.packet_type {
                PacketType::Ack => {
                    decode_expected(&packet, PacketType::Ack)?;
                    return Ok(());
                }
                PacketType::Replay => {
                    let request = match Message::from_packet(&packet)? {
                        Message::Replay(request) => request,
                        other => return Err(unexpected(PacketType::Ack, other.packet_type())),
                    };
                    if attempts >= self.config.max_replays {
                        return Err(ProtocolError::ReplayLimitExceeded {
                            index: self.index,
                            attempts,
                        });
                    }
                    attempts += 1;

                    warn!(
                        index = self.index,
                        requested = request.index,
                        peer_checksum = %request.checksum,
                        attempt = attempts,
                        "Peer requested replay"
                    );
                    let wire = self.last_sent.as_deref().ok_or_else(|| {
                        ProtocolError::InvalidState("nothing to replay".to_string())
                    })?;
                    transport.send(wire).await?;
                    self.replays += 1;
                }
                other => return Err(unexpected(PacketType::Ack, other)),
            }
        }
    }

    fn finalize_sender(&mut self) -> Result<TransferReport> {
        self.expect_state(SessionState::Complete, "finalize")?;
        Ok(self.report(false))
    }

    // Receiver steps

    async fn receiver_handshake<T>(&mut self, transport: &mut T) -> Result<()>
    where
        T: Transport + ?Sized,
    {
        self.expect_state(SessionState::New, "handshake")?;

        let request = self.recv_required(transport, PacketType::Handshake).await?;
        let packet_type = Packet::peek_type(&request)?;
        if packet_type != PacketType::Handshake {
            return Err(unexpected(PacketType::Handshake, packet_type));
        }
        let handshake = match Message::from_bytes(&request)? {
            Message::Handshake(msg) => msg,
            other => return Err(unexpected(PacketType::Handshake, other.packet_type())),
        };
        self.state = SessionState::HandshakeReceived;

        let peer = CryptoContext::import_public_key(&handshake.public_key)?;
        let bits = self.config.key_bits;
        let mut local = offload(move || CryptoContext::generate(bits)).await?;
        let key = Zeroizing::new(local.generate_symmetric_key()?);

        let response = Zeroizing::new(
            Message::Handshake(HandshakeMessage {
                public_key: Vec::new(),
                symmetric_key: Some(key.to_vec()),
            })
            .to_bytes()?,
        );
        let sealed = peer.force_asymmetric_encrypt(&response)?;

        self.local = Some(local);
        self.peer = Some(peer);
        transport.send(&sealed).await?;

        self.state = SessionState::KeyEstablished;
        debug!(
            peer_key_bits = self.peer.as_ref().map(CryptoContext::key_bits),
            fingerprint = self.key_fingerprint().as_deref().unwrap_or_default(),
            "Session key delivered"
        );
        Ok(())
    }

    async fn receiver_init<T>(&mut self, transport: &mut T) -> Result<()>
    where
        T: Transport + ?Sized,
    {
        self.expect_state(SessionState::KeyEstablished, "exchange_init")?;

        let data = self.recv_required(transport, PacketType::Init).await?;
        let packet = self.open(&data)?;
        let init = match decode_expected(&packet, PacketType::Init)? {
            Message::Init(init) => init,
            other => return Err(unexpected(PacketType::Init, other.packet_type())),
        };
        validate_init(&init)?;

        let destination = self.path.join(&init.filename);
        let file = self.create_destination(&destination)?;
        self.created_destination = true;
        self.path = destination;
        self.joiner = Some(ChunkJoiner::new(file, self.config.flush_threshold));

        self.size = init.size;
        self.filename = init.filename;
        self.checksum = init.checksum.to_ascii_lowercase();
        self.packet_count = init.packet_count;
        self.index = init.index;

        let ack = self.seal(&Message::Ack(AckMessage {}))?;
        transport.send(&ack).await?;

        self.state = SessionState::InitExchanged;
        info!(
            filename = %self.filename,
            size = self.size,
            packets = self.packet_count,
            destination = %self.path.display(),
            "Accepted incoming transfer"
        );
        Ok(())
    }

    async fn receive_content<T>(
        &mut self,
        transport: &mut T,
        progress: &mut dyn ProgressObserver,
    ) -> Result<()>
    where
        T: Transport + ?Sized,
    {
        self.expect_state(SessionState::InitExchanged, "transfer")?;
        self.state = SessionState::Transferring;

        let mut rejected: u32 = 0;
        while let Some(data) = self.recv_optional(transport, PacketType::Content).await? {
            let packet = self.open(&data)?;
            let chunk = match decode_expected(&packet, PacketType::Content)? {
                Message::Content(chunk) => chunk,
                other => return Err(unexpected(PacketType::Content, other.packet_type())),
            };

            if self.index >= self.packet_count {
                return Err(ProtocolError::InvalidMetadata(format!(
                    "received more than the {} announced chunks",
                    self.packet_count
                )));
            }
            let chunk_index = self.index + 1;

            if self.config.verify_chunks {
                let actual = chunk_checksum(&chunk.content);
                if !actual.eq_ignore_ascii_case(&chunk.checksum) {
                    if rejected >= self.config.max_replays {
                        return Err(ProtocolError::ReplayLimitExceeded {
                            index: chunk_index,
                            attempts: rejected,
                        });
                    }
                    rejected += 1;
                    self.replays += 1;

                    warn!(
                        index = chunk_index,
                        expected = %chunk.checksum,
                        actual = %actual,
                        attempt = rejected,
                        "Chunk checksum mismatch, requesting replay"
                    );
                    let replay = self.seal(&Message::Replay(SyncMessage {
                        index: chunk_index,
                        checksum: actual,
                    }))?;
                    transport.send(&replay).await?;
                    continue;
                }
            }

            let joiner = self.joiner.as_mut().ok_or_else(|| {
                ProtocolError::InvalidState("destination is not open".to_string())
            })?;
            joiner.append(&chunk.content)?;
            rejected = 0;
            self.index = chunk_index;
            self.bytes_transferred += chunk.content.len() as u64;

            let ack = self.seal(&Message::Ack(AckMessage {}))?;
            transport.send(&ack).await?;

            progress.on_chunk(Progress {
                bytes_sent: self.bytes_transferred,
                total_bytes: self.size,
                index: self.index,
                packet_count: self.packet_count,
            });
        }

        if self.index < self.packet_count {
            return Err(ProtocolError::ConnectionClosed(format!(
                "peer finished after {} of {} chunks",
                self.index, self.packet_count
            )));
        }

        debug!(
            chunks = self.index,
            bytes = self.bytes_transferred,
            "Peer closed the transfer"
        );
        Ok(())
    }

    async fn finalize_receiver(&mut self) -> Result<TransferReport> {
        self.expect_state(SessionState::Transferring, "finalize")?;

        let mut joiner = self.joiner.take().ok_or_else(|| {
            ProtocolError::InvalidState("destination is not open".to_string())
        })?;
        let expected = self.checksum.clone();
        let (flushes, written, verified) = offload(move || {
            let verified = joiner.verify(&expected);
            Ok((joiner.flush_count(), joiner.bytes_written(), verified))
        })
        .await?;
        let checksum = verified?;

        self.state = SessionState::Complete;
        self.local = None;
        self.peer = None;
        info!(
            filename = %self.filename,
            bytes = written,
            checksum = %checksum,
            flushes,
            "Transfer verified"
        );
        Ok(self.report(true))
    }

    fn create_destination(&self, destination: &Path) -> Result<File> {
        fs::create_dir_all(&self.path)?;

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if self.config.overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }

        options.open(destination).map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                ProtocolError::Io(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} already exists", destination.display()),
                ))
            } else {
                ProtocolError::Io(e)
            }
        })
    }

    // Shared helpers

    fn expect_state(&self, expected: SessionState, step: &str) -> Result<()> {
        if self.state != expected {
            return Err(ProtocolError::InvalidState(format!(
                "{} requires state {:?}, session is {:?}",
                step, expected, self.state
            )));
        }
        Ok(())
    }

    fn local_mut(&mut self) -> Result<&mut CryptoContext> {
        self.local
            .as_mut()
            .ok_or_else(|| ProtocolError::InvalidState("no key material".to_string()))
    }

    fn cipher(&self) -> Result<&CryptoContext> {
        self.local
            .as_ref()
            .filter(|ctx| ctx.has_symmetric_key())
            .ok_or_else(|| ProtocolError::InvalidState("session key not established".to_string()))
    }

    /// Encodes and encrypts a message with the session key.
    fn seal(&self, message: &Message) -> Result<Vec<u8>> {
        let plaintext = message.to_bytes()?;
        self.cipher()?.encrypt(&plaintext)
    }

    /// Decrypts wire bytes with the session key and decodes the envelope.
    fn open(&self, data: &[u8]) -> Result<Packet> {
        let plaintext = self.cipher()?.decrypt(data)?;
        Packet::decode(&plaintext)
    }

    /// Sender waits are bounded by the configured ack timeout.
    fn response_timeout(&self) -> Option<Duration> {
        match self.role {
            Role::Sender => self.config.ack_timeout,
            Role::Receiver => None,
        }
    }

    async fn recv_optional<T>(
        &self,
        transport: &mut T,
        waiting_for: PacketType,
    ) -> Result<Option<Vec<u8>>>
    where
        T: Transport + ?Sized,
    {
        match self.response_timeout() {
            Some(limit) => tokio::time::timeout(limit, transport.recv())
                .await
                .map_err(|_| {
                    ProtocolError::Timeout(format!(
                        "no response within {:?} while waiting for {}",
                        limit, waiting_for
                    ))
                })?,
            None => transport.recv().await,
        }
    }

    async fn recv_required<T>(&self, transport: &mut T, waiting_for: PacketType) -> Result<Vec<u8>>
    where
        T: Transport + ?Sized,
    {
        self.recv_optional(transport, waiting_for)
            .await?
            .ok_or_else(|| {
                ProtocolError::ConnectionClosed(format!(
                    "peer closed the connection while waiting for {}",
                    waiting_for
                ))
            })
    }

    fn report(&self, verified: bool) -> TransferReport {
        TransferReport {
            role: self.role,
            filename: self.filename.clone(),
            path: self.path.clone(),
            bytes: self.bytes_transferred,
            packet_count: self.packet_count,
            checksum: self.checksum.clone(),
            replays: self.replays,
            verified,
        }
    }

    /// Moves the session to `Failed` and releases everything it holds.
    fn fail(&mut self, err: ProtocolError) -> ProtocolError {
        warn!(
            role = ?self.role,
            state = ?self.state,
            index = self.index,
            error = %err,
            "Transfer session failed"
        );

        self.state = SessionState::Failed;
        self.source = None;
        self.joiner = None;
        self.local = None;
        self.peer = None;
        self.last_sent = None;

        if self.created_destination {
            self.created_destination = false;
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "Failed to remove partial file");
            }
        }

        err
    }
}

impl std::fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferSession")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("path", &self.path)
            .field("filename", &self.filename)
            .field("size", &self.size)
            .field("index", &self.index)
            .field("packet_count", &self.packet_count)
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

/// Runs key generation and whole-file hashing on the blocking pool.
async fn offload<F, T>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ProtocolError::Io(io::Error::other(e)))?
}

fn unexpected(expected: PacketType, got: PacketType) -> ProtocolError {
    ProtocolError::UnexpectedPacket { expected, got }
}

/// Checks the packet type before decoding its payload.
fn decode_expected(packet: &Packet, expected: PacketType) -> Result<Message> {
    if packet.packet_type != expected {
        return Err(unexpected(expected, packet.packet_type));
    }
    Message::from_packet(packet)
}

/// Accepts only a bare file name: no separators, no parent references.
fn validate_filename(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
        || Path::new(name).file_name().and_then(|n| n.to_str()) != Some(name);

    if invalid {
        return Err(ProtocolError::InvalidMetadata(format!(
            "unacceptable file name: {:?}",
            name
        )));
    }
    Ok(())
}

fn validate_init(init: &InitMessage) -> Result<()> {
    validate_filename(&init.filename)?;

    if init.packet_count == 0 {
        return Err(ProtocolError::InvalidMetadata(
            "packet count must be at least 1".to_string(),
        ));
    }
    if init.index != 0 {
        return Err(ProtocolError::InvalidMetadata(format!(
            "transfers start at chunk 0, got start index {}",
            init.index
        )));
    }
    if init.size > 0 && init.packet_count > init.size {
        return Err(ProtocolError::InvalidMetadata(format!(
            "{} packets cannot carry {} bytes",
            init.packet_count, init.size
        )));
    }
    if init.checksum.len() != 64 || !init.checksum.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ProtocolError::InvalidMetadata(format!(
            "checksum is not a hex SHA-256 digest: {:?}",
            init.checksum
        )));
    }
    Ok(())
}
