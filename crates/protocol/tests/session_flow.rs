//! End-to-end session tests over an in-memory transport.
//!
//! Full transfers pair two real sessions. Recovery and failure paths pair a
//! real session with a scripted peer that speaks the wire protocol by hand,
//! so the tests can inject replays, corrupt chunks and out-of-order packets.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use protocol::{
    chunk_checksum, AckMessage, ContentMessage, CryptoContext, ErrorKind, HandshakeMessage,
    InitMessage, MemoryTransport, Message, NoProgress, Progress, ProtocolError, Role,
    SessionConfig, MAX_STRIDE, SessionState, SyncMessage, TransferReport, TransferSession, Transport,
};

const KEY_BITS: usize = 2048;

fn config(stride: usize) -> SessionConfig {
    SessionConfig {
        stride,
        key_bits: KEY_BITS,
        ack_timeout: Some(Duration::from_secs(30)),
        ..SessionConfig::default()
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

/// Runs a session to completion, then drops its end of the transport.
async fn run_dropping<T: Transport>(
    mut session: TransferSession,
    mut transport: T,
) -> (TransferSession, protocol::Result<TransferReport>) {
    let result = session.run(&mut transport, &mut NoProgress).await;
    drop(transport);
    (session, result)
}

/// Transfers `data` between two real sessions and returns both reports and
/// the bytes that landed on disk.
async fn roundtrip(data: &[u8], stride: usize) -> (TransferReport, TransferReport, Vec<u8>) {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("payload.bin");
    fs::write(&source, data).unwrap();
    let out = dir.path().join("received");

    let (a, b) = MemoryTransport::pair();
    let sender = TransferSession::prepare_sender(&source, config(stride))
        .await
        .unwrap();
    let receiver = TransferSession::receiver(&out, config(stride)).unwrap();

    let ((sender, sent), (receiver, received)) =
        tokio::join!(run_dropping(sender, a), run_dropping(receiver, b));
    let sent = sent.unwrap();
    let received = received.unwrap();
    assert_eq!(sender.state(), SessionState::Complete);
    assert_eq!(receiver.state(), SessionState::Complete);

    let written = fs::read(&received.path).unwrap();
    (sent, received, written)
}

/// A peer driven step by step from the test body.
struct ScriptedPeer {
    transport: MemoryTransport,
    cipher: CryptoContext,
}

impl ScriptedPeer {
    /// Plays the receiver's handshake and reads the sender's `Init`.
    async fn accept(mut transport: MemoryTransport) -> (Self, InitMessage) {
        let request = transport.recv().await.unwrap().unwrap();
        let Message::Handshake(handshake) = Message::from_bytes(&request).unwrap() else {
            panic!("expected a plaintext handshake");
        };

        let mut cipher = CryptoContext::import_public_key(&handshake.public_key).unwrap();
        let key = cipher.generate_symmetric_key().unwrap();
        let response = Message::Handshake(HandshakeMessage {
            public_key: Vec::new(),
            symmetric_key: Some(key),
        })
        .to_bytes()
        .unwrap();
        transport
            .send(&cipher.force_asymmetric_encrypt(&response).unwrap())
            .await
            .unwrap();

        let mut peer = Self { transport, cipher };
        let init = match peer.recv().await {
            Message::Init(init) => init,
            other => panic!("expected Init, got {}", other.packet_type()),
        };
        (peer, init)
    }

    /// Plays the sender's handshake.
    async fn connect(mut transport: MemoryTransport) -> Self {
        let mut cipher = CryptoContext::generate(KEY_BITS).unwrap();
        let request = Message::Handshake(HandshakeMessage {
            public_key: cipher.public_key_der().unwrap(),
            symmetric_key: None,
        });
        transport.send(&request.to_bytes().unwrap()).await.unwrap();

        let response = transport.recv().await.unwrap().unwrap();
        let plaintext = cipher.force_asymmetric_decrypt(&response).unwrap();
        let Message::Handshake(mut handshake) = Message::from_bytes(&plaintext).unwrap() else {
            panic!("expected a handshake response");
        };
        assert!(handshake.public_key.is_empty());
        cipher
            .set_symmetric_key(&handshake.symmetric_key.take().unwrap())
            .unwrap();

        Self { transport, cipher }
    }

    async fn recv_wire(&mut self) -> protocol::Result<Option<Vec<u8>>> {
        self.transport.recv().await
    }

    fn open(&self, wire: &[u8]) -> Message {
        Message::from_bytes(&self.cipher.decrypt(wire).unwrap()).unwrap()
    }

    async fn recv(&mut self) -> Message {
        let wire = self
            .recv_wire()
            .await
            .unwrap()
            .expect("peer closed unexpectedly");
        self.open(&wire)
    }

    async fn send(&mut self, message: Message) -> protocol::Result<()> {
        let sealed = self.cipher.encrypt(&message.to_bytes().unwrap()).unwrap();
        self.transport.send(&sealed).await
    }

    async fn ack(&mut self) {
        self.send(Message::Ack(AckMessage {})).await.unwrap();
    }
}

fn content(bytes: &[u8]) -> Message {
    Message::Content(ContentMessage {
        content: bytes.to_vec(),
        checksum: chunk_checksum(bytes),
    })
}

fn write_source(dir: &Path, data: &[u8]) -> std::path::PathBuf {
    let path = dir.join("source.bin");
    fs::write(&path, data).unwrap();
    path
}

#[tokio::test]
async fn test_boundary_sizes_are_reconstructed() {
    let stride = 1024;
    for size in [0, 1, stride - 1, stride, stride + 1, 3 * stride, 5 * stride + 17] {
        let data = pattern(size);
        let (sent, received, written) = roundtrip(&data, stride).await;

        assert_eq!(written, data, "size {}", size);
        assert_eq!(sent.bytes, size as u64);
        assert_eq!(received.bytes, size as u64);
        assert_eq!(sent.packet_count, protocol::packet_count(size as u64, stride));
        assert_eq!(received.packet_count, sent.packet_count);
        assert_eq!(received.checksum, sent.checksum);
        assert!(received.verified);
        assert_eq!(received.replays, 0);
    }
}

#[tokio::test]
async fn test_largest_stride_is_reconstructed() {
    let data = pattern(MAX_STRIDE + 4096);
    let (sent, received, written) = roundtrip(&data, MAX_STRIDE).await;

    assert_eq!(sent.packet_count, 2);
    assert_eq!(received.bytes, data.len() as u64);
    assert!(received.verified);
    assert!(written == data);
}

#[tokio::test]
async fn test_key_generation_keeps_runtime_responsive() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_source(dir.path(), b"abc");
    let keyed = SessionConfig {
        key_bits: 4096,
        ..config(1024)
    };
    let mut sender = TransferSession::sender(&source, keyed.clone()).unwrap();
    let mut receiver = TransferSession::receiver(dir.path().join("out"), keyed).unwrap();
    let (mut a, mut b) = MemoryTransport::pair();

    // The test runtime has a single thread; a blocked worker shows up as a
    // late timer.
    let mut worst = Duration::ZERO;
    let ticker = async {
        loop {
            let start = Instant::now();
            tokio::time::sleep(Duration::from_millis(10)).await;
            worst = worst.max(start.elapsed());
        }
    };
    let handshakes = async {
        let (sent, received) = tokio::join!(sender.handshake(&mut a), receiver.handshake(&mut b));
        sent.unwrap();
        received.unwrap();
    };

    tokio::select! {
        () = handshakes => {}
        _ = ticker => unreachable!(),
    }
    assert_eq!(sender.state(), SessionState::KeyEstablished);
    assert!(
        worst < Duration::from_millis(500),
        "timer stalled for {:?}",
        worst
    );
}

#[tokio::test]
async fn test_receiver_rejects_nonzero_start_index() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = TransferSession::receiver(dir.path(), config(4)).unwrap();
    let (a, b) = MemoryTransport::pair();

    let script = async move {
        let mut peer = ScriptedPeer::connect(a).await;
        let _ = peer
            .send(Message::Init(InitMessage {
                size: 10,
                filename: "resume.bin".to_string(),
                checksum: chunk_checksum(&[0u8; 10]),
                packet_count: 3,
                index: 1,
            }))
            .await;
        let _ = peer.recv_wire().await;
    };

    let ((session, received), ()) = tokio::join!(run_dropping(receiver, b), script);
    assert!(matches!(
        received.unwrap_err(),
        ProtocolError::InvalidMetadata(_)
    ));
    assert_eq!(session.state(), SessionState::Failed);
    assert!(!dir.path().join("resume.bin").exists());
}

#[tokio::test]
async fn test_empty_file_sends_one_packet() {
    let (sent, received, written) = roundtrip(&[], 1024).await;
    assert!(written.is_empty());
    assert_eq!(sent.packet_count, 1);
    assert_eq!(received.packet_count, 1);
}

#[tokio::test]
async fn test_ten_bytes_in_three_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let data: Vec<u8> = (0u8..10).collect();
    let source = write_source(dir.path(), &data);
    let out = dir.path().join("out");

    let (mut a, b) = MemoryTransport::pair();
    let mut sender = TransferSession::sender(&source, config(4)).unwrap();
    let receiver = TransferSession::receiver(&out, config(4)).unwrap();

    let mut events = Vec::new();
    let mut observer = |p: Progress| events.push(p);

    let (sent, (_, received)) = tokio::join!(
        sender.run(&mut a, &mut observer),
        run_dropping(receiver, b)
    );
    let sent = sent.unwrap();
    let received = received.unwrap();

    assert_eq!(sent.packet_count, 3);
    assert_eq!(fs::read(&received.path).unwrap(), data);

    let progress: Vec<(u64, u64)> = events.iter().map(|p| (p.index, p.bytes_sent)).collect();
    assert_eq!(progress, vec![(1, 4), (2, 8), (3, 10)]);
    assert!(events.iter().all(|p| p.total_bytes == 10 && p.packet_count == 3));
}

#[tokio::test]
async fn test_sender_announces_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let data = pattern(2500);
    let source = write_source(dir.path(), &data);

    let (a, b) = MemoryTransport::pair();
    let sender = TransferSession::sender(&source, config(1000)).unwrap();

    let script = async move {
        let (mut peer, init) = ScriptedPeer::accept(b).await;
        assert_eq!(init.filename, "source.bin");
        assert_eq!(init.size, 2500);
        assert_eq!(init.packet_count, 3);
        assert_eq!(init.index, 0);
        assert_eq!(init.checksum, chunk_checksum(&data));
        peer.ack().await;

        let mut sizes = Vec::new();
        for _ in 0..3 {
            match peer.recv().await {
                Message::Content(chunk) => {
                    assert_eq!(chunk.checksum, chunk_checksum(&chunk.content));
                    sizes.push(chunk.content.len());
                }
                other => panic!("expected Content, got {}", other.packet_type()),
            }
            peer.ack().await;
        }
        assert!(peer.recv_wire().await.unwrap().is_none());
        sizes
    };

    let ((_, sent), sizes) = tokio::join!(run_dropping(sender, a), script);
    assert!(sent.is_ok());
    assert_eq!(sizes, vec![1000, 1000, 500]);
}

#[tokio::test]
async fn test_replay_resends_identical_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_source(dir.path(), &pattern(300));

    let (a, b) = MemoryTransport::pair();
    let sender = TransferSession::sender(&source, config(128)).unwrap();

    let script = async move {
        let (mut peer, init) = ScriptedPeer::accept(b).await;
        assert_eq!(init.packet_count, 3);
        peer.ack().await;

        let first = peer.recv_wire().await.unwrap().unwrap();
        for _ in 0..2 {
            peer.send(Message::Replay(SyncMessage {
                index: 1,
                checksum: "00".repeat(32),
            }))
            .await
            .unwrap();
            let again = peer.recv_wire().await.unwrap().unwrap();
            assert_eq!(again, first);
        }
        peer.ack().await;

        let second = peer.recv_wire().await.unwrap().unwrap();
        assert_ne!(second, first);
        peer.ack().await;
        peer.recv().await;
        peer.ack().await;

        assert!(peer.recv_wire().await.unwrap().is_none());
    };

    let ((session, sent), ()) = tokio::join!(run_dropping(sender, a), script);
    let sent = sent.unwrap();
    assert_eq!(sent.replays, 2);
    assert_eq!(sent.bytes, 300);
    assert_eq!(session.state(), SessionState::Complete);
}

#[tokio::test]
async fn test_replay_limit_fails_sender() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_source(dir.path(), &pattern(64));

    let (a, b) = MemoryTransport::pair();
    let sender = TransferSession::sender(
        &source,
        SessionConfig {
            max_replays: 2,
            ..config(64)
        },
    )
    .unwrap();

    let script = async move {
        let (mut peer, _) = ScriptedPeer::accept(b).await;
        peer.ack().await;
        let mut received = 0;
        while let Ok(Some(_)) = peer.recv_wire().await {
            received += 1;
            let replay = Message::Replay(SyncMessage {
                index: 1,
                checksum: String::new(),
            });
            if peer.send(replay).await.is_err() {
                break;
            }
        }
        received
    };

    let ((session, sent), received) = tokio::join!(run_dropping(sender, a), script);
    let err = sent.unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::ReplayLimitExceeded {
            index: 1,
            attempts: 2
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert_eq!(session.state(), SessionState::Failed);
    // The original send plus two replays
    assert_eq!(received, 3);
}

#[tokio::test]
async fn test_unexpected_response_fails_sender() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_source(dir.path(), b"some content");

    let (a, b) = MemoryTransport::pair();
    let sender = TransferSession::sender(&source, config(1024)).unwrap();

    let script = async move {
        let (mut peer, _) = ScriptedPeer::accept(b).await;
        // Answer Init with content instead of an acknowledgment
        let _ = peer.send(content(b"not an ack")).await;
        let _ = peer.recv_wire().await;
    };

    let ((session, sent), ()) = tokio::join!(run_dropping(sender, a), script);
    let err = sent.unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::UnexpectedPacket {
            expected: protocol::PacketType::Ack,
            got: protocol::PacketType::Content,
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert_eq!(session.state(), SessionState::Failed);
}

#[tokio::test]
async fn test_receiver_requests_replay_for_corrupt_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let receiver = TransferSession::receiver(&out, config(1024)).unwrap();
    let (a, b) = MemoryTransport::pair();

    let script = async move {
        let mut peer = ScriptedPeer::connect(a).await;
        peer.send(Message::Init(InitMessage {
            size: 5,
            filename: "hello.txt".to_string(),
            checksum: chunk_checksum(b"hello"),
            packet_count: 1,
            index: 0,
        }))
        .await
        .unwrap();
        assert!(matches!(peer.recv().await, Message::Ack(_)));

        peer.send(Message::Content(ContentMessage {
            content: b"hellx".to_vec(),
            checksum: chunk_checksum(b"hello"),
        }))
        .await
        .unwrap();
        match peer.recv().await {
            Message::Replay(replay) => {
                assert_eq!(replay.index, 1);
                assert_eq!(replay.checksum, chunk_checksum(b"hellx"));
            }
            other => panic!("expected Replay, got {}", other.packet_type()),
        }

        peer.send(content(b"hello")).await.unwrap();
        assert!(matches!(peer.recv().await, Message::Ack(_)));
        peer.transport.close().await.unwrap();
    };

    let ((session, received), ()) = tokio::join!(run_dropping(receiver, b), script);
    let received = received.unwrap();
    assert_eq!(received.role, Role::Receiver);
    assert_eq!(received.replays, 1);
    assert_eq!(session.state(), SessionState::Complete);
    assert_eq!(fs::read(out.join("hello.txt")).unwrap(), b"hello");
}

#[tokio::test]
async fn test_receiver_rejects_extra_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = TransferSession::receiver(dir.path(), config(1024)).unwrap();
    let (a, b) = MemoryTransport::pair();

    let script = async move {
        let mut peer = ScriptedPeer::connect(a).await;
        peer.send(Message::Init(InitMessage {
            size: 2,
            filename: "two.bin".to_string(),
            checksum: chunk_checksum(b"ab"),
            packet_count: 1,
            index: 0,
        }))
        .await
        .unwrap();
        peer.recv().await;

        peer.send(content(b"ab")).await.unwrap();
        peer.recv().await;
        let _ = peer.send(content(b"cd")).await;
        let _ = peer.recv_wire().await;
    };

    let ((session, received), ()) = tokio::join!(run_dropping(receiver, b), script);
    let err = received.unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidMetadata(_)));
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert_eq!(session.state(), SessionState::Failed);
    assert!(!dir.path().join("two.bin").exists());
}

#[tokio::test]
async fn test_receiver_rejects_path_traversal() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let receiver = TransferSession::receiver(&out, config(1024)).unwrap();
    let (a, b) = MemoryTransport::pair();

    let script = async move {
        let mut peer = ScriptedPeer::connect(a).await;
        let _ = peer
            .send(Message::Init(InitMessage {
                size: 1,
                filename: "../escape.txt".to_string(),
                checksum: chunk_checksum(b"x"),
                packet_count: 1,
                index: 0,
            }))
            .await;
        let _ = peer.recv_wire().await;
    };

    let ((_, received), ()) = tokio::join!(run_dropping(receiver, b), script);
    assert!(matches!(
        received.unwrap_err(),
        ProtocolError::InvalidMetadata(_)
    ));
    assert!(!dir.path().join("escape.txt").exists());
}

#[tokio::test]
async fn test_receiver_detects_early_close() {
    let dir = tempfile::tempdir().unwrap();
    let receiver = TransferSession::receiver(dir.path(), config(1024)).unwrap();
    let (a, b) = MemoryTransport::pair();

    let script = async move {
        let mut peer = ScriptedPeer::connect(a).await;
        peer.send(Message::Init(InitMessage {
            size: 4,
            filename: "short.bin".to_string(),
            checksum: chunk_checksum(b"abcd"),
            packet_count: 2,
            index: 0,
        }))
        .await
        .unwrap();
        peer.recv().await;
        peer.send(content(b"ab")).await.unwrap();
        peer.recv().await;
        peer.transport.close().await.unwrap();
    };

    let ((session, received), ()) = tokio::join!(run_dropping(receiver, b), script);
    let err = received.unwrap_err();
    assert!(matches!(err, ProtocolError::ConnectionClosed(_)));
    assert_eq!(session.state(), SessionState::Failed);
}

#[tokio::test]
async fn test_existing_destination_is_not_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_source(dir.path(), b"new contents");
    let out = dir.path().join("out");
    fs::create_dir_all(&out).unwrap();
    fs::write(out.join("source.bin"), b"precious").unwrap();

    let (a, b) = MemoryTransport::pair();
    let sender = TransferSession::sender(&source, config(1024)).unwrap();
    let receiver = TransferSession::receiver(&out, config(1024)).unwrap();

    let ((_, sent), (_, received)) =
        tokio::join!(run_dropping(sender, a), run_dropping(receiver, b));

    let err = received.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
    assert_eq!(sent.unwrap_err().kind(), ErrorKind::Connection);
    assert_eq!(fs::read(out.join("source.bin")).unwrap(), b"precious");
}

#[tokio::test]
async fn test_overwrite_replaces_destination() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_source(dir.path(), b"new contents");
    let out = dir.path().join("out");
    fs::create_dir_all(&out).unwrap();
    fs::write(out.join("source.bin"), b"stale and longer than the new file").unwrap();

    let (a, b) = MemoryTransport::pair();
    let sender = TransferSession::sender(&source, config(1024)).unwrap();
    let receiver = TransferSession::receiver(
        &out,
        SessionConfig {
            overwrite: true,
            ..config(1024)
        },
    )
    .unwrap();

    let ((_, sent), (_, received)) =
        tokio::join!(run_dropping(sender, a), run_dropping(receiver, b));
    sent.unwrap();
    received.unwrap();
    assert_eq!(fs::read(out.join("source.bin")).unwrap(), b"new contents");
}

#[tokio::test]
async fn test_corrupted_destination_fails_integrity_check() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_source(dir.path(), &pattern(4096));
    let out = dir.path().join("out");

    let (mut a, mut b) = MemoryTransport::pair();
    let mut sender = TransferSession::sender(&source, config(1000)).unwrap();
    let mut receiver = TransferSession::receiver(&out, config(1000)).unwrap();

    let sending = async {
        sender.handshake(&mut a).await?;
        sender.exchange_init(&mut a).await?;
        sender.transfer(&mut a, &mut NoProgress).await?;
        a.close().await
    };
    let receiving = async {
        receiver.handshake(&mut b).await?;
        receiver.exchange_init(&mut b).await?;
        receiver.transfer(&mut b, &mut NoProgress).await
    };
    let (sent, received) = tokio::join!(sending, receiving);
    sent.unwrap();
    received.unwrap();
    assert_eq!(receiver.state(), SessionState::Transferring);

    let destination = receiver.path().to_path_buf();
    let mut file = OpenOptions::new().write(true).open(&destination).unwrap();
    file.write_all(b"XXXX").unwrap();
    drop(file);

    let err = receiver.finalize().await.unwrap_err();
    assert!(matches!(err, ProtocolError::IntegrityMismatch { .. }));
    assert_eq!(err.kind(), ErrorKind::Integrity);
    assert_eq!(receiver.state(), SessionState::Failed);
    assert!(!destination.exists());
}

#[tokio::test]
async fn test_steps_out_of_order_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let source = write_source(dir.path(), b"abc");
    let (mut a, _b) = MemoryTransport::pair();
    let mut sender = TransferSession::sender(&source, config(1024)).unwrap();

    let err = sender.exchange_init(&mut a).await.unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidState(_)));
    assert_eq!(sender.state(), SessionState::Failed);

    let err = sender.handshake(&mut a).await.unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidState(_)));
}
