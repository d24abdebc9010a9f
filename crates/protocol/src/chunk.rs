//! Chunk pipeline: splitting a source into content chunks and rejoining them.
//!
//! The sender pulls [`ContentMessage`]s lazily from a [`ChunkSplitter`]; the
//! receiver appends each accepted chunk through a [`ChunkJoiner`], which
//! forces a durable flush every time enough unflushed bytes pile up and can
//! re-hash the whole destination for the final integrity check.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{ProtocolError, Result};
use crate::messages::ContentMessage;

/// Default chunk stride (256 KiB).
pub const DEFAULT_STRIDE: usize = 256 * 1024;

/// Largest accepted stride (8 MiB). An encrypted chunk of this size still
/// fits in a single packet and a single WebSocket frame.
pub const MAX_STRIDE: usize = 8 * 1024 * 1024;

/// Unflushed byte count that triggers a durable flush (75 MiB).
pub const DEFAULT_FLUSH_THRESHOLD: u64 = 75 * 1024 * 1024;

/// Checks that a stride is usable for splitting.
pub fn validate_stride(stride: usize) -> Result<()> {
    if stride == 0 || stride > MAX_STRIDE {
        return Err(ProtocolError::InvalidMetadata(format!(
            "stride must be between 1 and {} bytes, got {}",
            MAX_STRIDE, stride
        )));
    }
    Ok(())
}

/// Number of content packets needed for `size` bytes: the ceiling of
/// `size / stride`, and never less than one.
pub fn packet_count(size: u64, stride: usize) -> u64 {
    let stride = stride.max(1) as u64;
    size.div_ceil(stride).max(1)
}

/// Hex SHA-256 of a single chunk.
pub fn chunk_checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hex SHA-256 of everything remaining in `reader`.
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-256 of a whole seekable source, from offset 0.
///
/// The stream position is restored afterwards.
pub fn hash_file<F: Read + Seek>(file: &mut F) -> io::Result<String> {
    let position = file.stream_position()?;
    file.seek(SeekFrom::Start(0))?;
    let checksum = hash_reader(&mut *file);
    file.seek(SeekFrom::Start(position))?;
    checksum
}

/// Reads until `buf` is full or the source is exhausted.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Lazy, single-pass iterator over the chunks of a source.
///
/// Every chunk except the last holds exactly `stride` bytes. An empty source
/// yields exactly one empty chunk. After an I/O error the iterator is
/// exhausted.
pub struct ChunkSplitter<R> {
    reader: R,
    stride: usize,
    emitted: u64,
    done: bool,
}

impl<R: Read> ChunkSplitter<R> {
    /// Creates a splitter reading `stride`-sized chunks from `reader`.
    pub fn new(reader: R, stride: usize) -> Self {
        Self {
            reader,
            stride: stride.max(1),
            emitted: 0,
            done: false,
        }
    }
}

impl<R: Read> Iterator for ChunkSplitter<R> {
    type Item = io::Result<ContentMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut buffer = vec![0u8; self.stride];
        let filled = match read_full(&mut self.reader, &mut buffer) {
            Ok(n) => n,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };

        if filled < self.stride {
            self.done = true;
        }
        if filled == 0 && self.emitted > 0 {
            return None;
        }

        buffer.truncate(filled);
        self.emitted += 1;

        Some(Ok(ContentMessage {
            checksum: chunk_checksum(&buffer),
            content: buffer,
        }))
    }
}

impl<R> std::fmt::Debug for ChunkSplitter<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkSplitter")
            .field("stride", &self.stride)
            .field("emitted", &self.emitted)
            .field("done", &self.done)
            .finish()
    }
}

/// Sequential writer reassembling chunks into a destination file.
#[derive(Debug)]
pub struct ChunkJoiner {
    file: File,
    flush_threshold: u64,
    unflushed: u64,
    written: u64,
    flushes: u64,
}

impl ChunkJoiner {
    /// Wraps a destination opened for reading and writing.
    pub fn new(file: File, flush_threshold: u64) -> Self {
        Self {
            file,
            flush_threshold,
            unflushed: 0,
            written: 0,
            flushes: 0,
        }
    }

    /// Appends a chunk, syncing to disk once the unflushed byte count
    /// exceeds the threshold.
    pub fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes)?;
        self.written += bytes.len() as u64;
        self.unflushed += bytes.len() as u64;

        if self.unflushed > self.flush_threshold {
            debug!(
                unflushed = self.unflushed,
                written = self.written,
                "Flushing destination to disk"
            );
            self.flush()?;
        }
        Ok(())
    }

    /// Forces buffered data to durable storage.
    pub fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        self.unflushed = 0;
        self.flushes += 1;
        Ok(())
    }

    /// Total bytes appended.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Number of durable flushes performed.
    pub fn flush_count(&self) -> u64 {
        self.flushes
    }

    /// Flushes and returns the hex SHA-256 of the whole destination.
    pub fn checksum(&mut self) -> io::Result<String> {
        self.flush()?;
        hash_file(&mut self.file)
    }

    /// Flushes, re-hashes the destination and compares with `expected`.
    ///
    /// Returns the computed checksum on success.
    pub fn verify(&mut self, expected: &str) -> Result<String> {
        let actual = self.checksum()?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(ProtocolError::IntegrityMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(actual)
    }
}

/// Transfer progress, reported after every chunk handed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Content bytes sent so far.
    pub bytes_sent: u64,
    /// Size of the whole file.
    pub total_bytes: u64,
    /// One-based index of the chunk just sent.
    pub index: u64,
    /// Total number of chunks.
    pub packet_count: u64,
}

/// Receives progress notifications from a sending session.
pub trait ProgressObserver: Send {
    /// Called once per chunk, after it has been sent.
    fn on_chunk(&mut self, progress: Progress);
}

impl<F> ProgressObserver for F
where
    F: FnMut(Progress) + Send,
{
    fn on_chunk(&mut self, progress: Progress) {
        self(progress)
    }
}

/// Observer that discards all progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn on_chunk(&mut self, _progress: Progress) {}
}
