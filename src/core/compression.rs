//! Chunked compression transform
//!
//! Compressed parts are stored as a sequence of independent records, each
//! holding at most one chunk of the uncompressed stream:
//!
//! - Bytes 0-3: magic `4000` (u32 LE)
//! - Bytes 4-7: uncompressed size (u32 LE)
//! - Bytes 8-11: compressed size (u32 LE)
//! - Compressed payload
//!
//! **Design**:
//! - Every chunk is compressed on its own, so any record can be decoded without its predecessors
//! - Both size fields are bounded by [`MAX_CHUNK_FIELD`]; anything larger is corruption
//! - Deflate is the package format; LZ4 and Zstd use the same record layout

use crate::core::channel::Channel;
use crate::core::config::ChunkConfig;
use crate::core::error::{Result, StreamError};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::debug;

/// Record magic number
pub const CHUNK_MAGIC: u32 = 4000;

/// Encoded record header size
pub const CHUNK_HEADER_SIZE: usize = 12;

/// Uncompressed bytes per chunk
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Largest value either size field may hold
pub const MAX_CHUNK_FIELD: u32 = 0xFFFFF;

/// Codec applied to each chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMethod {
    /// Raw deflate
    #[default]
    Deflate,
    /// LZ4 block format (fast, moderate ratio)
    Lz4,
    /// Zstd (slower, better ratio)
    Zstd,
}

impl CompressionMethod {
    /// Compress one chunk
    pub fn compress_chunk(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            CompressionMethod::Deflate => {
                let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data)?;
                Ok(encoder.finish()?)
            }
            CompressionMethod::Lz4 => Ok(lz4_flex::compress(data)),
            CompressionMethod::Zstd => {
                zstd::bulk::compress(data, 3).map_err(|e| self.encoder_error(e))
            }
        }
    }

    fn encoder_error(&self, cause: impl std::fmt::Display) -> StreamError {
        StreamError::Compression(format!("{:?} encoder: {}", self, cause))
    }

    /// Decompress one chunk that must expand to exactly `expected` bytes
    pub fn decompress_chunk(&self, payload: &[u8], expected: usize) -> Result<Vec<u8>> {
        let data = match self {
            CompressionMethod::Deflate => {
                let mut out = Vec::with_capacity(expected);
                DeflateDecoder::new(payload)
                    .take(expected as u64 + 1)
                    .read_to_end(&mut out)
                    .map_err(|e| {
                        StreamError::Corrupt(format!("Deflate decompression failed: {}", e))
                    })?;
                out
            }
            CompressionMethod::Lz4 => lz4_flex::decompress(payload, expected)
                .map_err(|e| StreamError::Corrupt(format!("LZ4 decompression failed: {}", e)))?,
            CompressionMethod::Zstd => zstd::bulk::decompress(payload, expected)
                .map_err(|e| StreamError::Corrupt(format!("Zstd decompression failed: {}", e)))?,
        };

        if data.len() != expected {
            return Err(StreamError::Corrupt(format!(
                "chunk expanded to {} bytes, header declares {}",
                data.len(),
                expected
            )));
        }
        Ok(data)
    }
}

/// Header preceding every compressed chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub uncompressed_size: u32,
    pub compressed_size: u32,
}

impl ChunkHeader {
    pub fn to_bytes(&self) -> [u8; CHUNK_HEADER_SIZE] {
        let mut bytes = [0u8; CHUNK_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&CHUNK_MAGIC.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.uncompressed_size.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.compressed_size.to_le_bytes());
        bytes
    }

    /// Decode and validate against `max_size`
    pub fn from_bytes(bytes: &[u8], max_size: u32) -> Result<Self> {
        if bytes.len() < CHUNK_HEADER_SIZE {
            return Err(StreamError::Corrupt(format!(
                "chunk header needs {} bytes, got {}",
                CHUNK_HEADER_SIZE,
                bytes.len()
            )));
        }

        let field = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        let magic = field(0);
        if magic != CHUNK_MAGIC {
            return Err(StreamError::Corrupt(format!(
                "bad chunk magic {} (expected {})",
                magic, CHUNK_MAGIC
            )));
        }

        let header = ChunkHeader {
            uncompressed_size: field(4),
            compressed_size: field(8),
        };
        if header.uncompressed_size > max_size || header.compressed_size > max_size {
            return Err(StreamError::Corrupt(format!(
                "chunk sizes {}/{} exceed limit {}",
                header.uncompressed_size, header.compressed_size, max_size
            )));
        }
        Ok(header)
    }
}

/// Compress all of `source` from its current position into `sink`.
///
/// Returns the number of bytes written to `sink`.
pub fn compress<S, D>(source: &mut S, sink: &mut D, config: &ChunkConfig) -> Result<u64>
where
    S: Channel + ?Sized,
    D: Channel + ?Sized,
{
    if config.chunk_size == 0 || config.chunk_size > config.max_chunk_size as usize {
        return Err(StreamError::InvalidArgument(format!(
            "chunk size {} must be between 1 and {}",
            config.chunk_size, config.max_chunk_size
        )));
    }

    let mut buffer = vec![0u8; config.chunk_size];
    let mut written = 0u64;
    let mut chunks = 0usize;

    loop {
        let n = source.read_full(&mut buffer)?;
        if n == 0 {
            break;
        }

        let payload = config.method.compress_chunk(&buffer[..n])?;
        if payload.len() > config.max_chunk_size as usize {
            return Err(StreamError::InvalidArgument(format!(
                "compressed chunk of {} bytes exceeds limit {}",
                payload.len(),
                config.max_chunk_size
            )));
        }

        let header = ChunkHeader {
            uncompressed_size: n as u32,
            compressed_size: payload.len() as u32,
        };
        sink.write(&header.to_bytes())?;
        sink.write(&payload)?;

        written += (CHUNK_HEADER_SIZE + payload.len()) as u64;
        chunks += 1;
    }

    debug!(
        "Compressed {} chunks into {} bytes ({:?})",
        chunks, written, config.method
    );
    Ok(written)
}

/// Decompress all records from `source` into `sink`.
///
/// Returns the number of bytes written to `sink`.
pub fn decompress<S, D>(source: &mut S, sink: &mut D, config: &ChunkConfig) -> Result<u64>
where
    S: Channel + ?Sized,
    D: Channel + ?Sized,
{
    let mut header_bytes = [0u8; CHUNK_HEADER_SIZE];
    let mut payload = Vec::new();
    let mut written = 0u64;
    let mut chunks = 0usize;

    loop {
        let n = source.read_full(&mut header_bytes)?;
        if n == 0 {
            break;
        }
        if n < CHUNK_HEADER_SIZE {
            return Err(StreamError::Corrupt(format!(
                "truncated chunk header after {} chunks",
                chunks
            )));
        }
        let header = ChunkHeader::from_bytes(&header_bytes, config.max_chunk_size)?;

        payload.resize(header.compressed_size as usize, 0);
        if source.read_full(&mut payload)? < payload.len() {
            return Err(StreamError::Corrupt(format!(
                "truncated payload in chunk {}",
                chunks
            )));
        }

        let data = config
            .method
            .decompress_chunk(&payload, header.uncompressed_size as usize)?;
        sink.write(&data)?;

        written += data.len() as u64;
        chunks += 1;
    }

    debug!(
        "Decompressed {} chunks into {} bytes ({:?})",
        chunks, written, config.method
    );
    Ok(written)
}
