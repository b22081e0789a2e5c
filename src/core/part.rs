//! Package part channels
//!
//! A package part is stored in one of three ways. [`PackagePartChannel`] picks
//! the right stack for the part's [`PartEncoding`] and exposes it as a plain
//! [`Channel`]:
//!
//! - `Plain`: the raw channel itself
//! - `Encrypted`: `VersionedChannel(BlockCipherOverlay(raw))`
//! - `Compressed`: the whole part is inflated into a tiered scratch store on
//!   open and deflated back into the raw channel on flush

use crate::core::channel::Channel;
use crate::core::compression::{compress, decompress, CompressionMethod};
use crate::core::config::{ChunkConfig, StreamConfig};
use crate::core::encryption::BlockCipher;
use crate::core::error::{Result, StreamError};
use crate::core::header::VersionRecord;
use crate::core::overlay::BlockCipherOverlay;
use crate::core::tiered::TieredBlockStore;
use crate::core::versioned::VersionedChannel;
use std::io::SeekFrom;
use tracing::{debug, warn};

/// How a part is stored
pub enum PartEncoding {
    Plain,
    Encrypted {
        cipher: Box<dyn BlockCipher>,
        version: VersionRecord,
    },
    Compressed(CompressionMethod),
}

impl std::fmt::Debug for PartEncoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartEncoding::Plain => f.write_str("Plain"),
            PartEncoding::Encrypted { version, .. } => f
                .debug_struct("Encrypted")
                .field("version", version)
                .finish_non_exhaustive(),
            PartEncoding::Compressed(method) => f.debug_tuple("Compressed").field(method).finish(),
        }
    }
}

fn closed() -> StreamError {
    StreamError::Unsupported("compressed part is closed".to_string())
}

/// Compressed part served from an uncompressed scratch store
pub struct CompressedPart<C: Channel> {
    base: Option<C>,
    scratch: TieredBlockStore,
    chunks: ChunkConfig,
    dirty: bool,
}

impl<C: Channel> CompressedPart<C> {
    /// Inflate `base` into a scratch store
    pub fn open(mut base: C, method: CompressionMethod, config: &StreamConfig) -> Result<Self> {
        let chunks = ChunkConfig {
            method,
            ..config.compression.clone()
        };
        let mut scratch = TieredBlockStore::from_config(config)?;

        if base.len()? > 0 {
            base.seek(SeekFrom::Start(0))?;
            let inflated = decompress(&mut base, &mut scratch, &chunks)?;
            scratch.seek(SeekFrom::Start(0))?;
            debug!("Inflated compressed part to {} bytes", inflated);
        }

        Ok(CompressedPart {
            base: Some(base),
            scratch,
            chunks,
            dirty: false,
        })
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn method(&self) -> CompressionMethod {
        self.chunks.method
    }

    /// Flush and hand back the base channel
    pub fn close(mut self) -> Result<C> {
        self.flush()?;
        self.base.take().ok_or_else(closed)
    }

    fn recompress(&mut self) -> Result<()> {
        let base = self.base.as_mut().ok_or_else(closed)?;
        let position = self.scratch.position();

        base.set_len(0)?;
        base.seek(SeekFrom::Start(0))?;
        self.scratch.seek(SeekFrom::Start(0))?;
        let written = compress(&mut self.scratch, base, &self.chunks)?;
        self.scratch.seek(SeekFrom::Start(position))?;

        debug!(
            "Recompressed part: {} bytes into {} bytes",
            self.scratch.length(),
            written
        );
        self.dirty = false;
        Ok(())
    }
}

impl<C: Channel> Channel for CompressedPart<C> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.scratch.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        if !self.can_write() {
            return Err(StreamError::Unsupported(
                "compressed part is not writable".to_string(),
            ));
        }
        self.scratch.write(buf)?;
        self.dirty = true;
        Ok(())
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.scratch.seek(pos)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        if !self.can_write() {
            return Err(StreamError::Unsupported(
                "compressed part is not writable".to_string(),
            ));
        }
        self.scratch.set_len(len)?;
        self.dirty = true;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.recompress()?;
        }
        self.base.as_mut().ok_or_else(closed)?.flush()
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.scratch.length())
    }

    fn position(&self) -> u64 {
        self.scratch.position()
    }

    fn can_write(&self) -> bool {
        self.base.as_ref().is_some_and(|b| b.can_write())
    }
}

impl<C: Channel> Drop for CompressedPart<C> {
    fn drop(&mut self) {
        if self.base.is_some() && self.dirty {
            if let Err(e) = self.flush() {
                warn!("Failed to recompress part on drop: {}", e);
            }
        }
    }
}

enum PartStack<C: Channel> {
    Plain(C),
    Encrypted(VersionedChannel<BlockCipherOverlay<C>>),
    Compressed(CompressedPart<C>),
}

/// Channel over one package part, whatever its encoding
pub struct PackagePartChannel<C: Channel> {
    stack: PartStack<C>,
}

impl<C: Channel> PackagePartChannel<C> {
    pub fn open(base: C, encoding: PartEncoding) -> Result<Self> {
        Self::with_config(base, encoding, &StreamConfig::default())
    }

    pub fn with_config(base: C, encoding: PartEncoding, config: &StreamConfig) -> Result<Self> {
        debug!("Opening package part as {:?}", encoding);

        let stack = match encoding {
            PartEncoding::Plain => PartStack::Plain(base),
            PartEncoding::Encrypted { cipher, version } => {
                let overlay = BlockCipherOverlay::with_config(base, cipher, config)?;
                PartStack::Encrypted(VersionedChannel::new(overlay, version))
            }
            PartEncoding::Compressed(method) => {
                PartStack::Compressed(CompressedPart::open(base, method, config)?)
            }
        };
        Ok(PackagePartChannel { stack })
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.stack, PartStack::Encrypted(_))
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self.stack, PartStack::Compressed(_))
    }

    /// Flush every layer and hand back the raw channel
    pub fn close(self) -> Result<C> {
        match self.stack {
            PartStack::Plain(mut base) => {
                base.flush()?;
                Ok(base)
            }
            PartStack::Encrypted(versioned) => versioned.into_inner().close(),
            PartStack::Compressed(part) => part.close(),
        }
    }

    fn active(&mut self) -> &mut dyn Channel {
        match &mut self.stack {
            PartStack::Plain(base) => base,
            PartStack::Encrypted(versioned) => versioned,
            PartStack::Compressed(part) => part,
        }
    }

    fn active_ref(&self) -> &dyn Channel {
        match &self.stack {
            PartStack::Plain(base) => base,
            PartStack::Encrypted(versioned) => versioned,
            PartStack::Compressed(part) => part,
        }
    }
}

impl<C: Channel> Channel for PackagePartChannel<C> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.active().read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.active().write(buf)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.active().seek(pos)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.active().set_len(len)
    }

    fn flush(&mut self) -> Result<()> {
        self.active().flush()
    }

    fn len(&mut self) -> Result<u64> {
        self.active().len()
    }

    fn position(&self) -> u64 {
        self.active_ref().position()
    }

    fn can_read(&self) -> bool {
        self.active_ref().can_read()
    }

    fn can_write(&self) -> bool {
        self.active_ref().can_write()
    }

    fn can_seek(&self) -> bool {
        self.active_ref().can_seek()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::channel::MemoryChannel;
    use crate::core::compression::CHUNK_MAGIC;
    use crate::core::encryption::{generate_key, AesBlockCipher, EncryptionKey};
    use crate::core::header::VersionPair;

    fn read_all<C: Channel>(part: &mut PackagePartChannel<C>) -> Vec<u8> {
        part.seek(SeekFrom::Start(0)).unwrap();
        let mut out = vec![0u8; part.len().unwrap() as usize];
        part.read_full(&mut out).unwrap();
        out
    }

    #[test]
    fn test_plain_part_passes_through() {
        let mut part = PackagePartChannel::open(MemoryChannel::new(), PartEncoding::Plain).unwrap();
        part.write(b"plain text").unwrap();
        assert!(!part.is_encrypted());
        assert_eq!(part.close().unwrap().into_inner(), b"plain text");
    }

    #[test]
    fn test_compressed_part_round_trip() {
        let data = b"compressible ".repeat(800);

        let mut part = PackagePartChannel::open(
            MemoryChannel::new(),
            PartEncoding::Compressed(CompressionMethod::Deflate),
        )
        .unwrap();
        part.write(&data).unwrap();
        let raw = part.close().unwrap();

        assert_eq!(&raw.as_slice()[0..4], &CHUNK_MAGIC.to_le_bytes());
        assert!(raw.as_slice().len() < data.len());

        let mut part =
            PackagePartChannel::open(raw, PartEncoding::Compressed(CompressionMethod::Deflate))
                .unwrap();
        assert!(part.is_compressed());
        assert_eq!(read_all(&mut part), data);
    }

    #[test]
    fn test_compressed_part_clean_flush_keeps_base() {
        let mut part = PackagePartChannel::open(
            MemoryChannel::new(),
            PartEncoding::Compressed(CompressionMethod::Deflate),
        )
        .unwrap();
        part.write(b"abc").unwrap();
        let raw = part.close().unwrap();
        let snapshot = raw.as_slice().to_vec();

        let mut part =
            PackagePartChannel::open(raw, PartEncoding::Compressed(CompressionMethod::Deflate))
                .unwrap();
        part.flush().unwrap();
        assert_eq!(part.close().unwrap().as_slice(), snapshot.as_slice());
    }

    #[test]
    fn test_encrypted_part_round_trip() {
        let key = generate_key();
        let version = VersionRecord::new("Test.Encrypted", VersionPair::new(1, 0));
        let encoding = |key: &EncryptionKey| PartEncoding::Encrypted {
            cipher: Box::new(AesBlockCipher::new(key)),
            version: version.clone(),
        };

        let mut part = PackagePartChannel::open(MemoryChannel::new(), encoding(&key)).unwrap();
        part.write(b"secret payload").unwrap();
        let raw = part.close().unwrap();
        assert!(!raw
            .as_slice()
            .windows(6)
            .any(|w| w == b"secret"));

        let mut part = PackagePartChannel::open(raw, encoding(&key)).unwrap();
        assert!(part.is_encrypted());
        assert_eq!(read_all(&mut part), b"secret payload");
    }

    #[test]
    fn test_read_only_compressed_part() {
        let mut part = PackagePartChannel::open(
            MemoryChannel::new(),
            PartEncoding::Compressed(CompressionMethod::Lz4),
        )
        .unwrap();
        part.write(b"frozen").unwrap();
        let raw = part.close().unwrap().into_inner();

        let mut part = PackagePartChannel::open(
            MemoryChannel::read_only(raw),
            PartEncoding::Compressed(CompressionMethod::Lz4),
        )
        .unwrap();
        assert!(!part.can_write());
        assert_eq!(read_all(&mut part), b"frozen");
        assert!(matches!(
            part.write(b"x"),
            Err(StreamError::Unsupported(_))
        ));
    }
}
