//! # partstream - Layered streams for package parts
//!
//! `partstream` provides the byte-stream machinery behind a package container:
//!
//! - **Sparse buffering**: writes are kept as merged blocks, gaps read as zeros
//! - **Tiered storage**: buffers spill to temporary files under memory pressure
//!   and come back when they shrink
//! - **Block cipher overlay**: random-access plaintext over an encrypted stream,
//!   re-encrypting only the blocks that changed
//! - **Version records**: old and new code negotiate access to the same stream
//! - **Chunked compression**: independently deflated 4 KiB records
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use partstream::{
//!     generate_key, AesBlockCipher, Channel, FileChannel, PackagePartChannel,
//!     PartEncoding, Result, VersionPair, VersionRecord,
//! };
//!
//! # fn main() -> Result<()> {
//! let key = generate_key();
//! let file = FileChannel::create("part.bin")?;
//!
//! let mut part = PackagePartChannel::open(
//!     file,
//!     PartEncoding::Encrypted {
//!         cipher: Box::new(AesBlockCipher::new(&key)),
//!         version: VersionRecord::new("Example.Encrypted", VersionPair::new(1, 0)),
//!     },
//! )?;
//! part.write(b"Hello, World!")?;
//! part.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! ```rust,no_run
//! use partstream::{Result, StreamConfig, TieredBlockStore};
//!
//! # fn main() -> Result<()> {
//! let config = StreamConfig::load("partstream.toml")?;
//! let scratch = TieredBlockStore::from_config(&config)?;
//! # Ok(())
//! # }
//! ```

pub mod core;

pub use crate::core::{
    backing::{BackingArena, BackingFile},
    channel::{Channel, FileChannel, MemoryChannel},
    compression::{compress, decompress, ChunkHeader, CompressionMethod},
    config::{ChunkConfig, CipherConfig, SparseConfig, StreamConfig, TierConfig},
    digest::{digest, DigestMethod, DigestTransform},
    encryption::{generate_key, AesBlockCipher, BlockCipher, EncryptionKey},
    error::{Result, StreamError},
    header::{VersionPair, VersionRecord},
    overlay::BlockCipherOverlay,
    part::{CompressedPart, PackagePartChannel, PartEncoding},
    sparse::{Coverage, Extent, SparseBlockBuffer},
    tiered::{Tier, TieredBlockStore},
    versioned::VersionedChannel,
};
