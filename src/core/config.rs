//! Stream configuration
//!
//! All tunables of the stack live in [`StreamConfig`], which can be built in
//! code or loaded from TOML:
//!
//! ```toml
//! [sparse]
//! merge_gap = 100
//!
//! [tiers]
//! low_water = 102400
//! high_water = 10485760
//!
//! [cipher]
//! auto_flush_threshold = 16384
//!
//! [compression]
//! method = "deflate"
//! chunk_size = 4096
//! ```

use crate::core::compression::{
    CompressionMethod, DEFAULT_CHUNK_SIZE, MAX_CHUNK_FIELD,
};
use crate::core::error::{Result, StreamError};
use crate::core::sparse::{DEFAULT_MAX_BLOCK_SIZE, DEFAULT_MERGE_GAP};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default low water mark: recall to memory below 100 KiB on disk
pub const DEFAULT_LOW_WATER: u64 = 0x19000;

/// Default high water mark: spill to disk above 10 MiB in memory
pub const DEFAULT_HIGH_WATER: u64 = 0xA0_0000;

/// Default combined cache size that triggers a cipher overlay flush
pub const DEFAULT_AUTO_FLUSH_THRESHOLD: u64 = 16 * 1024;

/// Sparse buffer merge policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SparseConfig {
    /// Largest gap (bytes) bridged when merging neighbouring blocks
    pub merge_gap: u64,

    /// Largest block a gap merge may produce
    pub max_block_size: usize,
}

impl Default for SparseConfig {
    fn default() -> Self {
        SparseConfig {
            merge_gap: DEFAULT_MERGE_GAP,
            max_block_size: DEFAULT_MAX_BLOCK_SIZE,
        }
    }
}

/// Memory/disk tier thresholds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    /// Disk tier returns to memory once its length drops below this
    pub low_water: u64,

    /// Memory tier spills to disk once its allocation exceeds this
    pub high_water: u64,

    /// Directory for spill files (system temp dir when unset)
    pub backing_dir: Option<PathBuf>,
}

impl Default for TierConfig {
    fn default() -> Self {
        TierConfig {
            low_water: DEFAULT_LOW_WATER,
            high_water: DEFAULT_HIGH_WATER,
            backing_dir: None,
        }
    }
}

impl TierConfig {
    /// Thresholds only, backing files in the default location
    pub fn with_marks(low_water: u64, high_water: u64) -> Self {
        TierConfig {
            low_water,
            high_water,
            backing_dir: None,
        }
    }

    /// Low water must sit below high water or every mutation would migrate
    pub fn validate(&self) -> Result<()> {
        if self.low_water >= self.high_water {
            return Err(StreamError::Config(format!(
                "tiers.low_water ({}) must be below tiers.high_water ({})",
                self.low_water, self.high_water
            )));
        }
        Ok(())
    }
}

/// Block cipher overlay settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CipherConfig {
    /// Flush once read and write caches together hold more than this many bytes
    pub auto_flush_threshold: u64,
}

impl Default for CipherConfig {
    fn default() -> Self {
        CipherConfig {
            auto_flush_threshold: DEFAULT_AUTO_FLUSH_THRESHOLD,
        }
    }
}

/// Chunked compression settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    pub method: CompressionMethod,

    /// Uncompressed bytes per chunk
    pub chunk_size: usize,

    /// Largest size accepted in either chunk header field
    pub max_chunk_size: u32,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        ChunkConfig {
            method: CompressionMethod::Deflate,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_chunk_size: MAX_CHUNK_FIELD,
        }
    }
}

/// Complete stack configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub sparse: SparseConfig,
    pub tiers: TierConfig,
    pub cipher: CipherConfig,
    pub compression: ChunkConfig,
}

impl StreamConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: StreamConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Validate all fields
    pub fn validate(&self) -> Result<()> {
        if self.sparse.max_block_size == 0 {
            return Err(StreamError::Config(
                "sparse.max_block_size must be positive".to_string(),
            ));
        }

        self.tiers.validate()?;

        let chunk = &self.compression;
        if chunk.max_chunk_size > MAX_CHUNK_FIELD {
            return Err(StreamError::Config(format!(
                "compression.max_chunk_size ({}) exceeds the record limit {}",
                chunk.max_chunk_size, MAX_CHUNK_FIELD
            )));
        }
        if chunk.chunk_size == 0 || chunk.chunk_size > chunk.max_chunk_size as usize {
            return Err(StreamError::Config(format!(
                "compression.chunk_size ({}) must be between 1 and {}",
                chunk.chunk_size, chunk.max_chunk_size
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = StreamConfig::default();
        assert_eq!(config.sparse.merge_gap, 100);
        assert_eq!(config.tiers.low_water, 0x19000);
        assert_eq!(config.tiers.high_water, 0xA0_0000);
        assert_eq!(config.cipher.auto_flush_threshold, 16 * 1024);
        assert_eq!(config.compression.method, CompressionMethod::Deflate);
        assert_eq!(config.compression.chunk_size, 4096);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = StreamConfig::from_toml_str(
            r#"
            [tiers]
            low_water = 10
            high_water = 100

            [compression]
            method = "zstd"
            "#,
        )
        .unwrap();

        assert_eq!(config.tiers.low_water, 10);
        assert_eq!(config.tiers.high_water, 100);
        assert_eq!(config.compression.method, CompressionMethod::Zstd);
        assert_eq!(config.sparse.merge_gap, 100);
    }

    #[test]
    fn test_inverted_water_marks_rejected() {
        let result = StreamConfig::from_toml_str(
            r#"
            [tiers]
            low_water = 500
            high_water = 100
            "#,
        );
        assert!(matches!(result, Err(StreamError::Config(_))));
    }

    #[test]
    fn test_oversized_chunk_rejected() {
        let mut config = StreamConfig::default();
        config.compression.chunk_size = 2 * 1024 * 1024;
        assert!(matches!(config.validate(), Err(StreamError::Config(_))));
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let result = StreamConfig::from_toml_str("[tiers\nlow_water = ");
        assert!(matches!(result, Err(StreamError::Toml(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("stream.toml");
        std::fs::write(&path, "[cipher]\nauto_flush_threshold = 4096\n").unwrap();

        let config = StreamConfig::load(&path).unwrap();
        assert_eq!(config.cipher.auto_flush_threshold, 4096);
    }
}
