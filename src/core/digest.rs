//! Content digests for package signatures
//!
//! The signature layer hashes part content after applying the transforms
//! named in the signature reference. Transforms run in order over the whole
//! channel; intermediate results are staged in a [`TieredBlockStore`] so large
//! parts spill to disk instead of growing memory.

use crate::core::channel::Channel;
use crate::core::compression::{decompress, CompressionMethod};
use crate::core::config::{ChunkConfig, StreamConfig};
use crate::core::error::{Result, StreamError};
use crate::core::tiered::TieredBlockStore;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use std::io::SeekFrom;
use tracing::debug;

const READ_BUFFER_SIZE: usize = 8192;

/// Transform applied to part content before hashing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestTransform {
    Identity,
    /// Inflate chunked compression records
    Decompress(CompressionMethod),
}

/// Hash algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestMethod {
    #[default]
    Sha256,
}

impl DigestMethod {
    /// Algorithm identifier used in signature references
    pub fn uri(&self) -> &'static str {
        match self {
            DigestMethod::Sha256 => "http://www.w3.org/2001/04/xmlenc#sha256",
        }
    }
}

fn hash_channel<C: Channel + ?Sized>(channel: &mut C, method: DigestMethod) -> Result<Vec<u8>> {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    match method {
        DigestMethod::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let n = channel.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buffer[..n]);
            }
            Ok(hasher.finalize().to_vec())
        }
    }
}

/// Hash the whole channel after `transforms`, returning standard base64.
pub fn digest<C: Channel + ?Sized>(
    channel: &mut C,
    transforms: &[DigestTransform],
    method: DigestMethod,
) -> Result<String> {
    if !channel.can_seek() {
        return Err(StreamError::Unsupported(
            "digest requires a seekable channel".to_string(),
        ));
    }
    channel.seek(SeekFrom::Start(0))?;

    let mut staged: Option<TieredBlockStore> = None;
    for transform in transforms {
        match transform {
            DigestTransform::Identity => {}
            DigestTransform::Decompress(codec) => {
                let chunks = ChunkConfig {
                    method: *codec,
                    ..ChunkConfig::default()
                };
                let mut output = TieredBlockStore::from_config(&StreamConfig::default())?;
                match staged.as_mut() {
                    Some(input) => decompress(input, &mut output, &chunks)?,
                    None => decompress(channel, &mut output, &chunks)?,
                };
                output.seek(SeekFrom::Start(0))?;
                staged = Some(output);
            }
        }
    }

    let hash = match staged.as_mut() {
        Some(input) => hash_channel(input, method)?,
        None => hash_channel(channel, method)?,
    };
    let encoded = STANDARD.encode(hash);
    debug!("Computed {:?} digest over {} transforms", method, transforms.len());
    Ok(encoded)
}
