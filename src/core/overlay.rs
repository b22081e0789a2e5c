//! Block cipher overlay with read and write caches
//!
//! [`BlockCipherOverlay`] presents the plaintext of an encrypted base channel
//! as an ordinary seekable, writable channel. Two [`TieredBlockStore`]s sit
//! between the caller and the cipher:
//!
//! - the **write cache** holds every byte written since the last flush and is
//!   authoritative wherever it has data;
//! - the **read cache** holds plaintext already decrypted from the base, so
//!   repeated reads never decrypt twice.
//!
//! Only the cipher blocks touched by writes are re-encrypted on flush.
//!
//! ```text
//! base channel
//! ┌──────────────┬──────────┬──────────┬─────┐
//! │ u64 LE length│ block 0  │ block 1  │ ... │
//! └──────────────┴──────────┴──────────┴─────┘
//!   8 bytes        block_size bytes each, random padding after the end
//! ```

use crate::core::channel::{resolve_seek, Channel};
use crate::core::config::StreamConfig;
use crate::core::encryption::BlockCipher;
use crate::core::error::{Result, StreamError};
use crate::core::backing::BackingArena;
use crate::core::sparse::{Coverage, Extent, SparseBlockBuffer};
use crate::core::tiered::TieredBlockStore;
use rand::RngCore;
use std::io::SeekFrom;
use tracing::{debug, warn};

/// Size of the plaintext length prefix on the base channel
pub const LENGTH_PREFIX_SIZE: u64 = 8;

/// Upper bound on the plaintext assembled per cipher call during flush
const FLUSH_SPAN_LIMIT: u64 = 64 * 1024;

fn closed() -> StreamError {
    StreamError::Unsupported("cipher overlay is closed".to_string())
}

fn align_down(offset: u64, block_size: u64) -> u64 {
    offset / block_size * block_size
}

fn align_up(offset: u64, block_size: u64) -> Result<u64> {
    offset
        .checked_add(block_size - 1)
        .map(|v| v / block_size * block_size)
        .ok_or_else(|| StreamError::InvalidArgument(format!("offset {} overflows", offset)))
}

/// Run the cipher over a block-aligned span, honouring `can_merge_blocks`.
fn apply_cipher<F>(data: &[u8], block_size: u64, merge: bool, op: F) -> Result<Vec<u8>>
where
    F: Fn(&[u8]) -> Result<Vec<u8>>,
{
    let out = if merge {
        op(data)?
    } else {
        let mut out = Vec::with_capacity(data.len());
        for block in data.chunks(block_size as usize) {
            out.extend_from_slice(&op(block)?);
        }
        out
    };

    if out.len() != data.len() {
        return Err(StreamError::Cipher(format!(
            "cipher produced {} bytes for a {}-byte span",
            out.len(),
            data.len()
        )));
    }
    Ok(out)
}

/// Copy `dest.len()` bytes at `offset` out of a cache store.
fn copy_from(store: &mut TieredBlockStore, offset: u64, dest: &mut [u8]) -> Result<usize> {
    store.seek(SeekFrom::Start(offset))?;
    store.read_full(dest)
}

/// Plaintext view over an encrypted channel
pub struct BlockCipherOverlay<C: Channel> {
    base: Option<C>,
    cipher: Box<dyn BlockCipher>,
    read_cache: TieredBlockStore,
    write_cache: TieredBlockStore,
    block_size: u64,
    can_merge_blocks: bool,
    /// Plaintext length as seen by callers
    length: u64,
    /// Plaintext length recorded in the base prefix
    persisted_length: u64,
    /// Leading bytes of the persisted plaintext that are still meaningful
    valid_length: u64,
    position: u64,
    auto_flush_threshold: u64,
}

impl<C: Channel> BlockCipherOverlay<C> {
    /// Open an overlay with the default configuration
    pub fn open(base: C, cipher: Box<dyn BlockCipher>) -> Result<Self> {
        Self::with_config(base, cipher, &StreamConfig::default())
    }

    /// Open an overlay, reading the length prefix if the base has content
    pub fn with_config(
        mut base: C,
        cipher: Box<dyn BlockCipher>,
        config: &StreamConfig,
    ) -> Result<Self> {
        if !cipher.can_encrypt() && !cipher.can_decrypt() {
            return Err(StreamError::Unsupported(
                "cipher supports neither encryption nor decryption".to_string(),
            ));
        }
        let block_size = cipher.block_size() as u64;
        if block_size == 0 {
            return Err(StreamError::Unsupported(
                "cipher reports a zero block size".to_string(),
            ));
        }

        let base_len = base.len()?;
        let persisted_length = if base_len == 0 {
            0
        } else {
            if base_len < LENGTH_PREFIX_SIZE {
                return Err(StreamError::Corrupt(format!(
                    "encrypted stream of {} bytes has no length prefix",
                    base_len
                )));
            }
            let mut prefix = [0u8; LENGTH_PREFIX_SIZE as usize];
            base.seek(SeekFrom::Start(0))?;
            base.read_full(&mut prefix)?;
            let length = u64::from_le_bytes(prefix);

            let needed = align_up(length, block_size)?;
            if base_len - LENGTH_PREFIX_SIZE < needed {
                return Err(StreamError::Corrupt(format!(
                    "length prefix claims {} bytes but only {} ciphertext bytes follow",
                    length,
                    base_len - LENGTH_PREFIX_SIZE
                )));
            }
            length
        };

        let arena = BackingArena::for_dir(config.tiers.backing_dir.as_deref());
        // Caches must not bridge gaps: a zero-filled gap would shadow real data.
        let cache = || {
            TieredBlockStore::with_parts(
                SparseBlockBuffer::with_limits(0, config.sparse.max_block_size),
                &config.tiers,
                arena.clone(),
            )
        };

        debug!(
            "Opened cipher overlay: {} plaintext bytes, block size {}",
            persisted_length, block_size
        );

        Ok(BlockCipherOverlay {
            base: Some(base),
            can_merge_blocks: cipher.can_merge_blocks(),
            cipher,
            read_cache: cache()?,
            write_cache: cache()?,
            block_size,
            length: persisted_length,
            persisted_length,
            valid_length: persisted_length,
            position: 0,
            auto_flush_threshold: config.cipher.auto_flush_threshold,
        })
    }

    /// Plaintext length
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn block_size(&self) -> u32 {
        self.block_size as u32
    }

    /// Whether unflushed changes exist
    pub fn has_pending_changes(&self) -> bool {
        self.write_cache.buffered_bytes() > 0 || self.length != self.persisted_length
    }

    /// Bytes currently held by the read and write caches
    pub fn cached_bytes(&self) -> u64 {
        self.read_cache.buffered_bytes() + self.write_cache.buffered_bytes()
    }

    /// Flush and hand back the base channel
    pub fn close(mut self) -> Result<C> {
        self.flush()?;
        self.base.take().ok_or_else(closed)
    }

    /// Serve a leading part of `dest` (plaintext at `offset`), never crossing
    /// a cached/uncached boundary.
    fn read_step(&mut self, offset: u64, dest: &mut [u8]) -> Result<usize> {
        let mut n = dest.len() as u64;

        match self.write_cache.coverage(offset, n) {
            Coverage::Present(k) => {
                return copy_from(&mut self.write_cache, offset, &mut dest[..k as usize])
            }
            Coverage::Absent(k) => n = k,
        }

        match self.read_cache.coverage(offset, n) {
            Coverage::Present(k) => {
                return copy_from(&mut self.read_cache, offset, &mut dest[..k as usize])
            }
            Coverage::Absent(k) => n = k,
        }

        self.fetch(offset, n)?;
        copy_from(&mut self.read_cache, offset, &mut dest[..n as usize])
    }

    /// Fill `dest` with plaintext at `offset`; the range must lie below `length`.
    fn read_at(&mut self, offset: u64, dest: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < dest.len() {
            let n = self.read_step(offset + filled as u64, &mut dest[filled..])?;
            if n == 0 {
                return Err(StreamError::Corrupt(format!(
                    "no plaintext available at offset {}",
                    offset + filled as u64
                )));
            }
            filled += n;
        }
        Ok(())
    }

    /// Decrypt the aligned span covering `[offset, offset + len)` into the read cache.
    fn fetch(&mut self, offset: u64, len: u64) -> Result<()> {
        let start = align_down(offset, self.block_size);
        let end = align_up(offset + len, self.block_size)?;
        let mut plain = vec![0u8; (end - start) as usize];

        if start < self.valid_length {
            let cipher_end = end.min(align_up(self.valid_length, self.block_size)?);
            let span = (cipher_end - start) as usize;

            let base = self.base.as_mut().ok_or_else(closed)?;
            let mut ciphertext = vec![0u8; span];
            base.seek(SeekFrom::Start(LENGTH_PREFIX_SIZE + start))?;
            let got = base.read_full(&mut ciphertext)?;
            if got < span {
                return Err(StreamError::Corrupt(format!(
                    "ciphertext truncated at block {}",
                    (start + got as u64) / self.block_size
                )));
            }

            let cipher = &self.cipher;
            let decrypted = apply_cipher(&ciphertext, self.block_size, self.can_merge_blocks, |d| {
                cipher.decrypt(d)
            })?;
            plain[..span].copy_from_slice(&decrypted);

            // Padding and truncated tails read back as zeros.
            if self.valid_length < cipher_end {
                plain[(self.valid_length - start) as usize..span].fill(0);
            }
        }

        self.read_cache.seek(SeekFrom::Start(start))?;
        self.read_cache.write(&plain)?;
        Ok(())
    }

    fn flush_if_needed(&mut self) -> Result<()> {
        if self.cached_bytes() > self.auto_flush_threshold {
            debug!(
                "Cipher caches hold {} bytes (threshold {}), flushing",
                self.cached_bytes(),
                self.auto_flush_threshold
            );
            self.flush_caches()?;
        }
        Ok(())
    }

    /// Ranges of plaintext whose cipher blocks must be rewritten.
    fn dirty_extents(&self) -> Vec<Extent> {
        let mut dirty = self.write_cache.extents();

        // Bytes past the valid persisted data were never encrypted (or are stale).
        if self.length > self.valid_length {
            dirty.push(Extent::new(
                self.valid_length,
                self.length - self.valid_length,
            ));
        }

        // A shrink mid-block leaves old plaintext in the tail of the last block.
        let tail = self.length % self.block_size;
        if self.length < self.persisted_length && tail != 0 {
            dirty.push(Extent::new(self.length - tail, tail));
        }

        dirty
    }

    /// Aligned, merged, non-empty spans covering the dirty extents.
    fn dirty_spans(&self) -> Result<Vec<(u64, u64)>> {
        let mut spans = Vec::new();
        for extent in self.dirty_extents() {
            if extent.len == 0 || extent.offset >= self.length {
                continue;
            }
            let end = extent.end().min(self.length);
            spans.push((
                align_down(extent.offset, self.block_size),
                align_up(end, self.block_size)?,
            ));
        }
        spans.sort_unstable();

        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(spans.len());
        for (start, end) in spans {
            match merged.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }
        Ok(merged)
    }

    /// Re-encrypt one aligned span and write it to the base.
    fn write_span(&mut self, start: u64, end: u64) -> Result<()> {
        let plain_end = end.min(self.length);
        let mut plain = vec![0u8; (end - start) as usize];
        let filled = (plain_end - start) as usize;

        self.read_at(start, &mut plain[..filled])?;
        rand::thread_rng().fill_bytes(&mut plain[filled..]);

        let cipher = &self.cipher;
        let ciphertext = apply_cipher(&plain, self.block_size, self.can_merge_blocks, |d| {
            cipher.encrypt(d)
        })?;

        let base = self.base.as_mut().ok_or_else(closed)?;
        base.seek(SeekFrom::Start(LENGTH_PREFIX_SIZE + start))?;
        base.write(&ciphertext)
    }

    fn flush_caches(&mut self) -> Result<()> {
        if !self.has_pending_changes() {
            self.read_cache.clear();
            return Ok(());
        }
        if !self.cipher.can_encrypt() {
            return Err(StreamError::Unsupported(
                "pending changes cannot be encrypted by a decrypt-only cipher".to_string(),
            ));
        }

        let spans = self.dirty_spans()?;
        let limit = align_down(FLUSH_SPAN_LIMIT, self.block_size).max(self.block_size);
        let mut blocks_written = 0u64;
        for (start, end) in spans {
            let mut piece = start;
            while piece < end {
                let piece_end = (piece + limit).min(end);
                self.write_span(piece, piece_end)?;
                blocks_written += (piece_end - piece) / self.block_size;
                piece = piece_end;
            }
        }

        let length = self.length;
        let cipher_end = LENGTH_PREFIX_SIZE + align_up(length, self.block_size)?;
        let base = self.base.as_mut().ok_or_else(closed)?;
        if length != self.persisted_length || base.len()? < LENGTH_PREFIX_SIZE {
            base.seek(SeekFrom::Start(0))?;
            base.write(&length.to_le_bytes())?;
        }
        if base.len()? > cipher_end {
            base.set_len(cipher_end)?;
        }

        debug!(
            "Flushed cipher overlay: {} blocks re-encrypted, length {}",
            blocks_written, length
        );

        self.persisted_length = length;
        self.valid_length = length;
        self.read_cache.clear();
        self.write_cache.clear();
        Ok(())
    }
}

impl<C: Channel> Channel for BlockCipherOverlay<C> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.can_read() {
            return Err(StreamError::Unsupported(
                "cipher overlay is not readable".to_string(),
            ));
        }

        let mut filled = 0;
        while filled < buf.len() && self.position < self.length {
            let want = ((buf.len() - filled) as u64).min(self.length - self.position) as usize;
            let n = self.read_step(self.position, &mut buf[filled..filled + want])?;
            if n == 0 {
                break;
            }
            filled += n;
            self.position += n as u64;
        }

        self.flush_if_needed()?;
        Ok(filled)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        if !self.can_write() {
            return Err(StreamError::Unsupported(
                "cipher overlay is not writable".to_string(),
            ));
        }
        if buf.is_empty() {
            return Ok(());
        }

        let end = self.position.checked_add(buf.len() as u64).ok_or_else(|| {
            StreamError::InvalidArgument(format!(
                "write of {} bytes at {} overflows",
                buf.len(),
                self.position
            ))
        })?;
        self.write_cache.seek(SeekFrom::Start(self.position))?;
        self.write_cache.write(buf)?;
        self.position = end;
        self.length = self.length.max(end);

        self.flush_if_needed()
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.position = resolve_seek(pos, self.position, self.length)?;
        Ok(self.position)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        if !self.can_write() {
            return Err(StreamError::Unsupported(
                "cipher overlay is not writable".to_string(),
            ));
        }

        if len < self.length {
            if self.write_cache.length() > len {
                self.write_cache.set_len(len)?;
            }
            if self.read_cache.length() > len {
                self.read_cache.set_len(len)?;
            }
            self.valid_length = self.valid_length.min(len);
        }
        self.length = len;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.flush_caches()?;
        self.base.as_mut().ok_or_else(closed)?.flush()
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.length)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn can_read(&self) -> bool {
        self.cipher.can_decrypt() && self.base.as_ref().is_some_and(|b| b.can_read())
    }

    fn can_write(&self) -> bool {
        self.cipher.can_encrypt() && self.base.as_ref().is_some_and(|b| b.can_write())
    }
}

impl<C: Channel> Drop for BlockCipherOverlay<C> {
    fn drop(&mut self) {
        if self.base.is_some() && self.has_pending_changes() {
            if let Err(e) = self.flush() {
                warn!("Failed to flush cipher overlay on drop: {}", e);
            }
        }
    }
}
