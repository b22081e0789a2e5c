//! Sparse, block-merging memory buffer
//!
//! A [`SparseBlockBuffer`] stores only the byte ranges that were written, as a
//! sorted list of non-overlapping blocks. Everything else below the logical
//! length reads back as zeros.
//!
//! **Design**:
//! - Blocks are located by binary search with a value comparator on the offset
//! - Writes close to the previous block (within `merge_gap` bytes) extend it
//!   instead of allocating, as long as the block stays under `max_block_size`
//! - After every write the touched block absorbs any neighbour it now overlaps
//!   or nearly touches; the newest bytes win wherever ranges overlap

use crate::core::channel::{resolve_seek, Channel};
use crate::core::config::SparseConfig;
use crate::core::error::{Result, StreamError};
use std::cmp::Ordering;
use std::io::SeekFrom;

/// Default gap (bytes) across which neighbouring blocks are merged
pub const DEFAULT_MERGE_GAP: u64 = 100;

/// Default upper bound for a block grown by gap merging
pub const DEFAULT_MAX_BLOCK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone)]
struct Block {
    offset: u64,
    data: Vec<u8>,
}

impl Block {
    fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// Offset/length pair describing a stored byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub len: u64,
}

impl Extent {
    pub fn new(offset: u64, len: u64) -> Self {
        Extent { offset, len }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Answer to "is `[offset, offset + len)` stored?"
///
/// The payload is the length of the leading run that shares the answer, so a
/// caller never straddles stored and unstored bytes in a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coverage {
    Present(u64),
    Absent(u64),
}

/// Where `offset` falls relative to a range.
fn locate(start: u64, end: u64, offset: u64) -> Ordering {
    if end <= offset {
        Ordering::Less
    } else if start > offset {
        Ordering::Greater
    } else {
        Ordering::Equal
    }
}

/// Sparse random-access byte buffer
#[derive(Debug, Clone)]
pub struct SparseBlockBuffer {
    blocks: Vec<Block>,
    length: u64,
    position: u64,
    merge_gap: u64,
    max_block_size: usize,
}

impl Default for SparseBlockBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl SparseBlockBuffer {
    /// Create an empty buffer with the default merge policy
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MERGE_GAP, DEFAULT_MAX_BLOCK_SIZE)
    }

    /// Create an empty buffer with an explicit merge gap and block size cap
    pub fn with_limits(merge_gap: u64, max_block_size: usize) -> Self {
        SparseBlockBuffer {
            blocks: Vec::new(),
            length: 0,
            position: 0,
            merge_gap,
            max_block_size,
        }
    }

    pub fn from_config(config: &SparseConfig) -> Self {
        Self::with_limits(config.merge_gap, config.max_block_size)
    }

    /// Empty copy that keeps this buffer's merge policy
    pub(crate) fn empty_like(&self) -> Self {
        Self::with_limits(self.merge_gap, self.max_block_size)
    }

    pub fn merge_gap(&self) -> u64 {
        self.merge_gap
    }

    /// Logical length (may exceed the end of the last block)
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Number of stored blocks
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Stored blocks, in offset order
    pub fn blocks(&self) -> Vec<Extent> {
        self.blocks
            .iter()
            .map(|b| Extent::new(b.offset, b.data.len() as u64))
            .collect()
    }

    /// Stored payloads with their offsets
    pub(crate) fn block_data(&self) -> impl Iterator<Item = (u64, &[u8])> {
        self.blocks.iter().map(|b| (b.offset, b.data.as_slice()))
    }

    /// Bytes currently allocated for block payloads
    pub fn memory_consumption(&self) -> usize {
        self.blocks.iter().map(|b| b.data.capacity()).sum()
    }

    /// Bytes of block payload (excluding allocator slack)
    pub fn stored_bytes(&self) -> u64 {
        self.blocks.iter().map(|b| b.data.len() as u64).sum()
    }

    /// Which leading part of `[offset, offset + len)` is stored
    pub fn coverage(&self, offset: u64, len: u64) -> Coverage {
        let end = offset.saturating_add(len);
        match self.search(offset) {
            Ok(i) => Coverage::Present(self.blocks[i].end().min(end) - offset),
            Err(i) => match self.blocks.get(i) {
                Some(next) => Coverage::Absent(next.offset.min(end) - offset),
                None => Coverage::Absent(len),
            },
        }
    }

    /// Drop every block and reset length and position
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.length = 0;
        self.position = 0;
    }

    fn search(&self, offset: u64) -> std::result::Result<usize, usize> {
        self.blocks
            .binary_search_by(|b| locate(b.offset, b.end(), offset))
    }

    fn can_extend(&self, block: &Block, start: u64, end: u64) -> bool {
        start - block.end() <= self.merge_gap
            && end - block.offset <= self.max_block_size as u64
    }

    /// Copy `buf` into block `index` at absolute offset `start`, growing it as needed.
    fn write_into(&mut self, index: usize, start: u64, buf: &[u8]) {
        let block = &mut self.blocks[index];
        let rel = (start - block.offset) as usize;
        let needed = rel + buf.len();
        if block.data.len() < needed {
            block.data.resize(needed, 0);
        }
        block.data[rel..needed].copy_from_slice(buf);
    }

    /// Fold following blocks into block `index` while they overlap it or sit
    /// within the merge gap.
    fn coalesce_forward(&mut self, index: usize) {
        while index + 1 < self.blocks.len() {
            let current_end = self.blocks[index].end();
            let next = &self.blocks[index + 1];

            if next.offset >= current_end {
                let gap = next.offset - current_end;
                let merged_len = next.end() - self.blocks[index].offset;
                if gap > self.merge_gap || merged_len > self.max_block_size as u64 {
                    break;
                }
            }

            let next = self.blocks.remove(index + 1);
            let current = &mut self.blocks[index];
            if next.end() <= current_end {
                continue;
            }
            if next.offset >= current_end {
                current.data.resize((next.offset - current.offset) as usize, 0);
                current.data.extend_from_slice(&next.data);
            } else {
                let skip = (current_end - next.offset) as usize;
                current.data.extend_from_slice(&next.data[skip..]);
            }
        }
    }
}

impl Channel for SparseBlockBuffer {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.position >= self.length || buf.is_empty() {
            return Ok(0);
        }

        let n = (buf.len() as u64).min(self.length - self.position) as usize;
        let start = self.position;
        let end = start + n as u64;
        let dest = &mut buf[..n];
        dest.fill(0);

        let first = match self.search(start) {
            Ok(i) | Err(i) => i,
        };
        for block in &self.blocks[first..] {
            if block.offset >= end {
                break;
            }
            let from = block.offset.max(start);
            let to = block.end().min(end);
            let src = &block.data[(from - block.offset) as usize..(to - block.offset) as usize];
            dest[(from - start) as usize..(to - start) as usize].copy_from_slice(src);
        }

        self.position = end;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }

        let start = self.position;
        let end = start.checked_add(buf.len() as u64).ok_or_else(|| {
            StreamError::InvalidArgument(format!(
                "write of {} bytes at {} overflows the offset range",
                buf.len(),
                start
            ))
        })?;

        let index = match self.search(start) {
            Ok(i) => {
                self.write_into(i, start, buf);
                i
            }
            Err(i) if i > 0 && self.can_extend(&self.blocks[i - 1], start, end) => {
                self.write_into(i - 1, start, buf);
                i - 1
            }
            Err(i) => {
                self.blocks.insert(
                    i,
                    Block {
                        offset: start,
                        data: buf.to_vec(),
                    },
                );
                i
            }
        };
        self.coalesce_forward(index);

        self.position = end;
        self.length = self.length.max(end);
        Ok(())
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.position = resolve_seek(pos, self.position, self.length)?;
        Ok(self.position)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        if len < self.length {
            let keep = match self.search(len) {
                Ok(i) => {
                    let block = &mut self.blocks[i];
                    block.data.truncate((len - block.offset) as usize);
                    block.data.shrink_to_fit();
                    if block.data.is_empty() {
                        i
                    } else {
                        i + 1
                    }
                }
                Err(i) => i,
            };
            self.blocks.truncate(keep);
        }
        self.length = len;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.length)
    }

    fn position(&self) -> u64 {
        self.position
    }
}

/// Sorted, merged set of written ranges
///
/// Tracks which bytes of a disk tier were written, so the tier can hand the
/// same answers as the in-memory blocks after a spill.
#[derive(Debug, Clone, Default)]
pub(crate) struct ExtentSet {
    extents: Vec<Extent>,
}

impl ExtentSet {
    pub(crate) fn from_extents(extents: Vec<Extent>) -> Self {
        ExtentSet { extents }
    }

    pub(crate) fn extents(&self) -> &[Extent] {
        &self.extents
    }

    pub(crate) fn total(&self) -> u64 {
        self.extents.iter().map(|e| e.len).sum()
    }

    fn search(&self, offset: u64) -> std::result::Result<usize, usize> {
        self.extents
            .binary_search_by(|e| locate(e.offset, e.end(), offset))
    }

    /// Record `[offset, offset + len)` as written, merging touching ranges.
    pub(crate) fn insert(&mut self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        let mut start = offset;
        let mut end = offset + len;

        let first = self.extents.partition_point(|e| e.end() < start);
        let mut last = first;
        while last < self.extents.len() && self.extents[last].offset <= end {
            start = start.min(self.extents[last].offset);
            end = end.max(self.extents[last].end());
            last += 1;
        }
        self.extents
            .splice(first..last, std::iter::once(Extent::new(start, end - start)));
    }

    pub(crate) fn truncate(&mut self, len: u64) {
        self.extents.retain(|e| e.offset < len);
        if let Some(last) = self.extents.last_mut() {
            if last.end() > len {
                last.len = len - last.offset;
            }
        }
    }

    pub(crate) fn coverage(&self, offset: u64, len: u64) -> Coverage {
        let end = offset.saturating_add(len);
        match self.search(offset) {
            Ok(i) => Coverage::Present(self.extents[i].end().min(end) - offset),
            Err(i) => match self.extents.get(i) {
                Some(next) => Coverage::Absent(next.offset.min(end) - offset),
                None => Coverage::Absent(len),
            },
        }
    }
}
