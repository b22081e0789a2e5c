//! Two-tier block store: sparse memory buffer with spill to disk
//!
//! A [`TieredBlockStore`] behaves like a [`SparseBlockBuffer`] until the
//! buffer's allocation passes the high water mark. At that point the logical
//! content is copied into a spill file from the [`BackingArena`] and the disk
//! tier becomes authoritative. When a truncation brings the spill file below
//! the low water mark, the written ranges move back into memory and the spill
//! file is released.
//!
//! Migration runs in exactly one place, [`TieredBlockStore::check_and_migrate`],
//! at the end of every mutating call, after the active tier is already
//! consistent. Callers never observe a change in length or position.

use crate::core::backing::{BackingArena, BackingFile};
use crate::core::channel::Channel;
use crate::core::config::{StreamConfig, TierConfig};
use crate::core::error::Result;
use crate::core::sparse::{Coverage, Extent, ExtentSet, SparseBlockBuffer};
use std::io::SeekFrom;
use tracing::info;

/// Which representation currently holds the data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Memory,
    Disk,
}

#[derive(Debug)]
struct DiskTier {
    file: BackingFile,
    extents: ExtentSet,
    length: u64,
}

/// Sparse buffer with memory and disk tiers
#[derive(Debug)]
pub struct TieredBlockStore {
    memory: SparseBlockBuffer,
    disk: Option<DiskTier>,
    low_water: u64,
    high_water: u64,
    arena: BackingArena,
}

impl TieredBlockStore {
    /// Store with explicit thresholds, default merge policy and the global arena
    pub fn new(low_water: u64, high_water: u64) -> Result<Self> {
        Self::with_parts(
            SparseBlockBuffer::new(),
            &TierConfig::with_marks(low_water, high_water),
            BackingArena::global(),
        )
    }

    /// Store configured from a full stack configuration
    pub fn from_config(config: &StreamConfig) -> Result<Self> {
        Self::with_parts(
            SparseBlockBuffer::from_config(&config.sparse),
            &config.tiers,
            BackingArena::for_dir(config.tiers.backing_dir.as_deref()),
        )
    }

    /// Store around an empty buffer (whose merge policy is kept) and an arena
    pub fn with_parts(
        buffer: SparseBlockBuffer,
        tiers: &TierConfig,
        arena: BackingArena,
    ) -> Result<Self> {
        tiers.validate()?;
        Ok(TieredBlockStore {
            memory: buffer.empty_like(),
            disk: None,
            low_water: tiers.low_water,
            high_water: tiers.high_water,
            arena,
        })
    }

    pub fn tier(&self) -> Tier {
        match self.disk {
            Some(_) => Tier::Disk,
            None => Tier::Memory,
        }
    }

    pub fn arena(&self) -> &BackingArena {
        &self.arena
    }

    /// Logical length, whichever tier is active
    pub fn length(&self) -> u64 {
        match &self.disk {
            Some(disk) => disk.length,
            None => self.memory.length(),
        }
    }

    /// Bytes of written data held, whichever tier is active
    pub fn buffered_bytes(&self) -> u64 {
        match &self.disk {
            Some(disk) => disk.extents.total(),
            None => self.memory.stored_bytes(),
        }
    }

    /// Written ranges in offset order
    pub fn extents(&self) -> Vec<Extent> {
        match &self.disk {
            Some(disk) => disk.extents.extents().to_vec(),
            None => self.memory.blocks(),
        }
    }

    /// Which leading part of `[offset, offset + len)` was written
    pub fn coverage(&self, offset: u64, len: u64) -> Coverage {
        match &self.disk {
            Some(disk) => disk.extents.coverage(offset, len),
            None => self.memory.coverage(offset, len),
        }
    }

    /// Drop all content, releasing any spill file
    pub fn clear(&mut self) {
        self.disk = None;
        self.memory.clear();
    }

    /// Move between tiers if a threshold has been crossed.
    pub fn check_and_migrate(&mut self) -> Result<()> {
        match &self.disk {
            None if self.memory.memory_consumption() as u64 > self.high_water => self.spill(),
            Some(disk) if disk.length < self.low_water => self.recall(),
            _ => Ok(()),
        }
    }

    fn spill(&mut self) -> Result<()> {
        let length = self.memory.length();
        let position = self.memory.position();

        let mut file = self.arena.allocate()?;
        for (offset, data) in self.memory.block_data() {
            file.seek(SeekFrom::Start(offset))?;
            file.write(data)?;
        }
        file.set_len(length)?;
        file.seek(SeekFrom::Start(position))?;

        info!(
            "Spilled {} bytes ({} blocks) to {}",
            length,
            self.memory.block_count(),
            file.path().display()
        );

        self.disk = Some(DiskTier {
            file,
            extents: ExtentSet::from_extents(self.memory.blocks()),
            length,
        });
        self.memory = self.memory.empty_like();
        Ok(())
    }

    fn recall(&mut self) -> Result<()> {
        let Some(disk) = self.disk.as_mut() else {
            return Ok(());
        };
        let position = disk.file.position();

        let mut memory = self.memory.empty_like();
        for extent in disk.extents.extents() {
            let mut data = vec![0u8; extent.len as usize];
            disk.file.seek(SeekFrom::Start(extent.offset))?;
            let n = disk.file.read_full(&mut data)?;
            data.truncate(n);
            memory.seek(SeekFrom::Start(extent.offset))?;
            memory.write(&data)?;
        }
        memory.set_len(disk.length)?;
        memory.seek(SeekFrom::Start(position))?;

        info!(
            "Recalled {} bytes from {} into memory",
            disk.length,
            disk.file.path().display()
        );

        self.memory = memory;
        self.disk = None;
        Ok(())
    }
}

impl Channel for TieredBlockStore {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.disk.as_mut() {
            Some(disk) => {
                let remaining = disk.length.saturating_sub(disk.file.position());
                let n = (buf.len() as u64).min(remaining) as usize;
                disk.file.read_full(&mut buf[..n])
            }
            None => self.memory.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        match self.disk.as_mut() {
            Some(disk) => {
                let start = disk.file.position();
                disk.file.write(buf)?;
                disk.extents.insert(start, buf.len() as u64);
                disk.length = disk.length.max(start + buf.len() as u64);
            }
            None => self.memory.write(buf)?,
        }
        self.check_and_migrate()
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        match self.disk.as_mut() {
            Some(disk) => disk.file.seek(pos),
            None => self.memory.seek(pos),
        }
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        match self.disk.as_mut() {
            Some(disk) => {
                disk.file.set_len(len)?;
                disk.extents.truncate(len);
                disk.length = len;
            }
            None => self.memory.set_len(len)?,
        }
        self.check_and_migrate()
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(disk) = self.disk.as_mut() {
            disk.file.flush()?;
        }
        self.check_and_migrate()
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.length())
    }

    fn position(&self) -> u64 {
        match &self.disk {
            Some(disk) => disk.file.position(),
            None => self.memory.position(),
        }
    }
}
