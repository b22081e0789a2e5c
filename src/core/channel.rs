//! Seekable byte channels
//!
//! Every layer in this crate reads and writes through [`Channel`]. The trait is
//! deliberately small: positional read/write, seek, resize and flush, plus the
//! capability flags overlays use to decide what they may do with a base channel.

use crate::core::error::{Result, StreamError};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Seekable, resizable byte channel
pub trait Channel {
    /// Read up to `buf.len()` bytes at the current position.
    ///
    /// Returns 0 only at end of data.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write all of `buf` at the current position, extending the channel if needed.
    fn write(&mut self, buf: &[u8]) -> Result<()>;

    /// Move the position. Seeking past the end is allowed.
    fn seek(&mut self, pos: SeekFrom) -> Result<u64>;

    /// Truncate or extend the channel. Extension reads back as zeros.
    fn set_len(&mut self, len: u64) -> Result<()>;

    /// Push pending state down to the layer below.
    fn flush(&mut self) -> Result<()>;

    /// Logical length in bytes
    fn len(&mut self) -> Result<u64>;

    /// Current position
    fn position(&self) -> u64;

    fn can_read(&self) -> bool {
        true
    }

    fn can_write(&self) -> bool {
        true
    }

    fn can_seek(&self) -> bool {
        true
    }

    fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Read until `buf` is full or the channel is exhausted.
    fn read_full(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    fn rewind(&mut self) -> Result<()> {
        self.seek(SeekFrom::Start(0))?;
        Ok(())
    }
}

impl<C: Channel + ?Sized> Channel for Box<C> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        (**self).write(buf)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        (**self).seek(pos)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        (**self).set_len(len)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn len(&mut self) -> Result<u64> {
        (**self).len()
    }

    fn position(&self) -> u64 {
        (**self).position()
    }

    fn can_read(&self) -> bool {
        (**self).can_read()
    }

    fn can_write(&self) -> bool {
        (**self).can_write()
    }

    fn can_seek(&self) -> bool {
        (**self).can_seek()
    }
}

impl<C: Channel + ?Sized> Channel for &mut C {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        (**self).write(buf)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        (**self).seek(pos)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        (**self).set_len(len)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn len(&mut self) -> Result<u64> {
        (**self).len()
    }

    fn position(&self) -> u64 {
        (**self).position()
    }

    fn can_read(&self) -> bool {
        (**self).can_read()
    }

    fn can_write(&self) -> bool {
        (**self).can_write()
    }

    fn can_seek(&self) -> bool {
        (**self).can_seek()
    }
}

/// Resolve a seek request against the current position and length.
///
/// Positions before byte 0 are rejected.
pub(crate) fn resolve_seek(pos: SeekFrom, current: u64, len: u64) -> Result<u64> {
    let (base, delta) = match pos {
        SeekFrom::Start(offset) => return Ok(offset),
        SeekFrom::Current(delta) => (current, delta),
        SeekFrom::End(delta) => (len, delta),
    };

    base.checked_add_signed(delta).ok_or_else(|| {
        StreamError::InvalidArgument(format!(
            "seek to {} + {} is outside the addressable range",
            base, delta
        ))
    })
}

/// Disk-backed channel over a [`File`]
#[derive(Debug)]
pub struct FileChannel {
    file: File,
    path: PathBuf,
    position: u64,
    writable: bool,
}

impl FileChannel {
    /// Create (or truncate) a file
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        Ok(Self::from_file(file, path.as_ref().to_path_buf(), true))
    }

    /// Open an existing file for reading and writing
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Self::from_file(file, path.as_ref().to_path_buf(), true))
    }

    /// Open an existing file without write access
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(&path)?;
        Ok(Self::from_file(file, path.as_ref().to_path_buf(), false))
    }

    pub(crate) fn from_file(file: File, path: PathBuf, writable: bool) -> Self {
        FileChannel {
            file,
            path,
            position: 0,
            writable,
        }
    }

    /// Get file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sync all writes to disk
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

impl Channel for FileChannel {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.file.seek(SeekFrom::Start(self.position))?;
        let n = loop {
            match self.file.read(buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        self.position += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(StreamError::Unsupported(format!(
                "{} was opened read-only",
                self.path.display()
            )));
        }
        self.file.seek(SeekFrom::Start(self.position))?;
        self.file.write_all(buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let len = self.file.metadata()?.len();
        self.position = resolve_seek(pos, self.position, len)?;
        Ok(self.position)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        if !self.writable {
            return Err(StreamError::Unsupported(format!(
                "{} was opened read-only",
                self.path.display()
            )));
        }
        self.file.set_len(len)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn can_write(&self) -> bool {
        self.writable
    }
}

/// In-memory channel over a contiguous `Vec<u8>`
#[derive(Debug, Clone, Default)]
pub struct MemoryChannel {
    data: Vec<u8>,
    position: u64,
    read_only: bool,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        MemoryChannel {
            data,
            position: 0,
            read_only: false,
        }
    }

    /// Wrap bytes that may be read but not modified
    pub fn read_only(data: Vec<u8>) -> Self {
        MemoryChannel {
            data,
            position: 0,
            read_only: true,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(StreamError::Unsupported(
                "memory channel is read-only".to_string(),
            ));
        }
        Ok(())
    }
}

impl Channel for MemoryChannel {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let len = self.data.len() as u64;
        if self.position >= len {
            return Ok(0);
        }
        let start = self.position as usize;
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.position += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.check_writable()?;
        let start = usize::try_from(self.position).map_err(|_| {
            StreamError::InvalidArgument(format!("position {} exceeds memory", self.position))
        })?;
        let end = start + buf.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(buf);
        self.position = end as u64;
        Ok(())
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.position = resolve_seek(pos, self.position, self.data.len() as u64)?;
        Ok(self.position)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.check_writable()?;
        let len = usize::try_from(len)
            .map_err(|_| StreamError::InvalidArgument(format!("length {} exceeds memory", len)))?;
        self.data.resize(len, 0);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn len(&mut self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn can_write(&self) -> bool {
        !self.read_only
    }
}
