//! Version-gated channel
//!
//! [`VersionedChannel`] prefixes its inner channel with a [`VersionRecord`]
//! and checks it before letting data through. Reads need the stream's reader
//! version to be no newer than the code's; writes need the same of the updater
//! version. The record is parsed lazily on first use and written only when the
//! first mutation reaches an empty channel.

use crate::core::channel::{resolve_seek, Channel};
use crate::core::error::{Result, StreamError};
use crate::core::header::VersionRecord;
use std::io::SeekFrom;
use tracing::debug;

/// Channel whose payload follows a version record
pub struct VersionedChannel<C: Channel> {
    inner: C,
    code: VersionRecord,
    file: Option<VersionRecord>,
    parsed: bool,
    data_offset: u64,
    position: u64,
}

impl<C: Channel> VersionedChannel<C> {
    /// Wrap `inner`; `code` describes what this code can handle
    pub fn new(inner: C, code: VersionRecord) -> Self {
        let data_offset = code.encoded_len() as u64;
        VersionedChannel {
            inner,
            code,
            file: None,
            parsed: false,
            data_offset,
            position: 0,
        }
    }

    /// Record persisted in the stream, if any
    pub fn file_version(&mut self) -> Result<Option<&VersionRecord>> {
        self.ensure_parsed()?;
        Ok(self.file.as_ref())
    }

    pub fn code_version(&self) -> &VersionRecord {
        &self.code
    }

    pub fn get_ref(&self) -> &C {
        &self.inner
    }

    pub fn into_inner(self) -> C {
        self.inner
    }

    fn ensure_parsed(&mut self) -> Result<()> {
        if self.parsed {
            return Ok(());
        }

        if self.inner.len()? > 0 {
            let record = VersionRecord::read_from(&mut self.inner)?;
            if record.feature_id != self.code.feature_id {
                return Err(StreamError::Corrupt(format!(
                    "stream belongs to feature '{}', expected '{}'",
                    record.feature_id, self.code.feature_id
                )));
            }
            debug!(
                "Parsed version record for {}: reader {}, updater {}, writer {}",
                record.feature_id, record.reader, record.updater, record.writer
            );
            self.data_offset = record.encoded_len() as u64;
            self.file = Some(record);
        }

        self.parsed = true;
        Ok(())
    }

    /// Whether payload may be read; `false` when the stream is still empty.
    fn read_attempt(&mut self) -> Result<bool> {
        self.ensure_parsed()?;

        match &self.file {
            None => Ok(false),
            Some(file) if file.reader > self.code.reader => Err(StreamError::IncompatibleVersion {
                feature: file.feature_id.clone(),
                found: file.reader,
                supported: self.code.reader,
            }),
            Some(_) => Ok(true),
        }
    }

    fn write_attempt(&mut self) -> Result<()> {
        self.ensure_parsed()?;

        if self.file.is_none() {
            self.code.write_to(&mut self.inner)?;
            debug!(
                "Wrote version record for {} (updater {})",
                self.code.feature_id, self.code.updater
            );
            self.data_offset = self.code.encoded_len() as u64;
            self.file = Some(self.code.clone());
            return Ok(());
        }
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };

        if file.updater > self.code.updater {
            return Err(StreamError::IncompatibleVersion {
                feature: file.feature_id.clone(),
                found: file.updater,
                supported: self.code.updater,
            });
        }

        if file.updater < self.code.updater {
            self.inner
                .seek(SeekFrom::Start(file.updater_offset() as u64))?;
            self.inner.write(&self.code.updater.to_bytes())?;
            debug!(
                "Raised updater version of {} from {} to {}",
                file.feature_id, file.updater, self.code.updater
            );
            file.updater = self.code.updater;
        }
        Ok(())
    }
}

impl<C: Channel> Channel for VersionedChannel<C> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.read_attempt()? {
            return Ok(0);
        }
        self.inner
            .seek(SeekFrom::Start(self.data_offset + self.position))?;
        let n = self.inner.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.write_attempt()?;
        self.inner
            .seek(SeekFrom::Start(self.data_offset + self.position))?;
        self.inner.write(buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let len = match pos {
            SeekFrom::End(_) => self.len()?,
            _ => 0,
        };
        self.position = resolve_seek(pos, self.position, len)?;
        Ok(self.position)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.write_attempt()?;
        self.inner.set_len(self.data_offset + len)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }

    fn len(&mut self) -> Result<u64> {
        self.ensure_parsed()?;
        if self.file.is_none() {
            return Ok(0);
        }
        Ok(self.inner.len()?.saturating_sub(self.data_offset))
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn can_read(&self) -> bool {
        self.inner.can_read()
    }

    fn can_write(&self) -> bool {
        self.inner.can_write()
    }

    fn can_seek(&self) -> bool {
        self.inner.can_seek()
    }
}
