//! Version record format
//!
//! Every versioned channel begins with a small record naming the feature that
//! owns the stream and the minimum code versions needed to read or update it.
//!
//! Layout (all fields little-endian):
//! - Bytes 0-3: total record length in bytes, this field included (i32)
//! - Bytes 4-7: byte length of the feature id (i32)
//! - Feature id as UTF-16LE, zero-padded to a multiple of 4 bytes
//! - Reader major, reader minor (i16 each, never negative)
//! - Updater major, updater minor (i16 each, never negative)
//! - Writer major, writer minor (i16 each, never negative)

use crate::core::channel::Channel;
use crate::core::error::{Result, StreamError};
use std::fmt;
use std::io::SeekFrom;

/// Size of the fixed fields around the feature id
const FIXED_SIZE: usize = 8 + 12;

/// Largest record accepted when decoding
pub const MAX_RECORD_SIZE: usize = 4096;

/// Version number compared major first, then minor
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VersionPair {
    pub major: i16,
    pub minor: i16,
}

impl VersionPair {
    pub const fn new(major: i16, minor: i16) -> Self {
        VersionPair { major, minor }
    }

    /// Both components are non-negative
    pub fn is_valid(&self) -> bool {
        self.major >= 0 && self.minor >= 0
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        let mut bytes = [0u8; 4];
        bytes[0..2].copy_from_slice(&self.major.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.minor.to_le_bytes());
        bytes
    }

    fn from_bytes(bytes: &[u8], role: &str) -> Result<Self> {
        let pair = VersionPair {
            major: i16::from_le_bytes([bytes[0], bytes[1]]),
            minor: i16::from_le_bytes([bytes[2], bytes[3]]),
        };
        if !pair.is_valid() {
            return Err(StreamError::Corrupt(format!(
                "negative {} version {}",
                role, pair
            )));
        }
        Ok(pair)
    }
}

impl fmt::Display for VersionPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Persisted version header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRecord {
    /// Name of the feature that owns the stream
    pub feature_id: String,

    /// Minimum version able to read the stream
    pub reader: VersionPair,

    /// Minimum version allowed to modify the stream
    pub updater: VersionPair,

    /// Version of the code that created the stream
    pub writer: VersionPair,
}

fn padded(len: usize) -> usize {
    (len + 3) & !3
}

impl VersionRecord {
    /// Record with the same version for all three roles
    pub fn new(feature_id: impl Into<String>, version: VersionPair) -> Self {
        Self::with_versions(feature_id, version, version, version)
    }

    pub fn with_versions(
        feature_id: impl Into<String>,
        reader: VersionPair,
        updater: VersionPair,
        writer: VersionPair,
    ) -> Self {
        VersionRecord {
            feature_id: feature_id.into(),
            reader,
            updater,
            writer,
        }
    }

    fn feature_bytes(&self) -> Vec<u8> {
        self.feature_id
            .encode_utf16()
            .flat_map(|unit| unit.to_le_bytes())
            .collect()
    }

    /// Encoded size in bytes
    pub fn encoded_len(&self) -> usize {
        FIXED_SIZE + padded(self.feature_id.encode_utf16().count() * 2)
    }

    /// Offset of the updater pair within the encoded record
    pub fn updater_offset(&self) -> usize {
        self.encoded_len() - 8
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let feature = self.feature_bytes();
        let total = self.encoded_len();

        let mut bytes = Vec::with_capacity(total);
        bytes.extend_from_slice(&(total as i32).to_le_bytes());
        bytes.extend_from_slice(&(feature.len() as i32).to_le_bytes());
        bytes.extend_from_slice(&feature);
        bytes.resize(8 + padded(feature.len()), 0);
        bytes.extend_from_slice(&self.reader.to_bytes());
        bytes.extend_from_slice(&self.updater.to_bytes());
        bytes.extend_from_slice(&self.writer.to_bytes());
        bytes
    }

    /// Read the declared total length from the first four bytes
    pub fn declared_len(prefix: &[u8]) -> Result<usize> {
        if prefix.len() < 4 {
            return Err(StreamError::Corrupt(format!(
                "version record prefix needs 4 bytes, got {}",
                prefix.len()
            )));
        }
        let total = i32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
        if total < FIXED_SIZE as i32 || total as usize > MAX_RECORD_SIZE {
            return Err(StreamError::Corrupt(format!(
                "version record length {} outside {}..={}",
                total, FIXED_SIZE, MAX_RECORD_SIZE
            )));
        }
        Ok(total as usize)
    }

    /// Decode a complete record
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let total = Self::declared_len(data)?;
        if data.len() < total {
            return Err(StreamError::Corrupt(format!(
                "version record truncated: {} of {} bytes",
                data.len(),
                total
            )));
        }

        let feature_len = i32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        if feature_len < 0 || feature_len % 2 != 0 {
            return Err(StreamError::Corrupt(format!(
                "invalid feature id length {}",
                feature_len
            )));
        }
        let feature_len = feature_len as usize;
        if FIXED_SIZE + padded(feature_len) != total {
            return Err(StreamError::Corrupt(format!(
                "feature id of {} bytes does not fit a {}-byte record",
                feature_len, total
            )));
        }

        let units: Vec<u16> = data[8..8 + feature_len]
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let feature_id = String::from_utf16(&units)
            .map_err(|_| StreamError::Corrupt("feature id is not valid UTF-16".to_string()))?;

        let versions = &data[total - 12..total];
        Ok(VersionRecord {
            feature_id,
            reader: VersionPair::from_bytes(&versions[0..4], "reader")?,
            updater: VersionPair::from_bytes(&versions[4..8], "updater")?,
            writer: VersionPair::from_bytes(&versions[8..12], "writer")?,
        })
    }

    /// Decode the record at the start of a channel
    pub fn read_from<C: Channel + ?Sized>(channel: &mut C) -> Result<Self> {
        channel.seek(SeekFrom::Start(0))?;

        let mut prefix = [0u8; 4];
        if channel.read_full(&mut prefix)? < prefix.len() {
            return Err(StreamError::Corrupt(
                "channel too short for a version record".to_string(),
            ));
        }
        let total = Self::declared_len(&prefix)?;

        let mut data = vec![0u8; total];
        data[..4].copy_from_slice(&prefix);
        let n = channel.read_full(&mut data[4..])?;
        if n < total - 4 {
            return Err(StreamError::Corrupt(format!(
                "version record truncated: {} of {} bytes",
                n + 4,
                total
            )));
        }
        Self::from_bytes(&data)
    }

    /// Fail with `InvalidArgument` if any version component is negative
    pub fn validate(&self) -> Result<()> {
        for (role, pair) in [
            ("reader", self.reader),
            ("updater", self.updater),
            ("writer", self.writer),
        ] {
            if !pair.is_valid() {
                return Err(StreamError::InvalidArgument(format!(
                    "{} version {} of feature {} is negative",
                    role, pair, self.feature_id
                )));
            }
        }
        Ok(())
    }

    /// Write the record at the start of a channel
    pub fn write_to<C: Channel + ?Sized>(&self, channel: &mut C) -> Result<()> {
        self.validate()?;
        channel.seek(SeekFrom::Start(0))?;
        channel.write(&self.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::channel::MemoryChannel;

    #[test]
    fn test_version_ordering() {
        assert!(VersionPair::new(1, 0) > VersionPair::new(0, 5));
        assert!(VersionPair::new(1, 2) > VersionPair::new(1, 1));
        assert!(VersionPair::new(0, 9) < VersionPair::new(1, 0));
        assert_eq!(VersionPair::new(2, 3).to_string(), "2.3");
    }

    #[test]
    fn test_layout_is_bit_exact() {
        let record = VersionRecord::with_versions(
            "abc",
            VersionPair::new(1, 0),
            VersionPair::new(1, 2),
            VersionPair::new(3, 4),
        );
        let bytes = record.to_bytes();

        // 6 bytes of UTF-16 padded to 8
        assert_eq!(bytes.len(), 28);
        assert_eq!(record.encoded_len(), 28);
        assert_eq!(&bytes[0..4], &28i32.to_le_bytes());
        assert_eq!(&bytes[4..8], &6i32.to_le_bytes());
        assert_eq!(&bytes[8..14], &[b'a', 0, b'b', 0, b'c', 0]);
        assert_eq!(&bytes[14..16], &[0, 0]);
        assert_eq!(&bytes[16..20], &[1, 0, 0, 0]);
        assert_eq!(&bytes[20..24], &[1, 0, 2, 0]);
        assert_eq!(&bytes[24..28], &[3, 0, 4, 0]);
        assert_eq!(record.updater_offset(), 20);
    }

    #[test]
    fn test_decode_matches_encode() {
        let record = VersionRecord::new("Microsoft.Metadata.DRMTransform", VersionPair::new(1, 0));
        let decoded = VersionRecord::from_bytes(&record.to_bytes()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_empty_feature_id() {
        let record = VersionRecord::new("", VersionPair::new(0, 1));
        assert_eq!(record.encoded_len(), 20);
        assert_eq!(VersionRecord::from_bytes(&record.to_bytes()).unwrap(), record);
    }

    #[test]
    fn test_truncated_record_is_corrupt() {
        let bytes = VersionRecord::new("feature", VersionPair::new(1, 0)).to_bytes();
        assert!(matches!(
            VersionRecord::from_bytes(&bytes[..bytes.len() - 1]),
            Err(StreamError::Corrupt(_))
        ));
        assert!(matches!(
            VersionRecord::from_bytes(&bytes[..3]),
            Err(StreamError::Corrupt(_))
        ));
    }

    #[test]
    fn test_inconsistent_lengths_are_corrupt() {
        let mut bytes = VersionRecord::new("feature", VersionPair::new(1, 0)).to_bytes();
        bytes[4..8].copy_from_slice(&40i32.to_le_bytes());
        assert!(matches!(
            VersionRecord::from_bytes(&bytes),
            Err(StreamError::Corrupt(_))
        ));

        let mut bytes = VersionRecord::new("feature", VersionPair::new(1, 0)).to_bytes();
        bytes[0..4].copy_from_slice(&(-1i32).to_le_bytes());
        assert!(matches!(
            VersionRecord::from_bytes(&bytes),
            Err(StreamError::Corrupt(_))
        ));
    }

    #[test]
    fn test_negative_version_is_corrupt() {
        let record = VersionRecord::new("feature", VersionPair::new(1, 0));
        let reader_at = record.encoded_len() - 12;

        let mut bytes = record.to_bytes();
        bytes[reader_at..reader_at + 2].copy_from_slice(&(-1i16).to_le_bytes());
        assert!(matches!(
            VersionRecord::from_bytes(&bytes),
            Err(StreamError::Corrupt(_))
        ));

        let mut bytes = record.to_bytes();
        let writer_minor = record.encoded_len() - 2;
        bytes[writer_minor..].copy_from_slice(&0x8000u16.to_le_bytes());
        assert!(matches!(
            VersionRecord::from_bytes(&bytes),
            Err(StreamError::Corrupt(_))
        ));
    }

    #[test]
    fn test_negative_version_is_not_written() {
        let record = VersionRecord::with_versions(
            "feature",
            VersionPair::new(1, 0),
            VersionPair::new(1, -2),
            VersionPair::new(1, 0),
        );
        let mut channel = MemoryChannel::new();
        assert!(matches!(
            record.write_to(&mut channel),
            Err(StreamError::InvalidArgument(_))
        ));
        assert_eq!(channel.len().unwrap(), 0);
    }

    #[test]
    fn test_largest_version_survives() {
        let record = VersionRecord::new("feature", VersionPair::new(i16::MAX, i16::MAX));
        let decoded = VersionRecord::from_bytes(&record.to_bytes()).unwrap();
        assert_eq!(decoded.reader, VersionPair::new(32767, 32767));
    }

    #[test]
    fn test_channel_round_trip() {
        let record = VersionRecord::new("part", VersionPair::new(2, 1));
        let mut channel = MemoryChannel::new();
        record.write_to(&mut channel).unwrap();
        channel.write(b"payload").unwrap();

        assert_eq!(VersionRecord::read_from(&mut channel).unwrap(), record);
        assert_eq!(channel.position(), record.encoded_len() as u64);
    }
}
