//! Log Entry Types
//!
//! Defines logical log entries, their flag bits and the on-disk frame
//! header every physical record starts with.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Position of a logical entry in the replicated log
pub type LogIndex = u64;

/// Flag bits carried by every entry frame
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryFlags(pub u32);

impl EntryFlags {
    pub const NONE: EntryFlags = EntryFlags(0);
    /// First entry written to a freshly rotated file
    pub const ROTATE: EntryFlags = EntryFlags(0x1);
    /// Chunk of a transaction spread over several entries
    pub const LARGE_TRX: EntryFlags = EntryFlags(0x2);
    /// Last chunk of a large transaction
    pub const LARGE_TRX_END: EntryFlags = EntryFlags(0x4);
    /// Fragment of an entry split over several frames
    pub const BLOB: EntryFlags = EntryFlags(0x8);
    pub const BLOB_START: EntryFlags = EntryFlags(0x10);
    pub const BLOB_END: EntryFlags = EntryFlags(0x20);
    /// Payload is a membership change
    pub const CONFIG_CHANGE: EntryFlags = EntryFlags(0x40);
    /// Payload is a stream of host events with end offsets and trailers
    pub const EVENTS: EntryFlags = EntryFlags(0x80);

    const NAMES: [(EntryFlags, &'static str); 8] = [
        (Self::ROTATE, "ROTATE"),
        (Self::LARGE_TRX, "LARGE_TRX"),
        (Self::LARGE_TRX_END, "LARGE_TRX_END"),
        (Self::BLOB, "BLOB"),
        (Self::BLOB_START, "BLOB_START"),
        (Self::BLOB_END, "BLOB_END"),
        (Self::CONFIG_CHANGE, "CONFIG_CHANGE"),
        (Self::EVENTS, "EVENTS"),
    ];

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: EntryFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: EntryFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, other: EntryFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: EntryFlags) {
        self.0 &= !other.0;
    }

    pub fn without(self, other: EntryFlags) -> EntryFlags {
        EntryFlags(self.0 & !other.0)
    }

    /// All blob fragment bits
    pub fn blob_bits() -> EntryFlags {
        Self::BLOB | Self::BLOB_START | Self::BLOB_END
    }
}

impl BitOr for EntryFlags {
    type Output = EntryFlags;

    fn bitor(self, rhs: EntryFlags) -> EntryFlags {
        EntryFlags(self.0 | rhs.0)
    }
}

impl BitAnd for EntryFlags {
    type Output = EntryFlags;

    fn bitand(self, rhs: EntryFlags) -> EntryFlags {
        EntryFlags(self.0 & rhs.0)
    }
}

impl BitOrAssign for EntryFlags {
    fn bitor_assign(&mut self, rhs: EntryFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for EntryFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "NONE");
        }
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", names.join("|"))
    }
}

impl fmt::Debug for EntryFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryFlags({})", self)
    }
}

/// A logical log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub flag: EntryFlags,
    pub term: u64,
    /// 0 asks the store to assign the next index
    pub index: LogIndex,
    pub checksum: u32,
    pub payload: Bytes,
}

impl LogEntry {
    /// Create an entry whose index is assigned on append
    pub fn new(term: u64, flag: EntryFlags, payload: impl Into<Bytes>) -> Self {
        Self {
            flag,
            term,
            index: 0,
            checksum: 0,
            payload: payload.into(),
        }
    }

    pub fn with_index(mut self, index: LogIndex) -> Self {
        self.index = index;
        self
    }

    pub fn length(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Chunk of a large transaction that is not the last one
    pub fn is_large_trx_part(&self) -> bool {
        self.flag.contains(EntryFlags::LARGE_TRX) && !self.flag.contains(EntryFlags::LARGE_TRX_END)
    }

    /// Recompute the payload checksum
    pub fn compute_checksum(&self) -> u32 {
        crc32fast::hash(&self.payload)
    }
}

/// Kind of physical record in a log file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameKind {
    /// A (possibly partial) log entry
    Entry = 1,
    /// Marker at the start of every file naming the last index of the previous one
    PreviousIndex = 2,
    /// Padding record written between fragments of a split entry
    Filler = 3,
}

impl TryFrom<u8> for FrameKind {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            1 => Ok(FrameKind::Entry),
            2 => Ok(FrameKind::PreviousIndex),
            3 => Ok(FrameKind::Filler),
            other => Err(other),
        }
    }
}

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 40;

/// Header preceding every physical record
///
/// Layout (little endian): kind u8, 3 reserved bytes, flag u32, term u64,
/// index u64, length u64, checksum u32, header crc u32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub flag: EntryFlags,
    pub term: u64,
    pub index: LogIndex,
    pub length: u64,
    pub checksum: u32,
}

impl FrameHeader {
    pub fn entry(flag: EntryFlags, term: u64, index: LogIndex, length: u64, checksum: u32) -> Self {
        Self {
            kind: FrameKind::Entry,
            flag,
            term,
            index,
            length,
            checksum,
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut bytes = [0u8; FRAME_HEADER_SIZE];
        bytes[0] = self.kind as u8;
        LittleEndian::write_u32(&mut bytes[4..8], self.flag.bits());
        LittleEndian::write_u64(&mut bytes[8..16], self.term);
        LittleEndian::write_u64(&mut bytes[16..24], self.index);
        LittleEndian::write_u64(&mut bytes[24..32], self.length);
        LittleEndian::write_u32(&mut bytes[32..36], self.checksum);
        let header_crc = crc32fast::hash(&bytes[..36]);
        LittleEndian::write_u32(&mut bytes[36..40], header_crc);
        bytes
    }

    /// Parse header from bytes, returning a reason on a damaged header
    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, String> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(format!("frame header too short: {} bytes", bytes.len()));
        }

        let stored = LittleEndian::read_u32(&bytes[36..40]);
        let computed = crc32fast::hash(&bytes[..36]);
        if stored != computed {
            return Err(format!(
                "frame header checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored, computed
            ));
        }

        let kind = FrameKind::try_from(bytes[0])
            .map_err(|k| format!("unknown frame kind {}", k))?;

        Ok(Self {
            kind,
            flag: EntryFlags(LittleEndian::read_u32(&bytes[4..8])),
            term: LittleEndian::read_u64(&bytes[8..16]),
            index: LittleEndian::read_u64(&bytes[16..24]),
            length: LittleEndian::read_u64(&bytes[24..32]),
            checksum: LittleEndian::read_u32(&bytes[32..36]),
        })
    }

    /// Total on-disk size of the frame
    pub fn frame_size(&self) -> u64 {
        FRAME_HEADER_SIZE as u64 + self.length
    }
}

/// Body of a [`FrameKind::PreviousIndex`] frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviousIndexMarker {
    pub prev_index: LogIndex,
    /// Unix timestamp (seconds) when the file was created
    pub timestamp: i64,
}

impl PreviousIndexMarker {
    pub const SIZE: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        LittleEndian::write_u64(&mut bytes[0..8], self.prev_index);
        LittleEndian::write_i64(&mut bytes[8..16], self.timestamp);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::Internal(format!(
                "previous-index marker too short: {} bytes",
                bytes.len()
            )));
        }
        Ok(Self {
            prev_index: LittleEndian::read_u64(&bytes[0..8]),
            timestamp: LittleEndian::read_i64(&bytes[8..16]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_header_layout() {
        let header = FrameHeader::entry(
            EntryFlags::BLOB | EntryFlags::BLOB_START,
            7,
            42,
            1024,
            0xdead_beef,
        );
        let bytes = header.to_bytes();
        assert_eq!(bytes[0], FrameKind::Entry as u8);
        assert_eq!(FrameHeader::from_bytes(&bytes).unwrap(), header);
        assert_eq!(header.frame_size(), 1064);

        let mut damaged = bytes;
        damaged[17] ^= 0xff;
        assert!(FrameHeader::from_bytes(&damaged).is_err());
    }

    #[test]
    fn test_flag_display() {
        assert_eq!((EntryFlags::BLOB | EntryFlags::BLOB_END).to_string(), "BLOB|BLOB_END");
        assert_eq!(EntryFlags::NONE.to_string(), "NONE");
        let mut flags = EntryFlags::LARGE_TRX;
        flags |= EntryFlags::LARGE_TRX_END;
        assert!(flags.contains(EntryFlags::LARGE_TRX_END));
        assert!(!flags.intersects(EntryFlags::blob_bits()));
    }
}
