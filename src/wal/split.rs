//! Oversized entry handling
//!
//! A single payload larger than `max_log_size` is cut into fragments that
//! share one logical index (`BLOB` frames). A transaction whose events fit
//! individually but not together is chunked into consecutive entries
//! (`LARGE_TRX` frames), each with its own index.

use byteorder::{ByteOrder, LittleEndian};
use bytes::{Bytes, BytesMut};

use super::entry::{EntryFlags, LogEntry, LogIndex};
use crate::config::LogConfig;
use crate::error::{Error, Result};

/// Size of a filler frame body
pub const FILLER_BODY_SIZE: usize = 8;

/// One physical entry frame produced by [`SplitPolicy::plan`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePart {
    pub flag: EntryFlags,
    pub payload: Bytes,
    pub checksum: u32,
    /// A filler frame follows this part
    pub filler_after: bool,
}

/// Filler body: fragment sequence number and total fragment count
pub fn filler_body(part: u32, parts: u32) -> [u8; FILLER_BODY_SIZE] {
    let mut body = [0u8; FILLER_BODY_SIZE];
    LittleEndian::write_u32(&mut body[0..4], part);
    LittleEndian::write_u32(&mut body[4..8], parts);
    body
}

/// Size limits governing how entries are laid out
#[derive(Debug, Clone, Copy)]
pub struct SplitPolicy {
    pub max_log_size: u64,
    pub split_size: u64,
    pub enabled: bool,
    pub checksum: bool,
}

impl SplitPolicy {
    pub fn from_config(config: &LogConfig) -> Self {
        Self {
            max_log_size: config.max_log_size,
            split_size: config.large_event_split_size,
            enabled: config.split_large_events,
            checksum: config.checksum,
        }
    }

    fn crc(&self, bytes: &[u8]) -> u32 {
        if self.checksum {
            crc32fast::hash(bytes)
        } else {
            0
        }
    }

    /// Lay out one logical entry as physical frames
    pub fn plan(&self, flag: EntryFlags, payload: Bytes) -> Result<Vec<FramePart>> {
        let len = payload.len() as u64;
        if len <= self.max_log_size {
            return Ok(vec![FramePart {
                flag,
                checksum: self.crc(&payload),
                payload,
                filler_after: false,
            }]);
        }

        if !self.enabled {
            return Err(Error::LogTooLarge {
                size: len,
                max: self.max_log_size,
            });
        }
        if self.split_size == 0 {
            return Err(Error::Config("large event split size is 0".into()));
        }

        let count = len.div_ceil(self.split_size) as usize;
        let mut parts = Vec::with_capacity(count);
        let base = flag.without(EntryFlags::blob_bits());

        for i in 0..count {
            let start = i * self.split_size as usize;
            let end = (start + self.split_size as usize).min(payload.len());
            let fragment = payload.slice(start..end);
            let last = i + 1 == count;

            let (part_flag, checksum) = if last {
                (base | EntryFlags::BLOB | EntryFlags::BLOB_END, self.crc(&payload))
            } else if i == 0 {
                (base | EntryFlags::BLOB | EntryFlags::BLOB_START, self.crc(&fragment))
            } else {
                (base | EntryFlags::BLOB, self.crc(&fragment))
            };

            parts.push(FramePart {
                flag: part_flag,
                payload: fragment,
                checksum,
                filler_after: !last,
            });
        }

        Ok(parts)
    }

    /// Group transaction events into chunks of at most `max_log_size`.
    ///
    /// A transaction that fits is returned as one chunk with no flags.
    /// Otherwise every chunk is flagged `LARGE_TRX` and the last one also
    /// `LARGE_TRX_END`. An event that is too large on its own gets a chunk of
    /// its own and goes through the blob path when appended.
    pub fn chunk_transaction(&self, events: &[Bytes]) -> Vec<(EntryFlags, Vec<Bytes>)> {
        let total: u64 = events.iter().map(|e| e.len() as u64).sum();
        if total <= self.max_log_size {
            return vec![(EntryFlags::NONE, events.to_vec())];
        }

        let mut chunks: Vec<Vec<Bytes>> = Vec::new();
        let mut current: Vec<Bytes> = Vec::new();
        let mut current_size = 0u64;

        for event in events {
            let size = event.len() as u64;
            if !current.is_empty() && current_size + size > self.max_log_size {
                chunks.push(std::mem::take(&mut current));
                current_size = 0;
            }
            current.push(event.clone());
            current_size += size;
        }
        if !current.is_empty() {
            chunks.push(current);
        }

        let last = chunks.len().saturating_sub(1);
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let flag = if i == last {
                    EntryFlags::LARGE_TRX | EntryFlags::LARGE_TRX_END
                } else {
                    EntryFlags::LARGE_TRX
                };
                (flag, chunk)
            })
            .collect()
    }
}

/// Rebuild one logical entry from its physical entry frames (fillers excluded)
pub fn reassemble(frames: &[LogEntry], verify: bool) -> Result<LogEntry> {
    let first = frames
        .first()
        .ok_or_else(|| Error::Internal("reassemble called without frames".into()))?;

    if frames.len() == 1 && !first.flag.intersects(EntryFlags::blob_bits()) {
        return Ok(first.clone());
    }

    let index = first.index;
    let mut payload = BytesMut::with_capacity(frames.iter().map(|f| f.payload.len()).sum());

    for (i, frame) in frames.iter().enumerate() {
        let last = i + 1 == frames.len();
        let expected = if i == 0 {
            EntryFlags::BLOB | EntryFlags::BLOB_START
        } else if last {
            EntryFlags::BLOB | EntryFlags::BLOB_END
        } else {
            EntryFlags::BLOB
        };
        let observed = frame.flag & EntryFlags::blob_bits();
        if observed != expected || frame.index != index {
            return Err(Error::Internal(format!(
                "fragment {} of index {} has flags {} (index {}), expected {}",
                i, index, frame.flag, frame.index, expected
            )));
        }
        if verify && !last && frame.checksum != crc32fast::hash(&frame.payload) {
            return Err(Error::ChecksumMismatch {
                index,
                stored: frame.checksum,
                computed: crc32fast::hash(&frame.payload),
            });
        }
        payload.extend_from_slice(&frame.payload);
    }

    let payload = payload.freeze();
    let last = &frames[frames.len() - 1];
    if verify {
        let computed = crc32fast::hash(&payload);
        if computed != last.checksum {
            return Err(Error::ChecksumMismatch {
                index,
                stored: last.checksum,
                computed,
            });
        }
    }

    Ok(LogEntry {
        flag: first.flag.without(EntryFlags::blob_bits()),
        term: first.term,
        index,
        checksum: last.checksum,
        payload,
    })
}

/// Convert planned parts into entries with a fixed index, for tests and readers
pub fn parts_to_entries(parts: &[FramePart], term: u64, index: LogIndex) -> Vec<LogEntry> {
    parts
        .iter()
        .map(|p| LogEntry {
            flag: p.flag,
            term,
            index,
            checksum: p.checksum,
            payload: p.payload.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(split: u64) -> SplitPolicy {
        SplitPolicy {
            max_log_size: split,
            split_size: split,
            enabled: true,
            checksum: true,
        }
    }

    fn payload(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i * 31 % 251) as u8).collect::<Vec<u8>>())
    }

    #[test]
    fn test_split_reassemble_property() {
        let split = 64u64;
        let p = policy(split);
        for len in 1..=(10 * split as usize) {
            let data = payload(len);
            let parts = p.plan(EntryFlags::NONE, data.clone()).unwrap();
            let expected_parts = if len as u64 <= split {
                1
            } else {
                (len as u64).div_ceil(split) as usize
            };
            assert_eq!(parts.len(), expected_parts, "len {}", len);

            let entries = parts_to_entries(&parts, 1, 9);
            let rebuilt = reassemble(&entries, true).unwrap();
            assert_eq!(rebuilt.payload, data);
            assert_eq!(rebuilt.checksum, crc32fast::hash(&data));
            assert_eq!(parts.last().unwrap().checksum, crc32fast::hash(&data));
        }
    }

    #[test]
    fn test_exactly_two_splits() {
        let p = SplitPolicy {
            max_log_size: 100,
            split_size: 100,
            enabled: true,
            checksum: true,
        };
        let data = payload(200);
        let parts = p.plan(EntryFlags::NONE, data.clone()).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].flag, EntryFlags::BLOB | EntryFlags::BLOB_START);
        assert_eq!(parts[1].flag, EntryFlags::BLOB | EntryFlags::BLOB_END);
        assert!(parts[0].filler_after);
        assert!(!parts[1].filler_after);
        assert_eq!(parts[0].checksum, crc32fast::hash(&data[..100]));
        assert_eq!(parts[1].checksum, crc32fast::hash(&data));
    }

    #[test]
    fn test_too_large_without_splitting() {
        let p = SplitPolicy {
            max_log_size: 10,
            split_size: 10,
            enabled: false,
            checksum: true,
        };
        let err = p.plan(EntryFlags::NONE, payload(11)).unwrap_err();
        assert!(matches!(err, Error::LogTooLarge { size: 11, max: 10 }));
    }

    #[test]
    fn test_chunk_transaction() {
        let p = policy(100);
        let small: Vec<Bytes> = vec![payload(30), payload(30)];
        let chunks = p.chunk_transaction(&small);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].0.is_empty());

        let events: Vec<Bytes> = (0..7).map(|_| payload(40)).collect();
        let chunks = p.chunk_transaction(&events);
        assert_eq!(chunks.len(), 4);
        assert!(chunks[..3].iter().all(|(f, _)| *f == EntryFlags::LARGE_TRX));
        assert_eq!(chunks[3].0, EntryFlags::LARGE_TRX | EntryFlags::LARGE_TRX_END);
        let total: usize = chunks.iter().map(|(_, c)| c.len()).sum();
        assert_eq!(total, 7);
    }

    #[test]
    fn test_reassemble_detects_bad_fragment() {
        let p = policy(16);
        let parts = p.plan(EntryFlags::NONE, payload(40)).unwrap();
        let mut entries = parts_to_entries(&parts, 1, 3);
        let mut damaged = entries[1].payload.to_vec();
        damaged[0] ^= 1;
        entries[1].payload = Bytes::from(damaged);
        assert!(matches!(
            reassemble(&entries, true),
            Err(Error::ChecksumMismatch { index: 3, .. })
        ));
    }
}
