//! Log File Management
//!
//! Each log file starts with a fixed header followed by a previous-index
//! marker frame naming the last index stored in the preceding file.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};

use super::entry::{FrameHeader, FrameKind, EntryFlags, LogIndex, PreviousIndexMarker, FRAME_HEADER_SIZE};
use crate::error::{Error, Result};

/// Magic bytes at the start of each log file
const FILE_MAGIC: &[u8; 8] = b"CONSLOG\0";

/// Log file version
const FILE_VERSION: u32 = 1;

/// File header size in bytes
pub const FILE_HEADER_SIZE: usize = 16;

/// Offset of the first entry frame in every file
pub const DATA_START: u64 =
    (FILE_HEADER_SIZE + FRAME_HEADER_SIZE + PreviousIndexMarker::SIZE) as u64;

/// File name for log file number `file_no`
pub fn file_name(basename: &str, file_no: u64) -> String {
    format!("{}.{:06}", basename, file_no)
}

/// Extract the file number from a log file name
pub fn parse_file_no(basename: &str, name: &str) -> Option<u64> {
    let suffix = name.strip_prefix(basename)?.strip_prefix('.')?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// List all log files in a directory, ordered by file number
pub fn list_log_files(dir: &Path, basename: &str) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut files = Vec::new();

    if !dir.exists() {
        return Ok(files);
    }

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(file_no) = parse_file_no(basename, name) {
            files.push((file_no, path));
        }
    }

    files.sort_by_key(|(no, _)| *no);
    Ok(files)
}

fn file_header_bytes() -> [u8; FILE_HEADER_SIZE] {
    let mut bytes = [0u8; FILE_HEADER_SIZE];
    bytes[0..8].copy_from_slice(FILE_MAGIC);
    LittleEndian::write_u32(&mut bytes[8..12], FILE_VERSION);
    bytes
}

/// Validate the file header and read the previous-index marker
pub fn read_file_start<R: Read>(reader: &mut R, path: &Path) -> Result<PreviousIndexMarker> {
    let corrupted = |offset: u64, reason: String| Error::Corrupted {
        file: path.to_path_buf(),
        offset,
        reason,
    };

    let mut header = [0u8; FILE_HEADER_SIZE];
    reader
        .read_exact(&mut header)
        .map_err(|e| corrupted(0, format!("unreadable file header: {}", e)))?;
    if &header[0..8] != FILE_MAGIC {
        return Err(corrupted(0, "invalid magic bytes".into()));
    }
    let version = LittleEndian::read_u32(&header[8..12]);
    if version != FILE_VERSION {
        return Err(corrupted(0, format!("unsupported log file version {}", version)));
    }

    let mut frame = [0u8; FRAME_HEADER_SIZE];
    reader
        .read_exact(&mut frame)
        .map_err(|e| corrupted(FILE_HEADER_SIZE as u64, format!("unreadable marker: {}", e)))?;
    let frame = FrameHeader::from_bytes(&frame).map_err(|r| corrupted(FILE_HEADER_SIZE as u64, r))?;
    if frame.kind != FrameKind::PreviousIndex || frame.length != PreviousIndexMarker::SIZE as u64 {
        return Err(corrupted(
            FILE_HEADER_SIZE as u64,
            format!("expected previous-index marker, found {:?}", frame.kind),
        ));
    }

    let mut body = [0u8; PreviousIndexMarker::SIZE];
    reader
        .read_exact(&mut body)
        .map_err(|e| corrupted(FILE_HEADER_SIZE as u64, format!("unreadable marker body: {}", e)))?;
    if crc32fast::hash(&body) != frame.checksum {
        return Err(corrupted(FILE_HEADER_SIZE as u64, "marker checksum mismatch".into()));
    }
    PreviousIndexMarker::from_bytes(&body)
}

/// A log file open for appending
pub struct LogFile {
    pub file_no: u64,
    pub path: PathBuf,
    file: File,
    size: u64,
    marker: PreviousIndexMarker,
}

impl LogFile {
    /// Create a new log file whose first entry will be `prev_index + 1`
    pub fn create(dir: &Path, basename: &str, file_no: u64, prev_index: LogIndex) -> Result<Self> {
        let path = dir.join(file_name(basename, file_no));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::durability("create log file", e))?;

        let marker = PreviousIndexMarker {
            prev_index,
            timestamp: chrono::Utc::now().timestamp(),
        };
        let body = marker.to_bytes();
        let frame = FrameHeader {
            kind: FrameKind::PreviousIndex,
            flag: EntryFlags::NONE,
            term: 0,
            index: prev_index,
            length: body.len() as u64,
            checksum: crc32fast::hash(&body),
        };

        let mut buf = Vec::with_capacity(DATA_START as usize);
        buf.extend_from_slice(&file_header_bytes());
        buf.extend_from_slice(&frame.to_bytes());
        buf.extend_from_slice(&body);
        file.write_all(&buf)
            .map_err(|e| Error::durability("write log file header", e))?;
        file.sync_all()
            .map_err(|e| Error::durability("fsync log file header", e))?;

        Ok(Self {
            file_no,
            path,
            file,
            size: DATA_START,
            marker,
        })
    }

    /// Open an existing log file for appending at `size`
    pub fn open(path: PathBuf, file_no: u64, size: u64) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let marker = read_file_start(&mut file, &path)?;
        file.seek(SeekFrom::Start(size))?;

        Ok(Self {
            file_no,
            path,
            file,
            size,
            marker,
        })
    }

    /// Write one frame, returning its offset
    pub fn append_frame(&mut self, header: &FrameHeader, body: &[u8]) -> Result<u64> {
        let offset = self.size;
        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
        buf.extend_from_slice(&header.to_bytes());
        buf.extend_from_slice(body);

        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(&buf))
            .map_err(|e| Error::durability("append frame", e))?;

        self.size += buf.len() as u64;
        Ok(offset)
    }

    /// Flush written frames to stable storage
    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| Error::durability("fsync log file", e))
    }

    /// Cut the file at `offset`
    pub fn truncate(&mut self, offset: u64) -> Result<()> {
        if offset < DATA_START {
            return Err(Error::Internal(format!(
                "refusing to truncate {:?} inside its header (offset {})",
                self.path, offset
            )));
        }
        self.file
            .set_len(offset)
            .and_then(|_| self.file.sync_all())
            .map_err(|e| Error::durability("truncate log file", e))?;
        self.size = offset;
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn prev_index(&self) -> LogIndex {
        self.marker.prev_index
    }

    pub fn timestamp(&self) -> i64 {
        self.marker.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;
    use tempfile::tempdir;

    #[test]
    fn test_file_names() {
        assert_eq!(file_name("consensus-log", 7), "consensus-log.000007");
        assert_eq!(parse_file_no("consensus-log", "consensus-log.000007"), Some(7));
        assert_eq!(parse_file_no("consensus-log", "consensus-log.index"), None);
        assert_eq!(parse_file_no("consensus-log", "other.000001"), None);
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = tempdir().unwrap();
        let mut log = LogFile::create(dir.path(), "test", 1, 41).unwrap();
        assert_eq!(log.size(), DATA_START);

        let body = b"hello";
        let header = FrameHeader::entry(EntryFlags::NONE, 1, 42, body.len() as u64, crc32fast::hash(body));
        let offset = log.append_frame(&header, body).unwrap();
        assert_eq!(offset, DATA_START);
        log.sync().unwrap();

        let mut reader = BufReader::new(File::open(&log.path).unwrap());
        let marker = read_file_start(&mut reader, &log.path).unwrap();
        assert_eq!(marker.prev_index, 41);

        let reopened = LogFile::open(log.path.clone(), 1, log.size()).unwrap();
        assert_eq!(reopened.prev_index(), 41);

        let files = list_log_files(dir.path(), "test").unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].0, 1);
    }

    #[test]
    fn test_bad_magic_is_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.000001");
        std::fs::write(&path, [0u8; 80]).unwrap();
        let mut file = File::open(&path).unwrap();
        let err = read_file_start(&mut file, &path).unwrap_err();
        assert!(err.is_corruption());
    }
}
