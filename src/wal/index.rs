//! File Index
//!
//! Maps log files to the index range they hold and keeps a sparse
//! `index -> offset` map per file that is refined whenever a lookup has to
//! scan forward.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::trace;

use super::entry::LogIndex;
use super::segment::DATA_START;

/// Record every n-th appended index in the position map
pub const POSITION_STRIDE: u64 = 32;

/// One log file in the index
#[derive(Debug, Clone)]
pub struct FileIndexEntry {
    pub file_no: u64,
    pub file_name: String,
    pub path: PathBuf,
    /// Last index of the preceding file, from the file's marker
    pub prev_index: LogIndex,
    /// Creation time (unix seconds)
    pub timestamp: i64,
    /// Last index stored in this file; equals `prev_index` while empty
    pub last_index: LogIndex,
    /// Bytes of complete entries in the file
    pub size: u64,
    positions: BTreeMap<LogIndex, u64>,
}

impl FileIndexEntry {
    pub fn new(file_no: u64, file_name: String, path: PathBuf, prev_index: LogIndex, timestamp: i64) -> Self {
        Self {
            file_no,
            file_name,
            path,
            prev_index,
            timestamp,
            last_index: prev_index,
            size: DATA_START,
            positions: BTreeMap::new(),
        }
    }

    /// First index this file holds (or will hold)
    pub fn start_index(&self) -> LogIndex {
        self.prev_index + 1
    }

    pub fn is_empty(&self) -> bool {
        self.last_index == self.prev_index
    }

    pub fn contains(&self, index: LogIndex) -> bool {
        index > self.prev_index && index <= self.last_index
    }

    pub fn record_position(&mut self, index: LogIndex, offset: u64) {
        self.positions.insert(index, offset);
    }

    /// Closest known position at or before `index`
    pub fn nearest_position(&self, index: LogIndex) -> (LogIndex, u64) {
        self.positions
            .range(..=index)
            .next_back()
            .map(|(i, o)| (*i, *o))
            .unwrap_or((self.start_index(), DATA_START))
    }

    pub fn known_position(&self, index: LogIndex) -> Option<u64> {
        self.positions.get(&index).copied()
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    /// Forget everything from `index` on after the file was cut at `offset`
    pub fn truncate_from(&mut self, index: LogIndex, offset: u64) {
        self.positions.split_off(&index);
        self.last_index = index.saturating_sub(1).max(self.prev_index);
        self.size = offset;
    }
}

/// Summary of one log file for introspection
#[derive(Debug, Clone, Serialize)]
pub struct LogFileInfo {
    pub file_name: String,
    pub size: u64,
    pub first_index: LogIndex,
    pub last_index: LogIndex,
    pub timestamp: i64,
}

/// Ordered set of log files
#[derive(Debug, Default)]
pub struct FileIndex {
    files: Vec<FileIndexEntry>,
}

/// File index shared by the writer and every reader
pub type SharedFileIndex = Arc<RwLock<FileIndex>>;

impl FileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: FileIndexEntry) {
        self.files.push(entry);
    }

    pub fn files(&self) -> &[FileIndexEntry] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn first(&self) -> Option<&FileIndexEntry> {
        self.files.first()
    }

    pub fn last(&self) -> Option<&FileIndexEntry> {
        self.files.last()
    }

    pub fn last_mut(&mut self) -> Option<&mut FileIndexEntry> {
        self.files.last_mut()
    }

    pub fn get(&self, file_no: u64) -> Option<&FileIndexEntry> {
        self.files.iter().find(|f| f.file_no == file_no)
    }

    pub fn get_mut(&mut self, file_no: u64) -> Option<&mut FileIndexEntry> {
        self.files.iter_mut().find(|f| f.file_no == file_no)
    }

    pub fn by_name(&self, file_name: &str) -> Option<&FileIndexEntry> {
        self.files.iter().find(|f| f.file_name == file_name)
    }

    /// The file following `file_no`
    pub fn next_after(&self, file_no: u64) -> Option<&FileIndexEntry> {
        self.files.iter().find(|f| f.file_no > file_no)
    }

    /// First index still present in the log
    pub fn first_index(&self) -> LogIndex {
        self.files.first().map(|f| f.start_index()).unwrap_or(1)
    }

    /// Last index present in the log (0 when empty)
    pub fn last_index(&self) -> LogIndex {
        self.files.last().map(|f| f.last_index).unwrap_or(0)
    }

    /// File holding `index`. The next index to be appended resolves to the tail file.
    pub fn find_for_index(&self, index: LogIndex) -> Option<&FileIndexEntry> {
        let last = self.files.len().checked_sub(1)?;
        self.files.iter().enumerate().rev().find_map(|(i, f)| {
            if f.contains(index) || (i == last && index == f.last_index + 1) {
                Some(f)
            } else {
                None
            }
        })
    }

    /// Record an offset if it falls on the sampling stride or starts a file
    pub fn note_append(&mut self, file_no: u64, index: LogIndex, offset: u64) {
        if let Some(file) = self.get_mut(file_no) {
            if index == file.start_index() || index % POSITION_STRIDE == 0 {
                file.record_position(index, offset);
            }
            file.last_index = index;
        }
    }

    /// Remember an offset learned by scanning
    pub fn refine(&mut self, file_no: u64, index: LogIndex, offset: u64) {
        if let Some(file) = self.get_mut(file_no) {
            trace!("Position map refined: {} index {} -> {}", file.file_name, index, offset);
            file.record_position(index, offset);
        }
    }

    /// Drop every file after `file_no`, returning them
    pub fn drop_after(&mut self, file_no: u64) -> Vec<FileIndexEntry> {
        let keep = self.files.iter().position(|f| f.file_no > file_no).unwrap_or(self.files.len());
        self.files.split_off(keep)
    }

    /// Drop the first `count` files, returning them
    pub fn drop_front(&mut self, count: usize) -> Vec<FileIndexEntry> {
        let count = count.min(self.files.len());
        self.files.drain(..count).collect()
    }

    pub fn clear(&mut self) -> Vec<FileIndexEntry> {
        std::mem::take(&mut self.files)
    }

    pub fn infos(&self) -> Vec<LogFileInfo> {
        self.files
            .iter()
            .map(|f| LogFileInfo {
                file_name: f.file_name.clone(),
                size: f.size,
                first_index: f.start_index(),
                last_index: f.last_index,
                timestamp: f.timestamp,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(file_no: u64, prev: u64, last: u64) -> FileIndexEntry {
        let mut e = FileIndexEntry::new(
            file_no,
            format!("log.{:06}", file_no),
            PathBuf::from(format!("/tmp/log.{:06}", file_no)),
            prev,
            0,
        );
        e.last_index = last;
        e
    }

    #[test]
    fn test_find_for_index() {
        let mut index = FileIndex::new();
        index.push(entry(1, 0, 10));
        index.push(entry(2, 10, 25));
        index.push(entry(3, 25, 25));

        assert_eq!(index.find_for_index(1).unwrap().file_no, 1);
        assert_eq!(index.find_for_index(10).unwrap().file_no, 1);
        assert_eq!(index.find_for_index(11).unwrap().file_no, 2);
        // Next index to append lands in the empty tail file
        assert_eq!(index.find_for_index(26).unwrap().file_no, 3);
        assert!(index.find_for_index(27).is_none());
        assert!(index.find_for_index(0).is_none());
        assert_eq!(index.first_index(), 1);
        assert_eq!(index.last_index(), 25);
    }

    #[test]
    fn test_sparse_positions() {
        let mut index = FileIndex::new();
        index.push(entry(1, 0, 0));
        for i in 1..=100u64 {
            index.note_append(1, i, DATA_START + i * 100);
        }
        let file = index.get(1).unwrap();
        // First entry plus every 32nd
        assert_eq!(file.position_count(), 4);
        assert_eq!(file.nearest_position(70), (64, DATA_START + 6400));
        assert_eq!(file.last_index, 100);

        index.refine(1, 70, DATA_START + 7000);
        assert_eq!(index.get(1).unwrap().known_position(70), Some(DATA_START + 7000));

        let file = index.get_mut(1).unwrap();
        file.truncate_from(64, DATA_START + 6400);
        assert_eq!(file.last_index, 63);
        assert_eq!(file.nearest_position(80), (32, DATA_START + 3200));
    }

    #[test]
    fn test_drop_after_and_front() {
        let mut index = FileIndex::new();
        index.push(entry(1, 0, 10));
        index.push(entry(2, 10, 20));
        index.push(entry(3, 20, 30));
        let dropped = index.drop_after(1);
        assert_eq!(dropped.len(), 2);
        assert_eq!(index.len(), 1);

        index.push(entry(2, 10, 20));
        let purged = index.drop_front(1);
        assert_eq!(purged[0].file_no, 1);
        assert_eq!(index.first_index(), 11);
    }
}
