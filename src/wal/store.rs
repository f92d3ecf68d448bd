//! Log Store
//!
//! Append-only multi-file log. A single writer appends under the append
//! mutex; readers open their own handles and rely on the shared file index
//! for positions and published sizes.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::entry::{EntryFlags, FrameHeader, FrameKind, LogEntry, LogIndex};
use super::index::{FileIndex, FileIndexEntry, LogFileInfo, SharedFileIndex};
use super::reader::{verify_frame, FrameRead, FrameReader, LogReader};
use super::segment::{file_name, list_log_files, LogFile, DATA_START};
use super::split::{filler_body, SplitPolicy, FILLER_BODY_SIZE};
use crate::config::LogConfig;
use crate::context::ConsensusContext;
use crate::error::{Error, Result};

/// What `purge_before` removes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurgeTarget {
    /// Files whose entries all precede this index
    Index(LogIndex),
    /// Files closed before this time
    Time(chrono::DateTime<chrono::Utc>),
    /// Files preceding the named file
    File(String),
}

/// The replicated log on disk
pub struct LogStore {
    dir: PathBuf,
    config: LogConfig,
    policy: SplitPolicy,
    ctx: Arc<ConsensusContext>,
    writer: Mutex<LogFile>,
    index: SharedFileIndex,
}

impl LogStore {
    /// Open (or create) the log in `dir`, recovering from a crash if needed.
    ///
    /// A torn frame at the end of the last file is cut off. Damage anywhere
    /// else, or a broken previous-index chain, is fatal.
    pub fn open(dir: impl Into<PathBuf>, config: LogConfig, ctx: Arc<ConsensusContext>) -> Result<Self> {
        config.validate()?;
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let files = list_log_files(&dir, &config.basename)?;
        let mut index = FileIndex::new();

        let writer = if files.is_empty() {
            let log = LogFile::create(&dir, &config.basename, 1, 0)?;
            index.push(FileIndexEntry::new(
                1,
                file_name(&config.basename, 1),
                log.path.clone(),
                0,
                log.timestamp(),
            ));
            info!("Created consensus log in {:?}", dir);
            log
        } else {
            let count = files.len();
            let mut expected_prev: Option<LogIndex> = None;
            for (i, (file_no, path)) in files.iter().enumerate() {
                let tail = i + 1 == count;
                let entry = scan_file(*file_no, path, tail, config.checksum)?;
                if let Some(expected) = expected_prev {
                    if entry.prev_index != expected {
                        error!(
                            "Log chain broken at {:?}: marker {} but previous file ends at {}",
                            path, entry.prev_index, expected
                        );
                        return Err(Error::ChainBroken {
                            file: path.clone(),
                            marker: entry.prev_index,
                            expected,
                        });
                    }
                }
                expected_prev = Some(entry.last_index);
                index.push(entry);
            }

            let tail = index
                .last()
                .ok_or_else(|| Error::Internal("log index empty after recovery".into()))?;
            let mut log = LogFile::open(tail.path.clone(), tail.file_no, tail.size)?;
            let on_disk = fs::metadata(&tail.path)?.len();
            if on_disk > tail.size {
                warn!(
                    "Truncating torn tail of {} from {} to {} bytes",
                    tail.file_name, on_disk, tail.size
                );
                log.truncate(tail.size)?;
            }
            log
        };

        let last_index = index.last_index();
        ctx.set_current_index(last_index + 1);
        ctx.reset_sync_index(last_index);

        info!(
            "Consensus log opened: {} file(s), indexes {}..={}",
            index.len(),
            index.first_index(),
            last_index
        );

        Ok(Self {
            dir,
            policy: SplitPolicy::from_config(&config),
            config,
            ctx,
            writer: Mutex::new(writer),
            index: Arc::new(parking_lot::RwLock::new(index)),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    pub fn policy(&self) -> SplitPolicy {
        self.policy
    }

    pub fn context(&self) -> &Arc<ConsensusContext> {
        &self.ctx
    }

    pub fn shared_index(&self) -> SharedFileIndex {
        self.index.clone()
    }

    /// First index still stored
    pub fn first_index(&self) -> LogIndex {
        self.index.read().first_index()
    }

    /// Last index stored (0 when empty)
    pub fn last_index(&self) -> LogIndex {
        self.ctx.current_index().saturating_sub(1)
    }

    /// Byte offset the next frame will be written at
    pub fn tail_offset(&self) -> u64 {
        self.writer.lock().size()
    }

    /// Append one logical entry and return its index.
    ///
    /// `entry.index` of 0 takes the next index; any other value must equal it.
    /// Oversized payloads are split, or rejected with `LogTooLarge` before
    /// anything is written when splitting is disabled.
    pub fn append(&self, entry: LogEntry) -> Result<LogIndex> {
        let parts = self.policy.plan(entry.flag, entry.payload.clone())?;

        let mut writer = self.writer.lock();
        let index = self.ctx.current_index();
        if entry.index != 0 && entry.index != index {
            return Err(Error::IndexMismatch {
                expected: index,
                actual: entry.index,
            });
        }

        let rotated = if writer.size() >= self.config.max_file_size() {
            self.rotate_locked(&mut writer)?;
            true
        } else {
            false
        };

        let first_offset = writer.size();
        let total = parts.len() as u32;
        for (i, part) in parts.iter().enumerate() {
            let mut flag = part.flag;
            if rotated && i == 0 {
                flag |= EntryFlags::ROTATE;
            }
            let header = FrameHeader::entry(
                flag,
                entry.term,
                index,
                part.payload.len() as u64,
                part.checksum,
            );
            writer.append_frame(&header, &part.payload)?;

            if part.filler_after {
                let body = filler_body(i as u32 + 1, total);
                let filler = FrameHeader {
                    kind: FrameKind::Filler,
                    flag: EntryFlags::NONE,
                    term: entry.term,
                    index,
                    length: FILLER_BODY_SIZE as u64,
                    checksum: if self.config.checksum { crc32fast::hash(&body) } else { 0 },
                };
                writer.append_frame(&filler, &body)?;
            }
        }

        {
            let mut idx = self.index.write();
            idx.note_append(writer.file_no, index, first_offset);
            if let Some(file) = idx.get_mut(writer.file_no) {
                file.size = writer.size();
            }
        }
        self.ctx.set_current_index(index + 1);

        if total > 1 {
            debug!("Index {} written as {} fragments", index, total);
        }
        Ok(index)
    }

    fn rotate_locked(&self, writer: &mut LogFile) -> Result<()> {
        writer.sync()?;
        let prev_index = self.ctx.current_index().saturating_sub(1);
        self.ctx.set_sync_index_if_greater(prev_index);

        let file_no = writer.file_no + 1;
        let log = LogFile::create(&self.dir, &self.config.basename, file_no, prev_index)?;
        let name = file_name(&self.config.basename, file_no);
        self.index.write().push(FileIndexEntry::new(
            file_no,
            name.clone(),
            log.path.clone(),
            prev_index,
            log.timestamp(),
        ));
        *writer = log;

        info!("Rotated consensus log to {} (previous index {})", name, prev_index);
        Ok(())
    }

    /// Flush appended entries to disk and advance the durable index
    pub fn sync(&self) -> Result<LogIndex> {
        let writer = self.writer.lock();
        let last = self.ctx.current_index().saturating_sub(1);
        if self.config.fsync {
            writer.sync()?;
        }
        Ok(self.ctx.set_sync_index_if_greater(last))
    }

    /// File holding `index` and the first index of that file
    pub fn find_file_for_index(&self, index: LogIndex) -> Result<(String, LogIndex)> {
        self.index
            .read()
            .find_for_index(index)
            .map(|f| (f.file_name.clone(), f.start_index()))
            .ok_or(Error::IndexNotFound(index))
    }

    /// Byte offset of `index` inside `file_name`
    pub fn find_position_for_index(
        &self,
        file_name: &str,
        file_start_index: LogIndex,
        index: LogIndex,
    ) -> Result<u64> {
        let (file_no, path, nearest, limit, is_tail) = {
            let idx = self.index.read();
            let file = idx.by_name(file_name).ok_or(Error::IndexNotFound(index))?;
            if file.start_index() != file_start_index {
                return Err(Error::Internal(format!(
                    "{} starts at index {}, not {}",
                    file_name,
                    file.start_index(),
                    file_start_index
                )));
            }
            if let Some(offset) = file.known_position(index) {
                return Ok(offset);
            }
            let is_tail = idx.last().map(|t| t.file_no == file.file_no).unwrap_or(false);
            (
                file.file_no,
                file.path.clone(),
                file.nearest_position(index),
                file.size,
                is_tail,
            )
        };

        if is_tail && index == self.ctx.current_index() {
            return Ok(limit);
        }

        let (mut reader, _) = FrameReader::open(&path, file_no)?;
        reader.seek(nearest.1)?;
        loop {
            match reader.next_frame(limit, false)? {
                FrameRead::Frame(frame) => {
                    if frame.header.kind != FrameKind::Entry {
                        continue;
                    }
                    if frame.header.index == index {
                        self.index.write().refine(file_no, index, frame.offset);
                        return Ok(frame.offset);
                    }
                    if frame.header.index > index {
                        return Err(Error::IndexNotFound(index));
                    }
                }
                FrameRead::End => return Err(Error::IndexNotFound(index)),
                FrameRead::Torn { offset, reason } => {
                    return Err(Error::Corrupted {
                        file: path,
                        offset,
                        reason,
                    })
                }
            }
        }
    }

    /// File name and byte offset of `index`
    pub fn find_position(&self, index: LogIndex) -> Result<(String, u64)> {
        let (name, start) = self.find_file_for_index(index)?;
        let offset = self.find_position_for_index(&name, start, index)?;
        Ok((name, offset))
    }

    fn locate(&self, index: LogIndex) -> Result<(u64, u64)> {
        let (name, offset) = self.find_position(index)?;
        let file_no = self
            .index
            .read()
            .by_name(&name)
            .map(|f| f.file_no)
            .ok_or(Error::IndexNotFound(index))?;
        Ok((file_no, offset))
    }

    /// Reader positioned at `index`
    pub fn reader_from(&self, index: LogIndex) -> Result<LogReader> {
        let index = index.max(self.first_index());
        let (file_no, offset) = self.locate(index)?;
        LogReader::open_at(self.index.clone(), file_no, offset, self.config.checksum)
    }

    /// Read one logical entry, reassembling split entries
    pub fn get_entry(&self, index: LogIndex) -> Result<LogEntry> {
        if index == 0 || index >= self.ctx.current_index() || index < self.first_index() {
            return Err(Error::IndexNotFound(index));
        }
        let mut reader = self.reader_from(index)?;
        match reader.next_entry()? {
            Some(entry) if entry.index == index => Ok(entry),
            _ => Err(Error::IndexNotFound(index)),
        }
    }

    /// Read entries `from..=to`
    pub fn read_range(&self, from: LogIndex, to: LogIndex) -> Result<Vec<LogEntry>> {
        let to = to.min(self.last_index());
        if from > to {
            return Ok(Vec::new());
        }
        let mut reader = self.reader_from(from)?;
        let mut entries = Vec::with_capacity((to - from + 1) as usize);
        while let Some(entry) = reader.next_entry()? {
            if entry.index > to {
                break;
            }
            if entry.index >= from {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Index of the entry ending the transaction that starts at `first_index`
    pub fn trx_end_index(&self, first_index: LogIndex) -> Result<LogIndex> {
        let mut reader = self.reader_from(first_index)?;
        while let Some(entry) = reader.next_entry()? {
            if entry.index < first_index {
                continue;
            }
            if !entry.is_large_trx_part() {
                return Ok(entry.index);
            }
        }
        Err(Error::IndexNotFound(first_index))
    }

    /// Remove `index` and everything after it.
    ///
    /// Afterwards the next append gets `index` and the durable index is
    /// `index - 1`. Any failure here leaves the log unusable.
    pub fn truncate_from(&self, index: LogIndex) -> Result<()> {
        let mut writer = self.writer.lock();
        let current = self.ctx.current_index();
        if index > current || index < self.first_index() || index == 0 {
            return Err(Error::IndexNotFound(index));
        }
        if index == current {
            debug!("Truncate at {} is a no-op", index);
            return Ok(());
        }

        let (file_no, offset) = self.locate(index)?;

        self.ctx.bump_truncate_generation();
        let (dropped, path) = {
            let mut idx = self.index.write();
            let dropped = idx.drop_after(file_no);
            let file = idx.get_mut(file_no).ok_or(Error::IndexNotFound(index))?;
            file.truncate_from(index, offset);
            (dropped, file.path.clone())
        };

        for file in &dropped {
            fs::remove_file(&file.path).map_err(|e| Error::durability("remove log file", e))?;
        }

        if writer.file_no != file_no {
            *writer = LogFile::open(path, file_no, offset)?;
        }
        writer.truncate(offset)?;

        self.ctx.reset_sync_index(index - 1);
        self.ctx.set_current_index(index);

        info!(
            "Consensus log truncated from index {} ({} later file(s) removed)",
            index,
            dropped.len()
        );
        Ok(())
    }

    /// Drop the whole log; the next append gets `next_index`
    pub fn truncate_all(&self, next_index: LogIndex) -> Result<()> {
        let next_index = next_index.max(1);
        let mut writer = self.writer.lock();

        self.ctx.bump_truncate_generation();
        let file_no = writer.file_no + 1;
        let log = LogFile::create(&self.dir, &self.config.basename, file_no, next_index - 1)?;
        let removed = {
            let mut idx = self.index.write();
            let removed = idx.clear();
            idx.push(FileIndexEntry::new(
                file_no,
                file_name(&self.config.basename, file_no),
                log.path.clone(),
                next_index - 1,
                log.timestamp(),
            ));
            removed
        };
        *writer = log;

        for file in &removed {
            fs::remove_file(&file.path).map_err(|e| Error::durability("remove log file", e))?;
        }

        self.ctx.reset_sync_index(next_index - 1);
        self.ctx.set_current_index(next_index);
        info!("Consensus log reset, next index {}", next_index);
        Ok(())
    }

    /// Delete whole files before the cutoff. The tail file and files holding
    /// entries that are not yet durable are never removed.
    pub fn purge_before(&self, target: PurgeTarget) -> Result<Vec<String>> {
        let _writer = self.writer.lock();
        let sync_index = self.ctx.sync_index();

        let removed = {
            let mut idx = self.index.write();
            let files = idx.files();
            if files.len() <= 1 {
                return Ok(Vec::new());
            }
            let candidates = &files[..files.len() - 1];

            let count = match &target {
                PurgeTarget::Index(cutoff) => candidates
                    .iter()
                    .take_while(|f| f.last_index < *cutoff && f.last_index <= sync_index)
                    .count(),
                PurgeTarget::Time(before) => files
                    .windows(2)
                    .take_while(|w| {
                        w[1].timestamp <= before.timestamp() && w[0].last_index <= sync_index
                    })
                    .count(),
                PurgeTarget::File(name) => match files.iter().position(|f| &f.file_name == name) {
                    Some(pos) => candidates[..pos.min(candidates.len())]
                        .iter()
                        .take_while(|f| f.last_index <= sync_index)
                        .count(),
                    None => {
                        warn!("purge_before: unknown log file {}", name);
                        0
                    }
                },
            };
            idx.drop_front(count)
        };

        let mut names = Vec::with_capacity(removed.len());
        for file in removed {
            fs::remove_file(&file.path).map_err(|e| Error::durability("purge log file", e))?;
            info!(
                "Purged {} (indexes {}..={})",
                file.file_name,
                file.start_index(),
                file.last_index
            );
            names.push(file.file_name);
        }
        Ok(names)
    }

    /// Files with sizes and index ranges
    pub fn list_files(&self) -> Vec<LogFileInfo> {
        self.index.read().infos()
    }
}

/// Rebuild the index entry of one file during recovery
fn scan_file(file_no: u64, path: &Path, tail: bool, verify: bool) -> Result<FileIndexEntry> {
    let (mut reader, marker) = FrameReader::open(path, file_no)?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .unwrap_or_default();
    let mut entry = FileIndexEntry::new(file_no, name, path.to_path_buf(), marker.prev_index, marker.timestamp);

    let limit = fs::metadata(path)?.len();
    // Offset and index of a split entry whose last fragment has not been seen
    let mut open_blob: Option<(LogIndex, u64)> = None;
    let mut valid_end = DATA_START;

    let corrupted = |offset: u64, reason: String| Error::Corrupted {
        file: path.to_path_buf(),
        offset,
        reason,
    };

    loop {
        match reader.next_frame(limit, tail && verify)? {
            FrameRead::Frame(frame) => {
                if tail && verify {
                    verify_frame(&frame, path)?;
                }
                match frame.header.kind {
                    FrameKind::Filler => {
                        if open_blob.is_none() {
                            return Err(corrupted(frame.offset, "filler outside a split entry".into()));
                        }
                    }
                    FrameKind::PreviousIndex => {
                        return Err(corrupted(frame.offset, "second previous-index marker".into()));
                    }
                    FrameKind::Entry => {
                        let flag = frame.header.flag;
                        let idx = frame.header.index;
                        match open_blob {
                            Some((blob_index, _)) => {
                                if idx != blob_index || !flag.contains(EntryFlags::BLOB) {
                                    return Err(corrupted(
                                        frame.offset,
                                        format!("index {} interrupts split entry {}", idx, blob_index),
                                    ));
                                }
                            }
                            None => {
                                if idx != entry.last_index + 1 {
                                    return Err(corrupted(
                                        frame.offset,
                                        format!("index {} follows {}", idx, entry.last_index),
                                    ));
                                }
                                if idx == entry.start_index() || idx % super::index::POSITION_STRIDE == 0 {
                                    entry.record_position(idx, frame.offset);
                                }
                                if flag.contains(EntryFlags::BLOB_START) {
                                    open_blob = Some((idx, frame.offset));
                                }
                            }
                        }
                        if flag.contains(EntryFlags::BLOB_END) {
                            open_blob = None;
                        }
                        if open_blob.is_none() {
                            entry.last_index = idx;
                        }
                    }
                }
                if open_blob.is_none() {
                    valid_end = frame.end_offset();
                }
            }
            FrameRead::End => break,
            FrameRead::Torn { offset, reason } => {
                if !tail {
                    return Err(corrupted(offset, reason));
                }
                warn!("Torn frame in {:?} at offset {}: {}", path, offset, reason);
                break;
            }
        }
    }

    if let Some((blob_index, offset)) = open_blob {
        if !tail {
            return Err(corrupted(offset, format!("split entry {} is incomplete", blob_index)));
        }
        warn!("Discarding incomplete split entry {} in {:?}", blob_index, path);
    }

    entry.size = valid_end;
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::io::Write;
    use tempfile::tempdir;

    fn small_config() -> LogConfig {
        LogConfig {
            basename: "test-log".into(),
            max_log_size: 1024,
            large_event_split_size: 512,
            max_file_size_mb: 1,
            ..LogConfig::default()
        }
    }

    fn open(dir: &Path, config: LogConfig) -> (LogStore, Arc<ConsensusContext>) {
        let ctx = Arc::new(ConsensusContext::new());
        let store = LogStore::open(dir, config, ctx.clone()).unwrap();
        (store, ctx)
    }

    fn payload(i: u64, len: usize) -> Bytes {
        Bytes::from(vec![(i % 251) as u8; len])
    }

    #[test]
    fn test_append_and_read() {
        let dir = tempdir().unwrap();
        let (store, ctx) = open(dir.path(), small_config());

        for i in 1..=10u64 {
            let index = store.append(LogEntry::new(1, EntryFlags::NONE, payload(i, 100))).unwrap();
            assert_eq!(index, i);
        }
        assert_eq!(ctx.current_index(), 11);
        assert_eq!(ctx.sync_index(), 0);
        assert_eq!(store.sync().unwrap(), 10);

        let entry = store.get_entry(7).unwrap();
        assert_eq!(entry.index, 7);
        assert_eq!(entry.term, 1);
        assert_eq!(entry.payload, payload(7, 100));
        assert_eq!(entry.checksum, crc32fast::hash(&entry.payload));

        let range = store.read_range(3, 6).unwrap();
        let indexes: Vec<u64> = range.iter().map(|e| e.index).collect();
        assert_eq!(indexes, vec![3, 4, 5, 6]);

        assert!(matches!(store.get_entry(11), Err(Error::IndexNotFound(11))));
    }

    #[test]
    fn test_index_mismatch() {
        let dir = tempdir().unwrap();
        let (store, _) = open(dir.path(), small_config());
        store.append(LogEntry::new(1, EntryFlags::NONE, payload(1, 10))).unwrap();

        let err = store
            .append(LogEntry::new(1, EntryFlags::NONE, payload(2, 10)).with_index(5))
            .unwrap_err();
        assert!(matches!(err, Error::IndexMismatch { expected: 2, actual: 5 }));
        assert_eq!(
            store.append(LogEntry::new(1, EntryFlags::NONE, payload(2, 10)).with_index(2)).unwrap(),
            2
        );
    }

    #[test]
    fn test_split_entry_on_disk() {
        let dir = tempdir().unwrap();
        let config = LogConfig {
            max_log_size: 512,
            large_event_split_size: 512,
            ..small_config()
        };
        let (store, _) = open(dir.path(), config);
        store.append(LogEntry::new(2, EntryFlags::NONE, payload(0, 10))).unwrap();
        let big = Bytes::from((0..1024u32).map(|i| (i % 256) as u8).collect::<Vec<u8>>());
        let index = store.append(LogEntry::new(2, EntryFlags::NONE, big.clone())).unwrap();
        assert_eq!(index, 2);
        store.sync().unwrap();

        // Physical layout: two entry frames sharing index 2 with one filler between
        let mut reader = store.reader_from(2).unwrap();
        let mut frames = Vec::new();
        while let Some(frame) = reader.next_frame(true).unwrap() {
            frames.push(frame);
        }
        let entries: Vec<_> = frames.iter().filter(|f| f.header.kind == FrameKind::Entry).collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].header.flag, EntryFlags::BLOB | EntryFlags::BLOB_START);
        assert_eq!(entries[1].header.flag, EntryFlags::BLOB | EntryFlags::BLOB_END);
        assert!(entries.iter().all(|f| f.header.index == 2));
        assert_eq!(entries[1].header.checksum, crc32fast::hash(&big));
        let fillers: Vec<_> = frames.iter().filter(|f| f.header.kind == FrameKind::Filler).collect();
        assert_eq!(fillers.len(), 1);
        assert_eq!(
            fillers[0].header.checksum,
            crc32fast::hash(fillers[0].body.as_ref().unwrap())
        );

        let entry = store.get_entry(2).unwrap();
        assert_eq!(entry.payload, big);
        assert!(entry.flag.is_empty());

        let next = store.append(LogEntry::new(2, EntryFlags::NONE, payload(3, 10))).unwrap();
        assert_eq!(next, 3);
        assert_eq!(store.get_entry(3).unwrap().payload, payload(3, 10));
    }

    #[test]
    fn test_too_large_rejected_before_write() {
        let dir = tempdir().unwrap();
        let config = LogConfig {
            split_large_events: false,
            ..small_config()
        };
        let (store, ctx) = open(dir.path(), config);
        let before = store.tail_offset();
        let err = store
            .append(LogEntry::new(1, EntryFlags::NONE, payload(1, 2048)))
            .unwrap_err();
        assert!(matches!(err, Error::LogTooLarge { size: 2048, max: 1024 }));
        assert_eq!(store.tail_offset(), before);
        assert_eq!(ctx.current_index(), 1);
    }

    #[test]
    fn test_truncate_then_append() {
        let dir = tempdir().unwrap();
        let (store, ctx) = open(dir.path(), small_config());
        for i in 1..=20u64 {
            store.append(LogEntry::new(1, EntryFlags::NONE, payload(i, 64))).unwrap();
        }
        store.sync().unwrap();
        let generation = ctx.truncate_generation();

        store.truncate_from(12).unwrap();
        assert_eq!(ctx.current_index(), 12);
        assert_eq!(ctx.sync_index(), 11);
        assert!(ctx.truncate_generation() > generation);
        assert!(store.get_entry(12).is_err());

        let index = store.append(LogEntry::new(2, EntryFlags::NONE, payload(99, 64))).unwrap();
        assert_eq!(index, 12);
        let entry = store.get_entry(12).unwrap();
        assert_eq!(entry.term, 2);
        assert_eq!(entry.payload, payload(99, 64));
        assert_eq!(store.get_entry(11).unwrap().payload, payload(11, 64));
    }

    #[test]
    fn test_recovery_cuts_torn_tail() {
        let dir = tempdir().unwrap();
        let path = {
            let (store, _) = open(dir.path(), small_config());
            for i in 1..=3u64 {
                store.append(LogEntry::new(1, EntryFlags::NONE, payload(i, 50))).unwrap();
            }
            store.sync().unwrap();
            store.list_files()[0].file_name.clone()
        };

        let full = dir.path().join(&path);
        let clean_len = fs::metadata(&full).unwrap().len();
        let mut file = fs::OpenOptions::new().append(true).open(&full).unwrap();
        file.write_all(&[0xAB; 25]).unwrap();
        drop(file);

        let (store, ctx) = open(dir.path(), small_config());
        assert_eq!(ctx.current_index(), 4);
        assert_eq!(ctx.sync_index(), 3);
        assert_eq!(fs::metadata(&full).unwrap().len(), clean_len);
        assert_eq!(store.append(LogEntry::new(1, EntryFlags::NONE, payload(4, 50))).unwrap(), 4);
    }

    #[test]
    fn test_broken_chain_is_fatal() {
        let dir = tempdir().unwrap();
        {
            let mut first = LogFile::create(dir.path(), "test-log", 1, 0).unwrap();
            for i in 1..=3u64 {
                let body = payload(i, 10);
                let header = FrameHeader::entry(EntryFlags::NONE, 1, i, 10, crc32fast::hash(&body));
                first.append_frame(&header, &body).unwrap();
            }
            first.sync().unwrap();
            // Second file claims the first one ended at 5
            LogFile::create(dir.path(), "test-log", 2, 5).unwrap();
        }

        let ctx = Arc::new(ConsensusContext::new());
        let err = LogStore::open(dir.path(), small_config(), ctx).err().unwrap();
        assert!(matches!(err, Error::ChainBroken { marker: 5, expected: 3, .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_rotation_purge_and_positions() {
        let dir = tempdir().unwrap();
        let config = LogConfig {
            max_log_size: 128 * 1024,
            large_event_split_size: 64 * 1024,
            ..small_config()
        };
        let (store, ctx) = open(dir.path(), config.clone());

        // 40 x 64KiB crosses the 1 MiB rotation threshold twice
        for i in 1..=40u64 {
            store.append(LogEntry::new(1, EntryFlags::NONE, payload(i, 64 * 1024))).unwrap();
        }
        store.sync().unwrap();

        let files = store.list_files();
        assert!(files.len() >= 3, "expected rotation, got {:?}", files);
        for pair in files.windows(2) {
            assert_eq!(pair[1].first_index, pair[0].last_index + 1);
        }

        // First entry of the second file carries ROTATE
        let second_first = files[1].first_index;
        assert!(store.get_entry(second_first).unwrap().flag.contains(EntryFlags::ROTATE));
        assert!(!store.get_entry(1).unwrap().flag.contains(EntryFlags::ROTATE));

        let (name, start) = store.find_file_for_index(second_first + 1).unwrap();
        assert_eq!(name, files[1].file_name);
        let offset = store.find_position_for_index(&name, start, second_first + 1).unwrap();
        assert!(offset > DATA_START);
        // The next index resolves to the end of the tail file
        let (tail, tail_start) = store.find_file_for_index(41).unwrap();
        assert_eq!(
            store.find_position_for_index(&tail, tail_start, 41).unwrap(),
            store.tail_offset()
        );

        // Purging by index only removes whole files before the cutoff
        let purged = store.purge_before(PurgeTarget::Index(second_first + 1)).unwrap();
        assert_eq!(purged, vec![files[0].file_name.clone()]);
        assert_eq!(store.first_index(), second_first);
        assert!(store.get_entry(1).is_err());

        // Never the tail
        let purged = store.purge_before(PurgeTarget::Index(1000)).unwrap();
        assert_eq!(store.list_files().len(), 1);
        assert!(!purged.is_empty());

        // Reopen keeps the chain
        drop(store);
        let ctx2 = Arc::new(ConsensusContext::new());
        let store = LogStore::open(dir.path(), config, ctx2.clone()).unwrap();
        assert_eq!(ctx2.current_index(), ctx.current_index());
        assert_eq!(store.get_entry(40).unwrap().payload, payload(40, 64 * 1024));
    }

    #[test]
    fn test_trx_end_index() {
        let dir = tempdir().unwrap();
        let (store, _) = open(dir.path(), small_config());
        store.append(LogEntry::new(1, EntryFlags::NONE, payload(1, 10))).unwrap();
        store.append(LogEntry::new(1, EntryFlags::LARGE_TRX, payload(2, 10))).unwrap();
        store.append(LogEntry::new(1, EntryFlags::LARGE_TRX, payload(3, 10))).unwrap();
        store
            .append(LogEntry::new(1, EntryFlags::LARGE_TRX | EntryFlags::LARGE_TRX_END, payload(4, 10)))
            .unwrap();

        assert_eq!(store.trx_end_index(1).unwrap(), 1);
        assert_eq!(store.trx_end_index(2).unwrap(), 4);
        assert_eq!(store.trx_end_index(3).unwrap(), 4);
    }

    #[test]
    fn test_truncate_all() {
        let dir = tempdir().unwrap();
        let (store, ctx) = open(dir.path(), small_config());
        for i in 1..=5u64 {
            store.append(LogEntry::new(1, EntryFlags::NONE, payload(i, 10))).unwrap();
        }
        store.truncate_all(100).unwrap();
        assert_eq!(ctx.current_index(), 100);
        assert_eq!(store.first_index(), 100);
        assert_eq!(store.append(LogEntry::new(3, EntryFlags::NONE, payload(1, 10))).unwrap(), 100);
        assert_eq!(store.list_files().len(), 1);
    }
}
