//! Log Reader
//!
//! Sequential readers over log files. Readers open their own file handles
//! and only read up to the size published in the file index, so they never
//! observe a frame the writer is still producing.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use super::entry::{EntryFlags, FrameHeader, FrameKind, LogEntry, LogIndex, FRAME_HEADER_SIZE};
use super::index::SharedFileIndex;
use super::segment::{read_file_start, DATA_START};
use super::split::reassemble;
use crate::error::{Error, Result};

/// A physical frame read from disk
#[derive(Debug, Clone)]
pub struct Frame {
    pub file_no: u64,
    pub offset: u64,
    pub header: FrameHeader,
    /// Absent when the body was skipped
    pub body: Option<Bytes>,
}

impl Frame {
    pub fn end_offset(&self) -> u64 {
        self.offset + self.header.frame_size()
    }

    pub fn into_entry(self) -> LogEntry {
        LogEntry {
            flag: self.header.flag,
            term: self.header.term,
            index: self.header.index,
            checksum: self.header.checksum,
            payload: self.body.unwrap_or_default(),
        }
    }
}

/// Result of reading one frame from a single file
#[derive(Debug)]
pub enum FrameRead {
    Frame(Frame),
    /// Clean end of the readable region
    End,
    /// The frame at `offset` is incomplete or damaged
    Torn { offset: u64, reason: String },
}

/// Reads frames from one log file
pub struct FrameReader {
    file_no: u64,
    path: PathBuf,
    reader: BufReader<File>,
    pos: u64,
}

impl FrameReader {
    /// Open a file, validate its start and position at the first entry
    pub fn open(path: &Path, file_no: u64) -> Result<(Self, super::entry::PreviousIndexMarker)> {
        let mut reader = BufReader::new(File::open(path)?);
        let marker = read_file_start(&mut reader, path)?;
        Ok((
            Self {
                file_no,
                path: path.to_path_buf(),
                reader,
                pos: DATA_START,
            },
            marker,
        ))
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn seek(&mut self, pos: u64) -> Result<()> {
        self.reader.seek(SeekFrom::Start(pos))?;
        self.pos = pos;
        Ok(())
    }

    /// Read the next frame that ends at or before `limit`
    pub fn next_frame(&mut self, limit: u64, read_body: bool) -> Result<FrameRead> {
        if self.pos >= limit {
            return Ok(FrameRead::End);
        }
        let offset = self.pos;
        if offset + FRAME_HEADER_SIZE as u64 > limit {
            return Ok(FrameRead::Torn {
                offset,
                reason: format!("incomplete frame header ({} bytes)", limit - offset),
            });
        }

        let mut raw = [0u8; FRAME_HEADER_SIZE];
        if let Err(e) = self.reader.read_exact(&mut raw) {
            return Ok(FrameRead::Torn {
                offset,
                reason: format!("unreadable frame header: {}", e),
            });
        }
        let header = match FrameHeader::from_bytes(&raw) {
            Ok(header) => header,
            Err(reason) => {
                self.seek(offset)?;
                return Ok(FrameRead::Torn { offset, reason });
            }
        };

        let end = offset + header.frame_size();
        if end > limit {
            self.seek(offset)?;
            return Ok(FrameRead::Torn {
                offset,
                reason: format!("frame of {} bytes runs past end of file", header.frame_size()),
            });
        }

        let body = if read_body {
            let mut body = vec![0u8; header.length as usize];
            if let Err(e) = self.reader.read_exact(&mut body) {
                self.seek(offset)?;
                return Ok(FrameRead::Torn {
                    offset,
                    reason: format!("unreadable frame body: {}", e),
                });
            }
            Some(Bytes::from(body))
        } else {
            self.reader.seek_relative(header.length as i64)?;
            None
        };

        self.pos = end;
        Ok(FrameRead::Frame(Frame {
            file_no: self.file_no,
            offset,
            header,
            body,
        }))
    }
}

/// Verify the body checksum of a frame read with its body.
///
/// The last fragment of a split entry carries the checksum of the whole
/// entry and is verified on reassembly instead.
pub fn verify_frame(frame: &Frame, path: &Path) -> Result<()> {
    let Some(body) = &frame.body else {
        return Ok(());
    };
    if frame.header.kind == FrameKind::Entry && frame.header.flag.contains(EntryFlags::BLOB_END) {
        return Ok(());
    }
    let computed = crc32fast::hash(body);
    if computed != frame.header.checksum {
        return match frame.header.kind {
            FrameKind::Entry => Err(Error::ChecksumMismatch {
                index: frame.header.index,
                stored: frame.header.checksum,
                computed,
            }),
            _ => Err(Error::Corrupted {
                file: path.to_path_buf(),
                offset: frame.offset,
                reason: format!("{:?} frame checksum mismatch", frame.header.kind),
            }),
        };
    }
    Ok(())
}

/// Sequential reader across log files
pub struct LogReader {
    index: SharedFileIndex,
    reader: FrameReader,
    verify: bool,
}

impl LogReader {
    /// Start reading file `file_no` at `offset`
    pub fn open_at(index: SharedFileIndex, file_no: u64, offset: u64, verify: bool) -> Result<Self> {
        let path = index
            .read()
            .get(file_no)
            .map(|f| f.path.clone())
            .ok_or_else(|| Error::Internal(format!("log file {} is not indexed", file_no)))?;
        let (mut reader, _) = FrameReader::open(&path, file_no)?;
        reader.seek(offset)?;
        Ok(Self {
            index,
            reader,
            verify,
        })
    }

    pub fn file_no(&self) -> u64 {
        self.reader.file_no
    }

    pub fn pos(&self) -> u64 {
        self.reader.pos()
    }

    /// Published size of the current file, or None once it has been purged
    fn limit(&self) -> Option<u64> {
        self.index.read().get(self.reader.file_no).map(|f| f.size)
    }

    fn advance_file(&mut self) -> Result<bool> {
        let next = self
            .index
            .read()
            .next_after(self.reader.file_no)
            .map(|f| (f.file_no, f.path.clone()));
        match next {
            Some((file_no, path)) => {
                let (reader, _) = FrameReader::open(&path, file_no)?;
                self.reader = reader;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Next entry or filler frame. Previous-index markers are skipped.
    pub fn next_frame(&mut self, read_body: bool) -> Result<Option<Frame>> {
        loop {
            let Some(limit) = self.limit() else {
                return Err(Error::Internal(format!(
                    "log file {} was purged while being read",
                    self.reader.file_no
                )));
            };
            match self.reader.next_frame(limit, read_body || self.verify)? {
                FrameRead::Frame(frame) => {
                    if frame.header.kind == FrameKind::PreviousIndex {
                        continue;
                    }
                    if self.verify {
                        verify_frame(&frame, self.reader.path())?;
                    }
                    let frame = if read_body {
                        frame
                    } else {
                        Frame { body: None, ..frame }
                    };
                    return Ok(Some(frame));
                }
                FrameRead::End => {
                    if !self.advance_file()? {
                        return Ok(None);
                    }
                }
                FrameRead::Torn { offset, reason } => {
                    return Err(Error::Corrupted {
                        file: self.reader.path().to_path_buf(),
                        offset,
                        reason,
                    });
                }
            }
        }
    }

    /// Next logical entry, reassembling split entries and skipping fillers
    pub fn next_entry(&mut self) -> Result<Option<LogEntry>> {
        let first = loop {
            match self.next_frame(true)? {
                None => return Ok(None),
                Some(frame) if frame.header.kind == FrameKind::Filler => continue,
                Some(frame) => break frame,
            }
        };

        if !first.header.flag.contains(EntryFlags::BLOB_START) {
            return Ok(Some(first.into_entry()));
        }

        let index = first.header.index;
        let mut parts = vec![first.into_entry()];
        loop {
            match self.next_frame(true)? {
                None => {
                    return Err(Error::Corrupted {
                        file: self.reader.path().to_path_buf(),
                        offset: self.reader.pos(),
                        reason: format!("split entry {} ends early", index),
                    });
                }
                Some(frame) if frame.header.kind == FrameKind::Filler => continue,
                Some(frame) => {
                    let done = frame.header.flag.contains(EntryFlags::BLOB_END);
                    parts.push(frame.into_entry());
                    if done {
                        break;
                    }
                }
            }
        }

        reassemble(&parts, self.verify).map(Some)
    }

    /// Skip entries until the next frame's index is at least `index`.
    /// Skipped bodies are seeked over, not read.
    pub fn skip_to(&mut self, index: LogIndex) -> Result<()> {
        let verify = std::mem::replace(&mut self.verify, false);
        let result = loop {
            match self.next_frame(false) {
                Ok(None) => break Ok(()),
                Ok(Some(frame)) if frame.header.index >= index && frame.header.kind == FrameKind::Entry => {
                    break self.reader.seek(frame.offset);
                }
                Ok(Some(_)) => continue,
                Err(e) => break Err(e),
            }
        };
        self.verify = verify;
        result
    }
}
