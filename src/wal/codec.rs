//! Event stream codec
//!
//! Entry payloads produced by the host are streams of events. Each event
//! starts with a fixed header whose length and end-offset fields can only be
//! finalized once the event's position in the log file is known.
//! [`EventWriter`] fixes them while streaming and appends a CRC32 trailer per
//! event. [`EventReviser`] does the same for a buffer that already carries
//! trailer space, without copying.

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use crc32fast::Hasher;

use super::entry::{EntryFlags, LogEntry, LogIndex};
use crate::error::{Error, Result};

/// Event header size
///
/// Layout (little endian): timestamp u32, kind u8, event_len u32,
/// end_offset u64, flags u16.
pub const EVENT_HEADER_SIZE: usize = 19;

/// Size of the per-event checksum trailer
pub const EVENT_CHECKSUM_LEN: usize = 4;

const EVENT_LEN_OFFSET: usize = 5;
const END_OFFSET_OFFSET: usize = 9;

/// Serialize an event without a checksum trailer and with a zero end offset
pub fn build_event(kind: u8, timestamp: u32, body: &[u8]) -> Vec<u8> {
    let mut event = vec![0u8; EVENT_HEADER_SIZE + body.len()];
    LittleEndian::write_u32(&mut event[0..4], timestamp);
    event[4] = kind;
    LittleEndian::write_u32(
        &mut event[EVENT_LEN_OFFSET..EVENT_LEN_OFFSET + 4],
        (EVENT_HEADER_SIZE + body.len()) as u32,
    );
    event[EVENT_HEADER_SIZE..].copy_from_slice(body);
    event
}

/// Header fields of one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader {
    pub timestamp: u32,
    pub kind: u8,
    pub event_len: u32,
    pub end_offset: u64,
    pub flags: u16,
}

impl EventHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < EVENT_HEADER_SIZE {
            return Err(Error::MalformedEvent(format!(
                "event header needs {} bytes, have {}",
                EVENT_HEADER_SIZE,
                bytes.len()
            )));
        }
        Ok(Self {
            timestamp: LittleEndian::read_u32(&bytes[0..4]),
            kind: bytes[4],
            event_len: LittleEndian::read_u32(&bytes[EVENT_LEN_OFFSET..EVENT_LEN_OFFSET + 4]),
            end_offset: LittleEndian::read_u64(&bytes[END_OFFSET_OFFSET..END_OFFSET_OFFSET + 8]),
            flags: LittleEndian::read_u16(&bytes[17..19]),
        })
    }
}

/// Output of an [`EventWriter`] run
#[derive(Debug, Clone)]
pub struct EncodedEvents {
    pub term: u64,
    pub index: LogIndex,
    pub data: Bytes,
    pub bytes_written: u64,
    /// CRC32 of every emitted byte
    pub checksum: u32,
}

impl EncodedEvents {
    /// Wrap the encoded stream as a log entry
    pub fn into_entry(self, flag: EntryFlags) -> LogEntry {
        LogEntry {
            flag: flag | EntryFlags::EVENTS,
            term: self.term,
            index: self.index,
            checksum: self.checksum,
            payload: self.data,
        }
    }
}

/// Streaming event encoder
pub struct EventWriter {
    term: u64,
    index: LogIndex,
    have_checksum: bool,
    end_offset: u64,
    header: [u8; EVENT_HEADER_SIZE],
    header_len: usize,
    body_remaining: u64,
    in_body: bool,
    event_crc: Hasher,
    stream_crc: Hasher,
    out: BytesMut,
    bytes_written: u64,
}

impl EventWriter {
    /// Start encoding events that will land at `projected_end_offset` in the log
    pub fn begin(term: u64, index: LogIndex, have_checksum: bool, projected_end_offset: u64) -> Self {
        Self {
            term,
            index,
            have_checksum,
            end_offset: projected_end_offset,
            header: [0u8; EVENT_HEADER_SIZE],
            header_len: 0,
            body_remaining: 0,
            in_body: false,
            event_crc: Hasher::new(),
            stream_crc: Hasher::new(),
            out: BytesMut::new(),
            bytes_written: 0,
        }
    }

    /// Feed serialized events. Input may be split anywhere, including
    /// in the middle of a header.
    pub fn write(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            if self.in_body {
                let take = (self.body_remaining as usize).min(buf.len());
                let (body, rest) = buf.split_at(take);
                self.event_crc.update(body);
                self.emit(body);
                self.body_remaining -= take as u64;
                buf = rest;
                if self.body_remaining == 0 {
                    self.end_event();
                }
                continue;
            }

            let take = (EVENT_HEADER_SIZE - self.header_len).min(buf.len());
            self.header[self.header_len..self.header_len + take].copy_from_slice(&buf[..take]);
            self.header_len += take;
            buf = &buf[take..];

            if self.header_len == EVENT_HEADER_SIZE {
                self.start_event()?;
            }
        }
        Ok(())
    }

    fn start_event(&mut self) -> Result<()> {
        let input_len = LittleEndian::read_u32(&self.header[EVENT_LEN_OFFSET..EVENT_LEN_OFFSET + 4]);
        if (input_len as usize) < EVENT_HEADER_SIZE {
            return Err(Error::MalformedEvent(format!(
                "event length {} shorter than its header",
                input_len
            )));
        }

        let trailer = if self.have_checksum { EVENT_CHECKSUM_LEN as u32 } else { 0 };
        let event_len = input_len.checked_add(trailer).ok_or_else(|| {
            Error::MalformedEvent(format!("event length {} leaves no room for a checksum", input_len))
        })?;
        self.end_offset += event_len as u64;

        LittleEndian::write_u32(&mut self.header[EVENT_LEN_OFFSET..EVENT_LEN_OFFSET + 4], event_len);
        LittleEndian::write_u64(
            &mut self.header[END_OFFSET_OFFSET..END_OFFSET_OFFSET + 8],
            self.end_offset,
        );

        let header = self.header;
        self.event_crc = Hasher::new();
        self.event_crc.update(&header);
        self.emit(&header);
        self.header_len = 0;

        self.body_remaining = input_len as u64 - EVENT_HEADER_SIZE as u64;
        self.in_body = true;
        if self.body_remaining == 0 {
            self.end_event();
        }
        Ok(())
    }

    fn end_event(&mut self) {
        self.in_body = false;
        if self.have_checksum {
            let crc = std::mem::replace(&mut self.event_crc, Hasher::new()).finalize();
            self.emit(&crc.to_le_bytes());
        }
    }

    fn emit(&mut self, bytes: &[u8]) {
        self.stream_crc.update(bytes);
        self.out.put_slice(bytes);
        self.bytes_written += bytes.len() as u64;
    }

    /// End offset after the last complete event
    pub fn end_offset(&self) -> u64 {
        self.end_offset
    }

    /// Finish the stream. Fails if an event is still incomplete.
    pub fn finish(self) -> Result<EncodedEvents> {
        if self.in_body || self.header_len > 0 {
            return Err(Error::MalformedEvent(format!(
                "stream for index {} ends inside an event ({} header bytes, {} body bytes missing)",
                self.index,
                if self.in_body { 0 } else { EVENT_HEADER_SIZE - self.header_len },
                self.body_remaining
            )));
        }
        Ok(EncodedEvents {
            term: self.term,
            index: self.index,
            data: self.out.freeze(),
            bytes_written: self.bytes_written,
            checksum: self.stream_crc.finalize(),
        })
    }
}

/// In-place reviser for event streams that already carry trailer space
pub struct EventReviser {
    end_offset: u64,
    have_checksum: bool,
}

impl EventReviser {
    pub fn new(start_offset: u64, have_checksum: bool) -> Self {
        Self {
            end_offset: start_offset,
            have_checksum,
        }
    }

    /// Rewrite end offsets and trailers of every event in `buf`.
    /// Returns the number of events revised.
    pub fn revise_in_place(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut pos = 0;
        let mut count = 0;

        while pos < buf.len() {
            let header = EventHeader::parse(&buf[pos..])?;
            let len = header.event_len as usize;
            let min_len = EVENT_HEADER_SIZE + if self.have_checksum { EVENT_CHECKSUM_LEN } else { 0 };
            if len < min_len || pos + len > buf.len() {
                return Err(Error::MalformedEvent(format!(
                    "event at {} has length {} ({} bytes left)",
                    pos,
                    len,
                    buf.len() - pos
                )));
            }

            self.end_offset += len as u64;
            LittleEndian::write_u64(
                &mut buf[pos + END_OFFSET_OFFSET..pos + END_OFFSET_OFFSET + 8],
                self.end_offset,
            );

            if self.have_checksum {
                let body_end = pos + len - EVENT_CHECKSUM_LEN;
                let crc = crc32fast::hash(&buf[pos..body_end]);
                LittleEndian::write_u32(&mut buf[body_end..body_end + EVENT_CHECKSUM_LEN], crc);
            }

            pos += len;
            count += 1;
        }

        Ok(count)
    }

    pub fn end_offset(&self) -> u64 {
        self.end_offset
    }
}

/// Check every event trailer of an encoded stream. Returns the event count.
pub fn verify_events(buf: &[u8], have_checksum: bool) -> Result<usize> {
    let mut pos = 0;
    let mut count = 0;
    while pos < buf.len() {
        let header = EventHeader::parse(&buf[pos..])?;
        let len = header.event_len as usize;
        if len < EVENT_HEADER_SIZE || pos + len > buf.len() {
            return Err(Error::MalformedEvent(format!(
                "event at {} has length {}",
                pos, len
            )));
        }
        if have_checksum {
            let body_end = pos + len - EVENT_CHECKSUM_LEN;
            let stored = LittleEndian::read_u32(&buf[body_end..body_end + EVENT_CHECKSUM_LEN]);
            let computed = crc32fast::hash(&buf[pos..body_end]);
            if stored != computed {
                return Err(Error::MalformedEvent(format!(
                    "event {} trailer {:#010x} does not match {:#010x}",
                    count, stored, computed
                )));
            }
        }
        pos += len;
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn sample_events() -> Vec<Vec<u8>> {
        vec![
            build_event(2, 1000, b"BEGIN"),
            build_event(30, 1000, &[7u8; 300]),
            build_event(16, 1001, b""),
            build_event(2, 1001, b"COMMIT"),
        ]
    }

    #[test]
    fn test_writer_rewrites_headers_and_trailers() {
        let events = sample_events();
        let stream: Vec<u8> = events.concat();

        let mut writer = EventWriter::begin(3, 11, true, 1000);
        writer.write(&stream).unwrap();
        let encoded = writer.finish().unwrap();

        let expected_len = stream.len() + events.len() * EVENT_CHECKSUM_LEN;
        assert_eq!(encoded.bytes_written as usize, expected_len);
        assert_eq!(encoded.checksum, crc32fast::hash(&encoded.data));
        assert_eq!(verify_events(&encoded.data, true).unwrap(), 4);

        let first = EventHeader::parse(&encoded.data).unwrap();
        assert_eq!(first.event_len as usize, EVENT_HEADER_SIZE + 5 + 4);
        assert_eq!(first.end_offset, 1000 + first.event_len as u64);
        assert_eq!(first.timestamp, 1000);
    }

    #[test]
    fn test_writer_accepts_arbitrary_chunking() {
        let stream: Vec<u8> = sample_events().concat();
        let mut whole = EventWriter::begin(1, 1, true, 0);
        whole.write(&stream).unwrap();
        let expected = whole.finish().unwrap();

        let mut rng = rand::thread_rng();
        for _ in 0..20 {
            let mut writer = EventWriter::begin(1, 1, true, 0);
            let mut rest = &stream[..];
            while !rest.is_empty() {
                let n = rng.gen_range(1..=rest.len().min(23));
                writer.write(&rest[..n]).unwrap();
                rest = &rest[n..];
            }
            let encoded = writer.finish().unwrap();
            assert_eq!(encoded.data, expected.data);
            assert_eq!(encoded.checksum, expected.checksum);
        }
    }

    #[test]
    fn test_finish_rejects_incomplete_event() {
        let stream: Vec<u8> = sample_events().concat();
        let mut writer = EventWriter::begin(1, 1, true, 0);
        writer.write(&stream[..stream.len() - 3]).unwrap();
        assert!(matches!(writer.finish(), Err(Error::MalformedEvent(_))));

        let mut writer = EventWriter::begin(1, 1, false, 0);
        writer.write(&stream[..7]).unwrap();
        assert!(writer.finish().is_err());
    }

    #[test]
    fn test_reviser_matches_writer_at_new_offset() {
        let stream: Vec<u8> = sample_events().concat();

        let mut at_zero = EventWriter::begin(1, 1, true, 0);
        at_zero.write(&stream).unwrap();
        let mut buf = at_zero.finish().unwrap().data.to_vec();

        let mut at_offset = EventWriter::begin(1, 1, true, 4096);
        at_offset.write(&stream).unwrap();
        let expected = at_offset.finish().unwrap();

        let mut reviser = EventReviser::new(4096, true);
        assert_eq!(reviser.revise_in_place(&mut buf).unwrap(), 4);
        assert_eq!(buf, expected.data.to_vec());
        assert_eq!(reviser.end_offset(), expected_end(&expected.data));
    }

    fn expected_end(data: &[u8]) -> u64 {
        let mut pos = 0;
        let mut end = 0;
        while pos < data.len() {
            let header = EventHeader::parse(&data[pos..]).unwrap();
            end = header.end_offset;
            pos += header.event_len as usize;
        }
        end
    }

    #[test]
    fn test_short_event_length_rejected() {
        let mut event = build_event(1, 0, b"x");
        LittleEndian::write_u32(&mut event[EVENT_LEN_OFFSET..EVENT_LEN_OFFSET + 4], 3);
        let mut writer = EventWriter::begin(1, 1, true, 0);
        assert!(writer.write(&event).is_err());
    }

    #[test]
    fn test_oversized_event_length_rejected() {
        let mut event = build_event(1, 0, b"x");
        LittleEndian::write_u32(&mut event[EVENT_LEN_OFFSET..EVENT_LEN_OFFSET + 4], u32::MAX - 1);
        let mut writer = EventWriter::begin(1, 1, true, 0);
        assert!(matches!(
            writer.write(&event[..EVENT_HEADER_SIZE]),
            Err(Error::MalformedEvent(_))
        ));

        // Without trailers the same length is accepted
        let mut writer = EventWriter::begin(1, 1, false, 0);
        assert!(writer.write(&event[..EVENT_HEADER_SIZE]).is_ok());
    }
}
