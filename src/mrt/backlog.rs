/*!
Per-feed byte backlog: a resizable circular buffer between the socket
reader and the MRT parser.

The ring grows by doubling up to a cap; when it still cannot take an
incoming write, whole messages are discarded oldest-first, which is
explicit (and logged) message loss. Reads hand out at most one MRT
message; corrupt framing leaves the cursor in place so the caller can
resynchronise with [`Backlog::fast_forward`].
*/
use crate::models::bgp::BGP_HEADER_LEN;
use crate::models::{MrtHeader, MRT_HEADER_LEN};
use bytes::Bytes;
use log::{debug, warn};

/// Default starting size of a feed backlog, in bytes.
pub const BACKLOG_START_SIZE: usize = 81920;
/// Growth cap: a backlog never doubles past this.
pub const BACKLOG_MAX_SIZE: usize = 1 << 24;

/// Result of one backlog read.
#[derive(Debug, PartialEq, Eq)]
pub enum BacklogRead {
    /// No complete message buffered right now.
    Empty,
    Message {
        header: MrtHeader,
        body: Bytes,
    },
    /// A complete message is buffered but exceeds the caller's limit.
    TooLarge(u32),
    /// The bytes at the cursor are not a valid MRT header; the cursor was
    /// left untouched.
    Corrupt,
}

pub struct Backlog {
    buf: Vec<u8>,
    start: usize,
    end: usize,
    start_size: usize,
    max_size: usize,
}

impl Backlog {
    pub fn new() -> Backlog {
        Backlog::with_size(BACKLOG_START_SIZE, BACKLOG_MAX_SIZE)
    }

    pub fn with_size(size: usize, max_size: usize) -> Backlog {
        Backlog {
            buf: vec![0; size.max(MRT_HEADER_LEN + 1)],
            start: 0,
            end: 0,
            start_size: size.max(MRT_HEADER_LEN + 1),
            max_size: max_size.max(size),
        }
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        if self.start <= self.end {
            self.end - self.start
        } else {
            self.buf.len() - self.start + self.end
        }
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn free(&self) -> usize {
        self.buf.len() - self.len()
    }

    fn byte_at(&self, offset: usize) -> u8 {
        self.buf[(self.start + offset) % self.buf.len()]
    }

    fn copy_out(&self, offset: usize, out: &mut [u8]) {
        let size = self.buf.len();
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.buf[(self.start + offset + i) % size];
        }
    }

    /// Append feed bytes. Grows the ring by doubling up to the cap; if the
    /// write still does not fit, complete messages are dropped oldest
    /// first. Returns the number of messages lost that way.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }

        let mut dropped = 0;
        // keep one byte of separation so start == end stays "empty"
        while self.free() <= bytes.len() {
            if self.try_expand(bytes.len()) {
                continue;
            }
            match self.read(usize::MAX) {
                BacklogRead::Message { .. } => {
                    dropped += 1;
                }
                _ => {
                    // nothing whole to drop; drain the fragment
                    warn!("MRT backlog overrun with no complete message to drop; draining");
                    self.start = 0;
                    self.end = 0;
                    break;
                }
            }
        }
        if dropped > 0 {
            warn!("MRT backlog full: dropped {dropped} oldest message(s)");
        }
        if self.free() <= bytes.len() {
            // a single write larger than the whole ring at its cap
            warn!("MRT write of {} bytes exceeds the backlog cap; discarded", bytes.len());
            return dropped;
        }

        let size = self.buf.len();
        let first = (size - self.end).min(bytes.len());
        self.buf[self.end..self.end + first].copy_from_slice(&bytes[..first]);
        if first < bytes.len() {
            let rest = bytes.len() - first;
            self.buf[..rest].copy_from_slice(&bytes[first..]);
            self.end = rest;
        } else {
            self.end += first;
            if self.end == size {
                self.end = 0;
            }
        }
        dropped
    }

    fn try_expand(&mut self, need: usize) -> bool {
        let current = self.buf.len();
        if current >= self.max_size {
            return false;
        }
        let mut new_size = (current * 2).min(self.max_size);
        while new_size <= self.len() + need + 1 && new_size < self.max_size {
            new_size = (new_size * 2).min(self.max_size);
        }
        let mut new_buf = vec![0; new_size];
        let len = self.len();
        self.copy_out(0, &mut new_buf[..len]);
        self.buf = new_buf;
        self.start = 0;
        self.end = len;
        debug!("MRT backlog expanded to {new_size} bytes");
        true
    }

    /// Shrink an empty backlog back to its starting size.
    pub fn shrink(&mut self) {
        if self.start == self.end && self.buf.len() > self.start_size {
            self.buf = vec![0; self.start_size];
            self.start = 0;
            self.end = 0;
            debug!("MRT backlog shrunk to {} bytes", self.start_size);
        }
    }

    /// Extract at most one MRT message.
    pub fn read(&mut self, max_len: usize) -> BacklogRead {
        if self.start == self.end {
            return BacklogRead::Empty;
        }
        if self.len() < MRT_HEADER_LEN {
            return BacklogRead::Empty;
        }

        let mut header_bytes = [0u8; MRT_HEADER_LEN];
        self.copy_out(0, &mut header_bytes);
        let header = match MrtHeader::decode(&header_bytes) {
            Ok(header) => header,
            Err(_) => return BacklogRead::Corrupt,
        };
        if header.validate().is_err() {
            return BacklogRead::Corrupt;
        }

        let body_len = header.length as usize;
        if self.len() < MRT_HEADER_LEN + body_len {
            return BacklogRead::Empty;
        }
        if body_len > max_len {
            return BacklogRead::TooLarge(header.length);
        }

        let mut body = vec![0u8; body_len];
        self.copy_out(MRT_HEADER_LEN, &mut body);
        self.start = (self.start + MRT_HEADER_LEN + body_len) % self.buf.len();
        BacklogRead::Message {
            header,
            body: Bytes::from(body),
        }
    }

    /// Resynchronise after corrupt framing: scan for the 16-byte all-ones
    /// BGP marker, read the BGP length behind it, and align the cursor to
    /// the presumed next MRT header at the end of that BGP message.
    /// Returns true when an alignment was found; otherwise the buffer is
    /// drained.
    pub fn fast_forward(&mut self) -> bool {
        let len = self.len();
        let mut run = 0usize;
        let mut marker_start = None;
        for offset in 0..len {
            if self.byte_at(offset) == 0xFF {
                run += 1;
                if run == 16 {
                    marker_start = Some(offset + 1 - 16);
                    break;
                }
            } else {
                run = 0;
            }
        }

        let marker_start = match marker_start {
            Some(m) => m,
            None => {
                debug!("fast forward found no BGP marker; draining backlog");
                self.start = 0;
                self.end = 0;
                return false;
            }
        };

        if marker_start + 18 > len {
            // marker at the very tail with no length bytes yet
            self.start = 0;
            self.end = 0;
            return false;
        }
        let declared =
            u16::from_be_bytes([self.byte_at(marker_start + 16), self.byte_at(marker_start + 17)])
                as usize;
        if !(BGP_HEADER_LEN..=crate::models::bgp::BGP_MAX_MESSAGE_LEN).contains(&declared)
            || marker_start + declared > len
        {
            debug!("fast forward found an implausible BGP length {declared}; draining");
            self.start = 0;
            self.end = 0;
            return false;
        }

        self.start = (self.start + marker_start + declared) % self.buf.len();
        debug!("fast forward realigned past {} bytes", marker_start + declared);
        true
    }
}

impl Default for Backlog {
    fn default() -> Self {
        Backlog::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::mrt::frame_mrt;
    use crate::models::{Bgp4MpType, MrtEntryType};

    fn bgp4mp_record(nlri: &[u8]) -> Bytes {
        let bgp = crate::parser::bgp::messages::build_raw_update(&[], nlri);
        let mut body = Vec::new();
        body.extend_from_slice(&65001u16.to_be_bytes());
        body.extend_from_slice(&64512u16.to_be_bytes());
        body.extend_from_slice(&0u16.to_be_bytes());
        body.extend_from_slice(&1u16.to_be_bytes());
        body.extend_from_slice(&[192, 0, 2, 1]);
        body.extend_from_slice(&[192, 0, 2, 254]);
        body.extend_from_slice(&bgp);
        frame_mrt(
            1_600_000_000,
            MrtEntryType::Bgp4Mp.into(),
            Bgp4MpType::Message.into(),
            &body,
        )
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let mut backlog = Backlog::with_size(256, 1024);
        let record = bgp4mp_record(&[8, 10]);
        backlog.write(&record);
        match backlog.read(4096) {
            BacklogRead::Message { header, body } => {
                assert_eq!(header.timestamp, 1_600_000_000);
                assert_eq!(body.len(), header.length as usize);
            }
            other => panic!("expected message, got {other:?}"),
        }
        assert_eq!(backlog.read(4096), BacklogRead::Empty);
    }

    #[test]
    fn test_partial_message_reads_empty() {
        let mut backlog = Backlog::with_size(256, 1024);
        let record = bgp4mp_record(&[8, 10]);
        backlog.write(&record[..record.len() - 4]);
        assert_eq!(backlog.read(4096), BacklogRead::Empty);
        backlog.write(&record[record.len() - 4..]);
        assert!(matches!(backlog.read(4096), BacklogRead::Message { .. }));
    }

    #[test]
    fn test_wrapping_write_and_read() {
        let record = bgp4mp_record(&[8, 10]);
        // size the ring so the second record must wrap around the end
        let mut backlog = Backlog::with_size(record.len() + 20, record.len() + 20);
        backlog.write(&record);
        backlog.write(&record[..10]);
        assert!(matches!(backlog.read(4096), BacklogRead::Message { .. }));
        backlog.write(&record[10..]);
        match backlog.read(4096) {
            BacklogRead::Message { body, .. } => {
                assert_eq!(&body[..], &record[MRT_HEADER_LEN..]);
            }
            other => panic!("expected wrapped message, got {other:?}"),
        }
    }

    #[test]
    fn test_growth_by_doubling() {
        let record = bgp4mp_record(&[8, 10]);
        let mut backlog = Backlog::with_size(32, 4096);
        assert_eq!(backlog.write(&record), 0);
        assert!(backlog.capacity() > 32);
        assert!(matches!(backlog.read(4096), BacklogRead::Message { .. }));
    }

    #[test]
    fn test_overrun_drops_oldest_complete_message() {
        let a = bgp4mp_record(&[8, 10]);
        let b = bgp4mp_record(&[8, 20]);
        let c = bgp4mp_record(&[8, 30]);
        let cap = a.len() * 2 + 10;
        let mut backlog = Backlog::with_size(cap, cap); // cannot grow
        assert_eq!(backlog.write(&a), 0);
        assert_eq!(backlog.write(&b), 0);
        let dropped = backlog.write(&c);
        assert!(dropped >= 1);
        // the oldest message is gone; the newest survives
        let mut last = None;
        while let BacklogRead::Message { body, .. } = backlog.read(4096) {
            last = Some(body);
        }
        let c_body = &c[MRT_HEADER_LEN..];
        assert_eq!(last.as_deref(), Some(c_body));
    }

    #[test]
    fn test_corrupt_header_reported_then_fast_forward_realigns() {
        let mut backlog = Backlog::with_size(1024, 4096);
        let valid = bgp4mp_record(&[8, 10]);
        // a corrupt MRT header whose BGP payload is still intact, followed
        // by a valid record
        let mut corrupt = bgp4mp_record(&[8, 99]).to_vec();
        corrupt[4] = 0xFF; // smash the entry type
        corrupt[5] = 0xFF;
        backlog.write(&corrupt);
        backlog.write(&valid);

        assert_eq!(backlog.read(4096), BacklogRead::Corrupt);
        assert!(backlog.fast_forward());
        match backlog.read(4096) {
            BacklogRead::Message { body, .. } => {
                assert_eq!(&body[..], &valid[MRT_HEADER_LEN..]);
            }
            other => panic!("expected realigned message, got {other:?}"),
        }
    }

    #[test]
    fn test_fast_forward_without_marker_drains() {
        let mut backlog = Backlog::with_size(256, 1024);
        backlog.write(&[0xABu8; 64]);
        assert!(!backlog.fast_forward());
        assert!(backlog.is_empty());
    }

    #[test]
    fn test_too_large_for_caller() {
        let mut backlog = Backlog::with_size(1024, 4096);
        let record = bgp4mp_record(&[8, 10]);
        backlog.write(&record);
        let body_len = (record.len() - MRT_HEADER_LEN) as u32;
        assert_eq!(backlog.read(8), BacklogRead::TooLarge(body_len));
        // a retry with a big enough limit still succeeds
        assert!(matches!(backlog.read(4096), BacklogRead::Message { .. }));
    }

    #[test]
    fn test_shrink_after_drain() {
        let record = bgp4mp_record(&[8, 10]);
        let mut backlog = Backlog::with_size(32, 1 << 16);
        backlog.write(&record);
        assert!(backlog.capacity() > 32);
        while backlog.read(4096) != BacklogRead::Empty {}
        backlog.shrink();
        assert!(backlog.capacity() <= record.len().max(33));
    }
}
