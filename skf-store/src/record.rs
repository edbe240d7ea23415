//! On-disk log record framing.
//!
//! Little-endian layout:
//!
//! ```text
//! magic(u32) | total_len(u32) | term(u32) | prev_log_term(u32) |
//! index(u64) | timestamp(u64) | type(u8) | biz_type(u32) |
//! header_len(u32) | body_len(u32) | header | body | crc32(u32)
//! ```
//!
//! `total_len` covers the whole record, magic through CRC. The CRC covers
//! everything before it. A padding record carries its own magic and fills
//! the remainder of a segment; its `total_len` is the padded span.

use bytes::Bytes;
use skf_core::{RaftError, Result, Term, crc32};

pub const RECORD_MAGIC: u32 = u32::from_le_bytes(*b"SKLG");
pub const PADDING_MAGIC: u32 = u32::from_le_bytes(*b"SKPD");

/// Fixed prefix: magic through `body_len`.
pub const RECORD_FIXED_LEN: usize = 4 + 4 + 4 + 4 + 8 + 8 + 1 + 4 + 4 + 4;
pub const CRC_LEN: usize = 4;
/// Smallest complete record (empty header and body).
pub const MIN_RECORD_LEN: usize = RECORD_FIXED_LEN + CRC_LEN;
/// Smallest prefix a padding record needs (magic + total_len).
pub const PADDING_MIN_LEN: usize = 8;

/// One replicated log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogItem {
    pub index: u64,
    pub term: Term,
    /// Term of the previous entry, persisted for restore-time chain
    /// validation and AppendEntries consistency checks.
    pub prev_log_term: Term,
    /// Wall-clock millis at proposal time; drives timestamp reclamation.
    pub timestamp: u64,
    pub item_type: u8,
    pub biz_type: u32,
    pub header: Bytes,
    pub body: Bytes,
}

impl LogItem {
    pub const TYPE_NORMAL: u8 = 0;
    /// Leader-start marker appended at the beginning of every term.
    pub const TYPE_NOOP: u8 = 1;

    #[must_use]
    pub fn encoded_len(&self) -> usize {
        RECORD_FIXED_LEN + self.header.len() + self.body.len() + CRC_LEN
    }

    /// Payload size as counted by admission control.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.header.len() + self.body.len()
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        #[allow(clippy::cast_possible_truncation)]
        let total_len = self.encoded_len() as u32;
        buf.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
        buf.extend_from_slice(&total_len.to_le_bytes());
        buf.extend_from_slice(&self.term.to_le_bytes());
        buf.extend_from_slice(&self.prev_log_term.to_le_bytes());
        buf.extend_from_slice(&self.index.to_le_bytes());
        buf.extend_from_slice(&self.timestamp.to_le_bytes());
        buf.push(self.item_type);
        buf.extend_from_slice(&self.biz_type.to_le_bytes());
        #[allow(clippy::cast_possible_truncation)]
        buf.extend_from_slice(&(self.header.len() as u32).to_le_bytes());
        #[allow(clippy::cast_possible_truncation)]
        buf.extend_from_slice(&(self.body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.header);
        buf.extend_from_slice(&self.body);
        let crc = crc32(&buf[start..]);
        buf.extend_from_slice(&crc.to_le_bytes());
    }
}

/// Decoded fixed prefix of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub magic: u32,
    pub total_len: u32,
    pub term: Term,
    pub prev_log_term: Term,
    pub index: u64,
    pub timestamp: u64,
    pub item_type: u8,
    pub biz_type: u32,
    pub header_len: u32,
    pub body_len: u32,
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(b)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

impl RecordHeader {
    /// Parse the fixed prefix. `buf` must hold `RECORD_FIXED_LEN` bytes.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RECORD_FIXED_LEN {
            return Err(RaftError::Protocol(format!(
                "record header needs {RECORD_FIXED_LEN} bytes, got {}",
                buf.len()
            )));
        }
        Ok(Self {
            magic: read_u32(buf, 0),
            total_len: read_u32(buf, 4),
            term: read_u32(buf, 8),
            prev_log_term: read_u32(buf, 12),
            index: read_u64(buf, 16),
            timestamp: read_u64(buf, 24),
            item_type: buf[32],
            biz_type: read_u32(buf, 33),
            header_len: read_u32(buf, 37),
            body_len: read_u32(buf, 41),
        })
    }

    /// Expected full length per the header; validated against
    /// `total_len` before any payload allocation.
    pub fn expected_len(&self) -> Result<usize> {
        let expected = RECORD_FIXED_LEN
            + self.header_len as usize
            + self.body_len as usize
            + CRC_LEN;
        if expected != self.total_len as usize {
            return Err(RaftError::Protocol(format!(
                "record length mismatch: total_len {} vs computed {expected}",
                self.total_len
            )));
        }
        Ok(expected)
    }
}

/// Decode a full record from `buf`, validating the CRC.
pub fn decode_record(buf: &[u8]) -> Result<LogItem> {
    let header = RecordHeader::decode(buf)?;
    if header.magic != RECORD_MAGIC {
        return Err(RaftError::Protocol(format!(
            "bad record magic {:#x}",
            header.magic
        )));
    }
    let expected = header.expected_len()?;
    if buf.len() < expected {
        return Err(RaftError::Protocol(format!(
            "record truncated: need {expected} bytes, got {}",
            buf.len()
        )));
    }
    let crc_at = expected - CRC_LEN;
    let stored = read_u32(buf, crc_at);
    let actual = crc32(&buf[..crc_at]);
    if stored != actual {
        return Err(RaftError::ChecksumMismatch {
            expected: stored,
            actual,
        });
    }
    let header_start = RECORD_FIXED_LEN;
    let header_end = header_start + header.header_len as usize;
    let body_end = header_end + header.body_len as usize;
    Ok(LogItem {
        index: header.index,
        term: header.term,
        prev_log_term: header.prev_log_term,
        timestamp: header.timestamp,
        item_type: header.item_type,
        biz_type: header.biz_type,
        header: Bytes::copy_from_slice(&buf[header_start..header_end]),
        body: Bytes::copy_from_slice(&buf[header_end..body_end]),
    })
}

/// Encode a padding record spanning `span` bytes (the rest of a segment).
pub fn encode_padding(buf: &mut Vec<u8>, span: usize) {
    debug_assert!(span >= PADDING_MIN_LEN);
    buf.extend_from_slice(&PADDING_MAGIC.to_le_bytes());
    #[allow(clippy::cast_possible_truncation)]
    buf.extend_from_slice(&(span as u32).to_le_bytes());
    buf.resize(buf.len() + span - PADDING_MIN_LEN, 0);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_item() -> LogItem {
        LogItem {
            index: 42,
            term: 3,
            prev_log_term: 2,
            timestamp: 1_700_000_000_123,
            item_type: LogItem::TYPE_NORMAL,
            biz_type: 7,
            header: Bytes::from_static(b"hdr"),
            body: Bytes::from_static(b"set a=1"),
        }
    }

    #[test]
    fn test_record_round_trip() {
        let item = sample_item();
        let mut buf = Vec::new();
        item.encode_into(&mut buf);
        assert_eq!(buf.len(), item.encoded_len());
        let decoded = decode_record(&buf).unwrap();
        assert_eq!(decoded, item);
    }

    #[test]
    fn test_record_empty_payload_round_trip() {
        let item = LogItem {
            header: Bytes::new(),
            body: Bytes::new(),
            ..sample_item()
        };
        let mut buf = Vec::new();
        item.encode_into(&mut buf);
        assert_eq!(buf.len(), MIN_RECORD_LEN);
        assert_eq!(decode_record(&buf).unwrap(), item);
    }

    #[test]
    fn test_crc_detects_any_single_byte_corruption() {
        let item = sample_item();
        let mut buf = Vec::new();
        item.encode_into(&mut buf);
        for i in 0..buf.len() {
            let mut corrupt = buf.clone();
            corrupt[i] ^= 0x01;
            assert!(decode_record(&corrupt).is_err(), "flip at byte {i}");
        }
    }

    #[test]
    fn test_length_mismatch_rejected_before_payload() {
        let item = sample_item();
        let mut buf = Vec::new();
        item.encode_into(&mut buf);
        // Inflate body_len without fixing total_len.
        buf[41..45].copy_from_slice(&u32::MAX.to_le_bytes());
        let err = decode_record(&buf).unwrap_err();
        assert!(matches!(err, RaftError::Protocol(_)));
    }

    #[test]
    fn test_padding_encoding() {
        let mut buf = Vec::new();
        encode_padding(&mut buf, 64);
        assert_eq!(buf.len(), 64);
        let header = RecordHeader::decode(&{
            let mut b = buf.clone();
            b.resize(RECORD_FIXED_LEN.max(b.len()), 0);
            b
        })
        .unwrap();
        assert_eq!(header.magic, PADDING_MAGIC);
        assert_eq!(header.total_len, 64);
    }
}
