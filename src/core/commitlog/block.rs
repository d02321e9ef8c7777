// src/core/commitlog/block.rs

//! Commit-log block header: wire layout and checksums.
//!
//! Layout (little-endian):
//!
//! | field            | size |
//! |------------------|------|
//! | magic            | 10   |
//! | header length    | 1    |
//! | compression code | 1    |
//! | payload checksum | 4    |
//! | uncompressed len | 4    |
//! | compressed len   | 4    |
//! | revision         | 8    |
//! | cluster id       | 8    |
//! | header checksum  | 2    |
//!
//! Both checksums are Fletcher-32: the header checksum covers the header
//! bytes excluding itself, the payload checksum covers the decompressed
//! payload. Legacy fragments carry a magic suffix byte of `'1'` and omit the
//! cluster id; their cluster id defaults to 0, which the replication slave
//! treats as "always skip".

use crate::core::TesseraError;
use bytes::{Buf, BufMut, BytesMut};

/// Magic for payload blocks.
pub const MAGIC_DATA: &[u8; 10] = b"TSRLOGDAT2";
/// Magic for link blocks; the body names another log directory.
pub const MAGIC_LINK: &[u8; 10] = b"TSRLOGLNK2";
/// Magic marking the tail of a closed fragment.
pub const MAGIC_EOF: &[u8; 10] = b"TSRLOGEOF2";

/// Legacy variants (no cluster id field).
pub const MAGIC_DATA_V1: &[u8; 10] = b"TSRLOGDAT1";
pub const MAGIC_LINK_V1: &[u8; 10] = b"TSRLOGLNK1";

pub const COMPRESSION_NONE: u8 = 0;
pub const COMPRESSION_ZSTD: u8 = 1;

/// Fixed base header: magic through compressed length, plus the trailing
/// 2-byte header checksum.
pub const BASE_HEADER_LENGTH: usize = 26;
/// Current header: base extended by revision and cluster id.
pub const HEADER_LENGTH: usize = BASE_HEADER_LENGTH + 16;
/// Legacy header: base extended by revision only.
pub const LEGACY_HEADER_LENGTH: usize = BASE_HEADER_LENGTH + 8;

/// Prefix needed before the header length byte is known.
const LENGTH_PREFIX: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Data,
    Link,
    Eof,
}

/// Fletcher-32 over the given bytes, as used for both header and payload
/// checksums of the block format. Sums are folded every 359 words, which
/// keeps both accumulators inside u32.
pub fn fletcher32(data: &[u8]) -> u32 {
    let mut sum1: u32 = 0xffff;
    let mut sum2: u32 = 0xffff;
    for block in data.chunks(359 * 2) {
        let mut words = block.chunks_exact(2);
        for word in &mut words {
            sum1 += u32::from(u16::from_le_bytes([word[0], word[1]]));
            sum2 += sum1;
        }
        if let [last] = words.remainder() {
            sum1 += u32::from(*last);
            sum2 += sum1;
        }
        sum1 = (sum1 & 0xffff) + (sum1 >> 16);
        sum2 = (sum2 & 0xffff) + (sum2 >> 16);
    }
    sum1 = (sum1 & 0xffff) + (sum1 >> 16);
    sum2 = (sum2 & 0xffff) + (sum2 >> 16);
    (sum2 << 16) | sum1
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub magic: [u8; 10],
    pub compression: u8,
    pub data_checksum: u32,
    pub data_len: u32,
    pub data_zlen: u32,
    pub revision: i64,
    pub cluster_id: u64,
}

/// Outcome of decoding the next header out of a byte buffer.
pub enum HeaderDecode {
    /// A complete, checksum-verified header plus its encoded length.
    Header(BlockHeader, usize),
    /// The remaining bytes are shorter than a header: a crash-in-progress
    /// tail, reported as a clean end of stream.
    Truncated,
}

impl BlockHeader {
    pub fn new(magic: &[u8; 10], revision: i64, cluster_id: u64) -> Self {
        Self {
            magic: *magic,
            compression: COMPRESSION_NONE,
            data_checksum: 0,
            data_len: 0,
            data_zlen: 0,
            revision,
            cluster_id,
        }
    }

    pub fn kind(&self) -> Option<BlockKind> {
        match &self.magic {
            MAGIC_DATA | MAGIC_DATA_V1 => Some(BlockKind::Data),
            MAGIC_LINK | MAGIC_LINK_V1 => Some(BlockKind::Link),
            MAGIC_EOF => Some(BlockKind::Eof),
            _ => None,
        }
    }

    /// Legacy fragments are recognizable by a magic suffix byte other than `'2'`.
    pub fn is_legacy(&self) -> bool {
        self.magic[9] != b'2'
    }

    pub fn encoded_length(&self) -> usize {
        if self.is_legacy() {
            LEGACY_HEADER_LENGTH
        } else {
            HEADER_LENGTH
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        debug_assert!(!self.is_legacy());
        let start = buf.len();
        buf.put_slice(&self.magic);
        buf.put_u8(HEADER_LENGTH as u8);
        buf.put_u8(self.compression);
        buf.put_u32_le(self.data_checksum);
        buf.put_u32_le(self.data_len);
        buf.put_u32_le(self.data_zlen);
        buf.put_i64_le(self.revision);
        buf.put_u64_le(self.cluster_id);
        let checksum = fletcher32(&buf[start..]);
        buf.put_u16_le((checksum & 0xffff) as u16);
    }

    /// Decodes a header from the front of `buf` without consuming it.
    pub fn decode(buf: &[u8]) -> Result<HeaderDecode, TesseraError> {
        if buf.len() < LENGTH_PREFIX {
            return Ok(HeaderDecode::Truncated);
        }
        let header_len = buf[10] as usize;
        if header_len != HEADER_LENGTH && header_len != LEGACY_HEADER_LENGTH {
            return Err(TesseraError::CorruptCommitLog(format!(
                "bad header length {header_len}"
            )));
        }
        if buf.len() < header_len {
            return Ok(HeaderDecode::Truncated);
        }

        let mut magic = [0u8; 10];
        magic.copy_from_slice(&buf[..10]);
        let legacy = magic[9] != b'2';
        if legacy != (header_len == LEGACY_HEADER_LENGTH) {
            return Err(TesseraError::CorruptCommitLog(
                "header length does not match magic version".into(),
            ));
        }

        let computed = fletcher32(&buf[..header_len - 2]);
        let mut cursor = &buf[11..header_len];
        let compression = cursor.get_u8();
        let data_checksum = cursor.get_u32_le();
        let data_len = cursor.get_u32_le();
        let data_zlen = cursor.get_u32_le();
        let revision = cursor.get_i64_le();
        let cluster_id = if legacy { 0 } else { cursor.get_u64_le() };
        let stored = cursor.get_u16_le();

        if stored != (computed & 0xffff) as u16 {
            return Err(TesseraError::CorruptCommitLog(format!(
                "header checksum mismatch: stored={stored:#06x} computed={:#06x}",
                (computed & 0xffff) as u16
            )));
        }

        let header = BlockHeader {
            magic,
            compression,
            data_checksum,
            data_len,
            data_zlen,
            revision,
            cluster_id,
        };
        if header.kind().is_none() {
            return Err(TesseraError::CorruptCommitLog(format!(
                "unknown block magic {:?}",
                String::from_utf8_lossy(&magic)
            )));
        }
        Ok(HeaderDecode::Header(header, header_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let mut header = BlockHeader::new(MAGIC_DATA, 77, 9);
        header.compression = COMPRESSION_ZSTD;
        header.data_checksum = 0xdead_beef;
        header.data_len = 100;
        header.data_zlen = 60;

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_LENGTH);

        match BlockHeader::decode(&buf).unwrap() {
            HeaderDecode::Header(decoded, len) => {
                assert_eq!(decoded, header);
                assert_eq!(len, HEADER_LENGTH);
            }
            HeaderDecode::Truncated => panic!("unexpected truncation"),
        }
    }

    #[test]
    fn corrupted_header_checksum_is_detected() {
        let header = BlockHeader::new(MAGIC_DATA, 1, 1);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        buf[14] ^= 0xff;
        assert!(matches!(
            BlockHeader::decode(&buf),
            Err(TesseraError::CorruptCommitLog(_))
        ));
    }

    #[test]
    fn short_buffer_is_clean_truncation() {
        let header = BlockHeader::new(MAGIC_DATA, 1, 1);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert!(matches!(
            BlockHeader::decode(&buf[..HEADER_LENGTH - 5]).unwrap(),
            HeaderDecode::Truncated
        ));
        assert!(matches!(
            BlockHeader::decode(&buf[..4]).unwrap(),
            HeaderDecode::Truncated
        ));
    }

    #[test]
    fn fletcher32_is_stable() {
        // Fixed vectors pin the wire format.
        assert_eq!(fletcher32(b""), 0xffff_ffff);
        assert_ne!(fletcher32(b"abcde"), fletcher32(b"abcdf"));
        assert_eq!(fletcher32(b"abcde"), fletcher32(b"abcde"));
    }
}
