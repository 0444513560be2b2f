//! On-disk layout of the pool backing file
//!
//! A fixed header is followed by a linear log of frames. Everything is
//! little-endian. Each frame carries a CRC32C over its contents so a
//! reader never consumes a partially written or damaged record.
//!
//! ```text
//! header:  magic(4) version(2) capacity(8) cursor(8) count(4) generation(8)
//! frame:   kind(1) key_len(2) value_len(4) created_ns(8) ttl_ns(8)
//!          version(8) key value crc32c(4)
//! ```

use crate::error::{MventError, Result};

/// Layout constants
pub mod constants {
    /// Magic bytes at offset 0
    pub const MAGIC: [u8; 4] = *b"MVNT";
    /// Current layout version
    pub const LAYOUT_VERSION: u16 = 1;
    /// Size of the fixed pool header
    pub const HEADER_SIZE: usize = 34;
    /// Size of the fixed part of a frame, before key and value bytes
    pub const FRAME_FIXED_SIZE: usize = 31;
    /// Trailing checksum size
    pub const FRAME_CRC_SIZE: usize = 4;
    /// Largest representable key
    pub const MAX_KEY_LEN: usize = u16::MAX as usize;
}

use constants::*;

/// Frame type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Entry is present with a value
    Live,
    /// Entry was deleted or expired
    Tomb,
}

impl FrameKind {
    fn as_u8(self) -> u8 {
        match self {
            FrameKind::Live => 1,
            FrameKind::Tomb => 2,
        }
    }

    fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            1 => Ok(FrameKind::Live),
            2 => Ok(FrameKind::Tomb),
            other => Err(MventError::corrupt(format!("unknown frame type {}", other))),
        }
    }
}

/// Pool header mirrored at the start of the mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolHeader {
    /// Total capacity of the backing file in bytes
    pub capacity: u64,
    /// Offset one past the last written frame
    pub cursor: u64,
    /// Number of live entries
    pub entry_count: u32,
    /// Incremented on every mutation; attached processes resync on change
    pub generation: u64,
}

impl PoolHeader {
    /// Header for a freshly initialized pool
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            cursor: HEADER_SIZE as u64,
            entry_count: 0,
            generation: 0,
        }
    }

    /// Serialize into the first `HEADER_SIZE` bytes of `buf`
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..6].copy_from_slice(&LAYOUT_VERSION.to_le_bytes());
        buf[6..14].copy_from_slice(&self.capacity.to_le_bytes());
        buf[14..22].copy_from_slice(&self.cursor.to_le_bytes());
        buf[22..26].copy_from_slice(&self.entry_count.to_le_bytes());
        buf[26..34].copy_from_slice(&self.generation.to_le_bytes());
    }

    /// Parse and validate the header at the start of `buf`
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(MventError::corrupt("file shorter than header"));
        }
        if buf[0..4] != MAGIC {
            return Err(MventError::corrupt("bad magic"));
        }
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version != LAYOUT_VERSION {
            return Err(MventError::corrupt(format!(
                "unsupported layout version {}",
                version
            )));
        }
        let capacity = u64::from_le_bytes(buf[6..14].try_into().unwrap());
        let cursor = u64::from_le_bytes(buf[14..22].try_into().unwrap());
        let entry_count = u32::from_le_bytes(buf[22..26].try_into().unwrap());
        let generation = u64::from_le_bytes(buf[26..34].try_into().unwrap());

        if cursor < HEADER_SIZE as u64 || cursor > capacity {
            return Err(MventError::corrupt("write cursor out of bounds"));
        }
        Ok(Self {
            capacity,
            cursor,
            entry_count,
            generation,
        })
    }
}

/// A frame decoded from the log, borrowing nothing from the mapping
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub key: String,
    pub created_ns: u64,
    pub ttl_ns: u64,
    pub version: u64,
    /// Absolute offset of the value bytes within the file
    pub value_offset: usize,
    pub value_len: usize,
    /// Total encoded size of the frame including checksum
    pub total_len: usize,
}

/// Encoded size of a frame with the given key and value lengths
pub fn frame_len(key_len: usize, value_len: usize) -> usize {
    FRAME_FIXED_SIZE + key_len + value_len + FRAME_CRC_SIZE
}

/// Write a frame at `buf[offset..]`, returning its total length
///
/// The caller has verified the frame fits; key length is bounded by
/// `MAX_KEY_LEN` at the pool API boundary.
pub fn write_frame(
    buf: &mut [u8],
    offset: usize,
    kind: FrameKind,
    key: &str,
    created_ns: u64,
    ttl_ns: u64,
    version: u64,
    value: &[u8],
) -> usize {
    let key_bytes = key.as_bytes();
    let total = frame_len(key_bytes.len(), value.len());
    let frame = &mut buf[offset..offset + total];

    frame[0] = kind.as_u8();
    frame[1..3].copy_from_slice(&(key_bytes.len() as u16).to_le_bytes());
    frame[3..7].copy_from_slice(&(value.len() as u32).to_le_bytes());
    frame[7..15].copy_from_slice(&created_ns.to_le_bytes());
    frame[15..23].copy_from_slice(&ttl_ns.to_le_bytes());
    frame[23..31].copy_from_slice(&version.to_le_bytes());

    let key_end = FRAME_FIXED_SIZE + key_bytes.len();
    frame[FRAME_FIXED_SIZE..key_end].copy_from_slice(key_bytes);
    frame[key_end..key_end + value.len()].copy_from_slice(value);

    let crc = crc32c::crc32c(&frame[..total - FRAME_CRC_SIZE]);
    frame[total - FRAME_CRC_SIZE..].copy_from_slice(&crc.to_le_bytes());
    total
}

/// Read and validate the frame at `buf[offset..]`
pub fn read_frame(buf: &[u8], offset: usize) -> Result<Frame> {
    let end = buf.len();
    if offset + FRAME_FIXED_SIZE + FRAME_CRC_SIZE > end {
        return Err(MventError::corrupt("truncated frame header"));
    }
    let frame = &buf[offset..];
    let kind = FrameKind::from_u8(frame[0])?;
    let key_len = u16::from_le_bytes([frame[1], frame[2]]) as usize;
    let value_len = u32::from_le_bytes(frame[3..7].try_into().unwrap()) as usize;
    let total = frame_len(key_len, value_len);
    if offset + total > end {
        return Err(MventError::corrupt("frame extends past write cursor"));
    }

    let stored_crc = u32::from_le_bytes(
        frame[total - FRAME_CRC_SIZE..total].try_into().unwrap(),
    );
    let actual_crc = crc32c::crc32c(&frame[..total - FRAME_CRC_SIZE]);
    if stored_crc != actual_crc {
        return Err(MventError::corrupt("frame checksum mismatch"));
    }

    let created_ns = u64::from_le_bytes(frame[7..15].try_into().unwrap());
    let ttl_ns = u64::from_le_bytes(frame[15..23].try_into().unwrap());
    let version = u64::from_le_bytes(frame[23..31].try_into().unwrap());
    let key_end = FRAME_FIXED_SIZE + key_len;
    let key = std::str::from_utf8(&frame[FRAME_FIXED_SIZE..key_end])
        .map_err(|_| MventError::corrupt("key is not valid UTF-8"))?
        .to_string();

    Ok(Frame {
        kind,
        key,
        created_ns,
        ttl_ns,
        version,
        value_offset: offset + key_end,
        value_len,
        total_len: total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut buf = vec![0u8; HEADER_SIZE];
        let header = PoolHeader {
            capacity: 65536,
            cursor: 1234,
            entry_count: 7,
            generation: 99,
        };
        header.encode(&mut buf);
        assert_eq!(PoolHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut buf = vec![0u8; HEADER_SIZE];
        PoolHeader::new(4096).encode(&mut buf);
        buf[0] = b'X';
        assert!(matches!(
            PoolHeader::decode(&buf),
            Err(MventError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_header_rejects_bad_cursor() {
        let mut buf = vec![0u8; HEADER_SIZE];
        let mut header = PoolHeader::new(4096);
        header.cursor = 8192;
        header.encode(&mut buf);
        assert!(PoolHeader::decode(&buf).is_err());
    }

    #[test]
    fn test_frame_roundtrip() {
        let mut buf = vec![0u8; 4096];
        let total = write_frame(
            &mut buf,
            100,
            FrameKind::Live,
            "user",
            123456789,
            5_000_000_000,
            3,
            b"value bytes",
        );
        assert_eq!(total, frame_len(4, 11));

        let frame = read_frame(&buf, 100).unwrap();
        assert_eq!(frame.kind, FrameKind::Live);
        assert_eq!(frame.key, "user");
        assert_eq!(frame.created_ns, 123456789);
        assert_eq!(frame.ttl_ns, 5_000_000_000);
        assert_eq!(frame.version, 3);
        assert_eq!(
            &buf[frame.value_offset..frame.value_offset + frame.value_len],
            b"value bytes"
        );
        assert_eq!(frame.total_len, total);
    }

    #[test]
    fn test_tomb_frame_roundtrip() {
        let mut buf = vec![0u8; 256];
        write_frame(&mut buf, 0, FrameKind::Tomb, "gone", 1, 0, 9, b"");
        let frame = read_frame(&buf, 0).unwrap();
        assert_eq!(frame.kind, FrameKind::Tomb);
        assert_eq!(frame.value_len, 0);
        assert_eq!(frame.version, 9);
    }

    #[test]
    fn test_corrupted_frame_rejected() {
        let mut buf = vec![0u8; 256];
        let total = write_frame(&mut buf, 0, FrameKind::Live, "k", 1, 0, 1, b"v");
        buf[total / 2] ^= 0xff;
        assert!(matches!(
            read_frame(&buf, 0),
            Err(MventError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let mut buf = vec![0u8; 64];
        write_frame(&mut buf, 0, FrameKind::Live, "k", 1, 0, 1, b"v");
        let short = &buf[..10];
        assert!(read_frame(short, 0).is_err());
    }
}
