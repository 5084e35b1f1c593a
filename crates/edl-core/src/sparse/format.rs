//! Android sparse image on-disk structures.

use std::fmt;
use std::io::Cursor;

use crate::codec::{Record, get_u16, get_u32, put_u16, put_u32};

pub const SPARSE_MAGIC: u32 = 0xED26_FF3A;
pub const SPARSE_HEADER_SIZE: usize = 28;
pub const CHUNK_HEADER_SIZE: usize = 12;

/// 28-byte file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseHeader {
    pub magic: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub file_header_size: u16,
    pub chunk_header_size: u16,
    pub block_size: u32,
    pub total_blocks: u32,
    pub total_chunks: u32,
    pub image_checksum: u32,
}

impl SparseHeader {
    pub fn new(block_size: u32, total_blocks: u32, total_chunks: u32) -> Self {
        Self {
            magic: SPARSE_MAGIC,
            major_version: 1,
            minor_version: 0,
            file_header_size: SPARSE_HEADER_SIZE as u16,
            chunk_header_size: CHUNK_HEADER_SIZE as u16,
            block_size,
            total_blocks,
            total_chunks,
            image_checksum: 0,
        }
    }

    /// Size of the fully expanded image.
    pub fn decoded_len(&self) -> u64 {
        self.block_size as u64 * self.total_blocks as u64
    }
}

impl Record for SparseHeader {
    const SIZE: usize = SPARSE_HEADER_SIZE;
    const NAME: &'static str = "SparseHeader";

    fn write_to(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.magic);
        put_u16(buf, self.major_version);
        put_u16(buf, self.minor_version);
        put_u16(buf, self.file_header_size);
        put_u16(buf, self.chunk_header_size);
        put_u32(buf, self.block_size);
        put_u32(buf, self.total_blocks);
        put_u32(buf, self.total_chunks);
        put_u32(buf, self.image_checksum);
    }

    fn read_from(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        Ok(Self {
            magic: get_u32(cursor)?,
            major_version: get_u16(cursor)?,
            minor_version: get_u16(cursor)?,
            file_header_size: get_u16(cursor)?,
            chunk_header_size: get_u16(cursor)?,
            block_size: get_u32(cursor)?,
            total_blocks: get_u32(cursor)?,
            total_chunks: get_u32(cursor)?,
            image_checksum: get_u32(cursor)?,
        })
    }
}

/// Chunk kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ChunkType {
    Raw = 0xCAC1,
    Fill = 0xCAC2,
    DontCare = 0xCAC3,
    Crc32 = 0xCAC4,
}

impl ChunkType {
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0xCAC1 => Some(Self::Raw),
            0xCAC2 => Some(Self::Fill),
            0xCAC3 => Some(Self::DontCare),
            0xCAC4 => Some(Self::Crc32),
            _ => None,
        }
    }

    pub const fn code(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkType::Raw => write!(f, "RAW"),
            ChunkType::Fill => write!(f, "FILL"),
            ChunkType::DontCare => write!(f, "DONT_CARE"),
            ChunkType::Crc32 => write!(f, "CRC32"),
        }
    }
}

/// 12-byte chunk header. `total_bytes` includes the header itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_type: u16,
    pub reserved: u16,
    pub chunk_blocks: u32,
    pub total_bytes: u32,
}

impl ChunkHeader {
    pub fn new(kind: ChunkType, chunk_blocks: u32, payload_len: usize) -> Self {
        Self {
            chunk_type: kind.code(),
            reserved: 0,
            chunk_blocks,
            total_bytes: (CHUNK_HEADER_SIZE + payload_len) as u32,
        }
    }

    pub fn kind(&self) -> Option<ChunkType> {
        ChunkType::from_code(self.chunk_type)
    }

    /// Number of output bytes this chunk expands to.
    pub fn output_len(&self, block_size: u32) -> u64 {
        self.chunk_blocks as u64 * block_size as u64
    }
}

impl Record for ChunkHeader {
    const SIZE: usize = CHUNK_HEADER_SIZE;
    const NAME: &'static str = "ChunkHeader";

    fn write_to(&self, buf: &mut Vec<u8>) {
        put_u16(buf, self.chunk_type);
        put_u16(buf, self.reserved);
        put_u32(buf, self.chunk_blocks);
        put_u32(buf, self.total_bytes);
    }

    fn read_from(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        Ok(Self {
            chunk_type: get_u16(cursor)?,
            reserved: get_u16(cursor)?,
            chunk_blocks: get_u32(cursor)?,
            total_bytes: get_u32(cursor)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = SparseHeader::new(4096, 2, 2);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), 28);
        assert_eq!(&bytes[0..4], &[0x3A, 0xFF, 0x26, 0xED]);
        assert_eq!(&bytes[8..10], &28u16.to_le_bytes());
        assert_eq!(SparseHeader::from_bytes(&bytes).unwrap(), header);
        assert_eq!(header.decoded_len(), 8192);
    }

    #[test]
    fn test_chunk_header() {
        let chunk = ChunkHeader::new(ChunkType::Fill, 3, 4);
        assert_eq!(chunk.total_bytes, 16);
        assert_eq!(chunk.kind(), Some(ChunkType::Fill));
        assert_eq!(chunk.output_len(512), 1536);
        assert_eq!(ChunkHeader::from_bytes(&chunk.to_bytes()).unwrap(), chunk);
        assert!(ChunkHeader::from_bytes(&[0u8; 11]).is_err());
        assert_eq!(ChunkType::from_code(0xCAC5), None);
    }
}
