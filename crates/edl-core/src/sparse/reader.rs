//! Streaming sparse image decoding.
//!
//! [`ChunkReader`] walks chunk headers and hands payloads to the caller.
//! [`SparseReader`] builds on it and expands the image through `io::Read`.

use std::io::{self, Read};

use tracing::trace;

use crate::codec::{CodecError, Record};

use super::SparseError;
use super::format::{
    CHUNK_HEADER_SIZE, ChunkHeader, ChunkType, SPARSE_HEADER_SIZE, SPARSE_MAGIC, SparseHeader,
};

/// Read until `buf` is full or the source ends. Returns bytes read.
fn read_full<R: Read>(inner: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match inner.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn skip<R: Read>(inner: &mut R, len: u64) -> io::Result<()> {
    if len == 0 {
        return Ok(());
    }
    let skipped = io::copy(&mut inner.take(len), &mut io::sink())?;
    if skipped < len {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    Ok(())
}

/// Forward-only iterator over the chunks of a sparse image.
pub struct ChunkReader<R> {
    inner: R,
    header: SparseHeader,
    chunks_left: u32,
}

impl<R: Read> ChunkReader<R> {
    /// Read and validate the file header.
    pub fn new(mut inner: R) -> Result<Self, SparseError> {
        let mut raw = [0u8; SPARSE_HEADER_SIZE];
        let n = read_full(&mut inner, &mut raw)?;
        let header = SparseHeader::from_bytes(&raw[..n])?;
        if header.magic != SPARSE_MAGIC {
            return Err(SparseError::InvalidMagic(header.magic));
        }
        if header.block_size == 0 || header.block_size % 4 != 0 {
            return Err(SparseError::InvalidBlockSize(header.block_size));
        }
        if (header.chunk_header_size as usize) < CHUNK_HEADER_SIZE {
            return Err(SparseError::InvalidChunkHeaderSize(header.chunk_header_size));
        }
        skip(
            &mut inner,
            (header.file_header_size as u64).saturating_sub(SPARSE_HEADER_SIZE as u64),
        )?;

        Ok(Self {
            inner,
            chunks_left: header.total_chunks,
            header,
        })
    }

    pub fn header(&self) -> &SparseHeader {
        &self.header
    }

    /// Size of the fully expanded image.
    pub fn decoded_len(&self) -> u64 {
        self.header.decoded_len()
    }

    pub fn block_size(&self) -> u32 {
        self.header.block_size
    }

    pub fn remaining_chunks(&self) -> u32 {
        self.chunks_left
    }

    /// Next chunk header, or `None` once the declared chunks are consumed
    /// or the source ends cleanly on a chunk boundary.
    pub fn next_chunk(&mut self) -> Result<Option<(ChunkType, ChunkHeader)>, SparseError> {
        if self.chunks_left == 0 {
            return Ok(None);
        }
        let mut raw = [0u8; CHUNK_HEADER_SIZE];
        let n = read_full(&mut self.inner, &mut raw)?;
        if n == 0 {
            self.chunks_left = 0;
            return Ok(None);
        }
        if n < CHUNK_HEADER_SIZE {
            return Err(CodecError::TruncatedInput {
                record: ChunkHeader::NAME,
                expected: CHUNK_HEADER_SIZE,
                actual: n,
            }
            .into());
        }
        let chunk = ChunkHeader::from_bytes(&raw)?;
        skip(
            &mut self.inner,
            (self.header.chunk_header_size as usize - CHUNK_HEADER_SIZE) as u64,
        )?;
        self.chunks_left -= 1;

        let kind = chunk
            .kind()
            .ok_or(SparseError::MalformedChunk(chunk.chunk_type))?;
        trace!(kind = %kind, blocks = chunk.chunk_blocks, "Chunk header");
        Ok(Some((kind, chunk)))
    }

    /// Read literal RAW payload bytes.
    pub fn read_payload(&mut self, buf: &mut [u8]) -> Result<(), SparseError> {
        self.inner.read_exact(buf)?;
        Ok(())
    }

    /// Read the 4-byte FILL pattern.
    pub fn read_fill_pattern(&mut self) -> Result<[u8; 4], SparseError> {
        let mut pattern = [0u8; 4];
        self.inner.read_exact(&mut pattern)?;
        Ok(pattern)
    }

    /// Consume the 4-byte checksum trailing a CRC32 chunk.
    pub fn read_crc32(&mut self) -> Result<u32, SparseError> {
        let mut raw = [0u8; 4];
        self.inner.read_exact(&mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

enum Active {
    Raw { remaining: u64 },
    Fill { pattern: [u8; 4], pos: usize, remaining: u64 },
    Zero { remaining: u64 },
    Exhausted,
}

impl Active {
    fn remaining(&self) -> u64 {
        match self {
            Active::Raw { remaining }
            | Active::Fill { remaining, .. }
            | Active::Zero { remaining } => *remaining,
            Active::Exhausted => 0,
        }
    }
}

/// Expands a sparse image into its raw bytes.
///
/// FILL chunks replay their pattern, DONT_CARE chunks read as zeros and
/// CRC32 chunks contribute nothing. Decoding errors surface as
/// `io::ErrorKind::InvalidData` wrapping a [`SparseError`].
pub struct SparseReader<R> {
    chunks: ChunkReader<R>,
    active: Active,
}

impl<R: Read> SparseReader<R> {
    /// Validate the header and position on the first chunk.
    pub fn new(inner: R) -> Result<Self, SparseError> {
        let mut reader = Self {
            chunks: ChunkReader::new(inner)?,
            active: Active::Zero { remaining: 0 },
        };
        reader.advance()?;
        Ok(reader)
    }

    pub fn header(&self) -> &SparseHeader {
        self.chunks.header()
    }

    pub fn decoded_len(&self) -> u64 {
        self.chunks.decoded_len()
    }

    /// Load the next data-bearing chunk. Returns false at end of image.
    fn advance(&mut self) -> Result<bool, SparseError> {
        let block_size = self.chunks.block_size();
        loop {
            let Some((kind, chunk)) = self.chunks.next_chunk()? else {
                self.active = Active::Exhausted;
                return Ok(false);
            };
            let remaining = chunk.output_len(block_size);
            self.active = match kind {
                ChunkType::Raw => Active::Raw { remaining },
                ChunkType::Fill => Active::Fill {
                    pattern: self.chunks.read_fill_pattern()?,
                    pos: 0,
                    remaining,
                },
                ChunkType::DontCare => Active::Zero { remaining },
                ChunkType::Crc32 => {
                    self.chunks.read_crc32()?;
                    continue;
                }
            };
            return Ok(true);
        }
    }

    fn fill(&mut self, out: &mut [u8]) -> Result<usize, SparseError> {
        let mut written = 0;
        while written < out.len() {
            if self.active.remaining() == 0 {
                if matches!(self.active, Active::Exhausted) || !self.advance()? {
                    break;
                }
                continue;
            }
            let want = (out.len() - written) as u64;
            let dst = &mut out[written..];
            let n = match &mut self.active {
                Active::Raw { remaining } => {
                    let n = want.min(*remaining) as usize;
                    self.chunks.read_payload(&mut dst[..n])?;
                    *remaining -= n as u64;
                    n
                }
                Active::Fill {
                    pattern,
                    pos,
                    remaining,
                } => {
                    let n = want.min(*remaining) as usize;
                    for b in &mut dst[..n] {
                        *b = pattern[*pos];
                        *pos = (*pos + 1) % 4;
                    }
                    *remaining -= n as u64;
                    n
                }
                Active::Zero { remaining } => {
                    let n = want.min(*remaining) as usize;
                    dst[..n].fill(0);
                    *remaining -= n as u64;
                    n
                }
                Active::Exhausted => break,
            };
            written += n;
        }
        Ok(written)
    }
}

impl<R: Read> Read for SparseReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.fill(buf).map_err(SparseError::into_io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse::SparseBuilder;
    use std::io::Cursor;

    fn decode(image: Vec<u8>) -> Vec<u8> {
        let mut out = Vec::new();
        SparseReader::new(Cursor::new(image))
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn test_raw_then_dont_care() {
        let mut builder = SparseBuilder::new(4096);
        builder.add_raw(&[0xAA; 4096]).add_dont_care(1);
        let image = builder.finish();

        let reader = SparseReader::new(Cursor::new(image.clone())).unwrap();
        assert_eq!(reader.decoded_len(), 8192);

        let out = decode(image);
        assert_eq!(out.len(), 8192);
        assert!(out[..4096].iter().all(|&b| b == 0xAA));
        assert!(out[4096..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_fill_pattern_repeats() {
        let mut builder = SparseBuilder::new(4096);
        builder.add_fill([0x01, 0x02, 0x03, 0x04], 1);
        let out = decode(builder.finish());
        assert_eq!(out.len(), 4096);
        assert_eq!(out, [1u8, 2, 3, 4].repeat(1024));
    }

    #[test]
    fn test_small_reads_cross_chunks() {
        let mut builder = SparseBuilder::new(8);
        builder
            .add_raw(b"abcdefgh")
            .add_crc32(7)
            .add_fill(*b"wxyz", 1)
            .add_dont_care(1);
        let mut reader = SparseReader::new(Cursor::new(builder.finish())).unwrap();

        let mut out = Vec::new();
        let mut buf = [0u8; 3];
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"abcdefghwxyzwxyz\0\0\0\0\0\0\0\0");
    }

    #[test]
    fn test_invalid_magic() {
        let mut image = SparseBuilder::new(4096).finish();
        image[0] = 0;
        assert!(matches!(
            SparseReader::new(Cursor::new(image)),
            Err(SparseError::InvalidMagic(_))
        ));
    }

    #[test]
    fn test_truncated_header() {
        let image = SparseBuilder::new(4096).finish();
        assert!(matches!(
            SparseReader::new(Cursor::new(image[..20].to_vec())),
            Err(SparseError::Codec(CodecError::TruncatedInput { .. }))
        ));
    }

    #[test]
    fn test_malformed_chunk() {
        let mut image = SparseHeader::new(4096, 1, 1).to_bytes();
        image.extend_from_slice(
            &ChunkHeader {
                chunk_type: 0xCAC9,
                reserved: 0,
                chunk_blocks: 1,
                total_bytes: 12,
            }
            .to_bytes(),
        );
        assert!(matches!(
            SparseReader::new(Cursor::new(image)),
            Err(SparseError::MalformedChunk(0xCAC9))
        ));
    }

    #[test]
    fn test_malformed_chunk_mid_stream() {
        let mut builder = SparseBuilder::new(8);
        builder.add_raw(b"12345678");
        let mut image = builder.finish();
        // Bump total_chunks and append an unknown chunk.
        image[20..24].copy_from_slice(&2u32.to_le_bytes());
        image.extend_from_slice(&[0x00, 0xCB, 0, 0, 1, 0, 0, 0, 12, 0, 0, 0]);

        let mut reader = SparseReader::new(Cursor::new(image)).unwrap();
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let inner = err.get_ref().and_then(|e| e.downcast_ref::<SparseError>());
        assert!(matches!(inner, Some(SparseError::MalformedChunk(0xCB00))));
    }

    #[test]
    fn test_extended_header_sizes_skipped() {
        let mut header = SparseHeader::new(8, 1, 1);
        header.file_header_size = 32;
        header.chunk_header_size = 16;
        let mut image = header.to_bytes();
        image.extend_from_slice(&[0xEE; 4]);
        image.extend_from_slice(&ChunkHeader::new(ChunkType::Raw, 1, 12).to_bytes());
        image.extend_from_slice(&[0xEE; 4]);
        image.extend_from_slice(b"payload!");
        assert_eq!(decode(image), b"payload!");
    }

    #[test]
    fn test_chunk_reader_walks_headers() {
        let mut builder = SparseBuilder::new(4);
        builder.add_fill(*b"abcd", 2).add_crc32(1);
        let mut chunks = ChunkReader::new(Cursor::new(builder.finish())).unwrap();
        assert_eq!(chunks.remaining_chunks(), 2);

        let (kind, header) = chunks.next_chunk().unwrap().unwrap();
        assert_eq!(kind, ChunkType::Fill);
        assert_eq!(header.chunk_blocks, 2);
        assert_eq!(&chunks.read_fill_pattern().unwrap(), b"abcd");

        let (kind, _) = chunks.next_chunk().unwrap().unwrap();
        assert_eq!(kind, ChunkType::Crc32);
        assert_eq!(chunks.read_crc32().unwrap(), 1);
        assert!(chunks.next_chunk().unwrap().is_none());
    }
}
