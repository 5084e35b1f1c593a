//! In-memory sparse image writer.

use crate::codec::Record;

use super::format::{ChunkHeader, ChunkType, SparseHeader};

/// Accumulates chunks and renders a complete sparse image.
#[derive(Debug, Clone)]
pub struct SparseBuilder {
    block_size: u32,
    total_blocks: u32,
    total_chunks: u32,
    body: Vec<u8>,
}

impl SparseBuilder {
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size,
            total_blocks: 0,
            total_chunks: 0,
            body: Vec::new(),
        }
    }

    fn push(&mut self, header: ChunkHeader, payload: &[u8]) -> &mut Self {
        self.body.extend_from_slice(&header.to_bytes());
        self.body.extend_from_slice(payload);
        self.total_blocks += header.chunk_blocks;
        self.total_chunks += 1;
        self
    }

    /// Literal data, zero-padded to a whole number of blocks.
    pub fn add_raw(&mut self, data: &[u8]) -> &mut Self {
        let bs = self.block_size as usize;
        let blocks = data.len().div_ceil(bs);
        let mut payload = data.to_vec();
        payload.resize(blocks * bs, 0);
        self.push(
            ChunkHeader::new(ChunkType::Raw, blocks as u32, payload.len()),
            &payload,
        )
    }

    pub fn add_fill(&mut self, pattern: [u8; 4], blocks: u32) -> &mut Self {
        self.push(ChunkHeader::new(ChunkType::Fill, blocks, 4), &pattern)
    }

    pub fn add_dont_care(&mut self, blocks: u32) -> &mut Self {
        self.push(ChunkHeader::new(ChunkType::DontCare, blocks, 0), &[])
    }

    pub fn add_crc32(&mut self, crc: u32) -> &mut Self {
        self.push(ChunkHeader::new(ChunkType::Crc32, 0, 4), &crc.to_le_bytes())
    }

    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    /// Render header and chunks.
    pub fn finish(&self) -> Vec<u8> {
        let header = SparseHeader::new(self.block_size, self.total_blocks, self.total_chunks);
        let mut out = header.to_bytes();
        out.extend_from_slice(&self.body);
        out
    }

    /// Encode a raw image, turning runs of blocks filled with one repeated
    /// 4-byte pattern into FILL chunks and everything else into RAW chunks.
    ///
    /// `block_size` must be a multiple of 4. A short tail block is zero-padded.
    pub fn encode(data: &[u8], block_size: u32) -> Vec<u8> {
        let bs = block_size as usize;
        let mut builder = SparseBuilder::new(block_size);
        let mut raw_run: Vec<u8> = Vec::new();
        let mut fill_run: Option<([u8; 4], u32)> = None;

        for block in data.chunks(bs) {
            let pattern = uniform_pattern(block, bs);
            if let (Some(p), Some((run_pattern, count))) = (pattern, fill_run.as_mut()) {
                if *run_pattern == p {
                    *count += 1;
                    continue;
                }
            }
            if let Some((rp, count)) = fill_run.take() {
                builder.add_fill(rp, count);
            }
            match pattern {
                Some(p) => {
                    if !raw_run.is_empty() {
                        builder.add_raw(&raw_run);
                        raw_run.clear();
                    }
                    fill_run = Some((p, 1));
                }
                None => {
                    raw_run.extend_from_slice(block);
                    raw_run.resize(raw_run.len().div_ceil(bs) * bs, 0);
                }
            }
        }
        if let Some((rp, count)) = fill_run {
            builder.add_fill(rp, count);
        }
        if !raw_run.is_empty() {
            builder.add_raw(&raw_run);
        }
        builder.finish()
    }
}

/// The repeated 4-byte pattern of a full block, if it has one.
fn uniform_pattern(block: &[u8], block_size: usize) -> Option<[u8; 4]> {
    if block.len() != block_size || block.len() < 4 {
        return None;
    }
    let pattern: [u8; 4] = block[..4].try_into().ok()?;
    block
        .chunks_exact(4)
        .all(|w| w == pattern)
        .then_some(pattern)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sparse::SparseReader;
    use std::io::{Cursor, Read};

    #[test]
    fn test_builder_counts() {
        let mut builder = SparseBuilder::new(512);
        builder
            .add_raw(&[1u8; 700])
            .add_dont_care(3)
            .add_crc32(0xdeadbeef);
        assert_eq!(builder.total_blocks(), 5);

        let image = builder.finish();
        let header = SparseHeader::from_bytes(&image).unwrap();
        assert_eq!(header.total_chunks, 3);
        assert_eq!(header.decoded_len(), 2560);
        // header + raw(12 + 1024) + dont_care(12) + crc(12 + 4)
        assert_eq!(image.len(), 28 + 1036 + 12 + 16);
    }

    #[test]
    fn test_encode_decodes_back() {
        let mut data = vec![0u8; 4096 * 2];
        data.extend(std::iter::repeat_n([1u8, 2, 3, 4], 1024).flatten());
        data.extend((0..4096u32).map(|i| (i % 251) as u8));

        let image = SparseBuilder::encode(&data, 4096);
        let header = SparseHeader::from_bytes(&image).unwrap();
        assert_eq!(header.total_chunks, 3);

        let mut decoded = Vec::new();
        SparseReader::new(Cursor::new(image))
            .unwrap()
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, data);
    }
}
