//! Android sparse image codec.

pub mod builder;
pub mod format;
pub mod reader;

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use thiserror::Error;

use crate::codec::CodecError;

pub use builder::SparseBuilder;
pub use format::{ChunkHeader, ChunkType, SPARSE_MAGIC, SparseHeader};
pub use reader::{ChunkReader, SparseReader};

#[derive(Error, Debug)]
pub enum SparseError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Decode error: {0}")]
    Codec(#[from] CodecError),

    #[error("Not a sparse image (magic 0x{0:08X})")]
    InvalidMagic(u32),

    #[error("Invalid sparse block size {0}")]
    InvalidBlockSize(u32),

    #[error("Invalid sparse chunk header size {0}")]
    InvalidChunkHeaderSize(u16),

    #[error("Malformed chunk type 0x{0:04X}")]
    MalformedChunk(u16),
}

impl SparseError {
    /// Convert for use behind `io::Read`.
    pub fn into_io(self) -> io::Error {
        match self {
            SparseError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// Check the magic at the current position, restoring the position afterwards.
pub fn is_sparse<R: Read + Seek>(reader: &mut R) -> io::Result<bool> {
    let start = reader.stream_position()?;
    let mut magic = [0u8; 4];
    let result = match reader.read_exact(&mut magic) {
        Ok(()) => Ok(u32::from_le_bytes(magic) == SPARSE_MAGIC),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    };
    reader.seek(SeekFrom::Start(start))?;
    result
}

pub fn is_sparse_file(path: &Path) -> io::Result<bool> {
    is_sparse(&mut File::open(path)?)
}

/// Open a sparse image file for streaming decode.
pub fn open_sparse(path: &Path) -> Result<SparseReader<BufReader<File>>, SparseError> {
    SparseReader::new(BufReader::new(File::open(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_is_sparse_detection() {
        let image = SparseBuilder::new(4096).finish();
        let mut cursor = Cursor::new(image);
        assert!(is_sparse(&mut cursor).unwrap());
        assert_eq!(cursor.position(), 0);

        assert!(!is_sparse(&mut Cursor::new(vec![0u8; 64])).unwrap());
        assert!(!is_sparse(&mut Cursor::new(vec![0x3A])).unwrap());
    }

    #[test]
    fn test_open_sparse_file() {
        let mut builder = SparseBuilder::new(512);
        builder.add_fill([9, 9, 9, 9], 2);
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), builder.finish()).unwrap();

        assert!(is_sparse_file(file.path()).unwrap());
        let mut out = Vec::new();
        open_sparse(file.path()).unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![9u8; 1024]);
    }

    #[test]
    fn test_into_io_keeps_io_errors() {
        let err = SparseError::Io(io::Error::new(io::ErrorKind::NotFound, "x")).into_io();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        let err = SparseError::MalformedChunk(1).into_io();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
