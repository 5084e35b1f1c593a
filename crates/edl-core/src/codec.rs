//! Fixed-layout little-endian record codec.
//!
//! Every on-wire or on-disk structure used by this crate (Sahara packets,
//! sparse headers, GPT structures) implements [`Record`]. Layouts are packed:
//! no padding beyond declared fields, byte arrays stored verbatim.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Truncated input for {record}: expected {expected} bytes, got {actual}")]
    TruncatedInput {
        record: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{record}.{field} out of range: {value}")]
    OutOfRange {
        record: &'static str,
        field: &'static str,
        value: u64,
    },
}

/// A fixed-size record with a packed little-endian layout.
pub trait Record: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;
    /// Name used in error messages.
    const NAME: &'static str;

    /// Append the encoded record to `buf`.
    fn write_to(&self, buf: &mut Vec<u8>);

    /// Decode from a cursor that is known to hold at least `SIZE` bytes.
    fn read_from(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Self>;

    /// Encode into a freshly allocated buffer of exactly `SIZE` bytes.
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        self.write_to(&mut buf);
        debug_assert_eq!(buf.len(), Self::SIZE);
        buf
    }

    /// Decode from the front of `data`. Trailing bytes are ignored.
    fn from_bytes(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < Self::SIZE {
            return Err(CodecError::TruncatedInput {
                record: Self::NAME,
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(&data[..Self::SIZE]);
        // Length was checked above, so the cursor cannot run dry.
        Self::read_from(&mut cursor).map_err(|_| CodecError::TruncatedInput {
            record: Self::NAME,
            expected: Self::SIZE,
            actual: data.len(),
        })
    }
}

pub(crate) fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn get_u16(cursor: &mut Cursor<&[u8]>) -> std::io::Result<u16> {
    cursor.read_u16::<LittleEndian>()
}

pub(crate) fn get_u32(cursor: &mut Cursor<&[u8]>) -> std::io::Result<u32> {
    cursor.read_u32::<LittleEndian>()
}

pub(crate) fn get_u64(cursor: &mut Cursor<&[u8]>) -> std::io::Result<u64> {
    cursor.read_u64::<LittleEndian>()
}

pub(crate) fn get_array<const N: usize>(cursor: &mut Cursor<&[u8]>) -> std::io::Result<[u8; N]> {
    let mut out = [0u8; N];
    cursor.read_exact(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    struct Pair {
        a: u16,
        b: u64,
        tag: [u8; 3],
    }

    impl Record for Pair {
        const SIZE: usize = 13;
        const NAME: &'static str = "Pair";

        fn write_to(&self, buf: &mut Vec<u8>) {
            put_u16(buf, self.a);
            put_u64(buf, self.b);
            buf.extend_from_slice(&self.tag);
        }

        fn read_from(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
            Ok(Self {
                a: get_u16(cursor)?,
                b: get_u64(cursor)?,
                tag: get_array(cursor)?,
            })
        }
    }

    #[test]
    fn test_little_endian_layout() {
        let p = Pair {
            a: 0x0102,
            b: 0x1122334455667788,
            tag: *b"abc",
        };
        let bytes = p.to_bytes();
        assert_eq!(
            bytes,
            [0x02, 0x01, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, b'a', b'b', b'c']
        );
        assert_eq!(Pair::from_bytes(&bytes).unwrap(), p);
    }

    #[test]
    fn test_truncated_input() {
        let err = Pair::from_bytes(&[0u8; 12]).unwrap_err();
        assert_eq!(
            err,
            CodecError::TruncatedInput {
                record: "Pair",
                expected: 13,
                actual: 12
            }
        );
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut bytes = Pair {
            a: 7,
            b: 9,
            tag: [1, 2, 3],
        }
        .to_bytes();
        bytes.extend_from_slice(&[0xFF; 8]);
        assert_eq!(Pair::from_bytes(&bytes).unwrap().a, 7);
    }
}
