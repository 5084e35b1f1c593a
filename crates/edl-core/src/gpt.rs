//! GUID partition table parsing.

use std::io::Cursor;

use tracing::debug;

use crate::codec::{CodecError, Record, get_array, get_u32, get_u64, put_u32, put_u64};
use crate::partition::PartitionInfo;

pub const GPT_SIGNATURE: [u8; 8] = *b"EFI PART";

/// Sectors read from LUN start when probing a table.
pub const GPT_SCAN_SECTORS: u64 = 33;

/// GPT header (92 bytes, second sector of the disk).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GptHeader {
    pub signature: [u8; 8],
    pub revision: u32,
    pub header_size: u32,
    pub header_crc32: u32,
    pub reserved: u32,
    pub current_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: [u8; 16],
    pub entry_start_lba: u64,
    pub entry_count: u32,
    pub entry_size: u32,
    pub entry_array_crc32: u32,
}

impl Record for GptHeader {
    const SIZE: usize = 92;
    const NAME: &'static str = "GptHeader";

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.signature);
        put_u32(buf, self.revision);
        put_u32(buf, self.header_size);
        put_u32(buf, self.header_crc32);
        put_u32(buf, self.reserved);
        put_u64(buf, self.current_lba);
        put_u64(buf, self.backup_lba);
        put_u64(buf, self.first_usable_lba);
        put_u64(buf, self.last_usable_lba);
        buf.extend_from_slice(&self.disk_guid);
        put_u64(buf, self.entry_start_lba);
        put_u32(buf, self.entry_count);
        put_u32(buf, self.entry_size);
        put_u32(buf, self.entry_array_crc32);
    }

    fn read_from(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        Ok(Self {
            signature: get_array(cursor)?,
            revision: get_u32(cursor)?,
            header_size: get_u32(cursor)?,
            header_crc32: get_u32(cursor)?,
            reserved: get_u32(cursor)?,
            current_lba: get_u64(cursor)?,
            backup_lba: get_u64(cursor)?,
            first_usable_lba: get_u64(cursor)?,
            last_usable_lba: get_u64(cursor)?,
            disk_guid: get_array(cursor)?,
            entry_start_lba: get_u64(cursor)?,
            entry_count: get_u32(cursor)?,
            entry_size: get_u32(cursor)?,
            entry_array_crc32: get_u32(cursor)?,
        })
    }
}

/// Partition entry (128 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GptEntry {
    pub type_guid: [u8; 16],
    pub unique_guid: [u8; 16],
    pub first_lba: u64,
    pub last_lba: u64,
    pub attributes: u64,
    /// UTF-16LE, NUL padded.
    pub name: [u8; 72],
}

impl GptEntry {
    pub fn label(&self) -> String {
        let units: Vec<u16> = self
            .name
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        String::from_utf16_lossy(&units)
            .trim_end_matches('\0')
            .trim()
            .to_string()
    }

    pub fn is_unused(&self) -> bool {
        self.type_guid.iter().all(|&b| b == 0)
    }
}

impl Record for GptEntry {
    const SIZE: usize = 128;
    const NAME: &'static str = "GptEntry";

    fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.type_guid);
        buf.extend_from_slice(&self.unique_guid);
        put_u64(buf, self.first_lba);
        put_u64(buf, self.last_lba);
        put_u64(buf, self.attributes);
        buf.extend_from_slice(&self.name);
    }

    fn read_from(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        Ok(Self {
            type_guid: get_array(cursor)?,
            unique_guid: get_array(cursor)?,
            first_lba: get_u64(cursor)?,
            last_lba: get_u64(cursor)?,
            attributes: get_u64(cursor)?,
            name: get_array(cursor)?,
        })
    }
}

/// Sectors covered by the primary table: 34 on 512-byte media, 6 otherwise.
pub fn gpt_sector_count(sector_size: u32) -> u64 {
    if sector_size == 512 { 34 } else { 6 }
}

/// Synthetic descriptors for the primary and backup GPT regions.
pub fn pseudo_entries(lun: u32, sector_size: u32) -> [PartitionInfo; 2] {
    let count = gpt_sector_count(sector_size);
    let primary = PartitionInfo::new("PrimaryGPT", lun, 0, count, sector_size);
    let backup = PartitionInfo {
        label: "BackupGPT".into(),
        start_sector: format!("NUM_DISK_SECTORS-{}.", count - 1),
        ..PartitionInfo::new("", lun, 0, count - 1, sector_size)
    };
    [primary, backup]
}

/// Parse a raw LUN prefix (protective MBR, header, entries).
///
/// Returns an empty list when the signature is wrong. Iteration ends at
/// `entry_count` (clamped to the entries present in `raw`), at an entry whose
/// `last_lba < first_lba`, or at an unused entry. A header whose entry array
/// cannot be located in `raw` is an error.
pub fn parse_gpt(
    raw: &[u8],
    lun: u32,
    sector_size: u32,
    include_pseudo: bool,
) -> Result<Vec<PartitionInfo>, CodecError> {
    let sector = sector_size as usize;
    let header = GptHeader::from_bytes(raw.get(sector..).unwrap_or(&[]))?;
    if header.signature != GPT_SIGNATURE {
        debug!(lun, "No GPT signature");
        return Ok(Vec::new());
    }

    let stride = header.entry_size as usize;
    if stride < GptEntry::SIZE {
        return Err(CodecError::OutOfRange {
            record: GptHeader::NAME,
            field: "entry_size",
            value: header.entry_size as u64,
        });
    }
    let base = usize::try_from(header.entry_start_lba)
        .ok()
        .and_then(|lba| lba.checked_mul(sector))
        .ok_or(CodecError::OutOfRange {
            record: GptHeader::NAME,
            field: "entry_start_lba",
            value: header.entry_start_lba,
        })?;
    let available = raw.len().checked_sub(base).ok_or(CodecError::TruncatedInput {
        record: GptEntry::NAME,
        expected: base.saturating_add(GptEntry::SIZE),
        actual: raw.len(),
    })?;
    let count = (header.entry_count as usize).min(available / stride);
    if count < header.entry_count as usize {
        debug!(lun, declared = header.entry_count, readable = count, "Entry array extends past buffer");
    }
    let mut partitions = Vec::new();

    for i in 0..count {
        let offset = base + i * stride;
        let entry = GptEntry::from_bytes(&raw[offset..])?;
        if entry.last_lba < entry.first_lba || entry.is_unused() {
            break;
        }
        partitions.push(PartitionInfo::new(
            entry.label(),
            lun,
            entry.first_lba,
            entry.last_lba - entry.first_lba + 1,
            sector_size,
        ));
    }
    debug!(lun, count = partitions.len(), "GPT parsed");

    if include_pseudo {
        partitions.extend(pseudo_entries(lun, sector_size));
    }
    Ok(partitions)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn entry(label: &str, first: u64, last: u64) -> GptEntry {
        let mut name = [0u8; 72];
        for (i, u) in label.encode_utf16().enumerate() {
            name[i * 2..i * 2 + 2].copy_from_slice(&u.to_le_bytes());
        }
        GptEntry {
            type_guid: [0x11; 16],
            unique_guid: [0x22; 16],
            first_lba: first,
            last_lba: last,
            attributes: 0,
            name,
        }
    }

    /// Build MBR + header + entry array laid out on `sector_size` sectors.
    pub(crate) fn build_table(sector_size: u32, entries: &[GptEntry]) -> Vec<u8> {
        let sector = sector_size as usize;
        let header = GptHeader {
            signature: GPT_SIGNATURE,
            revision: 0x0001_0000,
            header_size: 92,
            header_crc32: 0,
            reserved: 0,
            current_lba: 1,
            backup_lba: 0,
            first_usable_lba: 34,
            last_usable_lba: 1000,
            disk_guid: [0; 16],
            entry_start_lba: 2,
            entry_count: entries.len() as u32,
            entry_size: 128,
            entry_array_crc32: 0,
        };
        let mut raw = vec![0u8; GPT_SCAN_SECTORS as usize * sector];
        raw[sector..sector + 92].copy_from_slice(&header.to_bytes());
        for (i, e) in entries.iter().enumerate() {
            let off = 2 * sector + i * 128;
            raw[off..off + 128].copy_from_slice(&e.to_bytes());
        }
        raw
    }

    #[test]
    fn test_single_entry_sector_count() {
        let raw = build_table(4096, &[entry("modem", 100, 199)]);
        let parts = parse_gpt(&raw, 0, 4096, false).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].label, "modem");
        assert_eq!(parts[0].start_sector, "100");
        assert_eq!(parts[0].sector_count, 100);
        assert_eq!(parts[0].bytes_per_sector, 4096);
    }

    #[test]
    fn test_terminator_entry() {
        let raw = build_table(512, &[entry("bad", 200, 100)]);
        assert!(parse_gpt(&raw, 0, 512, false).unwrap().is_empty());
    }

    #[test]
    fn test_stops_at_terminator() {
        let raw = build_table(
            512,
            &[entry("a", 34, 40), entry("end", 10, 5), entry("b", 50, 60)],
        );
        let parts = parse_gpt(&raw, 2, 512, false).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].lun, 2);
    }

    #[test]
    fn test_bad_signature_is_empty() {
        let mut raw = build_table(512, &[entry("a", 34, 40)]);
        raw[512] = b'X';
        assert!(parse_gpt(&raw, 0, 512, true).unwrap().is_empty());
    }

    #[test]
    fn test_label_trimmed() {
        let raw = build_table(512, &[entry("  boot_a ", 34, 40)]);
        let parts = parse_gpt(&raw, 0, 512, false).unwrap();
        assert_eq!(parts[0].label, "boot_a");
    }

    #[test]
    fn test_pseudo_entries() {
        let raw = build_table(512, &[entry("a", 34, 40)]);
        let parts = parse_gpt(&raw, 0, 512, true).unwrap();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].label, "PrimaryGPT");
        assert_eq!(parts[1].sector_count, 34);
        assert_eq!(parts[2].label, "BackupGPT");
        assert_eq!(parts[2].start_sector, "NUM_DISK_SECTORS-33.");
        assert_eq!(parts[2].sector_count, 33);

        let [primary, backup] = pseudo_entries(1, 4096);
        assert_eq!(primary.sector_count, 6);
        assert_eq!(backup.start_sector, "NUM_DISK_SECTORS-5.");
    }

    fn header_of(raw: &[u8], sector: usize) -> GptHeader {
        GptHeader::from_bytes(&raw[sector..]).unwrap()
    }

    fn with_header(raw: &mut [u8], sector: usize, header: &GptHeader) {
        raw[sector..sector + GptHeader::SIZE].copy_from_slice(&header.to_bytes());
    }

    #[test]
    fn test_entry_start_overflow_is_error() {
        let mut raw = build_table(512, &[entry("a", 34, 40)]);
        let mut header = header_of(&raw, 512);
        header.entry_start_lba = u64::MAX;
        with_header(&mut raw, 512, &header);
        assert!(matches!(
            parse_gpt(&raw, 0, 512, false),
            Err(CodecError::OutOfRange { field: "entry_start_lba", .. })
        ));
    }

    #[test]
    fn test_entry_start_past_buffer_is_error() {
        let mut raw = build_table(512, &[entry("a", 34, 40)]);
        let mut header = header_of(&raw, 512);
        header.entry_start_lba = 1000;
        with_header(&mut raw, 512, &header);
        assert!(matches!(
            parse_gpt(&raw, 0, 512, false),
            Err(CodecError::TruncatedInput { .. })
        ));
    }

    #[test]
    fn test_small_entry_size_rejected() {
        let mut raw = build_table(512, &[entry("a", 34, 40)]);
        let mut header = header_of(&raw, 512);
        header.entry_size = 0;
        header.entry_count = u32::MAX;
        with_header(&mut raw, 512, &header);
        assert!(matches!(
            parse_gpt(&raw, 0, 512, false),
            Err(CodecError::OutOfRange { field: "entry_size", value: 0, .. })
        ));
    }

    #[test]
    fn test_entry_count_clamped_to_buffer() {
        let entries: Vec<GptEntry> = (0..4)
            .map(|i| entry(&format!("p{i}"), 100 + i * 10, 109 + i * 10))
            .collect();
        let mut raw = build_table(512, &entries);
        let mut header = header_of(&raw, 512);
        header.entry_count = u32::MAX;
        with_header(&mut raw, 512, &header);
        // Stops at the first zeroed slot after the four real entries.
        let parts = parse_gpt(&raw, 0, 512, false).unwrap();
        assert_eq!(parts.len(), 4);

        // Cut the buffer inside the third entry: only two are readable.
        let cut = 2 * 512 + 2 * 128 + 10;
        let parts = parse_gpt(&raw[..cut], 0, 512, false).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].label, "p1");
    }

    #[test]
    fn test_header_roundtrip() {
        let raw = build_table(512, &[]);
        let header = header_of(&raw, 512);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), GptHeader::SIZE);
        assert_eq!(&bytes[..8], b"EFI PART");
        assert_eq!(GptHeader::from_bytes(&bytes).unwrap(), header);
        assert!(matches!(
            GptHeader::from_bytes(&bytes[..GptHeader::SIZE - 1]),
            Err(CodecError::TruncatedInput { expected: 92, actual: 91, .. })
        ));
    }

    #[test]
    fn test_entry_roundtrip() {
        let e = entry("userdata", 4096, 8191);
        let bytes = e.to_bytes();
        assert_eq!(bytes.len(), GptEntry::SIZE);
        assert_eq!(&bytes[32..40], &4096u64.to_le_bytes());
        let decoded = GptEntry::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, e);
        assert_eq!(decoded.label(), "userdata");
        assert!(matches!(
            GptEntry::from_bytes(&bytes[..GptEntry::SIZE - 1]),
            Err(CodecError::TruncatedInput { expected: 128, actual: 127, .. })
        ));
    }

    #[test]
    fn test_truncated_table() {
        let raw = build_table(512, &[entry("a", 34, 40)]);
        assert!(parse_gpt(&raw[..600], 0, 512, false).is_err());
    }
}
