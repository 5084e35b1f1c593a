//! Partition and patch descriptors shared by GPT parsing, Firehose and the flasher.

use std::fmt;
use std::path::PathBuf;

/// One partition-sized region on a LUN.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartitionInfo {
    pub label: String,
    /// Physical partition (LUN) number.
    pub lun: u32,
    /// Offset into the source file, in sectors.
    pub file_sector_offset: u64,
    /// Start sector as written in manifests. Usually a decimal literal, but
    /// may be an expression such as `NUM_DISK_SECTORS-5.` evaluated on-device.
    pub start_sector: String,
    pub sector_count: u64,
    pub bytes_per_sector: u32,
    pub is_sparse: bool,
    pub source_path: Option<PathBuf>,
}

impl PartitionInfo {
    pub fn new(
        label: impl Into<String>,
        lun: u32,
        start_sector: u64,
        sector_count: u64,
        bytes_per_sector: u32,
    ) -> Self {
        Self {
            label: label.into(),
            lun,
            start_sector: start_sector.to_string(),
            sector_count,
            bytes_per_sector,
            ..Default::default()
        }
    }

    /// The start sector when it is a plain integer.
    pub fn start_sector_value(&self) -> Option<u64> {
        self.start_sector.trim().parse().ok()
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.sector_count * self.bytes_per_sector as u64
    }
}

impl fmt::Display for PartitionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lun {} {:<24} start {:>12} sectors {:>12}",
            self.lun, self.label, self.start_sector, self.sector_count
        )
    }
}

/// One `<patch>` instruction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PatchInfo {
    pub sector_size: u32,
    pub lun: u32,
    pub byte_offset: String,
    /// Target file; `DISK` means the device itself.
    pub filename: String,
    pub size_in_bytes: String,
    pub start_sector: String,
    pub value: String,
    pub what: String,
}

impl PatchInfo {
    pub fn targets_disk(&self) -> bool {
        self.filename == "DISK"
    }
}
