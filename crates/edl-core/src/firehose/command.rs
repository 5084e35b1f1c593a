//! Firehose request documents.

use std::fmt;
use std::str::FromStr;

use crate::partition::{PartitionInfo, PatchInfo};

use super::xml::escape_attr;

const XML_DECL: &str = r#"<?xml version="1.0" encoding="UTF-8" ?>"#;

/// Sector range addressed by read/program/erase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub lun: u32,
    pub label: String,
    pub start_sector: String,
    pub num_sectors: u64,
    pub sector_size: u32,
}

impl Region {
    pub fn of(info: &PartitionInfo) -> Self {
        Self {
            lun: info.lun,
            label: info.label.clone(),
            start_sector: info.start_sector.clone(),
            num_sectors: info.sector_count,
            sector_size: info.bytes_per_sector,
        }
    }

    fn attrs(&self) -> String {
        format!(
            r#"physical_partition_number="{}" label="{}" start_sector="{}" num_partition_sectors="{}" SECTOR_SIZE_IN_BYTES="{}""#,
            self.lun,
            escape_attr(&self.label),
            escape_attr(&self.start_sector),
            self.num_sectors,
            self.sector_size
        )
    }
}

/// `value` of a `<power>` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerAction {
    #[default]
    Reset,
    Off,
    ResetToEdl,
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PowerAction::Reset => write!(f, "reset"),
            PowerAction::Off => write!(f, "off"),
            PowerAction::ResetToEdl => write!(f, "reset_to_edl"),
        }
    }
}

impl FromStr for PowerAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reset" => Ok(PowerAction::Reset),
            "off" => Ok(PowerAction::Off),
            "reset_to_edl" | "edl" => Ok(PowerAction::ResetToEdl),
            other => Err(format!("unknown power action '{other}'")),
        }
    }
}

/// Requests understood by the programmer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirehoseCommand {
    Configure {
        memory_name: String,
        max_payload_to_target: usize,
    },
    Read(Region),
    Program {
        region: Region,
        sparse: bool,
    },
    Erase(Region),
    Patch(PatchInfo),
    Power {
        delay_secs: u32,
        action: PowerAction,
    },
}

impl FirehoseCommand {
    /// Element name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            FirehoseCommand::Configure { .. } => "configure",
            FirehoseCommand::Read(_) => "read",
            FirehoseCommand::Program { .. } => "program",
            FirehoseCommand::Erase(_) => "erase",
            FirehoseCommand::Patch(_) => "patch",
            FirehoseCommand::Power { .. } => "power",
        }
    }

    /// Complete request document.
    pub fn to_xml(&self) -> String {
        let body = match self {
            FirehoseCommand::Configure {
                memory_name,
                max_payload_to_target,
            } => format!(
                r#"<configure MemoryName="{}" Verbose="0" AlwaysValidate="0" MaxPayloadSizeToTargetInBytes="{}" ZlpAwareHost="1" SkipStorageInit="0" />"#,
                escape_attr(memory_name),
                max_payload_to_target
            ),
            FirehoseCommand::Read(region) => format!("<read {} />", region.attrs()),
            FirehoseCommand::Program { region, sparse } => {
                format!(r#"<program {} sparse="{}" />"#, region.attrs(), sparse)
            }
            FirehoseCommand::Erase(region) => format!("<erase {} />", region.attrs()),
            FirehoseCommand::Patch(p) => format!(
                r#"<patch SECTOR_SIZE_IN_BYTES="{}" byte_offset="{}" filename="{}" physical_partition_number="{}" size_in_bytes="{}" start_sector="{}" value="{}" what="{}" />"#,
                p.sector_size,
                escape_attr(&p.byte_offset),
                escape_attr(&p.filename),
                p.lun,
                escape_attr(&p.size_in_bytes),
                escape_attr(&p.start_sector),
                escape_attr(&p.value),
                escape_attr(&p.what)
            ),
            FirehoseCommand::Power { delay_secs, action } => format!(
                r#"<power DelayInSeconds="{delay_secs}" value="{action}" />"#
            ),
        };
        format!("{XML_DECL}<data>{body}</data>")
    }
}
