//! Storage parameters negotiated with the programmer.

use std::collections::HashMap;

use tracing::{info, warn};

pub const DEFAULT_MEMORY_NAME: &str = "UFS";
pub const DEFAULT_SECTOR_SIZE: u32 = 4096;
pub const EMMC_SECTOR_SIZE: u32 = 512;
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Device-side configuration. Written by `get_device_config`, read by
/// every later operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub memory_name: String,
    pub sector_size: u32,
    pub max_payload_to_target: usize,
    pub max_payload_from_target: usize,
    pub target_name: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            memory_name: DEFAULT_MEMORY_NAME.to_string(),
            sector_size: DEFAULT_SECTOR_SIZE,
            max_payload_to_target: DEFAULT_MAX_PAYLOAD,
            max_payload_from_target: DEFAULT_MAX_PAYLOAD,
            target_name: "unknown".to_string(),
        }
    }
}

fn parse_size(props: &HashMap<String, String>, key: &str) -> Option<usize> {
    let raw = props.get(key)?;
    match raw.trim().parse::<usize>() {
        Ok(v) if v > 0 => Some(v),
        _ => {
            warn!(key, value = %raw, "Ignoring invalid payload size");
            None
        }
    }
}

impl DeviceConfig {
    /// Memory name as sent in `<configure>`.
    pub fn configure_memory_name(&self) -> String {
        self.memory_name.to_ascii_lowercase()
    }

    /// Apply the properties of an ACKed configure response. Absent keys
    /// leave the current value untouched.
    pub fn apply(&mut self, props: &HashMap<String, String>) {
        if let Some(name) = props.get("MemoryName") {
            self.memory_name = name.clone();
            self.sector_size = if name.eq_ignore_ascii_case("emmc") {
                EMMC_SECTOR_SIZE
            } else {
                DEFAULT_SECTOR_SIZE
            };
        }
        if let Some(v) = parse_size(props, "MaxPayloadSizeFromTargetInBytes") {
            self.max_payload_from_target = v;
        }
        if let Some(v) = parse_size(props, "MaxPayloadSizeToTargetInBytesSupported") {
            self.max_payload_to_target = v;
        }
        if let Some(name) = props.get("TargetName") {
            self.target_name = name.clone();
        }
        info!(
            memory = %self.memory_name,
            sector_size = self.sector_size,
            to_target = self.max_payload_to_target,
            from_target = self.max_payload_from_target,
            target = %self.target_name,
            "Device configuration"
        );
    }
}
