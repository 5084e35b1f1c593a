//! Protocol constants for Qualcomm Emergency Download (EDL) mode.
//!
//! Sahara command/mode/status codes follow the numbering used by the
//! on-device primary bootloader.

use std::fmt;

// ============================================================================
// Device Identification
// ============================================================================

/// Qualcomm Vendor ID
pub const QUALCOMM_VENDOR_ID: u16 = 0x05C6;

/// QDLoader 9008 (EDL mode) Product ID
pub const EDL_PRODUCT_ID: u16 = 0x9008;

/// All supported PIDs for device discovery
pub const SUPPORTED_PIDS: &[u16] = &[EDL_PRODUCT_ID];

// ============================================================================
// Size Constants
// ============================================================================

/// Sahara receive/transfer buffer capacity (1 MiB).
pub const SAHARA_RAW_BUFFER_SIZE: usize = 0x100000;

/// Sahara protocol version announced in the hello response.
pub const SAHARA_VERSION: u32 = 2;

/// Minimum Sahara version accepted by the host.
pub const SAHARA_MIN_VERSION: u32 = 1;

// ============================================================================
// Sahara Commands
// ============================================================================

/// Sahara packet command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SaharaCommand {
    Hello = 0x01,
    HelloResponse = 0x02,
    ReadData = 0x03,
    EndImageTransfer = 0x04,
    Done = 0x05,
    DoneResponse = 0x06,
    Reset = 0x07,
    ResetResponse = 0x08,
    MemoryDebug = 0x09,
    MemoryRead = 0x0A,
    Ready = 0x0B,
    SwitchMode = 0x0C,
    Execute = 0x0D,
    ExecuteResponse = 0x0E,
    ExecuteData = 0x0F,
    MemoryDebug64 = 0x10,
    MemoryRead64 = 0x11,
}

impl SaharaCommand {
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        use SaharaCommand::*;
        Some(match code {
            0x01 => Hello,
            0x02 => HelloResponse,
            0x03 => ReadData,
            0x04 => EndImageTransfer,
            0x05 => Done,
            0x06 => DoneResponse,
            0x07 => Reset,
            0x08 => ResetResponse,
            0x09 => MemoryDebug,
            0x0A => MemoryRead,
            0x0B => Ready,
            0x0C => SwitchMode,
            0x0D => Execute,
            0x0E => ExecuteResponse,
            0x0F => ExecuteData,
            0x10 => MemoryDebug64,
            0x11 => MemoryRead64,
            _ => return None,
        })
    }
}

/// Render a raw command code, naming it when known.
pub fn command_name(code: u32) -> String {
    match SaharaCommand::from_code(code) {
        Some(cmd) => format!("{cmd:?} (0x{code:02X})"),
        None => format!("0x{code:02X}"),
    }
}

// ============================================================================
// Sahara Modes
// ============================================================================

/// Mode requested by the host in the hello response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SaharaMode {
    ImageTxPending = 0x00,
    TxComplete = 0x01,
    MemoryDebug = 0x02,
    Command = 0x03,
}

impl SaharaMode {
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0x00 => Some(Self::ImageTxPending),
            0x01 => Some(Self::TxComplete),
            0x02 => Some(Self::MemoryDebug),
            0x03 => Some(Self::Command),
            _ => None,
        }
    }

    /// The device command expected right after a hello response in this mode.
    pub fn expected_reply(self) -> Option<SaharaCommand> {
        match self {
            Self::Command => Some(SaharaCommand::Ready),
            Self::ImageTxPending => Some(SaharaCommand::ReadData),
            Self::MemoryDebug => Some(SaharaCommand::MemoryDebug),
            Self::TxComplete => Some(SaharaCommand::EndImageTransfer),
        }
    }
}

impl fmt::Display for SaharaMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ImageTxPending => write!(f, "IMAGE_TX_PENDING"),
            Self::TxComplete => write!(f, "TX_COMPLETE"),
            Self::MemoryDebug => write!(f, "MEMORY_DEBUG"),
            Self::Command => write!(f, "COMMAND"),
        }
    }
}

// ============================================================================
// Client Commands (Command mode)
// ============================================================================

/// Sub-commands executed in Sahara Command mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ClientCommand {
    Nop = 0x00,
    SerialNumRead = 0x01,
    MsmHwIdRead = 0x02,
    OemPkHashRead = 0x03,
    SwitchDmss = 0x04,
    SwitchToStreamingDload = 0x05,
    ReadDebugData = 0x06,
    GetSblVersion = 0x07,
}

impl ClientCommand {
    pub const fn code(self) -> u32 {
        self as u32
    }
}

// ============================================================================
// Status Codes
// ============================================================================

/// Status reported in end-of-transfer packets. `Success` is zero; every value
/// below `STATUS_MAX` is a known failure.
pub const STATUS_SUCCESS: u32 = 0x00;
pub const STATUS_MAX: u32 = 0x27;

const STATUS_NAMES: [&str; STATUS_MAX as usize] = [
    "Success",
    "InvalidCmd",
    "ProtocolMismatch",
    "InvalidTargetProtocol",
    "InvalidHostProtocol",
    "InvalidPacketSize",
    "UnexpectedImageId",
    "InvalidHeaderSize",
    "InvalidDataSize",
    "InvalidImageType",
    "InvalidTxLength",
    "InvalidRxLength",
    "TxRxError",
    "ReadDataError",
    "UnsupportedNumPhdrs",
    "InvalidPhdrSize",
    "MultipleSharedSeg",
    "UninitPhdrLoc",
    "InvalidDestAddress",
    "InvalidImageHeaderSize",
    "InvalidElfHeader",
    "UnknownError",
    "TimeoutRx",
    "TimeoutTx",
    "InvalidMode",
    "InvalidMemoryRead",
    "InvalidDataSizeRequest",
    "MemoryDebugNotSupported",
    "InvalidModeSwitch",
    "ExecFailure",
    "ExecCmdInvalidParam",
    "ExecCmdUnsupported",
    "ExecDataInvalid",
    "HashTableAuthFailure",
    "HashVerificationFailure",
    "HashTableNotFound",
    "TargetInitFailure",
    "ImageAuthFailure",
    "InvalidImgHashTableSize",
];

/// Human readable name of a Sahara status code.
pub fn status_name(status: u32) -> &'static str {
    STATUS_NAMES
        .get(status as usize)
        .copied()
        .unwrap_or("Unknown")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_roundtrip() {
        for code in 0x01..=0x11 {
            let cmd = SaharaCommand::from_code(code).unwrap();
            assert_eq!(cmd.code(), code);
        }
        assert!(SaharaCommand::from_code(0x12).is_none());
    }

    #[test]
    fn test_mode_expected_reply() {
        assert_eq!(
            SaharaMode::Command.expected_reply(),
            Some(SaharaCommand::Ready)
        );
        assert_eq!(
            SaharaMode::ImageTxPending.expected_reply(),
            Some(SaharaCommand::ReadData)
        );
        assert_eq!(
            SaharaMode::TxComplete.expected_reply(),
            Some(SaharaCommand::EndImageTransfer)
        );
    }

    #[test]
    fn test_status_names() {
        assert_eq!(status_name(STATUS_SUCCESS), "Success");
        assert_eq!(status_name(0x25), "ImageAuthFailure");
        assert_eq!(status_name(0x99), "Unknown");
        assert_eq!(command_name(0x0E), "ExecuteResponse (0x0E)");
    }
}
