//! Byte transport abstraction.
//!
//! Defines the `Transport` trait used by both the Sahara and Firehose
//! engines, allowing different implementations (nusb, serial, mock).

use thiserror::Error;

/// Upper bound for a single opportunistic read.
pub const MAX_READ_CHUNK: usize = 0x100000;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint not found: type={ep_type}, direction={direction}")]
    EndpointNotFound { ep_type: String, direction: String },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Serial port error: {0}")]
    Serial(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serialport::Error> for TransportError {
    fn from(e: serialport::Error) -> Self {
        TransportError::Serial(e.to_string())
    }
}

/// Bidirectional byte channel to a device in EDL mode.
///
/// Methods take `&self` so one transport can be shared between the decode
/// and transmit stages of the sparse pipeline; implementations serialize
/// access internally.
pub trait Transport: Send + Sync {
    /// Write all of `data`. Returns the number of bytes written.
    fn write(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Read at most `max_len` bytes. May return fewer.
    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError>;

    /// Read whatever the device has ready (at least one byte, blocking until then).
    fn read_available(&self) -> Result<Vec<u8>, TransportError> {
        self.read(MAX_READ_CHUNK)
    }

    /// Read exactly `len` bytes, looping over short reads.
    fn read_exact(&self, len: usize) -> Result<Vec<u8>, TransportError> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let chunk = self.read(len - out.len())?;
            if chunk.is_empty() {
                return Err(TransportError::ReadFailed(format!(
                    "short read: got {} of {} bytes",
                    out.len(),
                    len
                )));
            }
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Check if device is still connected.
    fn is_connected(&self) -> bool;

    /// Human readable endpoint description (port path or VID:PID).
    fn name(&self) -> String;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        (**self).write(data)
    }

    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        (**self).read(max_len)
    }

    fn read_available(&self) -> Result<Vec<u8>, TransportError> {
        (**self).read_available()
    }

    fn read_exact(&self, len: usize) -> Result<Vec<u8>, TransportError> {
        (**self).read_exact(len)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn name(&self) -> String {
        (**self).name()
    }
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        (**self).write(data)
    }

    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        (**self).read(max_len)
    }

    fn read_available(&self) -> Result<Vec<u8>, TransportError> {
        (**self).read_available()
    }

    fn read_exact(&self, len: usize) -> Result<Vec<u8>, TransportError> {
        (**self).read_exact(len)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn name(&self) -> String {
        (**self).name()
    }
}
