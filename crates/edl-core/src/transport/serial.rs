//! Serial port transport (QDLoader COM/tty device).

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{ErrorKind, Read, Write};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, instrument, trace};

use super::traits::{Transport, TransportError};

/// Baud rate is ignored by the USB CDC driver but must be set.
pub const DEFAULT_BAUD: u32 = 115_200;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SerialTransport {
    port: Mutex<Box<dyn SerialPort>>,
    name: String,
    timeout: Duration,
}

impl SerialTransport {
    /// Open `device` (e.g. `/dev/ttyUSB0` or `COM5`).
    #[instrument(level = "info")]
    pub fn open(device: &str) -> Result<Self, TransportError> {
        Self::open_with_timeout(device, DEFAULT_TIMEOUT)
    }

    pub fn open_with_timeout(device: &str, timeout: Duration) -> Result<Self, TransportError> {
        let port = serialport::new(device, DEFAULT_BAUD)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(timeout)
            .open()
            .map_err(|e| TransportError::OpenFailed(format!("{device}: {e}")))?;

        info!(port = device, "Opened serial port");

        Ok(Self {
            port: Mutex::new(port),
            name: device.to_string(),
            timeout,
        })
    }

    fn map_io(&self, e: std::io::Error) -> TransportError {
        match e.kind() {
            ErrorKind::TimedOut => TransportError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            },
            ErrorKind::BrokenPipe | ErrorKind::NotConnected => TransportError::Disconnected,
            _ => TransportError::Io(e),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Box<dyn SerialPort>>, TransportError> {
        self.port
            .lock()
            .map_err(|_| TransportError::Serial("port lock poisoned".into()))
    }
}

impl Transport for SerialTransport {
    #[instrument(level = "trace", skip(self, data), fields(len = data.len()))]
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut port = self.lock()?;
        port.write_all(data).map_err(|e| self.map_io(e))?;
        port.flush().map_err(|e| self.map_io(e))?;
        trace!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let mut port = self.lock()?;
        let mut buf = vec![0u8; max_len];
        let n = port.read(&mut buf).map_err(|e| self.map_io(e))?;
        buf.truncate(n);
        debug!(bytes_read = n, "Read complete");
        Ok(buf)
    }

    fn read_available(&self) -> Result<Vec<u8>, TransportError> {
        let mut port = self.lock()?;

        // Block for the first byte, then drain whatever is queued.
        let mut first = [0u8; 1];
        let n = port.read(&mut first).map_err(|e| self.map_io(e))?;
        let mut out = first[..n].to_vec();

        let queued = port.bytes_to_read()? as usize;
        if queued > 0 {
            let mut rest = vec![0u8; queued];
            let m = port.read(&mut rest).map_err(|e| self.map_io(e))?;
            out.extend_from_slice(&rest[..m]);
        }

        debug!(bytes_read = out.len(), "Read complete");
        Ok(out)
    }

    fn is_connected(&self) -> bool {
        self.lock().map(|p| p.bytes_to_read().is_ok()).unwrap_or(false)
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}
