//! nusb-based USB transport implementation.

use nusb::transfer::{Buffer, Bulk, In, Out, TransferError};
use nusb::{Endpoint, MaybeFuture, list_devices};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, instrument, trace};

use super::traits::{Transport, TransportError};
use crate::protocol::constants::{QUALCOMM_VENDOR_ID, SUPPORTED_PIDS};

const TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);

struct InState {
    endpoint: Endpoint<Bulk, In>,
    /// Bytes received beyond what the last caller asked for.
    pending: Vec<u8>,
}

/// nusb-based USB transport for a QDLoader 9008 device.
pub struct NusbTransport {
    out_ep: Mutex<Endpoint<Bulk, Out>>,
    in_ep: Mutex<InState>,
    vid: u16,
    pid: u16,
}

fn map_transfer_error(e: TransferError) -> TransportError {
    match e {
        TransferError::Cancelled => TransportError::Timeout {
            timeout_ms: TRANSFER_TIMEOUT.as_millis() as u64,
        },
        TransferError::Disconnected => TransportError::Disconnected,
        other => TransportError::ReadFailed(other.to_string()),
    }
}

impl NusbTransport {
    /// Open the first Qualcomm device in EDL mode.
    #[instrument(level = "info")]
    pub fn open() -> Result<Self, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        for device_info in devices {
            if device_info.vendor_id() == QUALCOMM_VENDOR_ID
                && SUPPORTED_PIDS.contains(&device_info.product_id())
            {
                return Self::open_device_info(device_info);
            }
        }

        Err(TransportError::DeviceNotFound {
            vid: QUALCOMM_VENDOR_ID,
            pid: 0,
        })
    }

    /// Open a device with specific VID/PID.
    #[instrument(level = "info", fields(vid = format!("{:04X}", vid), pid = format!("{:04X}", pid)))]
    pub fn open_with_ids(vid: u16, pid: u16) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| d.vendor_id() == vid && d.product_id() == pid)
            .ok_or(TransportError::DeviceNotFound { vid, pid })?;

        Self::open_device_info(device_info)
    }

    fn open_device_info(device_info: nusb::DeviceInfo) -> Result<Self, TransportError> {
        let vid = device_info.vendor_id();
        let pid = device_info.product_id();

        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            "Found device"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let interface =
            device
                .claim_interface(0)
                .wait()
                .map_err(|e| TransportError::ClaimInterfaceFailed {
                    interface: 0,
                    message: e.to_string(),
                })?;

        let mut in_address: u8 = 0;
        let mut out_address: u8 = 0;

        for config in device.configurations() {
            for iface in config.interfaces() {
                if iface.interface_number() != 0 {
                    continue;
                }
                for alt in iface.alt_settings() {
                    for ep in alt.endpoints() {
                        if ep.transfer_type() == nusb::descriptors::TransferType::Bulk {
                            if ep.direction() == nusb::transfer::Direction::In {
                                in_address = ep.address();
                            } else {
                                out_address = ep.address();
                            }
                        }
                    }
                }
            }
        }

        if in_address == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Bulk".into(),
                direction: "In".into(),
            });
        }
        if out_address == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Bulk".into(),
                direction: "Out".into(),
            });
        }

        let out_ep = interface
            .endpoint::<Bulk, Out>(out_address)
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        let in_ep = interface
            .endpoint::<Bulk, In>(in_address)
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        info!(
            in_ep = %format!("0x{:02X}", in_address),
            out_ep = %format!("0x{:02X}", out_address),
            "Device opened successfully"
        );

        Ok(Self {
            out_ep: Mutex::new(out_ep),
            in_ep: Mutex::new(InState {
                endpoint: in_ep,
                pending: Vec::new(),
            }),
            vid,
            pid,
        })
    }

    fn lock_err() -> TransportError {
        TransportError::ReadFailed("endpoint lock poisoned".into())
    }
}

impl Transport for NusbTransport {
    #[instrument(level = "trace", skip(self, data), fields(len = data.len()))]
    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut ep = self.out_ep.lock().map_err(|_| Self::lock_err())?;

        let mut buf = Buffer::new(data.len());
        buf.extend_from_slice(data);

        ep.transfer_blocking(buf, TRANSFER_TIMEOUT)
            .into_result()
            .map_err(|e| match map_transfer_error(e) {
                TransportError::ReadFailed(msg) => TransportError::WriteFailed(msg),
                other => other,
            })?;

        trace!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    #[instrument(level = "trace", skip(self))]
    fn read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let mut state = self.in_ep.lock().map_err(|_| Self::lock_err())?;

        if state.pending.is_empty() {
            let max_packet_size = state.endpoint.max_packet_size();
            // Request length must be a multiple of max packet size
            let request_len = max_len.max(1).div_ceil(max_packet_size) * max_packet_size;
            let mut in_buf = Buffer::new(request_len);
            in_buf.set_requested_len(request_len);

            let data = state
                .endpoint
                .transfer_blocking(in_buf, TRANSFER_TIMEOUT)
                .into_result()
                .map_err(map_transfer_error)?;
            state.pending.extend_from_slice(&data);
        }

        let take = state.pending.len().min(max_len);
        let rest = state.pending.split_off(take);
        let out = std::mem::replace(&mut state.pending, rest);

        debug!(bytes_read = out.len(), "Read complete");
        Ok(out)
    }

    fn is_connected(&self) -> bool {
        // nusb has no direct liveness check; transfer errors report disconnects.
        true
    }

    fn name(&self) -> String {
        format!("usb:{:04X}:{:04X}", self.vid, self.pid)
    }
}
