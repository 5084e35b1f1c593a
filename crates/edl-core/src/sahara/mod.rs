//! Sahara handshake and command engine.
//!
//! Runs first on a freshly enumerated EDL device: identifies the SoC in
//! command mode and uploads the Firehose programmer in image-transfer mode.

pub mod state;

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::codec::{CodecError, Record};
use crate::events::{EdlEvent, EdlObserver, NullObserver, PacketDirection};
use crate::protocol::{
    ArgumentPacket, ClientCommand, CommandReadyResponse, DoneResponse, EndTransferResponse,
    ExecuteResponse, FrameHeader, HelloRequest, HelloResponse, MemoryDebugRequest,
    ReadDataRequest, SAHARA_MIN_VERSION, SAHARA_RAW_BUFFER_SIZE, SAHARA_VERSION, STATUS_MAX, STATUS_SUCCESS,
    SaharaCommand, SaharaMode, command_name, status_name,
};
use crate::transport::{Transport, TransportError};

pub use state::{HandshakeState, SessionPayload, SessionState};

#[derive(Error, Debug)]
pub enum SaharaError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Decode error: {0}")]
    Codec(#[from] CodecError),

    #[error("Protocol error: device answered with command 0x{command:02X}")]
    Protocol { command: u32 },

    #[error("Frame 0x{command:02X} declares {declared} bytes but {actual} were read")]
    FrameLength {
        command: u32,
        declared: u32,
        actual: usize,
    },

    #[error("Unexpected command 0x{0:02X}")]
    UnexpectedCommand(u32),

    #[error("Device rejected image: status 0x{0:02X}")]
    DeviceRejected(u32),

    #[error("Invalid image range: offset {offset} + size {size} exceeds length {length}")]
    InvalidRange { offset: u32, size: u32, length: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// True unless `data` is an end-of-transfer packet reporting a known failure.
fn is_success_response(header: &FrameHeader, data: &[u8]) -> bool {
    if !header.is(SaharaCommand::EndImageTransfer) || data.len() < EndTransferResponse::SIZE {
        return true;
    }
    match EndTransferResponse::from_bytes(data) {
        Ok(end) => !(end.status != STATUS_SUCCESS && end.status < STATUS_MAX),
        Err(_) => true,
    }
}

/// Accept a reply if it is non-empty, not a failure report, and either
/// matches `expected` or is a read-data request.
fn is_valid_response(expected: Option<SaharaCommand>, header: &FrameHeader, data: &[u8]) -> bool {
    if data.is_empty() || header.length == 0 || !is_success_response(header, data) {
        return false;
    }
    expected.is_some_and(|cmd| header.is(cmd)) || header.is(SaharaCommand::ReadData)
}

/// Sahara protocol server. Owns the transport until [`into_transport`](Self::into_transport).
pub struct SaharaServer<T: Transport> {
    transport: T,
    state: HandshakeState,
    observer: Arc<dyn EdlObserver>,
}

impl<T: Transport> SaharaServer<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            state: HandshakeState::AwaitHello,
            observer: Arc::new(NullObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn EdlObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Hand the transport over to the next protocol layer.
    pub fn into_transport(self) -> T {
        self.transport
    }

    fn packet_event(&self, direction: PacketDirection, data: &[u8]) {
        let command = data
            .get(..4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .unwrap_or_default();
        self.observer.on_event(&EdlEvent::Packet {
            direction,
            packet_type: command_name(command),
            length: data.len(),
        });
    }

    fn send_frame<R: Record>(&self, frame: &R) -> Result<(), SaharaError> {
        let bytes = frame.to_bytes();
        self.packet_event(PacketDirection::Tx, &bytes);
        self.transport.write(&bytes)?;
        Ok(())
    }

    /// Read one frame without checking its declared length.
    fn read_frame(&self) -> Result<(FrameHeader, Vec<u8>), SaharaError> {
        let data = self.transport.read_available()?;
        self.packet_event(PacketDirection::Rx, &data);
        let header = FrameHeader::from_bytes(&data)?;
        Ok((header, data))
    }

    /// Read one frame whose declared length must match the bytes read.
    fn recv_frame(&self) -> Result<(FrameHeader, Vec<u8>), SaharaError> {
        let (header, data) = self.read_frame()?;
        check_length(&header, &data)?;
        Ok((header, data))
    }

    fn goto_state(&mut self, new_state: HandshakeState) {
        if self.state != new_state {
            info!(from = %self.state, to = %new_state, "State transition");
        }
        self.state = new_state;
    }

    /// Block for one hello packet from the device.
    pub fn read_hello(&mut self) -> Result<HelloRequest, SaharaError> {
        let raw = self.transport.read_exact(HelloRequest::SIZE)?;
        self.packet_event(PacketDirection::Rx, &raw);
        let hello = HelloRequest::from_bytes(&raw)?;
        check_length(&hello.header, &raw)?;
        debug!(
            version = hello.version,
            version_supported = hello.version_supported,
            mode = hello.mode,
            "Hello received"
        );
        self.goto_state(HandshakeState::AwaitHello);
        Ok(hello)
    }

    /// Answer a hello and classify the device's next packet.
    ///
    /// The payload is only populated when the reply fits the requested mode,
    /// except that a read-data request is always taken.
    #[instrument(level = "debug", skip(self), fields(mode = %mode))]
    pub fn send_hello_response(
        &mut self,
        mode: SaharaMode,
        version: u32,
        min_version: u32,
    ) -> Result<SessionState, SaharaError> {
        self.send_frame(&HelloResponse::new(mode, version, min_version))?;
        self.goto_state(HandshakeState::HelloSent);

        // A zero length is a rejected reply, not a framing fault.
        let (header, data) = self.read_frame()?;
        if header.length != 0 {
            check_length(&header, &data)?;
        }
        debug!(command = %command_name(header.command), len = header.length, "Hello reply");

        let mut session = SessionState {
            version,
            min_version,
            mode,
            payload: None,
        };

        if !is_valid_response(mode.expected_reply(), &header, &data) {
            if header.is(SaharaCommand::EndImageTransfer) {
                if let Ok(end) = EndTransferResponse::from_bytes(&data) {
                    warn!(status = %status_name(end.status), "Device reported transfer failure");
                }
            }
            return Ok(session);
        }

        let payload = match SaharaCommand::from_code(header.command) {
            Some(SaharaCommand::Ready) => {
                SessionPayload::ClientCommand(CommandReadyResponse::from_bytes(&data)?)
            }
            Some(SaharaCommand::ReadData) => {
                SessionPayload::ImageTransfer(ReadDataRequest::from_bytes(&data)?)
            }
            Some(SaharaCommand::MemoryDebug) => {
                SessionPayload::MemoryDebug(MemoryDebugRequest::from_bytes(&data)?)
            }
            Some(SaharaCommand::EndImageTransfer) => {
                SessionPayload::Done(EndTransferResponse::from_bytes(&data)?)
            }
            _ => return Ok(session),
        };

        self.goto_state(match payload {
            SessionPayload::ClientCommand(_) => HandshakeState::CommandReady,
            SessionPayload::ImageTransfer(_) => HandshakeState::ImageTransferReady,
            SessionPayload::MemoryDebug(_) => HandshakeState::HelloSent,
            SessionPayload::Done(_) => HandshakeState::Done,
        });
        session.payload = Some(payload);
        Ok(session)
    }

    /// One full hello exchange with the default protocol versions.
    pub fn do_handshake(&mut self, mode: SaharaMode) -> Result<SessionState, SaharaError> {
        self.read_hello()?;
        self.send_hello_response(mode, SAHARA_VERSION, SAHARA_MIN_VERSION)
    }

    /// Execute a client command and return its raw result bytes.
    #[instrument(level = "debug", skip(self))]
    pub fn send_command(&mut self, command: ClientCommand) -> Result<Vec<u8>, SaharaError> {
        self.send_frame(&ArgumentPacket::new(SaharaCommand::Execute, command.code()))?;

        let (header, data) = self.recv_frame()?;
        if !is_valid_response(Some(SaharaCommand::ExecuteResponse), &header, &data) {
            return Err(SaharaError::Protocol {
                command: header.command,
            });
        }
        let response = ExecuteResponse::from_bytes(&data)?;
        let size = response.size as usize;

        self.send_frame(&ArgumentPacket::new(SaharaCommand::ExecuteData, command.code()))?;

        let mut out = Vec::with_capacity(size);
        while out.len() < size {
            let chunk = self
                .transport
                .read((size - out.len()).min(SAHARA_RAW_BUFFER_SIZE))?;
            if chunk.is_empty() {
                return Err(
                    TransportError::ReadFailed("empty read during command data".into()).into(),
                );
            }
            out.extend_from_slice(&chunk);
        }
        debug!(bytes = out.len(), "Command data received");
        Ok(out)
    }

    /// MSM hardware id as 16 lowercase hex digits.
    pub fn hardware_id(&mut self) -> Result<String, SaharaError> {
        let data = self.send_command(ClientCommand::MsmHwIdRead)?;
        let mut raw = [0u8; 8];
        let n = data.len().min(8);
        raw[..n].copy_from_slice(&data[..n]);
        // Little-endian integer, printed most significant byte first.
        raw.reverse();
        Ok(hex::encode(raw))
    }

    pub fn serial_number(&mut self) -> Result<i32, SaharaError> {
        let data = self.send_command(ClientCommand::SerialNumRead)?;
        read_i32(&data, "SerialNumber")
    }

    pub fn sbl_version(&mut self) -> Result<i32, SaharaError> {
        let data = self.send_command(ClientCommand::GetSblVersion)?;
        read_i32(&data, "SblVersion")
    }

    /// OEM public key hash, with a repeated copy trimmed off.
    pub fn oem_pk_hash(&mut self) -> Result<String, SaharaError> {
        let data = self.send_command(ClientCommand::OemPkHashRead)?;
        Ok(dedup_hash(&hex::encode(&data)))
    }

    /// Serve one read-data request from `stream`.
    pub fn transfer_image<R: Read + Seek>(
        &mut self,
        request: &ReadDataRequest,
        stream: &mut R,
        length: u64,
    ) -> Result<(), SaharaError> {
        let offset = request.offset;
        let size = request.size;
        if size == 0 || offset as u64 + size as u64 > length {
            return Err(SaharaError::InvalidRange {
                offset,
                size,
                length,
            });
        }

        stream.seek(SeekFrom::Start(offset as u64))?;
        let mut buf = vec![0u8; (size as usize).min(SAHARA_RAW_BUFFER_SIZE)];
        let mut sent = 0usize;
        while sent < size as usize {
            let n = (size as usize - sent).min(buf.len());
            stream.read_exact(&mut buf[..n])?;
            self.transport.write(&buf[..n])?;
            sent += n;
        }

        debug!(image_id = request.image_id, offset, size, "Image range sent");
        self.observer.on_event(&EdlEvent::progress(
            "Programmer",
            offset as u64 + size as u64,
            length,
        ));
        Ok(())
    }

    /// Upload the programmer, serving read-data requests until the device
    /// reports the end of the transfer.
    #[instrument(level = "info", skip(self, initial, stream))]
    pub fn send_programmer<R: Read + Seek>(
        &mut self,
        initial: &ReadDataRequest,
        stream: &mut R,
        length: u64,
    ) -> Result<DoneResponse, SaharaError> {
        self.goto_state(HandshakeState::ImageTransferReady);
        self.transfer_image(initial, stream, length)?;

        loop {
            let (header, data) = self.recv_frame()?;
            match SaharaCommand::from_code(header.command) {
                Some(SaharaCommand::ReadData) => {
                    let request = ReadDataRequest::from_bytes(&data)?;
                    self.transfer_image(&request, stream, length)?;
                }
                Some(SaharaCommand::EndImageTransfer) => {
                    let end = EndTransferResponse::from_bytes(&data)?;
                    if end.status != STATUS_SUCCESS {
                        warn!(status = %status_name(end.status), "Programmer rejected");
                        return Err(SaharaError::DeviceRejected(end.status));
                    }
                    info!(image_id = end.image_id, "Programmer accepted");
                    return self.send_done();
                }
                _ => return Err(SaharaError::UnexpectedCommand(header.command)),
            }
        }
    }

    /// Done / DoneResponse exchange closing an image transfer.
    pub fn send_done(&mut self) -> Result<DoneResponse, SaharaError> {
        self.send_frame(&FrameHeader::new(SaharaCommand::Done, FrameHeader::SIZE))?;
        let (_, data) = self.recv_frame()?;
        let response = DoneResponse::from_bytes(&data)?;
        if !response.header.is(SaharaCommand::DoneResponse) {
            return Err(SaharaError::UnexpectedCommand(response.header.command));
        }
        self.goto_state(HandshakeState::Done);
        Ok(response)
    }

    /// Ask the device to switch mode; it answers with a fresh hello.
    pub fn switch_mode(&mut self, mode: SaharaMode) -> Result<(), SaharaError> {
        self.send_frame(&ArgumentPacket::new(SaharaCommand::SwitchMode, mode.code()))?;
        info!(mode = %mode, "Switch mode requested");
        self.goto_state(HandshakeState::AwaitHello);
        Ok(())
    }

    pub fn reset(&mut self) -> Result<FrameHeader, SaharaError> {
        self.send_frame(&FrameHeader::new(SaharaCommand::Reset, FrameHeader::SIZE))?;
        let (response, _) = self.recv_frame()?;
        self.goto_state(HandshakeState::Reset);
        Ok(response)
    }
}

fn check_length(header: &FrameHeader, data: &[u8]) -> Result<(), SaharaError> {
    if header.length as usize != data.len() {
        return Err(SaharaError::FrameLength {
            command: header.command,
            declared: header.length,
            actual: data.len(),
        });
    }
    Ok(())
}

fn read_i32(data: &[u8], record: &'static str) -> Result<i32, SaharaError> {
    let raw: [u8; 4] = data
        .get(..4)
        .and_then(|s| s.try_into().ok())
        .ok_or(CodecError::TruncatedInput {
            record,
            expected: 4,
            actual: data.len(),
        })?;
    Ok(i32::from_le_bytes(raw))
}

/// Cut the string just before the second occurrence of its first 4 chars.
fn dedup_hash(digits: &str) -> String {
    if digits.len() < 4 {
        return digits.to_string();
    }
    match digits[4..].find(&digits[..4]) {
        Some(idx) => digits[..idx + 4].to_string(),
        None => digits.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::events::tests::RecordingObserver;
    use crate::transport::MockTransport;
    use std::io::Cursor;

    pub(crate) fn packet(command: SaharaCommand, args: &[u32]) -> Vec<u8> {
        let len = 8 + 4 * args.len();
        let mut out = FrameHeader::new(command, len).to_bytes();
        for a in args {
            out.extend_from_slice(&a.to_le_bytes());
        }
        out
    }

    pub(crate) fn hello() -> Vec<u8> {
        let mut args = vec![2, 1, 0x400, 0];
        args.extend_from_slice(&[0; 6]);
        packet(SaharaCommand::Hello, &args)
    }

    #[test]
    fn test_handshake_command_mode() {
        let mock = MockTransport::new();
        mock.queue_chunk(&hello());
        mock.queue_chunk(&packet(SaharaCommand::Ready, &[0]));

        let mut server = SaharaServer::new(mock.clone());
        let session = server.do_handshake(SaharaMode::Command).unwrap();

        assert_eq!(session.mode, SaharaMode::Command);
        assert_eq!(session.version, SAHARA_VERSION);
        assert!(session.command_ready().is_some());
        assert_eq!(server.state(), HandshakeState::CommandReady);

        let writes = mock.get_writes();
        let resp = HelloResponse::from_bytes(&writes[0]).unwrap();
        assert_eq!(resp.mode, SaharaMode::Command.code());
        assert_eq!(resp.header.length, 48);
    }

    #[test]
    fn test_handshake_emits_packet_events() {
        let mock = MockTransport::new();
        mock.queue_chunk(&hello());
        mock.queue_chunk(&packet(SaharaCommand::Ready, &[0]));

        let observer = Arc::new(RecordingObserver::default());
        let mut server = SaharaServer::new(mock).with_observer(observer.clone());
        server.do_handshake(SaharaMode::Command).unwrap();

        let packets: Vec<(PacketDirection, String, usize)> = observer
            .events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                EdlEvent::Packet {
                    direction,
                    packet_type,
                    length,
                } => Some((*direction, packet_type.clone(), *length)),
                _ => None,
            })
            .collect();
        assert_eq!(
            packets,
            vec![
                (PacketDirection::Rx, command_name(0x01), 48),
                (PacketDirection::Tx, command_name(0x02), 48),
                (PacketDirection::Rx, command_name(0x0B), 12),
            ]
        );
    }

    #[test]
    fn test_hello_reply_length_mismatch() {
        let mock = MockTransport::new();
        mock.queue_chunk(&hello());
        let mut ready = packet(SaharaCommand::Ready, &[0]);
        ready[4..8].copy_from_slice(&32u32.to_le_bytes());
        mock.queue_chunk(&ready);

        let mut server = SaharaServer::new(mock);
        assert!(matches!(
            server.do_handshake(SaharaMode::Command),
            Err(SaharaError::FrameLength { command: 0x0B, declared: 32, actual: 12 })
        ));
    }

    #[test]
    fn test_zero_length_reply_not_accepted() {
        let mock = MockTransport::new();
        mock.queue_chunk(&hello());
        let mut ready = packet(SaharaCommand::Ready, &[0]);
        ready[4..8].copy_from_slice(&0u32.to_le_bytes());
        mock.queue_chunk(&ready);

        let mut server = SaharaServer::new(mock);
        let session = server.do_handshake(SaharaMode::Command).unwrap();
        assert!(session.payload.is_none());
    }

    #[test]
    fn test_read_data_accepted_in_any_mode() {
        let mock = MockTransport::new();
        mock.queue_chunk(&hello());
        mock.queue_chunk(&packet(SaharaCommand::ReadData, &[13, 0, 80]));

        let mut server = SaharaServer::new(mock);
        let session = server.do_handshake(SaharaMode::Command).unwrap();
        let req = session.read_request().unwrap();
        assert_eq!((req.image_id, req.offset, req.size), (13, 0, 80));
        assert_eq!(server.state(), HandshakeState::ImageTransferReady);
    }

    #[test]
    fn test_mismatched_reply_leaves_payload_unset() {
        let mock = MockTransport::new();
        mock.queue_chunk(&hello());
        mock.queue_chunk(&packet(SaharaCommand::Ready, &[0]));

        let mut server = SaharaServer::new(mock);
        let session = server.do_handshake(SaharaMode::MemoryDebug).unwrap();
        assert!(session.payload.is_none());
    }

    #[test]
    fn test_failed_end_transfer_not_accepted() {
        let mock = MockTransport::new();
        mock.queue_chunk(&hello());
        mock.queue_chunk(&packet(SaharaCommand::EndImageTransfer, &[13, 0x25]));

        let mut server = SaharaServer::new(mock);
        let session = server.do_handshake(SaharaMode::TxComplete).unwrap();
        assert!(session.payload.is_none());
    }

    #[test]
    fn test_send_command_accumulates_reads() {
        let mock = MockTransport::new();
        mock.queue_chunk(&packet(SaharaCommand::ExecuteResponse, &[2, 8]));
        mock.queue_chunk(&[0xEF, 0xBE, 0xAD]);
        mock.queue_chunk(&[0xDE, 0x01, 0x00, 0x00, 0x00]);

        let mut server = SaharaServer::new(mock.clone());
        let id = server.hardware_id().unwrap();
        assert_eq!(id, "00000001deadbeef");

        let writes = mock.get_writes();
        assert_eq!(writes[0], packet(SaharaCommand::Execute, &[2]));
        assert_eq!(writes[1], packet(SaharaCommand::ExecuteData, &[2]));
    }

    #[test]
    fn test_send_command_protocol_error() {
        let mock = MockTransport::new();
        mock.queue_chunk(&packet(SaharaCommand::Ready, &[0]));

        let mut server = SaharaServer::new(mock);
        let err = server.send_command(ClientCommand::SerialNumRead).unwrap_err();
        assert!(matches!(err, SaharaError::Protocol { command: 0x0B }));
    }

    #[test]
    fn test_serial_number_signed() {
        let mock = MockTransport::new();
        mock.queue_chunk(&packet(SaharaCommand::ExecuteResponse, &[1, 4]));
        mock.queue_chunk(&(-2i32).to_le_bytes());

        let mut server = SaharaServer::new(mock);
        assert_eq!(server.serial_number().unwrap(), -2);
    }

    #[test]
    fn test_oem_pk_hash_lowercase_deduped() {
        let mock = MockTransport::new();
        let digest = [0xAB, 0xCD, 0x12, 0x34, 0xAB, 0xCD, 0x12, 0x34];
        mock.queue_chunk(&packet(SaharaCommand::ExecuteResponse, &[3, 8]));
        mock.queue_chunk(&digest);

        let mut server = SaharaServer::new(mock);
        assert_eq!(server.oem_pk_hash().unwrap(), "abcd1234");
    }

    #[test]
    fn test_oem_hash_dedup() {
        assert_eq!(dedup_hash("abcd1234abcd1234"), "abcd1234");
        assert_eq!(dedup_hash("abcd1234"), "abcd1234");
        assert_eq!(dedup_hash("ab"), "ab");
    }

    #[test]
    fn test_transfer_image_invalid_range() {
        let mock = MockTransport::new();
        let mut server = SaharaServer::new(mock.clone());
        let mut image = Cursor::new(vec![0u8; 100]);

        let req = ReadDataRequest::new(13, 90, 20);
        let err = server.transfer_image(&req, &mut image, 100).unwrap_err();
        assert!(matches!(err, SaharaError::InvalidRange { offset: 90, size: 20, length: 100 }));

        let req = ReadDataRequest::new(13, 0, 0);
        assert!(server.transfer_image(&req, &mut image, 100).is_err());
        assert!(mock.get_writes().is_empty());
    }

    #[test]
    fn test_send_programmer_success() {
        let image: Vec<u8> = (0..200u8).collect();
        let mock = MockTransport::new();
        mock.queue_chunk(&packet(SaharaCommand::ReadData, &[13, 100, 50]));
        mock.queue_chunk(&packet(SaharaCommand::EndImageTransfer, &[13, 0]));
        mock.queue_chunk(&packet(SaharaCommand::DoneResponse, &[1]));

        let mut server = SaharaServer::new(mock.clone());
        let initial = ReadDataRequest::new(13, 0, 100);
        let done = server
            .send_programmer(&initial, &mut Cursor::new(image.clone()), 200)
            .unwrap();

        assert_eq!(done.image_tx_status, 1);
        assert_eq!(server.state(), HandshakeState::Done);

        let writes = mock.get_writes();
        assert_eq!(writes[0], &image[0..100]);
        assert_eq!(writes[1], &image[100..150]);
        assert_eq!(writes[2], packet(SaharaCommand::Done, &[]));
    }

    #[test]
    fn test_send_programmer_trailing_bytes_rejected() {
        let mock = MockTransport::new();
        let mut request = packet(SaharaCommand::ReadData, &[13, 0, 4]);
        request.extend_from_slice(&[0xFF; 4]);
        mock.queue_chunk(&request);

        let mut server = SaharaServer::new(mock.clone());
        let initial = ReadDataRequest::new(13, 0, 4);
        let err = server
            .send_programmer(&initial, &mut Cursor::new(vec![0u8; 8]), 8)
            .unwrap_err();
        assert!(matches!(
            err,
            SaharaError::FrameLength { command: 0x03, declared: 20, actual: 24 }
        ));
        assert_eq!(mock.get_writes().len(), 1);
    }

    #[test]
    fn test_send_programmer_rejected() {
        let mock = MockTransport::new();
        mock.queue_chunk(&packet(SaharaCommand::EndImageTransfer, &[13, 0x21]));

        let mut server = SaharaServer::new(mock);
        let initial = ReadDataRequest::new(13, 0, 4);
        let err = server
            .send_programmer(&initial, &mut Cursor::new(vec![0u8; 4]), 4)
            .unwrap_err();
        assert!(matches!(err, SaharaError::DeviceRejected(0x21)));
    }

    #[test]
    fn test_send_programmer_unexpected_command() {
        let mock = MockTransport::new();
        mock.queue_chunk(&packet(SaharaCommand::Reset, &[]));

        let mut server = SaharaServer::new(mock);
        let initial = ReadDataRequest::new(13, 0, 4);
        let err = server
            .send_programmer(&initial, &mut Cursor::new(vec![0u8; 4]), 4)
            .unwrap_err();
        assert!(matches!(err, SaharaError::UnexpectedCommand(0x07)));
    }

    #[test]
    fn test_switch_mode_and_reset() {
        let mock = MockTransport::new();
        mock.queue_chunk(&packet(SaharaCommand::ResetResponse, &[]));

        let mut server = SaharaServer::new(mock.clone());
        server.switch_mode(SaharaMode::ImageTxPending).unwrap();
        assert_eq!(server.state(), HandshakeState::AwaitHello);

        let resp = server.reset().unwrap();
        assert!(resp.is(SaharaCommand::ResetResponse));
        assert_eq!(server.state(), HandshakeState::Reset);

        let writes = mock.get_writes();
        assert_eq!(writes[0], packet(SaharaCommand::SwitchMode, &[0]));
        assert_eq!(writes[1], packet(SaharaCommand::Reset, &[]));
    }
}
