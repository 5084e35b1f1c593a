//! Sahara packet layouts.
//!
//! Every packet starts with a [`FrameHeader`]; `length` counts the whole
//! packet including the header.

use std::io::Cursor;

use crate::codec::{Record, get_u32, put_u32};
use crate::protocol::constants::{SaharaCommand, SaharaMode};

/// Common 8-byte packet header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameHeader {
    pub command: u32,
    pub length: u32,
}

impl FrameHeader {
    pub fn new(command: SaharaCommand, length: usize) -> Self {
        Self {
            command: command.code(),
            length: length as u32,
        }
    }

    pub fn is(&self, command: SaharaCommand) -> bool {
        self.command == command.code()
    }
}

impl Record for FrameHeader {
    const SIZE: usize = 8;
    const NAME: &'static str = "FrameHeader";

    fn write_to(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.command);
        put_u32(buf, self.length);
    }

    fn read_from(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        Ok(Self {
            command: get_u32(cursor)?,
            length: get_u32(cursor)?,
        })
    }
}

fn put_reserved(buf: &mut Vec<u8>, reserved: &[u32; 6]) {
    for &r in reserved {
        put_u32(buf, r);
    }
}

fn get_reserved(cursor: &mut Cursor<&[u8]>) -> std::io::Result<[u32; 6]> {
    let mut out = [0u32; 6];
    for slot in &mut out {
        *slot = get_u32(cursor)?;
    }
    Ok(out)
}

/// Hello packet sent by the device when it enters Sahara (48 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HelloRequest {
    pub header: FrameHeader,
    pub version: u32,
    pub version_supported: u32,
    pub max_command_packet_length: u32,
    pub mode: u32,
    pub reserved: [u32; 6],
}

impl Record for HelloRequest {
    const SIZE: usize = 48;
    const NAME: &'static str = "HelloRequest";

    fn write_to(&self, buf: &mut Vec<u8>) {
        self.header.write_to(buf);
        put_u32(buf, self.version);
        put_u32(buf, self.version_supported);
        put_u32(buf, self.max_command_packet_length);
        put_u32(buf, self.mode);
        put_reserved(buf, &self.reserved);
    }

    fn read_from(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        Ok(Self {
            header: FrameHeader::read_from(cursor)?,
            version: get_u32(cursor)?,
            version_supported: get_u32(cursor)?,
            max_command_packet_length: get_u32(cursor)?,
            mode: get_u32(cursor)?,
            reserved: get_reserved(cursor)?,
        })
    }
}

/// Host reply to a hello (48 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HelloResponse {
    pub header: FrameHeader,
    pub version: u32,
    pub min_version: u32,
    pub status: u32,
    pub mode: u32,
    pub reserved: [u32; 6],
}

impl HelloResponse {
    pub fn new(mode: SaharaMode, version: u32, min_version: u32) -> Self {
        Self {
            header: FrameHeader::new(SaharaCommand::HelloResponse, Self::SIZE),
            version,
            min_version,
            status: 0,
            mode: mode.code(),
            reserved: [0; 6],
        }
    }
}

impl Record for HelloResponse {
    const SIZE: usize = 48;
    const NAME: &'static str = "HelloResponse";

    fn write_to(&self, buf: &mut Vec<u8>) {
        self.header.write_to(buf);
        put_u32(buf, self.version);
        put_u32(buf, self.min_version);
        put_u32(buf, self.status);
        put_u32(buf, self.mode);
        put_reserved(buf, &self.reserved);
    }

    fn read_from(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        Ok(Self {
            header: FrameHeader::read_from(cursor)?,
            version: get_u32(cursor)?,
            min_version: get_u32(cursor)?,
            status: get_u32(cursor)?,
            mode: get_u32(cursor)?,
            reserved: get_reserved(cursor)?,
        })
    }
}

/// Memory debug request (16 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryDebugRequest {
    pub header: FrameHeader,
    pub table_address: u32,
    pub table_length: u32,
}

impl Record for MemoryDebugRequest {
    const SIZE: usize = 16;
    const NAME: &'static str = "MemoryDebugRequest";

    fn write_to(&self, buf: &mut Vec<u8>) {
        self.header.write_to(buf);
        put_u32(buf, self.table_address);
        put_u32(buf, self.table_length);
    }

    fn read_from(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        Ok(Self {
            header: FrameHeader::read_from(cursor)?,
            table_address: get_u32(cursor)?,
            table_length: get_u32(cursor)?,
        })
    }
}

/// Command-mode ready packet (12 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandReadyResponse {
    pub header: FrameHeader,
    pub image_tx_status: u32,
}

impl Record for CommandReadyResponse {
    const SIZE: usize = 12;
    const NAME: &'static str = "CommandReadyResponse";

    fn write_to(&self, buf: &mut Vec<u8>) {
        self.header.write_to(buf);
        put_u32(buf, self.image_tx_status);
    }

    fn read_from(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        Ok(Self {
            header: FrameHeader::read_from(cursor)?,
            image_tx_status: get_u32(cursor)?,
        })
    }
}

/// Device request for a byte range of the uploaded image (20 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadDataRequest {
    pub header: FrameHeader,
    pub image_id: u32,
    pub offset: u32,
    pub size: u32,
}

impl ReadDataRequest {
    pub fn new(image_id: u32, offset: u32, size: u32) -> Self {
        Self {
            header: FrameHeader::new(SaharaCommand::ReadData, Self::SIZE),
            image_id,
            offset,
            size,
        }
    }
}

impl Record for ReadDataRequest {
    const SIZE: usize = 20;
    const NAME: &'static str = "ReadDataRequest";

    fn write_to(&self, buf: &mut Vec<u8>) {
        self.header.write_to(buf);
        put_u32(buf, self.image_id);
        put_u32(buf, self.offset);
        put_u32(buf, self.size);
    }

    fn read_from(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        Ok(Self {
            header: FrameHeader::read_from(cursor)?,
            image_id: get_u32(cursor)?,
            offset: get_u32(cursor)?,
            size: get_u32(cursor)?,
        })
    }
}

/// End-of-image-transfer report (16 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndTransferResponse {
    pub header: FrameHeader,
    pub image_id: u32,
    pub status: u32,
}

impl EndTransferResponse {
    pub fn new(image_id: u32, status: u32) -> Self {
        Self {
            header: FrameHeader::new(SaharaCommand::EndImageTransfer, Self::SIZE),
            image_id,
            status,
        }
    }
}

impl Record for EndTransferResponse {
    const SIZE: usize = 16;
    const NAME: &'static str = "EndTransferResponse";

    fn write_to(&self, buf: &mut Vec<u8>) {
        self.header.write_to(buf);
        put_u32(buf, self.image_id);
        put_u32(buf, self.status);
    }

    fn read_from(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        Ok(Self {
            header: FrameHeader::read_from(cursor)?,
            image_id: get_u32(cursor)?,
            status: get_u32(cursor)?,
        })
    }
}

/// Reply to a Done packet (12 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DoneResponse {
    pub header: FrameHeader,
    pub image_tx_status: u32,
}

impl Record for DoneResponse {
    const SIZE: usize = 12;
    const NAME: &'static str = "DoneResponse";

    fn write_to(&self, buf: &mut Vec<u8>) {
        self.header.write_to(buf);
        put_u32(buf, self.image_tx_status);
    }

    fn read_from(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        Ok(Self {
            header: FrameHeader::read_from(cursor)?,
            image_tx_status: get_u32(cursor)?,
        })
    }
}

/// Header plus one u32 argument (12 bytes).
///
/// Shared by Execute, ExecuteData and SwitchMode, which differ only in
/// command code and the meaning of `argument`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArgumentPacket {
    pub header: FrameHeader,
    pub argument: u32,
}

impl ArgumentPacket {
    pub fn new(command: SaharaCommand, argument: u32) -> Self {
        Self {
            header: FrameHeader::new(command, Self::SIZE),
            argument,
        }
    }
}

impl Record for ArgumentPacket {
    const SIZE: usize = 12;
    const NAME: &'static str = "ArgumentPacket";

    fn write_to(&self, buf: &mut Vec<u8>) {
        self.header.write_to(buf);
        put_u32(buf, self.argument);
    }

    fn read_from(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        Ok(Self {
            header: FrameHeader::read_from(cursor)?,
            argument: get_u32(cursor)?,
        })
    }
}

/// Reply to Execute announcing the size of the result (16 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteResponse {
    pub header: FrameHeader,
    pub command: u32,
    pub size: u32,
}

impl Record for ExecuteResponse {
    const SIZE: usize = 16;
    const NAME: &'static str = "ExecuteResponse";

    fn write_to(&self, buf: &mut Vec<u8>) {
        self.header.write_to(buf);
        put_u32(buf, self.command);
        put_u32(buf, self.size);
    }

    fn read_from(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        Ok(Self {
            header: FrameHeader::read_from(cursor)?,
            command: get_u32(cursor)?,
            size: get_u32(cursor)?,
        })
    }
}
