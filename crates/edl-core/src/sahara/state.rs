//! Sahara handshake state.

use std::fmt;

use crate::protocol::{
    CommandReadyResponse, EndTransferResponse, MemoryDebugRequest, ReadDataRequest, SaharaMode,
};

/// Where the host is in the Sahara exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    /// Waiting for the device hello.
    #[default]
    AwaitHello,
    /// Hello response written, device reply not yet classified.
    HelloSent,
    /// Device is in command mode and accepts Execute packets.
    CommandReady,
    /// Device is requesting image data.
    ImageTransferReady,
    /// Image accepted and Done exchanged.
    Done,
    /// Reset requested.
    Reset,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeState::AwaitHello => write!(f, "AWAIT_HELLO"),
            HandshakeState::HelloSent => write!(f, "HELLO_SENT"),
            HandshakeState::CommandReady => write!(f, "COMMAND_READY"),
            HandshakeState::ImageTransferReady => write!(f, "IMAGE_TRANSFER_READY"),
            HandshakeState::Done => write!(f, "DONE"),
            HandshakeState::Reset => write!(f, "RESET"),
        }
    }
}

/// Packet that followed a hello response, classified by command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPayload {
    ClientCommand(CommandReadyResponse),
    MemoryDebug(MemoryDebugRequest),
    ImageTransfer(ReadDataRequest),
    Done(EndTransferResponse),
}

/// Result of one hello exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
    pub version: u32,
    pub min_version: u32,
    pub mode: SaharaMode,
    /// `None` when the reply did not match the requested mode.
    pub payload: Option<SessionPayload>,
}

impl SessionState {
    pub fn command_ready(&self) -> Option<&CommandReadyResponse> {
        match &self.payload {
            Some(SessionPayload::ClientCommand(p)) => Some(p),
            _ => None,
        }
    }

    pub fn read_request(&self) -> Option<&ReadDataRequest> {
        match &self.payload {
            Some(SessionPayload::ImageTransfer(p)) => Some(p),
            _ => None,
        }
    }

    pub fn memory_debug(&self) -> Option<&MemoryDebugRequest> {
        match &self.payload {
            Some(SessionPayload::MemoryDebug(p)) => Some(p),
            _ => None,
        }
    }
}
