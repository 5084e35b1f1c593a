//! Protocol module - Sahara protocol definitions.

pub mod constants;
pub mod header;

pub use constants::*;
pub use header::{
    ArgumentPacket, CommandReadyResponse, DoneResponse, EndTransferResponse, ExecuteResponse,
    FrameHeader, HelloRequest, HelloResponse, MemoryDebugRequest, ReadDataRequest,
};
