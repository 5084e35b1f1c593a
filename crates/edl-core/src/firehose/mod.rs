//! Firehose XML protocol, spoken by the programmer uploaded over Sahara.

pub mod command;
pub mod config;
pub mod framer;
pub mod pipeline;
pub mod response;
pub mod server;
pub mod xml;

use thiserror::Error;

use crate::codec::CodecError;
use crate::sparse::SparseError;
use crate::transport::TransportError;

pub use command::{FirehoseCommand, PowerAction, Region};
pub use config::DeviceConfig;
pub use pipeline::{PipelineOptions, PipelineSummary, SparsePipeline};
pub use response::{ACK, FirehoseResponse};
pub use server::FirehoseServer;
pub use xml::{XmlElement, XmlError};

#[derive(Error, Debug)]
pub enum FirehoseError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Decode error: {0}")]
    Codec(#[from] CodecError),

    #[error("Sparse image error: {0}")]
    Sparse(#[from] SparseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Device answered {status}")]
    Rejected { status: String, logs: Vec<String> },

    #[error("Partition {0} has a zero sector size")]
    InvalidSectorSize(String),

    #[error("Start sector '{0}' is not a plain sector number")]
    InvalidStartSector(String),

    #[error("No valid GPT on LUN {lun}")]
    InvalidGpt { lun: u32 },

    #[error("Partition {0} has no source file")]
    MissingSource(String),

    #[error("{0} worker panicked")]
    WorkerPanicked(&'static str),
}
