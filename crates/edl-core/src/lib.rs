//! EDL-Core: Qualcomm Emergency Download (EDL) in Rust.
//!
//! A device in EDL mode first speaks Sahara, a binary packet protocol used to
//! identify the SoC and upload a Firehose programmer. The programmer then
//! answers XML requests to read, program, erase and patch storage.
//!
//! # Architecture
//!
//! - **Codec**: Fixed-layout little-endian records
//! - **Protocol**: Sahara constants and packet structures
//! - **Sahara**: Hello handshake, client commands, programmer upload
//! - **Firehose**: XML framing, device configuration, partition I/O
//! - **Sparse**: Android sparse image decoding and building
//! - **GPT**: Partition table parsing
//! - **Flasher**: rawprogram/patch manifests applied in order
//! - **Transport**: USB (nusb), serial and mock byte channels
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: Connect, identify, upload, configure
//!
//! # Example
//!
//! ```no_run
//! use edl_core::session::{EdlSession, SessionConfig};
//!
//! let config = SessionConfig {
//!     programmer_path: Some("prog_firehose_ddr.elf".to_string()),
//!     ..Default::default()
//! };
//!
//! let mut session = EdlSession::new(config);
//! let (identity, mut firehose) = session.open().expect("EDL bring-up failed");
//! println!("{identity}");
//! for partition in firehose.enumerate_all_partitions(false) {
//!     println!("{partition}");
//! }
//! ```

pub mod codec;
pub mod events;
pub mod firehose;
pub mod flasher;
pub mod gpt;
pub mod partition;
pub mod protocol;
pub mod sahara;
pub mod session;
pub mod sparse;
pub mod transport;

// Re-exports for convenience
pub use codec::{CodecError, Record};
pub use events::{EdlEvent, EdlObserver, EdlPhase, NullObserver, TracingObserver};
pub use firehose::{
    DeviceConfig, FirehoseCommand, FirehoseError, FirehoseResponse, FirehoseServer,
    PipelineOptions, PowerAction, SparsePipeline,
};
pub use flasher::{BypassRule, FlashOptions, ManifestError, ProgramFlasher};
pub use gpt::parse_gpt;
pub use partition::{PartitionInfo, PatchInfo};
pub use protocol::{ClientCommand, SaharaCommand, SaharaMode};
pub use sahara::{SaharaError, SaharaServer};
pub use session::{DeviceIdentity, EdlSession, SessionConfig};
pub use sparse::{SparseBuilder, SparseError, SparseReader};
pub use transport::{MockTransport, NusbTransport, SerialTransport, Transport, TransportError};
