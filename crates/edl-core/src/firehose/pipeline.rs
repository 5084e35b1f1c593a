//! Two-stage sparse writer: one thread decodes chunks into a bounded queue,
//! the other drains it into batched `<program>` requests.
//!
//! FILL chunks travel as zero buffers, unlike [`SparseReader`](crate::sparse::SparseReader)
//! which replays the pattern.

use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread;

use tracing::{debug, info, warn};

use crate::events::{EdlEvent, EdlObserver};
use crate::partition::PartitionInfo;
use crate::sparse::{ChunkReader, ChunkType, SparseError};
use crate::transport::Transport;

use super::FirehoseError;
use super::command::{FirehoseCommand, Region};
use super::server::{send_command, sector_size_of, wait_for_response};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_BATCH_SIZE: usize = 128 * 1024 * 1024;

/// Largest single buffer placed on the queue.
const MAX_ITEM_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Buffers the decode stage may run ahead of the transport stage.
    pub queue_capacity: usize,
    /// Bytes accumulated before a `<program>` request is issued.
    pub batch_size: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl PipelineOptions {
    fn item_size(&self) -> usize {
        self.batch_size.clamp(1, MAX_ITEM_SIZE)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    pub batches: usize,
    pub sectors_written: u64,
}

/// Push `len` bytes produced by `make` in pieces of at most `item`.
/// Returns false once the receiver is gone.
fn push_split(
    tx: &SyncSender<Vec<u8>>,
    mut len: u64,
    item: usize,
    pushed: &mut usize,
    mut make: impl FnMut(usize) -> Result<Vec<u8>, SparseError>,
) -> Result<bool, SparseError> {
    while len > 0 {
        let n = len.min(item as u64) as usize;
        if tx.send(make(n)?).is_err() {
            return Ok(false);
        }
        *pushed += 1;
        len -= n as u64;
    }
    Ok(true)
}

/// Decode chunks onto `tx` until the image ends or the receiver goes away.
/// Returns the number of buffers pushed.
pub(crate) fn decode_stage<R: Read>(
    mut reader: ChunkReader<R>,
    tx: &SyncSender<Vec<u8>>,
    item_size: usize,
) -> Result<usize, SparseError> {
    let block_size = reader.block_size();
    let mut pushed = 0;

    while let Some((kind, chunk)) = reader.next_chunk()? {
        let len = chunk.output_len(block_size);
        let open = match kind {
            ChunkType::Raw => push_split(tx, len, item_size, &mut pushed, |n| {
                let mut buf = vec![0u8; n];
                reader.read_payload(&mut buf)?;
                Ok(buf)
            })?,
            ChunkType::Fill | ChunkType::DontCare => {
                if matches!(kind, ChunkType::Fill) {
                    reader.read_fill_pattern()?;
                }
                push_split(tx, len, item_size, &mut pushed, |n| Ok(vec![0u8; n]))?
            }
            ChunkType::Crc32 => {
                reader.read_crc32()?;
                true
            }
        };
        if !open {
            debug!(pushed, "Transport stage gone, stopping decode");
            break;
        }
    }
    Ok(pushed)
}

/// Two-stage sparse writer bound to one transport.
pub struct SparsePipeline<'a, T: Transport> {
    transport: &'a T,
    observer: Arc<dyn EdlObserver>,
    options: PipelineOptions,
}

struct Target<'a> {
    info: &'a PartitionInfo,
    start: u64,
    sector_size: u64,
    total_sectors: u64,
}

impl<'a, T: Transport> SparsePipeline<'a, T> {
    pub fn new(transport: &'a T, observer: Arc<dyn EdlObserver>, options: PipelineOptions) -> Self {
        Self {
            transport,
            observer,
            options,
        }
    }

    /// Write `image` to `info`'s LUN starting at sector `start`.
    ///
    /// A decode fault is reported before a transport fault.
    pub fn run<R: Read + Send>(
        &self,
        info: &PartitionInfo,
        start: u64,
        image: ChunkReader<R>,
    ) -> Result<PipelineSummary, FirehoseError> {
        let sector_size = sector_size_of(info)?;
        let target = Target {
            info,
            start,
            sector_size,
            total_sectors: image.decoded_len().div_ceil(sector_size),
        };
        info!(
            label = %info.label,
            start,
            sectors = target.total_sectors,
            queue = self.options.queue_capacity,
            batch = self.options.batch_size,
            "Starting sparse pipeline"
        );

        let (tx, rx) = sync_channel(self.options.queue_capacity);
        let decode_failed = AtomicBool::new(false);
        let item_size = self.options.item_size();

        thread::scope(|s| -> Result<PipelineSummary, FirehoseError> {
            let decoder = s.spawn(|| {
                let result = decode_stage(image, &tx, item_size);
                if result.is_err() {
                    decode_failed.store(true, Ordering::SeqCst);
                }
                // Closing the queue after the flag is set.
                drop(tx);
                result
            });
            let sender = s.spawn(|| self.transport_stage(rx, &target, &decode_failed));

            let decoded = decoder
                .join()
                .map_err(|_| FirehoseError::WorkerPanicked("decode"))?;
            let pushed = decoded?;
            let summary = sender
                .join()
                .map_err(|_| FirehoseError::WorkerPanicked("transport"))??;
            debug!(pushed, batches = summary.batches, "Sparse pipeline finished");
            Ok(summary)
        })
    }

    fn transport_stage(
        &self,
        rx: Receiver<Vec<u8>>,
        target: &Target<'_>,
        decode_failed: &AtomicBool,
    ) -> Result<PipelineSummary, FirehoseError> {
        let sector_size = target.sector_size;
        let mut summary = PipelineSummary::default();
        let mut batch: Vec<Vec<u8>> = Vec::new();
        let mut closed = false;

        while !closed {
            let mut batch_len = 0usize;
            while batch_len < self.options.batch_size {
                match rx.recv() {
                    Ok(buf) => {
                        batch_len += buf.len();
                        batch.push(buf);
                    }
                    Err(_) => {
                        closed = true;
                        break;
                    }
                }
            }
            if closed && decode_failed.load(Ordering::SeqCst) {
                warn!(pending = batch_len, "Decode failed, discarding partial batch");
                break;
            }
            if batch_len == 0 {
                break;
            }

            let sectors = (batch_len as u64).div_ceil(sector_size);
            let region = Region {
                start_sector: (target.start + summary.sectors_written).to_string(),
                num_sectors: sectors,
                ..Region::of(target.info)
            };
            send_command(
                self.transport,
                self.observer.as_ref(),
                &FirehoseCommand::Program {
                    region,
                    sparse: true,
                },
            )?;
            wait_for_response(self.transport, self.observer.as_ref(), None)?.check()?;

            for buf in batch.drain(..) {
                self.transport.write(&buf)?;
            }
            let rem = batch_len as u64 % sector_size;
            if rem != 0 {
                self.transport
                    .write(&vec![0u8; (sector_size - rem) as usize])?;
            }
            wait_for_response(self.transport, self.observer.as_ref(), None)?.check()?;

            summary.batches += 1;
            summary.sectors_written += sectors;
            self.observer.on_event(&EdlEvent::progress(
                "Write",
                summary.sectors_written,
                target.total_sectors,
            ));
        }
        Ok(summary)
    }
}
