//! Firehose request/response engine.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::events::{EdlEvent, EdlObserver, NullObserver, PacketDirection};
use crate::gpt::{self, GPT_SCAN_SECTORS, GPT_SIGNATURE};
use crate::partition::{PartitionInfo, PatchInfo};
use crate::sparse::{self, ChunkReader, SparseReader};
use crate::transport::{Transport, TransportError};

use super::FirehoseError;
use super::command::{FirehoseCommand, PowerAction, Region};
use super::config::DeviceConfig;
use super::pipeline::{PipelineOptions, PipelineSummary, SparsePipeline};
use super::response::FirehoseResponse;

/// Size of the first read after a `<read>` request. Whatever follows the
/// response frames in it is partition data.
pub const READ_RESPONSE_SIZE: usize = 8192;

/// Upper bound on LUNs scanned by [`FirehoseServer::enumerate_all_partitions`].
pub const MAX_LUNS: u32 = 32;

/// Serialize `command` and write it.
pub(crate) fn send_command<T: Transport + ?Sized>(
    transport: &T,
    observer: &dyn EdlObserver,
    command: &FirehoseCommand,
) -> Result<(), FirehoseError> {
    let xml = command.to_xml();
    debug!(command = command.name(), "Firehose request");
    observer.on_event(&EdlEvent::Packet {
        direction: PacketDirection::Tx,
        packet_type: command.name().to_string(),
        length: xml.len(),
    });
    transport.write(xml.as_bytes())?;
    Ok(())
}

/// Read until a `<response>` frame arrives.
///
/// `read_size` selects a bounded read instead of "whatever is available".
/// Each read is expected to carry whole frames.
pub(crate) fn wait_for_response<T: Transport + ?Sized>(
    transport: &T,
    observer: &dyn EdlObserver,
    read_size: Option<usize>,
) -> Result<FirehoseResponse, FirehoseError> {
    let mut response = FirehoseResponse::default();
    loop {
        let chunk = match read_size {
            Some(len) => transport.read(len)?,
            None => transport.read_available()?,
        };
        let seen = response.logs.len();
        let found = response.absorb(&chunk);
        for line in &response.logs[seen..] {
            observer.on_event(&EdlEvent::DeviceLog {
                message: line.clone(),
            });
        }
        if found {
            debug!(status = %response.status, trailing = response.trailing_payload.len(), "Firehose response");
            observer.on_event(&EdlEvent::Response {
                status: response.status.clone(),
            });
            return Ok(response);
        }
    }
}

/// Sector size of `info`, which must be non-zero.
pub(crate) fn sector_size_of(info: &PartitionInfo) -> Result<u64, FirehoseError> {
    match info.bytes_per_sector {
        0 => Err(FirehoseError::InvalidSectorSize(info.label.clone())),
        n => Ok(n as u64),
    }
}

/// Fill `buf` from `reader`, stopping early only at end of input.
fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Firehose client. Takes over the transport from Sahara once the
/// programmer is running.
pub struct FirehoseServer<T: Transport> {
    transport: T,
    config: DeviceConfig,
    observer: Arc<dyn EdlObserver>,
}

impl<T: Transport> FirehoseServer<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            config: DeviceConfig::default(),
            observer: Arc::new(NullObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn EdlObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_config(mut self, config: DeviceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn observer(&self) -> Arc<dyn EdlObserver> {
        self.observer.clone()
    }

    /// Swap the observer, returning the previous one.
    pub fn set_observer(&mut self, observer: Arc<dyn EdlObserver>) -> Arc<dyn EdlObserver> {
        std::mem::replace(&mut self.observer, observer)
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    fn progress(&self, operation: &str, current: u64, total: u64) {
        self.observer
            .on_event(&EdlEvent::progress(operation, current, total));
    }

    pub fn send(&self, command: &FirehoseCommand) -> Result<(), FirehoseError> {
        send_command(&self.transport, self.observer.as_ref(), command)
    }

    pub fn wait_for_response(
        &self,
        read_size: Option<usize>,
    ) -> Result<FirehoseResponse, FirehoseError> {
        wait_for_response(&self.transport, self.observer.as_ref(), read_size)
    }

    fn request(&self, command: &FirehoseCommand) -> Result<FirehoseResponse, FirehoseError> {
        self.send(command)?;
        self.wait_for_response(None)
    }

    /// Send `<configure>` and adopt whatever the programmer reports.
    #[instrument(level = "debug", skip(self))]
    pub fn get_device_config(&mut self) -> Result<FirehoseResponse, FirehoseError> {
        let response = self.request(&FirehoseCommand::Configure {
            memory_name: self.config.configure_memory_name(),
            max_payload_to_target: self.config.max_payload_to_target,
        })?;
        if response.is_ack() {
            self.config.apply(&response.properties);
        } else {
            warn!(status = %response.status, "Configure not acknowledged");
        }
        Ok(response)
    }

    /// Read a region into `sink`. A non-ACK answer to the request is returned
    /// as-is without touching `sink`.
    #[instrument(level = "debug", skip(self, sink), fields(label = %info.label, lun = info.lun))]
    pub fn read_partition<W: Write>(
        &mut self,
        info: &PartitionInfo,
        sink: &mut W,
    ) -> Result<FirehoseResponse, FirehoseError> {
        self.send(&FirehoseCommand::Read(Region::of(info)))?;
        let response = self.wait_for_response(Some(READ_RESPONSE_SIZE))?;
        if !response.is_ack() {
            return Ok(response);
        }

        let total = info.size_in_bytes();
        let head = response.trailing_payload.len().min(total as usize);
        if head < response.trailing_payload.len() {
            debug!(
                extra = response.trailing_payload.len() - head,
                "Dropping bytes past end of region"
            );
        }
        sink.write_all(&response.trailing_payload[..head])?;
        let mut done = head as u64;
        self.progress("Read", done, total);

        let max_chunk = self.config.max_payload_from_target as u64;
        while done < total {
            let want = (total - done).min(max_chunk) as usize;
            let data = self.transport.read(want)?;
            if data.is_empty() {
                return Err(TransportError::ReadFailed(format!(
                    "device stopped after {done} of {total} bytes"
                ))
                .into());
            }
            sink.write_all(&data)?;
            done += data.len() as u64;
            self.progress("Read", done, total);
        }
        sink.flush()?;

        self.wait_for_response(None)
    }

    /// Read a region into a file, created or truncated.
    pub fn read_partition_to_path(
        &mut self,
        info: &PartitionInfo,
        path: &Path,
    ) -> Result<FirehoseResponse, FirehoseError> {
        let mut sink = BufWriter::new(File::create(path)?);
        let response = self.read_partition(info, &mut sink)?;
        info!(label = %info.label, path = %path.display(), status = %response.status, "Partition read");
        Ok(response)
    }

    fn pad_to_sector(&self, written: u64, sector_size: u64) -> Result<(), FirehoseError> {
        let rem = written % sector_size;
        if rem != 0 {
            let pad = vec![0u8; (sector_size - rem) as usize];
            self.transport.write(&pad)?;
        }
        Ok(())
    }

    /// Expand a sparse image on the host and program it in one request.
    #[instrument(level = "debug", skip(self, image), fields(label = %info.label, lun = info.lun))]
    pub fn write_sparse_image<R: Read>(
        &mut self,
        info: &PartitionInfo,
        mut image: SparseReader<R>,
    ) -> Result<FirehoseResponse, FirehoseError> {
        let start = info
            .start_sector_value()
            .ok_or_else(|| FirehoseError::InvalidStartSector(info.start_sector.clone()))?;
        let sector_size = sector_size_of(info)?;
        let total = image.decoded_len();

        let region = Region {
            start_sector: start.to_string(),
            num_sectors: total.div_ceil(sector_size),
            ..Region::of(info)
        };
        let response = self.request(&FirehoseCommand::Program {
            region,
            sparse: true,
        })?;
        if !response.is_ack() {
            return Ok(response);
        }

        let mut buf = vec![0u8; self.config.max_payload_to_target];
        let mut written = 0u64;
        loop {
            let n = read_chunk(&mut image, &mut buf)?;
            if n == 0 {
                break;
            }
            self.transport.write(&buf[..n])?;
            written += n as u64;
            self.progress("Write", written, total);
        }
        self.pad_to_sector(written, sector_size)?;

        self.wait_for_response(None)
    }

    /// Program a plain image starting `file_sector_offset` sectors into `file`.
    #[instrument(level = "debug", skip(self, file), fields(label = %info.label, lun = info.lun))]
    pub fn write_unsparse_image<R: Read + Seek>(
        &mut self,
        info: &PartitionInfo,
        mut file: R,
    ) -> Result<FirehoseResponse, FirehoseError> {
        let sector_size = sector_size_of(info)?;
        let offset = info.file_sector_offset.saturating_mul(sector_size);
        let file_len = file.seek(SeekFrom::End(0))?;
        let total = file_len.saturating_sub(offset);
        file.seek(SeekFrom::Start(offset))?;

        let region = Region {
            num_sectors: total.div_ceil(sector_size),
            ..Region::of(info)
        };
        let response = self.request(&FirehoseCommand::Program {
            region,
            sparse: false,
        })?;
        if !response.is_ack() {
            return Ok(response);
        }

        let chunk_len = (self.config.max_payload_to_target as u64 / sector_size).max(1) * sector_size;
        let mut buf = vec![0u8; chunk_len as usize];
        let mut sent = 0u64;
        while sent < total {
            let want = (total - sent).min(chunk_len) as usize;
            let n = read_chunk(&mut file, &mut buf[..want])?;
            if n == 0 {
                warn!(sent, total, "Image ended early");
                break;
            }
            let padded = (n as u64).div_ceil(sector_size) * sector_size;
            buf[n..padded as usize].fill(0);
            self.transport.write(&buf[..padded as usize])?;
            sent += n as u64;
            self.progress("Write", sent, total);
        }

        self.wait_for_response(None)
    }

    /// Program a descriptor's `source_path`, sparse or plain.
    pub fn write_partition(&mut self, info: &PartitionInfo) -> Result<FirehoseResponse, FirehoseError> {
        let path = info
            .source_path
            .as_deref()
            .ok_or_else(|| FirehoseError::MissingSource(info.label.clone()))?;

        let response = if info.is_sparse && sparse::is_sparse_file(path)? {
            let image = sparse::open_sparse(path)?;
            self.write_sparse_image(info, image)?
        } else {
            if info.is_sparse {
                warn!(path = %path.display(), "Marked sparse but no sparse header; writing as-is");
            }
            self.write_unsparse_image(info, BufReader::new(File::open(path)?))?
        };
        info!(label = %info.label, path = %path.display(), status = %response.status, "Partition written");
        Ok(response)
    }

    /// Program a sparse image through the two-stage decode/transmit pipeline.
    pub fn write_sparse_pipelined<R: Read + Send>(
        &mut self,
        info: &PartitionInfo,
        image: ChunkReader<R>,
        options: &PipelineOptions,
    ) -> Result<PipelineSummary, FirehoseError> {
        let start = info
            .start_sector_value()
            .ok_or_else(|| FirehoseError::InvalidStartSector(info.start_sector.clone()))?;
        SparsePipeline::new(&self.transport, self.observer.clone(), options.clone()).run(
            info,
            start,
            image,
        )
    }

    pub fn erase_partition(&mut self, info: &PartitionInfo) -> Result<FirehoseResponse, FirehoseError> {
        self.request(&FirehoseCommand::Erase(Region::of(info)))
    }

    pub fn send_patch(&mut self, patch: &PatchInfo) -> Result<FirehoseResponse, FirehoseError> {
        debug!(what = %patch.what, "Patch");
        self.request(&FirehoseCommand::Patch(patch.clone()))
    }

    pub fn reset_device(
        &mut self,
        delay_secs: u32,
        action: PowerAction,
    ) -> Result<FirehoseResponse, FirehoseError> {
        info!(delay_secs, action = %action, "Power request");
        self.request(&FirehoseCommand::Power { delay_secs, action })
    }

    /// Parse a raw table read from `lun` using the configured sector size.
    pub fn parse_gpt(
        &self,
        raw: &[u8],
        lun: u32,
        include_pseudo: bool,
    ) -> Result<Vec<PartitionInfo>, FirehoseError> {
        Ok(gpt::parse_gpt(raw, lun, self.config.sector_size, include_pseudo)?)
    }

    /// Read and parse the partition table of one LUN.
    #[instrument(level = "debug", skip(self))]
    pub fn enumerate_partitions(
        &mut self,
        lun: u32,
        include_pseudo: bool,
    ) -> Result<Vec<PartitionInfo>, FirehoseError> {
        let sector_size = self.config.sector_size;
        let primary = PartitionInfo::new("PrimaryGPT", lun, 0, GPT_SCAN_SECTORS, sector_size);
        let total = primary.size_in_bytes() as usize;

        self.send(&FirehoseCommand::Read(Region::of(&primary)))?;
        let response = self.wait_for_response(Some(READ_RESPONSE_SIZE))?.check()?;

        let mut raw = response.trailing_payload;
        raw.truncate(total);
        if raw.len() < total {
            raw.extend(self.transport.read_exact(total - raw.len())?);
        }
        self.wait_for_response(None)?.check()?;

        let sector = sector_size as usize;
        if raw.get(sector..sector + GPT_SIGNATURE.len()) != Some(&GPT_SIGNATURE[..]) {
            return Err(FirehoseError::InvalidGpt { lun });
        }
        self.parse_gpt(&raw, lun, include_pseudo)
    }

    /// Scan LUNs from 0 upward until one fails, collecting every table.
    pub fn enumerate_all_partitions(&mut self, include_pseudo: bool) -> Vec<PartitionInfo> {
        let mut partitions = Vec::new();
        for lun in 0..MAX_LUNS {
            match self.enumerate_partitions(lun, include_pseudo) {
                Ok(found) => partitions.extend(found),
                Err(e) => {
                    debug!(lun, error = %e, "LUN scan ended");
                    break;
                }
            }
        }
        info!(count = partitions.len(), "Partitions enumerated");
        partitions
    }
}
