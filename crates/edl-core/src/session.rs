//! EDL Session - connects to a device and brings it up to Firehose.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::events::{EdlEvent, EdlObserver, EdlPhase, TracingObserver};
use crate::firehose::{DeviceConfig, FirehoseResponse, FirehoseServer, PipelineOptions, PowerAction};
use crate::firehose::config::{DEFAULT_MAX_PAYLOAD, DEFAULT_MEMORY_NAME};
use crate::firehose::pipeline::{DEFAULT_BATCH_SIZE, DEFAULT_QUEUE_CAPACITY};
use crate::flasher::FlashOptions;
use crate::protocol::SaharaMode;
use crate::sahara::SaharaServer;
use crate::transport::{NusbTransport, SerialTransport, Transport, TransportError};

/// Configuration for an EDL session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Serial device (`/dev/ttyUSB0`, `COM3`). USB bulk is used when unset.
    pub port: Option<String>,
    /// Firehose programmer image uploaded over Sahara.
    pub programmer_path: Option<String>,
    /// Storage type requested in `<configure>`.
    pub memory_name: String,
    /// Payload size offered to the device before it reports its own.
    pub max_payload_to_target: usize,
    /// Write sparse images through the two-stage pipeline.
    pub sparse_pipeline: bool,
    pub queue_capacity: usize,
    pub batch_size: usize,
    /// How long to poll for a USB device.
    pub wait_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: None,
            programmer_path: None,
            memory_name: DEFAULT_MEMORY_NAME.to_string(),
            max_payload_to_target: DEFAULT_MAX_PAYLOAD,
            sparse_pipeline: false,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
            wait_timeout_secs: 60,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Firehose parameters before `<configure>` is answered.
    pub fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            memory_name: self.memory_name.clone(),
            max_payload_to_target: self.max_payload_to_target,
            ..Default::default()
        }
    }

    pub fn flash_options(&self) -> FlashOptions {
        FlashOptions {
            sparse_pipeline: self.sparse_pipeline,
            pipeline: PipelineOptions {
                queue_capacity: self.queue_capacity,
                batch_size: self.batch_size,
            },
        }
    }
}

/// Identity read in Sahara command mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub hardware_id: String,
    pub oem_pk_hash: String,
    pub serial_number: i32,
    pub sbl_version: i32,
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "MSM HWID:     {}", self.hardware_id)?;
        writeln!(f, "OEM PK Hash:  {}", self.oem_pk_hash)?;
        writeln!(f, "SerialNum:    {:#010x}", self.serial_number)?;
        write!(f, "SBL Version:  {}", self.sbl_version)
    }
}

/// EDL Session - Sahara bring-up followed by the Firehose hand-off.
pub struct EdlSession {
    config: SessionConfig,
    observer: Arc<dyn EdlObserver>,
    phase: EdlPhase,
}

impl EdlSession {
    /// Create a new session with default tracing observer.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }

    pub fn with_observer(config: SessionConfig, observer: Arc<dyn EdlObserver>) -> Self {
        Self {
            config,
            observer,
            phase: EdlPhase::WaitingForDevice,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn phase(&self) -> EdlPhase {
        self.phase
    }

    fn goto_phase(&mut self, to: EdlPhase) {
        if self.phase != to {
            self.observer.on_event(&EdlEvent::PhaseChanged {
                from: self.phase,
                to,
            });
        }
        self.phase = to;
    }

    /// Open the configured serial port, or poll USB for an EDL device.
    pub fn connect(&mut self) -> Result<Box<dyn Transport>> {
        self.goto_phase(EdlPhase::WaitingForDevice);
        let transport: Box<dyn Transport> = match &self.config.port {
            Some(port) => Box::new(SerialTransport::open(port)?),
            None => Box::new(self.wait_for_usb()?),
        };
        info!(device = %transport.name(), "Device connected");
        self.observer.on_event(&EdlEvent::DeviceConnected {
            name: transport.name(),
        });
        Ok(transport)
    }

    fn wait_for_usb(&self) -> Result<NusbTransport> {
        info!("Waiting for device...");
        let timeout = Duration::from_secs(self.config.wait_timeout_secs);
        let start = Instant::now();
        loop {
            match NusbTransport::open() {
                Ok(t) => return Ok(t),
                Err(TransportError::DeviceNotFound { .. }) => {
                    if start.elapsed() > timeout {
                        return Err(anyhow!(
                            "Timeout waiting for device after {}s",
                            timeout.as_secs()
                        ));
                    }
                    thread::sleep(Duration::from_millis(100));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Hello in command mode and read the identity registers.
    pub fn identify<T: Transport>(&mut self, sahara: &mut SaharaServer<T>) -> Result<DeviceIdentity> {
        self.goto_phase(EdlPhase::Sahara);
        let state = sahara.do_handshake(SaharaMode::Command)?;
        if state.command_ready().is_none() {
            bail!("Device did not enter Sahara command mode");
        }
        let identity = DeviceIdentity {
            hardware_id: sahara.hardware_id()?,
            oem_pk_hash: sahara.oem_pk_hash()?,
            serial_number: sahara.serial_number()?,
            sbl_version: sahara.sbl_version()?,
        };
        info!(hwid = %identity.hardware_id, pk_hash = %identity.oem_pk_hash, "Device identified");
        Ok(identity)
    }

    /// Identify the device, upload the programmer and configure Firehose.
    #[instrument(skip(self, transport))]
    pub fn enter_firehose<T: Transport>(
        &mut self,
        transport: T,
    ) -> Result<(DeviceIdentity, FirehoseServer<T>)> {
        let programmer = self
            .config
            .programmer_path
            .clone()
            .ok_or_else(|| anyhow!("No programmer configured"))?;

        let mut sahara = SaharaServer::new(transport).with_observer(self.observer.clone());
        let result = self.bring_up(&mut sahara, Path::new(&programmer));
        let identity = match result {
            Ok(identity) => identity,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        let mut firehose = FirehoseServer::new(sahara.into_transport())
            .with_observer(self.observer.clone())
            .with_config(self.config.device_config());

        self.goto_phase(EdlPhase::Configure);
        let response = firehose.get_device_config()?;
        if !response.is_ack() {
            warn!(status = %response.status, logs = ?response.logs, "Continuing with default configuration");
        }
        self.goto_phase(EdlPhase::Firehose);
        Ok((identity, firehose))
    }

    fn bring_up<T: Transport>(
        &mut self,
        sahara: &mut SaharaServer<T>,
        programmer: &Path,
    ) -> Result<DeviceIdentity> {
        let mut file = BufReader::new(
            File::open(programmer)
                .with_context(|| format!("Failed to open programmer {}", programmer.display()))?,
        );
        let length = file.seek(SeekFrom::End(0))?;

        let identity = self.identify(sahara)?;

        sahara.switch_mode(SaharaMode::ImageTxPending)?;
        let state = sahara.do_handshake(SaharaMode::ImageTxPending)?;
        let request = *state
            .read_request()
            .ok_or_else(|| anyhow!("Device did not request the programmer"))?;

        self.goto_phase(EdlPhase::ProgrammerUpload);
        info!(path = %programmer.display(), length, "Uploading programmer");
        sahara.send_programmer(&request, &mut file, length)?;
        Ok(identity)
    }

    fn fail(&mut self, error: &anyhow::Error) {
        self.goto_phase(EdlPhase::Error);
        self.observer.on_event(&EdlEvent::Error {
            message: format!("{error:#}"),
        });
    }

    /// Connect and bring the device up to a configured Firehose session.
    pub fn open(&mut self) -> Result<(DeviceIdentity, FirehoseServer<Box<dyn Transport>>)> {
        let transport = self.connect()?;
        self.enter_firehose(transport)
    }

    /// Send a power request. The session ends in `DeviceReset` once the
    /// programmer acknowledges it.
    pub fn reset_device<T: Transport>(
        &mut self,
        firehose: &mut FirehoseServer<T>,
        delay_secs: u32,
        action: PowerAction,
    ) -> Result<FirehoseResponse> {
        let response = firehose.reset_device(delay_secs, action)?.check()?;
        self.goto_phase(EdlPhase::DeviceReset);
        Ok(response)
    }

    /// Mark the session finished.
    pub fn complete(&mut self) {
        self.goto_phase(EdlPhase::Complete);
        self.observer.on_event(&EdlEvent::Complete);
    }
}
