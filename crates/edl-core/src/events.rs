//! Event system for UI decoupling.
//!
//! Lets the CLI (or any other front end) follow Sahara and Firehose progress
//! without the protocol code knowing how it is displayed.

use std::fmt;

/// Session phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdlPhase {
    /// Waiting for device connection.
    WaitingForDevice,
    /// Sahara hello / command mode.
    Sahara,
    /// Programmer upload over Sahara.
    ProgrammerUpload,
    /// Firehose configure exchange.
    Configure,
    /// Partition operations over Firehose.
    Firehose,
    /// Device is resetting.
    DeviceReset,
    /// All operations complete.
    Complete,
    /// Error state.
    Error,
}

impl fmt::Display for EdlPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EdlPhase::WaitingForDevice => write!(f, "Waiting for Device"),
            EdlPhase::Sahara => write!(f, "Sahara"),
            EdlPhase::ProgrammerUpload => write!(f, "Programmer Upload"),
            EdlPhase::Configure => write!(f, "Configure"),
            EdlPhase::Firehose => write!(f, "Firehose"),
            EdlPhase::DeviceReset => write!(f, "Device Reset"),
            EdlPhase::Complete => write!(f, "Complete"),
            EdlPhase::Error => write!(f, "Error"),
        }
    }
}

/// Events emitted by the EDL session and protocol engines.
#[derive(Debug, Clone)]
pub enum EdlEvent {
    /// Device connected.
    DeviceConnected { name: String },
    /// Phase changed.
    PhaseChanged { from: EdlPhase, to: EdlPhase },
    /// Progress update for the named operation.
    ///
    /// Units depend on the operation: bytes for reads and unsparse writes,
    /// sectors for the sparse pipeline, steps for the flasher.
    Progress {
        operation: String,
        current: u64,
        total: u64,
    },
    /// `<log value=...>` line reported by the programmer.
    DeviceLog { message: String },
    /// Firehose response status received.
    Response { status: String },
    /// Error occurred.
    Error { message: String },
    /// Sahara frame or Firehose request sent/received.
    Packet {
        direction: PacketDirection,
        packet_type: String,
        length: usize,
    },
    /// All operations completed successfully.
    Complete,
}

impl EdlEvent {
    pub fn progress(operation: impl Into<String>, current: u64, total: u64) -> Self {
        EdlEvent::Progress {
            operation: operation.into(),
            current,
            total,
        }
    }
}

/// Packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Device
    Rx, // Device -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving EDL events.
///
/// Implement this trait in your UI layer to receive updates. Observers are
/// shared with the sparse pipeline's worker thread, hence `Send + Sync`.
pub trait EdlObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &EdlEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl EdlObserver for NullObserver {
    fn on_event(&self, _event: &EdlEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl EdlObserver for TracingObserver {
    fn on_event(&self, event: &EdlEvent) {
        match event {
            EdlEvent::DeviceConnected { name } => {
                tracing::info!(device = %name, "Device connected");
            }
            EdlEvent::PhaseChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Phase changed");
            }
            EdlEvent::Progress {
                operation,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(operation = %operation, progress = %format!("{}%", pct), "Progress");
            }
            EdlEvent::DeviceLog { message } => {
                tracing::info!(target: "edl::device", "{}", message);
            }
            EdlEvent::Response { status } => {
                tracing::debug!(status = %status, "Response received");
            }
            EdlEvent::Error { message } => {
                tracing::error!("Error: {}", message);
            }
            EdlEvent::Packet {
                direction,
                packet_type,
                length,
            } => {
                tracing::trace!(
                    dir = %direction,
                    type_ = %packet_type,
                    len = length,
                    "Packet"
                );
            }
            EdlEvent::Complete => {
                tracing::info!("Operation complete");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Observer that records every event, for assertions in other modules.
    #[derive(Default)]
    pub(crate) struct RecordingObserver {
        pub events: Mutex<Vec<EdlEvent>>,
    }

    impl RecordingObserver {
        pub fn progress_of(&self, operation: &str) -> Vec<(u64, u64)> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    EdlEvent::Progress {
                        operation: op,
                        current,
                        total,
                    } if op == operation => Some((*current, *total)),
                    _ => None,
                })
                .collect()
        }
    }

    impl EdlObserver for RecordingObserver {
        fn on_event(&self, event: &EdlEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(EdlPhase::ProgrammerUpload.to_string(), "Programmer Upload");
        assert_eq!(PacketDirection::Rx.to_string(), "RX");
    }

    #[test]
    fn test_recording_observer_filters_progress() {
        let obs = RecordingObserver::default();
        obs.on_event(&EdlEvent::progress("Read", 1, 4));
        obs.on_event(&EdlEvent::Complete);
        obs.on_event(&EdlEvent::progress("Write", 2, 4));
        assert_eq!(obs.progress_of("Read"), vec![(1, 4)]);
    }
}
