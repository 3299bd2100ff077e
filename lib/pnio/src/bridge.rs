//! The command/status bridge: the only surface external collaborators see.
//! Commands enter through a bounded queue; state, readings and diagnostics
//! leave as snapshot copies and ordered event streams. The bridge owns its
//! queues and nothing else.

use crate::ar::layout::SlotEntry;
use crate::ar::ArState;
use crate::cyclic::{actuator, SensorReading};
use crate::dcp::DeviceInfo;
use crate::error::CommandError;
use crate::record::{
    ActuatorConfigEntry, AuthorityMode, DeviceConfig, RtuStatus, SensorConfigEntry, UserRecord,
};
use crate::registry::{RtuRegistry, RtuSnapshot};
use chrono::{DateTime, Utc};
use penstock::logging::{self, Logger};
use penstock::CorrelationId;
use serde_derive::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Commands accepted from external collaborators.
#[derive(Debug, Clone)]
pub enum Command {
    AddRtu {
        station: String,
        ip: Option<std::net::Ipv4Addr>,
        vendor_id: u16,
        device_id: u16,
        authority: AuthorityMode,
        slots: Vec<SlotEntry>,
        enrollment_token: [u8; 64],
    },
    RemoveRtu {
        station: String,
    },
    Connect {
        station: String,
    },
    Disconnect {
        station: String,
    },
    Discover,
    SetActuator {
        station: String,
        slot: u16,
        command: u8,
        duty: Option<u8>,
    },
    PushUserSyncOne {
        station: String,
        users: Vec<UserRecord>,
    },
    PushUserSyncAll {
        users: Vec<UserRecord>,
    },
    PushDeviceConfig {
        station: String,
        config: DeviceConfig,
    },
    PushSensorConfig {
        station: String,
        entries: Vec<SensorConfigEntry>,
    },
    PushActuatorConfig {
        station: String,
        entries: Vec<ActuatorConfigEntry>,
    },
    BindEnrollment {
        station: String,
    },
    ReadRecord {
        station: String,
        index: u16,
    },
    WriteRecord {
        station: String,
        index: u16,
        data: Vec<u8>,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::AddRtu { .. } => "add-rtu",
            Command::RemoveRtu { .. } => "remove-rtu",
            Command::Connect { .. } => "connect",
            Command::Disconnect { .. } => "disconnect",
            Command::Discover => "discover",
            Command::SetActuator { .. } => "set-actuator",
            Command::PushUserSyncOne { .. } => "push-user-sync-one",
            Command::PushUserSyncAll { .. } => "push-user-sync-all",
            Command::PushDeviceConfig { .. } => "push-device-config",
            Command::PushSensorConfig { .. } => "push-sensor-config",
            Command::PushActuatorConfig { .. } => "push-actuator-config",
            Command::BindEnrollment { .. } => "bind-enrollment",
            Command::ReadRecord { .. } => "read-record",
            Command::WriteRecord { .. } => "write-record",
        }
    }

    /// The station the command targets, if any.
    pub fn station(&self) -> Option<&str> {
        match self {
            Command::AddRtu { station, .. }
            | Command::RemoveRtu { station }
            | Command::Connect { station }
            | Command::Disconnect { station }
            | Command::SetActuator { station, .. }
            | Command::PushUserSyncOne { station, .. }
            | Command::PushDeviceConfig { station, .. }
            | Command::PushSensorConfig { station, .. }
            | Command::PushActuatorConfig { station, .. }
            | Command::BindEnrollment { station }
            | Command::ReadRecord { station, .. }
            | Command::WriteRecord { station, .. } => Some(station),
            Command::Discover | Command::PushUserSyncAll { .. } => None,
        }
    }

    /// True when execution requires a live AR on the target.
    fn needs_ar(&self) -> bool {
        matches!(
            self,
            Command::SetActuator { .. }
                | Command::PushUserSyncOne { .. }
                | Command::PushDeviceConfig { .. }
                | Command::PushSensorConfig { .. }
                | Command::PushActuatorConfig { .. }
                | Command::BindEnrollment { .. }
                | Command::ReadRecord { .. }
                | Command::WriteRecord { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct CommandEnvelope {
    pub correlation_id: CorrelationId,
    pub submitted_secs: u64,
    pub command: Command,
}

/// Result payload published with the originating correlation id.
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    Done,
    RecordData(Vec<u8>),
    Status(RtuStatus),
}

/// Events published to subscribers. Order is preserved per RTU; no ordering
/// is guaranteed across RTUs.
#[derive(Debug, Clone)]
pub enum Event {
    SensorUpdate(SensorReading),
    ActuatorUpdate {
        station: String,
        slot: u16,
        command: u8,
    },
    RtuStateChange {
        station: String,
        state: ArState,
        reason: Option<String>,
    },
    Alarm {
        station: Option<String>,
        frame_id: u16,
        data: Vec<u8>,
    },
    CommandCompleted {
        correlation_id: CorrelationId,
        result: Result<CommandOutcome, CommandError>,
    },
}

/// PROFINET identity of this controller.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerIdentity {
    pub vendor_id: u16,
    pub device_id: u16,
    pub station_name: String,
}

/// Per-IOCR summary exposed in the diagnostic bundle.
#[derive(Debug, Clone, Serialize)]
pub struct CyclicSummary {
    pub station: String,
    pub input_frame_id: u16,
    pub output_frame_id: u16,
    pub period_us: u64,
    pub input_placements: usize,
    pub output_placements: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub controller: ControllerIdentity,
    pub version: String,
    pub generated_at: DateTime<Utc>,
    pub rtus: Vec<RtuSnapshot>,
    pub devices: Vec<DeviceInfo>,
    pub cyclic: Vec<CyclicSummary>,
    /// Maintained by the external alarm manager.
    pub active_alarms: u32,
}

impl StatusSnapshot {
    pub fn empty(controller: ControllerIdentity) -> StatusSnapshot {
        StatusSnapshot {
            controller,
            version: env!("CARGO_PKG_VERSION").to_string(),
            generated_at: Utc::now(),
            rtus: Vec::new(),
            devices: Vec::new(),
            cyclic: Vec::new(),
            active_alarms: 0,
        }
    }
}

/// Validates a command against the registry before any frame is built.
/// An RTU in the terminal error state rejects every AR-dependent command
/// synchronously; nothing is dispatched.
pub fn gate_command(command: &Command, registry: &RtuRegistry) -> Result<(), CommandError> {
    if let Command::AddRtu { .. } = command {
        return Ok(());
    }

    let record = match command.station() {
        Some(station) => registry
            .get(station)
            .ok_or_else(|| CommandError::UnknownStation {
                station: station.to_string(),
            })?,
        None => return Ok(()),
    };

    if command.needs_ar() && record.ar_state == ArState::Error {
        return Err(CommandError::RtuOffline {
            station: record.station().to_string(),
        });
    }

    if let Command::SetActuator {
        station,
        slot,
        command: cmd,
        duty,
    } = command
    {
        if record.output_slot(*slot).is_none() {
            return Err(CommandError::UnknownSlot {
                station: station.clone(),
                slot: *slot,
            });
        }

        if let Some(duty) = duty {
            if *cmd == actuator::PWM && *duty > 100 {
                return Err(CommandError::InvalidDuty { duty: *duty });
            }
        }
    }

    Ok(())
}

/// Creates the bounded bridge pair: the handle for external collaborators
/// and the core for the controller runtime.
pub fn channel<'a, L: Into<Option<&'a Logger>>>(
    depth: usize,
    controller: ControllerIdentity,
    log: L,
) -> (BridgeHandle, BridgeCore) {
    let log = match log.into() {
        Some(log) => log.new(logging::o!()),
        None => logging::discard(),
    };

    let (tx, rx) = mpsc::sync_channel(depth);
    let status = Arc::new(Mutex::new(StatusSnapshot::empty(controller)));
    let subscribers = Arc::new(Mutex::new(Vec::new()));

    let handle = BridgeHandle {
        tx,
        correlation: Arc::new(AtomicU64::new(1)),
        status: Arc::clone(&status),
        subscribers: Arc::clone(&subscribers),
    };

    let core = BridgeCore {
        rx,
        status,
        subscribers,
        log,
    };

    (handle, core)
}

/// The external half: enqueue commands, poll status, subscribe to events.
#[derive(Clone)]
pub struct BridgeHandle {
    tx: SyncSender<CommandEnvelope>,
    correlation: Arc<AtomicU64>,
    status: Arc<Mutex<StatusSnapshot>>,
    subscribers: Arc<Mutex<Vec<mpsc::Sender<Event>>>>,
}

impl BridgeHandle {
    /// Appends a command to the bounded queue. A full queue returns
    /// `Backpressure`; the caller retries.
    pub fn enqueue(&self, command: Command) -> Result<CorrelationId, CommandError> {
        let correlation_id = self.correlation.fetch_add(1, Ordering::Relaxed);

        let envelope = CommandEnvelope {
            correlation_id,
            submitted_secs: penstock::time::timestamp_secs(),
            command,
        };

        match self.tx.try_send(envelope) {
            Ok(()) => Ok(correlation_id),
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                Err(CommandError::Backpressure)
            }
        }
    }

    /// Snapshot of the per-RTU state and the diagnostic bundle.
    pub fn poll_status(&self) -> StatusSnapshot {
        self.status.lock().expect("status lock poisoned").clone()
    }

    /// Registers an event stream. Events for one RTU arrive in order.
    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .push(tx);
        rx
    }
}

/// The runtime half: drain commands, publish events and status.
pub struct BridgeCore {
    rx: Receiver<CommandEnvelope>,
    status: Arc<Mutex<StatusSnapshot>>,
    subscribers: Arc<Mutex<Vec<mpsc::Sender<Event>>>>,
    log: Logger,
}

impl BridgeCore {
    /// Next queued command, or `None` after `timeout`.
    pub fn next_command(&self, timeout: Duration) -> Option<CommandEnvelope> {
        match self.rx.recv_timeout(timeout) {
            Ok(envelope) => Some(envelope),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Fans an event out to every subscriber. Disconnected subscribers are
    /// dropped and the drop is logged.
    pub fn publish(&self, event: Event) {
        let mut subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        let before = subscribers.len();

        subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());

        let dropped = before - subscribers.len();
        if dropped > 0 {
            logging::info!(self.log, "dropped disconnected subscribers";
                           "context" => "publish",
                           "dropped" => dropped,
                           "remaining" => subscribers.len());
        }
    }

    /// Publishes the result of a completed command.
    pub fn complete(
        &self,
        correlation_id: CorrelationId,
        result: Result<CommandOutcome, CommandError>,
    ) {
        if let Err(err) = &result {
            logging::info!(self.log, "command failed";
                           "context" => "complete",
                           "correlation_id" => correlation_id,
                           "code" => err.code(),
                           "error" => %err);
        }

        self.publish(Event::CommandCompleted {
            correlation_id,
            result,
        });
    }

    /// Replaces the published status snapshot.
    pub fn update_status(&self, snapshot: StatusSnapshot) {
        *self.status.lock().expect("status lock poisoned") = snapshot;
    }
}
