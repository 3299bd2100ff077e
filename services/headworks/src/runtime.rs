//! Controller runtime: thread wiring and command execution.
//!
//! Task layout: one thread receives raw frames and fans them out by
//! FrameID; one worker thread per RTU owns that RTU's AR machine, RPC
//! socket and cyclic state; the executor thread owns the registry, the
//! discovery component and the bridge. Workers report back over a single
//! feedback channel, which keeps per-RTU event ordering intact.

use crate::config::ControllerConfig;
use crate::persist::StrategyStore;
use hashbrown::HashMap;
use penstock::logging::{self, Logger};
use penstock::time::{monotonic_micros, timestamp_secs};
use penstock::CorrelationId;
use pnio::ar::layout::ExpectedCatalogue;
use pnio::ar::{ArConfig, ArEvent, ArMachine, ArState, Effect};
use pnio::bridge::{
    self, BridgeCore, BridgeHandle, Command, CommandEnvelope, CommandOutcome, ControllerIdentity,
    CyclicSummary, Event, StatusSnapshot,
};
use pnio::codec::Mac;
use pnio::cyclic::CyclicIo;
use pnio::dcp::{Discovery, DiscoveryEvent};
use pnio::error::{CommandError, LinkError};
use pnio::link::{AlarmFrame, FrameDispatcher, Link, LinkSender, PnetLink};
use pnio::record::{self, Enrollment, EnrollmentOp};
use pnio::registry::{RtuRecord, RtuRegistry};
use pnio::rpc::connect::parse_application_ready;
use pnio::rpc::strategy::{SessionProgress, VendorHints};
use pnio::rpc::transport::RpcTransport;
use pnio::rpc::PNIO_UDP_PORT;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(10);
const LINK_READ_TIMEOUT: Duration = Duration::from_millis(5);
const MAILBOX_DEPTH: usize = 32;
const STATUS_REFRESH: Duration = Duration::from_secs(1);
const RECORD_READ_MAX: u32 = 4096;

enum DispatchControl {
    Register {
        frame_id: u16,
        mailbox: SyncSender<Vec<u8>>,
    },
    Unregister {
        frame_id: u16,
    },
}

enum WorkerCommand {
    Connect {
        addr: SocketAddr,
        correlation: CorrelationId,
    },
    Disconnect {
        correlation: CorrelationId,
    },
    SetActuator {
        slot: u16,
        subslot: u16,
        command: u8,
        correlation: CorrelationId,
    },
    ReadRecord {
        index: u16,
        correlation: CorrelationId,
    },
    WriteRecord {
        index: u16,
        data: Vec<u8>,
        correlation: CorrelationId,
    },
    Shutdown,
}

enum Feedback {
    StateChange {
        station: String,
        state: ArState,
        reason: Option<String>,
        /// `(index, attempts)` persisted after a successful connect.
        proven: Option<(usize, u64)>,
        cyclic: Option<CyclicSummary>,
    },
    Event(Event),
    Completed {
        correlation: CorrelationId,
        result: Result<CommandOutcome, CommandError>,
    },
}

struct WorkerHandle {
    commands: Sender<WorkerCommand>,
    join: Option<JoinHandle<()>>,
    input_frame_id: u16,
}

/// One thread per RTU: exclusive owner of the AR machine, the RPC socket
/// and the cyclic buffers.
struct ArWorker {
    machine: ArMachine,
    cyclic: Option<CyclicIo>,
    transport: RpcTransport,
    link: LinkSender,
    host_mac: Mac,
    peer_addr: Option<SocketAddr>,
    data_hold: Duration,
    watchdog: Duration,
    cyclic_started: Option<Instant>,
    commands: Receiver<WorkerCommand>,
    mailbox: Receiver<Vec<u8>>,
    feedback: Sender<Feedback>,
    log: Logger,
}

impl ArWorker {
    fn run(mut self) {
        loop {
            let now = Instant::now();

            while let Ok(command) = self.commands.try_recv() {
                if !self.handle_command(command, now) {
                    return;
                }
            }

            match self.machine.state() {
                ArState::WaitAppReady => self.poll_app_ready(now),
                ArState::Data => self.drive_cyclic(now),
                _ => thread::sleep(TICK),
            }
        }
    }

    fn handle_command(&mut self, command: WorkerCommand, now: Instant) -> bool {
        match command {
            WorkerCommand::Connect { addr, correlation } => {
                self.connect_flow(addr, correlation, now);
            }
            WorkerCommand::Disconnect { correlation } => {
                self.disconnect_flow(correlation, now);
            }
            WorkerCommand::SetActuator {
                slot,
                subslot,
                command,
                correlation,
            } => self.set_actuator(slot, subslot, command, correlation),
            WorkerCommand::ReadRecord { index, correlation } => {
                let result = self.with_peer(|worker, addr| {
                    let data = worker
                        .machine
                        .read_record(&mut worker.transport, addr, index, RECORD_READ_MAX)
                        .map_err(CommandError::from)?;

                    // Status reads come back decoded; everything else stays
                    // raw for the caller.
                    if index == record::index::RTU_STATUS {
                        record::parse_rtu_status(&data)
                            .map(CommandOutcome::Status)
                            .map_err(CommandError::from)
                    } else {
                        Ok(CommandOutcome::RecordData(data))
                    }
                });
                self.complete(correlation, result);
            }
            WorkerCommand::WriteRecord {
                index,
                data,
                correlation,
            } => {
                let result = self.with_peer(|worker, addr| {
                    worker
                        .machine
                        .write_record(&mut worker.transport, addr, index, &data)
                        .map(|()| CommandOutcome::Done)
                        .map_err(CommandError::from)
                });
                self.complete(correlation, result);
            }
            WorkerCommand::Shutdown => {
                if self.machine.state() == ArState::Data {
                    if self.machine.apply(&ArEvent::ReleaseRequested, now).is_ok() {
                        self.stop_cyclic();
                        if let Some(addr) = self.peer_addr {
                            self.machine.run_release(&mut self.transport, addr, now);
                        }
                    }
                }
                return false;
            }
        }

        true
    }

    fn with_peer<F>(&mut self, op: F) -> Result<CommandOutcome, CommandError>
    where
        F: FnOnce(&mut ArWorker, SocketAddr) -> Result<CommandOutcome, CommandError>,
    {
        match self.peer_addr {
            Some(addr) => op(self, addr),
            None => Err(CommandError::OperationFailed {
                station: self.machine.station().to_string(),
                reason: "AR is not connected".to_string(),
            }),
        }
    }

    fn connect_flow(&mut self, addr: SocketAddr, correlation: CorrelationId, now: Instant) {
        if self.machine.state() == ArState::Error {
            if self.machine.apply(&ArEvent::Reset, now).is_ok() {
                self.report_state(None, None);
            }
        }

        if self.machine.apply(&ArEvent::DeviceFound, now).is_err() {
            self.complete(
                correlation,
                Err(CommandError::OperationFailed {
                    station: self.machine.station().to_string(),
                    reason: format!("AR busy in state {}", self.machine.state()),
                }),
            );
            return;
        }

        self.peer_addr = Some(addr);
        self.report_state(None, None);

        let effects = self.machine.run_connect(&mut self.transport, addr, now);

        let proven = self
            .machine
            .progress()
            .last_successful()
            .filter(|_| effects.contains(&Effect::PersistStrategyIndex))
            .map(|index| (index, self.machine.progress().attempts()));

        self.report_state(proven, None);

        if effects.contains(&Effect::SendPrmEnd) {
            self.machine.run_prm_end(&mut self.transport, addr, now);
            self.report_state(None, None);
        }

        match self.machine.state() {
            ArState::WaitAppReady => self.complete(correlation, Ok(CommandOutcome::Done)),
            _ => self.complete(
                correlation,
                Err(CommandError::OperationFailed {
                    station: self.machine.station().to_string(),
                    reason: self
                        .machine
                        .error_reason()
                        .unwrap_or("connect failed")
                        .to_string(),
                }),
            ),
        }
    }

    fn disconnect_flow(&mut self, correlation: CorrelationId, now: Instant) {
        match self.machine.apply(&ArEvent::ReleaseRequested, now) {
            Ok(effects) => {
                if effects.contains(&Effect::StopCyclic) {
                    self.stop_cyclic();
                }

                if let Some(addr) = self.peer_addr {
                    self.machine.run_release(&mut self.transport, addr, now);
                }

                self.report_state(None, None);
                self.complete(correlation, Ok(CommandOutcome::Done));
            }
            Err(_) => self.complete(
                correlation,
                Err(CommandError::OperationFailed {
                    station: self.machine.station().to_string(),
                    reason: format!("no releasable AR in state {}", self.machine.state()),
                }),
            ),
        }
    }

    fn set_actuator(
        &mut self,
        slot: u16,
        subslot: u16,
        command: u8,
        correlation: CorrelationId,
    ) {
        let station = self.machine.station().to_string();

        let staged = match self.cyclic.as_mut() {
            Some(cyclic) => cyclic.output.set_command(slot, subslot, command),
            None => false,
        };

        if staged {
            self.feedback
                .send(Feedback::Event(Event::ActuatorUpdate {
                    station,
                    slot,
                    command,
                }))
                .ok();
            self.complete(correlation, Ok(CommandOutcome::Done));
        } else {
            self.complete(
                correlation,
                Err(CommandError::OperationFailed {
                    station,
                    reason: "cyclic exchange is not active".to_string(),
                }),
            );
        }
    }

    fn poll_app_ready(&mut self, now: Instant) {
        let indication = match self.transport.poll_indication(TICK) {
            Ok(Some(indication)) => indication,
            Ok(None) => return,
            Err(err) => {
                logging::warn!(self.log, "indication poll failed";
                               "context" => "poll_app_ready",
                               "error" => %err);
                return;
            }
        };

        let (peer, bytes) = indication;

        let ind = match parse_application_ready(&bytes) {
            Ok(ind) => ind,
            Err(err) => {
                logging::debug!(self.log, "discarding indication";
                                "context" => "poll_app_ready",
                                "error" => %err);
                return;
            }
        };

        match self.machine.handle_application_ready(&ind, now) {
            Ok((response, effects)) => {
                if let Err(err) = self.transport.send_response(peer, &response) {
                    logging::warn!(self.log, "ApplicationReady response send failed";
                                   "context" => "poll_app_ready",
                                   "error" => %err);
                }

                let summary = if effects.contains(&Effect::StartCyclic) {
                    self.start_cyclic(now)
                } else {
                    None
                };

                self.report_state(None, summary);
            }
            Err(err) => {
                logging::debug!(self.log, "ApplicationReady rejected";
                                "context" => "poll_app_ready",
                                "error" => %err);
            }
        }
    }

    fn start_cyclic(&mut self, now: Instant) -> Option<CyclicSummary> {
        let session = self.machine.session()?;

        let period = session.period();
        let summary = CyclicSummary {
            station: self.machine.station().to_string(),
            input_frame_id: session.layouts.input.frame_id,
            output_frame_id: session.layouts.output.frame_id,
            period_us: period.as_micros() as u64,
            input_placements: session.layouts.input.data.len(),
            output_placements: session.layouts.output.data.len(),
        };

        self.data_hold = session.data_hold_timeout();
        self.watchdog = session.watchdog_timeout();

        self.cyclic = Some(CyclicIo::new(
            self.machine.station().to_string(),
            self.host_mac,
            session.peer_mac,
            &session.layouts,
            period,
            &self.log,
        ));
        self.cyclic_started = Some(now);

        Some(summary)
    }

    fn stop_cyclic(&mut self) {
        if let Some(cyclic) = self.cyclic.take() {
            for reading in cyclic.offline_readings(monotonic_micros()) {
                self.feedback
                    .send(Feedback::Event(Event::SensorUpdate(reading)))
                    .ok();
            }
        }
        self.cyclic_started = None;
    }

    fn drive_cyclic(&mut self, now: Instant) {
        if let Some(cyclic) = self.cyclic.as_mut() {
            match cyclic.tick(now) {
                Ok(Some(frame)) => {
                    if let Err(err) = self.link.send(&frame) {
                        logging::warn!(self.log, "cyclic send failed";
                                       "context" => "drive_cyclic",
                                       "error" => %err);
                    }
                }
                Ok(None) => (),
                Err(err) => {
                    logging::error!(self.log, "cyclic frame build failed";
                                    "context" => "drive_cyclic",
                                    "error" => %err);
                }
            }
        }

        // Block briefly on the mailbox, then drain whatever queued up.
        let mut frames = Vec::new();
        if let Ok(frame) = self.mailbox.recv_timeout(TICK) {
            frames.push(frame);
        }
        while let Ok(frame) = self.mailbox.try_recv() {
            frames.push(frame);
        }

        for frame in frames {
            let readings = match self.cyclic.as_mut() {
                Some(cyclic) => cyclic.process_input(&frame, now, monotonic_micros()),
                None => break,
            };

            match readings {
                Ok(readings) => {
                    for reading in readings {
                        self.feedback
                            .send(Feedback::Event(Event::SensorUpdate(reading)))
                            .ok();
                    }
                }
                Err(err) => {
                    logging::debug!(self.log, "input frame discarded";
                                    "context" => "drive_cyclic",
                                    "error" => %err);
                }
            }
        }

        // Held readings that aged past the staleness threshold go out once
        // with their degraded quality.
        if let Some(cyclic) = self.cyclic.as_mut() {
            for reading in cyclic.degraded_readings(now, monotonic_micros()) {
                self.feedback
                    .send(Feedback::Event(Event::SensorUpdate(reading)))
                    .ok();
            }
        }

        self.check_timers(now);
    }

    /// The two Data exits consume distinct conditions: the watchdog covers
    /// an exchange that never produced its first input frame (the RTU
    /// acknowledged ApplicationReady but sends nothing — unrecoverable),
    /// while data-hold covers silence on a flow that did come up and is
    /// answered with a graceful release.
    fn check_timers(&mut self, now: Instant) {
        let started = match (&self.cyclic, self.cyclic_started) {
            (Some(_), Some(started)) => started,
            _ => return,
        };

        let age = self
            .cyclic
            .as_ref()
            .and_then(|cyclic| cyclic.input.age(now));

        match age {
            None => {
                let waiting = now.duration_since(started);

                if waiting >= self.watchdog {
                    logging::error!(self.log, "no input frame since cyclic start, watchdog expired";
                                    "context" => "check_timers",
                                    "waiting_ms" => waiting.as_millis() as u64);

                    let reason = format!(
                        "No cyclic input frame within {} ms of ApplicationReady. \
                         Check the RTU's cyclic output configuration, then reset the AR.",
                        self.watchdog.as_millis()
                    );

                    if self
                        .machine
                        .fail(&ArEvent::WatchdogExpired, reason, now)
                        .is_ok()
                    {
                        self.stop_cyclic();
                        self.report_state(None, None);
                    }
                }
            }
            Some(age) => {
                if age >= self.data_hold {
                    logging::warn!(self.log, "data hold expired, releasing";
                                   "context" => "check_timers",
                                   "age_ms" => age.as_millis() as u64);

                    if self.machine.apply(&ArEvent::DataHoldExpired, now).is_ok() {
                        self.stop_cyclic();
                        if let Some(addr) = self.peer_addr {
                            self.machine.run_release(&mut self.transport, addr, now);
                        }
                        self.report_state(None, None);
                    }
                }
            }
        }
    }

    fn report_state(&self, proven: Option<(usize, u64)>, cyclic: Option<CyclicSummary>) {
        self.feedback
            .send(Feedback::StateChange {
                station: self.machine.station().to_string(),
                state: self.machine.state(),
                reason: self.machine.error_reason().map(str::to_string),
                proven,
                cyclic,
            })
            .ok();
    }

    fn complete(&self, correlation: CorrelationId, result: Result<CommandOutcome, CommandError>) {
        self.feedback
            .send(Feedback::Completed {
                correlation,
                result,
            })
            .ok();
    }
}

/// The executor: owns the registry, discovery, strategy store and bridge
/// core, and brokers between external commands and the per-AR workers.
pub struct Runtime {
    identity: ControllerIdentity,
    instance: u16,
    host_mac: Mac,
    rpc_bind_ip: IpAddr,
    link: LinkSender,
    dispatch_control: Sender<DispatchControl>,
    registry: RtuRegistry,
    discovery: Discovery,
    store: StrategyStore,
    hints: VendorHints,
    workers: HashMap<String, WorkerHandle>,
    feedback_tx: Sender<Feedback>,
    feedback_rx: Receiver<Feedback>,
    dcp_rx: Receiver<Vec<u8>>,
    alarm_rx: Receiver<AlarmFrame>,
    core: BridgeCore,
    cyclic_summaries: HashMap<String, CyclicSummary>,
    alarm_count: u32,
    next_frame_index: usize,
    last_status: Instant,
    rx_thread: Option<JoinHandle<()>>,
    log: Logger,
}

impl Runtime {
    /// Opens the production link on the configured interface.
    pub fn start(
        config: &ControllerConfig,
        log: &Logger,
    ) -> Result<(Runtime, BridgeHandle), LinkError> {
        let host_mac = PnetLink::interface_mac(&config.controller.interface)?;
        let link = PnetLink::open(&config.controller.interface, LINK_READ_TIMEOUT)?;

        Runtime::with_link(config, Box::new(link), host_mac, log).map_err(|err| match err {
            CommandError::Config(_) => LinkError::UnhandledInterfaceType,
            _ => LinkError::Closed,
        })
    }

    /// Wires the runtime over an arbitrary link (tests use the in-memory
    /// double).
    pub fn with_link(
        config: &ControllerConfig,
        link: Box<dyn Link>,
        host_mac: Mac,
        log: &Logger,
    ) -> Result<(Runtime, BridgeHandle), CommandError> {
        let log = log.new(logging::o!("component" => "runtime"));

        let identity = ControllerIdentity {
            vendor_id: config.controller.vendor_id,
            device_id: config.controller.device_id,
            station_name: config.controller.station_name.clone(),
        };

        let (handle, core) = bridge::channel(
            config.controller.command_queue_depth,
            identity.clone(),
            Some(&log),
        );

        let link = LinkSender::new(link);

        let (control_tx, control_rx) = mpsc::channel();
        let (dcp_tx, dcp_rx) = mpsc::channel();
        let (alarm_tx, alarm_rx) = mpsc::channel();
        let (feedback_tx, feedback_rx) = mpsc::channel();

        let rx_thread = spawn_rx_thread(link.clone(), control_rx, dcp_tx, alarm_tx, &log);

        let mut discovery = Discovery::new(host_mac, Some(&log));
        discovery
            .set_timeout_ms(config.controller.discovery_timeout_ms)
            .map_err(CommandError::from)?;

        let rpc_bind_ip = config
            .controller
            .rpc_bind
            .parse::<SocketAddr>()
            .map(|addr| addr.ip())
            .unwrap_or_else(|_| IpAddr::from([0, 0, 0, 0]));

        let store = StrategyStore::load(config.controller.strategy_store.clone(), &log);

        let mut runtime = Runtime {
            identity,
            instance: config.controller.instance,
            host_mac,
            rpc_bind_ip,
            link,
            dispatch_control: control_tx,
            registry: RtuRegistry::new(),
            discovery,
            store,
            hints: VendorHints::builtin(),
            workers: HashMap::new(),
            feedback_tx,
            feedback_rx,
            dcp_rx,
            alarm_rx,
            core,
            cyclic_summaries: HashMap::new(),
            alarm_count: 0,
            next_frame_index: 0,
            last_status: Instant::now(),
            rx_thread: Some(rx_thread),
            log,
        };

        for record in config.rtu_records().map_err(CommandError::from)? {
            runtime.register_rtu(record)?;
        }

        Ok((runtime, handle))
    }

    /// Main executor loop; returns once `stop` is set.
    pub fn run(mut self, stop: &AtomicBool) {
        logging::info!(self.log, "controller running";
                       "context" => "run",
                       "station" => &self.identity.station_name,
                       "rtus" => self.registry.len());

        while !stop.load(Ordering::Relaxed) {
            if let Some(envelope) = self.core.next_command(TICK) {
                self.execute(envelope);
            }

            self.drain_feedback();
            self.drain_dcp();
            self.drain_alarms();

            if self.last_status.elapsed() >= STATUS_REFRESH {
                self.refresh_status();
                self.last_status = Instant::now();
            }
        }

        self.shutdown();

        // Closing the control channel releases the receive thread.
        drop(self.dispatch_control);
        if let Some(rx_thread) = self.rx_thread.take() {
            rx_thread.join().ok();
        }
    }

    fn register_rtu(&mut self, record: RtuRecord) -> Result<(), CommandError> {
        let station = record.station().to_string();

        let (input_frame_id, output_frame_id) = ControllerConfig::frame_ids(self.next_frame_index);
        self.next_frame_index += 1;

        let catalogue =
            ExpectedCatalogue::from_entries(0, &record.slots).map_err(CommandError::from)?;

        let progress = SessionProgress::new(
            self.store.last_successful(&station),
            self.hints.lookup(record.vendor_id),
            Instant::now(),
        );

        let machine = ArMachine::new(
            ArConfig {
                station: station.clone(),
                vendor_id: record.vendor_id,
                device_id: record.device_id,
                instance: self.instance,
                host_mac: self.host_mac,
                controller_station: self.identity.station_name.clone(),
                catalogue,
                input_frame_id,
                output_frame_id,
            },
            progress,
            Instant::now(),
            Some(&self.log),
        )
        .map_err(CommandError::from)?;

        let transport = RpcTransport::bind(SocketAddr::new(self.rpc_bind_ip, 0), Some(&self.log))
            .map_err(CommandError::from)?;

        let (command_tx, command_rx) = mpsc::channel();
        let (mailbox_tx, mailbox_rx) = mpsc::sync_channel(MAILBOX_DEPTH);

        self.dispatch_control
            .send(DispatchControl::Register {
                frame_id: input_frame_id,
                mailbox: mailbox_tx,
            })
            .ok();

        let worker = ArWorker {
            machine,
            cyclic: None,
            transport,
            link: self.link.clone(),
            host_mac: self.host_mac,
            peer_addr: None,
            data_hold: Duration::from_secs(1),
            watchdog: Duration::from_secs(2),
            cyclic_started: None,
            commands: command_rx,
            mailbox: mailbox_rx,
            feedback: self.feedback_tx.clone(),
            log: self.log.new(logging::o!("station" => station.clone())),
        };

        let join = thread::Builder::new()
            .name(format!("ar-{}", station))
            .spawn(move || worker.run())
            .expect("AR worker spawn failed");

        self.registry.insert(record).map_err(CommandError::from)?;
        self.workers.insert(
            station,
            WorkerHandle {
                commands: command_tx,
                join: Some(join),
                input_frame_id,
            },
        );

        Ok(())
    }

    fn execute(&mut self, envelope: CommandEnvelope) {
        let CommandEnvelope {
            correlation_id,
            command,
            ..
        } = envelope;

        logging::debug!(self.log, "executing command";
                        "context" => "execute",
                        "command" => command.name(),
                        "correlation_id" => correlation_id);

        if let Err(err) = bridge::gate_command(&command, &self.registry) {
            self.core.complete(correlation_id, Err(err));
            return;
        }

        match command {
            Command::AddRtu {
                station,
                ip,
                vendor_id,
                device_id,
                authority,
                slots,
                enrollment_token,
            } => {
                let result = RtuRecord::new(&station, vendor_id, device_id, slots)
                    .map_err(CommandError::from)
                    .and_then(|mut record| {
                        record.ip = ip;
                        record.authority = authority;
                        record.enrollment_token = enrollment_token;
                        self.register_rtu(record)
                    })
                    .map(|()| CommandOutcome::Done);

                self.core.complete(correlation_id, result);
            }
            Command::RemoveRtu { station } => {
                if let Some(mut handle) = self.workers.remove(&station) {
                    handle.commands.send(WorkerCommand::Shutdown).ok();
                    self.dispatch_control
                        .send(DispatchControl::Unregister {
                            frame_id: handle.input_frame_id,
                        })
                        .ok();
                    if let Some(join) = handle.join.take() {
                        join.join().ok();
                    }
                }

                self.registry.remove(&station);
                self.store.forget(&station);
                self.cyclic_summaries.remove(&station);
                self.core.complete(correlation_id, Ok(CommandOutcome::Done));
            }
            Command::Connect { station } => {
                let addr = self.resolve_addr(&station);

                match addr {
                    Some(addr) => self.forward(
                        &station,
                        WorkerCommand::Connect {
                            addr,
                            correlation: correlation_id,
                        },
                        correlation_id,
                    ),
                    None => self.core.complete(
                        correlation_id,
                        Err(CommandError::OperationFailed {
                            station,
                            reason: "no IP address known; configure one or run discovery"
                                .to_string(),
                        }),
                    ),
                }
            }
            Command::Disconnect { station } => self.forward(
                &station,
                WorkerCommand::Disconnect {
                    correlation: correlation_id,
                },
                correlation_id,
            ),
            Command::Discover => {
                let result = self
                    .discovery
                    .identify_all()
                    .map_err(|err| CommandError::Rpc(err.into()))
                    .and_then(|frame| {
                        self.link.send(&frame).map_err(|err| {
                            CommandError::OperationFailed {
                                station: String::new(),
                                reason: format!("identify send failed: {}", err),
                            }
                        })
                    })
                    .map(|()| CommandOutcome::Done);

                self.core.complete(correlation_id, result);
            }
            Command::SetActuator {
                station,
                slot,
                command,
                ..
            } => {
                let subslot = self
                    .registry
                    .get(&station)
                    .and_then(|record| record.output_slot(slot))
                    .map(|entry| entry.subslot)
                    .unwrap_or(1);

                self.forward(
                    &station,
                    WorkerCommand::SetActuator {
                        slot,
                        subslot,
                        command,
                        correlation: correlation_id,
                    },
                    correlation_id,
                );
            }
            Command::PushUserSyncOne { station, users } => {
                self.push_payload(
                    &station,
                    record::index::USER_SYNC,
                    record::build_user_sync(&users).map_err(CommandError::from),
                    correlation_id,
                );
            }
            Command::PushUserSyncAll { users } => {
                // One write per connected RTU; each completion carries the
                // shared correlation id.
                let payload = match record::build_user_sync(&users) {
                    Ok(payload) => payload,
                    Err(err) => {
                        self.core.complete(correlation_id, Err(err.into()));
                        return;
                    }
                };

                let stations: Vec<String> = self
                    .registry
                    .records()
                    .filter(|record| record.ar_state == ArState::Data)
                    .map(|record| record.station().to_string())
                    .collect();

                if stations.is_empty() {
                    self.core.complete(correlation_id, Ok(CommandOutcome::Done));
                    return;
                }

                for station in stations {
                    self.forward(
                        &station,
                        WorkerCommand::WriteRecord {
                            index: record::index::USER_SYNC,
                            data: payload.clone(),
                            correlation: correlation_id,
                        },
                        correlation_id,
                    );
                }
            }
            Command::PushDeviceConfig { station, config } => {
                self.push_payload(
                    &station,
                    record::index::DEVICE_CONFIG,
                    record::build_device_config(&config).map_err(CommandError::from),
                    correlation_id,
                );
            }
            Command::PushSensorConfig { station, entries } => {
                self.push_payload(
                    &station,
                    record::index::SENSOR_CONFIG,
                    record::build_sensor_config(&entries).map_err(CommandError::from),
                    correlation_id,
                );
            }
            Command::PushActuatorConfig { station, entries } => {
                self.push_payload(
                    &station,
                    record::index::ACTUATOR_CONFIG,
                    record::build_actuator_config(&entries).map_err(CommandError::from),
                    correlation_id,
                );
            }
            Command::BindEnrollment { station } => {
                let payload = self.registry.get(&station).map(|record| {
                    record::build_enrollment(&Enrollment {
                        op: EnrollmentOp::Bind,
                        token: record.enrollment_token,
                        controller_id: record.controller_id,
                    })
                });

                match payload {
                    Some(payload) => self.forward(
                        &station,
                        WorkerCommand::WriteRecord {
                            index: record::index::ENROLLMENT,
                            data: payload,
                            correlation: correlation_id,
                        },
                        correlation_id,
                    ),
                    None => self.core.complete(
                        correlation_id,
                        Err(CommandError::UnknownStation { station }),
                    ),
                }
            }
            Command::ReadRecord { station, index } => self.forward(
                &station,
                WorkerCommand::ReadRecord {
                    index,
                    correlation: correlation_id,
                },
                correlation_id,
            ),
            Command::WriteRecord {
                station,
                index,
                data,
            } => self.forward(
                &station,
                WorkerCommand::WriteRecord {
                    index,
                    data,
                    correlation: correlation_id,
                },
                correlation_id,
            ),
        }
    }

    fn push_payload(
        &mut self,
        station: &str,
        index: u16,
        payload: Result<Vec<u8>, CommandError>,
        correlation: CorrelationId,
    ) {
        match payload {
            Ok(data) => self.forward(
                station,
                WorkerCommand::WriteRecord {
                    index,
                    data,
                    correlation,
                },
                correlation,
            ),
            Err(err) => self.core.complete(correlation, Err(err)),
        }
    }

    fn forward(&mut self, station: &str, command: WorkerCommand, correlation: CorrelationId) {
        match self.workers.get(station) {
            Some(handle) => {
                if handle.commands.send(command).is_err() {
                    self.core.complete(
                        correlation,
                        Err(CommandError::OperationFailed {
                            station: station.to_string(),
                            reason: "AR worker is gone".to_string(),
                        }),
                    );
                }
            }
            None => self.core.complete(
                correlation,
                Err(CommandError::UnknownStation {
                    station: station.to_string(),
                }),
            ),
        }
    }

    fn resolve_addr(&self, station: &str) -> Option<SocketAddr> {
        let configured = self.registry.get(station).and_then(|record| record.ip);

        let discovered = self
            .discovery
            .cache()
            .find_by_name(station)
            .and_then(|info| info.ip);

        configured
            .or(discovered)
            .map(|ip| SocketAddr::new(IpAddr::V4(ip), PNIO_UDP_PORT))
    }

    fn drain_feedback(&mut self) {
        while let Ok(feedback) = self.feedback_rx.try_recv() {
            match feedback {
                Feedback::StateChange {
                    station,
                    state,
                    reason,
                    proven,
                    cyclic,
                } => {
                    self.registry
                        .update_state(&station, state, reason.clone(), timestamp_secs());

                    if state == ArState::Data {
                        self.registry.touch_contact(&station, timestamp_secs());
                    }

                    if let Some((index, attempts)) = proven {
                        self.store.record(&station, index, attempts);
                    }

                    match cyclic {
                        Some(summary) => {
                            self.cyclic_summaries.insert(station.clone(), summary);
                        }
                        None if state != ArState::Data => {
                            self.cyclic_summaries.remove(&station);
                        }
                        None => (),
                    }

                    self.core.publish(Event::RtuStateChange {
                        station,
                        state,
                        reason,
                    });
                }
                Feedback::Event(event) => {
                    if let Event::SensorUpdate(reading) = &event {
                        self.registry
                            .touch_contact(&reading.station, timestamp_secs());
                    }
                    self.core.publish(event);
                }
                Feedback::Completed {
                    correlation,
                    result,
                } => self.core.complete(correlation, result),
            }
        }
    }

    fn drain_dcp(&mut self) {
        while let Ok(frame) = self.dcp_rx.try_recv() {
            if let Err(err) = self.discovery.process_frame(&frame, timestamp_secs()) {
                logging::debug!(self.log, "DCP frame discarded";
                                "context" => "drain_dcp",
                                "error" => %err);
            }
        }

        let changes: Vec<DiscoveryEvent> = self.discovery.changes().collect();

        for change in changes {
            if let DiscoveryEvent::Appeared(mac) | DiscoveryEvent::Updated(mac) = change {
                let (station, ip) = match self.discovery.cache().get(&mac) {
                    Some(info) => (info.station_name.clone(), info.ip),
                    None => continue,
                };

                if let Some(station) = station {
                    if let Some(record) = self.registry.get_mut(&station) {
                        if record.ip.is_none() {
                            record.ip = ip;
                        }
                        self.registry.touch_contact(&station, timestamp_secs());
                    }
                }
            }
        }
    }

    fn drain_alarms(&mut self) {
        while let Ok(alarm) = self.alarm_rx.try_recv() {
            self.alarm_count = self.alarm_count.saturating_add(1);

            let station = self
                .discovery
                .cache()
                .get(&alarm.src)
                .and_then(|info| info.station_name.clone())
                .filter(|name| self.registry.contains(name));

            logging::warn!(self.log, "alarm frame received";
                           "context" => "drain_alarms",
                           "frame_id" => alarm.frame_id,
                           "src" => %alarm.src,
                           "station" => station.as_deref().unwrap_or("<unknown>"));

            self.core.publish(Event::Alarm {
                station,
                frame_id: alarm.frame_id,
                data: alarm.data,
            });
        }
    }

    fn refresh_status(&mut self) {
        let mut snapshot = StatusSnapshot::empty(self.identity.clone());
        snapshot.rtus = self.registry.snapshot();
        snapshot.devices = self.discovery.cache().snapshot();
        snapshot.cyclic = self.cyclic_summaries.values().cloned().collect();
        snapshot.active_alarms = self.alarm_count;

        self.core.update_status(snapshot);
    }

    fn shutdown(&mut self) {
        logging::info!(self.log, "controller shutting down"; "context" => "shutdown");

        for (station, handle) in self.workers.iter_mut() {
            handle.commands.send(WorkerCommand::Shutdown).ok();

            if let Some(join) = handle.join.take() {
                if join.join().is_err() {
                    logging::warn!(self.log, "AR worker exited uncleanly";
                                   "context" => "shutdown",
                                   "station" => station.as_str());
                }
            }
        }
    }
}

fn spawn_rx_thread(
    link: LinkSender,
    control: Receiver<DispatchControl>,
    dcp: Sender<Vec<u8>>,
    alarm: Sender<AlarmFrame>,
    log: &Logger,
) -> JoinHandle<()> {
    let log = log.new(logging::o!("component" => "link-rx"));

    thread::Builder::new()
        .name("link-rx".to_string())
        .spawn(move || {
            let mut dispatcher = FrameDispatcher::new(Some(&log));
            dispatcher.set_dcp(dcp);
            dispatcher.set_alarm(alarm);

            loop {
                match control.try_recv() {
                    Ok(DispatchControl::Register { frame_id, mailbox }) => {
                        dispatcher.register_cyclic(frame_id, mailbox);
                    }
                    Ok(DispatchControl::Unregister { frame_id }) => {
                        dispatcher.unregister_cyclic(frame_id);
                    }
                    Err(mpsc::TryRecvError::Empty) => (),
                    // Runtime dropped; stop receiving.
                    Err(mpsc::TryRecvError::Disconnected) => return,
                }

                match link.recv() {
                    Ok(Some(frame)) => dispatcher.route(&frame),
                    Ok(None) => thread::sleep(Duration::from_millis(1)),
                    Err(err) => {
                        logging::error!(log, "link receive failed";
                                        "context" => "rx",
                                        "error" => %err);
                        thread::sleep(Duration::from_millis(100));
                    }
                }
            }
        })
        .expect("link rx thread spawn failed")
}

/// Convenience wrapper for `main`: runs until the stop flag is set.
pub fn run_forever(runtime: Runtime) {
    let stop = Arc::new(AtomicBool::new(false));
    runtime.run(&stop);
}
