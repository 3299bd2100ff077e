//! Per-RTU Application Relationship lifecycle.
//!
//! The transition map is a pure function from (state, event) to (state,
//! effects); every state change in the machine funnels through it, which
//! keeps the full fan-in of the lifecycle auditable in one place. The
//! `ArMachine` wraps the map with session bookkeeping: UUIDs, strategy
//! fallback, retries and the RPC drive methods.

pub mod layout;

use crate::ar::layout::{build_layouts, ExpectedCatalogue, IocrPair};
use crate::codec::Mac;
use crate::error::{ErrorClass, RpcError};
use crate::rpc::connect::{
    self, ApplicationReadyInd, ConnectParams, ConnectResponse, ControlIds,
};
use crate::rpc::strategy::{cycle_period, SessionProgress, SlotScope, Strategy, TimingParams};
use crate::rpc::transport::RpcChannel;
use crate::rpc::{block_type, object_uuid};
use crate::uuid::Uuid;
use penstock::logging::{self, Logger};
use serde_derive::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Bounded retries for PrmEnd and Release within the active strategy.
const CONTROL_RETRIES: u32 = 3;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArState {
    Idle,
    Discovering,
    Connecting,
    Parameterizing,
    WaitAppReady,
    Data,
    Releasing,
    Error,
}

impl fmt::Display for ArState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ArState::Idle => "idle",
            ArState::Discovering => "discovering",
            ArState::Connecting => "connecting",
            ArState::Parameterizing => "parameterizing",
            ArState::WaitAppReady => "wait-app-ready",
            ArState::Data => "data",
            ArState::Releasing => "releasing",
            ArState::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub enum ArEvent {
    DiscoveryRequested,
    DeviceFound,
    ConnectAccepted,
    ConnectFailed { recoverable: bool },
    StrategiesExhausted,
    PrmEndAccepted,
    PrmEndFailed,
    ApplicationReady,
    WatchdogExpired,
    DataHoldExpired,
    ReleaseRequested,
    ReleaseCompleted,
    ReleaseTimedOut,
    Reset,
}

impl ArEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ArEvent::DiscoveryRequested => "discovery-requested",
            ArEvent::DeviceFound => "device-found",
            ArEvent::ConnectAccepted => "connect-accepted",
            ArEvent::ConnectFailed { .. } => "connect-failed",
            ArEvent::StrategiesExhausted => "strategies-exhausted",
            ArEvent::PrmEndAccepted => "prm-end-accepted",
            ArEvent::PrmEndFailed => "prm-end-failed",
            ArEvent::ApplicationReady => "application-ready",
            ArEvent::WatchdogExpired => "watchdog-expired",
            ArEvent::DataHoldExpired => "data-hold-expired",
            ArEvent::ReleaseRequested => "release-requested",
            ArEvent::ReleaseCompleted => "release-completed",
            ArEvent::ReleaseTimedOut => "release-timed-out",
            ArEvent::Reset => "reset",
        }
    }
}

/// Side effects the runtime executes after a transition.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Effect {
    SendConnect,
    SendPrmEnd,
    SendApplicationReadyResponse,
    SendRelease,
    StartCyclic,
    StopCyclic,
    PersistStrategyIndex,
    EmitStateChange,
    RaiseAlarm,
}

/// Raised when an event arrives in a state that does not accept it. The
/// event is discarded, a counter is incremented, and no transition occurs.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct InvalidTransition {
    pub state: ArState,
    pub event: &'static str,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Event {} not accepted in state {}", self.event, self.state)
    }
}

impl std::error::Error for InvalidTransition {}

/// The complete transition map. Anything not listed here is a protocol
/// violation.
pub fn transition(
    state: ArState,
    event: &ArEvent,
) -> Result<(ArState, Vec<Effect>), InvalidTransition> {
    use ArEvent::*;
    use ArState::*;

    let outcome = match (state, event) {
        (Idle, DiscoveryRequested) => (Discovering, vec![]),
        (Idle, DeviceFound) => (Connecting, vec![Effect::SendConnect, Effect::EmitStateChange]),
        (Discovering, DeviceFound) => {
            (Connecting, vec![Effect::SendConnect, Effect::EmitStateChange])
        }

        (Connecting, ConnectAccepted) => (
            Parameterizing,
            vec![
                Effect::PersistStrategyIndex,
                Effect::SendPrmEnd,
                Effect::EmitStateChange,
            ],
        ),
        (Connecting, ConnectFailed { recoverable: true }) => {
            (Connecting, vec![Effect::SendConnect])
        }
        (Connecting, ConnectFailed { recoverable: false }) | (Connecting, StrategiesExhausted) => {
            (Error, vec![Effect::EmitStateChange, Effect::RaiseAlarm])
        }

        (Parameterizing, PrmEndAccepted) => (WaitAppReady, vec![Effect::EmitStateChange]),
        (Parameterizing, PrmEndFailed) => {
            (Error, vec![Effect::EmitStateChange, Effect::RaiseAlarm])
        }

        (WaitAppReady, ApplicationReady) => (
            Data,
            vec![
                Effect::SendApplicationReadyResponse,
                Effect::StartCyclic,
                Effect::EmitStateChange,
            ],
        ),

        (Data, ReleaseRequested) | (Data, DataHoldExpired) => (
            Releasing,
            vec![Effect::StopCyclic, Effect::SendRelease, Effect::EmitStateChange],
        ),
        (Data, WatchdogExpired) => (
            Error,
            vec![Effect::StopCyclic, Effect::EmitStateChange, Effect::RaiseAlarm],
        ),

        (Releasing, ReleaseCompleted) | (Releasing, ReleaseTimedOut) => {
            (Idle, vec![Effect::EmitStateChange])
        }

        (Error, Reset) => (Idle, vec![Effect::EmitStateChange]),

        _ => {
            return Err(InvalidTransition {
                state,
                event: event.name(),
            })
        }
    };

    Ok(outcome)
}

/// Static identity and catalogue of the AR's peer.
#[derive(Debug, Clone)]
pub struct ArConfig {
    pub station: String,
    pub vendor_id: u16,
    pub device_id: u16,
    pub instance: u16,
    pub host_mac: Mac,
    pub controller_station: String,
    pub catalogue: ExpectedCatalogue,
    pub input_frame_id: u16,
    pub output_frame_id: u16,
}

/// Negotiated per-session state. The activity UUID is generated once at
/// Connect time and reused for every RPC operation of the session; request
/// builders receive it as input and never generate their own.
#[derive(Debug, Clone)]
pub struct ArSession {
    pub ar_uuid: Uuid,
    pub activity: Uuid,
    pub session_key: u16,
    pub strategy: Strategy,
    pub timing: TimingParams,
    pub catalogue: ExpectedCatalogue,
    pub layouts: IocrPair,
    /// The responder MAC from the Connect response; destination of every
    /// cyclic output frame.
    pub peer_mac: Mac,
}

impl ArSession {
    /// Cyclic period shared by both IOCRs of this session.
    #[inline]
    pub fn period(&self) -> Duration {
        cycle_period(self.timing.send_clock_factor, self.timing.reduction_ratio)
    }

    /// Silence on an established input flow longer than this releases the
    /// AR for a clean reconnect.
    #[inline]
    pub fn data_hold_timeout(&self) -> Duration {
        self.period() * u32::from(self.timing.data_hold_factor)
    }

    /// Window for the first input frame after ApplicationReady. An
    /// exchange that never produces data inside it is unrecoverable; the
    /// data-hold window covers loss of a flow that did come up.
    #[inline]
    pub fn watchdog_timeout(&self) -> Duration {
        self.data_hold_timeout() * 2
    }
}

/// One state machine instance per bound RTU.
pub struct ArMachine {
    config: ArConfig,
    object: Uuid,
    layouts_full: IocrPair,
    layouts_dap: IocrPair,
    state: ArState,
    error_reason: Option<String>,
    last_transition: Instant,
    progress: SessionProgress,
    session: Option<ArSession>,
    session_counter: u16,
    sequence: u32,
    protocol_violations: u64,
    log: Logger,
}

impl ArMachine {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        config: ArConfig,
        progress: SessionProgress,
        now: Instant,
        log: L,
    ) -> Result<ArMachine, crate::error::ConfigError> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("station" => config.station.clone())),
            None => logging::discard(),
        };

        let layouts_full = build_layouts(
            &config.catalogue,
            config.input_frame_id,
            config.output_frame_id,
        )?;
        let layouts_dap = build_layouts(
            &config.catalogue.dap_only(),
            config.input_frame_id,
            config.output_frame_id,
        )?;

        let object = object_uuid(config.instance, config.device_id, config.vendor_id);

        Ok(ArMachine {
            config,
            object,
            layouts_full,
            layouts_dap,
            state: ArState::Idle,
            error_reason: None,
            last_transition: now,
            progress,
            session: None,
            session_counter: 0,
            sequence: 0,
            protocol_violations: 0,
            log,
        })
    }

    #[inline]
    pub fn state(&self) -> ArState {
        self.state
    }

    #[inline]
    pub fn station(&self) -> &str {
        &self.config.station
    }

    #[inline]
    pub fn error_reason(&self) -> Option<&str> {
        self.error_reason.as_deref()
    }

    #[inline]
    pub fn last_transition(&self) -> Instant {
        self.last_transition
    }

    #[inline]
    pub fn session(&self) -> Option<&ArSession> {
        self.session.as_ref()
    }

    #[inline]
    pub fn progress(&self) -> &SessionProgress {
        &self.progress
    }

    #[inline]
    pub fn protocol_violations(&self) -> u64 {
        self.protocol_violations
    }

    /// Applies an externally sourced event. Invalid combinations are
    /// rejected, counted and leave the state untouched.
    pub fn apply(&mut self, event: &ArEvent, now: Instant) -> Result<Vec<Effect>, InvalidTransition> {
        match transition(self.state, event) {
            Ok((next, effects)) => {
                if next != self.state {
                    logging::info!(self.log, "state transition";
                                   "context" => "apply",
                                   "event" => event.name(),
                                   "from" => %self.state,
                                   "to" => %next);
                }

                self.state = next;
                self.last_transition = now;

                if next != ArState::Error {
                    match event {
                        ArEvent::Reset => self.error_reason = None,
                        _ => (),
                    }
                }

                Ok(effects)
            }
            Err(invalid) => {
                self.protocol_violations += 1;
                logging::warn!(self.log, "event rejected";
                               "context" => "apply",
                               "event" => invalid.event,
                               "state" => %self.state,
                               "violations" => self.protocol_violations);
                Err(invalid)
            }
        }
    }

    /// Applies a terminal event, recording the operator-facing reason
    /// surfaced on status queries.
    pub fn fail(
        &mut self,
        event: &ArEvent,
        reason: String,
        now: Instant,
    ) -> Result<Vec<Effect>, InvalidTransition> {
        let effects = self.apply(event, now)?;

        if self.state == ArState::Error {
            logging::error!(self.log, "AR failed";
                            "context" => "fail",
                            "event" => event.name(),
                            "reason" => &reason);
            self.error_reason = Some(reason);
        }

        Ok(effects)
    }

    fn apply_internal(&mut self, event: ArEvent, now: Instant) -> Vec<Effect> {
        self.apply(&event, now).unwrap_or_default()
    }

    fn enter_error(&mut self, reason: String, event: ArEvent, now: Instant) -> Vec<Effect> {
        logging::error!(self.log, "AR failed";
                        "context" => "enter_error",
                        "reason" => &reason,
                        "strategy_index" => self.progress.index(),
                        "attempts" => self.progress.attempts());

        self.error_reason = Some(reason);
        self.apply_internal(event, now)
    }

    fn next_sequence(&mut self) -> u32 {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        sequence
    }

    fn control_ids(&self) -> Option<ControlIds> {
        self.session.as_ref().map(|session| ControlIds {
            object: self.object,
            activity: session.activity,
            ar_uuid: session.ar_uuid,
            session_key: session.session_key,
            sequence: 0,
        })
    }

    /// Drives Connect attempts until one succeeds, the table is exhausted,
    /// or a fatal condition surfaces. Recoverable failures advance the
    /// strategy index; the effects of the final transition are returned.
    pub fn run_connect(
        &mut self,
        chan: &mut dyn RpcChannel,
        dst: SocketAddr,
        now: Instant,
    ) -> Vec<Effect> {
        if self.state != ArState::Connecting {
            self.protocol_violations += 1;
            return Vec::new();
        }

        loop {
            match self.connect_attempt(chan, dst, now) {
                Ok(response) => {
                    self.progress.mark_success();

                    logging::info!(self.log, "connect accepted";
                                   "context" => "run_connect",
                                   "strategy_index" => self.progress.index(),
                                   "attempts" => self.progress.attempts(),
                                   "responder_port" => response.responder_port);

                    return self.apply_internal(ArEvent::ConnectAccepted, now);
                }
                Err(err) => match err.class() {
                    // Malformed responses count as protocol violations but
                    // still advance to the next strategy: the variant in
                    // use may simply not match this stack.
                    ErrorClass::Recoverable | ErrorClass::ProtocolViolation => {
                        logging::info!(self.log, "connect attempt failed";
                                       "context" => "run_connect",
                                       "strategy_index" => self.progress.index(),
                                       "error" => %err,
                                       "code" => err.code());

                        self.progress.advance();

                        if self.progress.exhausted() {
                            return self.enter_error(
                                format!(
                                    "Strategy table exhausted after {} attempts; last error: {}. \
                                     Check cabling and RTU power, then reset the AR.",
                                    self.progress.attempts(),
                                    err
                                ),
                                ArEvent::StrategiesExhausted,
                                now,
                            );
                        }
                    }
                    _ => {
                        return self.enter_error(
                            format!(
                                "Connect failed without retry (strategy {}): {}. \
                                 Resolve the reported condition, then reset the AR.",
                                self.progress.index(),
                                err
                            ),
                            ArEvent::ConnectFailed { recoverable: false },
                            now,
                        );
                    }
                },
            }
        }
    }

    fn connect_attempt(
        &mut self,
        chan: &mut dyn RpcChannel,
        dst: SocketAddr,
        now: Instant,
    ) -> Result<ConnectResponse, RpcError> {
        self.progress.attempt(now);

        let strategy = self.progress.current();
        let timing = strategy.timing_params();

        let (catalogue, layouts) = match strategy.slot_scope {
            SlotScope::Full => (self.config.catalogue.clone(), self.layouts_full.clone()),
            SlotScope::DapOnly => (self.config.catalogue.dap_only(), self.layouts_dap.clone()),
        };

        self.session_counter = self.session_counter.wrapping_add(1).max(1);
        self.sequence = 0;

        let mut session = ArSession {
            ar_uuid: Uuid::generate(),
            activity: Uuid::generate(),
            session_key: self.session_counter,
            strategy,
            timing,
            catalogue,
            layouts,
            peer_mac: Mac::default(),
        };

        let sequence = self.next_sequence();

        let params = ConnectParams {
            strategy,
            timing,
            ar_uuid: session.ar_uuid,
            activity: session.activity,
            session_key: session.session_key,
            host_mac: self.config.host_mac,
            object: self.object,
            station_name: &self.config.controller_station,
            catalogue: &session.catalogue,
            layouts: &session.layouts,
            sequence,
        };

        let request = connect::build_connect_request(&params)?;
        let reply = chan.transact(dst, &request, timing.rpc_timeout)?;
        let response = connect::parse_connect_response(&reply)?;

        if response.ar_uuid != session.ar_uuid {
            return Err(RpcError::MalformedResponse("AR UUID mismatch"));
        }

        if let Some(diff) = &response.module_diff {
            if !diff.dap_only() {
                return Err(RpcError::ModuleDiffNeedsAction(diff.clone()));
            }

            logging::info!(self.log, "DAP-only module diff accepted";
                           "context" => "connect_attempt",
                           "entries" => diff.entries.len());
        }

        session.peer_mac = response.responder_mac;
        self.session = Some(session);
        Ok(response)
    }

    /// Sends PrmEnd with bounded retries within the current strategy.
    pub fn run_prm_end(
        &mut self,
        chan: &mut dyn RpcChannel,
        dst: SocketAddr,
        now: Instant,
    ) -> Vec<Effect> {
        if self.state != ArState::Parameterizing {
            self.protocol_violations += 1;
            return Vec::new();
        }

        let (strategy, timeout) = match self.session.as_ref() {
            Some(session) => (session.strategy, session.timing.rpc_timeout),
            None => return self.enter_error(
                "PrmEnd without an active session".to_string(),
                ArEvent::PrmEndFailed,
                now,
            ),
        };

        let mut last_error = None;

        for attempt in 0..CONTROL_RETRIES {
            let mut ids = match self.control_ids() {
                Some(ids) => ids,
                None => break,
            };
            ids.sequence = self.next_sequence();

            let result = connect::build_prm_end_request(strategy, &ids)
                .map_err(RpcError::from)
                .and_then(|request| chan.transact(dst, &request, timeout))
                .and_then(|reply| {
                    connect::parse_control_response(&reply, block_type::IOD_CONTROL_RES)
                });

            match result {
                Ok(_) => {
                    logging::info!(self.log, "parameterization acknowledged";
                                   "context" => "run_prm_end",
                                   "attempt" => attempt + 1);
                    return self.apply_internal(ArEvent::PrmEndAccepted, now);
                }
                Err(err) => {
                    logging::info!(self.log, "PrmEnd attempt failed";
                                   "context" => "run_prm_end",
                                   "attempt" => attempt + 1,
                                   "error" => %err);
                    last_error = Some(err);
                }
            }
        }

        let reason = match last_error {
            Some(err) => format!(
                "PrmEnd failed after {} attempts: {}. Reset the AR to reconnect.",
                CONTROL_RETRIES, err
            ),
            None => "PrmEnd failed: no active session".to_string(),
        };

        self.enter_error(reason, ArEvent::PrmEndFailed, now)
    }

    /// Validates an ApplicationReady indication against the session and, on
    /// success, transitions to Data and returns the prebuilt response
    /// datagram alongside the effects.
    pub fn handle_application_ready(
        &mut self,
        ind: &ApplicationReadyInd,
        now: Instant,
    ) -> Result<(Vec<u8>, Vec<Effect>), RpcError> {
        let session_uuid = match self.session.as_ref() {
            Some(session) => session.ar_uuid,
            None => return Err(RpcError::MalformedResponse("no active session")),
        };

        if ind.ar_uuid != session_uuid {
            self.protocol_violations += 1;
            return Err(RpcError::MalformedResponse("AR UUID mismatch"));
        }

        let response = connect::build_application_ready_response(ind)?;
        let effects = self.apply(&ArEvent::ApplicationReady, now).map_err(|_| {
            RpcError::MalformedResponse("ApplicationReady outside WaitAppReady")
        })?;

        Ok((response, effects))
    }

    /// Sends Release with bounded retries. The AR always reaches Idle;
    /// an unanswered Release is logged and treated as expired.
    pub fn run_release(
        &mut self,
        chan: &mut dyn RpcChannel,
        dst: SocketAddr,
        now: Instant,
    ) -> Vec<Effect> {
        if self.state != ArState::Releasing {
            self.protocol_violations += 1;
            return Vec::new();
        }

        let (strategy, timeout) = match self.session.as_ref() {
            Some(session) => (session.strategy, session.timing.rpc_timeout),
            None => {
                return self.apply_internal(ArEvent::ReleaseTimedOut, now);
            }
        };

        for attempt in 0..CONTROL_RETRIES {
            let mut ids = match self.control_ids() {
                Some(ids) => ids,
                None => break,
            };
            ids.sequence = self.next_sequence();

            let result = connect::build_release_request(strategy, &ids)
                .map_err(RpcError::from)
                .and_then(|request| chan.transact(dst, &request, timeout))
                .and_then(|reply| connect::parse_control_response(&reply, block_type::RELEASE_RES));

            match result {
                Ok(_) => {
                    logging::info!(self.log, "release acknowledged";
                                   "context" => "run_release",
                                   "attempt" => attempt + 1);
                    self.session = None;
                    return self.apply_internal(ArEvent::ReleaseCompleted, now);
                }
                Err(err) => {
                    logging::info!(self.log, "release attempt failed";
                                   "context" => "run_release",
                                   "attempt" => attempt + 1,
                                   "error" => %err);
                }
            }
        }

        logging::warn!(self.log, "release unanswered, abandoning session";
                       "context" => "run_release");

        self.session = None;
        self.apply_internal(ArEvent::ReleaseTimedOut, now)
    }

    /// Acyclic record read over the established AR, reusing the session's
    /// activity UUID.
    pub fn read_record(
        &mut self,
        chan: &mut dyn RpcChannel,
        dst: SocketAddr,
        index: u16,
        max_length: u32,
    ) -> Result<Vec<u8>, RpcError> {
        let (strategy, timeout, api) = match self.session.as_ref() {
            Some(session) => (
                session.strategy,
                session.timing.rpc_timeout,
                session.catalogue.api,
            ),
            None => return Err(RpcError::MalformedResponse("no active session")),
        };

        let mut ids = self
            .control_ids()
            .ok_or(RpcError::MalformedResponse("no active session"))?;
        ids.sequence = self.next_sequence();

        let request = connect::build_read_request(strategy, &ids, api, 0, 1, index, max_length)?;
        let reply = chan.transact(dst, &request, timeout)?;

        connect::parse_read_response(&reply)
    }

    /// Acyclic record write over the established AR.
    pub fn write_record(
        &mut self,
        chan: &mut dyn RpcChannel,
        dst: SocketAddr,
        index: u16,
        data: &[u8],
    ) -> Result<(), RpcError> {
        let (strategy, timeout, api) = match self.session.as_ref() {
            Some(session) => (
                session.strategy,
                session.timing.rpc_timeout,
                session.catalogue.api,
            ),
            None => return Err(RpcError::MalformedResponse("no active session")),
        };

        let mut ids = self
            .control_ids()
            .ok_or(RpcError::MalformedResponse("no active session"))?;
        ids.sequence = self.next_sequence();

        let request = connect::build_write_request(strategy, &ids, api, 0, 1, index, data)?;
        let reply = chan.transact(dst, &request, timeout)?;

        connect::parse_write_response(&reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ar::layout::{SlotDirection, SlotEntry};
    use crate::rpc::ndr::NdrResponseHeader;
    use crate::rpc::strategy::STRATEGY_COUNT;
    use crate::rpc::{BlockWriter, RpcHeader, PTYPE_RESPONSE, RPC_HEADER_LEN};
    use crate::uuid::UuidFormat;

    fn entries() -> Vec<SlotEntry> {
        vec![
            SlotEntry {
                slot: 0,
                subslot: 1,
                module_ident: 0x0001_0000,
                submodule_ident: 0x0001_0001,
                direction: SlotDirection::None,
                data_bytes: 0,
            },
            SlotEntry {
                slot: 1,
                subslot: 1,
                module_ident: 0x0002_0000,
                submodule_ident: 0x0002_0001,
                direction: SlotDirection::Input,
                data_bytes: 5,
            },
        ]
    }

    fn machine() -> ArMachine {
        let config = ArConfig {
            station: "rtu-ec3b".to_string(),
            vendor_id: 0x0272,
            device_id: 0x0C05,
            instance: 1,
            host_mac: Mac([2, 0, 0, 0, 0, 1]),
            controller_station: "headworks-ctl".to_string(),
            catalogue: ExpectedCatalogue::from_entries(0, &entries()).unwrap(),
            input_frame_id: 0xC001,
            output_frame_id: 0xC000,
        };

        ArMachine::new(
            config,
            SessionProgress::new(None, None, Instant::now()),
            Instant::now(),
            None,
        )
        .unwrap()
    }

    fn dst() -> SocketAddr {
        "192.168.6.21:34964".parse().unwrap()
    }

    /// Scripted channel: answers each transact from a queue of closures
    /// over the request bytes.
    struct ScriptedChannel {
        script: Vec<Box<dyn FnMut(&[u8]) -> Result<Vec<u8>, RpcError>>>,
        calls: usize,
        activities: Vec<Uuid>,
    }

    impl ScriptedChannel {
        fn new() -> ScriptedChannel {
            ScriptedChannel {
                script: Vec::new(),
                calls: 0,
                activities: Vec::new(),
            }
        }

        fn push<F: FnMut(&[u8]) -> Result<Vec<u8>, RpcError> + 'static>(&mut self, step: F) {
            self.script.push(Box::new(step));
        }
    }

    impl RpcChannel for ScriptedChannel {
        fn transact(
            &mut self,
            _dst: SocketAddr,
            request: &[u8],
            _deadline: Duration,
        ) -> Result<Vec<u8>, RpcError> {
            let (header, _) = RpcHeader::read_from(request, 0).unwrap();
            self.activities.push(header.activity);

            let index = self.calls.min(self.script.len() - 1);
            self.calls += 1;
            (self.script[index])(request)
        }
    }

    fn ok_envelope(blocks: Vec<u8>, request: &[u8]) -> Vec<u8> {
        let (request_header, _) = RpcHeader::read_from(request, 0).unwrap();

        let body_len = 20 + blocks.len();
        let mut header = request_header.clone();
        header.ptype = PTYPE_RESPONSE;
        header.body_len = body_len as u16;

        let mut packet = vec![0u8; RPC_HEADER_LEN + body_len];
        let mut offset = packet_header_write(&header, &mut packet);
        offset += NdrResponseHeader::ok(blocks.len() as u32)
            .write_to(&mut packet, offset)
            .unwrap();
        crate::codec::put_bytes(&mut packet, offset, &blocks).unwrap();
        packet
    }

    fn packet_header_write(header: &RpcHeader, packet: &mut [u8]) -> usize {
        header.write_to(packet, 0, UuidFormat::SwapFields).unwrap()
    }

    /// Builds a well-formed Connect response echoing the request.
    fn connect_ok(request: &[u8]) -> Result<Vec<u8>, RpcError> {
        let parsed = connect::parse_connect_request(request).unwrap();

        let mut writer = BlockWriter::new();

        let start = writer.begin(block_type::AR_RES);
        writer.push_u16(0x0001);
        writer.push_uuid(&parsed.ar_uuid, UuidFormat::AsStored);
        writer.push_u16(parsed.session_key);
        writer.push_bytes(&[0, 0x11, 0x22, 0x33, 0x44, 0x55]);
        writer.push_u16(0x8892);
        writer.end(start);

        for &(iocr_type, frame_id) in &[(1u16, 0xC001u16), (2u16, 0xC000u16)] {
            let start = writer.begin(block_type::IOCR_RES);
            writer.push_u16(iocr_type);
            writer.push_u16(iocr_type);
            writer.push_u16(frame_id);
            writer.end(start);
        }

        Ok(ok_envelope(writer.into_bytes(), request))
    }

    fn control_ok(request: &[u8], res_type: u16) -> Result<Vec<u8>, RpcError> {
        let (_, offset) = RpcHeader::read_from(request, 0).unwrap();

        // The control request may or may not carry an NDR header; find the
        // ARUUID by scanning for the block.
        let body = if crate::codec::get_u16(request, offset).unwrap() >= 0x0100 {
            &request[offset..]
        } else {
            &request[offset + 20..]
        };

        let mut cursor = crate::rpc::BlockCursor::new(body);
        let block = cursor.next_block().unwrap().unwrap();
        let ar_uuid = Uuid::read_from(&block.payload[2..], 2, UuidFormat::AsStored).unwrap();
        let session_key = crate::codec::get_u16(&block.payload[2..], 18).unwrap();

        let mut writer = BlockWriter::new();
        let start = writer.begin(res_type);
        writer.push_u16(0);
        writer.push_uuid(&ar_uuid, UuidFormat::AsStored);
        writer.push_u16(session_key);
        writer.push_u16(0);
        writer.push_u16(crate::rpc::control::DONE);
        writer.push_u16(0);
        writer.end(start);

        Ok(ok_envelope(writer.into_bytes(), request))
    }

    #[test]
    fn test_transition_map_listed_only() {
        use ArEvent::*;
        use ArState::*;

        // Every listed transition succeeds.
        assert!(transition(Idle, &DiscoveryRequested).is_ok());
        assert!(transition(Idle, &DeviceFound).is_ok());
        assert!(transition(Discovering, &DeviceFound).is_ok());
        assert!(transition(Connecting, &ConnectAccepted).is_ok());
        assert!(transition(Connecting, &ConnectFailed { recoverable: true }).is_ok());
        assert!(transition(Connecting, &StrategiesExhausted).is_ok());
        assert!(transition(Parameterizing, &PrmEndAccepted).is_ok());
        assert!(transition(Parameterizing, &PrmEndFailed).is_ok());
        assert!(transition(WaitAppReady, &ApplicationReady).is_ok());
        assert!(transition(Data, &ReleaseRequested).is_ok());
        assert!(transition(Data, &DataHoldExpired).is_ok());
        assert!(transition(Data, &WatchdogExpired).is_ok());
        assert!(transition(Releasing, &ReleaseCompleted).is_ok());
        assert!(transition(Releasing, &ReleaseTimedOut).is_ok());
        assert!(transition(Error, &Reset).is_ok());

        // A sample of everything else is rejected.
        assert!(transition(Idle, &ApplicationReady).is_err());
        assert!(transition(Data, &ConnectAccepted).is_err());
        assert!(transition(Error, &DeviceFound).is_err());
        assert!(transition(WaitAppReady, &PrmEndAccepted).is_err());
        assert!(transition(Releasing, &ReleaseRequested).is_err());
    }

    #[test]
    fn test_app_ready_transition_effects() {
        let (next, effects) =
            transition(ArState::WaitAppReady, &ArEvent::ApplicationReady).unwrap();

        assert_eq!(next, ArState::Data);
        assert_eq!(
            effects,
            vec![
                Effect::SendApplicationReadyResponse,
                Effect::StartCyclic,
                Effect::EmitStateChange
            ]
        );
    }

    #[test]
    fn test_invalid_event_counts_violation() {
        let mut machine = machine();
        let now = Instant::now();

        assert!(machine.apply(&ArEvent::ApplicationReady, now).is_err());
        assert_eq!(machine.state(), ArState::Idle);
        assert_eq!(machine.protocol_violations(), 1);
    }

    #[test]
    fn test_connect_success_first_strategy() {
        let mut machine = machine();
        let now = Instant::now();

        machine.apply(&ArEvent::DeviceFound, now).unwrap();
        assert_eq!(machine.state(), ArState::Connecting);

        let mut chan = ScriptedChannel::new();
        chan.push(connect_ok);

        let effects = machine.run_connect(&mut chan, dst(), now);

        assert_eq!(machine.state(), ArState::Parameterizing);
        assert!(effects.contains(&Effect::SendPrmEnd));
        assert!(effects.contains(&Effect::PersistStrategyIndex));
        assert_eq!(machine.progress().last_successful(), Some(0));
        assert!(machine.session().is_some());
    }

    #[test]
    fn test_connect_fallback_visits_strategies_in_order() {
        let mut machine = machine();
        let now = Instant::now();

        machine.apply(&ArEvent::DeviceFound, now).unwrap();

        let mut chan = ScriptedChannel::new();
        for _ in 0..7 {
            chan.push(|_request: &[u8]| Err(RpcError::TransportTimeout));
        }
        chan.push(connect_ok);

        let effects = machine.run_connect(&mut chan, dst(), now);

        assert_eq!(machine.state(), ArState::Parameterizing);
        assert!(!effects.is_empty());
        assert_eq!(machine.progress().index(), 7);
        assert_eq!(machine.progress().last_successful(), Some(7));
        assert_eq!(machine.progress().attempts(), 8);
    }

    #[test]
    fn test_connect_exhaustion_enters_error() {
        let mut machine = machine();
        let now = Instant::now();

        machine.apply(&ArEvent::DeviceFound, now).unwrap();

        let mut chan = ScriptedChannel::new();
        chan.push(|_request: &[u8]| Err(RpcError::TransportTimeout));

        let effects = machine.run_connect(&mut chan, dst(), now);

        assert_eq!(machine.state(), ArState::Error);
        assert!(effects.contains(&Effect::RaiseAlarm));
        assert!(machine.error_reason().unwrap().contains("exhausted"));
        assert_eq!(
            machine.progress().attempts() as usize,
            STRATEGY_COUNT * crate::rpc::strategy::MAX_CYCLES as usize
        );
    }

    #[test]
    fn test_session_exhausted_is_fatal() {
        let mut machine = machine();
        let now = Instant::now();

        machine.apply(&ArEvent::DeviceFound, now).unwrap();

        let mut chan = ScriptedChannel::new();
        chan.push(|_request: &[u8]| Err(RpcError::SessionExhausted));

        machine.run_connect(&mut chan, dst(), now);

        assert_eq!(machine.state(), ArState::Error);
        assert_eq!(machine.progress().attempts(), 1);
    }

    #[test]
    fn test_activity_uuid_constant_within_session() {
        let mut machine = machine();
        let now = Instant::now();

        machine.apply(&ArEvent::DeviceFound, now).unwrap();

        let mut chan = ScriptedChannel::new();
        chan.push(connect_ok);
        chan.push(|request: &[u8]| control_ok(request, block_type::IOD_CONTROL_RES));

        machine.run_connect(&mut chan, dst(), now);
        machine.run_prm_end(&mut chan, dst(), now);

        assert_eq!(machine.state(), ArState::WaitAppReady);
        assert_eq!(chan.activities.len(), 2);
        // The PrmEnd request reuses the activity UUID generated at Connect.
        assert_eq!(chan.activities[0], chan.activities[1]);
        assert_eq!(
            machine.session().unwrap().activity,
            chan.activities[0]
        );
    }

    #[test]
    fn test_new_sessions_use_fresh_uuids() {
        let mut machine = machine();
        let now = Instant::now();

        machine.apply(&ArEvent::DeviceFound, now).unwrap();

        let mut chan = ScriptedChannel::new();
        chan.push(|_request: &[u8]| Err(RpcError::TransportTimeout));
        chan.push(connect_ok);

        machine.run_connect(&mut chan, dst(), now);

        // The failed attempt and the successful one used different
        // activity UUIDs: each attempt is its own session.
        assert_eq!(chan.activities.len(), 2);
        assert_ne!(chan.activities[0], chan.activities[1]);
    }

    #[test]
    fn test_prm_end_retries_then_errors() {
        let mut machine = machine();
        let now = Instant::now();

        machine.apply(&ArEvent::DeviceFound, now).unwrap();

        let mut chan = ScriptedChannel::new();
        chan.push(connect_ok);
        chan.push(|_request: &[u8]| Err(RpcError::TransportTimeout));

        machine.run_connect(&mut chan, dst(), now);
        machine.run_prm_end(&mut chan, dst(), now);

        assert_eq!(machine.state(), ArState::Error);
        // 1 connect + CONTROL_RETRIES PrmEnd attempts
        assert_eq!(chan.calls as u32, 1 + CONTROL_RETRIES);
    }

    #[test]
    fn test_module_diff_on_application_slot_is_fatal() {
        let mut machine = machine();
        let now = Instant::now();

        machine.apply(&ArEvent::DeviceFound, now).unwrap();

        let mut chan = ScriptedChannel::new();
        chan.push(|request: &[u8]| {
            let parsed = connect::parse_connect_request(request).unwrap();

            let mut writer = BlockWriter::new();
            let start = writer.begin(block_type::AR_RES);
            writer.push_u16(0x0001);
            writer.push_uuid(&parsed.ar_uuid, UuidFormat::AsStored);
            writer.push_u16(parsed.session_key);
            writer.push_bytes(&[0; 6]);
            writer.push_u16(0x8892);
            writer.end(start);

            let start = writer.begin(block_type::MODULE_DIFF);
            writer.push_u16(1);
            writer.push_u32(0);
            writer.push_u16(1);
            writer.push_u16(1); // application slot
            writer.push_u32(0x0002_0000);
            writer.push_u16(1);
            writer.push_u16(1);
            writer.push_u16(1);
            writer.push_u32(0x0002_0001);
            writer.push_u16(2);
            writer.end(start);

            Ok(ok_envelope(writer.into_bytes(), request))
        });

        machine.run_connect(&mut chan, dst(), now);

        assert_eq!(machine.state(), ArState::Error);
        assert!(machine.error_reason().unwrap().contains("submodule"));
    }

    #[test]
    fn test_full_lifecycle_to_data_and_release() {
        let mut machine = machine();
        let now = Instant::now();

        machine.apply(&ArEvent::DeviceFound, now).unwrap();

        let mut chan = ScriptedChannel::new();
        chan.push(connect_ok);
        chan.push(|request: &[u8]| control_ok(request, block_type::IOD_CONTROL_RES));

        machine.run_connect(&mut chan, dst(), now);
        machine.run_prm_end(&mut chan, dst(), now);
        assert_eq!(machine.state(), ArState::WaitAppReady);

        // ApplicationReady indication from the RTU
        let session_ar = machine.session().unwrap().ar_uuid;
        let ind = app_ready_for(session_ar, machine.session().unwrap().session_key);
        let (response, effects) = machine.handle_application_ready(&ind, now).unwrap();

        assert_eq!(machine.state(), ArState::Data);
        assert!(effects.contains(&Effect::StartCyclic));
        assert!(!response.is_empty());

        // Operator disconnect
        let effects = machine.apply(&ArEvent::ReleaseRequested, now).unwrap();
        assert_eq!(machine.state(), ArState::Releasing);
        assert!(effects.contains(&Effect::StopCyclic));

        let mut chan = ScriptedChannel::new();
        chan.push(|request: &[u8]| control_ok(request, block_type::RELEASE_RES));

        machine.run_release(&mut chan, dst(), now);
        assert_eq!(machine.state(), ArState::Idle);
        assert!(machine.session().is_none());
    }

    #[test]
    fn test_application_ready_wrong_uuid_rejected() {
        let mut machine = machine();
        let now = Instant::now();

        machine.apply(&ArEvent::DeviceFound, now).unwrap();

        let mut chan = ScriptedChannel::new();
        chan.push(connect_ok);
        chan.push(|request: &[u8]| control_ok(request, block_type::IOD_CONTROL_RES));

        machine.run_connect(&mut chan, dst(), now);
        machine.run_prm_end(&mut chan, dst(), now);

        let ind = app_ready_for(Uuid::from_bytes([0xEE; 16]), 1);
        assert!(machine.handle_application_ready(&ind, now).is_err());
        assert_eq!(machine.state(), ArState::WaitAppReady);
    }

    #[test]
    fn test_release_timeout_still_reaches_idle() {
        let mut machine = machine();
        let now = Instant::now();

        machine.apply(&ArEvent::DeviceFound, now).unwrap();

        let mut chan = ScriptedChannel::new();
        chan.push(connect_ok);
        chan.push(|request: &[u8]| control_ok(request, block_type::IOD_CONTROL_RES));

        machine.run_connect(&mut chan, dst(), now);
        machine.run_prm_end(&mut chan, dst(), now);

        let ar_uuid = machine.session().unwrap().ar_uuid;
        let key = machine.session().unwrap().session_key;
        let ind = app_ready_for(ar_uuid, key);
        machine.handle_application_ready(&ind, now).unwrap();

        machine.apply(&ArEvent::ReleaseRequested, now).unwrap();

        let mut chan = ScriptedChannel::new();
        chan.push(|_request: &[u8]| Err(RpcError::TransportTimeout));

        machine.run_release(&mut chan, dst(), now);
        assert_eq!(machine.state(), ArState::Idle);
    }

    #[test]
    fn test_watchdog_failure_records_reason() {
        let mut machine = machine();
        let now = Instant::now();

        machine.apply(&ArEvent::DeviceFound, now).unwrap();

        let mut chan = ScriptedChannel::new();
        chan.push(connect_ok);
        chan.push(|request: &[u8]| control_ok(request, block_type::IOD_CONTROL_RES));

        machine.run_connect(&mut chan, dst(), now);
        machine.run_prm_end(&mut chan, dst(), now);

        let ar_uuid = machine.session().unwrap().ar_uuid;
        let key = machine.session().unwrap().session_key;
        machine
            .handle_application_ready(&app_ready_for(ar_uuid, key), now)
            .unwrap();
        assert_eq!(machine.state(), ArState::Data);

        let effects = machine
            .fail(
                &ArEvent::WatchdogExpired,
                "no cyclic input".to_string(),
                now,
            )
            .unwrap();

        assert_eq!(machine.state(), ArState::Error);
        assert!(effects.contains(&Effect::StopCyclic));
        assert_eq!(machine.error_reason(), Some("no cyclic input"));
    }

    #[test]
    fn test_error_reset_clears_reason() {
        let mut machine = machine();
        let now = Instant::now();

        machine.apply(&ArEvent::DeviceFound, now).unwrap();

        let mut chan = ScriptedChannel::new();
        chan.push(|_request: &[u8]| Err(RpcError::SessionExhausted));
        machine.run_connect(&mut chan, dst(), now);
        assert_eq!(machine.state(), ArState::Error);
        assert!(machine.error_reason().is_some());

        machine.apply(&ArEvent::Reset, now).unwrap();
        assert_eq!(machine.state(), ArState::Idle);
        assert!(machine.error_reason().is_none());
    }

    #[test]
    fn test_session_timers() {
        let mut machine = machine();
        let now = Instant::now();

        machine.apply(&ArEvent::DeviceFound, now).unwrap();

        let mut chan = ScriptedChannel::new();
        chan.push(connect_ok);
        machine.run_connect(&mut chan, dst(), now);

        let session = machine.session().unwrap();
        assert_eq!(session.period(), Duration::from_millis(256));
        assert_eq!(session.data_hold_timeout(), Duration::from_millis(768));
        assert!(session.watchdog_timeout() > session.data_hold_timeout());
    }

    fn app_ready_for(ar_uuid: Uuid, session_key: u16) -> ApplicationReadyInd {
        let mut writer = BlockWriter::new();
        let start = writer.begin(block_type::APP_READY_REQ);
        writer.push_u16(0);
        writer.push_uuid(&ar_uuid, UuidFormat::AsStored);
        writer.push_u16(session_key);
        writer.push_u16(0);
        writer.push_u16(crate::rpc::control::APPLICATION_READY);
        writer.push_u16(0);
        writer.end(start);
        let blocks = writer.into_bytes();

        let header = RpcHeader {
            ptype: crate::rpc::PTYPE_REQUEST,
            flags1: 0,
            drep: [crate::rpc::DREP_LITTLE_ENDIAN, 0, 0],
            object: Uuid::NIL,
            interface: crate::rpc::IFACE_UUID_CONTROLLER,
            activity: Uuid::from_bytes([0x33; 16]),
            server_boot: 0,
            interface_version: 1,
            sequence: 1,
            opnum: crate::rpc::opnum::CONTROL,
            body_len: (20 + blocks.len()) as u16,
            fragment_num: 0,
        };

        ApplicationReadyInd {
            header,
            ar_uuid,
            session_key,
        }
    }
}
