//! Connect-attempt variants. Vendor stacks disagree on UUID encoding, NDR
//! presence, catalogue scope, timing and even the Connect opnum; the table
//! enumerates every combination once, immutably, and per-session state is
//! nothing but an index into it.

use crate::uuid::UuidFormat;
use hashbrown::HashMap;
use lazy_static::lazy_static;
use serde_derive::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NdrMode {
    Absent,
    Present,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SlotScope {
    /// The full expected catalogue.
    Full,
    /// Device Access Point submodules only; application slots are plugged
    /// after the AR is up.
    DapOnly,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TimingProfile {
    Default,
    Aggressive,
    Conservative,
}

/// Connect opnum variant. `Write` is tolerated by stacks that multiplex
/// context management through the Write service.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectOpnum {
    Standard = 0,
    Write = 3,
}

impl ConnectOpnum {
    #[inline]
    pub fn value(self) -> u16 {
        self as u16
    }
}

/// Concrete parameters behind a timing profile.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TimingParams {
    pub send_clock_factor: u16,
    pub reduction_ratio: u16,
    pub watchdog_factor: u16,
    pub data_hold_factor: u16,
    /// Bounded at 100 by the alarm consumer.
    pub alarm_timeout_factor: u16,
    pub alarm_retries: u16,
    pub rpc_timeout: Duration,
}

impl TimingProfile {
    pub fn params(self) -> TimingParams {
        match self {
            // 64 x 128 x 31.25 us = 256 ms cycle
            TimingProfile::Default => TimingParams {
                send_clock_factor: 64,
                reduction_ratio: 128,
                watchdog_factor: 3,
                data_hold_factor: 3,
                alarm_timeout_factor: 100,
                alarm_retries: 3,
                rpc_timeout: Duration::from_millis(2000),
            },
            TimingProfile::Aggressive => TimingParams {
                send_clock_factor: 32,
                reduction_ratio: 32,
                watchdog_factor: 3,
                data_hold_factor: 3,
                alarm_timeout_factor: 50,
                alarm_retries: 2,
                rpc_timeout: Duration::from_millis(800),
            },
            TimingProfile::Conservative => TimingParams {
                send_clock_factor: 128,
                reduction_ratio: 512,
                watchdog_factor: 6,
                data_hold_factor: 6,
                alarm_timeout_factor: 100,
                alarm_retries: 5,
                rpc_timeout: Duration::from_millis(5000),
            },
        }
    }
}

/// Cyclic period for a send-clock/reduction pair, in 31.25 us units.
#[inline]
pub fn cycle_period(send_clock_factor: u16, reduction_ratio: u16) -> Duration {
    Duration::from_nanos(u64::from(send_clock_factor) * u64::from(reduction_ratio) * 31_250)
}

/// One connect-attempt variant. Strategies are plain values; their effect on
/// packet construction is a pure function of the fields.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Strategy {
    pub uuid_format: UuidFormat,
    pub ndr_mode: NdrMode,
    pub slot_scope: SlotScope,
    pub timing: TimingProfile,
    pub opnum: ConnectOpnum,
}

impl Strategy {
    #[inline]
    pub fn timing_params(&self) -> TimingParams {
        self.timing.params()
    }
}

pub const STRATEGY_COUNT: usize = 48;

lazy_static! {
    /// The full variant table. Index 0 is the standard-conformant default;
    /// dimensions vary innermost-first so neighbouring indices stay close
    /// to each other in wire behavior.
    pub static ref STRATEGIES: Vec<Strategy> = build_table();
}

fn build_table() -> Vec<Strategy> {
    let mut table = Vec::with_capacity(STRATEGY_COUNT);

    for &uuid_format in &[UuidFormat::SwapFields, UuidFormat::AsStored] {
        for &ndr_mode in &[NdrMode::Present, NdrMode::Absent] {
            for &slot_scope in &[SlotScope::Full, SlotScope::DapOnly] {
                for &timing in &[
                    TimingProfile::Default,
                    TimingProfile::Aggressive,
                    TimingProfile::Conservative,
                ] {
                    for &opnum in &[ConnectOpnum::Standard, ConnectOpnum::Write] {
                        table.push(Strategy {
                            uuid_format,
                            ndr_mode,
                            slot_scope,
                            timing,
                            opnum,
                        });
                    }
                }
            }
        }
    }

    debug_assert_eq!(table.len(), STRATEGY_COUNT);
    table
}

/// Reconnection hints for stacks whose working variant is known up front.
pub struct VendorHints {
    hints: HashMap<u16, usize>,
}

impl VendorHints {
    /// Vendors profiled in the field so far.
    pub fn builtin() -> VendorHints {
        let mut hints = HashMap::new();

        // Headworks RTUs and Siemens-derived stacks speak the default.
        hints.insert(0x0272, 0);
        hints.insert(0x002A, 0);
        // Legacy gateways that never swap UUID fields.
        hints.insert(0x1AE0, 24);

        VendorHints { hints }
    }

    pub fn insert(&mut self, vendor_id: u16, index: usize) {
        if index < STRATEGY_COUNT {
            self.hints.insert(vendor_id, index);
        }
    }

    #[inline]
    pub fn lookup(&self, vendor_id: u16) -> Option<usize> {
        self.hints.get(&vendor_id).copied()
    }
}

/// Last-successful index persisted across controller restarts.
#[derive(Debug, Copy, Clone, Serialize, Deserialize)]
pub struct PersistedStrategy {
    pub last_successful: usize,
    pub attempts: u64,
}

/// Maximum full passes over the table before a session gives up.
pub const MAX_CYCLES: u32 = 3;

/// Per-session iterator state over the strategy table.
#[derive(Debug, Clone)]
pub struct SessionProgress {
    index: usize,
    start_index: usize,
    total: usize,
    last_successful: Option<usize>,
    attempts: u64,
    cycles: u32,
    started: Instant,
    last_attempt: Instant,
}

impl SessionProgress {
    /// Fresh session. The starting index prefers, in order: the proven
    /// index from an earlier session, the vendor hint, the table default.
    pub fn new(last_successful: Option<usize>, vendor_hint: Option<usize>, now: Instant) -> Self {
        let start_index = last_successful
            .or(vendor_hint)
            .filter(|&idx| idx < STRATEGY_COUNT)
            .unwrap_or(0);

        SessionProgress {
            index: start_index,
            start_index,
            total: STRATEGY_COUNT,
            last_successful,
            attempts: 0,
            cycles: 0,
            started: now,
            last_attempt: now,
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn current(&self) -> Strategy {
        STRATEGIES[self.index]
    }

    #[inline]
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    #[inline]
    pub fn cycles(&self) -> u32 {
        self.cycles
    }

    #[inline]
    pub fn last_successful(&self) -> Option<usize> {
        self.last_successful
    }

    #[inline]
    pub fn started(&self) -> Instant {
        self.started
    }

    #[inline]
    pub fn last_attempt(&self) -> Instant {
        self.last_attempt
    }

    /// Records one attempt with the current strategy.
    pub fn attempt(&mut self, now: Instant) {
        self.attempts += 1;
        self.last_attempt = now;
    }

    /// Moves to the next variant. Completing a full pass increments the
    /// cycle counter and restarts the iteration, which tolerates
    /// intermittent conditions until `exhausted` reports true.
    pub fn advance(&mut self) {
        self.index = (self.index + 1) % self.total;

        if self.index == self.start_index {
            self.cycles += 1;
        }
    }

    #[inline]
    pub fn exhausted(&self) -> bool {
        self.cycles >= MAX_CYCLES
    }

    /// Marks the current strategy as the proven variant for this RTU.
    pub fn mark_success(&mut self) {
        self.last_successful = Some(self.index);
    }
}
