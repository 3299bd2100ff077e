//! Cyclic real-time exchange. Each IOCR runs on its own period derived from
//! the negotiated send clock and reduction ratio; the send check compares
//! elapsed time against that period on every tick, decoupling frame timing
//! from the coarser control-loop cadence.

use crate::ar::layout::{IocrLayout, IocrPair};
use crate::codec::{self, EthernetHeader, Mac, ETHERTYPE_PROFINET, MIN_CSDU_LEN};
use crate::error::CodecError;
use hashbrown::{HashMap, HashSet};
use penstock::logging::{self, Logger};
use serde_derive::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

/// DataStatus bit positions.
pub mod data_status {
    pub const STATE: u8 = 0x01;
    pub const VALID: u8 = 0x04;
    pub const RUN: u8 = 0x10;
    /// Required in normal operation; an RTU receiving frames without it
    /// diagnoses a station problem.
    pub const STATION_PROBLEM_NORMAL: u8 = 0x20;

    /// STATE | VALID | RUN | STATION_PROBLEM_NORMAL.
    pub const NORMAL_OPERATION: u8 = STATE | VALID | RUN | STATION_PROBLEM_NORMAL;
}

/// Provider status values. Protocol-level, distinct from the application
/// quality byte inside sensor data.
pub const IOPS_GOOD: u8 = 0x80;
pub const IOPS_BAD: u8 = 0x00;

pub const TRANSFER_STATUS_OK: u8 = 0x00;

/// APDU trailer: cycle counter, DataStatus, TransferStatus.
const APDU_TRAILER_LEN: usize = 4;

/// Sensor subslots carry a big-endian float plus one quality byte.
pub const SENSOR_DATA_LEN: u16 = 5;

/// Actuator subslots carry a command byte plus one reserved byte.
pub const ACTUATOR_DATA_LEN: u16 = 2;

/// Reads older than this many periods degrade to UNCERTAIN.
const STALE_PERIODS: u32 = 3;

/// Actuator command bytes.
pub mod actuator {
    pub const OFF: u8 = 0x00;
    pub const ON: u8 = 0x01;
    pub const PWM: u8 = 0x02;
}

/// Application-level classification of a sensor reading.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Good,
    Uncertain,
    Bad,
    NotConnected,
}

impl Quality {
    #[inline]
    pub fn to_wire(self) -> u8 {
        match self {
            Quality::Good => 0x00,
            Quality::Uncertain => 0x40,
            Quality::Bad => 0x80,
            Quality::NotConnected => 0xC0,
        }
    }

    /// Only the four defined encodings map; everything else is handled by
    /// the caller (treated as BAD and logged once).
    #[inline]
    pub fn from_wire(byte: u8) -> Option<Quality> {
        match byte {
            0x00 => Some(Quality::Good),
            0x40 => Some(Quality::Uncertain),
            0x80 => Some(Quality::Bad),
            0xC0 => Some(Quality::NotConnected),
            _ => None,
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Quality::Good => "good",
            Quality::Uncertain => "uncertain",
            Quality::Bad => "bad",
            Quality::NotConnected => "not-connected",
        };
        f.write_str(name)
    }
}

/// One published measurement.
#[derive(Debug, Clone, Serialize)]
pub struct SensorReading {
    pub station: String,
    pub slot: u16,
    pub subslot: u16,
    pub value: f32,
    pub quality: Quality,
    /// Monotonic microseconds since process start.
    pub timestamp_us: u64,
}

/// Outbound send half of an AR: builds the output frame when its period
/// elapses.
pub struct OutputIocr {
    layout: IocrLayout,
    period: Duration,
    cycle_counter: u16,
    last_send: Option<Instant>,
    values: HashMap<(u16, u16), [u8; 2]>,
    data_status: u8,
}

impl OutputIocr {
    pub fn new(layout: IocrLayout, period: Duration) -> OutputIocr {
        OutputIocr {
            layout,
            period,
            cycle_counter: 0,
            last_send: None,
            values: HashMap::new(),
            data_status: data_status::NORMAL_OPERATION,
        }
    }

    #[inline]
    pub fn layout(&self) -> &IocrLayout {
        &self.layout
    }

    #[inline]
    pub fn period(&self) -> Duration {
        self.period
    }

    #[inline]
    pub fn cycle_counter(&self) -> u16 {
        self.cycle_counter
    }

    #[inline]
    pub fn data_status(&self) -> u8 {
        self.data_status
    }

    /// Stages an actuator command. The wire cell is the command byte
    /// followed by one reserved zero byte.
    pub fn set_command(&mut self, slot: u16, subslot: u16, command: u8) -> bool {
        if self.layout.placement(slot, subslot).is_none() {
            return false;
        }

        self.values.insert((slot, subslot), [command, 0x00]);
        true
    }

    /// True once the IOCR's own period has elapsed since the last send.
    #[inline]
    pub fn due(&self, now: Instant) -> bool {
        match self.last_send {
            Some(last) => now.duration_since(last) >= self.period,
            None => true,
        }
    }

    #[inline]
    pub fn last_send(&self) -> Option<Instant> {
        self.last_send
    }

    /// Builds the output frame and advances the cycle counter. Callers
    /// check `due` first; frames are sent in strict period order.
    pub fn build_frame(
        &mut self,
        dst: Mac,
        src: Mac,
        now: Instant,
    ) -> Result<Vec<u8>, CodecError> {
        let csdu_len = usize::from(self.layout.csdu_len).max(MIN_CSDU_LEN);

        let header = EthernetHeader {
            dst,
            src,
            vlan: Some(self.layout.vlan),
            ethertype: ETHERTYPE_PROFINET,
        };

        let total = header.encoded_len() + 2 + csdu_len + APDU_TRAILER_LEN;
        let mut frame = vec![0u8; total];

        let mut offset = header.write_to(&mut frame)?;
        offset += codec::put_u16(&mut frame, offset, self.layout.frame_id)?;

        let csdu_start = offset;

        for placement in &self.layout.data {
            let cell_offset = csdu_start + usize::from(placement.data_offset);

            if let Some(value) = self.values.get(&(placement.slot, placement.subslot)) {
                let len = usize::from(placement.data_length).min(value.len());
                codec::put_bytes(&mut frame, cell_offset, &value[..len])?;
            }

            codec::put_u8(
                &mut frame,
                csdu_start + usize::from(placement.iops_offset),
                IOPS_GOOD,
            )?;
        }

        for status in &self.layout.status {
            codec::put_u8(&mut frame, csdu_start + usize::from(status.offset), IOPS_GOOD)?;
        }

        offset = csdu_start + csdu_len;
        offset += codec::put_u16(&mut frame, offset, self.cycle_counter)?;
        offset += codec::put_u8(&mut frame, offset, self.data_status)?;
        codec::put_u8(&mut frame, offset, TRANSFER_STATUS_OK)?;

        self.cycle_counter = self.cycle_counter.wrapping_add(1);
        self.last_send = Some(now);

        Ok(frame)
    }
}

/// Last published value of one sensor position, kept so aging can be
/// reported without a fresh frame.
struct HeldReading {
    value: f32,
    quality: Quality,
}

/// Inbound receive half of an AR: unpacks sensor cells and tracks cycle
/// continuity.
pub struct InputIocr {
    layout: IocrLayout,
    period: Duration,
    last_cycle: Option<u16>,
    last_frame_at: Option<Instant>,
    last_data_status: u8,
    held: HashMap<(u16, u16), HeldReading>,
    unknown_qualities: HashSet<u8>,
    log: Logger,
}

impl InputIocr {
    pub fn new(layout: IocrLayout, period: Duration, log: &Logger) -> InputIocr {
        InputIocr {
            layout,
            period,
            last_cycle: None,
            last_frame_at: None,
            last_data_status: 0,
            held: HashMap::new(),
            unknown_qualities: HashSet::new(),
            log: log.new(logging::o!()),
        }
    }

    #[inline]
    pub fn layout(&self) -> &IocrLayout {
        &self.layout
    }

    #[inline]
    pub fn period(&self) -> Duration {
        self.period
    }

    #[inline]
    pub fn last_data_status(&self) -> u8 {
        self.last_data_status
    }

    #[inline]
    pub fn last_cycle(&self) -> Option<u16> {
        self.last_cycle
    }

    /// Time since the last accepted frame.
    #[inline]
    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.last_frame_at.map(|at| now.duration_since(at))
    }

    /// Consumes one received frame and extracts the sensor readings.
    /// Frames with an unchanged cycle counter are duplicates and yield
    /// nothing; the counter is compared only for change detection.
    pub fn process_frame(
        &mut self,
        station: &str,
        bytes: &[u8],
        now: Instant,
        mono_us: u64,
    ) -> Result<Vec<SensorReading>, CodecError> {
        let (eth, header_len) = EthernetHeader::read_from(bytes)?;

        if eth.ethertype != ETHERTYPE_PROFINET {
            return Ok(Vec::new());
        }

        let frame_id = codec::get_u16(bytes, header_len)?;
        if frame_id != self.layout.frame_id {
            return Ok(Vec::new());
        }

        if bytes.len() < header_len + 2 + MIN_CSDU_LEN + APDU_TRAILER_LEN {
            return Err(CodecError::TruncatedFrame);
        }

        let trailer = bytes.len() - APDU_TRAILER_LEN;
        let cycle = codec::get_u16(bytes, trailer)?;
        let status = codec::get_u8(bytes, trailer + 2)?;

        if self.last_cycle == Some(cycle) {
            return Ok(Vec::new());
        }

        self.last_cycle = Some(cycle);
        self.last_frame_at = Some(now);
        self.last_data_status = status;

        let csdu = &bytes[header_len + 2..trailer];
        let producing = status & (data_status::VALID | data_status::RUN)
            == (data_status::VALID | data_status::RUN);

        let mut readings = Vec::new();

        for placement in &self.layout.data {
            if placement.data_length != SENSOR_DATA_LEN {
                continue;
            }

            let (value, raw_quality) = codec::unpack_sensor(csdu, placement.data_offset.into())?;
            let iops = codec::get_u8(csdu, placement.iops_offset.into())?;

            let mut quality = match Quality::from_wire(raw_quality) {
                Some(quality) => quality,
                None => {
                    if self.unknown_qualities.insert(raw_quality) {
                        logging::warn!(self.log, "unknown quality encoding, treating as bad";
                                       "context" => "process_frame",
                                       "station" => station,
                                       "slot" => placement.slot,
                                       "encoding" => raw_quality);
                    }
                    Quality::Bad
                }
            };

            // Provider status and DataStatus gate the application quality.
            if iops & IOPS_GOOD == 0 || !producing {
                quality = Quality::Bad;
            }

            self.held.insert(
                (placement.slot, placement.subslot),
                HeldReading { value, quality },
            );

            readings.push(SensorReading {
                station: station.to_string(),
                slot: placement.slot,
                subslot: placement.subslot,
                value,
                quality,
                timestamp_us: mono_us,
            });
        }

        Ok(readings)
    }

    /// Re-evaluates held readings against the staleness threshold and
    /// returns those whose quality just degraded. Each degradation is
    /// published exactly once; the next fresh frame restores the held
    /// quality.
    pub fn degraded_readings(
        &mut self,
        station: &str,
        now: Instant,
        mono_us: u64,
    ) -> Vec<SensorReading> {
        let age = match self.age(now) {
            Some(age) => age,
            None => return Vec::new(),
        };

        let mut readings = Vec::new();

        for placement in &self.layout.data {
            if placement.data_length != SENSOR_DATA_LEN {
                continue;
            }

            if let Some(held) = self.held.get_mut(&(placement.slot, placement.subslot)) {
                let degraded = degrade_for_age(held.quality, age, self.period);

                if degraded != held.quality {
                    held.quality = degraded;

                    readings.push(SensorReading {
                        station: station.to_string(),
                        slot: placement.slot,
                        subslot: placement.subslot,
                        value: held.value,
                        quality: degraded,
                        timestamp_us: mono_us,
                    });
                }
            }
        }

        readings
    }

    /// NOT_CONNECTED placeholders for every sensor position, published when
    /// the AR leaves Data.
    pub fn offline_readings(&self, station: &str, mono_us: u64) -> Vec<SensorReading> {
        self.layout
            .data
            .iter()
            .filter(|placement| placement.data_length == SENSOR_DATA_LEN)
            .map(|placement| SensorReading {
                station: station.to_string(),
                slot: placement.slot,
                subslot: placement.subslot,
                value: 0.0,
                quality: Quality::NotConnected,
                timestamp_us: mono_us,
            })
            .collect()
    }
}

/// Degrades a reading that has aged past the staleness threshold.
pub fn degrade_for_age(quality: Quality, age: Duration, period: Duration) -> Quality {
    if quality == Quality::Good && age > period * STALE_PERIODS {
        Quality::Uncertain
    } else {
        quality
    }
}

/// Both halves of one AR's cyclic exchange. The owning AR task serializes
/// send and receive through its own lock; separate ARs run independently.
pub struct CyclicIo {
    station: String,
    src: Mac,
    dst: Mac,
    pub output: OutputIocr,
    pub input: InputIocr,
}

impl CyclicIo {
    pub fn new(
        station: String,
        src: Mac,
        dst: Mac,
        layouts: &IocrPair,
        period: Duration,
        log: &Logger,
    ) -> CyclicIo {
        CyclicIo {
            station,
            src,
            dst,
            output: OutputIocr::new(layouts.output.clone(), period),
            input: InputIocr::new(layouts.input.clone(), period, log),
        }
    }

    #[inline]
    pub fn station(&self) -> &str {
        &self.station
    }

    /// Builds the next output frame if the period has elapsed.
    pub fn tick(&mut self, now: Instant) -> Result<Option<Vec<u8>>, CodecError> {
        if !self.output.due(now) {
            return Ok(None);
        }

        self.output.build_frame(self.dst, self.src, now).map(Some)
    }

    pub fn process_input(
        &mut self,
        bytes: &[u8],
        now: Instant,
        mono_us: u64,
    ) -> Result<Vec<SensorReading>, CodecError> {
        let station = self.station.clone();
        self.input.process_frame(&station, bytes, now, mono_us)
    }

    /// Re-publishes held readings whose age crossed the staleness
    /// threshold. Called on every tick alongside the send check.
    pub fn degraded_readings(&mut self, now: Instant, mono_us: u64) -> Vec<SensorReading> {
        let station = self.station.clone();
        self.input.degraded_readings(&station, now, mono_us)
    }

    pub fn offline_readings(&self, mono_us: u64) -> Vec<SensorReading> {
        self.input.offline_readings(&self.station, mono_us)
    }
}
