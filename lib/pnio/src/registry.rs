//! The RTU registry: configured stations, their catalogues and their live
//! AR state. Mutation happens only through the bridge executor and the
//! discovery task; everyone else reads short-lived snapshot copies.

use crate::ar::layout::{SlotDirection, SlotEntry};
use crate::ar::ArState;
use crate::dcp::valid_station_name;
use crate::error::ConfigError;
use crate::record::AuthorityMode;
use indexmap::IndexMap;
use serde_derive::Serialize;
use std::net::Ipv4Addr;

/// Static configuration plus live state of one RTU. The station name is the
/// unique identifier and is immutable after creation.
#[derive(Debug, Clone)]
pub struct RtuRecord {
    station: String,
    pub ip: Option<Ipv4Addr>,
    pub vendor_id: u16,
    pub device_id: u16,
    pub slots: Vec<SlotEntry>,
    pub authority: AuthorityMode,
    pub enrollment_token: [u8; 64],
    pub controller_id: u32,
    pub ar_state: ArState,
    pub error_reason: Option<String>,
    pub last_transition_secs: u64,
    pub last_contact_secs: Option<u64>,
}

impl RtuRecord {
    pub fn new(
        station: &str,
        vendor_id: u16,
        device_id: u16,
        slots: Vec<SlotEntry>,
    ) -> Result<RtuRecord, ConfigError> {
        if !valid_station_name(station) {
            return Err(ConfigError::InvalidStationName(station.to_string()));
        }

        Ok(RtuRecord {
            station: station.to_string(),
            ip: None,
            vendor_id,
            device_id,
            slots,
            authority: AuthorityMode::Supervised,
            enrollment_token: [0u8; 64],
            controller_id: 0,
            ar_state: ArState::Idle,
            error_reason: None,
            last_transition_secs: 0,
            last_contact_secs: None,
        })
    }

    #[inline]
    pub fn station(&self) -> &str {
        &self.station
    }

    pub fn has_slot(&self, slot: u16) -> bool {
        self.slots.iter().any(|entry| entry.slot == slot)
    }

    pub fn output_slot(&self, slot: u16) -> Option<&SlotEntry> {
        self.slots
            .iter()
            .find(|entry| entry.slot == slot && entry.direction == SlotDirection::Output)
    }

    pub fn snapshot(&self) -> RtuSnapshot {
        RtuSnapshot {
            station: self.station.clone(),
            ip: self.ip,
            vendor_id: self.vendor_id,
            device_id: self.device_id,
            authority: self.authority,
            ar_state: self.ar_state,
            error_reason: self.error_reason.clone(),
            last_transition_secs: self.last_transition_secs,
            last_contact_secs: self.last_contact_secs,
            slot_count: self.slots.len(),
        }
    }
}

/// Published copy of an RTU's state.
#[derive(Debug, Clone, Serialize)]
pub struct RtuSnapshot {
    pub station: String,
    pub ip: Option<Ipv4Addr>,
    pub vendor_id: u16,
    pub device_id: u16,
    pub authority: AuthorityMode,
    pub ar_state: ArState,
    pub error_reason: Option<String>,
    pub last_transition_secs: u64,
    pub last_contact_secs: Option<u64>,
    pub slot_count: usize,
}

/// Registry keyed by station name, iterated in registration order.
#[derive(Default)]
pub struct RtuRegistry {
    rtus: IndexMap<String, RtuRecord>,
}

impl RtuRegistry {
    pub fn new() -> RtuRegistry {
        RtuRegistry {
            rtus: IndexMap::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rtus.len()
    }

    #[inline]
    pub fn contains(&self, station: &str) -> bool {
        self.rtus.contains_key(station)
    }

    #[inline]
    pub fn get(&self, station: &str) -> Option<&RtuRecord> {
        self.rtus.get(station)
    }

    #[inline]
    pub fn get_mut(&mut self, station: &str) -> Option<&mut RtuRecord> {
        self.rtus.get_mut(station)
    }

    /// Adds a record; a station name can only be registered once.
    pub fn insert(&mut self, record: RtuRecord) -> Result<(), ConfigError> {
        if self.rtus.contains_key(record.station()) {
            return Err(ConfigError::InvalidStationName(record.station().to_string()));
        }

        self.rtus.insert(record.station().to_string(), record);
        Ok(())
    }

    pub fn remove(&mut self, station: &str) -> Option<RtuRecord> {
        self.rtus.shift_remove(station)
    }

    pub fn update_state(
        &mut self,
        station: &str,
        state: ArState,
        reason: Option<String>,
        now_secs: u64,
    ) {
        if let Some(record) = self.rtus.get_mut(station) {
            record.ar_state = state;
            record.error_reason = reason;
            record.last_transition_secs = now_secs;
        }
    }

    pub fn touch_contact(&mut self, station: &str, now_secs: u64) {
        if let Some(record) = self.rtus.get_mut(station) {
            record.last_contact_secs = Some(now_secs);
        }
    }

    pub fn stations(&self) -> impl Iterator<Item = &str> {
        self.rtus.keys().map(String::as_str)
    }

    pub fn records(&self) -> impl Iterator<Item = &RtuRecord> {
        self.rtus.values()
    }

    pub fn snapshot(&self) -> Vec<RtuSnapshot> {
        self.rtus.values().map(RtuRecord::snapshot).collect()
    }
}
