use crate::codec::Mac;
use hashbrown::HashMap;
use penstock::logging::{self, Logger};
use serde_derive::Serialize;
use std::net::Ipv4Addr;

/// Upper bound on tracked devices. Industrial segments run far below this;
/// hitting the cap indicates a misconfigured uplink.
pub const CACHE_CAPACITY: usize = 256;

/// Identity of a device as assembled from DCP Identify responses. Entries
/// are only ever removed by an explicit cache flush.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub mac: Mac,
    pub ip: Option<Ipv4Addr>,
    pub mask: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub vendor_id: Option<u16>,
    pub device_id: Option<u16>,
    pub role: Option<u8>,
    pub station_name: Option<String>,
    pub vendor_name: Option<String>,
    pub first_seen_secs: u64,
    pub last_seen_secs: u64,
}

impl DeviceInfo {
    pub fn new(mac: Mac, now_secs: u64) -> DeviceInfo {
        DeviceInfo {
            mac,
            ip: None,
            mask: None,
            gateway: None,
            vendor_id: None,
            device_id: None,
            role: None,
            station_name: None,
            vendor_name: None,
            first_seen_secs: now_secs,
            last_seen_secs: now_secs,
        }
    }
}

impl serde::Serialize for Mac {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CacheOutcome {
    Added,
    Updated,
    /// The cache is at capacity and the device was not retained.
    Dropped,
}

/// Bounded identity cache keyed by MAC.
pub struct DeviceCache {
    devices: HashMap<Mac, DeviceInfo>,
    log: Logger,
}

impl DeviceCache {
    pub fn new(log: &Logger) -> DeviceCache {
        DeviceCache {
            devices: HashMap::new(),
            log: log.new(logging::o!()),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    #[inline]
    pub fn get(&self, mac: &Mac) -> Option<&DeviceInfo> {
        self.devices.get(mac)
    }

    pub fn find_by_name(&self, station: &str) -> Option<&DeviceInfo> {
        self.devices
            .values()
            .find(|info| info.station_name.as_deref() == Some(station))
    }

    /// Merges a freshly parsed identity into the cache. Fields absent from
    /// the new response keep their previous value.
    pub fn upsert(&mut self, incoming: DeviceInfo, now_secs: u64) -> CacheOutcome {
        if let Some(existing) = self.devices.get_mut(&incoming.mac) {
            existing.ip = incoming.ip.or(existing.ip);
            existing.mask = incoming.mask.or(existing.mask);
            existing.gateway = incoming.gateway.or(existing.gateway);
            existing.vendor_id = incoming.vendor_id.or(existing.vendor_id);
            existing.device_id = incoming.device_id.or(existing.device_id);
            existing.role = incoming.role.or(existing.role);

            if incoming.station_name.is_some() {
                existing.station_name = incoming.station_name;
            }
            if incoming.vendor_name.is_some() {
                existing.vendor_name = incoming.vendor_name;
            }

            existing.last_seen_secs = now_secs;

            return CacheOutcome::Updated;
        }

        if self.devices.len() >= CACHE_CAPACITY {
            logging::warn!(self.log, "device cache full, dropping device";
                           "context" => "upsert",
                           "mac" => %incoming.mac,
                           "capacity" => CACHE_CAPACITY);
            return CacheOutcome::Dropped;
        }

        self.devices.insert(incoming.mac, incoming);
        CacheOutcome::Added
    }

    /// Copies of all entries, for publication outside the lock.
    pub fn snapshot(&self) -> Vec<DeviceInfo> {
        self.devices.values().cloned().collect()
    }

    pub fn flush(&mut self) {
        self.devices.clear();
    }
}
