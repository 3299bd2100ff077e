//! DCP: link-layer enumeration and IP/name configuration over EtherType
//! 0x8892. The discovery component builds frames and digests responses; it
//! never owns a socket — the caller sends whatever the builders return and
//! feeds received frames into `process_frame`.

pub mod cache;

pub use self::cache::{CacheOutcome, DeviceCache, DeviceInfo, CACHE_CAPACITY};

use crate::codec::{self, EthernetHeader, Mac, ETHERTYPE_PROFINET};
use crate::error::{CodecError, ConfigError};
use penstock::logging::{self, Logger};
use rand::Rng;
use std::net::Ipv4Addr;
use std::time::Duration;

pub const FRAME_ID_HELLO: u16 = 0xFEFC;
pub const FRAME_ID_GETSET: u16 = 0xFEFD;
pub const FRAME_ID_IDENTIFY_REQ: u16 = 0xFEFE;
pub const FRAME_ID_IDENTIFY_RES: u16 = 0xFEFF;

pub const SERVICE_GET: u8 = 0x03;
pub const SERVICE_SET: u8 = 0x04;
pub const SERVICE_IDENTIFY: u8 = 0x05;

pub const SERVICE_TYPE_REQUEST: u8 = 0x00;
pub const SERVICE_TYPE_SUCCESS: u8 = 0x01;
pub const SERVICE_TYPE_UNSUPPORTED: u8 = 0x05;

/// DCP option codes from the source catalogue.
pub mod option {
    pub const IP: u8 = 0x01;
    pub const DEVICE_PROPERTIES: u8 = 0x02;
    pub const DHCP: u8 = 0x03;
    pub const CONTROL: u8 = 0x05;
    pub const DEVICE_INITIATIVE: u8 = 0x06;
    pub const ALL: u8 = 0xFF;
}

/// Suboption codes, grouped by their parent option.
pub mod suboption {
    pub const IP_MAC: u8 = 0x01;
    pub const IP_PARAMETER: u8 = 0x02;
    pub const IP_FULL_SUITE: u8 = 0x03;

    pub const DEV_VENDOR: u8 = 0x01;
    pub const DEV_NAME_OF_STATION: u8 = 0x02;
    pub const DEV_DEVICE_ID: u8 = 0x03;
    pub const DEV_ROLE: u8 = 0x04;
    pub const DEV_OPTIONS: u8 = 0x05;
    pub const DEV_INSTANCE: u8 = 0x07;

    pub const CTL_START: u8 = 0x01;
    pub const CTL_STOP: u8 = 0x02;
    pub const CTL_SIGNAL: u8 = 0x03;
    pub const CTL_RESPONSE: u8 = 0x04;
    pub const CTL_FACTORY_RESET: u8 = 0x06;

    pub const ALL: u8 = 0xFF;
}

/// Set-request qualifier: bit 0 selects permanent storage on the device.
const QUALIFIER_PERMANENT: u16 = 0x0001;

/// Signal value blinking the device LED.
const SIGNAL_FLASH_ONCE: u16 = 0x0100;

/// Reset qualifier selecting communication-parameter reset.
const RESET_COMMUNICATION: u16 = 0x0002;

const DCP_HEADER_LEN: usize = 10;
const MIN_ETHERNET_FRAME: usize = 60;

/// One option/suboption block as read off the wire. `payload` excludes the
/// pad byte appended after odd lengths.
#[derive(Debug, Copy, Clone)]
pub struct DcpBlock<'a> {
    pub option: u8,
    pub suboption: u8,
    pub payload: &'a [u8],
}

/// Sequential reader over the block section of a DCP frame.
pub struct BlockReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BlockReader<'a> {
    #[inline]
    pub fn new(buf: &'a [u8]) -> BlockReader<'a> {
        BlockReader { buf, pos: 0 }
    }

    /// Reads the next block, or `None` once the section is exhausted.
    pub fn next_block(&mut self) -> Result<Option<DcpBlock<'a>>, CodecError> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }

        let option = codec::get_u8(self.buf, self.pos)?;
        let suboption = codec::get_u8(self.buf, self.pos + 1)?;
        let len = codec::get_u16(self.buf, self.pos + 2)? as usize;
        let payload = codec::get_bytes(self.buf, self.pos + 4, len)?;

        // Blocks of odd length carry one pad byte.
        self.pos += 4 + len + (len & 1);

        Ok(Some(DcpBlock {
            option,
            suboption,
            payload,
        }))
    }
}

fn write_block(out: &mut Vec<u8>, option: u8, suboption: u8, payload: &[u8]) {
    out.push(option);
    out.push(suboption);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);

    if payload.len() & 1 == 1 {
        out.push(0);
    }
}

/// DNS-label validation for station names: lowercase, 1..=63 bytes,
/// alphanumeric labels joined by dots, hyphens only inside a label.
pub fn valid_station_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 63 {
        return false;
    }

    for label in name.split('.') {
        if label.is_empty() || label.starts_with('-') || label.ends_with('-') {
            return false;
        }

        if !label
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        {
            return false;
        }
    }

    true
}

/// Connectivity changes and command confirmations drained by the owner.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Appeared(Mac),
    Updated(Mac),
    SetResult {
        mac: Mac,
        option: u8,
        suboption: u8,
        error: u8,
    },
}

/// Link-layer device discovery with a bounded identity cache.
pub struct Discovery {
    src: Mac,
    xid: u32,
    timeout: Duration,
    cache: DeviceCache,
    changes: Vec<DiscoveryEvent>,
    log: Logger,
}

impl Discovery {
    pub const MIN_TIMEOUT_MS: u64 = 100;
    pub const MAX_TIMEOUT_MS: u64 = 10_000;
    pub const DEFAULT_TIMEOUT_MS: u64 = 1280;

    pub fn new<'a, L: Into<Option<&'a Logger>>>(src: Mac, log: L) -> Discovery {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            None => logging::discard(),
        };

        Discovery {
            src,
            xid: rand::thread_rng().gen(),
            timeout: Duration::from_millis(Self::DEFAULT_TIMEOUT_MS),
            cache: DeviceCache::new(&log),
            changes: Vec::new(),
            log,
        }
    }

    /// Response collection window for identify requests.
    #[inline]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout_ms(&mut self, ms: u64) -> Result<(), ConfigError> {
        if ms < Self::MIN_TIMEOUT_MS || ms > Self::MAX_TIMEOUT_MS {
            return Err(ConfigError::InvalidDiscoveryTimeout(ms));
        }

        self.timeout = Duration::from_millis(ms);
        Ok(())
    }

    #[inline]
    pub fn cache(&self) -> &DeviceCache {
        &self.cache
    }

    pub fn flush_cache(&mut self) {
        logging::info!(self.log, "flushing device cache";
                       "context" => "flush_cache",
                       "devices" => self.cache.len());
        self.cache.flush();
    }

    /// Drains all the changes accumulated since the last drain.
    #[inline]
    pub fn changes(&mut self) -> impl Iterator<Item = DiscoveryEvent> + '_ {
        self.changes.drain(..)
    }

    /// Builds an Identify-All request for the DCP multicast group.
    pub fn identify_all(&mut self) -> Result<Vec<u8>, CodecError> {
        let mut blocks = Vec::with_capacity(4);
        write_block(&mut blocks, option::ALL, suboption::ALL, &[]);

        let xid = self.next_xid();

        logging::debug!(self.log, "identify all"; "context" => "identify", "xid" => xid);

        self.frame(
            Mac::DCP_MULTICAST,
            FRAME_ID_IDENTIFY_REQ,
            SERVICE_IDENTIFY,
            xid,
            1,
            &blocks,
        )
    }

    /// Builds an Identify request filtered by station name.
    pub fn identify_by_name(&mut self, name: &str) -> Result<Vec<u8>, CodecError> {
        let mut blocks = Vec::with_capacity(4 + name.len());
        write_block(
            &mut blocks,
            option::DEVICE_PROPERTIES,
            suboption::DEV_NAME_OF_STATION,
            name.as_bytes(),
        );

        let xid = self.next_xid();

        logging::debug!(self.log, "identify by name";
                        "context" => "identify",
                        "xid" => xid,
                        "station" => name);

        self.frame(
            Mac::DCP_MULTICAST,
            FRAME_ID_IDENTIFY_REQ,
            SERVICE_IDENTIFY,
            xid,
            1,
            &blocks,
        )
    }

    /// Builds a Set request configuring the IP suite of the device at `mac`.
    pub fn set_ip(
        &mut self,
        mac: Mac,
        ip: Ipv4Addr,
        mask: Ipv4Addr,
        gateway: Ipv4Addr,
        permanent: bool,
    ) -> Result<Vec<u8>, CodecError> {
        let mut payload = Vec::with_capacity(14);
        payload.extend_from_slice(&Self::qualifier(permanent).to_be_bytes());
        payload.extend_from_slice(&ip.octets());
        payload.extend_from_slice(&mask.octets());
        payload.extend_from_slice(&gateway.octets());

        let mut blocks = Vec::with_capacity(4 + payload.len());
        write_block(&mut blocks, option::IP, suboption::IP_PARAMETER, &payload);

        let xid = self.next_xid();

        logging::info!(self.log, "set ip";
                       "context" => "set",
                       "xid" => xid,
                       "mac" => %mac,
                       "ip" => %ip,
                       "permanent" => permanent);

        self.frame(mac, FRAME_ID_GETSET, SERVICE_SET, xid, 0, &blocks)
    }

    /// Builds a Set request assigning the station name of the device at `mac`.
    pub fn set_station_name(
        &mut self,
        mac: Mac,
        name: &str,
        permanent: bool,
    ) -> Result<Vec<u8>, CodecError> {
        let mut payload = Vec::with_capacity(2 + name.len());
        payload.extend_from_slice(&Self::qualifier(permanent).to_be_bytes());
        payload.extend_from_slice(name.as_bytes());

        let mut blocks = Vec::new();
        write_block(
            &mut blocks,
            option::DEVICE_PROPERTIES,
            suboption::DEV_NAME_OF_STATION,
            &payload,
        );

        let xid = self.next_xid();

        logging::info!(self.log, "set station name";
                       "context" => "set",
                       "xid" => xid,
                       "mac" => %mac,
                       "station" => name,
                       "permanent" => permanent);

        self.frame(mac, FRAME_ID_GETSET, SERVICE_SET, xid, 0, &blocks)
    }

    /// Builds a Get request reading one suboption back from the device.
    pub fn get(&mut self, mac: Mac, option: u8, suboption: u8) -> Result<Vec<u8>, CodecError> {
        let mut blocks = Vec::with_capacity(4);
        blocks.push(option);
        blocks.push(suboption);

        let xid = self.next_xid();
        self.frame(mac, FRAME_ID_GETSET, SERVICE_GET, xid, 0, &blocks)
    }

    /// Builds a Signal request flashing the identification LED.
    pub fn signal(&mut self, mac: Mac) -> Result<Vec<u8>, CodecError> {
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&0u16.to_be_bytes());
        payload.extend_from_slice(&SIGNAL_FLASH_ONCE.to_be_bytes());

        let mut blocks = Vec::new();
        write_block(&mut blocks, option::CONTROL, suboption::CTL_SIGNAL, &payload);

        let xid = self.next_xid();
        self.frame(mac, FRAME_ID_GETSET, SERVICE_SET, xid, 0, &blocks)
    }

    /// Builds a factory-reset request for the device at `mac`.
    pub fn reset_to_factory(&mut self, mac: Mac) -> Result<Vec<u8>, CodecError> {
        let mut blocks = Vec::new();
        write_block(
            &mut blocks,
            option::CONTROL,
            suboption::CTL_FACTORY_RESET,
            &RESET_COMMUNICATION.to_be_bytes(),
        );

        let xid = self.next_xid();

        logging::warn!(self.log, "factory reset requested";
                       "context" => "set",
                       "xid" => xid,
                       "mac" => %mac);

        self.frame(mac, FRAME_ID_GETSET, SERVICE_SET, xid, 0, &blocks)
    }

    /// Consumes an incoming PROFINET frame. Identify responses update the
    /// device cache; Set responses surface their block error. Frames that
    /// are not DCP are ignored.
    pub fn process_frame(&mut self, bytes: &[u8], now_secs: u64) -> Result<(), CodecError> {
        let (eth, offset) = EthernetHeader::read_from(bytes)?;

        if eth.ethertype != ETHERTYPE_PROFINET {
            return Ok(());
        }

        let frame_id = codec::get_u16(bytes, offset)?;

        match frame_id {
            FRAME_ID_IDENTIFY_RES | FRAME_ID_HELLO => {
                self.process_identify(eth.src, bytes, offset + 2, now_secs)
            }
            FRAME_ID_GETSET => self.process_set_response(eth.src, bytes, offset + 2),
            _ => Ok(()),
        }
    }

    fn process_identify(
        &mut self,
        src: Mac,
        bytes: &[u8],
        offset: usize,
        now_secs: u64,
    ) -> Result<(), CodecError> {
        let service_id = codec::get_u8(bytes, offset)?;
        let service_type = codec::get_u8(bytes, offset + 1)?;
        let xid = codec::get_u32(bytes, offset + 2)?;

        if service_id != SERVICE_IDENTIFY || service_type != SERVICE_TYPE_SUCCESS {
            return Ok(());
        }

        let data_len = codec::get_u16(bytes, offset + 8)? as usize;
        let blocks = codec::get_bytes(bytes, offset + DCP_HEADER_LEN, data_len)?;

        let mut info = DeviceInfo::new(src, now_secs);
        let mut reader = BlockReader::new(blocks);

        while let Some(block) = reader.next_block()? {
            // Identify response payloads start with a 2-byte BlockInfo.
            let data = match block.payload.len() {
                0 | 1 => continue,
                _ => &block.payload[2..],
            };

            match (block.option, block.suboption) {
                (option::IP, suboption::IP_PARAMETER) => {
                    if data.len() >= 12 {
                        info.ip = Some(Self::ipv4(&data[0..4]));
                        info.mask = Some(Self::ipv4(&data[4..8]));
                        info.gateway = Some(Self::ipv4(&data[8..12]));
                    }
                }
                (option::DEVICE_PROPERTIES, suboption::DEV_NAME_OF_STATION) => {
                    info.station_name = String::from_utf8(data.to_vec()).ok();
                }
                (option::DEVICE_PROPERTIES, suboption::DEV_DEVICE_ID) => {
                    if data.len() >= 4 {
                        info.vendor_id = Some(u16::from_be_bytes([data[0], data[1]]));
                        info.device_id = Some(u16::from_be_bytes([data[2], data[3]]));
                    }
                }
                (option::DEVICE_PROPERTIES, suboption::DEV_ROLE) => {
                    if !data.is_empty() {
                        info.role = Some(data[0]);
                    }
                }
                (option::DEVICE_PROPERTIES, suboption::DEV_VENDOR) => {
                    info.vendor_name = String::from_utf8(data.to_vec()).ok();
                }
                _ => (),
            }
        }

        logging::debug!(self.log, "identify response";
                        "context" => "process_frame",
                        "xid" => xid,
                        "mac" => %src,
                        "station" => info.station_name.as_deref().unwrap_or("<unset>"));

        match self.cache.upsert(info, now_secs) {
            CacheOutcome::Added => self.changes.push(DiscoveryEvent::Appeared(src)),
            CacheOutcome::Updated => self.changes.push(DiscoveryEvent::Updated(src)),
            CacheOutcome::Dropped => (),
        }

        Ok(())
    }

    fn process_set_response(
        &mut self,
        src: Mac,
        bytes: &[u8],
        offset: usize,
    ) -> Result<(), CodecError> {
        let service_id = codec::get_u8(bytes, offset)?;
        let service_type = codec::get_u8(bytes, offset + 1)?;

        if service_id != SERVICE_SET || service_type != SERVICE_TYPE_SUCCESS {
            return Ok(());
        }

        let data_len = codec::get_u16(bytes, offset + 8)? as usize;
        let blocks = codec::get_bytes(bytes, offset + DCP_HEADER_LEN, data_len)?;

        let mut reader = BlockReader::new(blocks);

        while let Some(block) = reader.next_block()? {
            if block.option == option::CONTROL
                && block.suboption == suboption::CTL_RESPONSE
                && block.payload.len() >= 3
            {
                self.changes.push(DiscoveryEvent::SetResult {
                    mac: src,
                    option: block.payload[0],
                    suboption: block.payload[1],
                    error: block.payload[2],
                });
            }
        }

        Ok(())
    }

    fn frame(
        &self,
        dst: Mac,
        frame_id: u16,
        service_id: u8,
        xid: u32,
        response_delay: u16,
        blocks: &[u8],
    ) -> Result<Vec<u8>, CodecError> {
        let header = EthernetHeader {
            dst,
            src: self.src,
            vlan: None,
            ethertype: ETHERTYPE_PROFINET,
        };

        let mut frame = vec![0u8; header.encoded_len() + 2 + DCP_HEADER_LEN + blocks.len()];

        let mut offset = header.write_to(&mut frame)?;
        offset += codec::put_u16(&mut frame, offset, frame_id)?;
        offset += codec::put_u8(&mut frame, offset, service_id)?;
        offset += codec::put_u8(&mut frame, offset, SERVICE_TYPE_REQUEST)?;
        offset += codec::put_u32(&mut frame, offset, xid)?;
        offset += codec::put_u16(&mut frame, offset, response_delay)?;
        offset += codec::put_u16(&mut frame, offset, blocks.len() as u16)?;
        codec::put_bytes(&mut frame, offset, blocks)?;

        if frame.len() < MIN_ETHERNET_FRAME {
            frame.resize(MIN_ETHERNET_FRAME, 0);
        }

        Ok(frame)
    }

    #[inline]
    fn qualifier(permanent: bool) -> u16 {
        if permanent {
            QUALIFIER_PERMANENT
        } else {
            0
        }
    }

    #[inline]
    fn ipv4(bytes: &[u8]) -> Ipv4Addr {
        Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])
    }

    fn next_xid(&mut self) -> u32 {
        self.xid = self.xid.wrapping_add(1);
        self.xid
    }
}
