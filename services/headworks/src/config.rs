use pnio::ar::layout::{SlotDirection, SlotEntry};
use pnio::dcp::valid_station_name;
use pnio::error::ConfigError;
use pnio::record::AuthorityMode;
use pnio::registry::RtuRecord;
use serde_derive::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

pub const DEFAULT_RPC_BIND: &str = "0.0.0.0:34964";

fn default_instance() -> u16 {
    1
}

fn default_rpc_bind() -> String {
    DEFAULT_RPC_BIND.to_string()
}

fn default_discovery_timeout_ms() -> u64 {
    1280
}

fn default_queue_depth() -> usize {
    64
}

fn default_strategy_store() -> PathBuf {
    PathBuf::from("strategies.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn zero_token() -> [u8; 64] {
    [0u8; 64]
}

#[derive(Serialize, Deserialize)]
pub struct ControllerSection {
    /// Name of the Ethernet interface facing the RTU segment.
    pub interface: String,
    pub station_name: String,
    pub vendor_id: u16,
    pub device_id: u16,
    #[serde(default = "default_instance")]
    pub instance: u16,
    pub controller_id: u32,
    #[serde(default = "default_rpc_bind")]
    pub rpc_bind: String,
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    #[serde(default = "default_queue_depth")]
    pub command_queue_depth: usize,
    #[serde(default = "default_strategy_store")]
    pub strategy_store: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Serialize, Deserialize, Copy, Clone)]
#[serde(rename_all = "lowercase")]
pub enum DirectionSection {
    Input,
    Output,
    None,
}

impl From<DirectionSection> for SlotDirection {
    fn from(section: DirectionSection) -> SlotDirection {
        match section {
            DirectionSection::Input => SlotDirection::Input,
            DirectionSection::Output => SlotDirection::Output,
            DirectionSection::None => SlotDirection::None,
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct SlotSection {
    pub slot: u16,
    pub subslot: u16,
    pub module_ident: u32,
    pub submodule_ident: u32,
    pub direction: DirectionSection,
    pub data_bytes: u16,
}

#[derive(Serialize, Deserialize)]
pub struct RtuSection {
    pub station_name: String,
    pub ip: Option<Ipv4Addr>,
    pub vendor_id: u16,
    pub device_id: u16,
    pub authority: AuthorityMode,
    #[serde(with = "penstock::encoding::token64", default = "zero_token")]
    pub enrollment_token: [u8; 64],
    pub slots: Vec<SlotSection>,
}

#[derive(Serialize, Deserialize)]
pub struct ControllerConfig {
    pub controller: ControllerSection,
    #[serde(default)]
    pub rtus: Vec<RtuSection>,
}

impl ControllerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> ControllerConfig {
        serdeconv::from_toml_file(path).expect("Error loading controller configuration file")
    }

    /// The sloggers TOML snippet for the configured level.
    pub fn logging_toml(&self) -> String {
        format!(
            "type = \"terminal\"\nlevel = \"{}\"\ndestination = \"stderr\"\n",
            self.controller.log_level
        )
    }

    /// Builds validated registry records from the RTU sections.
    pub fn rtu_records(&self) -> Result<Vec<RtuRecord>, ConfigError> {
        if !valid_station_name(&self.controller.station_name) {
            return Err(ConfigError::InvalidStationName(
                self.controller.station_name.clone(),
            ));
        }

        let mut records = Vec::with_capacity(self.rtus.len());

        for section in &self.rtus {
            let slots: Vec<SlotEntry> = section
                .slots
                .iter()
                .map(|slot| SlotEntry {
                    slot: slot.slot,
                    subslot: slot.subslot,
                    module_ident: slot.module_ident,
                    submodule_ident: slot.submodule_ident,
                    direction: slot.direction.into(),
                    data_bytes: slot.data_bytes,
                })
                .collect();

            let mut record = RtuRecord::new(
                &section.station_name,
                section.vendor_id,
                section.device_id,
                slots,
            )?;

            record.ip = section.ip;
            record.authority = section.authority;
            record.enrollment_token = section.enrollment_token;
            record.controller_id = self.controller.controller_id;

            records.push(record);
        }

        Ok(records)
    }

    /// FrameID pair for the RTU at `index`: output in the 0xC000 range,
    /// input adjacent.
    pub fn frame_ids(index: usize) -> (u16, u16) {
        let output = 0xC000u16 + (index as u16) * 2;
        (output + 1, output)
    }
}
