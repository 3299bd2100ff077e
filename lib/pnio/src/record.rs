//! Vendor-defined acyclic record payloads: identification, configuration
//! sync, user-credential sync and enrollment.
//!
//! Every vendor payload opens with `version(1) flags(1) crc16(2)` — or
//! `magic(4) version(1) op(1) crc16(2)` for enrollment — with the CRC
//! computed over everything after the CRC field. A failed version or CRC
//! gate never releases the AR; the RTU keeps its previous state.

use crate::codec::{self, crc16_ccitt_false};
use crate::error::RecordError;
use penstock::hash;
use serde_derive::{Deserialize, Serialize};

/// Record indices served over the established AR.
pub mod index {
    /// I&M0 identification (read).
    pub const IM0: u16 = 0xAFF0;
    /// Real identification data: the discovered module list (read).
    pub const REAL_IDENT: u16 = 0xE001;
    /// User credentials full sync (write).
    pub const USER_SYNC: u16 = 0xF840;
    /// Device configuration (write).
    pub const DEVICE_CONFIG: u16 = 0xF841;
    /// Sensor configuration (write).
    pub const SENSOR_CONFIG: u16 = 0xF842;
    /// Actuator configuration (write).
    pub const ACTUATOR_CONFIG: u16 = 0xF843;
    /// RTU status and health (read).
    pub const RTU_STATUS: u16 = 0xF844;
    /// Enrollment: bind/unbind/rebind/status (read/write).
    pub const ENROLLMENT: u16 = 0xF845;
}

pub const RECORD_VERSION: u8 = 1;

const VENDOR_HEADER_LEN: usize = 4;

/// Builds the `version flags crc16` header over `body` and returns the
/// complete payload.
fn seal(flags: u8, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(VENDOR_HEADER_LEN + body.len());
    payload.push(RECORD_VERSION);
    payload.push(flags);
    payload.extend_from_slice(&crc16_ccitt_false(body).to_be_bytes());
    payload.extend_from_slice(body);
    payload
}

/// Validates the vendor header and returns the body after the CRC field.
fn open(payload: &[u8]) -> Result<&[u8], RecordError> {
    if payload.len() < VENDOR_HEADER_LEN {
        return Err(RecordError::Malformed("vendor header"));
    }

    let version = payload[0];
    if version != RECORD_VERSION {
        return Err(RecordError::VersionMismatch {
            expected: RECORD_VERSION,
            got: version,
        });
    }

    let stored = u16::from_be_bytes([payload[2], payload[3]]);
    let body = &payload[VENDOR_HEADER_LEN..];
    let computed = crc16_ccitt_false(body);

    if stored != computed {
        return Err(RecordError::ChecksumError {
            expected: computed,
            got: stored,
        });
    }

    Ok(body)
}

// ---------------------------------------------------------------------------
// User sync (0xF840)

pub const MAX_USERS: usize = 16;
pub const USER_RECORD_LEN: usize = 100;
pub const USERNAME_LEN: usize = 32;
pub const PASSWORD_HASH_LEN: usize = 64;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Viewer = 0,
    Operator = 1,
    Engineer = 2,
    Admin = 3,
}

impl UserRole {
    pub fn from_wire(byte: u8) -> Option<UserRole> {
        match byte {
            0 => Some(UserRole::Viewer),
            1 => Some(UserRole::Operator),
            2 => Some(UserRole::Engineer),
            3 => Some(UserRole::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    /// Literal wire hash, `DJB2:%08X:%08X` over the shared salt.
    pub password_hash: String,
    pub role: UserRole,
    pub flags: u8,
}

impl UserRecord {
    pub fn new(username: &str, password: &str, role: UserRole) -> UserRecord {
        UserRecord {
            username: username.to_string(),
            password_hash: hash::credential_hash(password),
            role,
            flags: 0,
        }
    }

    /// Constant-time comparison against a candidate password.
    pub fn verify(&self, password: &str) -> bool {
        hash::constant_time_eq(
            self.password_hash.as_bytes(),
            hash::credential_hash(password).as_bytes(),
        )
    }
}

/// Full-sync payload: the RTU replaces its entire user table atomically.
pub fn build_user_sync(users: &[UserRecord]) -> Result<Vec<u8>, RecordError> {
    if users.len() > MAX_USERS {
        return Err(RecordError::TooManyUsers { count: users.len() });
    }

    let mut body = Vec::with_capacity(4 + users.len() * USER_RECORD_LEN);
    body.push(users.len() as u8);
    body.extend_from_slice(&[0u8; 3]);

    for user in users {
        if user.username.len() > USERNAME_LEN {
            return Err(RecordError::FieldTooLong {
                field: "username",
                max: USERNAME_LEN,
            });
        }
        if user.password_hash.len() > PASSWORD_HASH_LEN {
            return Err(RecordError::FieldTooLong {
                field: "password_hash",
                max: PASSWORD_HASH_LEN,
            });
        }

        let mut record = [0u8; USER_RECORD_LEN];
        record[..user.username.len()].copy_from_slice(user.username.as_bytes());
        record[USERNAME_LEN..USERNAME_LEN + user.password_hash.len()]
            .copy_from_slice(user.password_hash.as_bytes());
        record[96] = user.role as u8;
        record[97] = user.flags;

        body.extend_from_slice(&record);
    }

    Ok(seal(0, &body))
}

pub fn parse_user_sync(payload: &[u8]) -> Result<Vec<UserRecord>, RecordError> {
    let body = open(payload)?;

    if body.len() < 4 {
        return Err(RecordError::Malformed("user sync body"));
    }

    let count = body[0] as usize;
    if count > MAX_USERS {
        return Err(RecordError::TooManyUsers { count });
    }

    if body.len() != 4 + count * USER_RECORD_LEN {
        return Err(RecordError::Malformed("user sync length"));
    }

    let mut users = Vec::with_capacity(count);

    for chunk in body[4..].chunks_exact(USER_RECORD_LEN) {
        let username = trim_fixed(&chunk[..USERNAME_LEN]);
        let password_hash = trim_fixed(&chunk[USERNAME_LEN..USERNAME_LEN + PASSWORD_HASH_LEN]);
        let role = UserRole::from_wire(chunk[96]).ok_or(RecordError::Malformed("user role"))?;

        users.push(UserRecord {
            username,
            password_hash,
            role,
            flags: chunk[97],
        });
    }

    Ok(users)
}

fn trim_fixed(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// The RTU-side effective user table: last successfully received payload
/// wins, rejected payloads leave the prior table intact.
#[derive(Default)]
pub struct UserTable {
    users: Vec<UserRecord>,
}

impl UserTable {
    pub fn new() -> UserTable {
        UserTable { users: Vec::new() }
    }

    pub fn apply_sync(&mut self, payload: &[u8]) -> Result<(), RecordError> {
        self.users = parse_user_sync(payload)?;
        Ok(())
    }

    #[inline]
    pub fn users(&self) -> &[UserRecord] {
        &self.users
    }

    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        self.users
            .iter()
            .find(|user| user.username == username)
            .map_or(false, |user| user.verify(password))
    }
}

// ---------------------------------------------------------------------------
// Device configuration (0xF841)

pub const STATION_NAME_LEN: usize = 32;

const DEVICE_CONFIG_BODY_LEN: usize = 48;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityMode {
    /// Interlocks and control loops run on the RTU without supervision.
    Autonomous = 0,
    /// Setpoints and actuator commands come from the controller.
    Supervised = 1,
}

impl AuthorityMode {
    pub fn from_wire(byte: u8) -> Option<AuthorityMode> {
        match byte {
            0 => Some(AuthorityMode::Autonomous),
            1 => Some(AuthorityMode::Supervised),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    pub station_name: String,
    pub sensor_count: u8,
    pub actuator_count: u8,
    pub authority: AuthorityMode,
    pub watchdog_ms: u32,
    pub config_timestamp: u32,
}

pub fn build_device_config(config: &DeviceConfig) -> Result<Vec<u8>, RecordError> {
    if config.station_name.len() > STATION_NAME_LEN {
        return Err(RecordError::FieldTooLong {
            field: "station_name",
            max: STATION_NAME_LEN,
        });
    }

    let mut body = [0u8; DEVICE_CONFIG_BODY_LEN];
    body[..config.station_name.len()].copy_from_slice(config.station_name.as_bytes());
    body[32] = config.sensor_count;
    body[33] = config.actuator_count;
    body[34] = config.authority as u8;
    body[36..40].copy_from_slice(&config.watchdog_ms.to_be_bytes());
    body[40..44].copy_from_slice(&config.config_timestamp.to_be_bytes());

    Ok(seal(0, &body))
}

pub fn parse_device_config(payload: &[u8]) -> Result<DeviceConfig, RecordError> {
    let body = open(payload)?;

    if body.len() != DEVICE_CONFIG_BODY_LEN {
        return Err(RecordError::Malformed("device config length"));
    }

    Ok(DeviceConfig {
        station_name: trim_fixed(&body[..STATION_NAME_LEN]),
        sensor_count: body[32],
        actuator_count: body[33],
        authority: AuthorityMode::from_wire(body[34])
            .ok_or(RecordError::Malformed("authority mode"))?,
        watchdog_ms: u32::from_be_bytes([body[36], body[37], body[38], body[39]]),
        config_timestamp: u32::from_be_bytes([body[40], body[41], body[42], body[43]]),
    })
}

// ---------------------------------------------------------------------------
// Sensor configuration (0xF842)

const SENSOR_ENTRY_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct SensorConfigEntry {
    pub slot: u16,
    pub subslot: u16,
    pub kind: u8,
    pub flags: u8,
    pub range_lo: f32,
    pub range_hi: f32,
}

pub fn build_sensor_config(entries: &[SensorConfigEntry]) -> Result<Vec<u8>, RecordError> {
    let mut body = Vec::with_capacity(4 + entries.len() * SENSOR_ENTRY_LEN);
    body.push(entries.len() as u8);
    body.extend_from_slice(&[0u8; 3]);

    for entry in entries {
        body.extend_from_slice(&entry.slot.to_be_bytes());
        body.extend_from_slice(&entry.subslot.to_be_bytes());
        body.push(entry.kind);
        body.push(entry.flags);
        body.extend_from_slice(&entry.range_lo.to_bits().to_be_bytes());
        body.extend_from_slice(&entry.range_hi.to_bits().to_be_bytes());
        body.extend_from_slice(&[0u8; 2]);
    }

    Ok(seal(0, &body))
}

pub fn parse_sensor_config(payload: &[u8]) -> Result<Vec<SensorConfigEntry>, RecordError> {
    let body = open(payload)?;

    if body.len() < 4 {
        return Err(RecordError::Malformed("sensor config body"));
    }

    let count = body[0] as usize;
    if body.len() != 4 + count * SENSOR_ENTRY_LEN {
        return Err(RecordError::Malformed("sensor config length"));
    }

    let mut entries = Vec::with_capacity(count);

    for chunk in body[4..].chunks_exact(SENSOR_ENTRY_LEN) {
        entries.push(SensorConfigEntry {
            slot: u16::from_be_bytes([chunk[0], chunk[1]]),
            subslot: u16::from_be_bytes([chunk[2], chunk[3]]),
            kind: chunk[4],
            flags: chunk[5],
            range_lo: f32::from_bits(u32::from_be_bytes([
                chunk[6], chunk[7], chunk[8], chunk[9],
            ])),
            range_hi: f32::from_bits(u32::from_be_bytes([
                chunk[10], chunk[11], chunk[12], chunk[13],
            ])),
        });
    }

    Ok(entries)
}

// ---------------------------------------------------------------------------
// Actuator configuration (0xF843)

const ACTUATOR_ENTRY_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorConfigEntry {
    pub slot: u16,
    pub subslot: u16,
    pub kind: u8,
    pub flags: u8,
    pub default_command: u8,
    pub max_duty: u8,
}

pub fn build_actuator_config(entries: &[ActuatorConfigEntry]) -> Result<Vec<u8>, RecordError> {
    let mut body = Vec::with_capacity(4 + entries.len() * ACTUATOR_ENTRY_LEN);
    body.push(entries.len() as u8);
    body.extend_from_slice(&[0u8; 3]);

    for entry in entries {
        body.extend_from_slice(&entry.slot.to_be_bytes());
        body.extend_from_slice(&entry.subslot.to_be_bytes());
        body.push(entry.kind);
        body.push(entry.flags);
        body.push(entry.default_command);
        body.push(entry.max_duty);
        body.extend_from_slice(&[0u8; 4]);
    }

    Ok(seal(0, &body))
}

pub fn parse_actuator_config(payload: &[u8]) -> Result<Vec<ActuatorConfigEntry>, RecordError> {
    let body = open(payload)?;

    if body.len() < 4 {
        return Err(RecordError::Malformed("actuator config body"));
    }

    let count = body[0] as usize;
    if body.len() != 4 + count * ACTUATOR_ENTRY_LEN {
        return Err(RecordError::Malformed("actuator config length"));
    }

    let mut entries = Vec::with_capacity(count);

    for chunk in body[4..].chunks_exact(ACTUATOR_ENTRY_LEN) {
        entries.push(ActuatorConfigEntry {
            slot: u16::from_be_bytes([chunk[0], chunk[1]]),
            subslot: u16::from_be_bytes([chunk[2], chunk[3]]),
            kind: chunk[4],
            flags: chunk[5],
            default_command: chunk[6],
            max_duty: chunk[7],
        });
    }

    Ok(entries)
}

// ---------------------------------------------------------------------------
// RTU status (0xF844)

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RtuStatus {
    pub state: u8,
    pub active_alarms: u8,
    pub sensor_fault_mask: u16,
    pub uptime_secs: u32,
    pub cycle_count: u32,
    pub firmware: [u8; 4],
}

pub fn parse_rtu_status(payload: &[u8]) -> Result<RtuStatus, RecordError> {
    let body = open(payload)?;

    if body.len() != 16 {
        return Err(RecordError::Malformed("status length"));
    }

    let mut firmware = [0u8; 4];
    firmware.copy_from_slice(&body[12..16]);

    Ok(RtuStatus {
        state: body[0],
        active_alarms: body[1],
        sensor_fault_mask: u16::from_be_bytes([body[2], body[3]]),
        uptime_secs: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
        cycle_count: u32::from_be_bytes([body[8], body[9], body[10], body[11]]),
        firmware,
    })
}

#[cfg(test)]
pub fn build_rtu_status(status: &RtuStatus) -> Vec<u8> {
    let mut body = [0u8; 16];
    body[0] = status.state;
    body[1] = status.active_alarms;
    body[2..4].copy_from_slice(&status.sensor_fault_mask.to_be_bytes());
    body[4..8].copy_from_slice(&status.uptime_secs.to_be_bytes());
    body[8..12].copy_from_slice(&status.cycle_count.to_be_bytes());
    body[12..16].copy_from_slice(&status.firmware);
    seal(0, &body)
}

// ---------------------------------------------------------------------------
// Enrollment (0xF845)

/// "ENRL"
pub const ENROLLMENT_MAGIC: u32 = 0x454E_524C;

pub const ENROLLMENT_TOKEN_LEN: usize = 64;

const ENROLLMENT_HEADER_LEN: usize = 8;
const ENROLLMENT_BODY_LEN: usize = 72;
pub const ENROLLMENT_PAYLOAD_LEN: usize = ENROLLMENT_HEADER_LEN + ENROLLMENT_BODY_LEN;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EnrollmentOp {
    Bind = 1,
    Unbind = 2,
    Rebind = 3,
    Status = 4,
}

impl EnrollmentOp {
    pub fn from_wire(byte: u8) -> Option<EnrollmentOp> {
        match byte {
            1 => Some(EnrollmentOp::Bind),
            2 => Some(EnrollmentOp::Unbind),
            3 => Some(EnrollmentOp::Rebind),
            4 => Some(EnrollmentOp::Status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Enrollment {
    pub op: EnrollmentOp,
    pub token: [u8; ENROLLMENT_TOKEN_LEN],
    pub controller_id: u32,
}

pub fn build_enrollment(enrollment: &Enrollment) -> Vec<u8> {
    let mut body = [0u8; ENROLLMENT_BODY_LEN];
    body[..ENROLLMENT_TOKEN_LEN].copy_from_slice(&enrollment.token);
    body[64..68].copy_from_slice(&enrollment.controller_id.to_be_bytes());

    let mut payload = Vec::with_capacity(ENROLLMENT_PAYLOAD_LEN);
    payload.extend_from_slice(&ENROLLMENT_MAGIC.to_be_bytes());
    payload.push(RECORD_VERSION);
    payload.push(enrollment.op as u8);
    payload.extend_from_slice(&crc16_ccitt_false(&body).to_be_bytes());
    payload.extend_from_slice(&body);
    payload
}

pub fn parse_enrollment(payload: &[u8]) -> Result<Enrollment, RecordError> {
    if payload.len() != ENROLLMENT_PAYLOAD_LEN {
        return Err(RecordError::Malformed("enrollment length"));
    }

    let magic = codec::get_u32(payload, 0).map_err(RecordError::from)?;
    if magic != ENROLLMENT_MAGIC {
        return Err(RecordError::InvalidMagic { got: magic });
    }

    if payload[4] != RECORD_VERSION {
        return Err(RecordError::VersionMismatch {
            expected: RECORD_VERSION,
            got: payload[4],
        });
    }

    let op = EnrollmentOp::from_wire(payload[5]).ok_or(RecordError::Malformed("enrollment op"))?;

    let stored = u16::from_be_bytes([payload[6], payload[7]]);
    let body = &payload[ENROLLMENT_HEADER_LEN..];
    let computed = crc16_ccitt_false(body);

    if stored != computed {
        return Err(RecordError::ChecksumError {
            expected: computed,
            got: stored,
        });
    }

    let mut token = [0u8; ENROLLMENT_TOKEN_LEN];
    token.copy_from_slice(&body[..ENROLLMENT_TOKEN_LEN]);

    Ok(Enrollment {
        op,
        token,
        controller_id: u32::from_be_bytes([body[64], body[65], body[66], body[67]]),
    })
}

// ---------------------------------------------------------------------------
// I&M0 (0xAFF0, read only)

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Im0 {
    pub vendor_id: u16,
    pub order_id: String,
    pub serial: String,
    pub hardware_revision: u16,
    pub software_revision: String,
}

/// Parses the standard I&M0 block (type 0x0020) returned for index 0xAFF0.
pub fn parse_im0(payload: &[u8]) -> Result<Im0, RecordError> {
    if payload.len() < 6 {
        return Err(RecordError::Malformed("IM0 block"));
    }

    let block_type = u16::from_be_bytes([payload[0], payload[1]]);
    if block_type != 0x0020 {
        return Err(RecordError::Malformed("IM0 block type"));
    }

    // type(2) len(2) version(2), then the 54-byte body.
    let body = payload.get(6..60).ok_or(RecordError::Malformed("IM0 length"))?;

    let software_revision = format!(
        "{}{}.{}.{}",
        body[46] as char, body[47], body[48], body[49]
    );

    Ok(Im0 {
        vendor_id: u16::from_be_bytes([body[0], body[1]]),
        order_id: trim_fixed(&body[2..22]).trim_end().to_string(),
        serial: trim_fixed(&body[22..38]).trim_end().to_string(),
        hardware_revision: u16::from_be_bytes([body[44], body[45]]),
        software_revision,
    })
}

// ---------------------------------------------------------------------------
// Real identification (0xE001, read only)

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentSubslot {
    pub subslot: u16,
    pub submodule_ident: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentSlot {
    pub slot: u16,
    pub module_ident: u32,
    pub subslots: Vec<IdentSubslot>,
}

/// Parses the discovered module list.
pub fn parse_real_ident(payload: &[u8]) -> Result<Vec<IdentSlot>, RecordError> {
    let mut offset = 0;

    let api_count = codec::get_u16(payload, offset).map_err(RecordError::from)?;
    offset += 2;

    if api_count != 1 {
        return Err(RecordError::Malformed("API count"));
    }

    offset += 4; // API number

    let slot_count = codec::get_u16(payload, offset).map_err(RecordError::from)? as usize;
    offset += 2;

    let mut slots = Vec::with_capacity(slot_count);

    for _ in 0..slot_count {
        let slot = codec::get_u16(payload, offset).map_err(RecordError::from)?;
        let module_ident = codec::get_u32(payload, offset + 2).map_err(RecordError::from)?;
        let subslot_count =
            codec::get_u16(payload, offset + 6).map_err(RecordError::from)? as usize;
        offset += 8;

        let mut subslots = Vec::with_capacity(subslot_count);

        for _ in 0..subslot_count {
            subslots.push(IdentSubslot {
                subslot: codec::get_u16(payload, offset).map_err(RecordError::from)?,
                submodule_ident: codec::get_u32(payload, offset + 2)
                    .map_err(RecordError::from)?,
            });
            offset += 6;
        }

        slots.push(IdentSlot {
            slot,
            module_ident,
            subslots,
        });
    }

    Ok(slots)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> Vec<UserRecord> {
        vec![
            UserRecord::new("operator1", "pelican-stair", UserRole::Operator),
            UserRecord::new("admin", "mantis-shrimp-9", UserRole::Admin),
        ]
    }

    #[test]
    fn user_sync_round_trip() {
        let payload = build_user_sync(&users()).unwrap();

        // Header + count/reserved + two fixed records.
        assert_eq!(payload.len(), 4 + 4 + 2 * USER_RECORD_LEN);
        assert_eq!(payload[0], RECORD_VERSION);

        let parsed = parse_user_sync(&payload).unwrap();
        assert_eq!(parsed, users());
        assert_eq!(parsed[0].password_hash.len(), 22);
        assert!(parsed[0].password_hash.starts_with("DJB2:"));
    }

    #[test]
    fn user_sync_limit() {
        let many: Vec<UserRecord> = (0..17)
            .map(|i| UserRecord::new(&format!("user{}", i), "pw", UserRole::Viewer))
            .collect();

        assert_eq!(
            build_user_sync(&many).unwrap_err(),
            RecordError::TooManyUsers { count: 17 }
        );

        let sixteen = &many[..16];
        assert!(build_user_sync(sixteen).is_ok());
    }

    #[test]
    fn user_sync_last_write_wins() {
        let mut table = UserTable::new();

        let first = build_user_sync(&users()).unwrap();
        table.apply_sync(&first).unwrap();
        assert_eq!(table.users().len(), 2);

        let second =
            build_user_sync(&[UserRecord::new("solo", "one-password", UserRole::Engineer)])
                .unwrap();
        table.apply_sync(&second).unwrap();
        assert_eq!(table.users().len(), 1);
        assert_eq!(table.users()[0].username, "solo");

        // A corrupted payload leaves the table intact.
        let mut corrupt = build_user_sync(&users()).unwrap();
        corrupt[40] ^= 0x01;
        assert!(matches!(
            table.apply_sync(&corrupt).unwrap_err(),
            RecordError::ChecksumError { .. }
        ));
        assert_eq!(table.users()[0].username, "solo");

        // A version-mismatched payload leaves the table intact.
        let mut wrong_version = build_user_sync(&users()).unwrap();
        wrong_version[0] = 9;
        assert!(matches!(
            table.apply_sync(&wrong_version).unwrap_err(),
            RecordError::VersionMismatch { expected: 1, got: 9 }
        ));
        assert_eq!(table.users()[0].username, "solo");
    }

    #[test]
    fn test_user_authentication() {
        let mut table = UserTable::new();
        table
            .apply_sync(&build_user_sync(&users()).unwrap())
            .unwrap();

        assert!(table.authenticate("operator1", "pelican-stair"));
        assert!(!table.authenticate("operator1", "wrong"));
        assert!(!table.authenticate("ghost", "pelican-stair"));
    }

    fn sample_device_config() -> DeviceConfig {
        DeviceConfig {
            station_name: "rtu-tank-1".to_string(),
            sensor_count: 8,
            actuator_count: 7,
            authority: AuthorityMode::Supervised,
            watchdog_ms: 3000,
            config_timestamp: 0x65A1_B2C3,
        }
    }

    #[test]
    fn device_config_crc_round_trip() {
        let payload = build_device_config(&sample_device_config()).unwrap();

        assert_eq!(payload.len(), 52);

        // The CRC field covers bytes 4..52.
        let crc = u16::from_be_bytes([payload[2], payload[3]]);
        assert_eq!(crc, crc16_ccitt_false(&payload[4..52]));

        let parsed = parse_device_config(&payload).unwrap();
        assert_eq!(parsed, sample_device_config());

        // One flipped bit in byte 40 fails the validator.
        let mut corrupt = payload.clone();
        corrupt[40] ^= 0x10;
        assert!(matches!(
            parse_device_config(&corrupt).unwrap_err(),
            RecordError::ChecksumError { .. }
        ));
    }

    #[test]
    fn test_sensor_config_round_trip() {
        let entries = vec![
            SensorConfigEntry {
                slot: 1,
                subslot: 1,
                kind: 2,
                flags: 0,
                range_lo: 0.0,
                range_hi: 14.0,
            },
            SensorConfigEntry {
                slot: 2,
                subslot: 1,
                kind: 5,
                flags: 1,
                range_lo: -40.0,
                range_hi: 125.0,
            },
        ];

        let payload = build_sensor_config(&entries).unwrap();
        assert_eq!(parse_sensor_config(&payload).unwrap(), entries);
    }

    #[test]
    fn test_actuator_config_round_trip() {
        let entries = vec![ActuatorConfigEntry {
            slot: 3,
            subslot: 1,
            kind: 1,
            flags: 0,
            default_command: 0,
            max_duty: 100,
        }];

        let payload = build_actuator_config(&entries).unwrap();
        assert_eq!(parse_actuator_config(&payload).unwrap(), entries);

        let mut corrupt = payload.clone();
        corrupt[9] ^= 0x80;
        assert!(parse_actuator_config(&corrupt).is_err());
    }

    #[test]
    fn test_rtu_status_round_trip() {
        let status = RtuStatus {
            state: 2,
            active_alarms: 1,
            sensor_fault_mask: 0x0004,
            uptime_secs: 86_400,
            cycle_count: 1_000_000,
            firmware: [1, 4, 2, 0],
        };

        let payload = build_rtu_status(&status);
        assert_eq!(parse_rtu_status(&payload).unwrap(), status);
    }

    fn sample_enrollment() -> Enrollment {
        let mut token = [0u8; ENROLLMENT_TOKEN_LEN];
        let text = b"wtc-enroll-0123456789abcdef0123456789abcdef";
        token[..text.len()].copy_from_slice(text);

        Enrollment {
            op: EnrollmentOp::Bind,
            token,
            controller_id: 0x0001_C0DE,
        }
    }

    #[test]
    fn enrollment_bind_payload() {
        let payload = build_enrollment(&sample_enrollment());

        assert_eq!(payload.len(), 80);
        assert_eq!(&payload[..4], &[0x45, 0x4E, 0x52, 0x4C]); // "ENRL"
        assert_eq!(payload[4], 1);
        assert_eq!(payload[5], EnrollmentOp::Bind as u8);

        // CRC over bytes 8..80.
        let crc = u16::from_be_bytes([payload[6], payload[7]]);
        assert_eq!(crc, crc16_ccitt_false(&payload[8..80]));

        let parsed = parse_enrollment(&payload).unwrap();
        assert_eq!(parsed, sample_enrollment());
        assert_eq!(parsed.controller_id, 0x0001_C0DE);
    }

    #[test]
    fn enrollment_magic_distinct_from_checksum() {
        let payload = build_enrollment(&sample_enrollment());

        // Corrupted magic yields the dedicated error...
        let mut bad_magic = payload.clone();
        bad_magic[0] = 0x45;
        bad_magic[1] = 0x4E;
        bad_magic[2] = 0x52;
        bad_magic[3] = 0x4D; // "ENRM"
        assert!(matches!(
            parse_enrollment(&bad_magic).unwrap_err(),
            RecordError::InvalidMagic { got: 0x454E_524D }
        ));

        // ...distinct from a payload corruption.
        let mut bad_body = payload.clone();
        bad_body[20] ^= 0x01;
        assert!(matches!(
            parse_enrollment(&bad_body).unwrap_err(),
            RecordError::ChecksumError { .. }
        ));
    }

    #[test]
    fn test_enrollment_ops() {
        for &op in &[
            EnrollmentOp::Bind,
            EnrollmentOp::Unbind,
            EnrollmentOp::Rebind,
            EnrollmentOp::Status,
        ] {
            let mut enrollment = sample_enrollment();
            enrollment.op = op;
            let payload = build_enrollment(&enrollment);
            assert_eq!(parse_enrollment(&payload).unwrap().op, op);
        }

        let mut payload = build_enrollment(&sample_enrollment());
        payload[5] = 9;
        assert!(matches!(
            parse_enrollment(&payload).unwrap_err(),
            RecordError::Malformed("enrollment op")
        ));
    }

    #[test]
    fn test_im0_parse() {
        let mut payload = vec![0u8; 60];
        payload[0..2].copy_from_slice(&0x0020u16.to_be_bytes());
        payload[2..4].copy_from_slice(&56u16.to_be_bytes());
        payload[4] = 1;

        let body = &mut payload[6..60];
        body[0..2].copy_from_slice(&0x0272u16.to_be_bytes());
        body[2..12].copy_from_slice(b"WTC-RTU-01");
        body[22..30].copy_from_slice(b"SN001234");
        body[44..46].copy_from_slice(&3u16.to_be_bytes());
        body[46] = b'V';
        body[47] = 1;
        body[48] = 4;
        body[49] = 2;

        let im0 = parse_im0(&payload).unwrap();
        assert_eq!(im0.vendor_id, 0x0272);
        assert_eq!(im0.order_id, "WTC-RTU-01");
        assert_eq!(im0.serial, "SN001234");
        assert_eq!(im0.hardware_revision, 3);
        assert_eq!(im0.software_revision, "V1.4.2");
    }

    #[test]
    fn test_real_ident_parse() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u16.to_be_bytes());
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&2u16.to_be_bytes());

        payload.extend_from_slice(&0u16.to_be_bytes());
        payload.extend_from_slice(&0x0001_0000u32.to_be_bytes());
        payload.extend_from_slice(&1u16.to_be_bytes());
        payload.extend_from_slice(&1u16.to_be_bytes());
        payload.extend_from_slice(&0x0001_0001u32.to_be_bytes());

        payload.extend_from_slice(&1u16.to_be_bytes());
        payload.extend_from_slice(&0x0002_0000u32.to_be_bytes());
        payload.extend_from_slice(&1u16.to_be_bytes());
        payload.extend_from_slice(&1u16.to_be_bytes());
        payload.extend_from_slice(&0x0002_0001u32.to_be_bytes());

        let slots = parse_real_ident(&payload).unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].slot, 0);
        assert_eq!(slots[1].module_ident, 0x0002_0000);
        assert_eq!(slots[1].subslots[0].submodule_ident, 0x0002_0001);

        assert!(parse_real_ident(&payload[..10]).is_err());
    }

    #[test]
    fn test_truncated_vendor_payload() {
        assert!(matches!(
            parse_user_sync(&[1, 0]).unwrap_err(),
            RecordError::Malformed(_)
        ));
    }
}
