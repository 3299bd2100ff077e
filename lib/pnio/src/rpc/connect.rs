//! Request construction and response parsing for the PNIO context
//! management services: Connect, PrmEnd (control), Release, acyclic record
//! read/write, and the ApplicationReady handshake.
//!
//! Blocks are written contiguously with no inter-block padding. UUIDs inside
//! block payloads are always as-stored big-endian; only the RPC header is
//! subject to the strategy's UUID format.

use crate::ar::layout::{
    ExpectedCatalogue, ExpectedSlot, ExpectedSubmodule, IocrLayout, IocrPair, SlotDirection,
};
use crate::codec::Mac;
use crate::error::{CodecError, RpcError};
use crate::rpc::ndr::{NdrRequestHeader, NdrResponseHeader, NDR_HEADER_LEN};
use crate::rpc::strategy::{NdrMode, Strategy, TimingParams};
use crate::rpc::{
    block_type, control, opnum, Block, BlockCursor, BlockWriter, PnioStatus, RpcHeader,
    PTYPE_FAULT, PTYPE_REQUEST, PTYPE_RESPONSE, RPC_HEADER_LEN,
};
use crate::uuid::{Uuid, UuidFormat};

/// LT field of IOCR and alarm CR blocks.
const LT_PROFINET: u16 = 0x8892;

/// InitiatorUDPRTPort value declaring that RT over UDP is not used.
const UDP_RT_PORT_NONE: u16 = 0x8892;

const AR_TYPE_SINGLE: u16 = 0x0001;

/// ARProperties: active AR, parameterization by the CM initiator.
const AR_PROPERTIES: u32 = 0x0000_0131;

const ACTIVITY_TIMEOUT_FACTOR: u16 = 600;

const IOCR_PROPERTIES_RT_CLASS1: u32 = 0x0000_0001;

const FRAME_SEND_OFFSET_UNSPECIFIED: u32 = 0xFFFF_FFFF;

const ALARM_CR_TYPE: u16 = 0x0001;
const LOCAL_ALARM_REFERENCE: u16 = 0x0003;
const MAX_ALARM_DATA_LENGTH: u16 = 200;
const ALARM_TAG_HEADER_HIGH: u16 = 0xC000;
const ALARM_TAG_HEADER_LOW: u16 = 0xA000;

/// Smallest DataLength an IOCR may declare.
const MIN_IOCR_DATA_LENGTH: u16 = 40;

/// PNIO status raised when the RTU has no free AR sessions.
const E_AR_RESOURCES: (u8, u8, u8) = (0xDB, 0x81, 0x63);

/// Everything a Connect request is built from. The catalogue and layouts
/// must already match the strategy's slot scope.
pub struct ConnectParams<'a> {
    pub strategy: Strategy,
    pub timing: TimingParams,
    pub ar_uuid: Uuid,
    pub activity: Uuid,
    pub session_key: u16,
    pub host_mac: Mac,
    pub object: Uuid,
    pub station_name: &'a str,
    pub catalogue: &'a ExpectedCatalogue,
    pub layouts: &'a IocrPair,
    pub sequence: u32,
}

pub fn build_connect_request(params: &ConnectParams) -> Result<Vec<u8>, CodecError> {
    let mut writer = BlockWriter::new();

    write_ar_block(&mut writer, params);
    write_iocr_block(&mut writer, &params.layouts.input, params);
    write_iocr_block(&mut writer, &params.layouts.output, params);
    write_alarm_cr_block(&mut writer, params);
    write_expected_submodules(&mut writer, params.catalogue);

    let blocks = writer.into_bytes();

    assemble_request(
        params.strategy,
        params.object,
        params.activity,
        params.sequence,
        params.strategy.opnum.value(),
        &blocks,
    )
}

fn assemble_request(
    strategy: Strategy,
    object: Uuid,
    activity: Uuid,
    sequence: u32,
    op: u16,
    blocks: &[u8],
) -> Result<Vec<u8>, CodecError> {
    let ndr_len = match strategy.ndr_mode {
        NdrMode::Present => NDR_HEADER_LEN,
        NdrMode::Absent => 0,
    };

    let body_len = ndr_len + blocks.len();
    let mut packet = vec![0u8; RPC_HEADER_LEN + body_len];

    let header = RpcHeader::request(
        object,
        crate::rpc::IFACE_UUID_DEVICE,
        activity,
        sequence,
        op,
        body_len as u16,
    );

    let mut offset = header.write_to(&mut packet, 0, strategy.uuid_format)?;

    if strategy.ndr_mode == NdrMode::Present {
        offset += NdrRequestHeader::for_args(blocks.len() as u32).write_to(&mut packet, offset)?;
    }

    crate::codec::put_bytes(&mut packet, offset, blocks)?;

    Ok(packet)
}

fn write_ar_block(writer: &mut BlockWriter, params: &ConnectParams) {
    let start = writer.begin(block_type::AR_REQ);

    writer.push_u16(AR_TYPE_SINGLE);
    writer.push_uuid(&params.ar_uuid, UuidFormat::AsStored);
    writer.push_u16(params.session_key);
    writer.push_bytes(&params.host_mac.0);
    writer.push_uuid(&params.object, UuidFormat::AsStored);
    writer.push_u32(AR_PROPERTIES);
    writer.push_u16(ACTIVITY_TIMEOUT_FACTOR);
    writer.push_u16(UDP_RT_PORT_NONE);
    writer.push_u16(params.station_name.len() as u16);
    writer.push_bytes(params.station_name.as_bytes());

    writer.end(start);
}

fn write_iocr_block(writer: &mut BlockWriter, layout: &IocrLayout, params: &ConnectParams) {
    let start = writer.begin(block_type::IOCR_REQ);

    writer.push_u16(layout.direction.wire_value());
    writer.push_u16(layout.direction.wire_value());
    writer.push_u16(LT_PROFINET);
    writer.push_u32(IOCR_PROPERTIES_RT_CLASS1);
    writer.push_u16(layout.csdu_len.max(MIN_IOCR_DATA_LENGTH));
    writer.push_u16(layout.frame_id);
    writer.push_u16(params.timing.send_clock_factor);
    writer.push_u16(params.timing.reduction_ratio);
    writer.push_u16(1); // phase
    writer.push_u16(0); // sequence
    writer.push_u32(FRAME_SEND_OFFSET_UNSPECIFIED);
    writer.push_u16(params.timing.watchdog_factor);
    writer.push_u16(params.timing.data_hold_factor);
    writer.push_u16(layout.vlan.tci());
    writer.push_bytes(&[0u8; 6]); // multicast MAC unused for unicast IOCRs

    writer.push_u16(1); // one API
    writer.push_u32(params.catalogue.api);

    writer.push_u16(layout.data.len() as u16);
    for placement in &layout.data {
        writer.push_u16(placement.slot);
        writer.push_u16(placement.subslot);
        writer.push_u16(placement.data_offset);
    }

    writer.push_u16(layout.status.len() as u16);
    for status in &layout.status {
        writer.push_u16(status.slot);
        writer.push_u16(status.subslot);
        writer.push_u16(status.offset);
    }

    writer.end(start);
}

fn write_alarm_cr_block(writer: &mut BlockWriter, params: &ConnectParams) {
    let start = writer.begin(block_type::ALARM_CR_REQ);

    writer.push_u16(ALARM_CR_TYPE);
    writer.push_u16(LT_PROFINET);
    writer.push_u32(0); // AlarmCRProperties: RTA class 1, priority from tag
    writer.push_u16(params.timing.alarm_timeout_factor);
    writer.push_u16(params.timing.alarm_retries);
    writer.push_u16(LOCAL_ALARM_REFERENCE);
    writer.push_u16(MAX_ALARM_DATA_LENGTH);
    writer.push_u16(ALARM_TAG_HEADER_HIGH);
    writer.push_u16(ALARM_TAG_HEADER_LOW);

    writer.end(start);
}

fn submodule_properties(direction: SlotDirection) -> u16 {
    match direction {
        SlotDirection::None => 0x0000,
        SlotDirection::Input => 0x0001,
        SlotDirection::Output => 0x0002,
    }
}

fn data_description_type(direction: SlotDirection) -> u16 {
    match direction {
        // No-IO submodules are described on the input side.
        SlotDirection::Input | SlotDirection::None => 1,
        SlotDirection::Output => 2,
    }
}

/// The nested expected-submodule structure: API, then slots, then subslots,
/// each subslot closing with its data description.
fn write_expected_submodules(writer: &mut BlockWriter, catalogue: &ExpectedCatalogue) {
    let start = writer.begin(block_type::EXPECTED_SUBMODULE_REQ);

    writer.push_u16(1); // one API
    writer.push_u32(catalogue.api);
    writer.push_u16(catalogue.slots.len() as u16);

    for slot in &catalogue.slots {
        writer.push_u16(slot.slot);
        writer.push_u32(slot.module_ident);
        writer.push_u16(0); // module properties
        writer.push_u16(slot.submodules.len() as u16);

        for submodule in &slot.submodules {
            writer.push_u16(submodule.subslot);
            writer.push_u32(submodule.submodule_ident);
            writer.push_u16(submodule_properties(submodule.direction));
            writer.push_u16(data_description_type(submodule.direction));
            writer.push_u16(submodule.data_length);
            writer.push_u8(1); // LengthIOCS
            writer.push_u8(1); // LengthIOPS
        }
    }

    writer.end(start);
}

/// A Connect request decoded back into its parameters. The RTU simulator
/// and the round-trip property tests consume this.
#[derive(Debug)]
pub struct ParsedConnect {
    pub header: RpcHeader,
    pub ndr: Option<NdrRequestHeader>,
    pub ar_uuid: Uuid,
    pub session_key: u16,
    pub host_mac: Mac,
    pub station_name: String,
    pub catalogue: ExpectedCatalogue,
    pub input_frame_id: Option<u16>,
    pub output_frame_id: Option<u16>,
    pub send_clock_factor: u16,
    pub reduction_ratio: u16,
}

pub fn parse_connect_request(bytes: &[u8]) -> Result<ParsedConnect, RpcError> {
    let (header, mut offset) = RpcHeader::read_from(bytes, 0)?;

    if header.ptype != PTYPE_REQUEST {
        return Err(RpcError::MalformedResponse("connect request packet type"));
    }

    // The NDR wrapper is distinguishable from a bare ARBlockReq: a block
    // sequence opens with the big-endian type 0x0101.
    let ndr = if crate::codec::get_u16(bytes, offset)? == block_type::AR_REQ {
        None
    } else {
        let (parsed, consumed) = NdrRequestHeader::read_from(bytes, offset)?;
        offset += consumed;
        Some(parsed)
    };

    let mut ar_uuid = None;
    let mut session_key = 0;
    let mut host_mac = Mac::default();
    let mut station_name = String::new();
    let mut catalogue = None;
    let mut input_frame_id = None;
    let mut output_frame_id = None;
    let mut send_clock_factor = 0;
    let mut reduction_ratio = 0;

    let mut cursor = BlockCursor::new(&bytes[offset..]);

    while let Some(block) = next_block(&mut cursor)? {
        // Skip the two version octets.
        let body = block
            .payload
            .get(2..)
            .ok_or(RpcError::TruncatedResponse)?;

        match block.block_type {
            block_type::AR_REQ => {
                let uuid = Uuid::read_from(body, 2, UuidFormat::AsStored)?;
                session_key = crate::codec::get_u16(body, 18)?;
                host_mac = Mac(read_mac(body, 20)?);
                let name_len = crate::codec::get_u16(body, 50)? as usize;
                let name = crate::codec::get_bytes(body, 52, name_len)?;
                station_name = String::from_utf8_lossy(name).into_owned();
                ar_uuid = Some(uuid);
            }
            block_type::IOCR_REQ => {
                let iocr_type = crate::codec::get_u16(body, 0)?;
                let frame_id = crate::codec::get_u16(body, 12)?;
                send_clock_factor = crate::codec::get_u16(body, 14)?;
                reduction_ratio = crate::codec::get_u16(body, 16)?;

                match iocr_type {
                    1 => input_frame_id = Some(frame_id),
                    2 => output_frame_id = Some(frame_id),
                    _ => return Err(RpcError::MalformedResponse("IOCR type")),
                }
            }
            block_type::EXPECTED_SUBMODULE_REQ => {
                catalogue = Some(parse_expected_submodules(body)?);
            }
            _ => (),
        }
    }

    Ok(ParsedConnect {
        header,
        ndr,
        ar_uuid: ar_uuid.ok_or(RpcError::MalformedResponse("missing AR block"))?,
        session_key,
        host_mac,
        station_name,
        catalogue: catalogue.ok_or(RpcError::MalformedResponse("missing expected submodules"))?,
        input_frame_id,
        output_frame_id,
        send_clock_factor,
        reduction_ratio,
    })
}

fn parse_expected_submodules(body: &[u8]) -> Result<ExpectedCatalogue, RpcError> {
    let mut offset = 0;

    let api_count = crate::codec::get_u16(body, offset)?;
    offset += 2;

    if api_count != 1 {
        return Err(RpcError::MalformedResponse("API count"));
    }

    let api = crate::codec::get_u32(body, offset)?;
    offset += 4;

    let slot_count = crate::codec::get_u16(body, offset)? as usize;
    offset += 2;

    let mut slots = Vec::with_capacity(slot_count);

    for _ in 0..slot_count {
        let slot = crate::codec::get_u16(body, offset)?;
        let module_ident = crate::codec::get_u32(body, offset + 2)?;
        let submodule_count = crate::codec::get_u16(body, offset + 8)? as usize;
        offset += 10;

        let mut submodules = Vec::with_capacity(submodule_count);

        for _ in 0..submodule_count {
            let subslot = crate::codec::get_u16(body, offset)?;
            let submodule_ident = crate::codec::get_u32(body, offset + 2)?;
            let properties = crate::codec::get_u16(body, offset + 6)?;
            let data_length = crate::codec::get_u16(body, offset + 10)?;
            offset += 14;

            let direction = match properties & 0x0003 {
                0x0001 => SlotDirection::Input,
                0x0002 => SlotDirection::Output,
                _ => SlotDirection::None,
            };

            submodules.push(ExpectedSubmodule {
                subslot,
                submodule_ident,
                direction,
                data_length,
            });
        }

        slots.push(ExpectedSlot {
            slot,
            module_ident,
            submodules,
        });
    }

    Ok(ExpectedCatalogue { api, slots })
}

/// One differing submodule reported by the RTU.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffEntry {
    pub api: u32,
    pub slot: u16,
    pub subslot: u16,
    pub module_state: u16,
    pub submodule_state: u16,
}

/// The ModuleDiffBlock of a Connect response.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModuleDiff {
    pub entries: Vec<DiffEntry>,
}

impl ModuleDiff {
    /// Diffs confined to the Device Access Point slot are informational and
    /// do not block parameterization.
    pub fn dap_only(&self) -> bool {
        self.entries.iter().all(|entry| entry.slot == 0)
    }
}

/// The distilled outcome of a successful Connect.
#[derive(Debug, Clone)]
pub struct ConnectResponse {
    pub ar_uuid: Uuid,
    pub session_key: u16,
    pub responder_mac: Mac,
    pub responder_port: u16,
    pub input_frame_id: Option<u16>,
    pub output_frame_id: Option<u16>,
    pub module_diff: Option<ModuleDiff>,
}

pub fn parse_connect_response(bytes: &[u8]) -> Result<ConnectResponse, RpcError> {
    let body = response_body(bytes)?;

    let mut ar_uuid = None;
    let mut session_key = 0;
    let mut responder_mac = Mac::default();
    let mut responder_port = 0;
    let mut input_frame_id = None;
    let mut output_frame_id = None;
    let mut module_diff = None;

    let mut cursor = BlockCursor::new(body);

    while let Some(block) = next_block(&mut cursor)? {
        let payload = block
            .payload
            .get(2..)
            .ok_or(RpcError::TruncatedResponse)?;

        match block.block_type {
            block_type::AR_RES => {
                ar_uuid = Some(Uuid::read_from(payload, 2, UuidFormat::AsStored)?);
                session_key = crate::codec::get_u16(payload, 18)?;
                responder_mac = Mac(read_mac(payload, 20)?);
                responder_port = crate::codec::get_u16(payload, 26)?;
            }
            block_type::IOCR_RES => {
                let iocr_type = crate::codec::get_u16(payload, 0)?;
                let frame_id = crate::codec::get_u16(payload, 4)?;

                match iocr_type {
                    1 => input_frame_id = Some(frame_id),
                    2 => output_frame_id = Some(frame_id),
                    _ => return Err(RpcError::MalformedResponse("IOCR type")),
                }
            }
            block_type::MODULE_DIFF => {
                module_diff = Some(parse_module_diff(payload)?);
            }
            block_type::ALARM_CR_RES => (),
            _ => (),
        }
    }

    Ok(ConnectResponse {
        ar_uuid: ar_uuid.ok_or(RpcError::MalformedResponse("missing AR block"))?,
        session_key,
        responder_mac,
        responder_port,
        input_frame_id,
        output_frame_id,
        module_diff,
    })
}

fn parse_module_diff(payload: &[u8]) -> Result<ModuleDiff, RpcError> {
    let mut offset = 0;
    let mut entries = Vec::new();

    let api_count = crate::codec::get_u16(payload, offset)? as usize;
    offset += 2;

    for _ in 0..api_count {
        let api = crate::codec::get_u32(payload, offset)?;
        let module_count = crate::codec::get_u16(payload, offset + 4)? as usize;
        offset += 6;

        for _ in 0..module_count {
            let slot = crate::codec::get_u16(payload, offset)?;
            let module_state = crate::codec::get_u16(payload, offset + 6)?;
            let submodule_count = crate::codec::get_u16(payload, offset + 8)? as usize;
            offset += 10;

            if submodule_count == 0 {
                entries.push(DiffEntry {
                    api,
                    slot,
                    subslot: 0,
                    module_state,
                    submodule_state: 0,
                });
            }

            for _ in 0..submodule_count {
                let subslot = crate::codec::get_u16(payload, offset)?;
                let submodule_state = crate::codec::get_u16(payload, offset + 6)?;
                offset += 8;

                entries.push(DiffEntry {
                    api,
                    slot,
                    subslot,
                    module_state,
                    submodule_state,
                });
            }
        }
    }

    Ok(ModuleDiff { entries })
}

/// Control request payload shared by PrmEnd, Release and the
/// ApplicationReady response: reserved, ARUUID, session key, reserved,
/// command, properties.
fn write_control_payload(writer: &mut BlockWriter, ar_uuid: &Uuid, session_key: u16, command: u16) {
    writer.push_u16(0);
    writer.push_uuid(ar_uuid, UuidFormat::AsStored);
    writer.push_u16(session_key);
    writer.push_u16(0);
    writer.push_u16(command);
    writer.push_u16(0);
}

pub struct ControlIds {
    pub object: Uuid,
    pub activity: Uuid,
    pub ar_uuid: Uuid,
    pub session_key: u16,
    pub sequence: u32,
}

pub fn build_prm_end_request(
    strategy: Strategy,
    ids: &ControlIds,
) -> Result<Vec<u8>, CodecError> {
    let mut writer = BlockWriter::new();

    let start = writer.begin(block_type::IOD_CONTROL_REQ);
    write_control_payload(&mut writer, &ids.ar_uuid, ids.session_key, control::PRM_END);
    writer.end(start);

    assemble_request(
        strategy,
        ids.object,
        ids.activity,
        ids.sequence,
        opnum::CONTROL,
        &writer.into_bytes(),
    )
}

pub fn build_release_request(strategy: Strategy, ids: &ControlIds) -> Result<Vec<u8>, CodecError> {
    let mut writer = BlockWriter::new();

    let start = writer.begin(block_type::RELEASE_REQ);
    write_control_payload(&mut writer, &ids.ar_uuid, ids.session_key, control::RELEASE);
    writer.end(start);

    assemble_request(
        strategy,
        ids.object,
        ids.activity,
        ids.sequence,
        opnum::RELEASE,
        &writer.into_bytes(),
    )
}

#[derive(Debug, Clone)]
pub struct ControlResponse {
    pub ar_uuid: Uuid,
    pub session_key: u16,
    pub command: u16,
}

/// Parses an IODControlRes (PrmEnd) or ReleaseBlockRes and checks the DONE
/// bit.
pub fn parse_control_response(bytes: &[u8], expected_type: u16) -> Result<ControlResponse, RpcError> {
    let body = response_body(bytes)?;

    let mut cursor = BlockCursor::new(body);

    while let Some(block) = next_block(&mut cursor)? {
        if block.block_type != expected_type {
            continue;
        }

        let payload = block
            .payload
            .get(2..)
            .ok_or(RpcError::TruncatedResponse)?;

        let ar_uuid = Uuid::read_from(payload, 2, UuidFormat::AsStored)?;
        let session_key = crate::codec::get_u16(payload, 18)?;
        let command = crate::codec::get_u16(payload, 22)?;

        if command & control::DONE == 0 {
            return Err(RpcError::MalformedResponse("control response without DONE"));
        }

        return Ok(ControlResponse {
            ar_uuid,
            session_key,
            command,
        });
    }

    Err(RpcError::MalformedResponse("missing control block"))
}

const RECORD_HEADER_PADDING: usize = 24;

fn write_record_header(
    writer: &mut BlockWriter,
    btype: u16,
    ids: &ControlIds,
    api: u32,
    slot: u16,
    subslot: u16,
    index: u16,
    data_length: u32,
) {
    let start = writer.begin(btype);

    writer.push_u16(ids.sequence as u16);
    writer.push_uuid(&ids.ar_uuid, UuidFormat::AsStored);
    writer.push_u32(api);
    writer.push_u16(slot);
    writer.push_u16(subslot);
    writer.push_u16(0);
    writer.push_u16(index);
    writer.push_u32(data_length);
    writer.push_bytes(&[0u8; RECORD_HEADER_PADDING]);

    writer.end(start);
}

pub fn build_read_request(
    strategy: Strategy,
    ids: &ControlIds,
    api: u32,
    slot: u16,
    subslot: u16,
    index: u16,
    max_length: u32,
) -> Result<Vec<u8>, CodecError> {
    let mut writer = BlockWriter::new();
    write_record_header(
        &mut writer,
        block_type::IOD_READ_REQ,
        ids,
        api,
        slot,
        subslot,
        index,
        max_length,
    );

    assemble_request(
        strategy,
        ids.object,
        ids.activity,
        ids.sequence,
        opnum::READ,
        &writer.into_bytes(),
    )
}

pub fn build_write_request(
    strategy: Strategy,
    ids: &ControlIds,
    api: u32,
    slot: u16,
    subslot: u16,
    index: u16,
    data: &[u8],
) -> Result<Vec<u8>, CodecError> {
    let mut writer = BlockWriter::new();
    write_record_header(
        &mut writer,
        block_type::IOD_WRITE_REQ,
        ids,
        api,
        slot,
        subslot,
        index,
        data.len() as u32,
    );

    // Record data follows the header block contiguously.
    writer.push_bytes(data);

    assemble_request(
        strategy,
        ids.object,
        ids.activity,
        ids.sequence,
        opnum::WRITE,
        &writer.into_bytes(),
    )
}

/// Extracts the record data from an IODReadRes packet.
pub fn parse_read_response(bytes: &[u8]) -> Result<Vec<u8>, RpcError> {
    let body = response_body(bytes)?;

    let mut cursor = BlockCursor::new(body);

    if let Some(block) = next_block(&mut cursor)? {
        if block.block_type != block_type::IOD_READ_RES {
            return Err(RpcError::MalformedResponse("read response block type"));
        }

        let payload = block
            .payload
            .get(2..)
            .ok_or(RpcError::TruncatedResponse)?;

        let data_length = crate::codec::get_u32(payload, 30)? as usize;

        // The record data trails the block.
        let block_total = 4 + block.payload.len();
        let data = body
            .get(block_total..block_total + data_length)
            .ok_or(RpcError::TruncatedResponse)?;

        return Ok(data.to_vec());
    }

    Err(RpcError::MalformedResponse("empty read response"))
}

/// Validates an IODWriteRes packet.
pub fn parse_write_response(bytes: &[u8]) -> Result<(), RpcError> {
    let body = response_body(bytes)?;

    let mut cursor = BlockCursor::new(body);

    if let Some(block) = next_block(&mut cursor)? {
        if block.block_type != block_type::IOD_WRITE_RES {
            return Err(RpcError::MalformedResponse("write response block type"));
        }

        return Ok(());
    }

    Err(RpcError::MalformedResponse("empty write response"))
}

/// An ApplicationReady indication received from the RTU.
#[derive(Debug, Clone)]
pub struct ApplicationReadyInd {
    pub header: RpcHeader,
    pub ar_uuid: Uuid,
    pub session_key: u16,
}

pub fn parse_application_ready(bytes: &[u8]) -> Result<ApplicationReadyInd, RpcError> {
    let (header, mut offset) = RpcHeader::read_from(bytes, 0)?;

    if header.ptype != PTYPE_REQUEST {
        return Err(RpcError::MalformedResponse("indication packet type"));
    }

    if crate::codec::get_u16(bytes, offset)? != block_type::APP_READY_REQ {
        let (_, consumed) = NdrRequestHeader::read_from(bytes, offset)?;
        offset += consumed;
    }

    let mut cursor = BlockCursor::new(&bytes[offset..]);

    while let Some(block) = next_block(&mut cursor)? {
        if block.block_type != block_type::APP_READY_REQ {
            continue;
        }

        let payload = block
            .payload
            .get(2..)
            .ok_or(RpcError::TruncatedResponse)?;

        let ar_uuid = Uuid::read_from(payload, 2, UuidFormat::AsStored)?;
        let session_key = crate::codec::get_u16(payload, 18)?;
        let command = crate::codec::get_u16(payload, 22)?;

        if command & control::APPLICATION_READY == 0 {
            return Err(RpcError::MalformedResponse("indication command"));
        }

        return Ok(ApplicationReadyInd {
            header,
            ar_uuid,
            session_key,
        });
    }

    Err(RpcError::MalformedResponse("missing ApplicationReady block"))
}

/// The controller's answer to an ApplicationReady indication: block type
/// IOCControlRes (0x8112), ControlCommand DONE, mandatory response NDR, and
/// the identifiers of the incoming request echoed back.
pub fn build_application_ready_response(ind: &ApplicationReadyInd) -> Result<Vec<u8>, CodecError> {
    let mut writer = BlockWriter::new();

    let start = writer.begin(block_type::APP_READY_RES);
    write_control_payload(&mut writer, &ind.ar_uuid, ind.session_key, control::DONE);
    writer.end(start);

    let blocks = writer.into_bytes();
    let body_len = NDR_HEADER_LEN + blocks.len();

    let header = RpcHeader::response_to(&ind.header, body_len as u16);

    let mut packet = vec![0u8; RPC_HEADER_LEN + body_len];

    let mut offset = header.write_to(&mut packet, 0, UuidFormat::SwapFields)?;
    offset += NdrResponseHeader::ok(blocks.len() as u32).write_to(&mut packet, offset)?;
    crate::codec::put_bytes(&mut packet, offset, &blocks)?;

    Ok(packet)
}

/// Validates the RPC + NDR envelope of a response and returns the block
/// section. Fault packets and non-OK PNIO statuses become errors here.
fn response_body(bytes: &[u8]) -> Result<&[u8], RpcError> {
    let (header, mut offset) = RpcHeader::read_from(bytes, 0).map_err(map_truncated)?;

    match header.ptype {
        PTYPE_RESPONSE => (),
        PTYPE_FAULT => {
            let status = PnioStatus::from_word(crate::codec::get_u32(bytes, offset).map_err(map_truncated)?);
            return Err(classify_status(status));
        }
        _ => return Err(RpcError::MalformedResponse("packet type")),
    }

    let (ndr, consumed) = NdrResponseHeader::read_from(bytes, offset).map_err(map_truncated)?;
    offset += consumed;

    if !ndr.status.is_ok() {
        return Err(classify_status(ndr.status));
    }

    bytes.get(offset..).ok_or(RpcError::TruncatedResponse)
}

fn classify_status(status: PnioStatus) -> RpcError {
    if (status.code, status.decode, status.code_1) == E_AR_RESOURCES {
        RpcError::SessionExhausted
    } else {
        RpcError::UnexpectedPnioError(status)
    }
}

fn next_block<'a>(cursor: &mut BlockCursor<'a>) -> Result<Option<Block<'a>>, RpcError> {
    cursor.next_block().map_err(map_truncated)
}

fn map_truncated(_: CodecError) -> RpcError {
    RpcError::TruncatedResponse
}

fn read_mac(buf: &[u8], offset: usize) -> Result<[u8; 6], CodecError> {
    let mut mac = [0u8; 6];
    mac.copy_from_slice(crate::codec::get_bytes(buf, offset, 6)?);
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ar::layout::{build_layouts, ExpectedCatalogue, SlotEntry};
    use crate::rpc::strategy::{ConnectOpnum, SlotScope, STRATEGIES};
    use crate::rpc::{object_uuid, DREP_LITTLE_ENDIAN};

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
            SlotEntry {
                slot: 2,
                subslot: 1,
                module_ident: 0x0003_0000,
                submodule_ident: 0x0003_0001,
                direction: SlotDirection::Output,
                data_bytes: 2,
            },
        ]
    }

    fn params_for<'a>(
        strategy: Strategy,
        catalogue: &'a ExpectedCatalogue,
        layouts: &'a IocrPair,
    ) -> ConnectParams<'a> {
        ConnectParams {
            strategy,
            timing: strategy.timing_params(),
            ar_uuid: Uuid::from_bytes([0x11; 16]),
            activity: Uuid::from_bytes([0x22; 16]),
            session_key: 0x0101,
            host_mac: Mac([2, 0, 0, 0, 0, 9]),
            object: object_uuid(1, 0x0C05, 0x0272),
            station_name: "headworks-ctl",
            catalogue,
            layouts,
            sequence: 5,
        }
    }

    #[test]
    fn connect_request_round_trip_all_strategies() {
        let full = ExpectedCatalogue::from_entries(0, &entries()).unwrap();

        for strategy in STRATEGIES.iter() {
            let catalogue = match strategy.slot_scope {
                SlotScope::Full => full.clone(),
                SlotScope::DapOnly => full.dap_only(),
            };
            let layouts = build_layouts(&catalogue, 0xC001, 0xC000).unwrap();

            let request =
                build_connect_request(&params_for(*strategy, &catalogue, &layouts)).unwrap();
            let parsed = parse_connect_request(&request).unwrap();

            assert_eq!(parsed.catalogue, catalogue);
            assert_eq!(parsed.ar_uuid, Uuid::from_bytes([0x11; 16]));
            assert_eq!(parsed.header.activity, Uuid::from_bytes([0x22; 16]));
            assert_eq!(parsed.session_key, 0x0101);
            assert_eq!(parsed.station_name, "headworks-ctl");
            assert_eq!(parsed.input_frame_id, Some(0xC001));
            assert_eq!(parsed.output_frame_id, Some(0xC000));
            assert_eq!(parsed.header.opnum, strategy.opnum.value());
            assert_eq!(parsed.ndr.is_some(), strategy.ndr_mode == NdrMode::Present);
        }
    }

    #[test]
    fn test_connect_request_timing_fields() {
        let catalogue = ExpectedCatalogue::from_entries(0, &entries()).unwrap();
        let layouts = build_layouts(&catalogue, 0xC001, 0xC000).unwrap();
        let strategy = STRATEGIES[0];

        let request = build_connect_request(&params_for(strategy, &catalogue, &layouts)).unwrap();
        let parsed = parse_connect_request(&request).unwrap();

        assert_eq!(parsed.send_clock_factor, 64);
        assert_eq!(parsed.reduction_ratio, 128);
    }

    #[test]
    fn test_ndr_args_length_matches_blocks() {
        let catalogue = ExpectedCatalogue::from_entries(0, &entries()).unwrap();
        let layouts = build_layouts(&catalogue, 0xC001, 0xC000).unwrap();
        let strategy = STRATEGIES[0];

        let request = build_connect_request(&params_for(strategy, &catalogue, &layouts)).unwrap();
        let parsed = parse_connect_request(&request).unwrap();

        let ndr = parsed.ndr.unwrap();
        let blocks_len = request.len() - RPC_HEADER_LEN - NDR_HEADER_LEN;

        assert_eq!(ndr.args_length as usize, blocks_len);
        assert_eq!(ndr.max_count, ndr.args_length);
        assert_eq!(ndr.offset, 0);
        assert_eq!(ndr.actual_count, ndr.args_length);
    }

    #[test]
    fn test_write_opnum_variant() {
        let catalogue = ExpectedCatalogue::from_entries(0, &entries()).unwrap();
        let layouts = build_layouts(&catalogue, 0xC001, 0xC000).unwrap();

        let strategy = STRATEGIES
            .iter()
            .find(|s| s.opnum == ConnectOpnum::Write)
            .copied()
            .unwrap();

        let request = build_connect_request(&params_for(strategy, &catalogue, &layouts)).unwrap();
        let parsed = parse_connect_request(&request).unwrap();

        assert_eq!(parsed.header.opnum, 3);
    }

    fn ok_response(blocks: Vec<u8>) -> Vec<u8> {
        let body_len = NDR_HEADER_LEN + blocks.len();
        let header = RpcHeader {
            ptype: PTYPE_RESPONSE,
            flags1: 0,
            drep: [DREP_LITTLE_ENDIAN, 0, 0],
            object: Uuid::NIL,
            interface: crate::rpc::IFACE_UUID_DEVICE,
            activity: Uuid::from_bytes([0x22; 16]),
            server_boot: 0,
            interface_version: 1,
            sequence: 5,
            opnum: 0,
            body_len: body_len as u16,
            fragment_num: 0,
        };

        let mut packet = vec![0u8; RPC_HEADER_LEN + body_len];
        let mut offset = header
            .write_to(&mut packet, 0, UuidFormat::SwapFields)
            .unwrap();
        offset += NdrResponseHeader::ok(blocks.len() as u32)
            .write_to(&mut packet, offset)
            .unwrap();
        crate::codec::put_bytes(&mut packet, offset, &blocks).unwrap();
        packet
    }

    fn connect_response_blocks(diff: Option<&[u8]>) -> Vec<u8> {
        let mut writer = BlockWriter::new();

        let start = writer.begin(block_type::AR_RES);
        writer.push_u16(AR_TYPE_SINGLE);
        writer.push_uuid(&Uuid::from_bytes([0x11; 16]), UuidFormat::AsStored);
        writer.push_u16(0x0101);
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

        if let Some(diff_payload) = diff {
            let start = writer.begin(block_type::MODULE_DIFF);
            writer.push_bytes(diff_payload);
            writer.end(start);
        }

        writer.into_bytes()
    }

    #[test]
    fn test_parse_connect_response() {
        let packet = ok_response(connect_response_blocks(None));
        let response = parse_connect_response(&packet).unwrap();

        assert_eq!(response.ar_uuid, Uuid::from_bytes([0x11; 16]));
        assert_eq!(response.session_key, 0x0101);
        assert_eq!(response.responder_mac, Mac([0, 0x11, 0x22, 0x33, 0x44, 0x55]));
        assert_eq!(response.responder_port, 0x8892);
        assert_eq!(response.input_frame_id, Some(0xC001));
        assert_eq!(response.output_frame_id, Some(0xC000));
        assert!(response.module_diff.is_none());
    }

    fn diff_payload(slot: u16) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1u16.to_be_bytes()); // one API
        payload.extend_from_slice(&0u32.to_be_bytes());
        payload.extend_from_slice(&1u16.to_be_bytes()); // one module
        payload.extend_from_slice(&slot.to_be_bytes());
        payload.extend_from_slice(&0x0002_0000u32.to_be_bytes());
        payload.extend_from_slice(&1u16.to_be_bytes()); // module state
        payload.extend_from_slice(&1u16.to_be_bytes()); // one submodule
        payload.extend_from_slice(&1u16.to_be_bytes()); // subslot
        payload.extend_from_slice(&0x0002_0001u32.to_be_bytes());
        payload.extend_from_slice(&2u16.to_be_bytes()); // submodule state
        payload
    }

    #[test]
    fn test_parse_module_diff_classification() {
        let dap = diff_payload(0);
        let packet = ok_response(connect_response_blocks(Some(&dap)));
        let response = parse_connect_response(&packet).unwrap();
        assert!(response.module_diff.unwrap().dap_only());

        let app = diff_payload(2);
        let packet = ok_response(connect_response_blocks(Some(&app)));
        let response = parse_connect_response(&packet).unwrap();
        let diff = response.module_diff.unwrap();
        assert!(!diff.dap_only());
        assert_eq!(diff.entries[0].slot, 2);
        assert_eq!(diff.entries[0].submodule_state, 2);
    }

    #[test]
    fn test_error_status_classification() {
        let mut packet = ok_response(Vec::new());

        // Overwrite the NDR status word: AR resources exhausted.
        let word = PnioStatus {
            code: 0xDB,
            decode: 0x81,
            code_1: 0x63,
            code_2: 0x01,
        }
        .to_word();
        packet[RPC_HEADER_LEN..RPC_HEADER_LEN + 4].copy_from_slice(&word.to_le_bytes());

        assert_eq!(
            parse_connect_response(&packet).unwrap_err(),
            RpcError::SessionExhausted
        );

        let word = PnioStatus {
            code: 0xDB,
            decode: 0x81,
            code_1: 0x3D,
            code_2: 0x02,
        }
        .to_word();
        packet[RPC_HEADER_LEN..RPC_HEADER_LEN + 4].copy_from_slice(&word.to_le_bytes());

        assert!(matches!(
            parse_connect_response(&packet).unwrap_err(),
            RpcError::UnexpectedPnioError(_)
        ));
    }

    #[test]
    fn test_truncated_response() {
        let packet = ok_response(connect_response_blocks(None));

        assert_eq!(
            parse_connect_response(&packet[..40]).unwrap_err(),
            RpcError::TruncatedResponse
        );
        assert_eq!(
            parse_connect_response(&packet[..packet.len() - 3]).unwrap_err(),
            RpcError::TruncatedResponse
        );
    }

    fn control_ids() -> ControlIds {
        ControlIds {
            object: object_uuid(1, 0x0C05, 0x0272),
            activity: Uuid::from_bytes([0x22; 16]),
            ar_uuid: Uuid::from_bytes([0x11; 16]),
            session_key: 0x0101,
            sequence: 6,
        }
    }

    #[test]
    fn test_prm_end_request_layout() {
        let request = build_prm_end_request(STRATEGIES[0], &control_ids()).unwrap();

        let (header, _) = RpcHeader::read_from(&request, 0).unwrap();
        assert_eq!(header.opnum, opnum::CONTROL);

        let mut cursor = BlockCursor::new(&request[RPC_HEADER_LEN + NDR_HEADER_LEN..]);
        let block = cursor.next_block().unwrap().unwrap();
        assert_eq!(block.block_type, block_type::IOD_CONTROL_REQ);

        // Command PrmEnd at payload offset 24 (version + reserved + uuid +
        // key + reserved).
        assert_eq!(
            u16::from_be_bytes([block.payload[24], block.payload[25]]),
            control::PRM_END
        );
    }

    #[test]
    fn test_control_response_requires_done() {
        let mut writer = BlockWriter::new();
        let start = writer.begin(block_type::IOD_CONTROL_RES);
        write_control_payload(
            &mut writer,
            &Uuid::from_bytes([0x11; 16]),
            0x0101,
            control::DONE,
        );
        writer.end(start);
        let packet = ok_response(writer.into_bytes());

        let response = parse_control_response(&packet, block_type::IOD_CONTROL_RES).unwrap();
        assert_eq!(response.ar_uuid, Uuid::from_bytes([0x11; 16]));
        assert_eq!(response.command & control::DONE, control::DONE);

        // A response without the DONE bit is rejected.
        let mut writer = BlockWriter::new();
        let start = writer.begin(block_type::IOD_CONTROL_RES);
        write_control_payload(
            &mut writer,
            &Uuid::from_bytes([0x11; 16]),
            0x0101,
            control::PRM_END,
        );
        writer.end(start);
        let packet = ok_response(writer.into_bytes());

        assert!(parse_control_response(&packet, block_type::IOD_CONTROL_RES).is_err());
    }

    #[test]
    fn test_record_write_read_requests() {
        let request = build_write_request(
            STRATEGIES[0],
            &control_ids(),
            0,
            0,
            1,
            0xF841,
            &[0xAA, 0xBB, 0xCC],
        )
        .unwrap();

        let (header, _) = RpcHeader::read_from(&request, 0).unwrap();
        assert_eq!(header.opnum, opnum::WRITE);
        // The record data trails the header block.
        assert_eq!(&request[request.len() - 3..], &[0xAA, 0xBB, 0xCC]);

        let request =
            build_read_request(STRATEGIES[0], &control_ids(), 0, 0, 1, 0xAFF0, 1024).unwrap();
        let (header, _) = RpcHeader::read_from(&request, 0).unwrap();
        assert_eq!(header.opnum, opnum::READ);
    }

    #[test]
    fn test_read_response_data_extraction() {
        let mut writer = BlockWriter::new();
        let start = writer.begin(block_type::IOD_READ_RES);
        writer.push_u16(6);
        writer.push_uuid(&Uuid::from_bytes([0x11; 16]), UuidFormat::AsStored);
        writer.push_u32(0);
        writer.push_u16(0);
        writer.push_u16(1);
        writer.push_u16(0);
        writer.push_u16(0xAFF0);
        writer.push_u32(4); // record data length
        writer.push_u16(0);
        writer.push_u16(0);
        writer.push_bytes(&[0u8; 20]);
        writer.end(start);
        writer.push_bytes(&[0xDE, 0xAD, 0xBE, 0xEF]);

        let packet = ok_response(writer.into_bytes());
        assert_eq!(parse_read_response(&packet).unwrap(), vec![0xDE, 0xAD, 0xBE, 0xEF]);
    }

    fn app_ready_indication(drep0: u8) -> Vec<u8> {
        let mut writer = BlockWriter::new();
        let start = writer.begin(block_type::APP_READY_REQ);
        write_control_payload(
            &mut writer,
            &Uuid::from_bytes([0x11; 16]),
            0x0101,
            control::APPLICATION_READY,
        );
        writer.end(start);
        let blocks = writer.into_bytes();

        let body_len = NDR_HEADER_LEN + blocks.len();
        let header = RpcHeader {
            ptype: PTYPE_REQUEST,
            flags1: 0,
            drep: [drep0, 0, 0],
            object: Uuid::NIL,
            interface: crate::rpc::IFACE_UUID_CONTROLLER,
            activity: Uuid::from_bytes([0x33; 16]),
            server_boot: 0,
            interface_version: 1,
            sequence: 11,
            opnum: opnum::CONTROL,
            body_len: body_len as u16,
            fragment_num: 0,
        };

        // A big-endian peer writes integers BE and UUIDs unswapped; our
        // writer only emits the little-endian form, so build the BE variant
        // by hand.
        if drep0 & 0xF0 == DREP_LITTLE_ENDIAN {
            let mut packet = vec![0u8; RPC_HEADER_LEN + body_len];
            let mut offset = header
                .write_to(&mut packet, 0, UuidFormat::SwapFields)
                .unwrap();
            offset += NdrRequestHeader::for_args(blocks.len() as u32)
                .write_to(&mut packet, offset)
                .unwrap();
            crate::codec::put_bytes(&mut packet, offset, &blocks).unwrap();
            packet
        } else {
            let mut packet = vec![0u8; RPC_HEADER_LEN + body_len];
            packet[0] = 4;
            packet[1] = PTYPE_REQUEST;
            packet[4] = drep0;
            packet[24..40].copy_from_slice(crate::rpc::IFACE_UUID_CONTROLLER.as_bytes());
            packet[40..56].copy_from_slice(Uuid::from_bytes([0x33; 16]).as_bytes());
            packet[64..68].copy_from_slice(&11u32.to_be_bytes());
            packet[68..70].copy_from_slice(&opnum::CONTROL.to_be_bytes());
            packet[74..76].copy_from_slice(&(body_len as u16).to_be_bytes());

            let mut ndr = [0u8; NDR_HEADER_LEN];
            NdrRequestHeader::for_args(blocks.len() as u32)
                .write_to(&mut ndr, 0)
                .unwrap();
            packet[RPC_HEADER_LEN..RPC_HEADER_LEN + NDR_HEADER_LEN].copy_from_slice(&ndr);
            packet[RPC_HEADER_LEN + NDR_HEADER_LEN..].copy_from_slice(&blocks);
            packet
        }
    }

    #[test]
    fn test_application_ready_round_trip_little_endian() {
        let indication = app_ready_indication(DREP_LITTLE_ENDIAN);
        let parsed = parse_application_ready(&indication).unwrap();

        assert_eq!(parsed.ar_uuid, Uuid::from_bytes([0x11; 16]));
        assert_eq!(parsed.session_key, 0x0101);
        assert_eq!(parsed.header.interface, crate::rpc::IFACE_UUID_CONTROLLER);

        let response = build_application_ready_response(&parsed).unwrap();

        // Same DREP on both sides: the wire bytes of the interface UUID are
        // echoed verbatim.
        assert_eq!(&response[24..40], &indication[24..40]);

        // The response NDR is present and reports OK.
        let (ndr, _) = NdrResponseHeader::read_from(&response, RPC_HEADER_LEN).unwrap();
        assert!(ndr.status.is_ok());

        let mut cursor = BlockCursor::new(&response[RPC_HEADER_LEN + NDR_HEADER_LEN..]);
        let block = cursor.next_block().unwrap().unwrap();
        assert_eq!(block.block_type, block_type::APP_READY_RES);
        assert_eq!(
            u16::from_be_bytes([block.payload[24], block.payload[25]]),
            control::DONE
        );
    }

    #[test]
    fn test_application_ready_big_endian_peer_swaps() {
        let indication = app_ready_indication(0x00);
        let parsed = parse_application_ready(&indication).unwrap();

        let response = build_application_ready_response(&parsed).unwrap();

        // The peer's DREP differed from ours: the echoed interface UUID is
        // the incoming wire bytes with the field swap applied.
        let incoming = Uuid::read_from(&indication, 24, UuidFormat::AsStored).unwrap();
        let outgoing = Uuid::read_from(&response, 24, UuidFormat::AsStored).unwrap();
        assert_eq!(outgoing, incoming.swap_fields());

        assert_eq!(response[1], PTYPE_RESPONSE);
        assert_eq!(response[4], DREP_LITTLE_ENDIAN);
    }
}
