//! DCE/RPC connectionless layer carrying the PNIO context-management
//! services over UDP port 34964. Integers in the RPC header follow the DREP
//! octet; everything inside the PNIO blocks is big-endian.

pub mod connect;
pub mod ndr;
pub mod strategy;
pub mod transport;

use crate::codec;
use crate::error::CodecError;
use crate::uuid::{Uuid, UuidFormat};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::fmt;

pub const PNIO_UDP_PORT: u16 = 34964;

pub const RPC_HEADER_LEN: usize = 80;

/// DREP octet 0 declaring little-endian integer representation.
pub const DREP_LITTLE_ENDIAN: u8 = 0x10;

pub const PTYPE_REQUEST: u8 = 0;
pub const PTYPE_RESPONSE: u8 = 2;
pub const PTYPE_FAULT: u8 = 3;

const RPC_VERSION: u8 = 4;
const FLAGS1_IDEMPOTENT: u8 = 0x20;
const HINT_NONE: u16 = 0xFFFF;
const PNIO_INTERFACE_VERSION: u32 = 1;

/// PNIO device interface UUID (the target of controller-initiated requests).
pub const IFACE_UUID_DEVICE: Uuid = Uuid::from_bytes([
    0xDE, 0xA0, 0x00, 0x01, 0x6C, 0x97, 0x11, 0xD1, 0x82, 0x71, 0x00, 0xA0, 0x24, 0x42, 0xDF, 0x7D,
]);

/// PNIO controller interface UUID (the target of device-initiated requests).
pub const IFACE_UUID_CONTROLLER: Uuid = Uuid::from_bytes([
    0xDE, 0xA0, 0x00, 0x02, 0x6C, 0x97, 0x11, 0xD1, 0x82, 0x71, 0x00, 0xA0, 0x24, 0x42, 0xDF, 0x7D,
]);

const OBJECT_UUID_PREFIX: [u8; 10] = [
    0xDE, 0xA0, 0x00, 0x00, 0x6C, 0x97, 0x11, 0xD1, 0x82, 0x71,
];

/// PNIO object UUID: the fixed prefix with instance, device id and vendor id
/// packed into the node field.
pub fn object_uuid(instance: u16, device_id: u16, vendor_id: u16) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes[..10].copy_from_slice(&OBJECT_UUID_PREFIX);
    bytes[10..12].copy_from_slice(&instance.to_be_bytes());
    bytes[12..14].copy_from_slice(&device_id.to_be_bytes());
    bytes[14..16].copy_from_slice(&vendor_id.to_be_bytes());

    Uuid::from_bytes(bytes)
}

/// Operation numbers on the PNIO device interface.
pub mod opnum {
    pub const CONNECT: u16 = 0;
    pub const RELEASE: u16 = 1;
    pub const READ: u16 = 2;
    pub const WRITE: u16 = 3;
    pub const CONTROL: u16 = 4;
}

/// ControlCommand bit positions. These are bitfield values, not a sequential
/// enumeration.
pub mod control {
    pub const PRM_BEGIN: u16 = 0x0001;
    pub const PRM_END: u16 = 0x0002;
    pub const APPLICATION_READY: u16 = 0x0004;
    pub const RELEASE: u16 = 0x0008;
    pub const RDY_FOR_COMPANION: u16 = 0x0010;
    pub const RDY_FOR_RT_CLASS3: u16 = 0x0020;
    pub const DONE: u16 = 0x0040;
}

/// PNIO block types used by the connect engine.
pub mod block_type {
    pub const AR_REQ: u16 = 0x0101;
    pub const IOCR_REQ: u16 = 0x0102;
    pub const ALARM_CR_REQ: u16 = 0x0103;
    pub const EXPECTED_SUBMODULE_REQ: u16 = 0x0104;
    pub const IOD_CONTROL_REQ: u16 = 0x0110;
    pub const APP_READY_REQ: u16 = 0x0112;
    pub const RELEASE_REQ: u16 = 0x0114;
    pub const IOD_WRITE_REQ: u16 = 0x0008;
    pub const IOD_READ_REQ: u16 = 0x0009;

    pub const AR_RES: u16 = 0x8101;
    pub const IOCR_RES: u16 = 0x8102;
    pub const ALARM_CR_RES: u16 = 0x8103;
    pub const MODULE_DIFF: u16 = 0x8104;
    pub const IOD_CONTROL_RES: u16 = 0x8110;
    pub const APP_READY_RES: u16 = 0x8112;
    pub const RELEASE_RES: u16 = 0x8114;
    pub const IOD_WRITE_RES: u16 = 0x8008;
    pub const IOD_READ_RES: u16 = 0x8009;
}

pub const BLOCK_VERSION_HIGH: u8 = 1;
pub const BLOCK_VERSION_LOW: u8 = 0;

/// The PNIO status quadruple. Packed big-endian-within-word:
/// `code << 24 | decode << 16 | code_1 << 8 | code_2`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PnioStatus {
    pub code: u8,
    pub decode: u8,
    pub code_1: u8,
    pub code_2: u8,
}

impl PnioStatus {
    pub const OK: PnioStatus = PnioStatus {
        code: 0,
        decode: 0,
        code_1: 0,
        code_2: 0,
    };

    #[inline]
    pub fn from_word(word: u32) -> PnioStatus {
        PnioStatus {
            code: (word >> 24) as u8,
            decode: (word >> 16) as u8,
            code_1: (word >> 8) as u8,
            code_2: word as u8,
        }
    }

    #[inline]
    pub fn to_word(self) -> u32 {
        (u32::from(self.code) << 24)
            | (u32::from(self.decode) << 16)
            | (u32::from(self.code_1) << 8)
            | u32::from(self.code_2)
    }

    #[inline]
    pub fn is_ok(self) -> bool {
        self == Self::OK
    }
}

impl fmt::Display for PnioStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "PNIO status {:02X}:{:02X}:{:02X}:{:02X}",
            self.code, self.decode, self.code_1, self.code_2
        )
    }
}

/// The 80-byte DCE/RPC connectionless header. UUIDs are held in as-stored
/// form; the write/read paths apply the wire swap according to the supplied
/// format (writes) or the embedded DREP (reads).
#[derive(Debug, Clone, PartialEq)]
pub struct RpcHeader {
    pub ptype: u8,
    pub flags1: u8,
    pub drep: [u8; 3],
    pub object: Uuid,
    pub interface: Uuid,
    pub activity: Uuid,
    pub server_boot: u32,
    pub interface_version: u32,
    pub sequence: u32,
    pub opnum: u16,
    pub body_len: u16,
    pub fragment_num: u16,
}

impl RpcHeader {
    /// Header for a controller-initiated request on the device interface.
    pub fn request(
        object: Uuid,
        interface: Uuid,
        activity: Uuid,
        sequence: u32,
        opnum: u16,
        body_len: u16,
    ) -> RpcHeader {
        RpcHeader {
            ptype: PTYPE_REQUEST,
            flags1: FLAGS1_IDEMPOTENT,
            drep: [DREP_LITTLE_ENDIAN, 0, 0],
            object,
            interface,
            activity,
            server_boot: 0,
            interface_version: PNIO_INTERFACE_VERSION,
            sequence,
            opnum,
            body_len,
            fragment_num: 0,
        }
    }

    /// Header answering a device-initiated request: same identifiers, the
    /// response packet type, and our own DREP.
    pub fn response_to(request: &RpcHeader, body_len: u16) -> RpcHeader {
        RpcHeader {
            ptype: PTYPE_RESPONSE,
            flags1: 0,
            drep: [DREP_LITTLE_ENDIAN, 0, 0],
            object: request.object,
            interface: request.interface,
            activity: request.activity,
            server_boot: request.server_boot,
            interface_version: request.interface_version,
            sequence: request.sequence,
            opnum: request.opnum,
            body_len,
            fragment_num: 0,
        }
    }

    #[inline]
    pub fn is_little_endian(&self) -> bool {
        self.drep[0] & 0xF0 == DREP_LITTLE_ENDIAN
    }

    pub fn write_to(
        &self,
        buf: &mut [u8],
        offset: usize,
        format: UuidFormat,
    ) -> Result<usize, CodecError> {
        if offset + RPC_HEADER_LEN > buf.len() {
            return Err(CodecError::RangeViolation {
                offset,
                len: RPC_HEADER_LEN,
                capacity: buf.len(),
            });
        }

        let header = &mut buf[offset..offset + RPC_HEADER_LEN];

        header[0] = RPC_VERSION;
        header[1] = self.ptype;
        header[2] = self.flags1;
        header[3] = 0;
        header[4..7].copy_from_slice(&self.drep);
        header[7] = 0;

        self.object.write_to(header, 8, format)?;
        self.interface.write_to(header, 24, format)?;
        self.activity.write_to(header, 40, format)?;

        // Integer fields follow the DREP we declare, which is always
        // little-endian on the write path.
        LittleEndian::write_u32(&mut header[56..60], self.server_boot);
        LittleEndian::write_u32(&mut header[60..64], self.interface_version);
        LittleEndian::write_u32(&mut header[64..68], self.sequence);
        LittleEndian::write_u16(&mut header[68..70], self.opnum);
        LittleEndian::write_u16(&mut header[70..72], HINT_NONE);
        LittleEndian::write_u16(&mut header[72..74], HINT_NONE);
        LittleEndian::write_u16(&mut header[74..76], self.body_len);
        LittleEndian::write_u16(&mut header[76..78], self.fragment_num);
        header[78] = 0;
        header[79] = 0;

        Ok(RPC_HEADER_LEN)
    }

    /// Parses a header, normalizing UUIDs and integers according to the
    /// embedded DREP.
    pub fn read_from(buf: &[u8], offset: usize) -> Result<(RpcHeader, usize), CodecError> {
        let header = codec::get_bytes(buf, offset, RPC_HEADER_LEN)?;

        let mut drep = [0u8; 3];
        drep.copy_from_slice(&header[4..7]);

        let little_endian = drep[0] & 0xF0 == DREP_LITTLE_ENDIAN;

        let uuid_format = if little_endian {
            UuidFormat::SwapFields
        } else {
            UuidFormat::AsStored
        };

        let object = Uuid::read_from(header, 8, uuid_format)?;
        let interface = Uuid::read_from(header, 24, uuid_format)?;
        let activity = Uuid::read_from(header, 40, uuid_format)?;

        let (server_boot, interface_version, sequence, opnum, body_len, fragment_num) =
            if little_endian {
                (
                    LittleEndian::read_u32(&header[56..60]),
                    LittleEndian::read_u32(&header[60..64]),
                    LittleEndian::read_u32(&header[64..68]),
                    LittleEndian::read_u16(&header[68..70]),
                    LittleEndian::read_u16(&header[74..76]),
                    LittleEndian::read_u16(&header[76..78]),
                )
            } else {
                (
                    BigEndian::read_u32(&header[56..60]),
                    BigEndian::read_u32(&header[60..64]),
                    BigEndian::read_u32(&header[64..68]),
                    BigEndian::read_u16(&header[68..70]),
                    BigEndian::read_u16(&header[74..76]),
                    BigEndian::read_u16(&header[76..78]),
                )
            };

        Ok((
            RpcHeader {
                ptype: header[1],
                flags1: header[2],
                drep,
                object,
                interface,
                activity,
                server_boot,
                interface_version,
                sequence,
                opnum,
                body_len,
                fragment_num,
            },
            RPC_HEADER_LEN,
        ))
    }
}

/// Serial writer for PNIO blocks. Blocks are contiguous with no inter-block
/// padding; the length field counts everything after the 4-byte type+length
/// prefix, version octets included.
pub struct BlockWriter {
    buf: Vec<u8>,
}

impl BlockWriter {
    pub fn new() -> BlockWriter {
        BlockWriter { buf: Vec::new() }
    }

    /// Opens a block; returns a handle that `end` uses to patch the length.
    pub fn begin(&mut self, block_type: u16) -> usize {
        let start = self.buf.len();
        self.buf.extend_from_slice(&block_type.to_be_bytes());
        self.buf.extend_from_slice(&[0, 0]);
        self.buf.push(BLOCK_VERSION_HIGH);
        self.buf.push(BLOCK_VERSION_LOW);
        start
    }

    pub fn end(&mut self, start: usize) {
        let len = (self.buf.len() - start - 4) as u16;
        self.buf[start + 2..start + 4].copy_from_slice(&len.to_be_bytes());
    }

    #[inline]
    pub fn push_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    #[inline]
    pub fn push_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    #[inline]
    pub fn push_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    #[inline]
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    #[inline]
    pub fn push_uuid(&mut self, uuid: &Uuid, format: UuidFormat) {
        let encoded = match format {
            UuidFormat::AsStored => *uuid,
            UuidFormat::SwapFields => uuid.swap_fields(),
        };
        self.buf.extend_from_slice(encoded.as_bytes());
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// One block as located by the cursor. `payload` starts at the version
/// octets.
#[derive(Debug, Copy, Clone)]
pub struct Block<'a> {
    pub block_type: u16,
    pub payload: &'a [u8],
}

/// Cursor over a contiguous block sequence. Advances by exactly
/// `4 + length` bytes per block with no realignment between blocks.
pub struct BlockCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BlockCursor<'a> {
    #[inline]
    pub fn new(buf: &'a [u8]) -> BlockCursor<'a> {
        BlockCursor { buf, pos: 0 }
    }

    pub fn next_block(&mut self) -> Result<Option<Block<'a>>, CodecError> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }

        let block_type = codec::get_u16(self.buf, self.pos)?;
        let len = codec::get_u16(self.buf, self.pos + 2)? as usize;
        let payload = codec::get_bytes(self.buf, self.pos + 4, len)?;

        self.pos += 4 + len;

        Ok(Some(Block {
            block_type,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> RpcHeader {
        RpcHeader::request(
            object_uuid(1, 0x0C05, 0x0272),
            IFACE_UUID_DEVICE,
            Uuid::from_bytes([7; 16]),
            42,
            opnum::CONNECT,
            100,
        )
    }

    #[test]
    fn test_pnio_status_word_packing() {
        let status = PnioStatus {
            code: 0xDB,
            decode: 0x81,
            code_1: 0x3D,
            code_2: 0x02,
        };

        assert_eq!(status.to_word(), 0xDB813D02);
        assert_eq!(PnioStatus::from_word(0xDB813D02), status);
        assert!(!status.is_ok());
        assert!(PnioStatus::from_word(0).is_ok());
    }

    #[test]
    fn test_object_uuid_node_fields() {
        let uuid = object_uuid(0x0001, 0x0C05, 0x0272);
        let bytes = uuid.as_bytes();

        assert_eq!(&bytes[..4], &[0xDE, 0xA0, 0x00, 0x00]);
        assert_eq!(&bytes[10..12], &[0x00, 0x01]);
        assert_eq!(&bytes[12..14], &[0x0C, 0x05]);
        assert_eq!(&bytes[14..16], &[0x02, 0x72]);
    }

    #[test]
    fn test_header_round_trip_swapped() {
        let header = sample_header();

        let mut buf = [0u8; RPC_HEADER_LEN];
        header
            .write_to(&mut buf, 0, UuidFormat::SwapFields)
            .unwrap();

        assert_eq!(buf[0], RPC_VERSION);
        assert_eq!(buf[4], DREP_LITTLE_ENDIAN);

        let (parsed, consumed) = RpcHeader::read_from(&buf, 0).unwrap();
        assert_eq!(consumed, RPC_HEADER_LEN);
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_header_integer_byte_order() {
        let header = sample_header();

        let mut buf = [0u8; RPC_HEADER_LEN];
        header
            .write_to(&mut buf, 0, UuidFormat::SwapFields)
            .unwrap();

        // Sequence 42 little-endian at offset 64
        assert_eq!(&buf[64..68], &[42, 0, 0, 0]);
        // Hints are 0xFFFF
        assert_eq!(&buf[70..74], &[0xFF; 4]);
    }

    #[test]
    fn test_header_as_stored_leaves_uuid_verbatim() {
        let header = sample_header();

        let mut buf = [0u8; RPC_HEADER_LEN];
        header.write_to(&mut buf, 0, UuidFormat::AsStored).unwrap();

        assert_eq!(&buf[24..40], IFACE_UUID_DEVICE.as_bytes());
    }

    #[test]
    fn test_header_big_endian_read() {
        // A header written by a big-endian stack: DREP 0x00, integers BE,
        // UUIDs unswapped.
        let mut buf = [0u8; RPC_HEADER_LEN];
        buf[0] = RPC_VERSION;
        buf[1] = PTYPE_REQUEST;
        buf[24..40].copy_from_slice(IFACE_UUID_DEVICE.as_bytes());
        BigEndian::write_u32(&mut buf[64..68], 9);
        BigEndian::write_u16(&mut buf[68..70], opnum::CONTROL);
        BigEndian::write_u16(&mut buf[74..76], 32);

        let (parsed, _) = RpcHeader::read_from(&buf, 0).unwrap();

        assert!(!parsed.is_little_endian());
        assert_eq!(parsed.interface, IFACE_UUID_DEVICE);
        assert_eq!(parsed.sequence, 9);
        assert_eq!(parsed.opnum, opnum::CONTROL);
        assert_eq!(parsed.body_len, 32);
    }

    #[test]
    fn test_block_writer_cursor_round_trip() {
        let mut writer = BlockWriter::new();

        let start = writer.begin(block_type::AR_REQ);
        writer.push_u16(0x0001);
        writer.push_u32(0xAABBCCDD);
        writer.end(start);

        let start = writer.begin(block_type::IOCR_REQ);
        writer.push_u8(0x7F);
        writer.end(start);

        let bytes = writer.into_bytes();
        let mut cursor = BlockCursor::new(&bytes);

        let first = cursor.next_block().unwrap().unwrap();
        assert_eq!(first.block_type, block_type::AR_REQ);
        assert_eq!(first.payload.len(), 8);
        assert_eq!(first.payload[0], BLOCK_VERSION_HIGH);
        assert_eq!(&first.payload[2..4], &[0x00, 0x01]);

        let second = cursor.next_block().unwrap().unwrap();
        assert_eq!(second.block_type, block_type::IOCR_REQ);
        assert_eq!(second.payload, &[1, 0, 0x7F]);

        assert!(cursor.next_block().unwrap().is_none());
    }

    #[test]
    fn test_block_cursor_truncated() {
        let mut writer = BlockWriter::new();
        let start = writer.begin(block_type::AR_REQ);
        writer.push_u32(1);
        writer.end(start);

        let bytes = writer.into_bytes();
        let mut cursor = BlockCursor::new(&bytes[..bytes.len() - 1]);

        assert!(cursor.next_block().is_err());
    }

    #[test]
    fn test_control_command_bit_positions() {
        assert_eq!(control::PRM_BEGIN, 0x0001);
        assert_eq!(control::PRM_END, 0x0002);
        assert_eq!(control::APPLICATION_READY, 0x0004);
        assert_eq!(control::RELEASE, 0x0008);
        assert_eq!(control::RDY_FOR_COMPANION, 0x0010);
        assert_eq!(control::RDY_FOR_RT_CLASS3, 0x0020);
        assert_eq!(control::DONE, 0x0040);
    }
}
