//! NDR wrappers between the RPC header and the PNIO blocks. The request and
//! response headers are both 20 bytes but differ in their leading field:
//! requests start with ArgsMaximum, responses with PNIOStatus. They are kept
//! as two separate types with independent codecs.

use crate::codec;
use crate::error::CodecError;
use crate::rpc::PnioStatus;
use byteorder::{ByteOrder, LittleEndian};

pub const NDR_HEADER_LEN: usize = 20;

/// Largest response body the controller advertises it can accept.
pub const ARGS_MAXIMUM: u32 = 16_384;

/// Request NDR header: ArgsMaximum, ArgsLength, MaxCount, Offset,
/// ActualCount, all little-endian.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NdrRequestHeader {
    pub args_maximum: u32,
    pub args_length: u32,
    pub max_count: u32,
    pub offset: u32,
    pub actual_count: u32,
}

impl NdrRequestHeader {
    /// The canonical request wrapper: MaxCount mirrors ArgsLength, Offset is
    /// zero, ActualCount mirrors ArgsLength.
    pub fn for_args(args_length: u32) -> NdrRequestHeader {
        NdrRequestHeader {
            args_maximum: ARGS_MAXIMUM,
            args_length,
            max_count: args_length,
            offset: 0,
            actual_count: args_length,
        }
    }

    pub fn write_to(&self, buf: &mut [u8], offset: usize) -> Result<usize, CodecError> {
        if offset + NDR_HEADER_LEN > buf.len() {
            return Err(CodecError::RangeViolation {
                offset,
                len: NDR_HEADER_LEN,
                capacity: buf.len(),
            });
        }

        let header = &mut buf[offset..offset + NDR_HEADER_LEN];
        LittleEndian::write_u32(&mut header[0..4], self.args_maximum);
        LittleEndian::write_u32(&mut header[4..8], self.args_length);
        LittleEndian::write_u32(&mut header[8..12], self.max_count);
        LittleEndian::write_u32(&mut header[12..16], self.offset);
        LittleEndian::write_u32(&mut header[16..20], self.actual_count);

        Ok(NDR_HEADER_LEN)
    }

    pub fn read_from(buf: &[u8], offset: usize) -> Result<(NdrRequestHeader, usize), CodecError> {
        let header = codec::get_bytes(buf, offset, NDR_HEADER_LEN)?;

        Ok((
            NdrRequestHeader {
                args_maximum: LittleEndian::read_u32(&header[0..4]),
                args_length: LittleEndian::read_u32(&header[4..8]),
                max_count: LittleEndian::read_u32(&header[8..12]),
                offset: LittleEndian::read_u32(&header[12..16]),
                actual_count: LittleEndian::read_u32(&header[16..20]),
            },
            NDR_HEADER_LEN,
        ))
    }
}

/// Response NDR header: the PNIOStatus word comes first, then ArgsLength,
/// MaxCount, Offset, ActualCount.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NdrResponseHeader {
    pub status: PnioStatus,
    pub args_length: u32,
    pub max_count: u32,
    pub offset: u32,
    pub actual_count: u32,
}

impl NdrResponseHeader {
    pub fn ok(args_length: u32) -> NdrResponseHeader {
        NdrResponseHeader {
            status: PnioStatus::OK,
            args_length,
            max_count: args_length,
            offset: 0,
            actual_count: args_length,
        }
    }

    pub fn write_to(&self, buf: &mut [u8], offset: usize) -> Result<usize, CodecError> {
        if offset + NDR_HEADER_LEN > buf.len() {
            return Err(CodecError::RangeViolation {
                offset,
                len: NDR_HEADER_LEN,
                capacity: buf.len(),
            });
        }

        let header = &mut buf[offset..offset + NDR_HEADER_LEN];
        LittleEndian::write_u32(&mut header[0..4], self.status.to_word());
        LittleEndian::write_u32(&mut header[4..8], self.args_length);
        LittleEndian::write_u32(&mut header[8..12], self.max_count);
        LittleEndian::write_u32(&mut header[12..16], self.offset);
        LittleEndian::write_u32(&mut header[16..20], self.actual_count);

        Ok(NDR_HEADER_LEN)
    }

    pub fn read_from(buf: &[u8], offset: usize) -> Result<(NdrResponseHeader, usize), CodecError> {
        let header = codec::get_bytes(buf, offset, NDR_HEADER_LEN)?;

        Ok((
            NdrResponseHeader {
                status: PnioStatus::from_word(LittleEndian::read_u32(&header[0..4])),
                args_length: LittleEndian::read_u32(&header[4..8]),
                max_count: LittleEndian::read_u32(&header[8..12]),
                offset: LittleEndian::read_u32(&header[12..16]),
                actual_count: LittleEndian::read_u32(&header[16..20]),
            },
            NDR_HEADER_LEN,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_header_round_trip() {
        let header = NdrRequestHeader::for_args(512);

        let mut buf = [0u8; NDR_HEADER_LEN];
        assert_eq!(header.write_to(&mut buf, 0).unwrap(), NDR_HEADER_LEN);

        // ArgsMaximum first, little-endian
        assert_eq!(&buf[0..4], &ARGS_MAXIMUM.to_le_bytes());
        assert_eq!(&buf[4..8], &[0x00, 0x02, 0, 0]);

        let (parsed, _) = NdrRequestHeader::read_from(&buf, 0).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.max_count, 512);
        assert_eq!(parsed.offset, 0);
        assert_eq!(parsed.actual_count, 512);
    }

    #[test]
    fn test_response_header_status_first() {
        let header = NdrResponseHeader {
            status: PnioStatus {
                code: 0xDB,
                decode: 0x81,
                code_1: 0x3D,
                code_2: 0x02,
            },
            args_length: 0,
            max_count: 0,
            offset: 0,
            actual_count: 0,
        };

        let mut buf = [0u8; NDR_HEADER_LEN];
        header.write_to(&mut buf, 0).unwrap();

        // 0xDB813D02 little-endian on the wire
        assert_eq!(&buf[0..4], &[0x02, 0x3D, 0x81, 0xDB]);

        let (parsed, _) = NdrResponseHeader::read_from(&buf, 0).unwrap();
        assert_eq!(parsed.status.code, 0xDB);
        assert!(!parsed.status.is_ok());
    }

    #[test]
    fn test_response_header_ok() {
        let mut buf = [0u8; NDR_HEADER_LEN];
        NdrResponseHeader::ok(64).write_to(&mut buf, 0).unwrap();

        let (parsed, _) = NdrResponseHeader::read_from(&buf, 0).unwrap();
        assert!(parsed.status.is_ok());
        assert_eq!(parsed.args_length, 64);
    }

    #[test]
    fn test_truncated_headers() {
        let buf = [0u8; NDR_HEADER_LEN - 1];

        assert!(NdrRequestHeader::read_from(&buf, 0).is_err());
        assert!(NdrResponseHeader::read_from(&buf, 0).is_err());

        let mut out = [0u8; NDR_HEADER_LEN - 1];
        assert!(NdrRequestHeader::for_args(0).write_to(&mut out, 0).is_err());
    }
}
