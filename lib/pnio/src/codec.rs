//! Offset-addressed primitives for the byte-exact wire formats: network-order
//! integers, CRC-16/CCITT-FALSE, sensor floats, and the Ethernet/VLAN layer.
//!
//! Every accessor validates the requested range up front; a failed call
//! leaves the buffer and all output arguments untouched.

use crate::error::CodecError;
use byteorder::{BigEndian, ByteOrder};
use std::fmt;
use std::str::FromStr;

pub const ETHERTYPE_PROFINET: u16 = 0x8892;
pub const ETHERTYPE_VLAN: u16 = 0x8100;

/// Smallest C-SDU a real-time frame may carry; shorter payloads are padded.
pub const MIN_CSDU_LEN: usize = 40;

#[inline]
fn check(buf: &[u8], offset: usize, len: usize) -> Result<(), CodecError> {
    if offset.checked_add(len).map_or(true, |end| end > buf.len()) {
        return Err(CodecError::RangeViolation {
            offset,
            len,
            capacity: buf.len(),
        });
    }

    Ok(())
}

#[inline]
pub fn put_u8(buf: &mut [u8], offset: usize, value: u8) -> Result<usize, CodecError> {
    check(buf, offset, 1)?;
    buf[offset] = value;
    Ok(1)
}

#[inline]
pub fn put_u16(buf: &mut [u8], offset: usize, value: u16) -> Result<usize, CodecError> {
    check(buf, offset, 2)?;
    BigEndian::write_u16(&mut buf[offset..offset + 2], value);
    Ok(2)
}

#[inline]
pub fn put_u32(buf: &mut [u8], offset: usize, value: u32) -> Result<usize, CodecError> {
    check(buf, offset, 4)?;
    BigEndian::write_u32(&mut buf[offset..offset + 4], value);
    Ok(4)
}

#[inline]
pub fn put_u64(buf: &mut [u8], offset: usize, value: u64) -> Result<usize, CodecError> {
    check(buf, offset, 8)?;
    BigEndian::write_u64(&mut buf[offset..offset + 8], value);
    Ok(8)
}

#[inline]
pub fn put_bytes(buf: &mut [u8], offset: usize, data: &[u8]) -> Result<usize, CodecError> {
    check(buf, offset, data.len())?;
    buf[offset..offset + data.len()].copy_from_slice(data);
    Ok(data.len())
}

#[inline]
pub fn get_u8(buf: &[u8], offset: usize) -> Result<u8, CodecError> {
    check(buf, offset, 1)?;
    Ok(buf[offset])
}

#[inline]
pub fn get_u16(buf: &[u8], offset: usize) -> Result<u16, CodecError> {
    check(buf, offset, 2)?;
    Ok(BigEndian::read_u16(&buf[offset..offset + 2]))
}

#[inline]
pub fn get_u32(buf: &[u8], offset: usize) -> Result<u32, CodecError> {
    check(buf, offset, 4)?;
    Ok(BigEndian::read_u32(&buf[offset..offset + 4]))
}

#[inline]
pub fn get_u64(buf: &[u8], offset: usize) -> Result<u64, CodecError> {
    check(buf, offset, 8)?;
    Ok(BigEndian::read_u64(&buf[offset..offset + 8]))
}

#[inline]
pub fn get_bytes<'a>(buf: &'a [u8], offset: usize, len: usize) -> Result<&'a [u8], CodecError> {
    check(buf, offset, len)?;
    Ok(&buf[offset..offset + len])
}

/// CRC-16/CCITT-FALSE: polynomial 0x1021, initial value 0xFFFF, no
/// reflection, no final XOR.
pub fn crc16_ccitt_false(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;

    for &byte in data {
        crc ^= u16::from(byte) << 8;

        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }

    crc
}

/// Packs an IEEE-754 single in network byte order followed by the one-byte
/// application quality. Bit-exact: the float transits as its raw bits.
#[inline]
pub fn pack_sensor(
    buf: &mut [u8],
    offset: usize,
    value: f32,
    quality: u8,
) -> Result<usize, CodecError> {
    check(buf, offset, 5)?;
    BigEndian::write_u32(&mut buf[offset..offset + 4], value.to_bits());
    buf[offset + 4] = quality;
    Ok(5)
}

/// Reads the 5-byte sensor cell back as `(value, raw quality byte)`.
#[inline]
pub fn unpack_sensor(buf: &[u8], offset: usize) -> Result<(f32, u8), CodecError> {
    check(buf, offset, 5)?;
    let bits = BigEndian::read_u32(&buf[offset..offset + 4]);
    Ok((f32::from_bits(bits), buf[offset + 4]))
}

/// A link-layer address.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct Mac(pub [u8; 6]);

impl Mac {
    pub const BROADCAST: Mac = Mac([0xFF; 6]);

    /// PROFINET DCP multicast group.
    pub const DCP_MULTICAST: Mac = Mac([0x01, 0x0E, 0xCF, 0x00, 0x00, 0x00]);

    #[inline]
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Debug for Mac {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl FromStr for Mac {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut mac = [0u8; 6];
        let mut parts = 0;

        for (i, part) in s.split(':').enumerate() {
            if i >= 6 || part.len() != 2 {
                return Err(());
            }
            mac[i] = u8::from_str_radix(part, 16).map_err(|_| ())?;
            parts += 1;
        }

        if parts != 6 {
            return Err(());
        }

        Ok(Mac(mac))
    }
}

/// 802.1Q tag content. The TPID is fixed at 0x8100.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct VlanTag {
    pub pcp: u8,
    pub vid: u16,
}

impl VlanTag {
    /// Priority tagging for RT class 1 cyclic frames.
    pub const RT_CLASS1: VlanTag = VlanTag { pcp: 6, vid: 0 };

    #[inline]
    pub fn tci(self) -> u16 {
        (u16::from(self.pcp) << 13) | (self.vid & 0x0FFF)
    }

    #[inline]
    pub fn from_tci(tci: u16) -> VlanTag {
        VlanTag {
            pcp: (tci >> 13) as u8,
            vid: tci & 0x0FFF,
        }
    }
}

/// Ethernet II header with optional 802.1Q tag. `read_from` detects the tag
/// at offset 12 and advances by four bytes before reading the EtherType;
/// the EtherType offset is never assumed fixed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EthernetHeader {
    pub dst: Mac,
    pub src: Mac,
    pub vlan: Option<VlanTag>,
    pub ethertype: u16,
}

impl EthernetHeader {
    /// Header length as encoded: 14 bytes untagged, 18 with a VLAN tag.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        match self.vlan {
            Some(_) => 18,
            None => 14,
        }
    }

    pub fn write_to(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        let mut offset = 0;

        offset += put_bytes(buf, offset, &self.dst.0)?;
        offset += put_bytes(buf, offset, &self.src.0)?;

        if let Some(tag) = self.vlan {
            offset += put_u16(buf, offset, ETHERTYPE_VLAN)?;
            offset += put_u16(buf, offset, tag.tci())?;
        }

        offset += put_u16(buf, offset, self.ethertype)?;

        Ok(offset)
    }

    pub fn read_from(buf: &[u8]) -> Result<(EthernetHeader, usize), CodecError> {
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];

        dst.copy_from_slice(get_bytes(buf, 0, 6)?);
        src.copy_from_slice(get_bytes(buf, 6, 6)?);

        let mut offset = 12;
        let mut vlan = None;
        let mut ethertype = get_u16(buf, offset)?;
        offset += 2;

        if ethertype == ETHERTYPE_VLAN {
            vlan = Some(VlanTag::from_tci(get_u16(buf, offset)?));
            offset += 2;
            ethertype = get_u16(buf, offset)?;
            offset += 2;
        }

        Ok((
            EthernetHeader {
                dst: Mac(dst),
                src: Mac(src),
                vlan,
                ethertype,
            },
            offset,
        ))
    }
}
