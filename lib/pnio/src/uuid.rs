use crate::codec::{get_bytes, put_bytes};
use crate::error::CodecError;
use rand::RngCore;
use std::fmt;

/// On-wire encoding of a UUID. DCE little-endian representation stores the
/// first three fields byte-swapped; `AsStored` writes the bytes verbatim for
/// stacks that never swap.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum UuidFormat {
    AsStored,
    SwapFields,
}

/// A 16-byte UUID held in its as-stored (big-endian field) form.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Uuid([u8; 16]);

impl Uuid {
    pub const NIL: Uuid = Uuid([0; 16]);

    pub const SIZE: usize = 16;

    #[inline]
    pub const fn from_bytes(bytes: [u8; 16]) -> Uuid {
        Uuid(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Generates a fresh random (version 4) UUID.
    pub fn generate() -> Uuid {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);

        bytes[6] = (bytes[6] & 0x0F) | 0x40;
        bytes[8] = (bytes[8] & 0x3F) | 0x80;

        Uuid(bytes)
    }

    /// Reverses bytes 0..4, 4..6 and 6..8, leaving 8..16 unchanged. Applying
    /// the swap twice yields the original value.
    pub fn swap_fields(self) -> Uuid {
        let b = self.0;

        Uuid([
            b[3], b[2], b[1], b[0], b[5], b[4], b[7], b[6], b[8], b[9], b[10], b[11], b[12], b[13],
            b[14], b[15],
        ])
    }

    pub fn write_to(
        &self,
        buf: &mut [u8],
        offset: usize,
        format: UuidFormat,
    ) -> Result<usize, CodecError> {
        let encoded = match format {
            UuidFormat::AsStored => *self,
            UuidFormat::SwapFields => self.swap_fields(),
        };

        put_bytes(buf, offset, &encoded.0)
    }

    pub fn read_from(buf: &[u8], offset: usize, format: UuidFormat) -> Result<Uuid, CodecError> {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(get_bytes(buf, offset, 16)?);

        let raw = Uuid(bytes);

        Ok(match format {
            UuidFormat::AsStored => raw,
            UuidFormat::SwapFields => raw.swap_fields(),
        })
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let b = self.0;

        write!(
            f,
            "{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12], b[13],
            b[14], b[15]
        )
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}
