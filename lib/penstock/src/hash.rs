//! Credential hashing for the RTU user table. The scheme is a salted
//! non-cryptographic hash; the deployment target is an isolated industrial
//! VLAN and the RTU side stores the same literal wire string.

/// Salt prepended to every password before hashing.
pub const CREDENTIAL_SALT: &str = "NaCl4Life";

/// Length of the formatted wire hash: `DJB2:XXXXXXXX:XXXXXXXX`.
pub const WIRE_HASH_LEN: usize = 22;

/// Classic 32-bit DJB2 over a byte slice.
#[inline]
pub fn djb2(data: &[u8]) -> u32 {
    let mut hash: u32 = 5381;

    for &byte in data {
        hash = (hash << 5).wrapping_add(hash).wrapping_add(u32::from(byte));
    }

    hash
}

/// Formats the wire representation of a salted credential: the DJB2 of the
/// salt alone, then the DJB2 of salt-concatenated-with-password, both as
/// eight uppercase hex digits.
pub fn credential_hash(password: &str) -> String {
    let mut salted = String::with_capacity(CREDENTIAL_SALT.len() + password.len());
    salted.push_str(CREDENTIAL_SALT);
    salted.push_str(password);

    format!(
        "DJB2:{:08X}:{:08X}",
        djb2(CREDENTIAL_SALT.as_bytes()),
        djb2(salted.as_bytes())
    )
}

/// Compares two byte slices without early exit on the first mismatch.
/// Slices of unequal length compare unequal immediately; length is not
/// secret here, the hash contents are.
#[inline]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut acc = 0u8;

    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }

    acc == 0
}
