/// Serde adapters encoding binary fields as base64 strings in configuration
/// and status documents.
pub mod base64 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&::base64::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <&str>::deserialize(deserializer)?;
        ::base64::decode(s).map_err(de::Error::custom)
    }
}

/// Serde adapters for fixed 64-byte opaque tokens. Shorter input is
/// zero-padded on the right; longer input is rejected.
pub mod token64 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(token: &[u8; 64], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&::base64::encode(&token[..]))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 64], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = <&str>::deserialize(deserializer)?;
        let raw = ::base64::decode(s).map_err(de::Error::custom)?;

        if raw.len() > 64 {
            return Err(de::Error::custom("token exceeds 64 bytes"));
        }

        let mut token = [0u8; 64];
        token[..raw.len()].copy_from_slice(&raw);

        Ok(token)
    }
}
