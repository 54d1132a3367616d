//! 32-byte global ids (rendezvous points, identity keys).
//!
//! Serialized as lowercase hex strings.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ShortId([u8; 32]);

/// A rendezvous point.
pub type RvId = ShortId;

impl ShortId {
    pub const LEN: usize = 32;

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 8 bytes in hex, for logs.
    pub fn short_log_id(&self) -> String {
        hex::encode(&self.0[..8])
    }

    pub fn from_slice(b: &[u8]) -> Result<Self, InvalidShortId> {
        let arr: [u8; 32] = b.try_into().map_err(|_| InvalidShortId(b.len()))?;
        Ok(Self(arr))
    }
}

impl From<[u8; 32]> for ShortId {
    fn from(v: [u8; 32]) -> Self {
        Self(v)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid ShortID length: {0}")]
pub struct InvalidShortId(pub usize);

impl FromStr for ShortId {
    type Err = InvalidShortId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s).map_err(|_| InvalidShortId(s.len() / 2))?;
        Self::from_slice(&raw)
    }
}

impl fmt::Display for ShortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ShortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShortId({})", self.short_log_id())
    }
}

impl Serialize for ShortId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ShortId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
