// SPDX-License-Identifier: Apache-2.0

//! Optional `serde`-based configuration surface for loading a pool's
//! capacity from a worker's configuration file.
//!
//! Adapted from the workspace configuration crate's byte-unit
//! deserialization helper: capacity may be given as a plain integer (bytes)
//! or as a human-readable string with units (`"2 GiB"`, `"512 MB"`).

use byte_unit::Byte;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer};

/// Configuration for constructing a [`crate::MemoryPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PoolConfig {
    /// The pool's fixed capacity, in bytes.
    #[serde(deserialize_with = "deserialize_capacity_bytes")]
    pub capacity_bytes: u64,
}

impl PoolConfig {
    /// Builds a config from a raw byte count, bypassing deserialization.
    #[must_use]
    pub fn from_bytes(capacity_bytes: u64) -> Self {
        Self { capacity_bytes }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawCapacity {
    Number(u64),
    String(String),
}

fn deserialize_capacity_bytes<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = RawCapacity::deserialize(deserializer)?;
    match value {
        RawCapacity::Number(bytes) => Ok(bytes),
        RawCapacity::String(text) => {
            let parsed: Byte = text.parse().map_err(DeError::custom)?;
            Ok(parsed.as_u64())
        }
    }
}
