//! Chain-agnostic cross-chain message
//!
//! A `Message` is produced by decoding a deposit on the source chain and
//! consumed by the destination chain's proposal relay. Messages are never
//! mutated after construction.

pub mod codec;

pub use codec::{CalldataSizeLimit, DepositCodec, DepositHook};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Bridge domain identifier (one per connected chain)
pub type DomainId = u8;

/// Monotonic deposit counter per source domain
pub type DepositNonce = u64;

/// Metadata key carrying the relay priority byte
pub const PRIORITY_KEY: &str = "Priority";

/// 32-byte key mapping an asset/handler pair across chains
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ResourceId(pub [u8; 32]);

impl ResourceId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceId({})", self)
    }
}

impl FromStr for ResourceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s.trim_start_matches("0x"))
            .map_err(|e| format!("invalid resource id {}: {}", s, e))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|v: Vec<u8>| format!("resource id must be 32 bytes, got {}", v.len()))?;
        Ok(ResourceId(bytes))
    }
}

impl Serialize for ResourceId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ResourceId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Kind of handler that realizes a transfer on the destination chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferType {
    Fungible,
    NonFungible,
    Generic,
}

impl TransferType {
    pub fn name(&self) -> &'static str {
        match self {
            TransferType::Fungible => "fungible",
            TransferType::NonFungible => "non_fungible",
            TransferType::Generic => "generic",
        }
    }
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Open key/value bag attached to a message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub data: BTreeMap<String, serde_json::Value>,
}

impl Metadata {
    pub fn with_priority(priority: u8) -> Self {
        let mut data = BTreeMap::new();
        data.insert(PRIORITY_KEY.to_string(), serde_json::Value::from(priority));
        Self { data }
    }

    /// Relay priority byte, if the depositor supplied one
    pub fn priority(&self) -> Option<u8> {
        self.data
            .get(PRIORITY_KEY)
            .and_then(|v| v.as_u64())
            .and_then(|v| u8::try_from(v).ok())
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A decoded deposit travelling from `source` to `destination`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub source: DomainId,
    pub destination: DomainId,
    pub deposit_nonce: DepositNonce,
    pub resource_id: ResourceId,
    pub transfer_type: TransferType,
    /// Ordered opaque fields, layout depends on `transfer_type`
    pub payload: Vec<Vec<u8>>,
    pub metadata: Metadata,
}

impl Message {
    pub fn new(
        source: DomainId,
        destination: DomainId,
        deposit_nonce: DepositNonce,
        resource_id: ResourceId,
        transfer_type: TransferType,
        payload: Vec<Vec<u8>>,
        metadata: Metadata,
    ) -> Self {
        Self {
            source,
            destination,
            deposit_nonce,
            resource_id,
            transfer_type,
            payload,
            metadata,
        }
    }

    pub fn priority(&self) -> Option<u8> {
        self.metadata.priority()
    }
}
