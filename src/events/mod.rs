//! Bridge deposit event parsing
//!
//! The source-chain bridge emits
//! `Deposit(uint8 destinationDomainID, bytes32 resourceID, uint64 depositNonce,
//! address indexed user, bytes data, bytes handlerResponse)` for every
//! deposit. Only the depositor address is indexed.

use crate::error::{RelayerError, RelayerResult};
use crate::message::{DepositNonce, DomainId, ResourceId};

use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Log, H256};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

pub const DEPOSIT_SIGNATURE: &str = "Deposit(uint8,bytes32,uint64,address,bytes,bytes)";

lazy_static! {
    /// Topic 0 of bridge deposit logs
    pub static ref DEPOSIT_TOPIC: H256 = H256::from(keccak256(DEPOSIT_SIGNATURE.as_bytes()));
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// A deposit observed on the source chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositEvent {
    pub destination_domain_id: DomainId,
    pub resource_id: ResourceId,
    pub deposit_nonce: DepositNonce,
    pub user: Address,
    /// Handler calldata, decoded by the deposit codec
    pub data: Vec<u8>,
    pub block_number: u64,
    pub tx_hash: H256,
}

impl DepositEvent {
    /// Parse a bridge log into a deposit
    pub fn parse(log: &Log) -> RelayerResult<Self> {
        match log.topics.first() {
            Some(topic) if *topic == *DEPOSIT_TOPIC => {}
            other => {
                return Err(RelayerError::EventParsing(format!(
                    "not a deposit log: topic {:?}",
                    other
                )))
            }
        }

        let user = log
            .topics
            .get(1)
            .map(|t| Address::from_slice(&t.0[12..32]))
            .ok_or_else(|| RelayerError::EventParsing("deposit log missing user topic".into()))?;

        let tokens = abi::decode(
            &[
                ParamType::Uint(8),
                ParamType::FixedBytes(32),
                ParamType::Uint(64),
                ParamType::Bytes,
                ParamType::Bytes,
            ],
            &log.data,
        )
        .map_err(|e| RelayerError::EventParsing(format!("invalid deposit data: {}", e)))?;

        match tokens.as_slice() {
            [Token::Uint(destination), Token::FixedBytes(resource), Token::Uint(nonce), Token::Bytes(data), Token::Bytes(_)] =>
            {
                let mut resource_id = [0u8; 32];
                resource_id.copy_from_slice(resource);

                Ok(Self {
                    destination_domain_id: destination.low_u32() as DomainId,
                    resource_id: ResourceId(resource_id),
                    deposit_nonce: nonce.as_u64(),
                    user,
                    data: data.clone(),
                    block_number: log.block_number.map(|b| b.as_u64()).unwrap_or(0),
                    tx_hash: log.transaction_hash.unwrap_or_default(),
                })
            }
            _ => Err(RelayerError::EventParsing(
                "unexpected deposit token layout".into(),
            )),
        }
    }
}
