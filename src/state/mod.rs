//! Key/value persistence for listener progress and nonces
//!
//! Values are stored as minimal big-endian integer bytes under keys of the
//! form `chain:<domain>:block` and `chain:<domain>:nonce`.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use crate::error::{RelayerError, RelayerResult};
use crate::message::DomainId;

use async_trait::async_trait;
use ethers::types::U256;
use std::sync::Arc;

/// Byte-oriented key/value store
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Returns `None` when the key has never been written
    async fn get_by_key(&self, key: &str) -> RelayerResult<Option<Vec<u8>>>;

    async fn set_by_key(&self, key: &str, value: &[u8]) -> RelayerResult<()>;
}

/// Typed accessors for per-chain progress
#[derive(Clone)]
pub struct ChainStore {
    store: Arc<dyn KeyValueStore>,
}

impl ChainStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn block_key(domain_id: DomainId) -> String {
        format!("chain:{}:block", domain_id)
    }

    pub fn nonce_key(domain_id: DomainId) -> String {
        format!("chain:{}:nonce", domain_id)
    }

    /// Last block whose deposits were fully processed
    pub async fn last_block(&self, domain_id: DomainId) -> RelayerResult<Option<u64>> {
        let key = Self::block_key(domain_id);
        match self.get_integer(&key).await? {
            Some(value) if value > U256::from(u64::MAX) => Err(RelayerError::Store(format!(
                "{} holds {} which does not fit a block number",
                key, value
            ))),
            Some(value) => Ok(Some(value.as_u64())),
            None => Ok(None),
        }
    }

    pub async fn store_block(&self, domain_id: DomainId, block: u64) -> RelayerResult<()> {
        self.set_integer(&Self::block_key(domain_id), U256::from(block))
            .await
    }

    /// Next nonce the relayer intends to use on this chain
    pub async fn last_nonce(&self, domain_id: DomainId) -> RelayerResult<Option<U256>> {
        self.get_integer(&Self::nonce_key(domain_id)).await
    }

    pub async fn store_nonce(&self, domain_id: DomainId, nonce: U256) -> RelayerResult<()> {
        self.set_integer(&Self::nonce_key(domain_id), nonce).await
    }

    async fn get_integer(&self, key: &str) -> RelayerResult<Option<U256>> {
        let Some(bytes) = self.store.get_by_key(key).await? else {
            return Ok(None);
        };
        if bytes.len() > 32 {
            return Err(RelayerError::Store(format!(
                "{} holds {} bytes, expected at most 32",
                key,
                bytes.len()
            )));
        }
        Ok(Some(U256::from_big_endian(&bytes)))
    }

    async fn set_integer(&self, key: &str, value: U256) -> RelayerResult<()> {
        self.store.set_by_key(key, &to_minimal_be(value)).await
    }
}

fn to_minimal_be(value: U256) -> Vec<u8> {
    let mut buf = [0u8; 32];
    value.to_big_endian(&mut buf);
    let first = buf.iter().position(|b| *b != 0).unwrap_or(buf.len());
    buf[first..].to_vec()
}
