//! Chain module - the capability boundary between the relay core and a chain
//!
//! This module provides:
//! - `ChainClient`: contract reads, signed submission, receipts, logs
//! - `GasPriceClient`: the fee readings gas strategies are built on
//! - `EvmClient`: an ethers-backed implementation with RPC failover
//! - `ChainListener`: deposit polling for a source chain

pub mod listener;
pub mod provider;

pub use listener::ChainListener;
pub use provider::EvmClient;

use crate::error::RelayerResult;

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Filter, Log, TransactionReceipt, H256, U256};

#[cfg(test)]
use mockall::automock;

/// Read/submit capabilities of a connected chain
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// EVM chain id used for transaction signing
    fn chain_id(&self) -> u64;

    /// Address the relayer signs with
    fn relayer_address(&self) -> Address;

    async fn latest_block(&self) -> RelayerResult<u64>;

    /// Next nonce for the relayer address, counting pool transactions
    async fn pending_nonce(&self) -> RelayerResult<U256>;

    /// `eth_call` against `to`; `block` of `None` means latest
    async fn call_contract(
        &self,
        to: Address,
        data: Bytes,
        block: Option<u64>,
    ) -> RelayerResult<Bytes>;

    async fn sign_and_send_transaction(&self, tx: TypedTransaction) -> RelayerResult<H256>;

    /// `Ok(None)` while the transaction is not mined
    async fn transaction_receipt(&self, hash: H256) -> RelayerResult<Option<TransactionReceipt>>;

    async fn fetch_logs(&self, filter: Filter) -> RelayerResult<Vec<Log>>;
}

/// Fee readings used by gas price strategies
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GasPriceClient: Send + Sync {
    async fn suggest_gas_price(&self) -> RelayerResult<U256>;

    /// `None` on chains without an EIP-1559 base fee
    async fn base_fee(&self) -> RelayerResult<Option<U256>>;

    async fn suggest_gas_tip_cap(&self) -> RelayerResult<U256>;
}
