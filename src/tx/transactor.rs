//! Signed transaction submission
//!
//! `SignAndSendTransactor` holds the chain's nonce for the whole
//! resolve → price → sign → submit sequence so two submissions can never
//! race for the same nonce. Nothing is retried here.

use super::gas::{GasPrice, GasPriceStrategy};
use super::nonce::NonceTracker;
use crate::chain::ChainClient;
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, TransactionRequest, H256, U256};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

/// Per-transaction overrides; zero values defer to the chain defaults
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactOptions {
    pub gas_limit: u64,
    /// Zero means "ask the gas price strategy"
    pub gas_price: U256,
    pub value: U256,
    /// Explicit nonce, bypassing the tracker
    pub nonce: Option<U256>,
    pub chain_id: u64,
    pub priority: Option<u8>,
}

impl TransactOptions {
    /// Fill every unset field from `defaults`
    pub fn merge(self, defaults: &TransactOptions) -> TransactOptions {
        TransactOptions {
            gas_limit: if self.gas_limit == 0 {
                defaults.gas_limit
            } else {
                self.gas_limit
            },
            gas_price: if self.gas_price.is_zero() {
                defaults.gas_price
            } else {
                self.gas_price
            },
            value: if self.value.is_zero() {
                defaults.value
            } else {
                self.value
            },
            nonce: self.nonce.or(defaults.nonce),
            chain_id: if self.chain_id == 0 {
                defaults.chain_id
            } else {
                self.chain_id
            },
            priority: self.priority.or(defaults.priority),
        }
    }
}

/// Sends a contract call as a signed transaction
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transactor: Send + Sync {
    async fn transact(
        &self,
        to: Address,
        data: Bytes,
        opts: TransactOptions,
    ) -> RelayerResult<H256>;
}

/// Everything needed to rebuild a submitted transaction
#[derive(Debug, Clone)]
pub struct RawTx {
    pub nonce: U256,
    pub to: Address,
    pub value: U256,
    pub gas_limit: u64,
    pub gas_price: GasPrice,
    pub data: Bytes,
    pub chain_id: u64,
    pub submit_time: Instant,
    pub creation_time: Instant,
}

impl RawTx {
    /// Legacy or EIP-1559 request depending on the price shape
    pub fn to_typed(&self) -> TypedTransaction {
        match &self.gas_price {
            GasPrice::Legacy(price) => TransactionRequest::new()
                .to(self.to)
                .data(self.data.clone())
                .value(self.value)
                .nonce(self.nonce)
                .gas(self.gas_limit)
                .gas_price(*price)
                .chain_id(self.chain_id)
                .into(),
            GasPrice::Eip1559 {
                max_priority_fee_per_gas,
                max_fee_per_gas,
            } => TypedTransaction::Eip1559(
                Eip1559TransactionRequest::new()
                    .to(self.to)
                    .data(self.data.clone())
                    .value(self.value)
                    .nonce(self.nonce)
                    .gas(self.gas_limit)
                    .max_priority_fee_per_gas(*max_priority_fee_per_gas)
                    .max_fee_per_gas(*max_fee_per_gas)
                    .chain_id(self.chain_id),
            ),
        }
    }
}

/// Submits transactions with tracked nonces and strategy-derived prices
pub struct SignAndSendTransactor {
    client: Arc<dyn ChainClient>,
    gas_strategy: Arc<dyn GasPriceStrategy>,
    nonces: Arc<NonceTracker>,
    defaults: TransactOptions,
}

impl SignAndSendTransactor {
    pub fn new(
        client: Arc<dyn ChainClient>,
        gas_strategy: Arc<dyn GasPriceStrategy>,
        nonces: Arc<NonceTracker>,
        defaults: TransactOptions,
    ) -> Self {
        Self {
            client,
            gas_strategy,
            nonces,
            defaults,
        }
    }

    pub fn client(&self) -> &Arc<dyn ChainClient> {
        &self.client
    }

    /// Submit a new transaction, returning its hash and construction record
    pub async fn submit(
        &self,
        to: Address,
        data: Bytes,
        opts: TransactOptions,
    ) -> RelayerResult<(H256, RawTx)> {
        let mut nonce_guard = self.nonces.acquire().await;

        let opts = opts.merge(&self.defaults);
        let nonce = match opts.nonce {
            Some(nonce) => nonce,
            None => nonce_guard.unsafe_nonce().await?,
        };

        let gas_price = if opts.gas_price.is_zero() {
            self.gas_strategy.gas_price(opts.priority).await?
        } else {
            GasPrice::Legacy(opts.gas_price)
        };

        let now = Instant::now();
        let raw = RawTx {
            nonce,
            to,
            value: opts.value,
            gas_limit: opts.gas_limit,
            gas_price,
            data,
            chain_id: opts.chain_id,
            submit_time: now,
            creation_time: now,
        };

        let hash = match self.client.sign_and_send_transaction(raw.to_typed()).await {
            Ok(hash) => hash,
            Err(e) => {
                if matches!(e, RelayerError::NonceTooLow { .. }) {
                    nonce_guard.reset();
                }
                return Err(e);
            }
        };

        if opts.nonce.is_none() {
            nonce_guard.increase().await?;
        }
        nonce_guard.release();

        info!(
            chain_id = raw.chain_id,
            nonce = %raw.nonce,
            gas_price = ?raw.gas_price.to_vec(),
            "Transaction sent: {:?}",
            hash
        );
        crate::metrics::record_tx_submitted(raw.chain_id);

        Ok((hash, raw))
    }

    /// Re-sign and submit `raw` as-is; its nonce is already owned by it
    pub async fn resend(&self, raw: &RawTx) -> RelayerResult<H256> {
        debug!(nonce = %raw.nonce, "Resending transaction");
        self.client.sign_and_send_transaction(raw.to_typed()).await
    }
}

#[async_trait]
impl Transactor for SignAndSendTransactor {
    async fn transact(
        &self,
        to: Address,
        data: Bytes,
        opts: TransactOptions,
    ) -> RelayerResult<H256> {
        self.submit(to, data, opts).await.map(|(hash, _)| hash)
    }
}
