//! Chain client with multi-RPC support and automatic failover

use super::{ChainClient, GasPriceClient};
use crate::config::ChainConfig;
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Multi-provider EVM client that signs with a local wallet
pub struct EvmClient {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Wallet for signing
    wallet: LocalWallet,
}

impl EvmClient {
    /// Create a new chain client
    pub fn new(config: ChainConfig, wallet: LocalWallet) -> RelayerResult<Self> {
        let mut http_providers = Vec::new();

        // Initialize HTTP providers
        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(RelayerError::ChainConnection {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        let wallet = wallet.with_chain_id(config.chain_id);

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            wallet,
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    /// Run a read against each provider in turn until one answers
    async fn with_failover<T, F, Fut>(&self, operation: &str, f: F) -> RelayerResult<T>
    where
        F: Fn(Provider<Http>) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        for _ in 0..self.http_providers.len() {
            match f(self.http().clone()).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(
                        "Failed to {} on chain {}: {}",
                        operation, self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(RelayerError::ChainConnection {
            chain_id: self.config.chain_id,
            message: format!("All providers failed to {}", operation),
        })
    }

    fn connection_error(&self, e: impl std::fmt::Display) -> RelayerError {
        RelayerError::ChainConnection {
            chain_id: self.config.chain_id,
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl ChainClient for EvmClient {
    fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    fn relayer_address(&self) -> Address {
        self.wallet.address()
    }

    async fn latest_block(&self) -> RelayerResult<u64> {
        self.with_failover("get block number", |p| async move {
            p.get_block_number().await
        })
        .await
        .map(|b| b.as_u64())
    }

    async fn pending_nonce(&self) -> RelayerResult<U256> {
        self.http()
            .get_transaction_count(self.wallet.address(), Some(BlockNumber::Pending.into()))
            .await
            .map_err(|e| RelayerError::Nonce {
                chain_id: self.config.chain_id,
                message: e.to_string(),
            })
    }

    async fn call_contract(
        &self,
        to: Address,
        data: Bytes,
        block: Option<u64>,
    ) -> RelayerResult<Bytes> {
        let tx: TypedTransaction = TransactionRequest::new()
            .from(self.wallet.address())
            .to(to)
            .data(data)
            .into();
        let block = block.map(|b| BlockId::Number(BlockNumber::Number(b.into())));

        self.http()
            .call(&tx, block)
            .await
            .map_err(|e| RelayerError::Contract(e.to_string()))
    }

    async fn sign_and_send_transaction(&self, mut tx: TypedTransaction) -> RelayerResult<H256> {
        tx.set_from(self.wallet.address());

        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| RelayerError::Wallet(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);

        let pending = self
            .http()
            .send_raw_transaction(raw)
            .await
            .map_err(|e| RelayerError::from_submission(self.config.chain_id, e.to_string()))?;

        Ok(pending.tx_hash())
    }

    async fn transaction_receipt(&self, hash: H256) -> RelayerResult<Option<TransactionReceipt>> {
        self.http()
            .get_transaction_receipt(hash)
            .await
            .map_err(|e| self.connection_error(e))
    }

    async fn fetch_logs(&self, filter: Filter) -> RelayerResult<Vec<Log>> {
        self.with_failover("get logs", |p| {
            let filter = filter.clone();
            async move { p.get_logs(&filter).await }
        })
        .await
    }
}

#[async_trait]
impl GasPriceClient for EvmClient {
    async fn suggest_gas_price(&self) -> RelayerResult<U256> {
        self.http()
            .get_gas_price()
            .await
            .map_err(|e| RelayerError::GasPrice(e.to_string()))
    }

    async fn base_fee(&self) -> RelayerResult<Option<U256>> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| RelayerError::GasPrice(e.to_string()))?
            .ok_or_else(|| RelayerError::GasPrice("No latest block".to_string()))?;

        Ok(block.base_fee_per_gas)
    }

    async fn suggest_gas_tip_cap(&self) -> RelayerResult<U256> {
        self.http()
            .request::<_, U256>("eth_maxPriorityFeePerGas", ())
            .await
            .map_err(|e| RelayerError::GasPrice(e.to_string()))
    }
}
