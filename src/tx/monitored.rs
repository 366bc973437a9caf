//! Stuck transaction supervision
//!
//! Every transaction sent through `MonitoredTransactor` is remembered by hash
//! until a receipt shows up or it times out. A periodic sweep resubmits
//! transactions that have been waiting longer than the grace window, with the
//! same nonce and an escalated price, and re-keys them under the new hash.

use super::gas::GasPrice;
use super::transactor::{RawTx, SignAndSendTransactor, TransactOptions, Transactor};
use crate::config::MonitorConfig;
use crate::error::RelayerResult;
use crate::metrics;

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Resend tuning for one chain
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub resend_interval: Duration,
    pub tx_timeout: Duration,
    pub too_new: Duration,
    pub increase_percentage: u64,
    pub max_gas_price: U256,
}

impl From<&MonitorConfig> for MonitorSettings {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            resend_interval: config.resend_interval(),
            tx_timeout: config.tx_timeout(),
            too_new: config.too_new(),
            increase_percentage: config.increase_percentage,
            max_gas_price: config.max_gas_price(),
        }
    }
}

/// Transactor that keeps resubmitting until the network picks a transaction up
pub struct MonitoredTransactor {
    inner: SignAndSendTransactor,
    /// Pending transactions keyed by their latest hash
    pending: Mutex<HashMap<H256, RawTx>>,
    settings: MonitorSettings,
}

impl MonitoredTransactor {
    pub fn new(inner: SignAndSendTransactor, settings: MonitorSettings) -> Self {
        Self {
            inner,
            pending: Mutex::new(HashMap::new()),
            settings,
        }
    }

    /// Run the resend sweep until `token` is cancelled
    pub async fn monitor(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = time::interval(self.settings.resend_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        info!(
            chain_id = self.inner.client().chain_id(),
            "Transaction monitor started"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    let pending = self.pending.lock().await.len();
                    info!(
                        chain_id = self.inner.client().chain_id(),
                        pending,
                        "Transaction monitor stopped"
                    );
                    return;
                }
                _ = ticker.tick() => self.sweep().await,
            }
        }
    }

    /// Inspect every pending transaction once
    pub async fn sweep(&self) {
        let snapshot: Vec<(H256, RawTx)> = self
            .pending
            .lock()
            .await
            .iter()
            .map(|(hash, raw)| (*hash, raw.clone()))
            .collect();

        for (hash, raw) in snapshot {
            self.check(hash, raw).await;
        }
    }

    async fn check(&self, hash: H256, mut raw: RawTx) {
        let chain_id = raw.chain_id;

        match self.inner.client().transaction_receipt(hash).await {
            Ok(Some(receipt)) => {
                if receipt.status.map_or(false, |s| s.as_u64() == 1) {
                    info!(chain_id, nonce = %raw.nonce, "Transaction {:?} confirmed", hash);
                    metrics::record_tx_confirmed(chain_id);
                } else {
                    error!(chain_id, nonce = %raw.nonce, "Transaction {:?} reverted", hash);
                    metrics::record_tx_failed(chain_id);
                }
                self.pending.lock().await.remove(&hash);
                return;
            }
            Ok(None) => {}
            Err(e) => {
                debug!(chain_id, "Receipt lookup for {:?} failed: {}", hash, e);
            }
        }

        if raw.creation_time.elapsed() >= self.settings.tx_timeout {
            error!(
                chain_id,
                nonce = %raw.nonce,
                "Transaction {:?} not mined within {:?}, giving up",
                hash,
                self.settings.tx_timeout
            );
            metrics::record_tx_timed_out(chain_id);
            self.pending.lock().await.remove(&hash);
            return;
        }

        if raw.submit_time.elapsed() < self.settings.too_new {
            return;
        }

        raw.gas_price = self.increase_gas(&raw.gas_price);
        raw.submit_time = Instant::now();

        match self.inner.resend(&raw).await {
            Ok(new_hash) => {
                info!(
                    chain_id,
                    nonce = %raw.nonce,
                    gas_price = ?raw.gas_price.to_vec(),
                    "Resent transaction {:?} as {:?}",
                    hash,
                    new_hash
                );
                metrics::record_tx_resent(chain_id);
                let mut pending = self.pending.lock().await;
                pending.remove(&hash);
                pending.insert(new_hash, raw);
            }
            Err(e) => {
                warn!(
                    chain_id,
                    nonce = %raw.nonce,
                    "Failed to resend transaction {:?}: {}",
                    hash,
                    e
                );
                // keep the escalated price so the next attempt starts from it
                if let Some(entry) = self.pending.lock().await.get_mut(&hash) {
                    entry.gas_price = raw.gas_price;
                    entry.submit_time = raw.submit_time;
                }
            }
        }
    }

    /// Escalate every price element by the configured percentage
    pub fn increase_gas(&self, price: &GasPrice) -> GasPrice {
        let percentage = U256::from(self.settings.increase_percentage);
        let max = self.settings.max_gas_price;

        price.map(|p| {
            let increase = (p * percentage / 100).max(U256::one());
            p.saturating_add(increase).min(max).max(p)
        })
    }

    #[cfg(test)]
    async fn pending_hashes(&self) -> Vec<H256> {
        self.pending.lock().await.keys().copied().collect()
    }
}

#[async_trait]
impl Transactor for MonitoredTransactor {
    async fn transact(
        &self,
        to: Address,
        data: Bytes,
        opts: TransactOptions,
    ) -> RelayerResult<H256> {
        let (hash, raw) = self.inner.submit(to, data, opts).await?;
        self.pending.lock().await.insert(hash, raw);
        Ok(hash)
    }
}
