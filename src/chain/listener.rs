//! Deposit listener for a source chain
//!
//! Polls confirmed block ranges for bridge `Deposit` logs, decodes each one
//! into a `Message` and pushes it onto the router bus. Progress is persisted
//! after every range so a restart resumes from the next unprocessed block.

use super::ChainClient;
use crate::config::ChainConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{DepositEvent, DEPOSIT_TOPIC};
use crate::message::codec::MessageHeader;
use crate::message::{DepositCodec, Message};
use crate::state::ChainStore;

use ethers::types::{Filter, Log};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Listens for deposits on a specific chain
pub struct ChainListener {
    /// Chain configuration
    config: ChainConfig,
    client: Arc<dyn ChainClient>,
    /// Block checkpoint persistence
    store: ChainStore,
    codec: DepositCodec,
    /// Router bus
    bus: mpsc::Sender<Message>,
}

impl ChainListener {
    pub fn new(
        config: ChainConfig,
        client: Arc<dyn ChainClient>,
        store: ChainStore,
        codec: DepositCodec,
        bus: mpsc::Sender<Message>,
    ) -> Self {
        Self {
            config,
            client,
            store,
            codec,
            bus,
        }
    }

    pub fn domain_id(&self) -> u8 {
        self.config.domain_id
    }

    /// First block to scan: the configured start block on a fresh start or
    /// an empty store, otherwise the block after the last one processed.
    /// A start block of zero means the current head.
    pub async fn starting_block(&self) -> RelayerResult<u64> {
        let stored = if self.config.fresh_start {
            None
        } else {
            self.store.last_block(self.config.domain_id).await?
        };

        match stored {
            Some(block) => Ok(block + 1),
            None if self.config.start_block == 0 => self.client.latest_block().await,
            None => Ok(self.config.start_block),
        }
    }

    /// Main polling loop, returns when `token` is cancelled or the bus closes
    pub async fn run(&self, token: CancellationToken) -> RelayerResult<()> {
        let mut next = self.starting_block().await?;
        let retry = self.config.block_retry_interval();

        info!(
            "Listening for deposits on {} (domain {}) from block {}",
            self.config.name, self.config.domain_id, next
        );

        loop {
            if token.is_cancelled() {
                info!("Listener for domain {} stopped", self.config.domain_id);
                return Ok(());
            }

            let head = match self.client.latest_block().await {
                Ok(head) => head,
                Err(e) => {
                    warn!(
                        "Failed to get block number on domain {}: {}",
                        self.config.domain_id, e
                    );
                    sleep_or_cancel(&token, retry).await;
                    continue;
                }
            };

            // Only process blocks that have enough confirmations
            let confirmed = match head.checked_sub(self.config.block_confirmations) {
                Some(confirmed) if confirmed >= next => confirmed,
                _ => {
                    sleep_or_cancel(&token, retry).await;
                    continue;
                }
            };

            // Limit the range to prevent huge queries
            let to = confirmed.min(next + self.config.max_block_range.max(1) - 1);

            match self.process_range(next, to).await {
                Ok(()) => next = to + 1,
                Err(RelayerError::Internal(e)) => return Err(RelayerError::Internal(e)),
                Err(e) => {
                    // Don't advance, the range is retried
                    if e.is_retryable() {
                        warn!(
                            "Failed to process blocks {}..={} on domain {}: {}",
                            next, to, self.config.domain_id, e
                        );
                    } else {
                        error!(
                            "Failed to process blocks {}..={} on domain {}: {}",
                            next, to, self.config.domain_id, e
                        );
                    }
                    sleep_or_cancel(&token, retry).await;
                }
            }
        }
    }

    /// Fetch, decode and forward every deposit in `from..=to`, then persist `to`
    pub async fn process_range(&self, from: u64, to: u64) -> RelayerResult<()> {
        debug!(
            "Domain {}: processing blocks {} to {}",
            self.config.domain_id, from, to
        );

        let filter = Filter::new()
            .address(self.config.bridge_address)
            .topic0(*DEPOSIT_TOPIC)
            .from_block(from)
            .to_block(to);

        let logs = self.client.fetch_logs(filter).await?;

        for log in logs {
            let (event, message) = match self.decode_log(&log) {
                Ok(decoded) => decoded,
                Err(e) => {
                    // one bad deposit must not hold back its siblings
                    error!(
                        block = ?log.block_number,
                        tx = ?log.transaction_hash,
                        "Skipping deposit on domain {}: {}",
                        self.config.domain_id,
                        e
                    );
                    crate::metrics::record_decode_failure(self.config.domain_id);
                    continue;
                }
            };

            info!(
                block = event.block_number,
                tx = ?event.tx_hash,
                depositor = ?event.user,
                "Deposit {} from domain {} to domain {} (resource {})",
                message.deposit_nonce,
                message.source,
                message.destination,
                message.resource_id
            );
            crate::metrics::record_deposit(message.source, message.destination);

            self.bus
                .send(message)
                .await
                .map_err(|_| RelayerError::Internal("router bus closed".to_string()))?;
        }

        if let Err(e) = self.store.store_block(self.config.domain_id, to).await {
            warn!(
                "Failed to save block {} for domain {}: {}",
                to, self.config.domain_id, e
            );
        }
        crate::metrics::record_blocks_processed(self.config.domain_id, to);

        Ok(())
    }

    fn decode_log(&self, log: &Log) -> RelayerResult<(DepositEvent, Message)> {
        let event = DepositEvent::parse(log)?;

        let resource = self.config.resource(&event.resource_id).ok_or_else(|| {
            RelayerError::EventParsing(format!(
                "no handler configured for resource {}",
                event.resource_id
            ))
        })?;

        let header = MessageHeader {
            source: self.config.domain_id,
            destination: event.destination_domain_id,
            deposit_nonce: event.deposit_nonce,
            resource_id: event.resource_id,
        };

        let message = self
            .codec
            .decode(header, resource.transfer_type, &event.data)?;
        Ok((event, message))
    }
}

async fn sleep_or_cancel(token: &CancellationToken, duration: std::time::Duration) {
    tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}
