//! Nonce ownership for a single chain connection
//!
//! Exactly one submission may hold the nonce at a time. A holder reads the
//! next value with `unsafe_nonce`, submits, and calls `increase` only when the
//! submission was accepted. Dropping the guard releases ownership on every
//! path, including early returns through `?`.

use crate::chain::ChainClient;
use crate::error::{RelayerError, RelayerResult};
use crate::message::DomainId;
use crate::state::ChainStore;

use ethers::types::U256;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Serializes nonce use across concurrent submissions
pub struct NonceTracker {
    domain_id: DomainId,
    client: Arc<dyn ChainClient>,
    store: ChainStore,
    /// Next nonce to use, resolved lazily on first acquisition
    current: Mutex<Option<U256>>,
}

/// Exclusive ownership of the nonce, released on drop
pub struct NonceGuard<'a> {
    tracker: &'a NonceTracker,
    slot: MutexGuard<'a, Option<U256>>,
}

impl NonceTracker {
    pub fn new(domain_id: DomainId, client: Arc<dyn ChainClient>, store: ChainStore) -> Self {
        Self {
            domain_id,
            client,
            store,
            current: Mutex::new(None),
        }
    }

    /// Wait until no other submission holds the nonce
    pub async fn acquire(&self) -> NonceGuard<'_> {
        NonceGuard {
            tracker: self,
            slot: self.current.lock().await,
        }
    }

    /// Higher of the persisted nonce and the chain's pending count. A stored
    /// value can be ahead of a node that has not indexed our last submissions.
    async fn resolve(&self) -> RelayerResult<U256> {
        let persisted = self.store.last_nonce(self.domain_id).await?;
        let pending = self.client.pending_nonce().await.map_err(|e| match e {
            RelayerError::Nonce { .. } => e,
            other => RelayerError::Nonce {
                chain_id: self.client.chain_id(),
                message: other.to_string(),
            },
        })?;

        let nonce = persisted.map_or(pending, |stored| stored.max(pending));
        debug!(
            domain = self.domain_id,
            ?persisted,
            %pending,
            %nonce,
            "Resolved starting nonce"
        );
        Ok(nonce)
    }
}

impl NonceGuard<'_> {
    /// Next nonce to use; not reserved until `increase` is called
    pub async fn unsafe_nonce(&mut self) -> RelayerResult<U256> {
        if let Some(nonce) = *self.slot {
            return Ok(nonce);
        }

        let nonce = self.tracker.resolve().await?;
        *self.slot = Some(nonce);
        Ok(nonce)
    }

    /// Advance past a nonce that was just accepted by the network
    pub async fn increase(&mut self) -> RelayerResult<U256> {
        let next = self.unsafe_nonce().await? + 1;
        *self.slot = Some(next);

        // Submission already happened; a lost write is recovered from the
        // chain's pending nonce on restart.
        if let Err(e) = self
            .tracker
            .store
            .store_nonce(self.tracker.domain_id, next)
            .await
        {
            warn!(
                domain = self.tracker.domain_id,
                "Failed to persist nonce {}: {}", next, e
            );
        }
        Ok(next)
    }

    /// Forget the cached value so the next holder re-reads chain and store
    pub fn reset(&mut self) {
        *self.slot = None;
    }

    /// Release ownership explicitly
    pub fn release(self) {}
}
