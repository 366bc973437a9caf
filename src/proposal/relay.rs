//! Vote/execute state machine for one destination chain
//!
//! Relayers act independently. Duplicate work is avoided by reading the
//! proposal status from the bridge, never by coordinating with each other:
//! a failed vote is abandoned once the proposal no longer needs votes and a
//! failed execution once it is executed or cancelled. Bridge reads share the
//! transaction retry budget. Exhausting any budget, including the wait for a
//! voted proposal to pass, is reported on the fatal error channel.

use super::{Bridge, Proposal, ProposalStatus};
use crate::config::{ChainConfig, RelayerConfig};
use crate::error::{RelayerError, RelayerResult};
use crate::message::{DepositNonce, DomainId, Message, ResourceId};
use crate::metrics;
use crate::tx::TransactOptions;

use dashmap::DashSet;
use ethers::types::{Address, H256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Retry and polling limits for proposal transactions
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub limit: u32,
    pub delay: Duration,
    pub watch_limit: u32,
    pub watch_interval: Duration,
}

impl From<&RelayerConfig> for RetryPolicy {
    fn from(config: &RelayerConfig) -> Self {
        Self {
            limit: config.proposal_retry_limit,
            delay: config.proposal_retry_delay(),
            watch_limit: config.execute_watch_limit,
            watch_interval: config.execute_watch_interval(),
        }
    }
}

/// Delivers messages as proposals on one destination chain
pub struct ProposalRelay {
    domain_id: DomainId,
    bridge: Arc<dyn Bridge>,
    /// Destination handler per resource
    handlers: HashMap<ResourceId, Address>,
    policy: RetryPolicy,
    /// Proposals this process has voted on
    votes: DashSet<(DomainId, DepositNonce, H256)>,
    errors: mpsc::UnboundedSender<RelayerError>,
}

impl ProposalRelay {
    pub fn new(
        config: &ChainConfig,
        bridge: Arc<dyn Bridge>,
        policy: RetryPolicy,
        errors: mpsc::UnboundedSender<RelayerError>,
    ) -> Self {
        Self {
            domain_id: config.domain_id,
            bridge,
            handlers: config
                .resources
                .iter()
                .map(|r| (r.resource_id, r.handler_address))
                .collect(),
            policy,
            votes: DashSet::new(),
            errors,
        }
    }

    /// Relay every queued message concurrently until `token` is cancelled
    pub async fn run(
        self: Arc<Self>,
        mut queue: mpsc::Receiver<Message>,
        token: CancellationToken,
    ) {
        info!("Proposal relay for domain {} started", self.domain_id);

        loop {
            let message = tokio::select! {
                _ = token.cancelled() => break,
                message = queue.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let relay = self.clone();
            let token = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    result = relay.relay(message.clone()) => {
                        if let Err(e) = result {
                            error!(
                                source = message.source,
                                destination = message.destination,
                                nonce = message.deposit_nonce,
                                "Failed to relay message: {}",
                                e
                            );
                        }
                    }
                }
            });
        }

        info!("Proposal relay for domain {} stopped", self.domain_id);
    }

    /// Drive one message to execution, skipping whatever is already done
    pub async fn relay(&self, message: Message) -> RelayerResult<()> {
        // resources are checked against every destination at startup
        let handler = self.handlers.get(&message.resource_id).ok_or_else(|| {
            RelayerError::Config(format!(
                "no handler for resource {} on domain {}",
                message.resource_id, self.domain_id
            ))
        })?;
        let proposal = Proposal::from_message(&message, *handler)?;
        let opts = TransactOptions {
            priority: proposal.priority,
            ..TransactOptions::default()
        };

        let status = self
            .read("status read", &proposal, || {
                self.bridge.proposal_status(&proposal)
            })
            .await?;
        match status {
            ProposalStatus::Executed | ProposalStatus::Cancelled => {
                info!("Proposal {} already {}, skipping", proposal, status);
                self.forget(&proposal);
                return Ok(());
            }
            ProposalStatus::Passed => return self.execute_proposal(&proposal, opts).await,
            ProposalStatus::Inactive | ProposalStatus::Active => {}
        }

        if self.has_voted(&proposal).await? {
            debug!("Already voted on proposal {}", proposal);
        } else {
            self.vote_proposal(&proposal, opts.clone()).await?;
        }

        self.watch_then_execute(&proposal, opts).await
    }

    async fn has_voted(&self, proposal: &Proposal) -> RelayerResult<bool> {
        let key = vote_key(proposal);
        if self.votes.contains(&key) {
            return Ok(true);
        }

        let voted = self
            .read("vote check", proposal, || self.bridge.has_voted(proposal))
            .await?;
        if voted {
            self.votes.insert(key);
        }
        Ok(voted)
    }

    /// Bridge read with the same budget and backoff as transactions
    async fn read<T, F, Fut>(
        &self,
        operation: &'static str,
        proposal: &Proposal,
        mut call: F,
    ) -> RelayerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RelayerResult<T>>,
    {
        for attempt in 1..=self.policy.limit {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(
                        "Proposal {} {} failed (attempt {}): {}",
                        proposal, operation, attempt, e
                    );
                    sleep(self.policy.delay).await;
                }
            }
        }

        Err(self.exhausted(operation, proposal, self.policy.limit))
    }

    /// Vote, retrying until the vote lands or the proposal no longer needs it
    pub async fn vote_proposal(
        &self,
        proposal: &Proposal,
        opts: TransactOptions,
    ) -> RelayerResult<()> {
        for attempt in 1..=self.policy.limit {
            match self.bridge.vote_proposal(proposal, opts.clone()).await {
                Ok(hash) => {
                    info!("Voted on proposal {} in tx {:?}", proposal, hash);
                    metrics::record_vote(self.domain_id);
                    self.votes.insert(vote_key(proposal));
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        "Vote on proposal {} failed (attempt {}): {}",
                        proposal, attempt, e
                    );
                    sleep(self.policy.delay).await;
                }
                Err(e) => {
                    warn!(
                        "Vote on proposal {} failed (attempt {}): {}",
                        proposal, attempt, e
                    );
                    sleep(self.policy.delay).await;
                    if self.status_satisfies(proposal, ProposalStatus::is_complete).await {
                        info!("Proposal {} no longer needs votes", proposal);
                        return Ok(());
                    }
                }
            }
        }

        Err(self.exhausted("vote", proposal, self.policy.limit))
    }

    /// Execute, retrying until it lands or the proposal is finalized
    pub async fn execute_proposal(
        &self,
        proposal: &Proposal,
        opts: TransactOptions,
    ) -> RelayerResult<()> {
        for attempt in 1..=self.policy.limit {
            match self.bridge.execute_proposal(proposal, opts.clone()).await {
                Ok(hash) => {
                    info!("Executed proposal {} in tx {:?}", proposal, hash);
                    metrics::record_execution(self.domain_id);
                    self.forget(proposal);
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        "Execution of proposal {} failed (attempt {}): {}",
                        proposal, attempt, e
                    );
                    sleep(self.policy.delay).await;
                }
                Err(e) => {
                    warn!(
                        "Execution of proposal {} failed (attempt {}): {}",
                        proposal, attempt, e
                    );
                    sleep(self.policy.delay).await;
                    if self.status_satisfies(proposal, ProposalStatus::is_finalized).await {
                        info!("Proposal {} finalized by another relayer", proposal);
                        self.forget(proposal);
                        return Ok(());
                    }
                }
            }
        }

        Err(self.exhausted("execute", proposal, self.policy.limit))
    }

    /// Poll until the proposal passes, then execute it
    async fn watch_then_execute(
        &self,
        proposal: &Proposal,
        opts: TransactOptions,
    ) -> RelayerResult<()> {
        for _ in 0..self.policy.watch_limit {
            sleep(self.policy.watch_interval).await;

            match self.bridge.proposal_status(proposal).await {
                Ok(ProposalStatus::Passed) => {
                    return self.execute_proposal(proposal, opts).await;
                }
                Ok(status) if status.is_finalized() => {
                    info!("Proposal {} {} while waiting", proposal, status);
                    self.forget(proposal);
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to read status of proposal {}: {}", proposal, e),
            }
        }

        Err(self.exhausted("watch", proposal, self.policy.watch_limit))
    }

    async fn status_satisfies(
        &self,
        proposal: &Proposal,
        done: impl Fn(&ProposalStatus) -> bool,
    ) -> bool {
        match self.bridge.proposal_status(proposal).await {
            Ok(status) => done(&status),
            Err(e) => {
                warn!("Failed to read status of proposal {}: {}", proposal, e);
                false
            }
        }
    }

    /// Drop the vote record of a proposal that needs no more work
    fn forget(&self, proposal: &Proposal) {
        self.votes.remove(&vote_key(proposal));
    }

    /// Report an exhausted retry budget on the fatal channel
    fn exhausted(
        &self,
        operation: &'static str,
        proposal: &Proposal,
        attempts: u32,
    ) -> RelayerError {
        let error = || RelayerError::RetriesExhausted {
            operation,
            source_id: proposal.source,
            destination_id: proposal.destination,
            deposit_nonce: proposal.deposit_nonce,
            attempts,
        };

        error!("{}", error());
        metrics::record_fatal_error(operation);
        if self.errors.send(error()).is_err() {
            warn!("Fatal error channel closed");
        }
        error()
    }
}

fn vote_key(proposal: &Proposal) -> (DomainId, DepositNonce, H256) {
    (proposal.source, proposal.deposit_nonce, proposal.data_hash())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GasPriceStrategyKind, ResourceConfig};
    use crate::message::{Metadata, TransferType};
    use crate::proposal::MockBridge;
    use ethers::abi::AbiEncode;
    use ethers::types::U256;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const RESOURCE: ResourceId = ResourceId([7; 32]);

    fn chain_config() -> ChainConfig {
        ChainConfig {
            domain_id: 2,
            chain_id: 5,
            name: "destination".to_string(),
            rpc_urls: vec![],
            bridge_address: Address::repeat_byte(0xbb),
            start_block: 0,
            fresh_start: false,
            block_confirmations: 0,
            block_retry_interval_ms: 1000,
            max_block_range: 100,
            gas_limit: 100_000,
            gas_price_strategy: GasPriceStrategyKind::Static,
            gas_multiplier: None,
            max_gas_price_gwei: None,
            resources: vec![ResourceConfig {
                resource_id: RESOURCE,
                handler_address: Address::repeat_byte(0x0d),
                transfer_type: TransferType::Fungible,
            }],
            monitor: None,
            enabled: true,
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            limit: 3,
            delay: Duration::from_secs(2),
            watch_limit: 5,
            watch_interval: Duration::from_secs(5),
        }
    }

    fn message() -> Message {
        Message::new(
            1,
            2,
            42,
            RESOURCE,
            TransferType::Fungible,
            vec![U256::from(1_000_000u64).encode(), vec![0x11; 20]],
            Metadata::default(),
        )
    }

    fn relay(bridge: MockBridge) -> (ProposalRelay, mpsc::UnboundedReceiver<RelayerError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ProposalRelay::new(&chain_config(), Arc::new(bridge), policy(), tx),
            rx,
        )
    }

    /// Status reads return `statuses` in order, repeating the last one
    fn status_sequence(bridge: &mut MockBridge, statuses: Vec<ProposalStatus>) {
        let calls = AtomicUsize::new(0);
        bridge.expect_proposal_status().returning(move |_| {
            let i = calls.fetch_add(1, Ordering::SeqCst);
            Ok(statuses[i.min(statuses.len() - 1)])
        });
    }

    #[tokio::test]
    async fn finalized_proposal_is_skipped() {
        let mut bridge = MockBridge::new();
        status_sequence(&mut bridge, vec![ProposalStatus::Executed]);
        bridge.expect_has_voted().never();
        bridge.expect_vote_proposal().never();
        bridge.expect_execute_proposal().never();

        let (relay, _rx) = relay(bridge);
        relay.relay(message()).await.unwrap();
    }

    #[tokio::test]
    async fn passed_proposal_is_executed_without_vote() {
        let mut bridge = MockBridge::new();
        status_sequence(&mut bridge, vec![ProposalStatus::Passed]);
        bridge.expect_vote_proposal().never();
        bridge
            .expect_execute_proposal()
            .times(1)
            .returning(|_, _| Ok(H256::repeat_byte(1)));

        let (relay, _rx) = relay(bridge);
        relay.relay(message()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn votes_then_executes_once_passed() {
        let mut bridge = MockBridge::new();
        status_sequence(
            &mut bridge,
            vec![
                ProposalStatus::Inactive,
                ProposalStatus::Active,
                ProposalStatus::Passed,
            ],
        );
        bridge.expect_has_voted().times(1).returning(|_| Ok(false));
        bridge
            .expect_vote_proposal()
            .times(1)
            .returning(|_, _| Ok(H256::repeat_byte(1)));
        bridge
            .expect_execute_proposal()
            .withf(|proposal, _| proposal.data_hash() != H256::zero())
            .times(1)
            .returning(|_, _| Ok(H256::repeat_byte(2)));

        let (relay, _rx) = relay(bridge);
        relay.relay(message()).await.unwrap();
        // executed proposals leave nothing behind
        assert!(relay.votes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn existing_vote_is_not_repeated() {
        let mut bridge = MockBridge::new();
        status_sequence(
            &mut bridge,
            vec![ProposalStatus::Active, ProposalStatus::Passed],
        );
        bridge.expect_has_voted().times(1).returning(|_| Ok(true));
        bridge.expect_vote_proposal().never();
        bridge
            .expect_execute_proposal()
            .times(1)
            .returning(|_, _| Ok(H256::repeat_byte(2)));

        let (relay, _rx) = relay(bridge);
        relay.relay(message()).await.unwrap();
    }

    #[tokio::test]
    async fn vote_check_is_cached() {
        let mut bridge = MockBridge::new();
        bridge.expect_has_voted().times(1).returning(|_| Ok(true));

        let (relay, _rx) = relay(bridge);
        let proposal = Proposal::from_message(&message(), Address::repeat_byte(0x0d)).unwrap();
        assert!(relay.has_voted(&proposal).await.unwrap());
        // served from the local cache the second time
        assert!(relay.has_voted(&proposal).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn status_read_error_is_retried() {
        let mut bridge = MockBridge::new();
        let reads = Arc::new(AtomicUsize::new(0));
        bridge.expect_proposal_status().returning({
            let reads = reads.clone();
            move |_| {
                if reads.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(RelayerError::ChainConnection {
                        chain_id: 5,
                        message: "connection reset".into(),
                    })
                } else {
                    Ok(ProposalStatus::Passed)
                }
            }
        });
        bridge
            .expect_execute_proposal()
            .times(1)
            .returning(|_, _| Ok(H256::repeat_byte(1)));

        let (relay, mut rx) = relay(bridge);
        relay.relay(message()).await.unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), 2);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unreadable_status_reports_fatal() {
        let mut bridge = MockBridge::new();
        bridge.expect_proposal_status().times(3).returning(|_| {
            Err(RelayerError::ChainConnection {
                chain_id: 5,
                message: "connection refused".into(),
            })
        });
        bridge.expect_vote_proposal().never();
        bridge.expect_execute_proposal().never();

        let (relay, mut rx) = relay(bridge);
        assert!(matches!(
            relay.relay(message()).await,
            Err(RelayerError::RetriesExhausted { operation: "status read", attempts: 3, .. })
        ));
        assert!(matches!(
            rx.try_recv(),
            Ok(RelayerError::RetriesExhausted { deposit_nonce: 42, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn vote_check_error_is_retried() {
        let mut bridge = MockBridge::new();
        status_sequence(
            &mut bridge,
            vec![ProposalStatus::Active, ProposalStatus::Passed],
        );
        let checks = AtomicUsize::new(0);
        bridge.expect_has_voted().times(2).returning(move |_| {
            if checks.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(RelayerError::Contract("empty response".into()))
            } else {
                Ok(false)
            }
        });
        bridge
            .expect_vote_proposal()
            .times(1)
            .returning(|_, _| Ok(H256::repeat_byte(1)));
        bridge
            .expect_execute_proposal()
            .times(1)
            .returning(|_, _| Ok(H256::repeat_byte(2)));

        let (relay, mut rx) = relay(bridge);
        relay.relay(message()).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_while_waiting_stops_watch() {
        let mut bridge = MockBridge::new();
        status_sequence(
            &mut bridge,
            vec![
                ProposalStatus::Active,
                ProposalStatus::Active,
                ProposalStatus::Cancelled,
            ],
        );
        bridge.expect_has_voted().times(1).returning(|_| Ok(false));
        bridge
            .expect_vote_proposal()
            .times(1)
            .returning(|_, _| Ok(H256::repeat_byte(1)));
        bridge.expect_execute_proposal().never();

        let (relay, mut rx) = relay(bridge);
        relay.relay(message()).await.unwrap();
        assert!(relay.votes.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn proposal_that_never_passes_reports_fatal() {
        let mut bridge = MockBridge::new();
        status_sequence(&mut bridge, vec![ProposalStatus::Active]);
        bridge.expect_has_voted().times(1).returning(|_| Ok(true));
        bridge.expect_execute_proposal().never();

        let (relay, mut rx) = relay(bridge);
        assert!(matches!(
            relay.relay(message()).await,
            Err(RelayerError::RetriesExhausted { operation: "watch", attempts: 5, .. })
        ));
        assert!(matches!(
            rx.try_recv(),
            Ok(RelayerError::RetriesExhausted { operation: "watch", .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failing_execution_exhausts_budget_and_reports_fatal() {
        let mut bridge = MockBridge::new();
        // passed throughout, so failures are never explained by finality
        status_sequence(&mut bridge, vec![ProposalStatus::Passed]);
        bridge.expect_vote_proposal().never();
        bridge
            .expect_execute_proposal()
            .times(3)
            .returning(|_, _| Err(RelayerError::Transaction("execution reverted".into())));

        let (relay, mut rx) = relay(bridge);
        assert!(matches!(
            relay.relay(message()).await,
            Err(RelayerError::RetriesExhausted { operation: "execute", attempts: 3, .. })
        ));
        assert!(matches!(
            rx.try_recv(),
            Ok(RelayerError::RetriesExhausted {
                operation: "execute",
                source_id: 1,
                destination_id: 2,
                deposit_nonce: 42,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_vote_errors_exhaust_budget_and_report_fatal() {
        let mut bridge = MockBridge::new();
        // transient failures do not re-check status
        bridge.expect_proposal_status().never();
        bridge
            .expect_vote_proposal()
            .times(3)
            .returning(|_, _| Err(RelayerError::NonceTooLow { chain_id: 5 }));

        let (relay, mut rx) = relay(bridge);
        let proposal = Proposal::from_message(&message(), Address::repeat_byte(0x0d)).unwrap();
        let result = relay
            .vote_proposal(&proposal, TransactOptions::default())
            .await;

        assert!(matches!(
            result,
            Err(RelayerError::RetriesExhausted { operation: "vote", attempts: 3, .. })
        ));
        assert!(matches!(
            rx.try_recv(),
            Ok(RelayerError::RetriesExhausted {
                source_id: 1,
                destination_id: 2,
                deposit_nonce: 42,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn vote_succeeds_after_transient_errors() {
        let mut bridge = MockBridge::new();
        let calls = AtomicUsize::new(0);
        bridge.expect_vote_proposal().times(3).returning(move |_, _| {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(RelayerError::NonceTooLow { chain_id: 5 })
            } else {
                Ok(H256::repeat_byte(1))
            }
        });

        let (relay, mut rx) = relay(bridge);
        let proposal = Proposal::from_message(&message(), Address::repeat_byte(0x0d)).unwrap();
        relay
            .vote_proposal(&proposal, TransactOptions::default())
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_vote_stops_when_proposal_passed() {
        let mut bridge = MockBridge::new();
        bridge
            .expect_vote_proposal()
            .times(1)
            .returning(|_, _| Err(RelayerError::Transaction("execution reverted".into())));
        status_sequence(&mut bridge, vec![ProposalStatus::Passed]);

        let (relay, mut rx) = relay(bridge);
        let proposal = Proposal::from_message(&message(), Address::repeat_byte(0x0d)).unwrap();
        relay
            .vote_proposal(&proposal, TransactOptions::default())
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_execution_stops_when_finalized() {
        let mut bridge = MockBridge::new();
        bridge
            .expect_execute_proposal()
            .times(2)
            .returning(|_, _| Err(RelayerError::Transaction("execution reverted".into())));
        status_sequence(
            &mut bridge,
            vec![ProposalStatus::Passed, ProposalStatus::Cancelled],
        );

        let (relay, mut rx) = relay(bridge);
        let proposal = Proposal::from_message(&message(), Address::repeat_byte(0x0d)).unwrap();
        relay
            .execute_proposal(&proposal, TransactOptions::default())
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unknown_resource_is_rejected() {
        let bridge = MockBridge::new();
        let (relay, _rx) = relay(bridge);
        let mut message = message();
        message.resource_id = ResourceId([9; 32]);
        assert!(matches!(
            relay.relay(message).await,
            Err(RelayerError::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn run_relays_queued_messages() {
        let mut bridge = MockBridge::new();
        status_sequence(&mut bridge, vec![ProposalStatus::Passed]);
        let executed = Arc::new(AtomicUsize::new(0));
        bridge.expect_execute_proposal().returning({
            let executed = executed.clone();
            move |_, _| {
                executed.fetch_add(1, Ordering::SeqCst);
                Ok(H256::repeat_byte(1))
            }
        });

        let (relay, _rx) = relay(bridge);
        let relay = Arc::new(relay);
        let (tx, queue) = mpsc::channel(4);
        let token = CancellationToken::new();
        let handle = tokio::spawn(relay.clone().run(queue, token.clone()));

        tx.send(message()).await.unwrap();
        let mut second = message();
        second.deposit_nonce = 43;
        tx.send(second).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(executed.load(Ordering::SeqCst), 2);

        token.cancel();
        handle.await.unwrap();
    }
}
