//! Message routing between chain listeners and proposal relays
//!
//! Every listener writes onto one shared bus. The router reads the bus and
//! forwards each message to the writer queue of its destination domain.

use crate::error::{RelayerError, RelayerResult};
use crate::message::{DomainId, Message};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Fans deposit messages out to per-destination writer queues
#[derive(Default)]
pub struct Router {
    writers: DashMap<DomainId, mpsc::Sender<Message>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the queue feeding `domain_id`'s proposal relay
    pub fn register(&self, domain_id: DomainId, writer: mpsc::Sender<Message>) {
        if self.writers.insert(domain_id, writer).is_some() {
            debug!("Replaced writer for domain {}", domain_id);
        }
    }

    pub fn domains(&self) -> Vec<DomainId> {
        let mut domains: Vec<DomainId> = self.writers.iter().map(|e| *e.key()).collect();
        domains.sort_unstable();
        domains
    }

    /// Hand `message` to its destination's queue, waiting for capacity
    pub async fn route(&self, message: Message) -> RelayerResult<()> {
        let writer = self
            .writers
            .get(&message.destination)
            .map(|w| w.value().clone())
            .ok_or(RelayerError::DomainNotFound {
                domain_id: message.destination,
            })?;

        let destination = message.destination;
        writer.send(message).await.map_err(|_| {
            RelayerError::Internal(format!("writer queue for domain {} closed", destination))
        })
    }

    /// Route bus messages until `token` is cancelled or every listener is gone
    pub async fn run(&self, mut bus: mpsc::Receiver<Message>, token: CancellationToken) {
        info!("Router started for domains {:?}", self.domains());

        loop {
            let message = tokio::select! {
                _ = token.cancelled() => break,
                message = bus.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let (source, destination, nonce) =
                (message.source, message.destination, message.deposit_nonce);
            if let Err(e) = self.route(message).await {
                error!(source, destination, nonce, "Failed to route message: {}", e);
            }
        }

        info!("Router stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Metadata, ResourceId, TransferType};
    use std::sync::Arc;

    fn message(destination: DomainId, nonce: u64) -> Message {
        Message::new(
            1,
            destination,
            nonce,
            ResourceId([1; 32]),
            TransferType::Generic,
            vec![vec![]],
            Metadata::default(),
        )
    }

    #[tokio::test]
    async fn routes_by_destination() {
        let router = Router::new();
        let (tx2, mut rx2) = mpsc::channel(4);
        let (tx3, mut rx3) = mpsc::channel(4);
        router.register(2, tx2);
        router.register(3, tx3);

        router.route(message(3, 1)).await.unwrap();
        router.route(message(2, 2)).await.unwrap();

        assert_eq!(rx2.recv().await.unwrap().deposit_nonce, 2);
        assert_eq!(rx3.recv().await.unwrap().deposit_nonce, 1);
        assert_eq!(router.domains(), vec![2, 3]);
    }

    #[tokio::test]
    async fn unknown_destination_is_an_error() {
        let router = Router::new();
        assert!(matches!(
            router.route(message(9, 1)).await,
            Err(RelayerError::DomainNotFound { domain_id: 9 })
        ));
    }

    #[tokio::test]
    async fn closed_writer_is_an_error() {
        let router = Router::new();
        let (tx, rx) = mpsc::channel(1);
        router.register(2, tx);
        drop(rx);
        assert!(matches!(
            router.route(message(2, 1)).await,
            Err(RelayerError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn run_skips_unroutable_messages() {
        let router = Arc::new(Router::new());
        let (writer, mut queue) = mpsc::channel(4);
        router.register(2, writer);

        let (bus_tx, bus_rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let handle = tokio::spawn({
            let router = router.clone();
            let token = token.clone();
            async move { router.run(bus_rx, token).await }
        });

        bus_tx.send(message(7, 1)).await.unwrap();
        bus_tx.send(message(2, 2)).await.unwrap();
        assert_eq!(queue.recv().await.unwrap().deposit_nonce, 2);

        // closing the bus ends the loop
        drop(bus_tx);
        handle.await.unwrap();
        assert!(!token.is_cancelled());
    }
}
