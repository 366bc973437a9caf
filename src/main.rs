//! Bridge relayer - cross-chain deposit delivery
//!
//! Runs one listener, transactor and proposal relay per enabled chain, joined
//! by a single router. The first fatal relay error stops the process.

use anyhow::{Context, Result};
use ethers::signers::LocalWallet;
use std::env;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use bridge_relayer::chain::{ChainClient, ChainListener, EvmClient, GasPriceClient};
use bridge_relayer::config::{ChainConfig, GasPriceStrategyKind, Settings};
use bridge_relayer::error::RelayerError;
use bridge_relayer::message::{CalldataSizeLimit, DepositCodec, Message};
use bridge_relayer::metrics::MetricsServer;
use bridge_relayer::proposal::{EvmBridge, ProposalRelay, RetryPolicy};
use bridge_relayer::relay::Router;
use bridge_relayer::state::{ChainStore, KeyValueStore, MemoryStore, PostgresStore};
use bridge_relayer::tx::{
    FeeMarketGasPriceStrategy, GasPriceStrategy, MonitorSettings, MonitoredTransactor,
    NonceTracker, SignAndSendTransactor, StaticGasPriceStrategy, Transactor,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting bridge relayer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains (instance {})",
        settings.enabled_chains().len(),
        settings.relayer.instance_id
    );

    let private_key = env::var(&settings.wallet.private_key_env)
        .with_context(|| format!("{} is not set", settings.wallet.private_key_env))?;
    let wallet: LocalWallet = private_key
        .trim_start_matches("0x")
        .parse()
        .context("Invalid relayer private key")?;

    let store = ChainStore::new(open_store(&settings).await?);

    let token = CancellationToken::new();
    let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<RelayerError>();
    let (bus_tx, bus_rx) = mpsc::channel::<Message>(settings.relayer.message_queue_size);

    let router = Arc::new(Router::new());
    let codec = DepositCodec::new().with_hook(Arc::new(CalldataSizeLimit::new(
        settings.relayer.max_calldata_bytes,
    )));
    let policy = RetryPolicy::from(&settings.relayer);
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    for (name, chain) in settings.enabled_chains() {
        let client: Arc<EvmClient> = Arc::new(
            EvmClient::new(chain.clone(), wallet.clone())
                .with_context(|| format!("Failed to connect to chain {}", name))?,
        );
        let chain_client: Arc<dyn ChainClient> = client.clone();

        let transactor = build_transactor(chain, client, store.clone(), &token, &mut handles);
        let bridge = Arc::new(EvmBridge::new(
            chain.bridge_address,
            chain_client.clone(),
            transactor,
        ));

        // Destination side
        let relay = Arc::new(ProposalRelay::new(
            chain,
            bridge,
            policy.clone(),
            fatal_tx.clone(),
        ));
        let (writer, queue) = mpsc::channel(settings.relayer.message_queue_size);
        router.register(chain.domain_id, writer);
        handles.push(tokio::spawn(relay.run(queue, token.clone())));

        // Source side
        let listener = ChainListener::new(
            chain.clone(),
            chain_client,
            store.clone(),
            codec.clone(),
            bus_tx.clone(),
        );
        handles.push(tokio::spawn({
            let token = token.clone();
            let fatal_tx = fatal_tx.clone();
            async move {
                if let Err(e) = listener.run(token).await {
                    error!("Listener for domain {} failed: {}", listener.domain_id(), e);
                    let _ = fatal_tx.send(e);
                }
            }
        }));

        info!("Chain {} (domain {}) initialized", name, chain.domain_id);
    }
    // listeners hold the only remaining bus senders
    drop(bus_tx);

    handles.push(tokio::spawn({
        let router = router.clone();
        let token = token.clone();
        async move { router.run(bus_rx, token).await }
    }));

    // Start metrics server
    if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        });
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    info!("Bridge relayer is running");

    let fatal = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping...");
            None
        }
        Some(e) = fatal_rx.recv() => {
            error!(alert = e.should_alert(), "Fatal error, stopping relayer: {}", e);
            Some(e)
        }
    };

    token.cancel();
    futures::future::join_all(handles).await;

    info!("Bridge relayer stopped");
    match fatal {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

/// Postgres when a database is configured, otherwise an in-memory store
async fn open_store(settings: &Settings) -> Result<Arc<dyn KeyValueStore>> {
    match &settings.database {
        Some(database) => {
            let store = PostgresStore::new(database).await?;
            info!("Database connection established");
            store.run_migrations().await?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("No database configured, block and nonce progress will not survive a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Gas strategy and transactor for one chain, spawning its resend monitor
/// when one is configured
fn build_transactor(
    chain: &ChainConfig,
    client: Arc<EvmClient>,
    store: ChainStore,
    token: &CancellationToken,
    handles: &mut Vec<JoinHandle<()>>,
) -> Arc<dyn Transactor> {
    let gas_client: Arc<dyn GasPriceClient> = client.clone();
    let gas_strategy: Arc<dyn GasPriceStrategy> = match chain.gas_price_strategy {
        GasPriceStrategyKind::Static => Arc::new(StaticGasPriceStrategy::new(
            gas_client,
            chain.gas_multiplier,
            chain.max_gas_price(),
        )),
        GasPriceStrategyKind::FeeMarket => Arc::new(FeeMarketGasPriceStrategy::new(
            gas_client,
            chain.gas_multiplier,
            chain.max_gas_price(),
        )),
    };

    let chain_client: Arc<dyn ChainClient> = client;
    let nonces = Arc::new(NonceTracker::new(
        chain.domain_id,
        chain_client.clone(),
        store,
    ));
    let transactor = SignAndSendTransactor::new(
        chain_client,
        gas_strategy,
        nonces,
        chain.default_transact_options(),
    );

    match &chain.monitor {
        Some(monitor) => {
            let monitored = Arc::new(MonitoredTransactor::new(
                transactor,
                MonitorSettings::from(monitor),
            ));
            handles.push(tokio::spawn(monitored.clone().monitor(token.clone())));
            monitored
        }
        None => Arc::new(transactor),
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,bridge_relayer=debug,sqlx=warn,hyper=warn")
    });

    let registry = tracing_subscriber::registry().with(filter);
    if env::var("RELAYER_LOG_JSON").is_ok() {
        registry.with(fmt::layer().json()).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
