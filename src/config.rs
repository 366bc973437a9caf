//! Configuration management for the bridge relayer
//!
//! Loads configuration from TOML files with environment variable substitution.
//! Settings are parsed once at startup and handed to constructors; nothing
//! here is global.

use crate::message::{DomainId, ResourceId, TransferType};
use crate::tx::TransactOptions;

use anyhow::{Context, Result};
use ethers::types::{Address, U256};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

const GWEI: u64 = 1_000_000_000;

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub metrics: MetricsConfig,
    pub wallet: WalletConfig,
    pub chains: HashMap<String, ChainConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub instance_id: String,
    #[serde(default = "default_queue_size")]
    pub message_queue_size: usize,
    /// Vote/execute attempts before the failure is reported as fatal
    #[serde(default = "default_retry_limit")]
    pub proposal_retry_limit: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub proposal_retry_delay_ms: u64,
    /// Status polls while waiting for a voted proposal to pass
    #[serde(default = "default_execute_watch_limit")]
    pub execute_watch_limit: u32,
    #[serde(default = "default_execute_watch_interval_ms")]
    pub execute_watch_interval_ms: u64,
    #[serde(default = "default_max_calldata_bytes")]
    pub max_calldata_bytes: usize,
}

impl RelayerConfig {
    pub fn proposal_retry_delay(&self) -> Duration {
        Duration::from_millis(self.proposal_retry_delay_ms)
    }

    pub fn execute_watch_interval(&self) -> Duration {
        Duration::from_millis(self.execute_watch_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Name of the environment variable holding the hex private key
    pub private_key_env: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub domain_id: DomainId,
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub bridge_address: Address,
    #[serde(default)]
    pub start_block: u64,
    /// Ignore the stored block and start from `start_block`
    #[serde(default)]
    pub fresh_start: bool,
    #[serde(default = "default_confirmations")]
    pub block_confirmations: u64,
    #[serde(default = "default_block_retry_interval_ms")]
    pub block_retry_interval_ms: u64,
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
    #[serde(default)]
    pub gas_price_strategy: GasPriceStrategyKind,
    /// Multiplier applied to the node-suggested legacy gas price
    pub gas_multiplier: Option<f64>,
    /// Upper limit on the fee per gas, in gwei
    pub max_gas_price_gwei: Option<u64>,
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    /// Enables stuck-transaction resubmission when present
    pub monitor: Option<MonitorConfig>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GasPriceStrategyKind {
    #[default]
    Static,
    FeeMarket,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourceConfig {
    pub resource_id: ResourceId,
    pub handler_address: Address,
    pub transfer_type: TransferType,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    pub resend_interval_secs: u64,
    pub tx_timeout_secs: u64,
    /// Transactions submitted more recently than this are not resent
    pub too_new_secs: u64,
    pub increase_percentage: u64,
    pub max_gas_price_gwei: u64,
}

impl MonitorConfig {
    pub fn resend_interval(&self) -> Duration {
        Duration::from_secs(self.resend_interval_secs)
    }

    pub fn tx_timeout(&self) -> Duration {
        Duration::from_secs(self.tx_timeout_secs)
    }

    pub fn too_new(&self) -> Duration {
        Duration::from_secs(self.too_new_secs)
    }

    pub fn max_gas_price(&self) -> U256 {
        U256::from(self.max_gas_price_gwei) * U256::from(GWEI)
    }
}

impl ChainConfig {
    pub fn block_retry_interval(&self) -> Duration {
        Duration::from_millis(self.block_retry_interval_ms)
    }

    pub fn max_gas_price(&self) -> Option<U256> {
        self.max_gas_price_gwei
            .map(|gwei| U256::from(gwei) * U256::from(GWEI))
    }

    /// Defaults merged under every transaction sent to this chain
    pub fn default_transact_options(&self) -> TransactOptions {
        TransactOptions {
            gas_limit: self.gas_limit,
            chain_id: self.chain_id,
            ..TransactOptions::default()
        }
    }

    pub fn resource(&self, resource_id: &ResourceId) -> Option<&ResourceConfig> {
        self.resources
            .iter()
            .find(|r| &r.resource_id == resource_id)
    }
}

fn default_queue_size() -> usize {
    1024
}

fn default_retry_limit() -> u32 {
    10
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_execute_watch_limit() -> u32 {
    100
}

fn default_execute_watch_interval_ms() -> u64 {
    5000
}

fn default_max_calldata_bytes() -> usize {
    64 * 1024
}

fn default_confirmations() -> u64 {
    10
}

fn default_block_retry_interval_ms() -> u64 {
    5000
}

fn default_max_block_range() -> u64 {
    1000
}

fn default_gas_limit() -> u64 {
    6_721_975
}

impl Settings {
    /// Load settings from the file named by `RELAYER_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("RELAYER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse and validate a TOML document
    pub fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        // At least one chain must be enabled
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        if self.relayer.proposal_retry_limit == 0 {
            anyhow::bail!("proposal_retry_limit must be at least 1");
        }

        let mut domains = HashSet::new();
        for (name, chain) in self.enabled_chains() {
            if chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
            if !domains.insert(chain.domain_id) {
                anyhow::bail!("Domain {} is configured more than once", chain.domain_id);
            }
            if let Some(factor) = chain.gas_multiplier {
                if !factor.is_finite() || factor <= 0.0 {
                    anyhow::bail!("Chain {} has invalid gas_multiplier {}", name, factor);
                }
            }
            if let Some(monitor) = &chain.monitor {
                if monitor.resend_interval_secs == 0 {
                    anyhow::bail!("Chain {} monitor resend_interval_secs must be > 0", name);
                }
            }
            if chain.resources.is_empty() {
                tracing::warn!("Chain {} has no resources - deposits will be skipped", name);
            }
        }

        // a deposit accepted on one chain must have a handler on every destination
        for (source_name, source) in self.enabled_chains() {
            for resource in &source.resources {
                for (name, destination) in self.enabled_chains() {
                    if destination.domain_id != source.domain_id
                        && destination.resource(&resource.resource_id).is_none()
                    {
                        anyhow::bail!(
                            "Resource {} on chain {} has no handler on chain {}",
                            resource.resource_id,
                            source_name,
                            name
                        );
                    }
                }
            }
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();

    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
