//! Gas price strategies
//!
//! - `StaticGasPriceStrategy`: node-suggested legacy price, optionally scaled
//!   and capped
//! - `FeeMarketGasPriceStrategy`: EIP-1559 tip and fee cap derived from the
//!   latest base fee, falling back to the static strategy on chains without one

use crate::chain::GasPriceClient;
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use ethers::types::U256;
use std::sync::Arc;
use tracing::debug;

/// Tip used when the configured fee limit is already below the base fee (2.5 gwei)
pub const MIN_PRIORITY_FEE_PER_GAS: u64 = 2_500_000_000;

/// Price parameters of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_priority_fee_per_gas: U256,
        max_fee_per_gas: U256,
    },
}

impl GasPrice {
    /// Ordered price vector: `[price]` or `[tip, cap]`
    pub fn to_vec(&self) -> Vec<U256> {
        match self {
            GasPrice::Legacy(price) => vec![*price],
            GasPrice::Eip1559 {
                max_priority_fee_per_gas,
                max_fee_per_gas,
            } => vec![*max_priority_fee_per_gas, *max_fee_per_gas],
        }
    }

    /// Apply `f` to every element, keeping the variant
    pub fn map(&self, f: impl Fn(U256) -> U256) -> GasPrice {
        match self {
            GasPrice::Legacy(price) => GasPrice::Legacy(f(*price)),
            GasPrice::Eip1559 {
                max_priority_fee_per_gas,
                max_fee_per_gas,
            } => GasPrice::Eip1559 {
                max_priority_fee_per_gas: f(*max_priority_fee_per_gas),
                max_fee_per_gas: f(*max_fee_per_gas),
            },
        }
    }

    /// Highest price per gas the transaction may pay
    pub fn fee_cap(&self) -> U256 {
        match self {
            GasPrice::Legacy(price) => *price,
            GasPrice::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }
}

/// Source of transaction price parameters
#[async_trait]
pub trait GasPriceStrategy: Send + Sync {
    async fn gas_price(&self, priority: Option<u8>) -> RelayerResult<GasPrice>;
}

/// Legacy pricing from the node's suggestion
pub struct StaticGasPriceStrategy {
    client: Arc<dyn GasPriceClient>,
    factor: Option<f64>,
    upper_limit: Option<U256>,
}

impl StaticGasPriceStrategy {
    pub fn new(
        client: Arc<dyn GasPriceClient>,
        factor: Option<f64>,
        upper_limit: Option<U256>,
    ) -> Self {
        Self {
            client,
            factor,
            upper_limit,
        }
    }
}

#[async_trait]
impl GasPriceStrategy for StaticGasPriceStrategy {
    async fn gas_price(&self, priority: Option<u8>) -> RelayerResult<GasPrice> {
        let mut price = self.client.suggest_gas_price().await?;

        if let Some(factor) = self.factor {
            price = multiply_gas_price(price, factor)?;
        }
        if let Some(limit) = self.upper_limit {
            if price > limit {
                price = limit;
            }
        }

        debug!(?priority, %price, "Static gas price");
        Ok(GasPrice::Legacy(price))
    }
}

/// EIP-1559 pricing
pub struct FeeMarketGasPriceStrategy {
    client: Arc<dyn GasPriceClient>,
    upper_limit: Option<U256>,
    fallback: StaticGasPriceStrategy,
}

impl FeeMarketGasPriceStrategy {
    pub fn new(
        client: Arc<dyn GasPriceClient>,
        factor: Option<f64>,
        upper_limit: Option<U256>,
    ) -> Self {
        Self {
            fallback: StaticGasPriceStrategy::new(client.clone(), factor, upper_limit),
            client,
            upper_limit,
        }
    }

    async fn estimate(&self, base_fee: U256) -> RelayerResult<GasPrice> {
        if let Some(limit) = self.upper_limit {
            if limit < base_fee {
                let tip = U256::from(MIN_PRIORITY_FEE_PER_GAS);
                return Ok(GasPrice::Eip1559 {
                    max_priority_fee_per_gas: tip,
                    max_fee_per_gas: base_fee + tip,
                });
            }
        }

        let mut tip = self.client.suggest_gas_tip_cap().await?;
        let mut cap = tip + base_fee * 2;

        if let Some(limit) = self.upper_limit {
            if cap > limit {
                tip = limit - base_fee;
                cap = limit;
            }
        }

        Ok(GasPrice::Eip1559 {
            max_priority_fee_per_gas: tip,
            max_fee_per_gas: cap,
        })
    }
}

#[async_trait]
impl GasPriceStrategy for FeeMarketGasPriceStrategy {
    async fn gas_price(&self, priority: Option<u8>) -> RelayerResult<GasPrice> {
        let Some(base_fee) = self.client.base_fee().await? else {
            debug!("No base fee reported, using static gas price");
            return self.fallback.gas_price(priority).await;
        };

        let price = self.estimate(base_fee).await?;
        debug!(?priority, %base_fee, ?price, "Fee market gas price");
        Ok(price)
    }
}

/// Scale a price by a float factor, truncating the result
pub fn multiply_gas_price(price: U256, factor: f64) -> RelayerResult<U256> {
    let price = u128::try_from(price)
        .map_err(|_| RelayerError::GasPrice(format!("gas price {} too large to scale", price)))?;
    Ok(U256::from((price as f64 * factor) as u128))
}
