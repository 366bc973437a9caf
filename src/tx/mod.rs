//! Transaction submission with nonce ownership, gas pricing and resend supervision

mod gas;
mod monitored;
mod nonce;
mod transactor;

pub use gas::{
    multiply_gas_price, FeeMarketGasPriceStrategy, GasPrice, GasPriceStrategy,
    StaticGasPriceStrategy, MIN_PRIORITY_FEE_PER_GAS,
};
pub use monitored::{MonitorSettings, MonitoredTransactor};
pub use nonce::{NonceGuard, NonceTracker};
pub use transactor::{RawTx, SignAndSendTransactor, TransactOptions, Transactor};

#[cfg(test)]
pub use transactor::MockTransactor;
