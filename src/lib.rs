//! Bridge relayer - cross-chain deposit delivery
//!
//! Watches bridge deposits on every configured chain, decodes them into
//! chain-agnostic messages and delivers each one as a voted and executed
//! proposal on its destination chain.

pub mod chain;
pub mod config;
pub mod error;
pub mod events;
pub mod message;
pub mod metrics;
pub mod proposal;
pub mod relay;
pub mod state;
pub mod tx;
