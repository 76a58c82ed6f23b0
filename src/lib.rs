//! Deposit relayer
//!
//! Watches a deposit contract on the source chain and, once a deposit is buried
//! under enough confirmations, submits exactly one fill for it on the
//! destination chain. Progress is durable, so a restart resumes where the
//! previous run stopped without missing or repeating a fill.

pub mod api;
pub mod backoff;
pub mod chain;
pub mod config;
pub mod coordination;
pub mod error;
pub mod events;
pub mod metrics;
pub mod shutdown;
pub mod state;
pub mod tx;

#[cfg(test)]
pub mod test_utils;
