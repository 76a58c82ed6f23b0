//! Chain module - capabilities for the two chains the relayer talks to
//!
//! This module provides:
//! - `SourceChain`: head, log and header queries on the deposit chain
//! - `DestinationChain`: nonce, gas, broadcast and receipt queries on the fill chain
//! - Multi-RPC provider management with automatic failover
//! - A reorg-aware event watcher
//! - Destination-chain finality tracking for fills

pub mod finality;
pub mod provider;
pub mod watcher;

pub use finality::FinalityTracker;
pub use provider::{ChainProvider, GasPrice};
pub use watcher::{EventWatcher, LogBatch, WatchEvent, WatcherConfig};

use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, H256, U256};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

#[cfg(test)]
use mockall::automock;

/// A log entry as returned by the source chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub address: Address,
    pub topics: Vec<H256>,
    pub data: Bytes,
    pub block_number: u64,
    pub block_hash: H256,
    pub tx_hash: H256,
    pub log_index: u64,
}

/// Minimal block header used for reorg checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub number: u64,
    pub hash: H256,
    pub parent_hash: H256,
}

/// Receipt of a broadcast transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillReceipt {
    pub tx_hash: H256,
    /// `true` when execution succeeded
    pub success: bool,
    pub block_number: u64,
}

/// Read access to the chain where deposits are made
#[async_trait]
pub trait SourceChain: Send + Sync {
    fn chain_id(&self) -> u64;

    async fn get_head(&self) -> RelayerResult<u64>;

    async fn get_logs(
        &self,
        address: Address,
        event_signature: H256,
        from_block: u64,
        to_block: u64,
    ) -> RelayerResult<Vec<LogEntry>>;

    async fn get_block(&self, height: u64) -> RelayerResult<Option<BlockRef>>;

    async fn get_block_hash(&self, height: u64) -> RelayerResult<Option<H256>> {
        Ok(self.get_block(height).await?.map(|b| b.hash))
    }
}

/// Write access to the chain where fills are made
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DestinationChain: Send + Sync {
    fn chain_id(&self) -> u64;

    async fn get_head(&self) -> RelayerResult<u64>;

    /// Pending transaction count of `account`
    async fn get_nonce(&self, account: Address) -> RelayerResult<u64>;

    /// Transaction count of `account` in the latest block, mempool excluded
    async fn get_mined_nonce(&self, account: Address) -> RelayerResult<u64>;

    async fn estimate_gas(&self, tx: &TypedTransaction) -> RelayerResult<U256>;

    async fn gas_price(&self) -> RelayerResult<GasPrice>;

    async fn broadcast(&self, signed_tx: Bytes) -> RelayerResult<H256>;

    async fn get_receipt(&self, tx_hash: H256) -> RelayerResult<Option<FillReceipt>>;
}

/// Bound an RPC call by `timeout`
pub(crate) async fn with_timeout<T>(
    timeout: Duration,
    chain_id: u64,
    operation: &str,
    fut: impl Future<Output = RelayerResult<T>>,
) -> RelayerResult<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(RelayerError::Timeout {
            operation: format!("{} on chain {}", operation, chain_id),
        }),
    }
}
