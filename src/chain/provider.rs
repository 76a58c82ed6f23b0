//! Chain provider with multi-RPC support and automatic failover

use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{RelayerError, RelayerResult};

use super::{BlockRef, DestinationChain, FillReceipt, LogEntry, SourceChain};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl ChainProvider {
    /// Create a new chain provider
    pub fn new(config: ChainConfig) -> RelayerResult<Self> {
        let mut http_providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(RelayerError::TransientNetwork {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        crate::metrics::record_rpc_failure(self.config.chain_id);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> RelayerResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(RelayerError::TransientNetwork {
            chain_id: self.config.chain_id,
            message: "All providers failed".to_string(),
        })
    }

    /// Get current gas price based on chain strategy
    pub async fn get_gas_price(&self) -> RelayerResult<GasPrice> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self
                    .http()
                    .get_gas_price()
                    .await
                    .map_err(|e| self.classify(e.to_string()))?;
                Ok(GasPrice::Legacy(std::cmp::min(price, self.max_gas_price())))
            }
            GasPriceStrategy::Eip1559 => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    /// Estimate EIP-1559 fees
    async fn estimate_eip1559_fees(&self) -> RelayerResult<(U256, U256)> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| self.classify(e.to_string()))?
            .ok_or_else(|| RelayerError::TransientNetwork {
                chain_id: self.config.chain_id,
                message: "No latest block".to_string(),
            })?;

        let base_fee = block.base_fee_per_gas.ok_or_else(|| {
            RelayerError::Config(format!(
                "Chain {} has no base fee; use the legacy gas strategy",
                self.config.chain_id
            ))
        })?;

        let priority_fee = U256::from(2_000_000_000u64); // 2 gwei default

        // Max fee = 2 * base_fee + priority_fee (buffer for block variability)
        let max_fee = base_fee * 2 + priority_fee;
        let max_fee = std::cmp::min(max_fee, self.max_gas_price());

        Ok((max_fee, priority_fee))
    }

    fn max_gas_price(&self) -> U256 {
        U256::from(self.config.max_gas_price_gwei) * U256::from(1_000_000_000u64)
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }

    fn classify(&self, message: String) -> RelayerError {
        classify_rpc_error(self.config.chain_id, message)
    }
}

#[async_trait]
impl SourceChain for ChainProvider {
    fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    async fn get_head(&self) -> RelayerResult<u64> {
        self.get_block_number().await
    }

    async fn get_logs(
        &self,
        address: Address,
        event_signature: H256,
        from_block: u64,
        to_block: u64,
    ) -> RelayerResult<Vec<LogEntry>> {
        let filter = Filter::new()
            .address(address)
            .topic0(event_signature)
            .from_block(from_block)
            .to_block(to_block);

        for _ in 0..self.http_providers.len() {
            match self.http().get_logs(&filter).await {
                Ok(logs) => {
                    return logs.into_iter().map(|log| to_log_entry(&self.config, log)).collect()
                }
                Err(e) => {
                    warn!("Failed to get logs from chain {}: {}", self.config.chain_id, e);
                    self.failover();
                }
            }
        }

        Err(RelayerError::TransientNetwork {
            chain_id: self.config.chain_id,
            message: "All providers failed to get logs".to_string(),
        })
    }

    async fn get_block(&self, height: u64) -> RelayerResult<Option<BlockRef>> {
        let block = self
            .http()
            .get_block(height)
            .await
            .map_err(|e| self.classify(e.to_string()))?;

        Ok(block.and_then(|b| {
            b.hash.map(|hash| BlockRef {
                number: height,
                hash,
                parent_hash: b.parent_hash,
            })
        }))
    }
}

#[async_trait]
impl DestinationChain for ChainProvider {
    fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    async fn get_head(&self) -> RelayerResult<u64> {
        self.get_block_number().await
    }

    async fn get_nonce(&self, account: Address) -> RelayerResult<u64> {
        let nonce = self
            .http()
            .get_transaction_count(account, Some(BlockId::Number(BlockNumber::Pending)))
            .await
            .map_err(|e| self.classify(e.to_string()))?;
        Ok(nonce.as_u64())
    }

    async fn get_mined_nonce(&self, account: Address) -> RelayerResult<u64> {
        let nonce = self
            .http()
            .get_transaction_count(account, Some(BlockId::Number(BlockNumber::Latest)))
            .await
            .map_err(|e| self.classify(e.to_string()))?;
        Ok(nonce.as_u64())
    }

    async fn estimate_gas(&self, tx: &TypedTransaction) -> RelayerResult<U256> {
        self.http()
            .estimate_gas(tx, None)
            .await
            .map_err(|e| self.classify(e.to_string()))
    }

    async fn gas_price(&self) -> RelayerResult<GasPrice> {
        self.get_gas_price().await
    }

    async fn broadcast(&self, signed_tx: Bytes) -> RelayerResult<H256> {
        let pending = self
            .http()
            .send_raw_transaction(signed_tx)
            .await
            .map_err(|e| self.classify(e.to_string()))?;
        Ok(pending.tx_hash())
    }

    async fn get_receipt(&self, tx_hash: H256) -> RelayerResult<Option<FillReceipt>> {
        let receipt = self
            .http()
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.classify(e.to_string()))?;

        Ok(receipt.and_then(|r| {
            r.block_number.map(|block| FillReceipt {
                tx_hash,
                success: r.status == Some(1.into()),
                block_number: block.as_u64(),
            })
        }))
    }
}

fn to_log_entry(config: &ChainConfig, log: Log) -> RelayerResult<LogEntry> {
    let missing = |field: &str| RelayerError::EventParsing(format!(
        "Log on chain {} is missing {}",
        config.chain_id, field
    ));

    Ok(LogEntry {
        address: log.address,
        topics: log.topics,
        data: log.data,
        block_number: log.block_number.ok_or_else(|| missing("block number"))?.as_u64(),
        block_hash: log.block_hash.ok_or_else(|| missing("block hash"))?,
        tx_hash: log.transaction_hash.ok_or_else(|| missing("transaction hash"))?,
        log_index: log.log_index.ok_or_else(|| missing("log index"))?.as_u64(),
    })
}

/// Map an RPC error message onto the relayer error taxonomy
pub fn classify_rpc_error(chain_id: u64, message: String) -> RelayerError {
    let lower = message.to_lowercase();

    if lower.contains("nonce too low")
        || lower.contains("nonce too high")
        || lower.contains("already known")
    {
        RelayerError::NonceConflict { chain_id, message }
    } else if lower.contains("insufficient funds") {
        RelayerError::InsufficientFunds { chain_id, message }
    } else if lower.contains("execution reverted") || lower.contains("revert") {
        RelayerError::Reverted { reason: message }
    } else {
        // Timeouts, resets and "replacement transaction underpriced" are all
        // resolved by retrying, the latter with a bumped price.
        RelayerError::TransientNetwork { chain_id, message }
    }
}

/// Gas price types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rpc_errors() {
        assert!(matches!(
            classify_rpc_error(1, "nonce too low: next nonce 5".to_string()),
            RelayerError::NonceConflict { .. }
        ));
        assert!(matches!(
            classify_rpc_error(1, "insufficient funds for gas * price + value".to_string()),
            RelayerError::InsufficientFunds { .. }
        ));
        assert!(matches!(
            classify_rpc_error(1, "execution reverted: already filled".to_string()),
            RelayerError::Reverted { .. }
        ));
        assert!(matches!(
            classify_rpc_error(1, "replacement transaction underpriced".to_string()),
            RelayerError::TransientNetwork { .. }
        ));
        assert!(matches!(
            classify_rpc_error(1, "connection reset by peer".to_string()),
            RelayerError::TransientNetwork { .. }
        ));
    }
}
