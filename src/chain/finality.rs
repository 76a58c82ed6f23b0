//! Chain finality tracking for fills on the destination chain
//!
//! Different chains have different finality models:
//! - Ethereum: Probabilistic (32 blocks for practical finality, ~6 min)
//! - Polygon: Probabilistic (128 blocks)
//! - Arbitrum/Optimism/Base/Scroll: soft finality from the sequencer, L1 for hard finality
//! - Avalanche: Instant finality (1 block)

use crate::chain::DestinationChain;
use crate::error::{RelayerError, RelayerResult};

use ethers::types::H256;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Tracks finality for transactions on the destination chain
pub struct FinalityTracker {
    /// Chain ID
    chain_id: u64,
    /// Required confirmation blocks
    confirmation_blocks: u64,
    /// Chain capability
    chain: Arc<dyn DestinationChain>,
    /// Pending transactions: tx_hash -> block_number
    pending: RwLock<HashMap<H256, u64>>,
    /// Finalized transactions (cached to avoid re-checking)
    finalized: RwLock<HashMap<H256, bool>>,
}

impl FinalityTracker {
    /// Create a new finality tracker
    pub fn new(confirmation_blocks: u64, chain: Arc<dyn DestinationChain>) -> Self {
        Self {
            chain_id: chain.chain_id(),
            confirmation_blocks,
            chain,
            pending: RwLock::new(HashMap::new()),
            finalized: RwLock::new(HashMap::new()),
        }
    }

    /// Track a new transaction for finality
    pub async fn track(&self, tx_hash: H256, block_number: u64) {
        self.pending.write().await.insert(tx_hash, block_number);
        debug!(
            "Tracking tx {:?} for finality on chain {} (block {})",
            tx_hash, self.chain_id, block_number
        );
    }

    /// Check if a tracked transaction has reached finality.
    ///
    /// Returns `ChainReorg` if the receipt disappeared or moved since it was tracked.
    pub async fn is_finalized(&self, tx_hash: H256) -> RelayerResult<bool> {
        if let Some(&finalized) = self.finalized.read().await.get(&tx_hash) {
            return Ok(finalized);
        }

        let tx_block = match self.pending.read().await.get(&tx_hash) {
            Some(&block) => block,
            None => {
                return Err(RelayerError::Internal(format!(
                    "tx {:?} is not tracked for finality",
                    tx_hash
                )))
            }
        };

        let current_block = self.chain.get_head().await?;
        let confirmations = current_block.saturating_sub(tx_block);

        if confirmations < self.confirmation_blocks {
            debug!(
                "Transaction {:?} has {} / {} confirmations on chain {}",
                tx_hash, confirmations, self.confirmation_blocks, self.chain_id
            );
            return Ok(false);
        }

        // Verify the transaction is still included at the same height
        if self.verify_inclusion(tx_hash, tx_block).await? {
            self.pending.write().await.remove(&tx_hash);
            self.finalized.write().await.insert(tx_hash, true);

            info!(
                "Transaction {:?} finalized on chain {} ({} confirmations)",
                tx_hash, self.chain_id, confirmations
            );
            Ok(true)
        } else {
            warn!(
                "Reorg detected: tx {:?} no longer included on chain {}",
                tx_hash, self.chain_id
            );
            self.pending.write().await.remove(&tx_hash);
            crate::metrics::record_reorg(self.chain_id);
            Err(RelayerError::ChainReorg {
                chain_id: self.chain_id,
                block_number: tx_block,
            })
        }
    }

    /// Verify a transaction is still included in the chain
    async fn verify_inclusion(&self, tx_hash: H256, tx_block: u64) -> RelayerResult<bool> {
        match self.chain.get_receipt(tx_hash).await? {
            Some(receipt) => Ok(receipt.block_number == tx_block),
            None => Ok(false),
        }
    }

    /// Get pending transaction count
    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// Clear old finalized cache entries (call periodically)
    pub async fn cleanup_cache(&self, max_entries: usize) {
        let mut finalized = self.finalized.write().await;
        if finalized.len() > max_entries {
            // Simple FIFO-ish cleanup - just clear half
            let to_remove: Vec<_> = finalized
                .keys()
                .take(finalized.len() / 2)
                .cloned()
                .collect();
            for k in to_remove {
                finalized.remove(&k);
            }
        }
    }
}

/// Get recommended confirmation blocks for a chain
pub fn recommended_confirmations(chain_id: u64) -> u64 {
    match chain_id {
        // Ethereum mainnet
        1 => 32,
        // Ethereum testnets
        11155111 | 17000 => 12,
        // Polygon mainnet
        137 => 128,
        // Polygon testnets
        80002 => 32,
        // Arbitrum
        42161 | 421614 => 64,
        // Optimism
        10 | 11155420 => 64,
        // Base
        8453 | 84532 => 64,
        // Scroll
        534352 | 534351 => 64,
        // Avalanche (instant finality)
        43114 | 43113 => 1,
        // Local dev chains
        31337 => 1,
        // Default conservative
        _ => 64,
    }
}
