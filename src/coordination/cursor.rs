//! Durable relay progress through the source chain

use crate::error::RelayerResult;
use crate::state::StateStore;

use std::sync::Arc;
use tracing::{debug, info, warn};

/// Highest source block whose deposits are all at least `Confirmed`
pub struct CursorStore {
    store: Arc<dyn StateStore>,
    chain_id: u64,
    last_safe_block: u64,
}

impl CursorStore {
    /// Load the persisted cursor, starting just below `genesis_block` if none exists
    pub async fn load(
        store: Arc<dyn StateStore>,
        chain_id: u64,
        genesis_block: u64,
    ) -> RelayerResult<Self> {
        let last_safe_block = match store.get_cursor(chain_id).await? {
            Some(block) => {
                info!("Resuming chain {} after block {}", chain_id, block);
                block
            }
            None => {
                let start = genesis_block.saturating_sub(1);
                info!("No cursor for chain {}, starting after block {}", chain_id, start);
                start
            }
        };

        crate::metrics::record_cursor(chain_id, last_safe_block);
        Ok(Self {
            store,
            chain_id,
            last_safe_block,
        })
    }

    pub fn last_safe_block(&self) -> u64 {
        self.last_safe_block
    }

    /// Move forward to `block`. Returns `false` if that would not be forward.
    pub async fn advance(&mut self, block: u64) -> RelayerResult<bool> {
        if block <= self.last_safe_block {
            return Ok(false);
        }

        self.store.save_cursor(self.chain_id, block).await?;
        self.last_safe_block = block;
        crate::metrics::record_cursor(self.chain_id, block);

        debug!("Chain {} cursor advanced to {}", self.chain_id, block);
        Ok(true)
    }

    /// Move back to `ancestor` after already-delivered blocks were replaced
    pub async fn rollback(&mut self, ancestor: u64) -> RelayerResult<()> {
        if ancestor >= self.last_safe_block {
            return Ok(());
        }

        warn!(
            "Chain {} cursor rolled back from {} to {}",
            self.chain_id, self.last_safe_block, ancestor
        );
        self.store.save_cursor(self.chain_id, ancestor).await?;
        self.last_safe_block = ancestor;
        crate::metrics::record_cursor(self.chain_id, ancestor);
        Ok(())
    }
}
