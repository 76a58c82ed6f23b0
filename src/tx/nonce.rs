//! Nonce management for the relayer account
//!
//! Handles:
//! - Local nonce tracking so concurrent fills never share a nonce
//! - Reconciliation against the chain's pending count
//! - Reuse of nonces whose transaction was never accepted

use crate::chain::DestinationChain;
use crate::error::{RelayerError, RelayerResult};
use crate::state::DepositId;

use ethers::types::Address;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Default)]
struct NonceState {
    /// Next never-used nonce
    current: u64,
    /// Allocated nonces and the deposit using them
    pending: BTreeMap<u64, DepositId>,
    /// Nonces handed back before anything was accepted with them
    released: BTreeSet<u64>,
    synced: bool,
}

/// Allocates nonces for one account on the destination chain
pub struct NonceManager {
    account: Address,
    chain_id: u64,
    state: Mutex<NonceState>,
}

impl NonceManager {
    pub fn new(account: Address, chain_id: u64) -> Self {
        Self {
            account,
            chain_id,
            state: Mutex::new(NonceState::default()),
        }
    }

    /// Reconcile with the chain's pending transaction count.
    ///
    /// Returns the chain's count.
    pub async fn sync(&self, chain: &dyn DestinationChain) -> RelayerResult<u64> {
        let on_chain = chain.get_nonce(self.account).await?;
        let mut state = self.state.lock().await;

        if state.synced && on_chain > state.current {
            warn!(
                "Account {:?} used outside the relayer on chain {}: nonce {} ahead of local {}",
                self.account, self.chain_id, on_chain, state.current
            );
            crate::metrics::record_nonce_resync(self.chain_id);
        }

        state.pending = state.pending.split_off(&on_chain);
        state.released = state.released.split_off(&on_chain);

        if on_chain > state.current {
            state.current = on_chain;
        } else if on_chain < state.current && state.pending.is_empty() {
            // Nothing of ours is outstanding, so the gap can be reclaimed
            debug!(
                "Nonce gap on chain {}: local {}, chain {}",
                self.chain_id, state.current, on_chain
            );
            state.current = on_chain;
            state.released.clear();
        }

        state.synced = true;
        Ok(on_chain)
    }

    /// Next nonce for `deposit`. Lowest released nonces go first.
    pub async fn allocate(&self, deposit: DepositId) -> RelayerResult<u64> {
        let mut state = self.state.lock().await;
        if !state.synced {
            return Err(RelayerError::NonceConflict {
                chain_id: self.chain_id,
                message: "nonce manager used before sync".to_string(),
            });
        }

        let nonce = match state.released.iter().next().copied() {
            Some(nonce) => {
                state.released.remove(&nonce);
                nonce
            }
            None => {
                let nonce = state.current;
                state.current += 1;
                nonce
            }
        };
        state.pending.insert(nonce, deposit);

        debug!("Allocated nonce {} on chain {} for {}", nonce, self.chain_id, deposit);
        Ok(nonce)
    }

    /// Adopt a nonce recorded by an earlier run
    pub async fn claim(&self, nonce: u64, deposit: DepositId) {
        let mut state = self.state.lock().await;
        state.released.remove(&nonce);
        state.pending.insert(nonce, deposit);
        if nonce >= state.current {
            state.current = nonce + 1;
        }
    }

    /// A transaction with `nonce` was mined
    pub async fn confirm(&self, nonce: u64) {
        self.state.lock().await.pending.remove(&nonce);
    }

    /// Give back a nonce nothing was accepted with
    pub async fn release(&self, nonce: u64) {
        let mut state = self.state.lock().await;
        if state.pending.remove(&nonce).is_none() {
            return;
        }
        if nonce + 1 == state.current {
            state.current = nonce;
        } else {
            state.released.insert(nonce);
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}
