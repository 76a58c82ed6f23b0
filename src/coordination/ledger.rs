//! Deposit ledger
//!
//! In-memory view of open deposits backed by the durable store. Every mutation
//! is written to the store first and only then applied to the cache, so a
//! crash can never leave the cache ahead of what a restart would load.

use crate::error::{RelayerError, RelayerResult};
use crate::state::{Deposit, DepositId, DepositStatus, StateStore};

use chrono::Utc;
use dashmap::DashMap;
use ethers::types::H256;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Result of [`DepositLedger::upsert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    AlreadyPresent,
}

pub struct DepositLedger {
    store: Arc<dyn StateStore>,
    /// Open deposits (everything not yet filled)
    deposits: DashMap<DepositId, Deposit>,
    /// Serializes mutations of a single deposit
    locks: DashMap<DepositId, Arc<Mutex<()>>>,
}

impl DepositLedger {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            deposits: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    /// Hydrate the cache from the store. Returns the number of open deposits.
    pub async fn load(&self) -> RelayerResult<usize> {
        let open = self.store.load_open_deposits().await?;
        let count = open.len();
        for deposit in open {
            self.deposits.insert(deposit.id, deposit);
        }

        info!("Loaded {} open deposits", count);
        Ok(count)
    }

    fn lock_for(&self, id: &DepositId) -> Arc<Mutex<()>> {
        self.locks
            .entry(*id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Record a deposit unless its id is already known
    pub async fn upsert(&self, deposit: Deposit) -> RelayerResult<UpsertOutcome> {
        let lock = self.lock_for(&deposit.id);
        let _guard = lock.lock().await;

        if self.deposits.contains_key(&deposit.id) {
            return Ok(UpsertOutcome::AlreadyPresent);
        }

        if self.store.insert_deposit(&deposit).await? {
            debug!(
                "Recorded deposit {} from tx {:?} log {}",
                deposit.id, deposit.source_tx_hash, deposit.log_index
            );
            self.deposits.insert(deposit.id, deposit);
            return Ok(UpsertOutcome::Inserted);
        }

        // Known to the store but not cached, e.g. already filled
        if let Some(existing) = self.store.get_deposit(&deposit.id).await? {
            if existing.status != DepositStatus::Filled {
                self.deposits.insert(existing.id, existing);
            }
        }
        Ok(UpsertOutcome::AlreadyPresent)
    }

    pub async fn get(&self, id: &DepositId) -> RelayerResult<Option<Deposit>> {
        if let Some(deposit) = self.deposits.get(id) {
            return Ok(Some(deposit.clone()));
        }
        self.store.get_deposit(id).await
    }

    /// Move a deposit to `next` if the lifecycle allows it
    pub async fn advance(&self, id: &DepositId, next: DepositStatus) -> RelayerResult<Deposit> {
        self.transition(id, Some(next), |_| {}).await
    }

    /// Count a new fill attempt. Only legal while `Submitting`.
    pub async fn record_attempt(&self, id: &DepositId) -> RelayerResult<u32> {
        let updated = self
            .transition(id, None, |deposit| deposit.attempts += 1)
            .await?;
        Ok(updated.attempts)
    }

    /// Terminal success
    pub async fn record_fill(&self, id: &DepositId, fill_tx_hash: H256) -> RelayerResult<Deposit> {
        self.transition(id, Some(DepositStatus::Filled), |deposit| {
            deposit.fill_tx_hash = Some(fill_tx_hash);
            deposit.failure_reason = None;
        })
        .await
    }

    /// Terminal failure until an operator releases the deposit
    pub async fn record_failure(&self, id: &DepositId, reason: &str) -> RelayerResult<Deposit> {
        let reason = reason.to_string();
        self.transition(id, Some(DepositStatus::Failed), |deposit| {
            deposit.failure_reason = Some(reason);
            deposit.retryable = false;
        })
        .await
    }

    /// Allow a `Failed` deposit back into the fill queue
    pub async fn release_for_retry(&self, id: &DepositId) -> RelayerResult<Deposit> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let current = self.require(id).await?;
        if current.status != DepositStatus::Failed {
            return Err(invalid(&current, DepositStatus::Submitting));
        }

        let mut updated = current;
        updated.retryable = true;
        updated.updated_at = Utc::now();
        self.persist(updated).await
    }

    /// Deposits waiting for a fill, in source-chain order
    pub fn pending_fills(&self) -> Vec<Deposit> {
        self.sorted(|d| d.awaiting_fill())
    }

    /// Deposits with a fill in progress
    pub fn in_flight(&self) -> Vec<Deposit> {
        self.sorted(|d| d.status == DepositStatus::Submitting)
    }

    /// Deposits persisted before they were confirmed
    pub fn observed(&self) -> Vec<Deposit> {
        self.sorted(|d| d.status == DepositStatus::Observed)
    }

    pub fn open_count(&self) -> usize {
        self.deposits.len()
    }

    fn sorted(&self, filter: impl Fn(&Deposit) -> bool) -> Vec<Deposit> {
        let mut deposits: Vec<Deposit> = self
            .deposits
            .iter()
            .filter(|entry| filter(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        deposits.sort_by_key(|d| d.position());
        deposits
    }

    async fn require(&self, id: &DepositId) -> RelayerResult<Deposit> {
        self.get(id)
            .await?
            .ok_or_else(|| RelayerError::DepositNotFound { id: id.to_string() })
    }

    /// Apply `mutate` and an optional status change under the deposit lock
    async fn transition(
        &self,
        id: &DepositId,
        next: Option<DepositStatus>,
        mutate: impl FnOnce(&mut Deposit),
    ) -> RelayerResult<Deposit> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let current = self.require(id).await?;
        let mut updated = current.clone();

        match next {
            Some(next) => {
                if !current.status.can_transition_to(next, current.retryable) {
                    return Err(invalid(&current, next));
                }
                updated.status = next;
                if current.status == DepositStatus::Failed {
                    updated.retryable = false;
                    updated.failure_reason = None;
                }
            }
            None => {
                if current.status != DepositStatus::Submitting {
                    return Err(invalid(&current, DepositStatus::Submitting));
                }
            }
        }

        mutate(&mut updated);
        updated.updated_at = Utc::now();
        self.persist(updated).await
    }

    async fn persist(&self, deposit: Deposit) -> RelayerResult<Deposit> {
        self.store.update_deposit(&deposit).await?;

        if deposit.status == DepositStatus::Filled {
            self.deposits.remove(&deposit.id);
            self.locks.remove(&deposit.id);
        } else {
            self.deposits.insert(deposit.id, deposit.clone());
        }
        Ok(deposit)
    }
}

fn invalid(deposit: &Deposit, next: DepositStatus) -> RelayerError {
    warn!(
        "Rejected transition of deposit {} from {} to {}",
        deposit.id, deposit.status, next
    );
    RelayerError::InvalidTransition {
        id: deposit.id.to_string(),
        from: deposit.status.to_string(),
        to: next.to_string(),
    }
}
