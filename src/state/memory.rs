//! In-process state store

use super::model::{Deposit, DepositId, DepositStats, DepositStatus, FillAttempt};
use super::StateStore;
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// State store backed by process memory
#[derive(Default)]
pub struct MemoryStore {
    cursors: RwLock<HashMap<u64, u64>>,
    deposits: RwLock<HashMap<DepositId, Deposit>>,
    attempts: RwLock<HashMap<DepositId, BTreeMap<u32, FillAttempt>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn health_check(&self) -> RelayerResult<()> {
        Ok(())
    }

    async fn get_cursor(&self, chain_id: u64) -> RelayerResult<Option<u64>> {
        Ok(self.cursors.read().await.get(&chain_id).copied())
    }

    async fn save_cursor(&self, chain_id: u64, block_number: u64) -> RelayerResult<()> {
        self.cursors.write().await.insert(chain_id, block_number);
        Ok(())
    }

    async fn insert_deposit(&self, deposit: &Deposit) -> RelayerResult<bool> {
        let mut deposits = self.deposits.write().await;
        if deposits.contains_key(&deposit.id) {
            return Ok(false);
        }
        deposits.insert(deposit.id, deposit.clone());
        Ok(true)
    }

    async fn update_deposit(&self, deposit: &Deposit) -> RelayerResult<()> {
        match self.deposits.write().await.get_mut(&deposit.id) {
            Some(existing) => {
                *existing = deposit.clone();
                Ok(())
            }
            None => Err(RelayerError::DepositNotFound {
                id: deposit.id.to_string(),
            }),
        }
    }

    async fn get_deposit(&self, id: &DepositId) -> RelayerResult<Option<Deposit>> {
        Ok(self.deposits.read().await.get(id).cloned())
    }

    async fn load_open_deposits(&self) -> RelayerResult<Vec<Deposit>> {
        Ok(self
            .deposits
            .read()
            .await
            .values()
            .filter(|d| d.status != DepositStatus::Filled)
            .cloned()
            .collect())
    }

    async fn save_attempt(&self, attempt: &FillAttempt) -> RelayerResult<()> {
        self.attempts
            .write()
            .await
            .entry(attempt.deposit_id)
            .or_default()
            .insert(attempt.attempt, attempt.clone());
        Ok(())
    }

    async fn get_attempts(&self, id: &DepositId) -> RelayerResult<Vec<FillAttempt>> {
        Ok(self
            .attempts
            .read()
            .await
            .get(id)
            .map(|attempts| attempts.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_stats(&self) -> RelayerResult<DepositStats> {
        let mut stats = DepositStats::default();
        for deposit in self.deposits.read().await.values() {
            match deposit.status {
                DepositStatus::Observed => stats.observed += 1,
                DepositStatus::Confirmed => stats.confirmed += 1,
                DepositStatus::Submitting => stats.submitting += 1,
                DepositStatus::Filled => stats.filled += 1,
                DepositStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}
