//! State management with durable persistence
//!
//! Handles:
//! - Chain cursors for restart recovery
//! - Deposits and their fulfillment status
//! - Fill attempt history
//!
//! `StateManager` persists to PostgreSQL; `MemoryStore` keeps everything in
//! process and is meant for tests and local development.

mod manager;
mod memory;
pub mod model;

pub use manager::StateManager;
pub use memory::MemoryStore;
pub use model::{
    AttemptStatus, Deposit, DepositId, DepositStats, DepositStatus, FillAttempt,
    GasParams,
};

use crate::config::DatabaseConfig;
use crate::error::RelayerResult;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Durable tables behind the ledger, cursor store and submitter.
///
/// Every write must be durable when the future resolves.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn health_check(&self) -> RelayerResult<()>;

    async fn get_cursor(&self, chain_id: u64) -> RelayerResult<Option<u64>>;

    async fn save_cursor(&self, chain_id: u64, block_number: u64) -> RelayerResult<()>;

    /// Insert a deposit unless its id exists. Returns `true` if inserted.
    async fn insert_deposit(&self, deposit: &Deposit) -> RelayerResult<bool>;

    /// Overwrite the mutable fields of an existing deposit
    async fn update_deposit(&self, deposit: &Deposit) -> RelayerResult<()>;

    async fn get_deposit(&self, id: &DepositId) -> RelayerResult<Option<Deposit>>;

    /// All deposits that are not yet `Filled`
    async fn load_open_deposits(&self) -> RelayerResult<Vec<Deposit>>;

    /// Insert or update an attempt keyed by `(deposit_id, attempt)`
    async fn save_attempt(&self, attempt: &FillAttempt) -> RelayerResult<()>;

    /// Attempts of a deposit ordered by attempt number
    async fn get_attempts(&self, id: &DepositId) -> RelayerResult<Vec<FillAttempt>>;

    async fn get_stats(&self) -> RelayerResult<DepositStats>;
}

/// Open the store named by the database URL
pub async fn connect(config: &DatabaseConfig) -> RelayerResult<Arc<dyn StateStore>> {
    if config.url.starts_with("memory:") {
        warn!("Using in-memory state store; relay progress will not survive a restart");
        return Ok(Arc::new(MemoryStore::new()));
    }

    let manager = StateManager::new(config).await?;
    manager.run_migrations().await?;
    Ok(Arc::new(manager))
}
