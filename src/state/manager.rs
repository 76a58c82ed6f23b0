//! PostgreSQL state manager

use super::model::{
    AttemptStatus, Deposit, DepositId, DepositStats, DepositStatus, FillAttempt, GasParams,
};
use super::StateStore;
use crate::config::DatabaseConfig;
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

/// State manager for PostgreSQL persistence
pub struct StateManager {
    pool: PgPool,
}

impl StateManager {
    /// Create a new state manager
    pub async fn new(config: &DatabaseConfig) -> RelayerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> RelayerResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chain_cursors (
                chain_id BIGINT PRIMARY KEY,
                last_safe_block BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deposits (
                id BYTEA PRIMARY KEY,
                source_tx_hash VARCHAR(66) NOT NULL,
                log_index BIGINT NOT NULL,
                depositor VARCHAR(42) NOT NULL,
                amount TEXT NOT NULL,
                source_block BIGINT NOT NULL,
                status VARCHAR(20) NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                fill_tx_hash VARCHAR(66),
                failure_reason TEXT,
                retryable BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (source_tx_hash, log_index)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_deposits_status
            ON deposits (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS fill_attempts (
                deposit_id BYTEA NOT NULL REFERENCES deposits (id),
                attempt INTEGER NOT NULL,
                nonce BIGINT NOT NULL,
                gas JSONB NOT NULL,
                tx_hash VARCHAR(66),
                broadcast_at TIMESTAMPTZ NOT NULL,
                status VARCHAR(20) NOT NULL,
                error TEXT,
                PRIMARY KEY (deposit_id, attempt)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

#[async_trait]
impl StateStore for StateManager {
    async fn health_check(&self) -> RelayerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn get_cursor(&self, chain_id: u64) -> RelayerResult<Option<u64>> {
        let row = sqlx::query("SELECT last_safe_block FROM chain_cursors WHERE chain_id = $1")
            .bind(chain_id as i64)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<i64, _>("last_safe_block") as u64))
    }

    async fn save_cursor(&self, chain_id: u64, block_number: u64) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO chain_cursors (chain_id, last_safe_block, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (chain_id)
            DO UPDATE SET last_safe_block = $2, updated_at = NOW()
            "#,
        )
        .bind(chain_id as i64)
        .bind(block_number as i64)
        .execute(&self.pool)
        .await?;

        debug!("Saved cursor for chain {}: block {}", chain_id, block_number);
        Ok(())
    }

    async fn insert_deposit(&self, deposit: &Deposit) -> RelayerResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO deposits
                (id, source_tx_hash, log_index, depositor, amount, source_block, status,
                 attempts, fill_tx_hash, failure_reason, retryable, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(deposit.id.as_bytes())
        .bind(format!("{:?}", deposit.source_tx_hash))
        .bind(deposit.log_index as i64)
        .bind(format!("{:?}", deposit.depositor))
        .bind(deposit.amount.to_string())
        .bind(deposit.source_block as i64)
        .bind(deposit.status.as_str())
        .bind(deposit.attempts as i32)
        .bind(deposit.fill_tx_hash.map(|h| format!("{:?}", h)))
        .bind(deposit.failure_reason.as_deref())
        .bind(deposit.retryable)
        .bind(deposit.created_at)
        .bind(deposit.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn update_deposit(&self, deposit: &Deposit) -> RelayerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE deposits
            SET status = $2, attempts = $3, fill_tx_hash = $4, failure_reason = $5,
                retryable = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(deposit.id.as_bytes())
        .bind(deposit.status.as_str())
        .bind(deposit.attempts as i32)
        .bind(deposit.fill_tx_hash.map(|h| format!("{:?}", h)))
        .bind(deposit.failure_reason.as_deref())
        .bind(deposit.retryable)
        .bind(deposit.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RelayerError::DepositNotFound {
                id: deposit.id.to_string(),
            });
        }
        Ok(())
    }

    async fn get_deposit(&self, id: &DepositId) -> RelayerResult<Option<Deposit>> {
        let row = sqlx::query("SELECT * FROM deposits WHERE id = $1")
            .bind(id.as_bytes())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| deposit_from_row(&r)).transpose()
    }

    async fn load_open_deposits(&self) -> RelayerResult<Vec<Deposit>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM deposits
            WHERE status <> 'filled'
            ORDER BY source_block, log_index
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(deposit_from_row).collect()
    }

    async fn save_attempt(&self, attempt: &FillAttempt) -> RelayerResult<()> {
        let gas = serde_json::to_value(&attempt.gas)
            .map_err(|e| RelayerError::Internal(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO fill_attempts
                (deposit_id, attempt, nonce, gas, tx_hash, broadcast_at, status, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (deposit_id, attempt)
            DO UPDATE SET tx_hash = $5, status = $7, error = $8
            "#,
        )
        .bind(attempt.deposit_id.as_bytes())
        .bind(attempt.attempt as i32)
        .bind(attempt.nonce as i64)
        .bind(gas)
        .bind(attempt.tx_hash.map(|h| format!("{:?}", h)))
        .bind(attempt.broadcast_at)
        .bind(attempt.status.as_str())
        .bind(attempt.error.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_attempts(&self, id: &DepositId) -> RelayerResult<Vec<FillAttempt>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM fill_attempts
            WHERE deposit_id = $1
            ORDER BY attempt
            "#,
        )
        .bind(id.as_bytes())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(attempt_from_row).collect()
    }

    async fn get_stats(&self) -> RelayerResult<DepositStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'observed') as observed,
                COUNT(*) FILTER (WHERE status = 'confirmed') as confirmed,
                COUNT(*) FILTER (WHERE status = 'submitting') as submitting,
                COUNT(*) FILTER (WHERE status = 'filled') as filled,
                COUNT(*) FILTER (WHERE status = 'failed') as failed
            FROM deposits
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(DepositStats {
            observed: row.get::<i64, _>("observed") as u64,
            confirmed: row.get::<i64, _>("confirmed") as u64,
            submitting: row.get::<i64, _>("submitting") as u64,
            filled: row.get::<i64, _>("filled") as u64,
            failed: row.get::<i64, _>("failed") as u64,
        })
    }
}

fn parse_hash(value: &str) -> RelayerResult<H256> {
    H256::from_str(value).map_err(|e| RelayerError::Internal(format!("bad hash {}: {}", value, e)))
}

fn deposit_from_row(row: &PgRow) -> RelayerResult<Deposit> {
    let id: Vec<u8> = row.try_get("id")?;
    let source_tx_hash: String = row.try_get("source_tx_hash")?;
    let depositor: String = row.try_get("depositor")?;
    let amount: String = row.try_get("amount")?;
    let status: String = row.try_get("status")?;
    let fill_tx_hash: Option<String> = row.try_get("fill_tx_hash")?;

    Ok(Deposit {
        id: DepositId::from_slice(&id)?,
        source_tx_hash: parse_hash(&source_tx_hash)?,
        log_index: row.try_get::<i64, _>("log_index")? as u64,
        depositor: Address::from_str(&depositor)
            .map_err(|e| RelayerError::Internal(format!("bad depositor {}: {}", depositor, e)))?,
        amount: U256::from_dec_str(&amount)
            .map_err(|e| RelayerError::Internal(format!("bad amount {}: {}", amount, e)))?,
        source_block: row.try_get::<i64, _>("source_block")? as u64,
        status: DepositStatus::from_str(&status)?,
        attempts: row.try_get::<i32, _>("attempts")? as u32,
        fill_tx_hash: fill_tx_hash.as_deref().map(parse_hash).transpose()?,
        failure_reason: row.try_get("failure_reason")?,
        retryable: row.try_get("retryable")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn attempt_from_row(row: &PgRow) -> RelayerResult<FillAttempt> {
    let deposit_id: Vec<u8> = row.try_get("deposit_id")?;
    let gas: serde_json::Value = row.try_get("gas")?;
    let tx_hash: Option<String> = row.try_get("tx_hash")?;
    let status: String = row.try_get("status")?;

    Ok(FillAttempt {
        deposit_id: DepositId::from_slice(&deposit_id)?,
        attempt: row.try_get::<i32, _>("attempt")? as u32,
        nonce: row.try_get::<i64, _>("nonce")? as u64,
        gas: serde_json::from_value::<GasParams>(gas)
            .map_err(|e| RelayerError::Internal(e.to_string()))?,
        tx_hash: tx_hash.as_deref().map(parse_hash).transpose()?,
        broadcast_at: row.try_get::<DateTime<Utc>, _>("broadcast_at")?,
        status: AttemptStatus::from_str(&status)?,
        error: row.try_get("error")?,
    })
}
