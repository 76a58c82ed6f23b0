//! Persisted relay entities: deposits and fill attempts.

use crate::chain::GasPrice;
use crate::error::{RelayerError, RelayerResult};

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::fmt;
use std::str::FromStr;

/// Identity of a deposit: keccak256(source tx hash ‖ log index as uint256)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DepositId(pub H256);

impl DepositId {
    pub fn derive(source_tx_hash: H256, log_index: u64) -> Self {
        let mut index = [0u8; 32];
        U256::from(log_index).to_big_endian(&mut index);

        let mut hasher = Keccak256::new();
        hasher.update(source_tx_hash.as_bytes());
        hasher.update(index);
        Self(H256::from_slice(&hasher.finalize()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn from_slice(bytes: &[u8]) -> RelayerResult<Self> {
        if bytes.len() != 32 {
            return Err(RelayerError::Internal(format!(
                "deposit id must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self(H256::from_slice(bytes)))
    }
}

impl fmt::Display for DepositId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0.as_bytes()))
    }
}

impl FromStr for DepositId {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw)
            .map_err(|e| RelayerError::Internal(format!("invalid deposit id {}: {}", s, e)))?;
        Self::from_slice(&bytes)
    }
}

/// Lifecycle of a deposit.
///
/// `Observed → Confirmed → Submitting → {Filled | Failed}`, with `Failed → Submitting`
/// only after an operator released the deposit for retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    Observed,
    Confirmed,
    Submitting,
    Filled,
    Failed,
}

impl DepositStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DepositStatus::Observed => "observed",
            DepositStatus::Confirmed => "confirmed",
            DepositStatus::Submitting => "submitting",
            DepositStatus::Filled => "filled",
            DepositStatus::Failed => "failed",
        }
    }

    /// Whether `self → next` is a legal move. `retryable` only matters when leaving `Failed`.
    pub fn can_transition_to(&self, next: DepositStatus, retryable: bool) -> bool {
        use DepositStatus::*;
        matches!(
            (self, next),
            (Observed, Confirmed)
                | (Confirmed, Submitting)
                | (Submitting, Filled)
                | (Submitting, Failed)
        ) || (*self == Failed && next == Submitting && retryable)
    }

    /// At least `Confirmed`; used for the cursor rule
    pub fn is_confirmed(&self) -> bool {
        !matches!(self, DepositStatus::Observed)
    }
}

impl fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DepositStatus {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "observed" => Ok(DepositStatus::Observed),
            "confirmed" => Ok(DepositStatus::Confirmed),
            "submitting" => Ok(DepositStatus::Submitting),
            "filled" => Ok(DepositStatus::Filled),
            "failed" => Ok(DepositStatus::Failed),
            other => Err(RelayerError::Internal(format!("unknown deposit status {}", other))),
        }
    }
}

/// A deposit observed on the source chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    pub id: DepositId,
    pub source_tx_hash: H256,
    pub log_index: u64,
    pub depositor: Address,
    pub amount: U256,
    pub source_block: u64,
    pub status: DepositStatus,
    pub attempts: u32,
    pub fill_tx_hash: Option<H256>,
    pub failure_reason: Option<String>,
    /// Set by an operator to allow a `Failed` deposit back into the fill queue
    pub retryable: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deposit {
    /// A freshly observed deposit
    pub fn observed(
        source_tx_hash: H256,
        log_index: u64,
        depositor: Address,
        amount: U256,
        source_block: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: DepositId::derive(source_tx_hash, log_index),
            source_tx_hash,
            log_index,
            depositor,
            amount,
            source_block,
            status: DepositStatus::Observed,
            attempts: 0,
            fill_tx_hash: None,
            failure_reason: None,
            retryable: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Position in the source chain, used for ordering
    pub fn position(&self) -> (u64, u64) {
        (self.source_block, self.log_index)
    }

    /// Eligible for a new fill submission
    pub fn awaiting_fill(&self) -> bool {
        match self.status {
            DepositStatus::Confirmed => true,
            DepositStatus::Failed => self.retryable,
            _ => false,
        }
    }
}

/// Gas parameters of a fill attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasParams {
    pub gas_limit: U256,
    pub price: GasPrice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Mined,
    Dropped,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Mined => "mined",
            AttemptStatus::Dropped => "dropped",
        }
    }
}

impl FromStr for AttemptStatus {
    type Err = RelayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AttemptStatus::Pending),
            "mined" => Ok(AttemptStatus::Mined),
            "dropped" => Ok(AttemptStatus::Dropped),
            other => Err(RelayerError::Internal(format!("unknown attempt status {}", other))),
        }
    }
}

/// One broadcast try of a fill transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillAttempt {
    pub deposit_id: DepositId,
    /// Matches the deposit's attempt counter at the time of the try
    pub attempt: u32,
    pub nonce: u64,
    pub gas: GasParams,
    /// Known once the node accepted the transaction
    pub tx_hash: Option<H256>,
    pub broadcast_at: DateTime<Utc>,
    pub status: AttemptStatus,
    pub error: Option<String>,
}

/// Deposit counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DepositStats {
    pub observed: u64,
    pub confirmed: u64,
    pub submitting: u64,
    pub filled: u64,
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deposit_id_is_stable_per_log() {
        let tx = H256::repeat_byte(0xaa);
        assert_eq!(DepositId::derive(tx, 0), DepositId::derive(tx, 0));
        assert_ne!(DepositId::derive(tx, 0), DepositId::derive(tx, 1));
        assert_ne!(
            DepositId::derive(tx, 0),
            DepositId::derive(H256::repeat_byte(0xab), 0)
        );
    }

    #[test]
    fn test_deposit_id_parses_its_display() {
        let id = DepositId::derive(H256::repeat_byte(0x01), 7);
        let parsed: DepositId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("0x1234".parse::<DepositId>().is_err());
    }

    #[test]
    fn test_status_lattice() {
        use DepositStatus::*;
        assert!(Observed.can_transition_to(Confirmed, false));
        assert!(Confirmed.can_transition_to(Submitting, false));
        assert!(Submitting.can_transition_to(Filled, false));
        assert!(Submitting.can_transition_to(Failed, false));

        assert!(!Failed.can_transition_to(Submitting, false));
        assert!(Failed.can_transition_to(Submitting, true));

        assert!(!Confirmed.can_transition_to(Observed, true));
        assert!(!Failed.can_transition_to(Observed, true));
        assert!(!Filled.can_transition_to(Submitting, true));
        assert!(!Observed.can_transition_to(Submitting, false));
        assert!(!Confirmed.can_transition_to(Filled, false));
    }

    #[test]
    fn test_awaiting_fill() {
        let mut deposit =
            Deposit::observed(H256::zero(), 0, Address::zero(), U256::from(100), 1000);
        assert!(!deposit.awaiting_fill());

        deposit.status = DepositStatus::Confirmed;
        assert!(deposit.awaiting_fill());

        deposit.status = DepositStatus::Failed;
        assert!(!deposit.awaiting_fill());
        deposit.retryable = true;
        assert!(deposit.awaiting_fill());
    }
}
