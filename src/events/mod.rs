//! Contract event types and parsing
//!
//! The source contract emits
//! `event Deposited(address indexed depositor, uint256 indexed amount)`;
//! both arguments are indexed, so they arrive as topics 1 and 2.

use crate::chain::LogEntry;
use crate::config::DEPOSITED_EVENT;
use crate::error::{RelayerError, RelayerResult};
use crate::state::Deposit;

use ethers::types::{Address, H256, U256};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

lazy_static! {
    /// keccak256("Deposited(address,uint256)")
    pub static ref DEPOSITED_TOPIC: H256 = event_topic(DEPOSITED_EVENT);
}

/// Topic hash of an event signature
pub fn event_topic(signature: &str) -> H256 {
    H256::from_slice(&Keccak256::digest(signature.as_bytes()))
}

/// A decoded `Deposited` log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositEvent {
    pub depositor: Address,
    pub amount: U256,
    pub block_number: u64,
    pub tx_hash: H256,
    pub log_index: u64,
}

impl DepositEvent {
    /// New ledger entry for this event, in `Observed` state
    pub fn into_deposit(self) -> Deposit {
        Deposit::observed(
            self.tx_hash,
            self.log_index,
            self.depositor,
            self.amount,
            self.block_number,
        )
    }
}

/// Event parser for the deposit contract
pub struct EventParser {
    chain_id: u64,
    contract_address: Address,
}

impl EventParser {
    /// Create a new event parser
    pub fn new(chain_id: u64, contract_address: Address) -> Self {
        Self {
            chain_id,
            contract_address,
        }
    }

    /// Parse a log entry into a `DepositEvent`
    pub fn parse_log(&self, log: &LogEntry) -> RelayerResult<DepositEvent> {
        if log.address != self.contract_address {
            return Err(RelayerError::EventParsing(format!(
                "log on chain {} from unexpected contract {:?}",
                self.chain_id, log.address
            )));
        }

        match log.topics.first() {
            Some(topic) if *topic == *DEPOSITED_TOPIC => {}
            other => {
                return Err(RelayerError::EventParsing(format!(
                    "unexpected topic {:?} in tx {:?}",
                    other, log.tx_hash
                )))
            }
        }

        // Parse indexed parameters from topics
        let depositor = log
            .topics
            .get(1)
            .map(|t| Address::from_slice(&t.0[12..32]))
            .ok_or_else(|| {
                RelayerError::EventParsing(format!("missing depositor in tx {:?}", log.tx_hash))
            })?;

        let amount = log
            .topics
            .get(2)
            .map(|t| U256::from_big_endian(&t.0))
            .ok_or_else(|| {
                RelayerError::EventParsing(format!("missing amount in tx {:?}", log.tx_hash))
            })?;

        Ok(DepositEvent {
            depositor,
            amount,
            block_number: log.block_number,
            tx_hash: log.tx_hash,
            log_index: log.log_index,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ethers::types::Bytes;

    /// Build a `Deposited` log as the source chain would return it
    pub(crate) fn deposit_log(
        contract: Address,
        tx_hash: H256,
        log_index: u64,
        depositor: Address,
        amount: u64,
        block_number: u64,
        block_hash: H256,
    ) -> LogEntry {
        let mut amount_topic = [0u8; 32];
        U256::from(amount).to_big_endian(&mut amount_topic);

        LogEntry {
            address: contract,
            topics: vec![
                *DEPOSITED_TOPIC,
                H256::from(depositor),
                H256::from(amount_topic),
            ],
            data: Bytes::default(),
            block_number,
            block_hash,
            tx_hash,
            log_index,
        }
    }

    #[test]
    fn test_deposited_topic() {
        assert_eq!(
            format!("{:?}", *DEPOSITED_TOPIC),
            format!("{:?}", event_topic("Deposited(address,uint256)"))
        );
        assert_ne!(*DEPOSITED_TOPIC, event_topic("Withdrawn(address,uint256)"));
    }

    #[test]
    fn test_parse_deposit_log() {
        let contract = Address::repeat_byte(0x42);
        let depositor = Address::from_low_u64_be(1);
        let tx = H256::repeat_byte(0xaa);
        let log = deposit_log(contract, tx, 0, depositor, 100, 1000, H256::repeat_byte(1));

        let parser = EventParser::new(534352, contract);
        let event = parser.parse_log(&log).unwrap();

        assert_eq!(event.depositor, depositor);
        assert_eq!(event.amount, U256::from(100));
        assert_eq!(event.block_number, 1000);
        assert_eq!(event.log_index, 0);

        let deposit = event.into_deposit();
        assert_eq!(deposit.id, crate::state::DepositId::derive(tx, 0));
        assert_eq!(deposit.status, crate::state::DepositStatus::Observed);
    }

    #[test]
    fn test_rejects_foreign_logs() {
        let contract = Address::repeat_byte(0x42);
        let parser = EventParser::new(1, contract);

        let mut log = deposit_log(
            Address::repeat_byte(0x43),
            H256::zero(),
            0,
            Address::zero(),
            1,
            1,
            H256::zero(),
        );
        assert!(parser.parse_log(&log).is_err());

        log.address = contract;
        log.topics[0] = event_topic("Withdrawn(address,uint256)");
        assert!(parser.parse_log(&log).is_err());

        log.topics = vec![*DEPOSITED_TOPIC];
        assert!(parser.parse_log(&log).is_err());
    }
}
