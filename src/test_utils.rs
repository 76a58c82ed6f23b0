//! Scriptable in-process chains for unit and scenario tests

use crate::chain::{BlockRef, DestinationChain, FillReceipt, GasPrice, LogEntry, SourceChain};
use crate::error::{RelayerError, RelayerResult};
use crate::events::tests::deposit_log;
use crate::tx::TxSigner;

use async_trait::async_trait;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, H256, U256};
use sha3::{Digest, Keccak256};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Depositor used by [`FakeSourceChain::add_deposit`]
pub const FAKE_DEPOSITOR: Address = Address::repeat_byte(0xde);

fn block_hash(height: u64, fork: u8) -> H256 {
    let mut bytes = [0u8; 32];
    bytes[0] = fork + 1;
    bytes[24..].copy_from_slice(&height.to_be_bytes());
    H256(bytes)
}

struct SourceState {
    blocks: Vec<BlockRef>,
    logs: Vec<LogEntry>,
    fork: u8,
    failures: u32,
    /// Heights reported missing, with the number of lookups left
    hidden: HashMap<u64, u32>,
}

/// Source chain whose blocks can be mined and reorganized at will
pub struct FakeSourceChain {
    chain_id: u64,
    state: Mutex<SourceState>,
    block_requests: AtomicUsize,
    peak_block_requests: AtomicUsize,
}

impl FakeSourceChain {
    pub fn new(chain_id: u64, head: u64) -> Self {
        let chain = Self {
            chain_id,
            state: Mutex::new(SourceState {
                blocks: Vec::new(),
                logs: Vec::new(),
                fork: 0,
                failures: 0,
                hidden: HashMap::new(),
            }),
            block_requests: AtomicUsize::new(0),
            peak_block_requests: AtomicUsize::new(0),
        };
        chain.extend_to(head);
        chain
    }

    fn extend_to(&self, head: u64) {
        let mut state = self.state.lock().unwrap();
        let fork = state.fork;
        while state.blocks.len() as u64 <= head {
            let number = state.blocks.len() as u64;
            let parent_hash = state.blocks.last().map(|b| b.hash).unwrap_or_default();
            state.blocks.push(BlockRef {
                number,
                hash: block_hash(number, fork),
                parent_hash,
            });
        }
    }

    pub fn head(&self) -> u64 {
        self.state.lock().unwrap().blocks.len() as u64 - 1
    }

    pub fn mine(&self, blocks: u64) {
        let head = self.head();
        self.extend_to(head + blocks);
    }

    /// Replace every block from `from` up to the head with a new fork.
    /// Logs in the replaced blocks disappear.
    pub fn reorg(&self, from: u64) {
        let head = self.head();
        {
            let mut state = self.state.lock().unwrap();
            state.fork += 1;
            state.blocks.truncate(from as usize);
            state.logs.retain(|log| log.block_number < from);
        }
        self.extend_to(head);
    }

    pub fn block_hash(&self, height: u64) -> H256 {
        self.state.lock().unwrap().blocks[height as usize].hash
    }

    /// Emit a `Deposited` log from `contract` in block `block`
    pub fn add_deposit(
        &self,
        contract: Address,
        block: u64,
        tx_hash: H256,
        log_index: u64,
        amount: u64,
    ) {
        let hash = self.block_hash(block);
        let log = deposit_log(
            contract,
            tx_hash,
            log_index,
            FAKE_DEPOSITOR,
            amount,
            block,
            hash,
        );
        self.state.lock().unwrap().logs.push(log);
    }

    /// Report block `height` as unknown for the next `lookups` requests
    pub fn hide_block(&self, height: u64, lookups: u32) {
        self.state.lock().unwrap().hidden.insert(height, lookups);
    }

    /// Most `get_block` calls seen in flight at once
    pub fn peak_block_requests(&self) -> usize {
        self.peak_block_requests.load(Ordering::SeqCst)
    }

    /// Fail the next `count` RPC calls with a transport error
    pub fn fail_next(&self, count: u32) {
        self.state.lock().unwrap().failures = count;
    }

    fn check_failure(&self) -> RelayerResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.failures > 0 {
            state.failures -= 1;
            return Err(RelayerError::TransientNetwork {
                chain_id: self.chain_id,
                message: "connection reset".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SourceChain for FakeSourceChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn get_head(&self) -> RelayerResult<u64> {
        self.check_failure()?;
        Ok(self.head())
    }

    async fn get_logs(
        &self,
        address: Address,
        event_signature: H256,
        from_block: u64,
        to_block: u64,
    ) -> RelayerResult<Vec<LogEntry>> {
        self.check_failure()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .logs
            .iter()
            .filter(|log| {
                log.address == address
                    && log.topics.first() == Some(&event_signature)
                    && log.block_number >= from_block
                    && log.block_number <= to_block
            })
            .cloned()
            .collect())
    }

    async fn get_block(&self, height: u64) -> RelayerResult<Option<BlockRef>> {
        self.check_failure()?;

        let in_flight = self.block_requests.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_block_requests.fetch_max(in_flight, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.block_requests.fetch_sub(1, Ordering::SeqCst);

        let mut state = self.state.lock().unwrap();
        if let Some(lookups) = state.hidden.get_mut(&height) {
            if *lookups > 0 {
                *lookups -= 1;
                return Ok(None);
            }
        }
        Ok(state.blocks.get(height as usize).copied())
    }
}

struct DestinationState {
    head: u64,
    /// Next nonce of the relayer account on chain
    nonce: u64,
    broadcast_errors: VecDeque<RelayerError>,
    broadcasts: Vec<Bytes>,
    receipts: HashMap<H256, FillReceipt>,
    auto_mine: bool,
    revert: bool,
}

/// Destination chain that mines every accepted broadcast immediately
/// unless told otherwise
pub struct FakeDestinationChain {
    chain_id: u64,
    state: Mutex<DestinationState>,
}

impl FakeDestinationChain {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            state: Mutex::new(DestinationState {
                head: 100,
                nonce: 0,
                broadcast_errors: VecDeque::new(),
                broadcasts: Vec::new(),
                receipts: HashMap::new(),
                auto_mine: true,
                revert: false,
            }),
        }
    }

    /// Queue errors returned by the next broadcasts, in order
    pub fn fail_broadcasts(&self, errors: Vec<RelayerError>) {
        self.state.lock().unwrap().broadcast_errors.extend(errors);
    }

    pub fn set_auto_mine(&self, enabled: bool) {
        self.state.lock().unwrap().auto_mine = enabled;
    }

    pub fn set_revert(&self, revert: bool) {
        self.state.lock().unwrap().revert = revert;
    }

    /// Simulate another party using the relayer account
    pub fn set_nonce(&self, nonce: u64) {
        self.state.lock().unwrap().nonce = nonce;
    }

    /// Mine a previously broadcast transaction
    pub fn mine_tx(&self, tx_hash: H256) {
        let mut state = self.state.lock().unwrap();
        state.head += 1;
        state.nonce += 1;
        let receipt = FillReceipt {
            tx_hash,
            success: !state.revert,
            block_number: state.head,
        };
        state.receipts.insert(tx_hash, receipt);
    }

    /// Transactions accepted so far
    pub fn broadcasts(&self) -> Vec<Bytes> {
        self.state.lock().unwrap().broadcasts.clone()
    }

    pub fn mined_count(&self) -> usize {
        self.state.lock().unwrap().receipts.len()
    }
}

#[async_trait]
impl DestinationChain for FakeDestinationChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn get_head(&self) -> RelayerResult<u64> {
        let mut state = self.state.lock().unwrap();
        state.head += 1;
        Ok(state.head)
    }

    async fn get_nonce(&self, _account: Address) -> RelayerResult<u64> {
        Ok(self.state.lock().unwrap().nonce)
    }

    async fn get_mined_nonce(&self, _account: Address) -> RelayerResult<u64> {
        Ok(self.state.lock().unwrap().nonce)
    }

    async fn estimate_gas(&self, _tx: &TypedTransaction) -> RelayerResult<U256> {
        Ok(U256::from(80_000))
    }

    async fn gas_price(&self) -> RelayerResult<GasPrice> {
        Ok(GasPrice::Legacy(U256::from(1_000_000_000u64)))
    }

    async fn broadcast(&self, signed_tx: Bytes) -> RelayerResult<H256> {
        let auto_mine = {
            let mut state = self.state.lock().unwrap();
            if let Some(err) = state.broadcast_errors.pop_front() {
                return Err(err);
            }
            state.broadcasts.push(signed_tx.clone());
            state.auto_mine
        };

        let tx_hash = H256::from_slice(&Keccak256::digest(&signed_tx));
        if auto_mine {
            self.mine_tx(tx_hash);
        }
        Ok(tx_hash)
    }

    async fn get_receipt(&self, tx_hash: H256) -> RelayerResult<Option<FillReceipt>> {
        Ok(self.state.lock().unwrap().receipts.get(&tx_hash).copied())
    }
}

/// Signer producing a deterministic encoding of the unsigned transaction
pub struct FakeSigner {
    pub address: Address,
}

impl Default for FakeSigner {
    fn default() -> Self {
        Self {
            address: Address::repeat_byte(0x5e),
        }
    }
}

#[async_trait]
impl TxSigner for FakeSigner {
    fn address(&self) -> Address {
        self.address
    }

    async fn sign(&self, tx: &TypedTransaction) -> RelayerResult<Bytes> {
        Ok(tx.rlp())
    }
}
