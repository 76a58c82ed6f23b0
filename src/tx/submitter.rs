//! Fill submission with retry, same-nonce replacement and resume
//!
//! Every broadcast try is persisted as a `FillAttempt` before it is sent, so
//! a restarted relayer can find fills that were mined while it was down
//! instead of paying for a second one.

use super::gas::GasEstimator;
use super::nonce::NonceManager;
use super::signer::TxSigner;
use crate::backoff::BackoffPolicy;
use crate::chain::{with_timeout, DestinationChain, FillReceipt, FinalityTracker, GasPrice};
use crate::coordination::DepositLedger;
use crate::error::{RelayerError, RelayerResult};
use crate::shutdown::Shutdown;
use crate::state::{AttemptStatus, Deposit, DepositId, FillAttempt, GasParams, StateStore};

use chrono::Utc;
use dashmap::DashMap;
use ethers::abi::{encode, Token};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, TransactionRequest, H256, U256};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Destination contract entry point
pub const FILL_DEPOSIT_SIGNATURE: &str = "fillDeposit(bytes32,uint256,address,address,uint256)";

/// Finalized receipts kept by the finality tracker
const FINALITY_CACHE_ENTRIES: usize = 1024;

#[derive(Debug, Clone)]
pub struct SubmitterConfig {
    /// Contract receiving `fillDeposit`
    pub fill_contract: Address,
    /// Token delivered to the depositor
    pub token: Address,
    /// Broadcast tries per submission
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub rpc_timeout: Duration,
    pub receipt_poll_interval: Duration,
    /// How long a broadcast may stay unmined before it is replaced
    pub receipt_timeout: Duration,
}

/// Calldata of `fillDeposit(depositId, amount, depositor, token, fee)`.
///
/// Deposits are filled 1:1, so `fee` is always zero.
pub fn encode_fill_call(deposit: &Deposit, token: Address) -> Bytes {
    let mut data = ethers::utils::id(FILL_DEPOSIT_SIGNATURE).to_vec();
    data.extend(encode(&[
        Token::FixedBytes(deposit.id.as_bytes().to_vec()),
        Token::Uint(deposit.amount),
        Token::Address(deposit.depositor),
        Token::Address(token),
        Token::Uint(U256::zero()),
    ]));
    data.into()
}

/// One submission of one deposit
struct FillJob {
    deposit: Deposit,
    nonce: u64,
    gas_limit: U256,
    base_price: GasPrice,
    /// All attempts of the deposit, including earlier runs
    attempts: Vec<FillAttempt>,
    /// Broadcasts already accepted with `nonce`, priced below the next one
    replacements: u32,
    tries: u32,
    nonce_refreshed: bool,
}

/// Nonce of the newest attempt that may still be mined.
///
/// An accepted broadcast keeps its nonce after it was replaced, since the
/// node can still include it until another transaction takes the nonce.
fn reserved_nonce(attempts: &[FillAttempt]) -> Option<u64> {
    attempts
        .iter()
        .rev()
        .find(|a| {
            a.status == AttemptStatus::Pending
                || (a.tx_hash.is_some() && a.status != AttemptStatus::Mined)
        })
        .map(|a| a.nonce)
}

fn accepted_with(attempts: &[FillAttempt], nonce: u64) -> u32 {
    attempts
        .iter()
        .filter(|a| a.nonce == nonce && a.tx_hash.is_some())
        .count() as u32
}

/// Sends `fillDeposit` transactions and waits for them to become final
pub struct FillSubmitter {
    chain: Arc<dyn DestinationChain>,
    signer: Box<dyn TxSigner>,
    nonces: NonceManager,
    gas: GasEstimator,
    finality: FinalityTracker,
    ledger: Arc<DepositLedger>,
    store: Arc<dyn StateStore>,
    config: SubmitterConfig,
    /// Fired when in-flight fills must stop waiting
    abort: Shutdown,
    locks: DashMap<DepositId, Arc<Mutex<()>>>,
}

impl FillSubmitter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<dyn DestinationChain>,
        signer: Box<dyn TxSigner>,
        ledger: Arc<DepositLedger>,
        store: Arc<dyn StateStore>,
        gas: GasEstimator,
        confirmation_blocks: u64,
        config: SubmitterConfig,
        abort: Shutdown,
    ) -> Self {
        let nonces = NonceManager::new(signer.address(), chain.chain_id());
        let finality = FinalityTracker::new(confirmation_blocks, chain.clone());

        info!(
            "Fill submitter ready on chain {} with account {:?}",
            chain.chain_id(),
            signer.address()
        );

        Self {
            chain,
            signer,
            nonces,
            gas,
            finality,
            ledger,
            store,
            config,
            abort,
            locks: DashMap::new(),
        }
    }

    pub fn account(&self) -> Address {
        self.signer.address()
    }

    pub fn chain_id(&self) -> u64 {
        self.chain.chain_id()
    }

    /// Fill `deposit`, which must be `Submitting`.
    ///
    /// Returns the hash of the final, successful fill. `Cancelled` means the
    /// abort signal fired and the deposit should be resumed later.
    pub async fn submit(&self, deposit: &Deposit) -> RelayerResult<H256> {
        let lock = self
            .locks
            .entry(deposit.id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;
            self.submit_locked(deposit).await
        };
        // Only the map and `lock` may still point at the mutex
        self.locks
            .remove_if(&deposit.id, |_, entry| Arc::strong_count(entry) == 2);
        result
    }

    async fn submit_locked(&self, deposit: &Deposit) -> RelayerResult<H256> {
        let mut attempts = self.store.get_attempts(&deposit.id).await?;

        // Read before the receipts, so a fill mined in between is seen by one of them
        let reserved = match reserved_nonce(&attempts) {
            Some(nonce) => {
                let mined = self
                    .retry_transient("mined nonce", || {
                        self.chain.get_mined_nonce(self.signer.address())
                    })
                    .await?;
                Some((nonce, mined))
            }
            None => None,
        };

        // A fill from an earlier run may already be on chain
        if self.find_receipt(&attempts).await?.is_some() {
            info!("Fill for deposit {} already broadcast, adopting it", deposit.id);
            let receipt = self.await_fill(&deposit.id, &attempts).await?;
            return self.conclude(&mut attempts, receipt).await;
        }

        let mut job = self.prepare(deposit, attempts, reserved).await?;
        self.drive(&mut job).await
    }

    /// `reserved` is the nonce of an earlier attempt that may still be mined,
    /// paired with the account's mined transaction count.
    async fn prepare(
        &self,
        deposit: &Deposit,
        attempts: Vec<FillAttempt>,
        reserved: Option<(u64, u64)>,
    ) -> RelayerResult<FillJob> {
        let base_price = self
            .retry_transient("gas price", || self.gas.get_gas_price(self.chain.as_ref()))
            .await?;

        let template = self.build_fill_tx(deposit, None, None, &base_price);
        let gas_limit = self
            .retry_transient("estimate gas", || {
                self.gas.estimate_fill_gas(self.chain.as_ref(), &template)
            })
            .await?;

        self.retry_transient("sync nonce", || self.nonces.sync(self.chain.as_ref()))
            .await?;

        let nonce = match reserved {
            Some((nonce, mined)) if nonce >= mined => {
                debug!("Resuming fill for {} with nonce {}", deposit.id, nonce);
                self.nonces.claim(nonce, deposit.id).await;
                nonce
            }
            Some((nonce, mined)) => {
                warn!(
                    "Nonce {} of deposit {} was taken by another transaction (mined nonce {}), allocating a new one",
                    nonce, deposit.id, mined
                );
                self.nonces.allocate(deposit.id).await?
            }
            None => self.nonces.allocate(deposit.id).await?,
        };

        Ok(FillJob {
            deposit: deposit.clone(),
            nonce,
            gas_limit,
            base_price,
            replacements: accepted_with(&attempts, nonce),
            attempts,
            tries: 0,
            nonce_refreshed: false,
        })
    }

    async fn drive(&self, job: &mut FillJob) -> RelayerResult<H256> {
        let id = job.deposit.id;
        let mut last_error: Option<RelayerError> = None;
        let mut skip_backoff = false;

        loop {
            if job.tries >= self.config.max_attempts {
                return Err(self.give_up(job, last_error).await);
            }
            if job.tries > 0
                && !skip_backoff
                && !self.config.backoff.wait(job.tries - 1, &self.abort).await
            {
                return Err(RelayerError::Cancelled);
            }
            skip_backoff = false;
            job.tries += 1;

            let number = self.ledger.record_attempt(&id).await?;
            let price = self
                .gas
                .bumped(&job.base_price, job.replacements + job.tries - 1);
            let tx = self.build_fill_tx(&job.deposit, Some(job.nonce), Some(job.gas_limit), &price);

            let mut attempt = FillAttempt {
                deposit_id: id,
                attempt: number,
                nonce: job.nonce,
                gas: GasParams {
                    gas_limit: job.gas_limit,
                    price,
                },
                tx_hash: None,
                broadcast_at: Utc::now(),
                status: AttemptStatus::Pending,
                error: None,
            };
            self.supersede(&mut job.attempts).await?;
            self.store.save_attempt(&attempt).await?;

            let sent = match self.signer.sign(&tx).await {
                Ok(raw) => {
                    self.rpc("broadcast fill", self.chain.broadcast(raw)).await
                }
                Err(e) => Err(e),
            };

            match sent {
                Ok(tx_hash) => {
                    attempt.tx_hash = Some(tx_hash);
                    self.store.save_attempt(&attempt).await?;
                    job.attempts.push(attempt);
                    crate::metrics::record_fill_submitted(self.chain.chain_id());

                    info!(
                        "Fill for deposit {} broadcast as {:?} (attempt {}, nonce {})",
                        id, tx_hash, number, job.nonce
                    );

                    match self.await_fill(&id, &job.attempts).await {
                        Ok(receipt) => return self.conclude(&mut job.attempts, receipt).await,
                        Err(e) if e.is_retryable() => {
                            warn!("Fill for deposit {} not final yet: {}", id, e);
                            last_error = Some(e);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => {
                    attempt.status = AttemptStatus::Dropped;
                    attempt.error = Some(e.to_string());
                    self.store.save_attempt(&attempt).await?;
                    job.attempts.push(attempt);

                    match e {
                        RelayerError::NonceConflict { .. } if !job.nonce_refreshed => {
                            warn!("Nonce {} rejected for deposit {}: {}", job.nonce, id, e);
                            job.nonce_refreshed = true;
                            crate::metrics::record_nonce_resync(self.chain.chain_id());

                            let mined = self
                                .rpc(
                                    "mined nonce",
                                    self.chain.get_mined_nonce(self.signer.address()),
                                )
                                .await?;

                            // One of our own earlier broadcasts may have taken the nonce
                            if self.find_receipt(&job.attempts).await?.is_some() {
                                let receipt = self.await_fill(&id, &job.attempts).await?;
                                return self.conclude(&mut job.attempts, receipt).await;
                            }

                            if mined <= job.nonce && accepted_with(&job.attempts, job.nonce) > 0 {
                                // Our broadcast still holds the nonce; outbid it instead
                                debug!(
                                    "Keeping nonce {} for deposit {}, an earlier fill is still pending",
                                    job.nonce, id
                                );
                            } else {
                                self.nonces.release(job.nonce).await;
                                self.nonces.sync(self.chain.as_ref()).await?;
                                job.nonce = self.nonces.allocate(id).await?;
                                job.replacements = accepted_with(&job.attempts, job.nonce);
                            }
                            skip_backoff = true;
                            last_error = Some(e);
                        }
                        e if e.is_retryable() => {
                            debug!("Broadcast for deposit {} failed: {}", id, e);
                            last_error = Some(e);
                        }
                        e => {
                            self.release_unused_nonce(job).await;
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Out of tries. Returns the error to report.
    async fn give_up(&self, job: &FillJob, last_error: Option<RelayerError>) -> RelayerError {
        self.release_unused_nonce(job).await;
        warn!(
            "Giving up on deposit {} after {} tries",
            job.deposit.id, job.tries
        );
        last_error.unwrap_or_else(|| {
            RelayerError::Internal(format!("no fill attempt made for {}", job.deposit.id))
        })
    }

    /// Hand the nonce back if no broadcast with it reached the node
    async fn release_unused_nonce(&self, job: &FillJob) {
        let used = job
            .attempts
            .iter()
            .any(|a| a.nonce == job.nonce && a.tx_hash.is_some());
        if !used {
            self.nonces.release(job.nonce).await;
        }
    }

    /// Mark the currently pending attempt as replaced
    async fn supersede(&self, attempts: &mut [FillAttempt]) -> RelayerResult<()> {
        for attempt in attempts
            .iter_mut()
            .filter(|a| a.status == AttemptStatus::Pending)
        {
            attempt.status = AttemptStatus::Dropped;
            attempt.error = Some("replaced".to_string());
            self.store.save_attempt(attempt).await?;
        }
        Ok(())
    }

    /// Wait until one of `attempts` is mined and final
    async fn await_fill(
        &self,
        id: &DepositId,
        attempts: &[FillAttempt],
    ) -> RelayerResult<FillReceipt> {
        let deadline = Instant::now() + self.config.receipt_timeout;

        loop {
            let receipt = match self.find_receipt(attempts).await {
                Ok(receipt) => receipt,
                Err(e) if e.is_retryable() => {
                    debug!("Receipt lookup for deposit {} failed: {}", id, e);
                    None
                }
                Err(e) => return Err(e),
            };

            if let Some(receipt) = receipt {
                if !receipt.success {
                    return Ok(receipt);
                }
                self.finality
                    .track(receipt.tx_hash, receipt.block_number)
                    .await;
                match self.wait_finality(receipt.tx_hash).await {
                    Ok(()) => return Ok(receipt),
                    Err(RelayerError::ChainReorg { .. }) => {
                        warn!(
                            "Fill {:?} for deposit {} was reorged out, waiting for re-inclusion",
                            receipt.tx_hash, id
                        );
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            if Instant::now() >= deadline {
                return Err(RelayerError::Timeout {
                    operation: format!("inclusion of fill for deposit {}", id),
                });
            }
            if !self.abort.sleep(self.config.receipt_poll_interval).await {
                return Err(RelayerError::Cancelled);
            }
        }
    }

    async fn wait_finality(&self, tx_hash: H256) -> RelayerResult<()> {
        loop {
            match self.finality.is_finalized(tx_hash).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) if e.is_retryable() && !matches!(e, RelayerError::ChainReorg { .. }) => {
                    debug!("Finality check for {:?} failed: {}", tx_hash, e);
                }
                Err(e) => return Err(e),
            }
            if !self.abort.sleep(self.config.receipt_poll_interval).await {
                return Err(RelayerError::Cancelled);
            }
        }
    }

    /// Receipt of the newest broadcast attempt that was mined
    async fn find_receipt(&self, attempts: &[FillAttempt]) -> RelayerResult<Option<FillReceipt>> {
        for attempt in attempts.iter().rev() {
            let tx_hash = match attempt.tx_hash {
                Some(tx_hash) => tx_hash,
                None => continue,
            };
            if let Some(receipt) = self
                .rpc("get receipt", self.chain.get_receipt(tx_hash))
                .await?
            {
                // A revert that was already reported does not block a retry
                if !receipt.success && attempt.status == AttemptStatus::Mined {
                    continue;
                }
                return Ok(Some(receipt));
            }
        }
        Ok(None)
    }

    /// Record which attempt was mined and report the outcome
    async fn conclude(
        &self,
        attempts: &mut [FillAttempt],
        receipt: FillReceipt,
    ) -> RelayerResult<H256> {
        for attempt in attempts.iter_mut() {
            let status = if attempt.tx_hash == Some(receipt.tx_hash) {
                AttemptStatus::Mined
            } else if attempt.status == AttemptStatus::Pending {
                AttemptStatus::Dropped
            } else {
                continue;
            };
            if attempt.status != status {
                attempt.status = status;
                self.store.save_attempt(attempt).await?;
            }
            if status == AttemptStatus::Mined {
                self.nonces.confirm(attempt.nonce).await;
            }
        }
        self.finality.cleanup_cache(FINALITY_CACHE_ENTRIES).await;

        if receipt.success {
            Ok(receipt.tx_hash)
        } else {
            Err(RelayerError::Reverted {
                reason: format!(
                    "fill {:?} reverted in block {}",
                    receipt.tx_hash, receipt.block_number
                ),
            })
        }
    }

    fn build_fill_tx(
        &self,
        deposit: &Deposit,
        nonce: Option<u64>,
        gas_limit: Option<U256>,
        gas_price: &GasPrice,
    ) -> TypedTransaction {
        let data = encode_fill_call(deposit, self.config.token);
        let from = self.signer.address();
        let chain_id = self.chain.chain_id();

        let mut tx: TypedTransaction = match gas_price {
            GasPrice::Legacy(price) => TransactionRequest::new()
                .from(from)
                .to(self.config.fill_contract)
                .data(data)
                .gas_price(*price)
                .chain_id(chain_id)
                .into(),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => Eip1559TransactionRequest::new()
                .from(from)
                .to(self.config.fill_contract)
                .data(data)
                .max_fee_per_gas(*max_fee_per_gas)
                .max_priority_fee_per_gas(*max_priority_fee_per_gas)
                .chain_id(chain_id)
                .into(),
        };

        if let Some(nonce) = nonce {
            tx.set_nonce(nonce);
        }
        if let Some(gas) = gas_limit {
            tx.set_gas(gas);
        }
        tx
    }

    /// Run `op` until it succeeds or fails with a non-transient error
    async fn retry_transient<T, F, Fut>(&self, operation: &str, mut op: F) -> RelayerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RelayerResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match self.rpc(operation, op()).await {
                Err(e) if e.is_retryable() && attempt + 1 < self.config.max_attempts => {
                    debug!("{} failed, retrying: {}", operation, e);
                    if !self.config.backoff.wait(attempt, &self.abort).await {
                        return Err(RelayerError::Cancelled);
                    }
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn rpc<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = RelayerResult<T>>,
    ) -> RelayerResult<T> {
        with_timeout(self.config.rpc_timeout, self.chain.chain_id(), operation, fut).await
    }
}
