//! Relay coordinator
//!
//! Consumes confirmed deposit logs from the watcher, records them in the
//! ledger, runs fills on a bounded worker pool and advances the source cursor
//! only past blocks whose deposits are all confirmed.

use super::cursor::CursorStore;
use super::ledger::{DepositLedger, UpsertOutcome};
use crate::backoff::BackoffPolicy;
use crate::chain::{DestinationChain, EventWatcher, LogBatch, SourceChain, WatchEvent, WatcherConfig};
use crate::config::Settings;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{EventParser, DEPOSITED_TOPIC};
use crate::shutdown::Shutdown;
use crate::state::{Deposit, DepositId, DepositStatus, StateStore};
use crate::tx::{FillSubmitter, GasEstimator, SubmitterConfig, TxSigner};

use ethers::types::{Address, H256};
use futures::StreamExt;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

/// Store writes retried before the coordinator gives up
const PERSIST_RETRIES: u32 = 5;

/// Lifecycle of the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayState {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl RelayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayState::Starting => "starting",
            RelayState::Running => "running",
            RelayState::Draining => "draining",
            RelayState::Stopped => "stopped",
        }
    }
}

/// Snapshot published on every loop iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RelayStatus {
    pub state: RelayState,
    pub source_chain_id: u64,
    pub last_safe_block: u64,
    /// Deposits waiting for a worker
    pub queued: usize,
    /// Fills being submitted
    pub in_flight: usize,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub source_chain_id: u64,
    /// First block to scan on a fresh database
    pub genesis_block: u64,
    pub max_concurrent_fills: usize,
    /// Stop pulling logs while this many deposits wait for a worker
    pub max_pending_queue: usize,
    /// Grace period for in-flight fills on shutdown
    pub drain_timeout: Duration,
    /// How often the ledger is scanned for deposits released for retry
    pub rescan_interval: Duration,
    pub retry: BackoffPolicy,
}

/// Deposits waiting for a worker, plus everything already handed to one
#[derive(Default)]
struct FillQueue {
    waiting: VecDeque<DepositId>,
    scheduled: HashSet<DepositId>,
}

impl FillQueue {
    /// Returns `false` if the deposit is already queued or running
    fn push(&mut self, id: DepositId) -> bool {
        if self.scheduled.insert(id) {
            self.waiting.push_back(id);
            true
        } else {
            false
        }
    }

    fn pop(&mut self) -> Option<DepositId> {
        self.waiting.pop_front()
    }

    /// Put a popped deposit back at the front
    fn requeue(&mut self, id: DepositId) {
        self.waiting.push_front(id);
    }

    fn finish(&mut self, id: &DepositId) {
        self.scheduled.remove(id);
    }

    fn len(&self) -> usize {
        self.waiting.len()
    }
}

type FillOutcome = (DepositId, Instant, RelayerResult<H256>);

/// Highest block the cursor may move to after `batch`.
///
/// Deposits still `Observed` pin the cursor below their block.
pub fn safe_height(batch: &LogBatch, deposits: &[Deposit]) -> u64 {
    deposits
        .iter()
        .filter(|d| !d.status.is_confirmed())
        .map(|d| d.source_block.saturating_sub(1))
        .min()
        .unwrap_or(batch.to_block)
        .max(batch.from_block.saturating_sub(1))
}

pub struct RelayCoordinator {
    watcher: EventWatcher,
    parser: EventParser,
    ledger: Arc<DepositLedger>,
    submitter: Arc<FillSubmitter>,
    store: Arc<dyn StateStore>,
    config: CoordinatorConfig,
    shutdown: Shutdown,
    /// Shared with the submitter; fired when draining times out
    abort: Shutdown,
    status: watch::Sender<RelayStatus>,
}

impl RelayCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        watcher: EventWatcher,
        parser: EventParser,
        ledger: Arc<DepositLedger>,
        submitter: Arc<FillSubmitter>,
        store: Arc<dyn StateStore>,
        config: CoordinatorConfig,
        shutdown: Shutdown,
        abort: Shutdown,
    ) -> Self {
        let (status, _) = watch::channel(RelayStatus {
            state: RelayState::Starting,
            source_chain_id: config.source_chain_id,
            last_safe_block: config.genesis_block.saturating_sub(1),
            queued: 0,
            in_flight: 0,
        });

        Self {
            watcher,
            parser,
            ledger,
            submitter,
            store,
            config,
            shutdown,
            abort,
            status,
        }
    }

    /// Wire the full relay pipeline from configuration
    pub fn from_settings(
        settings: &Settings,
        source: Arc<dyn SourceChain>,
        destination: Arc<dyn DestinationChain>,
        signer: Box<dyn TxSigner>,
        store: Arc<dyn StateStore>,
        shutdown: Shutdown,
    ) -> RelayerResult<Self> {
        let relayer = &settings.relayer;
        let backoff = BackoffPolicy::new(
            Duration::from_millis(relayer.retry_delay_ms),
            Duration::from_millis(relayer.max_retry_delay_ms),
        );

        let source_contract = settings
            .source
            .contract()
            .map_err(|e| RelayerError::Config(e.to_string()))?;
        let fill_contract = settings
            .destination
            .contract()
            .map_err(|e| RelayerError::Config(e.to_string()))?;
        let token = settings
            .fill
            .token_address
            .parse::<Address>()
            .map_err(|e| RelayerError::Config(format!("Invalid token address: {}", e)))?;

        let watcher = EventWatcher::new(
            source,
            WatcherConfig {
                contract: source_contract,
                event_signature: *DEPOSITED_TOPIC,
                confirmation_depth: settings.source.confirmation_depth(),
                poll_interval: relayer.poll_interval(),
                max_block_range: relayer.max_block_range,
                rpc_timeout: relayer.rpc_timeout(),
                backoff: backoff.clone(),
                warn_after_failures: relayer.warn_after_failures,
            },
            shutdown.clone(),
        );
        let parser = EventParser::new(settings.source.chain_id, source_contract);

        let ledger = Arc::new(DepositLedger::new(store.clone()));
        let abort = Shutdown::new();
        let submitter = Arc::new(FillSubmitter::new(
            destination,
            signer,
            ledger.clone(),
            store.clone(),
            GasEstimator::new(&settings.fill),
            settings.destination.confirmation_depth(),
            SubmitterConfig {
                fill_contract,
                token,
                max_attempts: relayer.max_fill_attempts,
                backoff: backoff.clone(),
                rpc_timeout: relayer.rpc_timeout(),
                receipt_poll_interval: Duration::from_millis(settings.fill.receipt_poll_interval_ms),
                receipt_timeout: relayer.receipt_timeout(),
            },
            abort.clone(),
        ));

        let config = CoordinatorConfig {
            source_chain_id: settings.source.chain_id,
            genesis_block: settings.source.genesis_block,
            max_concurrent_fills: relayer.max_concurrent_fills.max(1),
            max_pending_queue: relayer.max_pending_queue.max(1),
            drain_timeout: relayer.drain_timeout(),
            rescan_interval: (relayer.poll_interval() * 5).max(Duration::from_millis(1)),
            retry: backoff,
        };

        Ok(Self::new(
            watcher, parser, ledger, submitter, store, config, shutdown, abort,
        ))
    }

    pub fn ledger(&self) -> Arc<DepositLedger> {
        self.ledger.clone()
    }

    pub fn submitter(&self) -> Arc<FillSubmitter> {
        self.submitter.clone()
    }

    pub fn status(&self) -> watch::Receiver<RelayStatus> {
        self.status.subscribe()
    }

    /// Relay until shutdown, then drain in-flight fills
    pub async fn run(self) -> RelayerResult<()> {
        let result = self.relay().await;
        if let Err(e) = &result {
            error!("Relay stopped on fatal error: {}", e);
            self.abort.trigger();
        }
        self.set_state(RelayState::Stopped);
        info!("Relay coordinator stopped");
        result
    }

    async fn relay(&self) -> RelayerResult<()> {
        self.set_state(RelayState::Starting);

        let mut cursor = CursorStore::load(
            self.store.clone(),
            self.config.source_chain_id,
            self.config.genesis_block,
        )
        .await?;
        let mut queue = FillQueue::default();
        self.recover(&mut queue).await?;

        self.set_state(RelayState::Running);
        info!(
            "Relay coordinator running from block {} on chain {}",
            cursor.last_safe_block(),
            self.watcher.chain_id()
        );

        let mut events = Box::pin(self.watcher.watch(cursor.last_safe_block()));
        let mut workers: JoinSet<FillOutcome> = JoinSet::new();
        let mut rescan = tokio::time::interval(self.config.rescan_interval);

        loop {
            self.spawn_ready(&mut queue, &mut workers).await?;
            self.publish(&cursor, &queue, workers.len());
            let accepting = queue.len() < self.config.max_pending_queue;

            tokio::select! {
                biased;

                _ = self.shutdown.wait() => break,

                Some(joined) = workers.join_next() => {
                    self.on_fill_result(joined, &mut queue).await?;
                }

                event = events.next(), if accepting => match event {
                    Some(event) => self.handle_event(event, &mut cursor, &mut queue).await?,
                    None => break,
                },

                _ = rescan.tick() => self.rescan(&mut queue),
            }
        }

        drop(events);
        self.drain(&mut workers, &mut queue, &cursor).await
    }

    /// Queue everything a previous run left unfinished
    async fn recover(&self, queue: &mut FillQueue) -> RelayerResult<()> {
        self.ledger.load().await?;

        let in_flight = self.ledger.in_flight();
        let pending = self.ledger.pending_fills();
        for deposit in in_flight.iter().chain(pending.iter()) {
            queue.push(deposit.id);
        }

        // Observed deposits sit above the cursor and are delivered again
        let unconfirmed = self.ledger.observed().len();
        if !in_flight.is_empty() || !pending.is_empty() || unconfirmed > 0 {
            info!(
                "Recovered {} in-flight, {} pending and {} unconfirmed deposits",
                in_flight.len(),
                pending.len(),
                unconfirmed
            );
        }
        Ok(())
    }

    /// Apply a watcher event, retrying transient failures until shutdown
    async fn handle_event(
        &self,
        event: WatchEvent,
        cursor: &mut CursorStore,
        queue: &mut FillQueue,
    ) -> RelayerResult<()> {
        let mut attempt = 0;
        loop {
            let result = match &event {
                WatchEvent::Logs(batch) => self.ingest(batch, cursor, queue).await,
                WatchEvent::Reorg { common_ancestor } => cursor.rollback(*common_ancestor).await,
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Failed to apply source event, retrying: {}", e);
                    if !self.config.retry.wait(attempt, &self.shutdown).await {
                        return Ok(());
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Record and confirm the deposits of a confirmed batch, then move the cursor
    async fn ingest(
        &self,
        batch: &LogBatch,
        cursor: &mut CursorStore,
        queue: &mut FillQueue,
    ) -> RelayerResult<()> {
        let mut deposits = Vec::with_capacity(batch.logs.len());

        for log in &batch.logs {
            let event = match self.parser.parse_log(log) {
                Ok(event) => event,
                Err(e) => {
                    warn!(
                        "Skipping log {:?}#{} in block {}: {}",
                        log.tx_hash, log.log_index, log.block_number, e
                    );
                    continue;
                }
            };

            let deposit = event.into_deposit();
            let id = deposit.id;
            match self.ledger.upsert(deposit.clone()).await? {
                UpsertOutcome::Inserted => {
                    crate::metrics::record_deposit_observed(self.config.source_chain_id);
                    info!(
                        "Deposit {} of {} from {:?} at block {}",
                        id, deposit.amount, deposit.depositor, deposit.source_block
                    );
                }
                UpsertOutcome::AlreadyPresent => debug!("Deposit {} already recorded", id),
            }

            let mut current = self
                .ledger
                .get(&id)
                .await?
                .ok_or_else(|| RelayerError::DepositNotFound { id: id.to_string() })?;
            if current.status == DepositStatus::Observed {
                current = self.ledger.advance(&id, DepositStatus::Confirmed).await?;
            }
            if current.awaiting_fill() {
                queue.push(id);
            }
            deposits.push(current);
        }

        cursor.advance(safe_height(batch, &deposits)).await?;
        Ok(())
    }

    /// Start fills until the worker pool is full
    async fn spawn_ready(
        &self,
        queue: &mut FillQueue,
        workers: &mut JoinSet<FillOutcome>,
    ) -> RelayerResult<()> {
        while workers.len() < self.config.max_concurrent_fills {
            let id = match queue.pop() {
                Some(id) => id,
                None => break,
            };

            let deposit = match self.claim(&id).await {
                Ok(Some(deposit)) => deposit,
                Ok(None) => {
                    queue.finish(&id);
                    continue;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Could not start fill for deposit {}: {}", id, e);
                    queue.requeue(id);
                    break;
                }
            };

            let submitter = self.submitter.clone();
            workers.spawn(async move {
                let started = Instant::now();
                let result = submitter.submit(&deposit).await;
                (deposit.id, started, result)
            });
        }
        Ok(())
    }

    /// Move a queued deposit to `Submitting`. `None` if it no longer needs a fill.
    async fn claim(&self, id: &DepositId) -> RelayerResult<Option<Deposit>> {
        let deposit = match self.ledger.get(id).await? {
            Some(deposit) => deposit,
            None => return Ok(None),
        };

        if deposit.status == DepositStatus::Submitting {
            return Ok(Some(deposit));
        }
        if !deposit.awaiting_fill() {
            return Ok(None);
        }
        self.ledger
            .advance(id, DepositStatus::Submitting)
            .await
            .map(Some)
    }

    async fn on_fill_result(
        &self,
        joined: Result<FillOutcome, JoinError>,
        queue: &mut FillQueue,
    ) -> RelayerResult<()> {
        let (id, started, result) =
            joined.map_err(|e| RelayerError::Internal(format!("fill task failed: {}", e)))?;
        queue.finish(&id);
        let chain_id = self.submitter.chain_id();

        match result {
            Ok(tx_hash) => {
                self.persist(|| self.ledger.record_fill(&id, tx_hash)).await?;
                crate::metrics::record_fill_completed(chain_id, started.elapsed());
                info!("Deposit {} filled by {:?}", id, tx_hash);
            }
            Err(RelayerError::Cancelled) => {
                info!("Fill for deposit {} interrupted, it will resume on restart", id);
            }
            Err(RelayerError::Database(e)) => {
                warn!("Store error while filling deposit {}, will resume: {}", id, e);
                queue.push(id);
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                if e.should_alert() {
                    error!("Fill for deposit {} failed: {}", id, e);
                } else {
                    warn!("Fill for deposit {} failed: {}", id, e);
                }
                crate::metrics::record_fill_failed(chain_id, &e);
                let reason = e.to_string();
                self.persist(|| self.ledger.record_failure(&id, &reason))
                    .await?;
            }
        }
        Ok(())
    }

    /// Queue deposits released for retry since the last scan
    fn rescan(&self, queue: &mut FillQueue) {
        for deposit in self.ledger.pending_fills() {
            if queue.push(deposit.id) {
                debug!("Queued deposit {} for fill", deposit.id);
            }
        }
    }

    async fn drain(
        &self,
        workers: &mut JoinSet<FillOutcome>,
        queue: &mut FillQueue,
        cursor: &CursorStore,
    ) -> RelayerResult<()> {
        self.set_state(RelayState::Draining);
        info!(
            "Draining {} in-flight fills ({} queued deposits left for restart)",
            workers.len(),
            queue.len()
        );

        let deadline = tokio::time::sleep(self.config.drain_timeout);
        tokio::pin!(deadline);

        loop {
            self.publish(cursor, queue, workers.len());
            tokio::select! {
                joined = workers.join_next() => match joined {
                    Some(joined) => self.on_fill_result(joined, queue).await?,
                    None => break,
                },
                _ = &mut deadline, if !self.abort.is_triggered() => {
                    warn!(
                        "Drain timeout reached, interrupting {} fills",
                        workers.len()
                    );
                    self.abort.trigger();
                }
            }
        }

        Ok(())
    }

    /// Retry a store write a few times before giving up
    async fn persist<T, F, Fut>(&self, mut op: F) -> RelayerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RelayerResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(RelayerError::Database(e)) if attempt < PERSIST_RETRIES => {
                    warn!("Store write failed, retrying: {}", e);
                    tokio::time::sleep(self.config.retry.delay(attempt)).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    fn set_state(&self, state: RelayState) {
        self.status.send_modify(|status| status.state = state);
        crate::metrics::record_relay_state(state.as_str());
    }

    fn publish(&self, cursor: &CursorStore, queue: &FillQueue, in_flight: usize) {
        crate::metrics::record_queue_depth(queue.len());
        self.status.send_if_modified(|status| {
            let next = RelayStatus {
                last_safe_block: cursor.last_safe_block(),
                queued: queue.len(),
                in_flight,
                ..*status
            };
            let changed = next != *status;
            *status = next;
            changed
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{AttemptStatus, MemoryStore};
    use crate::test_utils::{FakeDestinationChain, FakeSigner, FakeSourceChain};
    use sha3::{Digest, Keccak256};

    const SOURCE_CONTRACT: Address = Address::repeat_byte(0x42);

    const SETTINGS: &str = r#"
        [relayer]
        poll_interval_ms = 1
        retry_delay_ms = 1
        max_retry_delay_ms = 5
        receipt_timeout_secs = 30
        drain_timeout_secs = 5

        [database]
        url = "memory:"

        [api]
        host = "127.0.0.1"
        port = 0

        [metrics]
        enabled = false
        port = 0

        [source]
        chain_id = 1
        name = "source"
        rpc_urls = ["http://localhost:8545"]
        contract_address = "0x4242424242424242424242424242424242424242"
        confirmation_blocks = 12

        [destination]
        chain_id = 534352
        name = "destination"
        rpc_urls = ["http://localhost:8546"]
        contract_address = "0xf1f1f1f1f1f1f1f1f1f1f1f1f1f1f1f1f1f1f1f1"
        confirmation_blocks = 1

        [fill]
        token_address = "0x7070707070707070707070707070707070707070"
        receipt_poll_interval_ms = 2
    "#;

    struct Relay {
        source: Arc<FakeSourceChain>,
        destination: Arc<FakeDestinationChain>,
        store: Arc<MemoryStore>,
    }

    impl Relay {
        fn new(source_head: u64) -> Self {
            Self {
                source: Arc::new(FakeSourceChain::new(1, source_head)),
                destination: Arc::new(FakeDestinationChain::new(534352)),
                store: Arc::new(MemoryStore::new()),
            }
        }

        fn settings(&self) -> Settings {
            toml::from_str(SETTINGS).unwrap()
        }

        fn coordinator(&self, settings: &Settings, shutdown: Shutdown) -> RelayCoordinator {
            RelayCoordinator::from_settings(
                settings,
                self.source.clone(),
                self.destination.clone(),
                Box::new(FakeSigner::default()),
                self.store.clone(),
                shutdown,
            )
            .unwrap()
        }

        fn start(
            &self,
            settings: &Settings,
        ) -> (Shutdown, tokio::task::JoinHandle<RelayerResult<()>>, watch::Receiver<RelayStatus>) {
            let shutdown = Shutdown::new();
            let coordinator = self.coordinator(settings, shutdown.clone());
            let status = coordinator.status();
            (shutdown, tokio::spawn(coordinator.run()), status)
        }

        async fn wait_for_status(&self, id: &DepositId, status: DepositStatus) -> Deposit {
            let deadline = Instant::now() + Duration::from_secs(10);
            loop {
                if let Some(deposit) = self.store.get_deposit(id).await.unwrap() {
                    if deposit.status == status {
                        return deposit;
                    }
                }
                assert!(Instant::now() < deadline, "deposit {} never reached {}", id, status);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        async fn wait_for_broadcasts(&self, count: usize) {
            let deadline = Instant::now() + Duration::from_secs(10);
            while self.destination.broadcasts().len() < count {
                assert!(Instant::now() < deadline, "expected {} broadcasts", count);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    async fn wait_for_cursor(status: &mut watch::Receiver<RelayStatus>, block: u64) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while status.borrow_and_update().last_safe_block < block {
                status.changed().await.unwrap();
            }
        })
        .await
        .expect("cursor never reached the block");
    }

    async fn stop(shutdown: Shutdown, handle: tokio::task::JoinHandle<RelayerResult<()>>) {
        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("coordinator did not stop")
            .unwrap()
            .unwrap();
    }

    fn batch(from: u64, to: u64) -> LogBatch {
        LogBatch {
            from_block: from,
            to_block: to,
            logs: Vec::new(),
        }
    }

    #[test]
    fn test_safe_height_pins_on_unconfirmed_deposit() {
        let mut deposit = Deposit::observed(H256::zero(), 0, Address::zero(), 1.into(), 995);
        assert_eq!(safe_height(&batch(991, 1001), &[deposit.clone()]), 994);

        deposit.status = DepositStatus::Confirmed;
        assert_eq!(safe_height(&batch(991, 1001), &[deposit]), 1001);
        assert_eq!(safe_height(&batch(991, 1001), &[]), 1001);
    }

    #[test]
    fn test_fill_queue_deduplicates() {
        let mut queue = FillQueue::default();
        let id = DepositId(H256::repeat_byte(1));

        assert!(queue.push(id));
        assert!(!queue.push(id));
        assert_eq!(queue.pop(), Some(id));
        // Still running, so not queued again
        assert!(!queue.push(id));
        queue.finish(&id);
        assert!(queue.push(id));
    }

    #[tokio::test]
    async fn test_confirmed_deposit_is_filled_once() {
        let relay = Relay::new(1013);
        relay
            .source
            .add_deposit(SOURCE_CONTRACT, 1000, H256::repeat_byte(0xaa), 0, 100);
        let id = DepositId::derive(H256::repeat_byte(0xaa), 0);

        let mut settings = relay.settings();
        settings.source.genesis_block = 990;
        let (shutdown, handle, mut status) = relay.start(&settings);

        let filled = relay.wait_for_status(&id, DepositStatus::Filled).await;
        wait_for_cursor(&mut status, 1001).await;
        stop(shutdown, handle).await;

        assert_eq!(filled.amount, 100.into());
        assert_eq!(filled.attempts, 1);
        assert!(filled.fill_tx_hash.is_some());
        assert_eq!(relay.destination.broadcasts().len(), 1);
        assert_eq!(status.borrow().state, RelayState::Stopped);
        assert_eq!(relay.store.get_cursor(1).await.unwrap(), Some(1001));
    }

    #[tokio::test]
    async fn test_deposit_waits_for_confirmation_depth() {
        let relay = Relay::new(1011);
        relay
            .source
            .add_deposit(SOURCE_CONTRACT, 1000, H256::repeat_byte(0xaa), 0, 100);
        let id = DepositId::derive(H256::repeat_byte(0xaa), 0);

        let mut settings = relay.settings();
        settings.source.genesis_block = 990;
        let (shutdown, handle, mut status) = relay.start(&settings);

        wait_for_cursor(&mut status, 999).await;
        assert!(relay.store.get_deposit(&id).await.unwrap().is_none());

        relay.source.mine(1);
        relay.wait_for_status(&id, DepositStatus::Filled).await;
        stop(shutdown, handle).await;
    }

    #[tokio::test]
    async fn test_concurrent_fills_use_distinct_nonces() {
        let relay = Relay::new(200);
        for i in 0..6u8 {
            relay
                .source
                .add_deposit(SOURCE_CONTRACT, 100 + i as u64, H256::repeat_byte(i + 1), 0, 10);
        }

        let settings = relay.settings();
        let (shutdown, handle, _) = relay.start(&settings);

        let mut nonces = Vec::new();
        for i in 0..6u8 {
            let id = DepositId::derive(H256::repeat_byte(i + 1), 0);
            relay.wait_for_status(&id, DepositStatus::Filled).await;
            let attempts = relay.store.get_attempts(&id).await.unwrap();
            nonces.push(attempts[0].nonce);
        }
        stop(shutdown, handle).await;

        nonces.sort_unstable();
        nonces.dedup();
        assert_eq!(nonces.len(), 6);
        assert_eq!(relay.destination.mined_count(), 6);
    }

    #[tokio::test]
    async fn test_reverted_fill_fails_until_released() {
        let relay = Relay::new(100);
        relay
            .source
            .add_deposit(SOURCE_CONTRACT, 50, H256::repeat_byte(0xaa), 0, 100);
        relay
            .source
            .add_deposit(SOURCE_CONTRACT, 60, H256::repeat_byte(0xbb), 0, 100);
        let id = DepositId::derive(H256::repeat_byte(0xaa), 0);
        relay.destination.set_revert(true);

        let settings = relay.settings();
        let shutdown = Shutdown::new();
        let coordinator = relay.coordinator(&settings, shutdown.clone());
        let ledger = coordinator.ledger();
        let mut status = coordinator.status();
        let handle = tokio::spawn(coordinator.run());

        let failed = relay.wait_for_status(&id, DepositStatus::Failed).await;
        assert!(failed.failure_reason.unwrap().contains("reverted"));
        // A failed fill does not hold back the cursor
        wait_for_cursor(&mut status, 88).await;

        relay.destination.set_revert(false);
        ledger.release_for_retry(&id).await.unwrap();
        let filled = relay.wait_for_status(&id, DepositStatus::Filled).await;
        stop(shutdown, handle).await;

        assert_eq!(filled.attempts, 2);
        assert_eq!(filled.failure_reason, None);
    }

    #[tokio::test]
    async fn test_resumes_in_flight_fill_after_restart() {
        let relay = Relay::new(100);
        relay
            .source
            .add_deposit(SOURCE_CONTRACT, 50, H256::repeat_byte(0xaa), 0, 100);
        let id = DepositId::derive(H256::repeat_byte(0xaa), 0);
        relay.destination.set_auto_mine(false);

        let mut settings = relay.settings();
        settings.relayer.drain_timeout_secs = 0;
        let (shutdown, handle, _) = relay.start(&settings);

        relay.wait_for_broadcasts(1).await;
        stop(shutdown, handle).await;

        let stranded = relay.store.get_deposit(&id).await.unwrap().unwrap();
        assert_eq!(stranded.status, DepositStatus::Submitting);
        let attempts = relay.store.get_attempts(&id).await.unwrap();
        assert_eq!(attempts[0].status, AttemptStatus::Pending);

        // The broadcast lands while the relayer is down
        let raw = relay.destination.broadcasts()[0].clone();
        let tx_hash = H256::from_slice(&Keccak256::digest(&raw));
        relay.destination.mine_tx(tx_hash);

        let (shutdown, handle, _) = relay.start(&settings);
        let filled = relay.wait_for_status(&id, DepositStatus::Filled).await;
        stop(shutdown, handle).await;

        assert_eq!(filled.fill_tx_hash, Some(tx_hash));
        assert_eq!(relay.destination.broadcasts().len(), 1);
        let attempts = relay.store.get_attempts(&id).await.unwrap();
        assert_eq!(attempts[0].status, AttemptStatus::Mined);
    }

    #[tokio::test]
    async fn test_deep_reorg_rescans_without_refilling() {
        let relay = Relay::new(100);
        relay
            .source
            .add_deposit(SOURCE_CONTRACT, 50, H256::repeat_byte(0xaa), 0, 100);
        let first = DepositId::derive(H256::repeat_byte(0xaa), 0);

        let settings = relay.settings();
        let (shutdown, handle, mut status) = relay.start(&settings);
        relay.wait_for_status(&first, DepositStatus::Filled).await;
        wait_for_cursor(&mut status, 88).await;

        // Replace already-confirmed blocks above the filled deposit
        relay.source.reorg(70);
        relay
            .source
            .add_deposit(SOURCE_CONTRACT, 75, H256::repeat_byte(0xbb), 0, 100);
        let second = DepositId::derive(H256::repeat_byte(0xbb), 0);

        relay.wait_for_status(&second, DepositStatus::Filled).await;
        stop(shutdown, handle).await;

        assert_eq!(relay.destination.broadcasts().len(), 2);
        let first = relay.store.get_deposit(&first).await.unwrap().unwrap();
        assert_eq!(first.status, DepositStatus::Filled);
        assert_eq!(first.attempts, 1);
    }
}
