//! Reorg-aware event watcher
//!
//! Polls the source chain and yields confirmed logs as a lazy stream. Only
//! blocks at least `confirmation_depth` below the head are ever delivered;
//! newer blocks are observed so reorgs in the unconfirmed tail can be
//! detected, but their logs are held back until they are confirmed.

use crate::backoff::BackoffPolicy;
use crate::error::{RelayerError, RelayerResult};
use crate::shutdown::Shutdown;

use super::{with_timeout, BlockRef, LogEntry, SourceChain};

use ethers::types::{Address, H256};
use futures::{Stream, StreamExt, TryStreamExt};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Header requests kept in flight while catching up
const HEADER_FETCH_CONCURRENCY: usize = 16;

/// Watcher settings
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Contract emitting the event
    pub contract: Address,
    /// topic0 of the watched event
    pub event_signature: H256,
    pub confirmation_depth: u64,
    pub poll_interval: Duration,
    /// Largest range requested per poll
    pub max_block_range: u64,
    pub rpc_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Consecutive failures before a warning is logged
    pub warn_after_failures: u32,
}

/// Confirmed logs of the block range `from_block..=to_block`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogBatch {
    pub from_block: u64,
    pub to_block: u64,
    /// Ascending by `(block_number, log_index)`
    pub logs: Vec<LogEntry>,
}

/// Item yielded by [`EventWatcher::watch`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Logs(LogBatch),
    /// Already-delivered blocks above `common_ancestor` were replaced. Delivery
    /// resumes from `common_ancestor + 1`.
    Reorg { common_ancestor: u64 },
}

/// Watches one event signature on the source chain
pub struct EventWatcher {
    chain: Arc<dyn SourceChain>,
    config: WatcherConfig,
    shutdown: Shutdown,
}

impl EventWatcher {
    pub fn new(chain: Arc<dyn SourceChain>, config: WatcherConfig, shutdown: Shutdown) -> Self {
        Self {
            chain,
            config,
            shutdown,
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain.chain_id()
    }

    /// Stream of confirmed log batches for blocks above `from_block`.
    ///
    /// The stream only ends when shutdown is requested. Dropping it and calling
    /// `watch` again with the last safe height resumes without gaps.
    pub fn watch(&self, from_block: u64) -> impl Stream<Item = WatchEvent> + Send + 'static {
        let cursor = WatchCursor {
            chain_id: self.chain.chain_id(),
            chain: self.chain.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
            last_delivered: from_block,
            anchor: None,
            delivered: BTreeMap::new(),
            tail: BTreeMap::new(),
            failures: 0,
        };

        info!(
            "Watching chain {} for {:?} from block {}",
            cursor.chain_id, self.config.event_signature, from_block
        );

        futures::stream::unfold(cursor, |mut cursor| async move {
            let event = cursor.next_event().await?;
            Some((event, cursor))
        })
    }
}

/// Mutable state of one `watch` stream
struct WatchCursor {
    chain_id: u64,
    chain: Arc<dyn SourceChain>,
    config: WatcherConfig,
    shutdown: Shutdown,
    /// Highest block whose logs were delivered
    last_delivered: u64,
    /// Hash of `last_delivered`, fetched lazily
    anchor: Option<H256>,
    /// Recently delivered block hashes, used to find a common ancestor
    delivered: BTreeMap<u64, H256>,
    /// Observed but unconfirmed blocks
    tail: BTreeMap<u64, BlockRef>,
    failures: u32,
}

impl WatchCursor {
    async fn next_event(&mut self) -> Option<WatchEvent> {
        loop {
            if self.shutdown.is_triggered() {
                return None;
            }

            match self.poll_once().await {
                Ok(Some(event)) => {
                    self.failures = 0;
                    return Some(event);
                }
                Ok(None) => {
                    self.failures = 0;
                    if !self.shutdown.sleep(self.config.poll_interval).await {
                        return None;
                    }
                }
                Err(RelayerError::Cancelled) => return None,
                Err(e) => {
                    self.failures += 1;
                    crate::metrics::record_rpc_failure(self.chain_id);
                    if self.failures >= self.config.warn_after_failures {
                        warn!(
                            "Chain {}: {} consecutive poll failures, blocks after {} still pending: {}",
                            self.chain_id, self.failures, self.last_delivered, e
                        );
                    } else {
                        debug!("Chain {}: poll failed, will retry: {}", self.chain_id, e);
                    }
                    if !self
                        .config
                        .backoff
                        .wait(self.failures - 1, &self.shutdown)
                        .await
                    {
                        return None;
                    }
                }
            }
        }
    }

    /// One poll cycle. `Ok(None)` means nothing new is confirmed yet.
    async fn poll_once(&mut self) -> RelayerResult<Option<WatchEvent>> {
        let head = self.rpc("get head", self.chain.get_head()).await?;
        crate::metrics::record_source_head(self.chain_id, head);

        self.observe_tail(head).await?;

        if let Some(event) = self.check_anchor().await? {
            return Ok(Some(event));
        }

        let safe = head.saturating_sub(self.config.confirmation_depth);
        if safe <= self.last_delivered {
            return Ok(None);
        }

        let from = self.last_delivered + 1;
        let to = std::cmp::min(safe, self.last_delivered + self.config.max_block_range);

        let headers = self.fetch_linked_headers(from, to).await?;
        self.cancelled()?;

        let mut logs = self
            .rpc(
                "get logs",
                self.chain
                    .get_logs(self.config.contract, self.config.event_signature, from, to),
            )
            .await?;

        for log in &logs {
            let expected = log
                .block_number
                .checked_sub(from)
                .and_then(|offset| headers.get(offset as usize));
            match expected {
                Some(header) if header.hash == log.block_hash => {}
                _ => {
                    // The range moved between the header and log queries
                    return Err(RelayerError::ChainReorg {
                        chain_id: self.chain_id,
                        block_number: log.block_number,
                    });
                }
            }
        }
        logs.sort_by_key(|log| (log.block_number, log.log_index));

        for header in &headers {
            self.delivered.insert(header.number, header.hash);
        }
        self.prune_history();
        self.tail = self.tail.split_off(&(to + 1));
        self.last_delivered = to;
        self.anchor = headers.last().map(|h| h.hash);

        debug!(
            "Chain {}: delivering {} logs for blocks {}..={}",
            self.chain_id,
            logs.len(),
            from,
            to
        );

        Ok(Some(WatchEvent::Logs(LogBatch {
            from_block: from,
            to_block: to,
            logs,
        })))
    }

    /// Headers of `from..=to`, checked to form an unbroken chain from the anchor
    async fn fetch_linked_headers(&self, from: u64, to: u64) -> RelayerResult<Vec<BlockRef>> {
        let timeout = self.config.rpc_timeout;
        let chain_id = self.chain_id;
        let headers: Vec<BlockRef> = futures::stream::iter(from..=to)
            .map(|height| {
                let chain = self.chain.clone();
                async move {
                    let block =
                        with_timeout(timeout, chain_id, "get block", chain.get_block(height))
                            .await?;
                    block.ok_or(RelayerError::TransientNetwork {
                        chain_id,
                        message: format!("block {} not available", height),
                    })
                }
            })
            .buffered(HEADER_FETCH_CONCURRENCY)
            .try_collect()
            .await?;

        let mut parent = self.anchor;
        for header in &headers {
            if let Some(expected) = parent {
                if header.parent_hash != expected {
                    return Err(RelayerError::ChainReorg {
                        chain_id,
                        block_number: header.number,
                    });
                }
            }
            parent = Some(header.hash);
        }

        Ok(headers)
    }

    /// Confirm the last delivered block is still canonical.
    ///
    /// Returns a `Reorg` event when it is not, after rewinding to the highest
    /// delivered block that still matches.
    async fn check_anchor(&mut self) -> RelayerResult<Option<WatchEvent>> {
        let current = self
            .rpc("get block hash", self.chain.get_block_hash(self.last_delivered))
            .await?
            .ok_or(RelayerError::TransientNetwork {
                chain_id: self.chain_id,
                message: format!("block {} not available", self.last_delivered),
            })?;

        let anchor = match self.anchor {
            Some(anchor) => anchor,
            None => {
                self.anchor = Some(current);
                self.delivered.insert(self.last_delivered, current);
                return Ok(None);
            }
        };

        if anchor == current {
            return Ok(None);
        }

        let replaced = self.last_delivered;
        let mut ancestor = None;
        let history: Vec<(u64, H256)> = self
            .delivered
            .range(..replaced)
            .rev()
            .map(|(h, hash)| (*h, *hash))
            .collect();
        for (height, hash) in history {
            self.cancelled()?;
            let canonical = self
                .rpc("get block hash", self.chain.get_block_hash(height))
                .await?;
            if canonical == Some(hash) {
                ancestor = Some((height, hash));
                break;
            }
        }

        let (height, hash) = match ancestor {
            Some(found) => found,
            None => {
                // Deeper than our history; restart from just below it and re-anchor
                let oldest = self.delivered.keys().next().copied().unwrap_or(replaced);
                let height = oldest.saturating_sub(1);
                let hash = self
                    .rpc("get block hash", self.chain.get_block_hash(height))
                    .await?
                    .ok_or(RelayerError::TransientNetwork {
                        chain_id: self.chain_id,
                        message: format!("ancestor block {} not available", height),
                    })?;
                (height, hash)
            }
        };

        error!(
            "Chain {}: confirmed block {} was replaced (reorg deeper than {} blocks); resuming from common ancestor {}",
            self.chain_id, replaced, self.config.confirmation_depth, height
        );
        crate::metrics::record_reorg(self.chain_id);

        self.delivered.retain(|h, _| *h <= height);
        self.delivered.insert(height, hash);
        self.tail.clear();
        self.last_delivered = height;
        self.anchor = Some(hash);

        Ok(Some(WatchEvent::Reorg {
            common_ancestor: height,
        }))
    }

    /// Record unconfirmed blocks and detect reorgs among them
    async fn observe_tail(&mut self, head: u64) -> RelayerResult<()> {
        let safe = head.saturating_sub(self.config.confirmation_depth);

        // The newest recorded block vouches for everything below it
        let top = self.tail.values().next_back().copied();
        if let Some(recorded) = top {
            let current = self.rpc("get block", self.chain.get_block(recorded.number)).await?;
            if current.map(|b| b.hash) != Some(recorded.hash) {
                self.rewind_tail().await?;
            }
        }
        self.tail = self.tail.split_off(&(safe + 1));

        let start = self
            .tail
            .keys()
            .next_back()
            .map(|h| h + 1)
            .unwrap_or(safe + 1)
            .max(self.last_delivered + 1);
        for height in start..=head {
            self.cancelled()?;
            let block = match self.rpc("get block", self.chain.get_block(height)).await? {
                Some(block) => block,
                None => break,
            };
            let linked = height
                .checked_sub(1)
                .and_then(|p| self.tail.get(&p))
                .map(|parent| parent.hash == block.parent_hash)
                .unwrap_or(true);
            if !linked {
                // Head moved while we were reading; pick it up next poll
                self.rewind_tail().await?;
                break;
            }
            self.tail.insert(height, block);
        }

        Ok(())
    }

    /// Drop tail entries from the first height whose hash changed
    async fn rewind_tail(&mut self) -> RelayerResult<()> {
        let recorded: Vec<BlockRef> = self.tail.values().copied().collect();
        let mut divergence = recorded.first().map(|b| b.number).unwrap_or(0);
        for block in recorded.iter().rev() {
            let current = self.rpc("get block", self.chain.get_block(block.number)).await?;
            if current.map(|b| b.hash) == Some(block.hash) {
                divergence = block.number + 1;
                break;
            }
        }

        let discarded = self.tail.split_off(&divergence);
        if !discarded.is_empty() {
            warn!(
                "Chain {}: reorg in unconfirmed tail, discarded {} blocks from {}",
                self.chain_id,
                discarded.len(),
                divergence
            );
            crate::metrics::record_reorg(self.chain_id);
        }
        Ok(())
    }

    fn prune_history(&mut self) {
        let keep = (self.config.confirmation_depth * 4).max(256);
        let floor = self.last_delivered.saturating_sub(keep);
        self.delivered = self.delivered.split_off(&floor);
    }

    fn cancelled(&self) -> RelayerResult<()> {
        if self.shutdown.is_triggered() {
            Err(RelayerError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn rpc<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = RelayerResult<T>>,
    ) -> RelayerResult<T> {
        with_timeout(self.config.rpc_timeout, self.chain_id, operation, fut).await
    }
}
