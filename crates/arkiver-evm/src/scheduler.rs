//! Chain pipeline — orchestrates backfill and live phases for one chain.
//!
//! # Phase 1: BACKFILL
//! Fetch chunks from the resume point to `head - confirmation_depth`,
//! prefetching up to `lookahead` chunks concurrently. Chunks are always
//! processed in order; prefetch only overlaps network I/O.
//!
//! # Phase 2: LIVE
//! Poll for new confirmed blocks every `poll_interval_ms`. Each new block
//! is verified against the parent-hash chain; a mismatch triggers reorg
//! recovery: locate the common ancestor, revert the entity store, arena,
//! tracker, and cursor, then resume from the ancestor.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use arkiver_core::cursor::{CursorManager, CursorStore};
use arkiver_core::dispatch::{Dispatcher, TransformerRegistry};
use arkiver_core::error::ArkiveError;
use arkiver_core::factory::FactoryResolver;
use arkiver_core::items::ChunkData;
use arkiver_core::router::EventRouter;
use arkiver_core::store::EntityStore;
use arkiver_core::tracker::{BlockTracker, ReorgEvent};
use arkiver_core::watch::{AddressArena, WatchSpec};

use crate::retry::{RetryConfig, RetryPolicy};
use crate::rpc::{ChunkFetcher, ChunkFilter, EvmRpcClient};

/// Pipeline lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Backfilling,
    Live,
    Reorging,
    Stopped,
}

/// Per-chain scheduling knobs.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub chain: String,
    pub chain_id: u64,
    /// Blocks per fetched chunk.
    pub chunk_size: u64,
    /// Chunks prefetched ahead of processing during backfill.
    pub lookahead: usize,
    pub poll_interval_ms: u64,
    /// Blocks withheld from the tip before processing.
    pub confirmation_depth: u64,
    /// Save the cursor every N dispatched blocks.
    pub cursor_save_interval: u64,
    /// Whole-block dispatch retries before the chain fails.
    pub max_block_retries: u32,
    /// Parent-hash window size; reorgs deeper than this are fatal.
    pub tracker_window: usize,
    /// Backoff applied to transient RPC failures.
    pub retry: RetryConfig,
}

impl SchedulerConfig {
    pub fn new(chain: impl Into<String>, chain_id: u64) -> Self {
        Self {
            chain: chain.into(),
            chain_id,
            chunk_size: 100,
            lookahead: 4,
            poll_interval_ms: 1_000,
            confirmation_depth: 0,
            cursor_save_interval: 10,
            max_block_retries: 3,
            tracker_window: 128,
            retry: RetryConfig::default(),
        }
    }
}

type FetchHandle = JoinHandle<Result<ChunkData, ArkiveError>>;

/// One chain's end-to-end pipeline.
pub struct ChainPipeline {
    config: SchedulerConfig,
    fetcher: ChunkFetcher,
    specs: Vec<WatchSpec>,
    arena: AddressArena,
    factory: FactoryResolver,
    router: EventRouter,
    dispatcher: Dispatcher,
    cursor: CursorManager,
    tracker: BlockTracker,
    store: Arc<dyn EntityStore>,
    state: ChainState,
    /// Last fully dispatched block.
    processed: u64,
}

impl ChainPipeline {
    pub fn new(
        config: SchedulerConfig,
        client: Arc<dyn EvmRpcClient>,
        specs: Vec<WatchSpec>,
        registry: Arc<TransformerRegistry>,
        store: Arc<dyn EntityStore>,
        cursor_store: Arc<dyn CursorStore>,
    ) -> Self {
        let factory = FactoryResolver::new(&specs);
        let dispatcher = Dispatcher::new(
            registry,
            Arc::clone(&store),
            &config.chain,
            config.chain_id,
            config.max_block_retries,
        );
        Self {
            fetcher: ChunkFetcher::new(client, &config.chain)
                .with_policy(RetryPolicy::new(config.retry.clone())),
            router: EventRouter::new(&config.chain, config.chain_id),
            cursor: CursorManager::new(cursor_store, &config.chain, config.cursor_save_interval),
            tracker: BlockTracker::new(config.tracker_window),
            arena: AddressArena::new(),
            factory,
            dispatcher,
            specs,
            store,
            state: ChainState::Backfilling,
            processed: 0,
            config,
        }
    }

    pub fn state(&self) -> ChainState {
        self.state
    }

    /// Block after which every watch on this chain is closed, or `None`
    /// while any watch is open-ended.
    fn closed_end(&self) -> Option<u64> {
        self.specs
            .iter()
            .map(WatchSpec::end_number)
            .collect::<Option<Vec<_>>>()
            .map(|ends| ends.into_iter().max().unwrap_or(0))
    }

    /// Run until every watch is exhausted, a fatal error occurs, or the
    /// stop signal fires.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> Result<(), ArkiveError> {
        if self.specs.is_empty() {
            info!(chain = %self.config.chain, "no watches configured, nothing to do");
            return Ok(());
        }

        let head = self.fetcher.head().await?;
        for spec in &mut self.specs {
            spec.pin_start(head);
        }

        let mut next = match self.cursor.load().await? {
            Some(cursor) => {
                info!(
                    chain = %self.config.chain,
                    block = cursor.block_number,
                    hash = %cursor.block_hash,
                    "resuming from cursor"
                );
                // Seed the tracker so the first live block still gets a
                // parent-hash check.
                if let Some(block) = self.fetcher.block(cursor.block_number).await? {
                    if block.hash != cursor.block_hash {
                        warn!(
                            chain = %self.config.chain,
                            block = cursor.block_number,
                            "cursor block no longer canonical, resuming on the new chain"
                        );
                    }
                    self.tracker.push(block).ok();
                }
                self.processed = cursor.block_number;
                cursor.block_number + 1
            }
            None => {
                let start = self
                    .specs
                    .iter()
                    .map(WatchSpec::start_number)
                    .min()
                    .unwrap_or(0);
                self.processed = start.saturating_sub(1);
                start
            }
        };

        let stop_at = self.closed_end();
        if let Some(end) = stop_at {
            if next > end {
                info!(chain = %self.config.chain, "all watches already exhausted");
                return Ok(());
            }
        }

        // Phase 1: backfill to the confirmed head.
        let mut target = head.saturating_sub(self.config.confirmation_depth);
        if let Some(end) = stop_at {
            target = target.min(end);
        }
        if next <= target {
            info!(
                chain = %self.config.chain,
                from = next,
                target,
                "starting backfill"
            );
            next = self.backfill(next, target, &stop).await?;
        }

        if let Some(end) = stop_at {
            if next > end {
                self.finish().await?;
                return Ok(());
            }
        }
        if *stop.borrow() {
            self.finish().await?;
            return Ok(());
        }

        // Phase 2: live polling.
        self.state = ChainState::Live;
        info!(chain = %self.config.chain, from = next, "entering live phase");
        self.live_loop(stop_at, &mut stop).await?;
        self.finish().await
    }

    /// Backfill `[from, target]` with prefetch. Returns the next block to
    /// process (may be inside the range after a reorg rewound it).
    async fn backfill(
        &mut self,
        from: u64,
        target: u64,
        stop: &watch::Receiver<bool>,
    ) -> Result<u64, ArkiveError> {
        self.state = ChainState::Backfilling;
        let mut pending: VecDeque<(u64, u64, FetchHandle)> = VecDeque::new();
        let mut fetch_next = from;

        loop {
            while pending.len() < self.config.lookahead && fetch_next <= target {
                let to = (fetch_next + self.config.chunk_size - 1).min(target);
                pending.push_back((fetch_next, to, self.spawn_fetch(fetch_next, to)));
                fetch_next = to + 1;
            }
            let Some((chunk_from, chunk_to, handle)) = pending.pop_front() else {
                break;
            };
            if *stop.borrow() {
                handle.abort();
                Self::abort_pending(&mut pending);
                return Ok(self.processed + 1);
            }

            let chunk = handle.await.map_err(|e| ArkiveError::Aborted {
                chain: self.config.chain.clone(),
                reason: format!("fetch task failed: {e}"),
            })??;
            debug!(
                chain = %self.config.chain,
                from = chunk_from,
                to = chunk_to,
                "processing chunk"
            );
            match self.process_chunk(chunk).await {
                Ok(()) => {}
                Err(ArkiveError::Reorg { ancestor, .. }) => {
                    // Prefetched chunks are on the old branch.
                    Self::abort_pending(&mut pending);
                    fetch_next = ancestor + 1;
                    self.state = ChainState::Backfilling;
                }
                Err(err) => return Err(err),
            }
        }

        info!(chain = %self.config.chain, at = self.processed, "backfill complete");
        Ok(self.processed + 1)
    }

    async fn live_loop(
        &mut self,
        stop_at: Option<u64>,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<(), ArkiveError> {
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));

        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(poll) => {}
            }

            let head = self.fetcher.head().await?;
            let mut target = head.saturating_sub(self.config.confirmation_depth);
            if let Some(end) = stop_at {
                target = target.min(end);
            }

            while self.processed < target {
                let from = self.processed + 1;
                let to = (from + self.config.chunk_size - 1).min(target);
                let filter = ChunkFilter::from_specs(&self.specs, &self.arena);
                let chunk = self.fetcher.fetch(from, to, &filter).await?;
                match self.process_chunk(chunk).await {
                    Ok(()) => {}
                    Err(err) if err.is_reorg() => {
                        // Re-poll; the target may have moved with the fork.
                        self.state = ChainState::Live;
                        break;
                    }
                    Err(err) => return Err(err),
                }
                if *stop.borrow() {
                    return Ok(());
                }
            }

            if let Some(end) = stop_at {
                if self.processed >= end {
                    info!(chain = %self.config.chain, at = end, "all watches exhausted");
                    return Ok(());
                }
            }
        }
    }

    fn spawn_fetch(&self, from: u64, to: u64) -> FetchHandle {
        let fetcher = self.fetcher.clone();
        let filter = ChunkFilter::from_specs(&self.specs, &self.arena);
        tokio::spawn(async move { fetcher.fetch(from, to, &filter).await })
    }

    fn abort_pending(pending: &mut VecDeque<(u64, u64, FetchHandle)>) {
        for (_, _, handle) in pending.drain(..) {
            handle.abort();
        }
    }

    /// Verify, discover, route, and dispatch one chunk.
    ///
    /// Discovery runs over the whole chunk before any block is classified,
    /// so an address created and used within the same chunk still matches.
    /// A detected reorg is rolled back here and surfaced as
    /// [`ArkiveError::Reorg`]; the caller resumes from the ancestor.
    async fn process_chunk(&mut self, mut chunk: ChunkData) -> Result<(), ArkiveError> {
        chunk.sort();

        // Parent-hash verification. On a mismatch the tail of the chunk
        // belongs to the old branch and is dropped before dispatch.
        let mut reorg: Option<ReorgEvent> = None;
        for block in &chunk.blocks {
            if let Err(event) = self.tracker.push(block.clone()) {
                reorg = Some(event);
                break;
            }
        }
        if let Some(event) = &reorg {
            let cutoff = event.detected_at;
            chunk.blocks.retain(|b| b.number < cutoff);
            chunk.logs.retain(|l| l.block_number < cutoff);
            chunk.traces.retain(|t| t.block_number < cutoff);
            chunk.transactions.retain(|t| t.block_number < cutoff);
            chunk.transfers.retain(|t| t.block_number < cutoff);
        }

        let discovered = self.factory.apply(&chunk.logs, &mut self.arena);
        if discovered > 0 {
            debug!(
                chain = %self.config.chain,
                discovered,
                total = self.arena.len(),
                "factory addresses discovered"
            );
        }

        let routed = self.router.route(&chunk, &self.specs, &self.arena);
        for block in &chunk.blocks {
            let envelopes = routed
                .get(&block.number)
                .map(Vec::as_slice)
                .unwrap_or_default();
            self.dispatcher.dispatch_block(block.number, envelopes).await?;
            self.processed = block.number;
            // The save interval batches backfill only; a live block is
            // checkpointed as soon as it commits.
            if self.state == ChainState::Live {
                self.cursor.force_save(block.number, &block.hash).await?;
            } else {
                self.cursor.maybe_save(block.number, &block.hash).await?;
            }
        }

        match reorg {
            Some(event) => {
                let ancestor = self.recover_from_reorg(&event).await?;
                Err(ArkiveError::Reorg {
                    chain: self.config.chain.clone(),
                    detected_at: event.detected_at,
                    ancestor,
                })
            }
            None => Ok(()),
        }
    }

    /// Locate the common ancestor and roll everything back to it.
    async fn recover_from_reorg(&mut self, event: &ReorgEvent) -> Result<u64, ArkiveError> {
        self.state = ChainState::Reorging;
        warn!(
            chain = %self.config.chain,
            detected_at = event.detected_at,
            expected = %event.expected_parent,
            got = %event.got_parent,
            "reorg detected"
        );

        let mut ancestor = None;
        for tracked in self.tracker.newest_first() {
            match self.fetcher.block(tracked.number).await? {
                Some(canonical) if canonical.hash == tracked.hash => {
                    ancestor = Some(tracked.clone());
                    break;
                }
                _ => continue,
            }
        }
        let ancestor = ancestor.ok_or_else(|| ArkiveError::Aborted {
            chain: self.config.chain.clone(),
            reason: format!(
                "reorg at block {} deeper than the tracked window",
                event.detected_at
            ),
        })?;

        info!(
            chain = %self.config.chain,
            detected_at = event.detected_at,
            ancestor = ancestor.number,
            "rolling back to common ancestor"
        );
        self.store.revert(&self.config.chain, ancestor.number).await?;
        self.arena.revert_after(ancestor.number);
        self.dispatcher.revert_setup_after(ancestor.number);
        self.tracker.rewind_to(ancestor.number);
        self.processed = ancestor.number;
        self.cursor.force_save(ancestor.number, &ancestor.hash).await?;
        Ok(ancestor.number)
    }

    /// Persist the final position and mark the pipeline stopped.
    async fn finish(&mut self) -> Result<(), ArkiveError> {
        if let Some(head) = self.tracker.head() {
            let (number, hash) = (head.number, head.hash.clone());
            self.cursor.force_save(number, &hash).await?;
        }
        self.state = ChainState::Stopped;
        info!(chain = %self.config.chain, at = self.processed, "pipeline stopped");
        Ok(())
    }
}
