//! Fluent builder API and the top-level runner.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use arkiver_core::config::ArkiveConfig;
//! use arkiver_evm::ArkiveBuilder;
//!
//! # async fn example(
//! #     config: ArkiveConfig,
//! #     client: Arc<dyn arkiver_evm::EvmRpcClient>,
//! #     store: Arc<dyn arkiver_core::store::EntityStore>,
//! #     transfer: Arc<dyn arkiver_core::dispatch::Transformer>,
//! # ) -> Result<(), arkiver_core::error::ArkiveError> {
//! let arkive = ArkiveBuilder::new(config)
//!     .client("mainnet", client)
//!     .store(store)
//!     .transformer("Usdc:Transfer", transfer)?
//!     .build()?;
//!
//! let shutdown = arkive.shutdown_handle();
//! arkive.run().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use arkiver_core::config::ArkiveConfig;
use arkiver_core::cursor::{CursorStore, MemoryCursorStore};
use arkiver_core::dispatch::{Transformer, TransformerRegistry};
use arkiver_core::error::{ArkiveError, ConfigError};
use arkiver_core::registry::{resolve, validate_keys};
use arkiver_core::store::EntityStore;
use arkiver_core::watch::WatchSpec;

use crate::retry::RetryConfig;
use crate::rpc::EvmRpcClient;
use crate::scheduler::{ChainPipeline, SchedulerConfig};

/// Fluent builder for [`Arkive`].
pub struct ArkiveBuilder {
    config: ArkiveConfig,
    clients: HashMap<String, Arc<dyn EvmRpcClient>>,
    store: Option<Arc<dyn EntityStore>>,
    cursor_store: Option<Arc<dyn CursorStore>>,
    registry: TransformerRegistry,
    chunk_size: u64,
    lookahead: usize,
    confirmation_depth: u64,
    cursor_save_interval: u64,
    max_block_retries: u32,
    retry: RetryConfig,
}

impl ArkiveBuilder {
    pub fn new(config: ArkiveConfig) -> Self {
        Self {
            config,
            clients: HashMap::new(),
            store: None,
            cursor_store: None,
            registry: TransformerRegistry::new(),
            chunk_size: 100,
            lookahead: 4,
            confirmation_depth: 0,
            cursor_save_interval: 10,
            max_block_retries: 3,
            retry: RetryConfig::default(),
        }
    }

    /// Attach the RPC client for one declared chain.
    pub fn client(mut self, chain: impl Into<String>, client: Arc<dyn EvmRpcClient>) -> Self {
        self.clients.insert(chain.into(), client);
        self
    }

    /// Set the entity store shared by all chains.
    pub fn store(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the cursor store. Defaults to an in-memory store.
    pub fn cursor_store(mut self, store: Arc<dyn CursorStore>) -> Self {
        self.cursor_store = Some(store);
        self
    }

    /// Register a transformer under a dispatch key such as
    /// `"Usdc:Transfer"` or `"Pool.swap"`.
    pub fn transformer(
        mut self,
        key: &str,
        transformer: Arc<dyn Transformer>,
    ) -> Result<Self, ConfigError> {
        self.registry.register(key, transformer)?;
        Ok(self)
    }

    /// Blocks per fetched chunk.
    pub fn chunk_size(mut self, size: u64) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Chunks prefetched ahead of processing during backfill.
    pub fn lookahead(mut self, chunks: usize) -> Self {
        self.lookahead = chunks.max(1);
        self
    }

    /// Blocks withheld from the tip before processing.
    pub fn confirmation_depth(mut self, depth: u64) -> Self {
        self.confirmation_depth = depth;
        self
    }

    /// Save the cursor every N dispatched blocks.
    pub fn cursor_save_interval(mut self, n: u64) -> Self {
        self.cursor_save_interval = n;
        self
    }

    /// Whole-block dispatch retries before the chain fails.
    pub fn max_block_retries(mut self, n: u32) -> Self {
        self.max_block_retries = n;
        self
    }

    /// Backoff applied to transient RPC failures.
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    /// Resolve and validate the configuration.
    pub fn build(self) -> Result<Arkive, ArkiveError> {
        let specs = resolve(&self.config)?;
        validate_keys(&self.config, self.registry.keys())?;

        let store = self.store.ok_or_else(|| ConfigError::Missing {
            what: "entity store".to_string(),
        })?;
        let cursor_store = self
            .cursor_store
            .unwrap_or_else(|| Arc::new(MemoryCursorStore::new()));

        let mut chains = Vec::new();
        for (name, chain) in &self.config.chains {
            let client = self
                .clients
                .get(name)
                .cloned()
                .ok_or_else(|| ConfigError::Missing {
                    what: format!("rpc client for chain '{name}'"),
                })?;
            let mut scheduler = SchedulerConfig::new(name, chain.id);
            scheduler.chunk_size = self.chunk_size;
            scheduler.lookahead = self.lookahead;
            scheduler.confirmation_depth = self.confirmation_depth;
            scheduler.cursor_save_interval = self.cursor_save_interval;
            scheduler.max_block_retries = self.max_block_retries;
            scheduler.retry = self.retry.clone();
            if let Some(ms) = chain.polling_interval_ms {
                scheduler.poll_interval_ms = ms;
            }
            chains.push((scheduler, client));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        Ok(Arkive {
            chains,
            specs,
            registry: Arc::new(self.registry),
            store,
            cursor_store,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
        })
    }
}

/// Requests cooperative shutdown of every chain pipeline.
#[derive(Clone)]
pub struct ShutdownHandle {
    stop_tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Signal all pipelines to stop after their current block.
    pub fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
    }
}

/// A fully validated engine, one pipeline per declared chain.
pub struct Arkive {
    chains: Vec<(SchedulerConfig, Arc<dyn EvmRpcClient>)>,
    specs: BTreeMap<String, Vec<WatchSpec>>,
    registry: Arc<TransformerRegistry>,
    store: Arc<dyn EntityStore>,
    cursor_store: Arc<dyn CursorStore>,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl std::fmt::Debug for Arkive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arkive")
            .field("specs", &self.specs)
            .finish_non_exhaustive()
    }
}

impl Arkive {
    /// Handle for requesting shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop_tx: Arc::clone(&self.stop_tx),
        }
    }

    /// Resolved watch specs per chain.
    pub fn specs(&self) -> &BTreeMap<String, Vec<WatchSpec>> {
        &self.specs
    }

    /// Run every chain pipeline to completion.
    ///
    /// Chains run independently; one chain's fatal error does not abort
    /// the others, but is reported after all pipelines have finished.
    /// Returns the first error encountered, if any.
    pub async fn run(mut self) -> Result<(), ArkiveError> {
        let mut set: JoinSet<(String, Result<(), ArkiveError>)> = JoinSet::new();

        for (scheduler, client) in self.chains.drain(..) {
            let chain = scheduler.chain.clone();
            let specs = self.specs.get(&chain).cloned().unwrap_or_default();
            let pipeline = ChainPipeline::new(
                scheduler,
                client,
                specs,
                Arc::clone(&self.registry),
                Arc::clone(&self.store),
                Arc::clone(&self.cursor_store),
            );
            let stop = self.stop_rx.clone();
            set.spawn(async move {
                let result = pipeline.run(stop).await;
                (chain, result)
            });
        }

        let mut first_error = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((chain, Ok(()))) => info!(chain = %chain, "chain pipeline finished"),
                Ok((chain, Err(err))) => {
                    error!(chain = %chain, error = %err, "chain pipeline failed");
                    first_error.get_or_insert(err);
                }
                Err(join_err) => {
                    error!(error = %join_err, "chain pipeline panicked");
                    first_error.get_or_insert(ArkiveError::Aborted {
                        chain: "unknown".to_string(),
                        reason: join_err.to_string(),
                    });
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
