//! Chunk fetching over an EVM JSON-RPC provider.
//!
//! The [`EvmRpcClient`] trait is the only boundary to the outside world;
//! everything above it works on decoded [`ChunkData`]. Scenario tests
//! implement the trait with scripted fixtures.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use arkiver_core::error::ArkiveError;
use arkiver_core::items::{BlockItem, ChunkData};
use arkiver_core::watch::{AddressArena, WatchKind, WatchSpec};

use crate::retry::RetryPolicy;

/// What a chunk fetch should retrieve.
#[derive(Debug, Clone, Default)]
pub struct ChunkFilter {
    /// Contract addresses to fetch logs for. `None` means an open log
    /// filter — required when any watch matches all addresses or carries a
    /// factory, since prefetched chunks must not miss child logs that will
    /// only be discovered while earlier chunks are processed.
    pub addresses: Option<Vec<String>>,
    /// Addresses whose transactions and native transfers are wanted.
    pub account_addresses: Vec<String>,
    pub include_call_traces: bool,
    pub include_transaction_receipts: bool,
}

impl ChunkFilter {
    /// Build the filter for the current watch specs and discovered
    /// addresses.
    pub fn from_specs(specs: &[WatchSpec], arena: &AddressArena) -> Self {
        let mut filter = Self::default();
        let mut addresses = Vec::new();
        let mut open = false;

        for spec in specs {
            match &spec.kind {
                WatchKind::Contract(c) => {
                    if c.static_addresses.is_empty() && c.factory.is_none() {
                        open = true;
                    }
                    if c.factory.is_some() {
                        // Parent logs (creation events) and future child
                        // logs both have to come through.
                        open = true;
                    }
                    addresses.extend(c.static_addresses.iter().cloned());
                    addresses.extend(
                        arena
                            .addresses_at(&spec.name, u64::MAX)
                            .into_iter()
                            .map(String::from),
                    );
                    filter.include_call_traces |= c.include_call_traces;
                    filter.include_transaction_receipts |= c.include_transaction_receipts;
                }
                WatchKind::Account(a) => {
                    filter.account_addresses.extend(a.addresses.iter().cloned());
                    filter.include_transaction_receipts |= a.include_transaction_receipts;
                }
                WatchKind::Block(_) => {}
            }
        }

        filter.addresses = if open {
            None
        } else {
            addresses.sort();
            addresses.dedup();
            Some(addresses)
        };
        filter
    }
}

/// Trait for fetching decoded EVM data from a JSON-RPC provider.
#[async_trait]
pub trait EvmRpcClient: Send + Sync {
    /// Current chain head block number.
    async fn head_block_number(&self) -> Result<u64, ArkiveError>;

    /// Fetch one block header, or `None` if the node does not have it.
    async fn block(&self, number: u64) -> Result<Option<BlockItem>, ArkiveError>;

    /// Fetch everything the filter asks for in `[from, to]`, decoded.
    async fn fetch(
        &self,
        from: u64,
        to: u64,
        filter: &ChunkFilter,
    ) -> Result<ChunkData, ArkiveError>;
}

/// Wraps an [`EvmRpcClient`] with retries and a per-request timeout.
#[derive(Clone)]
pub struct ChunkFetcher {
    client: Arc<dyn EvmRpcClient>,
    chain: String,
    policy: RetryPolicy,
    request_timeout: Duration,
}

impl ChunkFetcher {
    pub fn new(client: Arc<dyn EvmRpcClient>, chain: impl Into<String>) -> Self {
        Self {
            client,
            chain: chain.into(),
            policy: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub async fn head(&self) -> Result<u64, ArkiveError> {
        self.call("head", || self.client.head_block_number()).await
    }

    pub async fn block(&self, number: u64) -> Result<Option<BlockItem>, ArkiveError> {
        self.call("block", || self.client.block(number)).await
    }

    pub async fn fetch(
        &self,
        from: u64,
        to: u64,
        filter: &ChunkFilter,
    ) -> Result<ChunkData, ArkiveError> {
        self.call("fetch", || self.client.fetch(from, to, filter))
            .await
    }

    /// One RPC call with timeout + bounded exponential backoff. Retries
    /// only errors flagged retryable.
    async fn call<T, F, Fut>(&self, op: &str, mut request: F) -> Result<T, ArkiveError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ArkiveError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let result = match tokio::time::timeout(self.request_timeout, request()).await {
                Ok(result) => result,
                Err(_) => Err(ArkiveError::Rpc {
                    chain: self.chain.clone(),
                    reason: format!("{op} timed out after {:?}", self.request_timeout),
                }),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    attempt += 1;
                    match self.policy.next_delay(attempt) {
                        Some(delay) => {
                            warn!(
                                chain = %self.chain,
                                op,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "rpc call failed, retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}
