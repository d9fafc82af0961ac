//! Cursor persistence — records the last fully dispatched block so a
//! restarted pipeline resumes instead of re-indexing from scratch.
//!
//! The cursor advances only after the block's entity transaction commits.
//! Backfill saves are batched every `save_interval` blocks, so a crash
//! mid-backfill replays at most that many blocks; live blocks are saved
//! as they commit. Transformers are idempotent per block, so replay is
//! safe.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ArkiveError;

/// The persisted position of one chain's pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Chain name this cursor belongs to.
    pub chain: String,
    /// Last fully dispatched block number.
    pub block_number: u64,
    /// Hash of that block.
    pub block_hash: String,
    /// Unix timestamp of when this cursor was saved.
    pub updated_at: i64,
}

/// Trait for storing and loading cursors.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Load the saved cursor for a chain, or `None` for a fresh start.
    async fn load(&self, chain: &str) -> Result<Option<Cursor>, ArkiveError>;

    /// Save (upsert) a cursor.
    async fn save(&self, cursor: Cursor) -> Result<(), ArkiveError>;

    /// Delete a cursor (resets the chain).
    async fn delete(&self, chain: &str) -> Result<(), ArkiveError>;
}

/// Manages cursor reads/writes for one chain, batching saves.
pub struct CursorManager {
    store: std::sync::Arc<dyn CursorStore>,
    chain: String,
    /// How often to save (every N blocks).
    save_interval: u64,
    /// Block counter since last save.
    counter: u64,
}

impl CursorManager {
    pub fn new(
        store: std::sync::Arc<dyn CursorStore>,
        chain: impl Into<String>,
        save_interval: u64,
    ) -> Self {
        Self {
            store,
            chain: chain.into(),
            save_interval: save_interval.max(1),
            counter: 0,
        }
    }

    /// Load the saved cursor (returns `None` if none exists).
    pub async fn load(&self) -> Result<Option<Cursor>, ArkiveError> {
        self.store.load(&self.chain).await
    }

    /// Conditionally save every `save_interval` blocks.
    ///
    /// Call after each block's transaction commits.
    pub async fn maybe_save(
        &mut self,
        block_number: u64,
        block_hash: &str,
    ) -> Result<(), ArkiveError> {
        self.counter += 1;
        if self.counter >= self.save_interval {
            self.force_save(block_number, block_hash).await?;
        }
        Ok(())
    }

    /// Immediately save (used on shutdown and reorg recovery).
    pub async fn force_save(
        &mut self,
        block_number: u64,
        block_hash: &str,
    ) -> Result<(), ArkiveError> {
        let cursor = Cursor {
            chain: self.chain.clone(),
            block_number,
            block_hash: block_hash.to_string(),
            updated_at: chrono::Utc::now().timestamp(),
        };
        self.store.save(cursor).await?;
        self.counter = 0;
        Ok(())
    }
}

// ─── In-memory store ──────────────────────────────────────────────────────────

use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory cursor store for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryCursorStore {
    data: Mutex<HashMap<String, Cursor>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self, chain: &str) -> Result<Option<Cursor>, ArkiveError> {
        Ok(self.data.lock().unwrap().get(chain).cloned())
    }

    async fn save(&self, cursor: Cursor) -> Result<(), ArkiveError> {
        self.data.lock().unwrap().insert(cursor.chain.clone(), cursor);
        Ok(())
    }

    async fn delete(&self, chain: &str) -> Result<(), ArkiveError> {
        self.data.lock().unwrap().remove(chain);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = Arc::new(MemoryCursorStore::new());
        let mut mgr = CursorManager::new(store, "mainnet", 10);

        assert!(mgr.load().await.unwrap().is_none());

        mgr.force_save(1000, "0xabc").await.unwrap();

        let cursor = mgr.load().await.unwrap().unwrap();
        assert_eq!(cursor.block_number, 1000);
        assert_eq!(cursor.block_hash, "0xabc");
        assert_eq!(cursor.chain, "mainnet");
    }

    #[tokio::test]
    async fn save_interval_batches_writes() {
        let store = Arc::new(MemoryCursorStore::new());
        let mut mgr = CursorManager::new(store, "mainnet", 5);

        for i in 1..=4 {
            mgr.maybe_save(i, "0xhash").await.unwrap();
        }
        assert!(mgr.load().await.unwrap().is_none());

        mgr.maybe_save(5, "0xhash5").await.unwrap();
        assert_eq!(mgr.load().await.unwrap().unwrap().block_number, 5);

        // Counter resets after a save.
        mgr.maybe_save(6, "0xhash6").await.unwrap();
        assert_eq!(mgr.load().await.unwrap().unwrap().block_number, 5);
    }

    #[tokio::test]
    async fn force_save_resets_counter() {
        let store = Arc::new(MemoryCursorStore::new());
        let mut mgr = CursorManager::new(store, "mainnet", 3);

        mgr.maybe_save(1, "0x1").await.unwrap();
        mgr.maybe_save(2, "0x2").await.unwrap();
        mgr.force_save(2, "0x2").await.unwrap();

        // The forced save restarted the interval.
        mgr.maybe_save(3, "0x3").await.unwrap();
        assert_eq!(mgr.load().await.unwrap().unwrap().block_number, 2);
    }
}
