//! Entity store boundary.
//!
//! Transformers mutate entities only through an [`EntityTx`] scoped to one
//! block. The scheduler commits the transaction after every transformer for
//! the block has returned, so a crash mid-block loses the whole block and
//! replays it cleanly. [`EntityStore::revert`] undoes committed blocks
//! after a reorg.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ArkiveError;

/// A block-scoped entity transaction.
///
/// Writes buffer until [`commit`](EntityTx::commit); reads observe the
/// committed state plus this transaction's own buffered writes.
#[async_trait]
pub trait EntityTx: Send {
    /// Fetch one entity by id, or `None` if absent.
    async fn get(&self, entity: &str, id: &str) -> Result<Option<Value>, ArkiveError>;

    /// Insert or replace one entity.
    async fn upsert(&mut self, entity: &str, id: &str, value: Value) -> Result<(), ArkiveError>;

    /// Delete one entity. Deleting an absent entity is not an error.
    async fn delete(&mut self, entity: &str, id: &str) -> Result<(), ArkiveError>;

    /// Fetch all entities of one type whose id falls in `[from, to]`,
    /// ordered by id.
    async fn find_range(
        &self,
        entity: &str,
        from: &str,
        to: &str,
    ) -> Result<Vec<(String, Value)>, ArkiveError>;

    /// Atomically apply all buffered writes.
    async fn commit(&mut self) -> Result<(), ArkiveError>;

    /// Discard all buffered writes.
    async fn rollback(&mut self) -> Result<(), ArkiveError>;
}

/// Factory for block-scoped transactions plus reorg rollback.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Open a transaction covering `block` on `chain`.
    async fn begin(&self, chain: &str, block: u64) -> Result<Box<dyn EntityTx>, ArkiveError>;

    /// Undo every committed transaction for `chain` at blocks strictly
    /// greater than `block`, newest first.
    async fn revert(&self, chain: &str, block: u64) -> Result<(), ArkiveError>;
}
