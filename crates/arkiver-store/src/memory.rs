//! In-memory entity store with a per-block undo journal.
//!
//! Entities live in `entity → id → value` tables. Every committed block
//! appends a journal entry holding the inverse of its writes, so
//! [`EntityStore::revert`] can unwind committed blocks newest-first after
//! a reorg. Intended for tests and ephemeral runs; nothing persists.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::debug;

use arkiver_core::error::ArkiveError;
use arkiver_core::store::{EntityStore, EntityTx};

/// Inverse of one committed write.
#[derive(Debug, Clone)]
enum UndoOp {
    /// Put the previous value back.
    Restore {
        entity: String,
        id: String,
        value: Value,
    },
    /// The write created the entity; undo removes it.
    Remove { entity: String, id: String },
}

/// Undo log for one committed block.
#[derive(Debug, Clone)]
struct JournalEntry {
    chain: String,
    block: u64,
    undo: Vec<UndoOp>,
}

#[derive(Debug, Default)]
struct StoreInner {
    tables: HashMap<String, BTreeMap<String, Value>>,
    /// Committed blocks in commit order (oldest first).
    journal: Vec<JournalEntry>,
}

/// In-memory [`EntityStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed value of one entity (test helper).
    pub fn get_committed(&self, entity: &str, id: &str) -> Option<Value> {
        self.inner
            .lock()
            .unwrap()
            .tables
            .get(entity)
            .and_then(|t| t.get(id))
            .cloned()
    }

    /// Number of committed entities of one type (test helper).
    pub fn entity_count(&self, entity: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .tables
            .get(entity)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl EntityStore for InMemoryStore {
    async fn begin(&self, chain: &str, block: u64) -> Result<Box<dyn EntityTx>, ArkiveError> {
        Ok(Box::new(MemoryTx {
            inner: Arc::clone(&self.inner),
            chain: chain.to_string(),
            block,
            writes: Vec::new(),
        }))
    }

    async fn revert(&self, chain: &str, block: u64) -> Result<(), ArkiveError> {
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        let mut reverted = 0u64;
        // Unwind newest-first so overlapping writes restore correctly.
        // Entries from other chains may interleave; only this chain's
        // entries past `block` are removed.
        let mut i = inner.journal.len();
        while i > 0 {
            i -= 1;
            if inner.journal[i].chain == chain && inner.journal[i].block > block {
                let entry = inner.journal.remove(i);
                apply_undo(&mut inner.tables, entry.undo);
                reverted += 1;
            }
        }
        debug!(chain, block, reverted, "entity store reverted");
        Ok(())
    }
}

fn apply_undo(tables: &mut HashMap<String, BTreeMap<String, Value>>, undo: Vec<UndoOp>) {
    for op in undo.into_iter().rev() {
        match op {
            UndoOp::Restore { entity, id, value } => {
                tables.entry(entity).or_default().insert(id, value);
            }
            UndoOp::Remove { entity, id } => {
                if let Some(table) = tables.get_mut(&entity) {
                    table.remove(&id);
                }
            }
        }
    }
}

/// Buffered write, applied on commit.
#[derive(Debug, Clone)]
enum PendingWrite {
    Upsert { entity: String, id: String, value: Value },
    Delete { entity: String, id: String },
}

struct MemoryTx {
    inner: Arc<Mutex<StoreInner>>,
    chain: String,
    block: u64,
    writes: Vec<PendingWrite>,
}

impl MemoryTx {
    /// Latest buffered write for one entity id, if any.
    fn buffered(&self, entity: &str, id: &str) -> Option<Option<Value>> {
        self.writes.iter().rev().find_map(|w| match w {
            PendingWrite::Upsert {
                entity: e,
                id: i,
                value,
            } if e == entity && i == id => Some(Some(value.clone())),
            PendingWrite::Delete { entity: e, id: i } if e == entity && i == id => Some(None),
            _ => None,
        })
    }
}

#[async_trait]
impl EntityTx for MemoryTx {
    async fn get(&self, entity: &str, id: &str) -> Result<Option<Value>, ArkiveError> {
        if let Some(buffered) = self.buffered(entity, id) {
            return Ok(buffered);
        }
        Ok(self
            .inner
            .lock()
            .unwrap()
            .tables
            .get(entity)
            .and_then(|t| t.get(id))
            .cloned())
    }

    async fn upsert(&mut self, entity: &str, id: &str, value: Value) -> Result<(), ArkiveError> {
        self.writes.push(PendingWrite::Upsert {
            entity: entity.to_string(),
            id: id.to_string(),
            value,
        });
        Ok(())
    }

    async fn delete(&mut self, entity: &str, id: &str) -> Result<(), ArkiveError> {
        self.writes.push(PendingWrite::Delete {
            entity: entity.to_string(),
            id: id.to_string(),
        });
        Ok(())
    }

    async fn find_range(
        &self,
        entity: &str,
        from: &str,
        to: &str,
    ) -> Result<Vec<(String, Value)>, ArkiveError> {
        let mut merged: BTreeMap<String, Option<Value>> = {
            let inner = self.inner.lock().unwrap();
            inner
                .tables
                .get(entity)
                .map(|t| {
                    t.range(from.to_string()..=to.to_string())
                        .map(|(k, v)| (k.clone(), Some(v.clone())))
                        .collect()
                })
                .unwrap_or_default()
        };
        for w in &self.writes {
            match w {
                PendingWrite::Upsert {
                    entity: e,
                    id,
                    value,
                } if e == entity && id.as_str() >= from && id.as_str() <= to => {
                    merged.insert(id.clone(), Some(value.clone()));
                }
                PendingWrite::Delete { entity: e, id } if e == entity => {
                    merged.insert(id.clone(), None);
                }
                _ => {}
            }
        }
        Ok(merged
            .into_iter()
            .filter_map(|(id, v)| v.map(|v| (id, v)))
            .collect())
    }

    async fn commit(&mut self) -> Result<(), ArkiveError> {
        let mut inner = self.inner.lock().unwrap();
        let mut undo = Vec::with_capacity(self.writes.len());
        for write in self.writes.drain(..) {
            match write {
                PendingWrite::Upsert { entity, id, value } => {
                    let table = inner.tables.entry(entity.clone()).or_default();
                    match table.insert(id.clone(), value) {
                        Some(prev) => undo.push(UndoOp::Restore {
                            entity,
                            id,
                            value: prev,
                        }),
                        None => undo.push(UndoOp::Remove { entity, id }),
                    }
                }
                PendingWrite::Delete { entity, id } => {
                    if let Some(prev) = inner
                        .tables
                        .get_mut(&entity)
                        .and_then(|t| t.remove(&id))
                    {
                        undo.push(UndoOp::Restore {
                            entity,
                            id,
                            value: prev,
                        });
                    }
                }
            }
        }
        inner.journal.push(JournalEntry {
            chain: self.chain.clone(),
            block: self.block,
            undo,
        });
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), ArkiveError> {
        self.writes.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn commit_makes_writes_visible() {
        let store = InMemoryStore::new();
        let mut tx = store.begin("mainnet", 10).await.unwrap();
        tx.upsert("Account", "0x1", json!({"balance": "100"}))
            .await
            .unwrap();

        // Uncommitted writes are visible inside the transaction only.
        assert!(tx.get("Account", "0x1").await.unwrap().is_some());
        assert!(store.get_committed("Account", "0x1").is_none());

        tx.commit().await.unwrap();
        assert_eq!(
            store.get_committed("Account", "0x1").unwrap()["balance"],
            "100"
        );
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let store = InMemoryStore::new();
        let mut tx = store.begin("mainnet", 10).await.unwrap();
        tx.upsert("Account", "0x1", json!({})).await.unwrap();
        tx.rollback().await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.entity_count("Account"), 0);
    }

    #[tokio::test]
    async fn revert_unwinds_committed_blocks() {
        let store = InMemoryStore::new();

        let mut tx = store.begin("mainnet", 10).await.unwrap();
        tx.upsert("Account", "0x1", json!({"balance": "100"}))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin("mainnet", 11).await.unwrap();
        tx.upsert("Account", "0x1", json!({"balance": "150"}))
            .await
            .unwrap();
        tx.upsert("Account", "0x2", json!({"balance": "7"}))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        store.revert("mainnet", 10).await.unwrap();

        // Block 11's writes are undone; block 10's survive.
        assert_eq!(
            store.get_committed("Account", "0x1").unwrap()["balance"],
            "100"
        );
        assert!(store.get_committed("Account", "0x2").is_none());
    }

    #[tokio::test]
    async fn revert_is_chain_scoped() {
        let store = InMemoryStore::new();

        let mut tx = store.begin("mainnet", 11).await.unwrap();
        tx.upsert("Account", "eth", json!(1)).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin("polygon", 11).await.unwrap();
        tx.upsert("Account", "pol", json!(1)).await.unwrap();
        tx.commit().await.unwrap();

        store.revert("mainnet", 10).await.unwrap();

        assert!(store.get_committed("Account", "eth").is_none());
        assert!(store.get_committed("Account", "pol").is_some());
    }

    #[tokio::test]
    async fn revert_restores_deleted_entities() {
        let store = InMemoryStore::new();

        let mut tx = store.begin("mainnet", 10).await.unwrap();
        tx.upsert("Account", "0x1", json!({"balance": "100"}))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin("mainnet", 11).await.unwrap();
        tx.delete("Account", "0x1").await.unwrap();
        tx.commit().await.unwrap();
        assert!(store.get_committed("Account", "0x1").is_none());

        store.revert("mainnet", 10).await.unwrap();
        assert_eq!(
            store.get_committed("Account", "0x1").unwrap()["balance"],
            "100"
        );
    }

    #[tokio::test]
    async fn find_range_merges_buffered_writes() {
        let store = InMemoryStore::new();

        let mut tx = store.begin("mainnet", 10).await.unwrap();
        tx.upsert("Pair", "a", json!(1)).await.unwrap();
        tx.upsert("Pair", "c", json!(3)).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin("mainnet", 11).await.unwrap();
        tx.upsert("Pair", "b", json!(2)).await.unwrap();
        tx.delete("Pair", "c").await.unwrap();

        let rows = tx.find_range("Pair", "a", "z").await.unwrap();
        let ids: Vec<&str> = rows.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
