//! SQLite entity and cursor store.
//!
//! Persists entities, the per-block undo journal, and cursors to a single
//! SQLite file. Uses `sqlx` with WAL mode for concurrent read performance.
//!
//! # Usage
//! ```rust,no_run
//! use arkiver_store::sqlite::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStore::open("./arkive.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use arkiver_core::cursor::{Cursor, CursorStore};
use arkiver_core::error::ArkiveError;
use arkiver_core::store::{EntityStore, EntityTx};

fn store_err(e: impl ToString) -> ArkiveError {
    ArkiveError::Store(e.to_string())
}

/// SQLite-backed [`EntityStore`] and [`CursorStore`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./arkive.db"`) or a full
    /// SQLite URL (`"sqlite:./arkive.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, ArkiveError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(store_err)?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// All data is lost when the pool is dropped. Ideal for tests.
    pub async fn in_memory() -> Result<Self, ArkiveError> {
        let pool = SqlitePool::connect("sqlite::memory:")
            .await
            .map_err(store_err)?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), ArkiveError> {
        // WAL mode — better concurrent read throughput
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(store_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS entities (
                entity TEXT NOT NULL,
                id     TEXT NOT NULL,
                value  TEXT NOT NULL,
                PRIMARY KEY (entity, id)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        // Undo journal: one row per committed write, `prev` NULL when the
        // write created the entity.
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS journal (
                seq    INTEGER PRIMARY KEY AUTOINCREMENT,
                chain  TEXT    NOT NULL,
                block  INTEGER NOT NULL,
                entity TEXT    NOT NULL,
                id     TEXT    NOT NULL,
                prev   TEXT
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_journal_chain_block ON journal (chain, block);",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cursors (
                chain        TEXT PRIMARY KEY,
                block_number INTEGER NOT NULL,
                block_hash   TEXT    NOT NULL,
                updated_at   INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    /// Discard journal rows for blocks at or below `block` (they can no
    /// longer be reverted once the block is final).
    pub async fn prune_journal(&self, chain: &str, block: u64) -> Result<(), ArkiveError> {
        sqlx::query("DELETE FROM journal WHERE chain = ? AND block <= ?")
            .bind(chain)
            .bind(block as i64)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

// ─── EntityStore impl ─────────────────────────────────────────────────────────

#[async_trait]
impl EntityStore for SqliteStore {
    async fn begin(&self, chain: &str, block: u64) -> Result<Box<dyn EntityTx>, ArkiveError> {
        Ok(Box::new(SqliteTx {
            pool: self.pool.clone(),
            chain: chain.to_string(),
            block,
            writes: Vec::new(),
        }))
    }

    async fn revert(&self, chain: &str, block: u64) -> Result<(), ArkiveError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let rows = sqlx::query(
            "SELECT entity, id, prev FROM journal
             WHERE chain = ? AND block > ? ORDER BY seq DESC",
        )
        .bind(chain)
        .bind(block as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(store_err)?;

        let reverted = rows.len();
        for row in rows {
            let entity: String = row.get("entity");
            let id: String = row.get("id");
            match row.get::<Option<String>, _>("prev") {
                Some(prev) => {
                    sqlx::query("INSERT OR REPLACE INTO entities (entity, id, value) VALUES (?, ?, ?)")
                        .bind(&entity)
                        .bind(&id)
                        .bind(&prev)
                        .execute(&mut *tx)
                        .await
                        .map_err(store_err)?;
                }
                None => {
                    sqlx::query("DELETE FROM entities WHERE entity = ? AND id = ?")
                        .bind(&entity)
                        .bind(&id)
                        .execute(&mut *tx)
                        .await
                        .map_err(store_err)?;
                }
            }
        }

        sqlx::query("DELETE FROM journal WHERE chain = ? AND block > ?")
            .bind(chain)
            .bind(block as i64)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        debug!(chain, block, reverted, "entity store reverted");
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum PendingWrite {
    Upsert { entity: String, id: String, value: Value },
    Delete { entity: String, id: String },
}

struct SqliteTx {
    pool: SqlitePool,
    chain: String,
    block: u64,
    writes: Vec<PendingWrite>,
}

impl SqliteTx {
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
impl EntityTx for SqliteTx {
    async fn get(&self, entity: &str, id: &str) -> Result<Option<Value>, ArkiveError> {
        if let Some(buffered) = self.buffered(entity, id) {
            return Ok(buffered);
        }
        let row = sqlx::query("SELECT value FROM entities WHERE entity = ? AND id = ?")
            .bind(entity)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(|r| serde_json::from_str(&r.get::<String, _>("value")).map_err(store_err))
            .transpose()
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
        let rows = sqlx::query(
            "SELECT id, value FROM entities
             WHERE entity = ? AND id >= ? AND id <= ? ORDER BY id",
        )
        .bind(entity)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        let mut merged: std::collections::BTreeMap<String, Option<Value>> = Default::default();
        for row in rows {
            let id: String = row.get("id");
            let value: Value =
                serde_json::from_str(&row.get::<String, _>("value")).map_err(store_err)?;
            merged.insert(id, Some(value));
        }
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
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        for write in self.writes.drain(..) {
            let (entity, id) = match &write {
                PendingWrite::Upsert { entity, id, .. }
                | PendingWrite::Delete { entity, id } => (entity.clone(), id.clone()),
            };

            let prev: Option<String> =
                sqlx::query("SELECT value FROM entities WHERE entity = ? AND id = ?")
                    .bind(&entity)
                    .bind(&id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(store_err)?
                    .map(|r| r.get("value"));

            sqlx::query("INSERT INTO journal (chain, block, entity, id, prev) VALUES (?, ?, ?, ?, ?)")
                .bind(&self.chain)
                .bind(self.block as i64)
                .bind(&entity)
                .bind(&id)
                .bind(&prev)
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;

            match write {
                PendingWrite::Upsert { value, .. } => {
                    let encoded = serde_json::to_string(&value).map_err(store_err)?;
                    sqlx::query(
                        "INSERT OR REPLACE INTO entities (entity, id, value) VALUES (?, ?, ?)",
                    )
                    .bind(&entity)
                    .bind(&id)
                    .bind(&encoded)
                    .execute(&mut *tx)
                    .await
                    .map_err(store_err)?;
                }
                PendingWrite::Delete { .. } => {
                    sqlx::query("DELETE FROM entities WHERE entity = ? AND id = ?")
                        .bind(&entity)
                        .bind(&id)
                        .execute(&mut *tx)
                        .await
                        .map_err(store_err)?;
                }
            }
        }

        tx.commit().await.map_err(store_err)
    }

    async fn rollback(&mut self) -> Result<(), ArkiveError> {
        self.writes.clear();
        Ok(())
    }
}

// ─── CursorStore impl ─────────────────────────────────────────────────────────

#[async_trait]
impl CursorStore for SqliteStore {
    async fn load(&self, chain: &str) -> Result<Option<Cursor>, ArkiveError> {
        let row = sqlx::query(
            "SELECT chain, block_number, block_hash, updated_at FROM cursors WHERE chain = ?",
        )
        .bind(chain)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(row.map(|r| Cursor {
            chain: r.get("chain"),
            block_number: r.get::<i64, _>("block_number") as u64,
            block_hash: r.get("block_hash"),
            updated_at: r.get("updated_at"),
        }))
    }

    async fn save(&self, cursor: Cursor) -> Result<(), ArkiveError> {
        sqlx::query(
            "INSERT OR REPLACE INTO cursors (chain, block_number, block_hash, updated_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&cursor.chain)
        .bind(cursor.block_number as i64)
        .bind(&cursor.block_hash)
        .bind(cursor.updated_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        debug!(chain = %cursor.chain, block = cursor.block_number, "cursor saved");
        Ok(())
    }

    async fn delete(&self, chain: &str) -> Result<(), ArkiveError> {
        sqlx::query("DELETE FROM cursors WHERE chain = ?")
            .bind(chain)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
