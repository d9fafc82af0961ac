//! Transformer registry and the per-block dispatcher.
//!
//! All envelopes for one block run inside a single entity transaction.
//! The transaction commits only after every transformer for the block has
//! returned, so a mid-block failure rolls the whole block back and the
//! block replays from scratch on retry. A source's `setup` transformer is
//! synthesized into the stream once, immediately before the source's first
//! delivered item; it is marked done only after that block commits, and is
//! forgotten again if reorg recovery rolls that block back.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{ArkiveError, ConfigError};
use crate::items::Envelope;
use crate::key::DispatchKey;
use crate::store::{EntityStore, EntityTx};

/// User-supplied handler bound to one dispatch key.
#[async_trait]
pub trait Transformer: Send + Sync {
    async fn handle(&self, event: &Envelope, tx: &mut dyn EntityTx) -> Result<(), ArkiveError>;
}

// ─── Registry ─────────────────────────────────────────────────────────────────

/// Transformers keyed by dispatch key. Registration rejects duplicates.
#[derive(Default, Clone)]
pub struct TransformerRegistry {
    transformers: BTreeMap<DispatchKey, Arc<dyn Transformer>>,
}

impl TransformerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transformer under the canonical string form of its key.
    pub fn register(
        &mut self,
        key: &str,
        transformer: Arc<dyn Transformer>,
    ) -> Result<(), ConfigError> {
        let key = DispatchKey::parse(key)?;
        if self.transformers.contains_key(&key) {
            return Err(ConfigError::DuplicateTransformer {
                key: key.to_string(),
            });
        }
        self.transformers.insert(key, transformer);
        Ok(())
    }

    pub fn get(&self, key: &DispatchKey) -> Option<&Arc<dyn Transformer>> {
        self.transformers.get(key)
    }

    /// Returns `true` if `source` has a registered `setup` transformer.
    pub fn has_setup(&self, source: &str) -> bool {
        self.transformers
            .contains_key(&DispatchKey::setup(source))
    }

    pub fn keys(&self) -> impl Iterator<Item = &DispatchKey> {
        self.transformers.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }
}

impl std::fmt::Debug for TransformerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformerRegistry")
            .field("keys", &self.transformers.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ─── Dispatcher ───────────────────────────────────────────────────────────────

/// Runs one chain's envelopes through registered transformers, one entity
/// transaction per block.
pub struct Dispatcher {
    registry: Arc<TransformerRegistry>,
    store: Arc<dyn EntityStore>,
    chain: String,
    chain_id: u64,
    max_block_retries: u32,
    // Source name -> block whose commit included the setup envelope.
    setup_done: HashMap<String, u64>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<TransformerRegistry>,
        store: Arc<dyn EntityStore>,
        chain: impl Into<String>,
        chain_id: u64,
        max_block_retries: u32,
    ) -> Self {
        Self {
            registry,
            store,
            chain: chain.into(),
            chain_id,
            setup_done: HashMap::new(),
            max_block_retries,
        }
    }

    /// Forget setup state for sources whose setup committed above `block`.
    /// The store revert has already undone those setup writes, so setup
    /// must run again before the source's next delivered item.
    pub fn revert_setup_after(&mut self, block: u64) {
        self.setup_done.retain(|_, done_at| *done_at <= block);
    }

    /// Dispatch one block's envelopes. Returns the number of envelopes
    /// delivered (setup included), or 0 when nothing was deliverable — in
    /// which case no transaction is opened.
    pub async fn dispatch_block(
        &mut self,
        block: u64,
        envelopes: &[Envelope],
    ) -> Result<usize, ArkiveError> {
        let batch = self.plan(block, envelopes);
        if batch.is_empty() {
            return Ok(0);
        }

        let mut attempt: u32 = 0;
        loop {
            match self.run_block(block, &batch).await {
                Ok(()) => {
                    for env in &batch {
                        if matches!(env.key, DispatchKey::Setup { .. }) {
                            self.setup_done
                                .insert(env.key.source().to_string(), env.block_number);
                        }
                    }
                    debug!(
                        chain = %self.chain,
                        block,
                        delivered = batch.len(),
                        "block dispatched"
                    );
                    return Ok(batch.len());
                }
                Err(err) if attempt < self.max_block_retries => {
                    attempt += 1;
                    warn!(
                        chain = %self.chain,
                        block,
                        attempt,
                        max = self.max_block_retries,
                        error = %err,
                        "block dispatch failed, retrying"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Select deliverable envelopes and weave in setup envelopes before
    /// each source's first delivered item.
    fn plan(&self, block: u64, envelopes: &[Envelope]) -> Vec<Envelope> {
        let mut batch = Vec::new();
        let mut setup_emitted: HashSet<&str> = HashSet::new();
        for env in envelopes {
            if self.registry.get(&env.key).is_none() {
                continue;
            }
            let source = env.key.source();
            if self.registry.has_setup(source)
                && !self.setup_done.contains_key(source)
                && setup_emitted.insert(source)
            {
                batch.push(Envelope {
                    key: DispatchKey::setup(source),
                    chain: self.chain.clone(),
                    chain_id: self.chain_id,
                    block_number: block,
                    tx_index: 0,
                    log_index: 0,
                    payload: serde_json::Value::Null,
                });
            }
            batch.push(env.clone());
        }
        batch
    }

    /// One attempt: open a transaction, run every envelope, commit.
    async fn run_block(&self, block: u64, batch: &[Envelope]) -> Result<(), ArkiveError> {
        let mut tx = self.store.begin(&self.chain, block).await?;
        for env in batch {
            // plan() only emits keys with a registered transformer
            let transformer = self.registry.get(&env.key).ok_or_else(|| {
                ArkiveError::Handler {
                    chain: self.chain.clone(),
                    block,
                    key: env.key.to_string(),
                    reason: "transformer unregistered mid-run".to_string(),
                }
            })?;
            if let Err(err) = transformer.handle(env, tx.as_mut()).await {
                tx.rollback().await?;
                return Err(ArkiveError::Handler {
                    chain: self.chain.clone(),
                    block,
                    key: env.key.to_string(),
                    reason: err.to_string(),
                });
            }
        }
        tx.commit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    // Minimal store that applies commits to a shared map and records the
    // call sequence.
    #[derive(Default)]
    struct TestStoreInner {
        committed: BTreeMap<String, Value>,
        commits: u32,
        rollbacks: u32,
    }

    #[derive(Default, Clone)]
    struct TestStore(Arc<Mutex<TestStoreInner>>);

    struct TestTx {
        store: TestStore,
        writes: Vec<(String, Value)>,
    }

    #[async_trait]
    impl EntityTx for TestTx {
        async fn get(&self, entity: &str, id: &str) -> Result<Option<Value>, ArkiveError> {
            let key = format!("{entity}/{id}");
            if let Some((_, v)) = self.writes.iter().rev().find(|(k, _)| *k == key) {
                return Ok(Some(v.clone()));
            }
            Ok(self.store.0.lock().unwrap().committed.get(&key).cloned())
        }

        async fn upsert(&mut self, entity: &str, id: &str, value: Value) -> Result<(), ArkiveError> {
            self.writes.push((format!("{entity}/{id}"), value));
            Ok(())
        }

        async fn delete(&mut self, _entity: &str, _id: &str) -> Result<(), ArkiveError> {
            Ok(())
        }

        async fn find_range(
            &self,
            _entity: &str,
            _from: &str,
            _to: &str,
        ) -> Result<Vec<(String, Value)>, ArkiveError> {
            Ok(vec![])
        }

        async fn commit(&mut self) -> Result<(), ArkiveError> {
            let mut inner = self.store.0.lock().unwrap();
            for (k, v) in self.writes.drain(..) {
                inner.committed.insert(k, v);
            }
            inner.commits += 1;
            Ok(())
        }

        async fn rollback(&mut self) -> Result<(), ArkiveError> {
            self.writes.clear();
            self.store.0.lock().unwrap().rollbacks += 1;
            Ok(())
        }
    }

    #[async_trait]
    impl EntityStore for TestStore {
        async fn begin(&self, _chain: &str, _block: u64) -> Result<Box<dyn EntityTx>, ArkiveError> {
            Ok(Box::new(TestTx {
                store: self.clone(),
                writes: vec![],
            }))
        }

        async fn revert(&self, _chain: &str, _block: u64) -> Result<(), ArkiveError> {
            Ok(())
        }
    }

    // Records every delivered key; fails the first `fail_first` calls.
    struct Recorder {
        seen: Arc<Mutex<Vec<String>>>,
        fail_first: Arc<Mutex<u32>>,
    }

    impl Recorder {
        fn new(seen: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                seen,
                fail_first: Arc::new(Mutex::new(0)),
            }
        }
    }

    #[async_trait]
    impl Transformer for Recorder {
        async fn handle(&self, event: &Envelope, tx: &mut dyn EntityTx) -> Result<(), ArkiveError> {
            {
                let mut remaining = self.fail_first.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ArkiveError::Store("simulated failure".into()));
                }
            }
            self.seen.lock().unwrap().push(event.key.to_string());
            tx.upsert("seen", &event.key.to_string(), json!(event.block_number))
                .await
        }
    }

    fn envelope(key: &str, block: u64, log_index: u32) -> Envelope {
        Envelope {
            key: DispatchKey::parse(key).unwrap(),
            chain: "testnet".into(),
            chain_id: 1337,
            block_number: block,
            tx_index: 0,
            log_index,
            payload: Value::Null,
        }
    }

    #[tokio::test]
    async fn setup_runs_once_before_first_item() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = TransformerRegistry::new();
        registry
            .register("Usdc:setup", Arc::new(Recorder::new(seen.clone())))
            .unwrap();
        registry
            .register("Usdc:Transfer", Arc::new(Recorder::new(seen.clone())))
            .unwrap();

        let store = TestStore::default();
        let mut dispatcher = Dispatcher::new(
            Arc::new(registry),
            Arc::new(store),
            "testnet",
            1337,
            0,
        );

        dispatcher
            .dispatch_block(5, &[envelope("Usdc:Transfer", 5, 0)])
            .await
            .unwrap();
        dispatcher
            .dispatch_block(6, &[envelope("Usdc:Transfer", 6, 0)])
            .await
            .unwrap();

        let order = seen.lock().unwrap().clone();
        assert_eq!(order, vec!["Usdc:setup", "Usdc:Transfer", "Usdc:Transfer"]);
    }

    #[tokio::test]
    async fn setup_reruns_after_its_block_is_rolled_back() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = TransformerRegistry::new();
        registry
            .register("Usdc:setup", Arc::new(Recorder::new(seen.clone())))
            .unwrap();
        registry
            .register("Usdc:Transfer", Arc::new(Recorder::new(seen.clone())))
            .unwrap();

        let store = TestStore::default();
        let mut dispatcher = Dispatcher::new(
            Arc::new(registry),
            Arc::new(store),
            "testnet",
            1337,
            0,
        );

        // Setup commits as part of block 5, which a reorg then reverts.
        dispatcher
            .dispatch_block(5, &[envelope("Usdc:Transfer", 5, 0)])
            .await
            .unwrap();
        dispatcher.revert_setup_after(4);
        dispatcher
            .dispatch_block(5, &[envelope("Usdc:Transfer", 5, 0)])
            .await
            .unwrap();

        // A rollback above the setup block leaves it done.
        dispatcher.revert_setup_after(7);
        dispatcher
            .dispatch_block(8, &[envelope("Usdc:Transfer", 8, 0)])
            .await
            .unwrap();

        let order = seen.lock().unwrap().clone();
        assert_eq!(
            order,
            vec![
                "Usdc:setup",
                "Usdc:Transfer",
                "Usdc:setup",
                "Usdc:Transfer",
                "Usdc:Transfer"
            ]
        );
    }

    #[tokio::test]
    async fn no_deliverable_envelopes_opens_no_transaction() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = TransformerRegistry::new();
        registry
            .register("Usdc:Transfer", Arc::new(Recorder::new(seen)))
            .unwrap();

        let store = TestStore::default();
        let mut dispatcher = Dispatcher::new(
            Arc::new(registry),
            Arc::new(store.clone()),
            "testnet",
            1337,
            0,
        );

        let n = dispatcher
            .dispatch_block(5, &[envelope("Other:Thing", 5, 0)])
            .await
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(store.0.lock().unwrap().commits, 0);
    }

    #[tokio::test]
    async fn failed_block_rolls_back_and_retries() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let flaky = Recorder::new(seen.clone());
        *flaky.fail_first.lock().unwrap() = 2;

        let mut registry = TransformerRegistry::new();
        registry.register("Usdc:Transfer", Arc::new(flaky)).unwrap();

        let store = TestStore::default();
        let mut dispatcher = Dispatcher::new(
            Arc::new(registry),
            Arc::new(store.clone()),
            "testnet",
            1337,
            3,
        );

        let n = dispatcher
            .dispatch_block(5, &[envelope("Usdc:Transfer", 5, 0)])
            .await
            .unwrap();
        assert_eq!(n, 1);

        let inner = store.0.lock().unwrap();
        assert_eq!(inner.rollbacks, 2);
        assert_eq!(inner.commits, 1);
        assert!(inner.committed.contains_key("seen/Usdc:Transfer"));
    }

    #[tokio::test]
    async fn exhausted_retries_surface_handler_error() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let flaky = Recorder::new(seen);
        *flaky.fail_first.lock().unwrap() = 10;

        let mut registry = TransformerRegistry::new();
        registry.register("Usdc:Transfer", Arc::new(flaky)).unwrap();

        let store = TestStore::default();
        let mut dispatcher = Dispatcher::new(
            Arc::new(registry),
            Arc::new(store.clone()),
            "testnet",
            1337,
            1,
        );

        let err = dispatcher
            .dispatch_block(5, &[envelope("Usdc:Transfer", 5, 0)])
            .await
            .unwrap_err();
        assert!(matches!(err, ArkiveError::Handler { block: 5, .. }));
        assert_eq!(store.0.lock().unwrap().commits, 0);
    }

    #[tokio::test]
    async fn duplicate_registration_rejected() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = TransformerRegistry::new();
        registry
            .register("Usdc:Transfer", Arc::new(Recorder::new(seen.clone())))
            .unwrap();
        let err = registry
            .register("Usdc:Transfer", Arc::new(Recorder::new(seen)))
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateTransformer { .. }));
    }
}
