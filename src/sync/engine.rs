use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use loro::LoroDoc;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::db::{DurableStore, StoreError};
use crate::models::{SendMessage, UpdateMessage};
use crate::registry::SessionRegistry;

/// Attempts per persist before giving up until the next trigger
const PERSIST_MAX_ATTEMPTS: u32 = 5;

/// Text container holding the document body inside the CRDT
const TEXT_CONTAINER: &str = "content";

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("no resident document '{0}'")]
    UnknownDocument(String),
    #[error("crdt error: {0}")]
    Crdt(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Retry backoff for persist failures: first * factor^attempt, capped at max.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let grown = self.first.as_millis() as f64 * self.factor.powi(attempt as i32);
        self.max.min(Duration::from_millis(grown as u64))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(200),
            max: Duration::from_secs(5),
            factor: 2.0,
        }
    }
}

/// One resident document replica with its persistence bookkeeping
struct DocState {
    /// The CRDT replica. The lock is the per-document merge queue: merges are
    /// serialized, never torn and never cancelled.
    doc: Mutex<LoroDoc>,
    dirty: AtomicBool,
    /// A debounce task is already scheduled
    persist_pending: AtomicBool,
    /// At most one in-flight persist per document
    persist_lock: Mutex<()>,
}

impl DocState {
    fn new(doc: LoroDoc) -> Self {
        Self {
            doc: Mutex::new(doc),
            dirty: AtomicBool::new(false),
            persist_pending: AtomicBool::new(false),
            persist_lock: Mutex::new(()),
        }
    }
}

/// Owns one mergeable replica per document and bridges it to durable storage.
///
/// Deltas merge through `LoroDoc::import`, which is commutative, associative
/// and idempotent, so replicas converge regardless of delivery order or
/// duplication. Persistence writes the plain-text projection of the
/// `"content"` container, debounced over bursts of updates and forced when
/// the last session leaves.
pub struct SyncEngine {
    docs: RwLock<HashMap<String, Arc<DocState>>>,
    store: Arc<dyn DurableStore>,
    registry: Arc<SessionRegistry>,
    debounce: Duration,
    backoff: BackoffPolicy,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn DurableStore>,
        registry: Arc<SessionRegistry>,
        debounce: Duration,
    ) -> Self {
        Self {
            docs: RwLock::new(HashMap::new()),
            store,
            registry,
            debounce,
            backoff: BackoffPolicy::default(),
        }
    }

    #[cfg(test)]
    fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Materialize the replica for a joining session and return a full
    /// snapshot the client can reconstruct current state from. Idempotent.
    pub async fn on_join(&self, doc_id: &str) -> Result<Vec<u8>, SyncError> {
        let state = self.resident_or_load(doc_id).await?;
        let doc = state.doc.lock().await;
        doc.export(loro::ExportMode::Snapshot)
            .map_err(|e| SyncError::Crdt(e.to_string()))
    }

    /// Merge a delta from one session, mark the document dirty, schedule a
    /// debounced persist and re-broadcast the delta to the other sessions.
    pub async fn on_update(
        self: &Arc<Self>,
        doc_id: &str,
        delta: Vec<u8>,
        sender_conn_id: &str,
    ) -> Result<(), SyncError> {
        let state = {
            let docs = self.docs.read().await;
            docs.get(doc_id)
                .cloned()
                .ok_or_else(|| SyncError::UnknownDocument(doc_id.to_string()))?
        };

        {
            let doc = state.doc.lock().await;
            doc.import(&delta)
                .map_err(|e| SyncError::Crdt(e.to_string()))?;
        }
        state.dirty.store(true, Ordering::SeqCst);
        self.schedule_persist(doc_id, &state);

        self.registry
            .broadcast(
                doc_id,
                SendMessage::DocumentUpdate(UpdateMessage { delta }),
                Some(sender_conn_id),
            )
            .await;
        Ok(())
    }

    /// Write the document's text projection to the durable store.
    /// No-op when the document is not resident or not dirty.
    pub async fn persist(&self, doc_id: &str) -> Result<(), SyncError> {
        let state = { self.docs.read().await.get(doc_id).cloned() };
        match state {
            Some(state) => self.persist_state(doc_id, &state).await,
            None => Ok(()),
        }
    }

    /// Final persist once the last session left, then drop the replica.
    /// On persist failure the replica stays resident so the text survives
    /// until a later join or persist succeeds.
    pub async fn flush_and_evict(&self, doc_id: &str) {
        let state = { self.docs.read().await.get(doc_id).cloned() };
        let Some(state) = state else {
            return;
        };
        match self.persist_state(doc_id, &state).await {
            Ok(()) => {
                self.docs.write().await.remove(doc_id);
                info!("Evicted document {} after final persist", doc_id);
            }
            Err(e) => {
                error!(
                    "Final persist for document {} failed, keeping replica resident: {}",
                    doc_id, e
                );
            }
        }
    }

    /// (resident, dirty) document counts for diagnostics
    pub async fn stats(&self) -> (u32, u32) {
        let docs = self.docs.read().await;
        let dirty = docs
            .values()
            .filter(|s| s.dirty.load(Ordering::SeqCst))
            .count() as u32;
        (docs.len() as u32, dirty)
    }

    async fn resident_or_load(&self, doc_id: &str) -> Result<Arc<DocState>, SyncError> {
        if let Some(state) = self.docs.read().await.get(doc_id) {
            return Ok(state.clone());
        }

        let mut docs = self.docs.write().await;
        // Lost the race to another joiner
        if let Some(state) = docs.get(doc_id) {
            return Ok(state.clone());
        }

        let doc = LoroDoc::new();
        match self.store.get(doc_id).await? {
            Some(text) => {
                doc.get_text(TEXT_CONTAINER)
                    .insert(0, &text)
                    .map_err(|e| SyncError::Crdt(e.to_string()))?;
                doc.commit();
                info!("Loaded document {} from store ({} bytes)", doc_id, text.len());
            }
            None => {
                info!("Document {} not in store, starting empty", doc_id);
            }
        }

        let state = Arc::new(DocState::new(doc));
        docs.insert(doc_id.to_string(), state.clone());
        Ok(state)
    }

    /// Coalesce bursts of updates into one persist per debounce window
    fn schedule_persist(self: &Arc<Self>, doc_id: &str, state: &Arc<DocState>) {
        if state.persist_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = self.clone();
        let state = state.clone();
        let doc_id = doc_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(engine.debounce).await;
            state.persist_pending.store(false, Ordering::SeqCst);
            if let Err(e) = engine.persist(&doc_id).await {
                error!("Debounced persist for document {} failed: {}", doc_id, e);
            }
        });
    }

    async fn persist_state(&self, doc_id: &str, state: &DocState) -> Result<(), SyncError> {
        let _guard = state.persist_lock.lock().await;
        if !state.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let text = {
            let doc = state.doc.lock().await;
            doc.get_text(TEXT_CONTAINER).to_string()
        };

        let mut attempt = 0;
        loop {
            match self.store.put(doc_id, &text).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 < PERSIST_MAX_ATTEMPTS => {
                    // Transient store failure: retry with backoff; in-memory
                    // editing continues uninterrupted on the replica.
                    warn!(
                        "Persist attempt {} for document {} failed: {}",
                        attempt + 1,
                        doc_id,
                        e
                    );
                    tokio::time::sleep(self.backoff.delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    state.dirty.store(true, Ordering::SeqCst);
                    error!(
                        "Persist for document {} gave up after {} attempts: {}",
                        doc_id, PERSIST_MAX_ATTEMPTS, e
                    );
                    return Err(e.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemStore;
    use crate::fanout::LocalFanout;

    fn engine_with_store(store: Arc<dyn DurableStore>) -> Arc<SyncEngine> {
        let registry = Arc::new(SessionRegistry::new(Arc::new(LocalFanout::new())));
        Arc::new(SyncEngine::new(store, registry, Duration::from_millis(20)))
    }

    fn quick_backoff() -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(1),
            max: Duration::from_millis(5),
            factor: 2.0,
        }
    }

    fn retrying_engine(store: Arc<dyn DurableStore>) -> Arc<SyncEngine> {
        let registry = Arc::new(SessionRegistry::new(Arc::new(LocalFanout::new())));
        Arc::new(
            SyncEngine::new(store, registry, Duration::from_millis(20))
                .with_backoff(quick_backoff()),
        )
    }

    /// Store whose puts fail a fixed number of times before recovering
    struct FlakyStore {
        inner: MemStore,
        failures_left: std::sync::atomic::AtomicU32,
    }

    impl FlakyStore {
        fn failing(n: u32) -> Self {
            Self {
                inner: MemStore::new(),
                failures_left: std::sync::atomic::AtomicU32::new(n),
            }
        }

        fn heal(&self) {
            self.failures_left.store(0, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl DurableStore for FlakyStore {
        async fn get(&self, doc_id: &str) -> Result<Option<String>, StoreError> {
            self.inner.get(doc_id).await
        }

        async fn put(&self, doc_id: &str, text: &str) -> Result<(), StoreError> {
            let remaining = self.failures_left.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_left
                    .store(remaining.saturating_sub(1), Ordering::SeqCst);
                return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.put(doc_id, text).await
        }
    }

    fn client_from_snapshot(snapshot: &[u8]) -> LoroDoc {
        let doc = LoroDoc::new();
        doc.import(snapshot).unwrap();
        doc
    }

    fn client_edit(doc: &LoroDoc, pos: usize, text: &str) -> Vec<u8> {
        doc.get_text(TEXT_CONTAINER).insert(pos, text).unwrap();
        doc.commit();
        doc.export(loro::ExportMode::Snapshot).unwrap()
    }

    fn text_of(doc: &LoroDoc) -> String {
        doc.get_text(TEXT_CONTAINER).to_string()
    }

    #[test]
    fn concurrent_deltas_converge_in_any_order() {
        let a = LoroDoc::new();
        let b = LoroDoc::new();
        let delta_a = client_edit(&a, 0, "hello ");
        let delta_b = client_edit(&b, 0, "world");

        // Apply in opposite orders on two fresh replicas, with a duplicate
        let r1 = LoroDoc::new();
        r1.import(&delta_a).unwrap();
        r1.import(&delta_b).unwrap();
        r1.import(&delta_a).unwrap();

        let r2 = LoroDoc::new();
        r2.import(&delta_b).unwrap();
        r2.import(&delta_a).unwrap();

        assert_eq!(text_of(&r1), text_of(&r2));
        assert!(!text_of(&r1).is_empty());
    }

    #[tokio::test]
    async fn on_join_reflects_all_prior_updates() {
        let engine = engine_with_store(Arc::new(MemStore::new()));

        let snapshot = engine.on_join("doc-1").await.unwrap();
        let client_a = client_from_snapshot(&snapshot);
        let client_b = client_from_snapshot(&snapshot);

        for (i, word) in ["one ", "two ", "three "].iter().enumerate() {
            let doc = if i % 2 == 0 { &client_a } else { &client_b };
            let delta = client_edit(doc, 0, word);
            engine.on_update("doc-1", delta, "c1").await.unwrap();
        }

        let late = client_from_snapshot(&engine.on_join("doc-1").await.unwrap());
        let text = text_of(&late);
        for word in ["one", "two", "three"] {
            assert!(text.contains(word), "missing '{}' in '{}'", word, text);
        }
    }

    #[tokio::test]
    async fn on_join_is_idempotent() {
        let engine = engine_with_store(Arc::new(MemStore::new()));
        engine.on_join("doc-1").await.unwrap();
        let client = client_from_snapshot(&engine.on_join("doc-1").await.unwrap());
        let delta = client_edit(&client, 0, "stable");
        engine.on_update("doc-1", delta, "c1").await.unwrap();

        let s1 = engine.on_join("doc-1").await.unwrap();
        let s2 = engine.on_join("doc-1").await.unwrap();
        assert_eq!(
            text_of(&client_from_snapshot(&s1)),
            text_of(&client_from_snapshot(&s2))
        );
    }

    #[tokio::test]
    async fn persist_round_trip_through_the_store() {
        let store: Arc<MemStore> = Arc::new(MemStore::new());
        let engine = engine_with_store(store.clone());

        let snapshot = engine.on_join("doc-1").await.unwrap();
        let client = client_from_snapshot(&snapshot);
        let delta = client_edit(&client, 0, "persist me");
        engine.on_update("doc-1", delta, "c1").await.unwrap();
        engine.persist("doc-1").await.unwrap();

        assert_eq!(
            store.get("doc-1").await.unwrap().as_deref(),
            Some("persist me")
        );

        // A second engine sharing the store reloads the same projection
        let engine2 = engine_with_store(store);
        let reloaded = client_from_snapshot(&engine2.on_join("doc-1").await.unwrap());
        assert_eq!(text_of(&reloaded), "persist me");
    }

    #[tokio::test]
    async fn update_for_non_resident_document_is_rejected() {
        let engine = engine_with_store(Arc::new(MemStore::new()));
        let err = engine
            .on_update("nope", vec![1, 2, 3], "c1")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownDocument(_)));
    }

    #[tokio::test]
    async fn flush_and_evict_persists_then_drops_the_replica() {
        let store: Arc<MemStore> = Arc::new(MemStore::new());
        let engine = engine_with_store(store.clone());

        let client = client_from_snapshot(&engine.on_join("doc-1").await.unwrap());
        let delta = client_edit(&client, 0, "bye");
        engine.on_update("doc-1", delta, "c1").await.unwrap();
        engine.flush_and_evict("doc-1").await;

        assert_eq!((0, 0), engine.stats().await);
        assert_eq!(store.get("doc-1").await.unwrap().as_deref(), Some("bye"));
    }

    #[tokio::test]
    async fn debounce_coalesces_bursts_into_one_persist() {
        let store: Arc<MemStore> = Arc::new(MemStore::new());
        let engine = engine_with_store(store.clone());

        let client = client_from_snapshot(&engine.on_join("doc-1").await.unwrap());
        for word in ["a", "b", "c"] {
            let delta = client_edit(&client, 0, word);
            engine.on_update("doc-1", delta, "c1").await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        let stored = store.get("doc-1").await.unwrap().unwrap();
        assert_eq!(stored.len(), 3);
        let (_, dirty) = engine.stats().await;
        assert_eq!(dirty, 0);
    }

    #[tokio::test]
    async fn persist_retries_through_transient_store_failures() {
        let store = Arc::new(FlakyStore::failing(2));
        let engine = retrying_engine(store.clone());

        let client = client_from_snapshot(&engine.on_join("doc-1").await.unwrap());
        let delta = client_edit(&client, 0, "retry");
        engine.on_update("doc-1", delta, "c1").await.unwrap();

        engine.persist("doc-1").await.unwrap();

        assert_eq!(
            store.inner.get("doc-1").await.unwrap().as_deref(),
            Some("retry")
        );
        let (_, dirty) = engine.stats().await;
        assert_eq!(dirty, 0);
    }

    #[tokio::test]
    async fn persist_gives_up_after_max_attempts_and_keeps_the_document_dirty() {
        let store = Arc::new(FlakyStore::failing(u32::MAX));
        let engine = retrying_engine(store.clone());

        let client = client_from_snapshot(&engine.on_join("doc-1").await.unwrap());
        let delta = client_edit(&client, 0, "stubborn");
        engine.on_update("doc-1", delta, "c1").await.unwrap();

        let err = engine.persist("doc-1").await.unwrap_err();
        assert!(matches!(err, SyncError::Store(_)));
        assert_eq!(engine.stats().await, (1, 1));

        // Editing was never interrupted and a later persist recovers the text
        let delta = client_edit(&client, 0, "still ");
        engine.on_update("doc-1", delta, "c1").await.unwrap();
        store.heal();
        engine.persist("doc-1").await.unwrap();
        assert_eq!(
            store.inner.get("doc-1").await.unwrap().as_deref(),
            Some("still stubborn")
        );
        let (_, dirty) = engine.stats().await;
        assert_eq!(dirty, 0);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(200));
        assert_eq!(policy.delay(1), Duration::from_millis(400));
        assert_eq!(policy.delay(10), Duration::from_secs(5));
    }
}
