//! Memory Store: bounded per-key history with sentiment, backed by a
//! [`MemoryBackend`].
//!
//! The in-memory map is authoritative. A key is dirty from the moment it is
//! mutated until a write of that exact generation succeeds, so failed writes
//! are retried by the next flush.
//!
//! Backend I/O happens outside the map lock. Writes for one key are serialized
//! through a per-key slot holding the last generation that reached the
//! backend, so an older snapshot is never written over a newer one.

use super::backend::MemoryBackend;
use super::{ConversationEntry, ConversationKey, MemoryBudget, SentimentDelta};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// When mutations reach the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistMode {
    /// Write inside `append`, before it returns
    Immediate,
    /// Only mark dirty; the periodic flush writes
    Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    Removed,
    NothingToReset,
}

/// Result of one flush pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub failed: usize,
}

#[derive(Default)]
struct StoreState {
    entries: HashMap<ConversationKey, ConversationEntry>,
    /// Key -> generation of the latest unwritten mutation
    dirty: HashMap<ConversationKey, u64>,
    /// Key -> last generation written (or reset) on the backend
    write_slots: HashMap<ConversationKey, Arc<Mutex<u64>>>,
    generation: u64,
}

pub struct MemoryStore {
    backend: Arc<dyn MemoryBackend>,
    budget: MemoryBudget,
    mode: PersistMode,
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new(backend: Arc<dyn MemoryBackend>, budget: MemoryBudget, mode: PersistMode) -> Self {
        Self {
            backend,
            budget,
            mode,
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Stored entry for `key`, or a fresh empty one. Never fails: unreadable or
    /// malformed records degrade to empty with a warning.
    pub async fn load(&self, key: &ConversationKey) -> ConversationEntry {
        if let Some(entry) = self.state.lock().await.entries.get(key) {
            return entry.clone();
        }

        match self.read_record(key).await {
            Some(entry) => {
                let mut state = self.state.lock().await;
                state.entries.entry(key.clone()).or_insert(entry).clone()
            }
            None => ConversationEntry::default(),
        }
    }

    /// Append one (stimulus, response) pair, bump sentiment, prune to the
    /// budget, then persist according to the store's [`PersistMode`].
    ///
    /// Returns the updated entry.
    pub async fn append(
        &self,
        key: &ConversationKey,
        stimulus: &str,
        response: &str,
        delta: SentimentDelta,
    ) -> ConversationEntry {
        let cached = self.state.lock().await.entries.contains_key(key);
        let loaded = if cached {
            None
        } else {
            self.read_record(key).await
        };

        let (entry, generation) = {
            let mut state = self.state.lock().await;
            state.generation += 1;
            let generation = state.generation;

            let entry = state
                .entries
                .entry(key.clone())
                .or_insert_with(|| loaded.unwrap_or_default());
            entry.record_exchange(stimulus, response, delta, self.budget);
            let snapshot = entry.clone();

            state.dirty.insert(key.clone(), generation);
            (snapshot, generation)
        };

        debug!(
            "Appended turn for {} ({} pairs, +{} -{})",
            key,
            entry.pairs(),
            entry.sentiment.positive,
            entry.sentiment.negative
        );

        if self.mode == PersistMode::Immediate {
            self.persist(key, &entry, generation).await;
        }

        entry
    }

    /// Delete the key's record and in-memory entry.
    pub async fn reset(&self, key: &ConversationKey) -> ResetOutcome {
        let (in_memory, slot, generation) = {
            let mut state = self.state.lock().await;
            state.dirty.remove(key);
            let in_memory = state.entries.remove(key).is_some();
            let slot = state.write_slot(key);
            (in_memory, slot, state.generation)
        };

        let on_disk = self.remove_record(key, &slot, generation).await;

        if in_memory || on_disk {
            info!("Memory reset for {}", key);
            ResetOutcome::Removed
        } else {
            ResetOutcome::NothingToReset
        }
    }

    /// Purge every key in `scope`. Returns how many distinct keys were removed.
    pub async fn reset_scope(&self, scope: &str) -> usize {
        let (mut removed, generation) = {
            let mut state = self.state.lock().await;
            state.dirty.retain(|k, _| k.scope != scope);
            let keys: Vec<_> = state
                .entries
                .keys()
                .filter(|k| k.scope == scope)
                .cloned()
                .collect();
            for key in &keys {
                state.entries.remove(key);
            }
            (keys, state.generation)
        };

        let mut stored = match self.backend.keys_in_scope(scope).await {
            Ok(keys) => keys,
            Err(e) => {
                error!("Failed to list memory records for scope {}: {}", scope, e);
                Vec::new()
            }
        };
        // Keys known only in memory may have a write in flight
        for key in &removed {
            if !stored.contains(key) {
                stored.push(key.clone());
            }
        }

        for key in stored {
            let slot = self.state.lock().await.write_slot(&key);
            if self.remove_record(&key, &slot, generation).await && !removed.contains(&key) {
                removed.push(key);
            }
        }

        if !removed.is_empty() {
            info!("Memory purged for scope {} ({} records)", scope, removed.len());
        }
        removed.len()
    }

    /// Write every dirty entry. Failures stay dirty for the next pass.
    pub async fn flush_dirty(&self) -> FlushReport {
        let pending: Vec<(ConversationKey, u64, ConversationEntry)> = {
            let state = self.state.lock().await;
            state
                .dirty
                .iter()
                .filter_map(|(key, generation)| {
                    state
                        .entries
                        .get(key)
                        .map(|entry| (key.clone(), *generation, entry.clone()))
                })
                .collect()
        };

        let mut report = FlushReport::default();
        for (key, generation, entry) in pending {
            if self.persist(&key, &entry, generation).await {
                report.written += 1;
            } else {
                report.failed += 1;
            }
        }

        if report.written > 0 || report.failed > 0 {
            debug!(
                "Memory flush: {} written, {} failed",
                report.written, report.failed
            );
        }
        report
    }

    pub async fn dirty_count(&self) -> usize {
        self.state.lock().await.dirty.len()
    }

    /// Flush dirty entries every `interval` until the handle is aborted.
    pub fn spawn_periodic_flush(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let report = self.flush_dirty().await;
                if report.failed > 0 {
                    warn!(
                        "{} memory records could not be written, retrying next tick",
                        report.failed
                    );
                }
            }
        })
    }

    async fn read_record(&self, key: &ConversationKey) -> Option<ConversationEntry> {
        match self.backend.read(key).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<ConversationEntry>(&bytes) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    error!("Error decoding memory for {}: {}", key, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                error!("Unexpected error loading memory for {}: {}", key, e);
                None
            }
        }
    }

    /// Remove the backend record while holding the key's write slot, and mark
    /// every generation up to `generation` as superseded.
    async fn remove_record(
        &self,
        key: &ConversationKey,
        slot: &Mutex<u64>,
        generation: u64,
    ) -> bool {
        let mut last_written = slot.lock().await;
        *last_written = (*last_written).max(generation);
        match self.backend.remove(key).await {
            Ok(existed) => existed,
            Err(e) => {
                error!("Failed to remove memory record for {}: {}", key, e);
                false
            }
        }
    }

    /// Write one snapshot. Clears the dirty mark only if no newer mutation
    /// happened meanwhile. A snapshot older than what the backend already
    /// holds is skipped.
    async fn persist(
        &self,
        key: &ConversationKey,
        entry: &ConversationEntry,
        generation: u64,
    ) -> bool {
        let bytes = match serde_json::to_vec_pretty(entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode memory for {}: {}", key, e);
                return false;
            }
        };

        let slot = self.state.lock().await.write_slot(key);
        let mut last_written = slot.lock().await;
        if *last_written >= generation {
            debug!("Skipping stale snapshot {} for {}", generation, key);
            return true;
        }

        match self.backend.write(key, &bytes).await {
            Ok(()) => {
                *last_written = generation;
                let mut state = self.state.lock().await;
                if state.dirty.get(key) == Some(&generation) {
                    state.dirty.remove(key);
                }
                true
            }
            Err(e) => {
                error!("Failed to save memory for {}: {}", key, e);
                false
            }
        }
    }
}

impl StoreState {
    fn write_slot(&mut self, key: &ConversationKey) -> Arc<Mutex<u64>> {
        self.write_slots.entry(key.clone()).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::backend::EphemeralBackend;
    use crate::memory::{Sentiment, Turn};

    fn store_with(backend: Arc<EphemeralBackend>, mode: PersistMode) -> MemoryStore {
        MemoryStore::new(backend, MemoryBudget::Words(5000), mode)
    }

    /// Backend whose first write stalls, so a later write can overtake it
    struct StallingBackend {
        inner: EphemeralBackend,
        stalled: std::sync::atomic::AtomicBool,
    }

    impl StallingBackend {
        fn new() -> Self {
            Self {
                inner: EphemeralBackend::new(),
                stalled: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl MemoryBackend for StallingBackend {
        async fn read(&self, key: &ConversationKey) -> crate::Result<Option<Vec<u8>>> {
            self.inner.read(key).await
        }

        async fn write(&self, key: &ConversationKey, data: &[u8]) -> crate::Result<()> {
            if !self.stalled.swap(true, std::sync::atomic::Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            self.inner.write(key, data).await
        }

        async fn remove(&self, key: &ConversationKey) -> crate::Result<bool> {
            self.inner.remove(key).await
        }

        async fn keys_in_scope(&self, scope: &str) -> crate::Result<Vec<ConversationKey>> {
            self.inner.keys_in_scope(scope).await
        }
    }

    #[tokio::test]
    async fn test_load_missing_is_empty() {
        let store = store_with(Arc::new(EphemeralBackend::new()), PersistMode::Immediate);
        let entry = store.load(&ConversationKey::new("g", "u")).await;
        assert!(entry.turns.is_empty());
        assert_eq!(entry.sentiment, Sentiment::default());
    }

    #[tokio::test]
    async fn test_load_malformed_is_empty() {
        let backend = Arc::new(EphemeralBackend::new());
        let key = ConversationKey::new("g", "u");
        backend.insert_raw(key.clone(), "{ not json");
        let store = store_with(backend, PersistMode::Immediate);

        assert_eq!(store.load(&key).await, ConversationEntry::default());
    }

    #[tokio::test]
    async fn test_append_persists_immediately() {
        let backend = Arc::new(EphemeralBackend::new());
        let store = store_with(backend.clone(), PersistMode::Immediate);
        let key = ConversationKey::new("g", "u");

        let entry = store.append(&key, "Kai: hi", "Kneel.", SentimentDelta::Positive).await;
        assert_eq!(entry.turns, vec![Turn::user("Kai: hi"), Turn::assistant("Kneel.")]);
        assert_eq!(store.dirty_count().await, 0);

        // A fresh store over the same backend sees the record
        let reopened = store_with(backend, PersistMode::Immediate);
        let loaded = reopened.load(&key).await;
        assert_eq!(loaded.turns.len(), 2);
        assert_eq!(loaded.sentiment.positive, 1);
    }

    #[tokio::test]
    async fn test_failed_write_stays_dirty_until_flush() {
        let backend = Arc::new(EphemeralBackend::new());
        let store = store_with(backend.clone(), PersistMode::Immediate);
        let key = ConversationKey::new("g", "u");

        backend.set_fail_writes(true);
        store.append(&key, "a", "b", SentimentDelta::Neutral).await;
        assert_eq!(store.dirty_count().await, 1);
        // In-memory state stays authoritative
        assert_eq!(store.load(&key).await.turns.len(), 2);

        let report = store.flush_dirty().await;
        assert_eq!(report, FlushReport { written: 0, failed: 1 });

        backend.set_fail_writes(false);
        let report = store.flush_dirty().await;
        assert_eq!(report, FlushReport { written: 1, failed: 0 });
        assert_eq!(store.dirty_count().await, 0);
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn test_deferred_mode_writes_on_flush() {
        let backend = Arc::new(EphemeralBackend::new());
        let store = store_with(backend.clone(), PersistMode::Deferred);
        let key = ConversationKey::new("g", "u");

        store.append(&key, "a", "b", SentimentDelta::Neutral).await;
        assert!(backend.is_empty());
        assert_eq!(store.dirty_count().await, 1);

        store.flush_dirty().await;
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let store = store_with(Arc::new(EphemeralBackend::new()), PersistMode::Immediate);
        let key = ConversationKey::new("g", "u");
        store.append(&key, "a", "b", SentimentDelta::Negative).await;

        assert_eq!(store.reset(&key).await, ResetOutcome::Removed);
        assert_eq!(store.reset(&key).await, ResetOutcome::NothingToReset);
        assert_eq!(store.load(&key).await, ConversationEntry::default());
    }

    #[tokio::test]
    async fn test_reset_scope_only_touches_scope() {
        let backend = Arc::new(EphemeralBackend::new());
        let store = store_with(backend.clone(), PersistMode::Immediate);
        store.append(&ConversationKey::new("g1", "a"), "x", "y", SentimentDelta::Neutral).await;
        store.append(&ConversationKey::new("g1", "b"), "x", "y", SentimentDelta::Neutral).await;
        store.append(&ConversationKey::new("g2", "a"), "x", "y", SentimentDelta::Neutral).await;

        assert_eq!(store.reset_scope("g1").await, 2);
        assert_eq!(store.reset_scope("g1").await, 0);
        assert_eq!(backend.len(), 1);
        assert_eq!(store.load(&ConversationKey::new("g2", "a")).await.turns.len(), 2);
    }

    #[tokio::test]
    async fn test_slow_write_never_overwrites_newer_snapshot() {
        let backend = Arc::new(StallingBackend::new());
        let store = MemoryStore::new(
            backend.clone(),
            MemoryBudget::Words(5000),
            PersistMode::Immediate,
        );
        let key = ConversationKey::new("g", "u");

        tokio::join!(
            store.append(&key, "Kai: first", "Hmph.", SentimentDelta::Neutral),
            store.append(&key, "Kai: second", "Kneel.", SentimentDelta::Neutral),
        );

        assert_eq!(store.dirty_count().await, 0);
        let bytes = backend.inner.read(&key).await.unwrap().unwrap();
        let on_disk: ConversationEntry = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(on_disk.turns.len(), 4);
        assert_eq!(on_disk, store.load(&key).await);
    }

    #[tokio::test]
    async fn test_reset_waits_for_in_flight_write() {
        let backend = Arc::new(StallingBackend::new());
        let store = MemoryStore::new(
            backend.clone(),
            MemoryBudget::Words(5000),
            PersistMode::Immediate,
        );
        let key = ConversationKey::new("g", "u");

        let (_, outcome) = tokio::join!(
            store.append(&key, "Kai: hi", "Hmph.", SentimentDelta::Neutral),
            store.reset(&key),
        );

        assert_eq!(outcome, ResetOutcome::Removed);
        assert!(backend.inner.is_empty());
        assert!(store.load(&key).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flush_retries() {
        let backend = Arc::new(EphemeralBackend::new());
        let store = Arc::new(store_with(backend.clone(), PersistMode::Deferred));
        store
            .append(&ConversationKey::new("g", "u"), "a", "b", SentimentDelta::Neutral)
            .await;

        backend.set_fail_writes(true);
        let handle = store.clone().spawn_periodic_flush(Duration::from_secs(300));

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(store.dirty_count().await, 1);

        backend.set_fail_writes(false);
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(store.dirty_count().await, 0);
        assert_eq!(backend.len(), 1);

        handle.abort();
    }
}
