//! # Persistence Coordinator
//!
//! Writes each batch to the durable store as one all-or-nothing transaction.
//! Rows are inserted in chunks to bound statement size; if any chunk fails the
//! whole transaction is rolled back.
//!
//! Backends implement [`TelemetryStore`]. The PostgreSQL one lives under
//! `connections`; [`MemoryStore`] backs tests and storage-less runs.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use crate::error::StoreError;
use crate::models::{StorageRow, TelemetryEvent};

/// Default rows per `INSERT` statement.
pub const DEFAULT_CHUNK_SIZE: usize = 100;

/// A store that can open write transactions.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Opens a transaction. Fails with [`StoreError::Unavailable`] when no
    /// connection can be obtained.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;
}

/// An open write transaction scoped to one batch.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Inserts one chunk of rows.
    async fn insert_chunk(&mut self, rows: &[StorageRow]) -> Result<(), StoreError>;
    /// Makes every inserted row durable.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
    /// Discards every inserted row.
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// # Persistence Coordinator
#[derive(Clone)]
pub struct PersistenceCoordinator {
    store: Option<Arc<dyn TelemetryStore>>,
    chunk_size: usize,
}

impl PersistenceCoordinator {
    /// Creates a coordinator. `store: None` makes every non-empty batch fail
    /// with [`StoreError::Unavailable`].
    pub fn new(store: Option<Arc<dyn TelemetryStore>>, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Rows per chunk.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Persists `events` in order as a single transaction.
    pub async fn insert_batch(&self, events: &[TelemetryEvent]) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| StoreError::Unavailable("no store configured".into()))?;

        let rows: Vec<StorageRow> = events.iter().map(StorageRow::from).collect();
        let mut tx = store.begin().await?;

        for (index, chunk) in rows.chunks(self.chunk_size).enumerate() {
            let written = tx.insert_chunk(chunk).await;
            if let Err(e) = written {
                let offset = index * self.chunk_size;
                log::error!("Chunk at row {} failed, rolling back batch of {}: {}", offset, rows.len(), e);
                if let Err(rb) = tx.rollback().await {
                    log::error!("Rollback failed: {}", rb);
                }
                return Err(match e {
                    StoreError::ChunkFailed { .. } => e,
                    other => StoreError::ChunkFailed {
                        offset,
                        reason: other.to_string(),
                    },
                });
            }
        }

        tx.commit().await?;
        log::debug!("Persisted {} rows", rows.len());
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    rows: Vec<StorageRow>,
    next_id: i64,
    fail_on_row: Option<usize>,
    commits: usize,
    rollbacks: usize,
}

/// # Memory Store
///
/// Transactional in-memory store. Committed rows get sequential ids starting
/// at 1. [`MemoryStore::fail_on_row`] arms a one-shot failure for tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the chunk containing the `n`-th row (0-based, within a batch) of
    /// the next transaction fail.
    pub fn fail_on_row(&self, n: usize) {
        self.lock().fail_on_row = Some(n);
    }

    /// Snapshot of every committed row.
    pub fn rows(&self) -> Vec<StorageRow> {
        self.lock().rows.clone()
    }

    /// Number of committed and rolled back transactions.
    pub fn transactions(&self) -> (usize, usize) {
        let state = self.lock();
        (state.commits, state.rollbacks)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct MemoryTransaction {
    store: MemoryStore,
    staged: Vec<StorageRow>,
    fail_on_row: Option<usize>,
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let fail_on_row = self.lock().fail_on_row.take();
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
            staged: Vec::new(),
            fail_on_row,
        }))
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn insert_chunk(&mut self, rows: &[StorageRow]) -> Result<(), StoreError> {
        let start = self.staged.len();
        if let Some(n) = self.fail_on_row {
            if (start..start + rows.len()).contains(&n) {
                return Err(StoreError::ChunkFailed {
                    offset: start,
                    reason: format!("injected failure at row {}", n),
                });
            }
        }
        self.staged.extend_from_slice(rows);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction { store, staged, .. } = *self;
        let mut state = store.lock();
        for mut row in staged {
            state.next_id += 1;
            row.id = Some(state.next_id);
            state.rows.push(row);
        }
        state.commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.store.lock().rollbacks += 1;
        Ok(())
    }
}
