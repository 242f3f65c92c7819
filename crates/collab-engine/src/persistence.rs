//! Persistence port and the write path around it.
//!
//! The engine keeps authoritative state in memory and hands typed records to a
//! host-supplied [`PersistencePort`]. Writes go through a [`PersistenceWriter`]
//! which queues them in order and retries with bounded exponential backoff. Reads go through a
//! [`BatchLoader`] so the core never issues per-id lookups.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{CollabError, PersistenceConfig, Record, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Document,
    BranchState,
    Version,
    Branch,
    Comment,
    Activity,
}

/// Opaque row as stored by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub kind: EntityKind,
    pub id: Uuid,
    pub document_id: Uuid,
    /// bincode-encoded record
    pub payload: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

impl StoredRow {
    pub fn key(&self) -> (EntityKind, Uuid) {
        (self.kind, self.id)
    }
}

/// Storage interface implemented by the host
#[async_trait]
pub trait PersistencePort: Send + Sync {
    /// Order-preserving lookup; `None` for ids with no row.
    async fn load_by_ids(&self, kind: EntityKind, ids: &[Uuid]) -> Result<Vec<Option<StoredRow>>>;

    async fn create(&self, row: StoredRow) -> Result<()>;

    async fn update(&self, row: StoredRow) -> Result<()>;

    /// Upsert every row or none of them.
    async fn write_batch(&self, rows: Vec<StoredRow>) -> Result<()>;
}

/// In-memory store with failure injection (intended for tests and demos)
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: DashMap<(EntityKind, Uuid), StoredRow>,
    fail_writes: AtomicUsize,
    load_calls: AtomicUsize,
    write_calls: AtomicUsize,
    write_delay_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` write calls fail
    pub fn fail_next_writes(&self, count: usize) {
        self.fail_writes.store(count, Ordering::SeqCst);
    }

    /// Hold every later write call for `delay` before it lands
    pub fn delay_writes(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn write_delay(&self) -> Duration {
        Duration::from_millis(self.write_delay_ms.load(Ordering::SeqCst))
    }

    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn row(&self, kind: EntityKind, id: Uuid) -> Option<StoredRow> {
        self.rows.get(&(kind, id)).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn begin_write(&self) -> Result<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(CollabError::Persistence("injected write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistencePort for MemoryStore {
    async fn load_by_ids(&self, kind: EntityKind, ids: &[Uuid]) -> Result<Vec<Option<StoredRow>>> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        Ok(ids.iter().map(|id| self.row(kind, *id)).collect())
    }

    async fn create(&self, row: StoredRow) -> Result<()> {
        self.begin_write()?;
        if self.rows.contains_key(&row.key()) {
            return Err(CollabError::Persistence(format!(
                "{:?} {} already exists",
                row.kind, row.id
            )));
        }
        self.rows.insert(row.key(), row);
        Ok(())
    }

    async fn update(&self, row: StoredRow) -> Result<()> {
        self.begin_write()?;
        match self.rows.get_mut(&row.key()) {
            Some(mut existing) => {
                *existing = row;
                Ok(())
            }
            None => Err(CollabError::Persistence(format!(
                "{:?} {} does not exist",
                row.kind, row.id
            ))),
        }
    }

    async fn write_batch(&self, rows: Vec<StoredRow>) -> Result<()> {
        let delay = self.write_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.begin_write()?;
        for row in rows {
            self.rows.insert(row.key(), row);
        }
        Ok(())
    }
}

/// Queued write request, handled in submission order by one worker
enum WriteJob {
    Rows(Vec<StoredRow>),
    Strict(Vec<StoredRow>, oneshot::Sender<Result<()>>),
    Flush(oneshot::Sender<Result<usize>>),
    Barrier(oneshot::Sender<()>),
}

struct WriterCore {
    port: Arc<dyn PersistencePort>,
    config: PersistenceConfig,
    dirty: DashMap<(EntityKind, Uuid), StoredRow>,
}

/// Retrying write path with a dirty set for writes that could not land.
///
/// Writes are queued and applied in the order they were enqueued, so callers
/// can hand rows over while holding a document lock and release it without
/// waiting for storage.
pub struct PersistenceWriter {
    core: Arc<WriterCore>,
    queue: mpsc::UnboundedSender<WriteJob>,
    // Taken by the worker on first use
    pending_rx: Mutex<Option<mpsc::UnboundedReceiver<WriteJob>>>,
}

impl WriterCore {
    async fn with_retry<F, Fut>(&self, what: &str, mut attempt_fn: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let attempts = self.config.max_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            let delay = self.config.backoff(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match attempt_fn().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("{} failed (attempt {}/{}): {}", what, attempt, attempts, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| CollabError::Persistence(format!("{} failed", what))))
    }

    fn settle(&self, rows: &[StoredRow]) {
        for row in rows {
            self.dirty
                .remove_if(&row.key(), |_, pending| pending.updated_at <= row.updated_at);
        }
    }

    async fn write_strict(&self, rows: Vec<StoredRow>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let what = format!("batch write of {} rows", rows.len());
        self.with_retry(&what, || self.port.write_batch(rows.clone()))
            .await?;
        self.settle(&rows);
        Ok(())
    }

    /// Tolerant write; rows that cannot land after retries go dirty
    async fn write(&self, rows: Vec<StoredRow>) {
        if rows.is_empty() {
            return;
        }
        let what = format!("batch write of {} rows", rows.len());
        match self
            .with_retry(&what, || self.port.write_batch(rows.clone()))
            .await
        {
            Ok(()) => self.settle(&rows),
            Err(e) => {
                warn!(
                    "Persistence degraded, {} rows marked dirty: {}",
                    rows.len(),
                    e
                );
                for row in rows {
                    self.dirty.insert(row.key(), row);
                }
            }
        }
    }

    async fn flush_dirty(&self) -> Result<usize> {
        let rows: Vec<StoredRow> = self.dirty.iter().map(|r| r.value().clone()).collect();
        if rows.is_empty() {
            return Ok(0);
        }
        let count = rows.len();
        self.with_retry("dirty flush", || self.port.write_batch(rows.clone()))
            .await?;
        self.settle(&rows);
        debug!("Flushed {} dirty rows", count);
        Ok(count)
    }

    async fn run(self: Arc<Self>, mut jobs: mpsc::UnboundedReceiver<WriteJob>) {
        while let Some(job) = jobs.recv().await {
            match job {
                WriteJob::Rows(rows) => self.write(rows).await,
                WriteJob::Strict(rows, done) => {
                    let _ = done.send(self.write_strict(rows).await);
                }
                WriteJob::Flush(done) => {
                    let _ = done.send(self.flush_dirty().await);
                }
                WriteJob::Barrier(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("Persistence writer stopped");
    }
}

impl PersistenceWriter {
    pub fn new(port: Arc<dyn PersistencePort>, config: PersistenceConfig) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        Self {
            core: Arc::new(WriterCore {
                port,
                config,
                dirty: DashMap::new(),
            }),
            queue,
            pending_rx: Mutex::new(Some(rx)),
        }
    }

    fn submit(&self, job: WriteJob) -> Result<()> {
        if let Some(rx) = self.pending_rx.lock().take() {
            tokio::spawn(Arc::clone(&self.core).run(rx));
        }
        self.queue
            .send(job)
            .map_err(|_| CollabError::Persistence("persistence writer stopped".to_string()))
    }

    /// Queue rows for state already committed in memory. Failures after
    /// retries leave the rows dirty for [`flush_dirty`](Self::flush_dirty).
    pub fn enqueue(&self, rows: Vec<StoredRow>) {
        if rows.is_empty() {
            return;
        }
        let count = rows.len();
        if let Err(e) = self.submit(WriteJob::Rows(rows)) {
            warn!("Dropped write of {} rows: {}", count, e);
        }
    }

    /// Atomic batch write that must land before the caller proceeds. Rows
    /// enqueued earlier are written first.
    pub async fn write_strict(&self, rows: Vec<StoredRow>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let (done, landed) = oneshot::channel();
        self.submit(WriteJob::Strict(rows, done))?;
        landed
            .await
            .map_err(|_| CollabError::Persistence("persistence writer stopped".to_string()))?
    }

    /// Wait until every write enqueued so far has been attempted
    pub async fn sync(&self) -> Result<()> {
        let (done, reached) = oneshot::channel();
        self.submit(WriteJob::Barrier(done))?;
        reached
            .await
            .map_err(|_| CollabError::Persistence("persistence writer stopped".to_string()))
    }

    pub fn dirty_count(&self) -> usize {
        self.core.dirty.len()
    }

    pub fn is_dirty(&self, kind: EntityKind, id: Uuid) -> bool {
        self.core.dirty.contains_key(&(kind, id))
    }

    /// Retry every dirty row in one batch after the queued writes; returns
    /// how many landed
    pub async fn flush_dirty(&self) -> Result<usize> {
        let (done, flushed) = oneshot::channel();
        self.submit(WriteJob::Flush(done))?;
        flushed
            .await
            .map_err(|_| CollabError::Persistence("persistence writer stopped".to_string()))?
    }
}

/// Batched reads mapped into typed records at the boundary
#[derive(Clone)]
pub struct BatchLoader {
    port: Arc<dyn PersistencePort>,
}

impl BatchLoader {
    pub fn new(port: Arc<dyn PersistencePort>) -> Self {
        Self { port }
    }

    /// Load every id in one call, keeping input order
    pub async fn load_many<R: Record>(&self, ids: &[Uuid]) -> Result<Vec<Option<R>>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self.port.load_by_ids(R::KIND, ids).await?;
        if rows.len() != ids.len() {
            return Err(CollabError::Persistence(format!(
                "asked for {} {:?} rows, got {}",
                ids.len(),
                R::KIND,
                rows.len()
            )));
        }
        rows.iter()
            .map(|row| row.as_ref().map(R::from_row).transpose())
            .collect()
    }

    /// Like [`load_many`](Self::load_many) but every id must exist
    pub async fn load_all<R: Record>(&self, ids: &[Uuid]) -> Result<Vec<R>> {
        self.load_many::<R>(ids)
            .await?
            .into_iter()
            .zip(ids)
            .map(|(record, id)| record.ok_or_else(|| CollabError::not_found(R::ENTITY, *id)))
            .collect()
    }

    pub async fn load_one<R: Record>(&self, id: Uuid) -> Result<R> {
        let mut records = self.load_all::<R>(&[id]).await?;
        records
            .pop()
            .ok_or_else(|| CollabError::not_found(R::ENTITY, id))
    }
}
