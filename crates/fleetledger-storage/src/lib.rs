//! Document store abstraction, transactional counters and bounded batch writes for Fleet Ledger.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use fleetledger_core::{
    apply_field_writes, BillingCalendar, DocKey, Document, FieldWrite, SequenceKey, COUNTERS,
};
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "fleetledger-storage";

/// Hard per-commit operation ceiling of the backing store.
pub const STORE_BATCH_CEILING: usize = 500;
/// Default operations per commit, kept below the ceiling.
pub const DEFAULT_MAX_BATCH_OPS: usize = 490;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("write conflict on {key}")]
    Conflict { key: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },
    #[error("document {key} not found")]
    NotFound { key: String },
    #[error("transaction on {key} aborted: {reason}")]
    Aborted { key: String, reason: String },
    #[error("batch of {ops} operations exceeds limit {limit}")]
    BatchTooLarge { ops: usize, limit: usize },
    #[error("write rejected for {key}")]
    Rejected { key: String },
    #[error(transparent)]
    Database(sqlx::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

impl StoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            StoreError::Conflict { .. } | StoreError::Unavailable(_) | StoreError::Timeout { .. } => {
                RetryDisposition::Retryable
            }
            _ => RetryDisposition::NonRetryable,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db_err) = err.as_database_error() {
            // serialization_failure, deadlock_detected
            if matches!(db_err.code().as_deref(), Some("40001") | Some("40P01")) {
                return StoreError::Conflict {
                    key: db_err.table().unwrap_or("documents").to_string(),
                };
            }
        }
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(err.to_string())
            }
            other => StoreError::Database(other),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Bound a store call by `timeout`.
pub async fn timed<T, F>(timeout: Duration, operation: &str, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout {
            operation: operation.to_string(),
            timeout,
        }),
    }
}

/// Result of a transaction body.
#[derive(Debug, Clone, PartialEq)]
pub enum TxDecision {
    Write(Document),
    Abort(String),
}

/// Transaction body: sees the current document (if any), decides the new one.
/// May run more than once when the store retries internally.
pub type TxBody<'a> = &'a (dyn Fn(Option<&Document>) -> TxDecision + Send + Sync);

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Create or fully replace a document.
    Set { key: DocKey, body: Document },
    /// Patch fields of an existing document.
    Update {
        key: DocKey,
        fields: BTreeMap<String, FieldWrite>,
    },
}

impl WriteOp {
    pub fn key(&self) -> &DocKey {
        match self {
            WriteOp::Set { key, .. } | WriteOp::Update { key, .. } => key,
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, key: &DocKey) -> StoreResult<Option<Document>>;

    /// Full scan of a collection.
    async fn list(&self, collection: &str) -> StoreResult<Vec<(String, Document)>>;

    /// Documents whose top-level `field` equals `value`.
    async fn query_eq(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> StoreResult<Vec<(String, Document)>>;

    /// Atomic read-modify-write of one document; returns the committed body.
    async fn transact(&self, key: &DocKey, body: TxBody<'_>) -> StoreResult<Document>;

    /// Apply all ops atomically, or none.
    async fn commit_batch(&self, ops: &[WriteOp]) -> StoreResult<()>;

    fn max_batch_ops(&self) -> usize {
        STORE_BATCH_CEILING
    }
}

/// In-process store used for dry runs, seeded runs and tests.
///
/// Transactions lock only their own document; batch commits that race a
/// transaction on the same key are not detected.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<BTreeMap<String, BTreeMap<String, Document>>>,
    tx_locks: Mutex<HashMap<DocKey, Arc<Mutex<()>>>>,
    transient_commit_failures: AtomicUsize,
    rejected_keys: Mutex<HashSet<DocKey>>,
    failing_queries: Mutex<HashSet<(String, String)>>,
    commits: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from `{"collection": {"id": {..document..}}}`.
    pub fn from_snapshot(snapshot: &Value) -> anyhow::Result<Self> {
        let root = snapshot
            .as_object()
            .context("snapshot root must be an object of collections")?;
        let mut collections = BTreeMap::new();
        for (collection, docs) in root {
            let docs = docs
                .as_object()
                .with_context(|| format!("collection {collection} must be an object of documents"))?;
            let mut entries = BTreeMap::new();
            for (id, body) in docs {
                let body = body
                    .as_object()
                    .with_context(|| format!("document {collection}/{id} must be an object"))?;
                entries.insert(id.clone(), body.clone());
            }
            collections.insert(collection.clone(), entries);
        }
        Ok(Self {
            collections: RwLock::new(collections),
            ..Default::default()
        })
    }

    pub async fn snapshot(&self) -> Value {
        let collections = self.collections.read().await;
        let mut root = serde_json::Map::new();
        for (collection, docs) in collections.iter() {
            let docs = docs
                .iter()
                .map(|(id, body)| (id.clone(), Value::Object(body.clone())))
                .collect::<serde_json::Map<_, _>>();
            root.insert(collection.clone(), Value::Object(docs));
        }
        Value::Object(root)
    }

    pub async fn insert(&self, collection: &str, id: &str, body: Value) {
        let body = match body {
            Value::Object(map) => map,
            _ => Document::new(),
        };
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), body);
    }

    pub async fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    /// Number of successful batch commits.
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Make the next `n` batch commits fail with a retryable error.
    pub fn fail_next_commits(&self, n: usize) {
        self.transient_commit_failures.store(n, Ordering::SeqCst);
    }

    /// Reject every batch containing a write to `key`.
    pub async fn reject_writes_to(&self, key: DocKey) {
        self.rejected_keys.lock().await.insert(key);
    }

    /// Fail `query_eq` for a specific field/value pair.
    pub async fn fail_queries_for(&self, field: &str, value: &str) {
        self.failing_queries
            .lock()
            .await
            .insert((field.to_string(), value.to_string()));
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, key: &DocKey) -> StoreResult<Option<Document>> {
        Ok(self
            .collections
            .read()
            .await
            .get(&key.collection)
            .and_then(|docs| docs.get(&key.id))
            .cloned())
    }

    async fn list(&self, collection: &str) -> StoreResult<Vec<(String, Document)>> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .map(|docs| docs.iter().map(|(id, d)| (id.clone(), d.clone())).collect())
            .unwrap_or_default())
    }

    async fn query_eq(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> StoreResult<Vec<(String, Document)>> {
        let target = (field.to_string(), value.as_str().unwrap_or_default().to_string());
        if self.failing_queries.lock().await.contains(&target) {
            return Err(StoreError::Unavailable(format!(
                "query {collection}.{field} == {value} failed"
            )));
        }
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, d)| d.get(field) == Some(value))
                    .map(|(id, d)| (id.clone(), d.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn transact(&self, key: &DocKey, body: TxBody<'_>) -> StoreResult<Document> {
        let lock = Arc::clone(self.tx_locks.lock().await.entry(key.clone()).or_default());
        let _held = lock.lock().await;
        let current = self
            .collections
            .read()
            .await
            .get(&key.collection)
            .and_then(|docs| docs.get(&key.id))
            .cloned();
        match body(current.as_ref()) {
            TxDecision::Write(doc) => {
                self.collections
                    .write()
                    .await
                    .entry(key.collection.clone())
                    .or_default()
                    .insert(key.id.clone(), doc.clone());
                Ok(doc)
            }
            TxDecision::Abort(reason) => Err(StoreError::Aborted {
                key: key.to_string(),
                reason,
            }),
        }
    }

    async fn commit_batch(&self, ops: &[WriteOp]) -> StoreResult<()> {
        if ops.len() > self.max_batch_ops() {
            return Err(StoreError::BatchTooLarge {
                ops: ops.len(),
                limit: self.max_batch_ops(),
            });
        }
        let pending_failures = self.transient_commit_failures.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.transient_commit_failures
                .store(pending_failures - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("injected commit failure".to_string()));
        }
        {
            let rejected = self.rejected_keys.lock().await;
            if let Some(op) = ops.iter().find(|op| rejected.contains(op.key())) {
                return Err(StoreError::Rejected {
                    key: op.key().to_string(),
                });
            }
        }

        let mut collections = self.collections.write().await;
        // Validate first so a failing op leaves nothing applied.
        for op in ops {
            if let WriteOp::Update { key, .. } = op {
                let exists = collections
                    .get(&key.collection)
                    .is_some_and(|docs| docs.contains_key(&key.id));
                if !exists {
                    return Err(StoreError::NotFound {
                        key: key.to_string(),
                    });
                }
            }
        }
        for op in ops {
            match op {
                WriteOp::Set { key, body } => {
                    collections
                        .entry(key.collection.clone())
                        .or_default()
                        .insert(key.id.clone(), body.clone());
                }
                WriteOp::Update { key, fields } => {
                    if let Some(doc) = collections
                        .get_mut(&key.collection)
                        .and_then(|docs| docs.get_mut(&key.id))
                    {
                        apply_field_writes(doc, fields);
                    }
                }
            }
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// PostgreSQL-backed store keeping each document as a JSONB row.
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running documents schema migrations")
    }

    fn rows_to_documents(rows: Vec<sqlx::postgres::PgRow>) -> StoreResult<Vec<(String, Document)>> {
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let body: Json<Document> = row.try_get("body")?;
            out.push((id, body.0));
        }
        Ok(out)
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn get(&self, key: &DocKey) -> StoreResult<Option<Document>> {
        let row = sqlx::query(
            "SELECT body FROM documents WHERE collection = $1 AND id = $2 AND body IS NOT NULL",
        )
        .bind(&key.collection)
        .bind(&key.id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => {
                let body: Json<Document> = row.try_get("body")?;
                Ok(Some(body.0))
            }
            None => Ok(None),
        }
    }

    async fn list(&self, collection: &str) -> StoreResult<Vec<(String, Document)>> {
        let rows = sqlx::query(
            "SELECT id, body FROM documents WHERE collection = $1 AND body IS NOT NULL ORDER BY id",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;
        Self::rows_to_documents(rows)
    }

    async fn query_eq(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> StoreResult<Vec<(String, Document)>> {
        let rows = sqlx::query(
            r#"
            SELECT id, body
              FROM documents
             WHERE collection = $1
               AND body IS NOT NULL
               AND body @> jsonb_build_object($2::text, $3::jsonb)
             ORDER BY id
            "#,
        )
        .bind(collection)
        .bind(field)
        .bind(Json(value))
        .fetch_all(&self.pool)
        .await?;
        Self::rows_to_documents(rows)
    }

    async fn transact(&self, key: &DocKey, body: TxBody<'_>) -> StoreResult<Document> {
        let mut tx = self.pool.begin().await?;
        // Materialize the row so FOR UPDATE has something to lock on first use.
        sqlx::query(
            "INSERT INTO documents (collection, id, body) VALUES ($1, $2, NULL) ON CONFLICT (collection, id) DO NOTHING",
        )
        .bind(&key.collection)
        .bind(&key.id)
        .execute(&mut *tx)
        .await?;
        let row = sqlx::query("SELECT body FROM documents WHERE collection = $1 AND id = $2 FOR UPDATE")
            .bind(&key.collection)
            .bind(&key.id)
            .fetch_one(&mut *tx)
            .await?;
        let current: Option<Json<Document>> = row.try_get("body")?;

        match body(current.as_ref().map(|c| &c.0)) {
            TxDecision::Write(doc) => {
                sqlx::query(
                    "UPDATE documents SET body = $3, updated_at = now() WHERE collection = $1 AND id = $2",
                )
                .bind(&key.collection)
                .bind(&key.id)
                .bind(Json(&doc))
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                Ok(doc)
            }
            TxDecision::Abort(reason) => {
                tx.rollback().await?;
                Err(StoreError::Aborted {
                    key: key.to_string(),
                    reason,
                })
            }
        }
    }

    async fn commit_batch(&self, ops: &[WriteOp]) -> StoreResult<()> {
        if ops.len() > self.max_batch_ops() {
            return Err(StoreError::BatchTooLarge {
                ops: ops.len(),
                limit: self.max_batch_ops(),
            });
        }
        let mut tx = self.pool.begin().await?;
        for op in ops {
            match op {
                WriteOp::Set { key, body } => {
                    sqlx::query(
                        r#"
                        INSERT INTO documents (collection, id, body)
                        VALUES ($1, $2, $3)
                        ON CONFLICT (collection, id)
                        DO UPDATE SET body = EXCLUDED.body, updated_at = now()
                        "#,
                    )
                    .bind(&key.collection)
                    .bind(&key.id)
                    .bind(Json(body))
                    .execute(&mut *tx)
                    .await?;
                }
                WriteOp::Update { key, fields } => {
                    let mut patch = Document::new();
                    let mut deletes = Vec::new();
                    for (field, write) in fields {
                        match write {
                            FieldWrite::Set(value) => {
                                patch.insert(field.clone(), value.clone());
                            }
                            FieldWrite::Delete => deletes.push(field.clone()),
                        }
                    }
                    let result = sqlx::query(
                        r#"
                        UPDATE documents
                           SET body = (body || $3) - $4::text[],
                               updated_at = now()
                         WHERE collection = $1 AND id = $2 AND body IS NOT NULL
                        "#,
                    )
                    .bind(&key.collection)
                    .bind(&key.id)
                    .bind(Json(&patch))
                    .bind(deletes.as_slice())
                    .execute(&mut *tx)
                    .await?;
                    if result.rows_affected() == 0 {
                        tx.rollback().await?;
                        return Err(StoreError::NotFound {
                            key: key.to_string(),
                        });
                    }
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Monotonic per-scope counter backed by single-document transactions.
#[derive(Clone)]
pub struct SequenceCounter {
    store: Arc<dyn DocumentStore>,
    collection: String,
    backoff: BackoffPolicy,
    timeout: Duration,
}

impl SequenceCounter {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            collection: COUNTERS.to_string(),
            backoff: BackoffPolicy::default(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Increment `scope` and return the new value.
    ///
    /// Only write conflicts are retried: after a timeout the transaction may
    /// have committed, so the error goes to the caller instead.
    pub async fn next_value(&self, scope: &str) -> StoreResult<u64> {
        let key = DocKey::new(&self.collection, scope);
        let increment = |current: Option<&Document>| {
            let mut state = SequenceKey::from_document(scope, current);
            match state.count.checked_add(1) {
                Some(next) => {
                    state.count = next;
                    TxDecision::Write(state.to_document())
                }
                None => TxDecision::Abort("counter overflow".to_string()),
            }
        };

        let mut attempt = 0;
        loop {
            let result = timed(
                self.timeout,
                "sequence transaction",
                self.store.transact(&key, &increment),
            )
            .await;
            match result {
                Ok(doc) => return Ok(SequenceKey::from_document(scope, Some(&doc)).count),
                Err(err @ StoreError::Conflict { .. }) if attempt < self.backoff.max_retries => {
                    warn!(scope, attempt, error = %err, "sequence transaction conflict; retrying");
                    tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Folio {
    pub scope: String,
    pub sequence: u64,
    pub folio: String,
}

pub fn folio_scope(day: NaiveDate) -> String {
    format!("folio_{}", day.format("%y%m%d"))
}

/// Day-scoped human-readable order identifiers (`YYMMDD-0001`).
#[derive(Clone)]
pub struct FolioAssigner {
    counter: SequenceCounter,
    calendar: BillingCalendar,
    width: usize,
}

impl FolioAssigner {
    pub fn new(counter: SequenceCounter, calendar: BillingCalendar, width: usize) -> Self {
        Self {
            counter,
            calendar,
            width: width.max(1),
        }
    }

    pub async fn assign(&self, created_at: DateTime<Utc>) -> StoreResult<Folio> {
        let day = self.calendar.day_of(created_at);
        let scope = folio_scope(day);
        let sequence = self.counter.next_value(&scope).await?;
        let folio = format!(
            "{}-{:0width$}",
            day.format("%y%m%d"),
            sequence,
            width = self.width
        );
        Ok(Folio {
            scope,
            sequence,
            folio,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchProgress {
    pub committed_batches: usize,
    pub committed_ops: usize,
    pub failed_batches: usize,
    pub failed_ops: usize,
    pub failed_keys: Vec<DocKey>,
    pub dry_run_ops: usize,
}

/// Buffers writes and commits them in groups no larger than the store allows.
pub struct BatchWriter {
    store: Arc<dyn DocumentStore>,
    max_ops: usize,
    backoff: BackoffPolicy,
    timeout: Duration,
    dry_run: bool,
    pending: Vec<WriteOp>,
    progress: BatchProgress,
}

impl BatchWriter {
    pub fn new(store: Arc<dyn DocumentStore>, max_ops: usize) -> StoreResult<Self> {
        let limit = store.max_batch_ops().min(STORE_BATCH_CEILING);
        if max_ops == 0 || max_ops > limit {
            return Err(StoreError::BatchTooLarge { ops: max_ops, limit });
        }
        Ok(Self {
            store,
            max_ops,
            backoff: BackoffPolicy::default(),
            timeout: Duration::from_secs(10),
            dry_run: false,
            pending: Vec::with_capacity(max_ops),
            progress: BatchProgress::default(),
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn progress(&self) -> &BatchProgress {
        &self.progress
    }

    pub async fn push(&mut self, op: WriteOp) {
        self.pending.push(op);
        if self.pending.len() >= self.max_ops {
            self.flush().await;
        }
    }

    /// Commit everything pending as one group. Returns whether it committed.
    pub async fn flush(&mut self) -> bool {
        if self.pending.is_empty() {
            return true;
        }
        let ops = std::mem::take(&mut self.pending);
        if self.dry_run {
            self.progress.dry_run_ops += ops.len();
            return true;
        }

        let batch_no = self.progress.committed_batches + self.progress.failed_batches + 1;
        let span = info_span!("batch_commit", batch_no, ops = ops.len());
        let outcome = self.commit_with_retry(&ops).instrument(span).await;
        match outcome {
            Ok(()) => {
                self.progress.committed_batches += 1;
                self.progress.committed_ops += ops.len();
                true
            }
            Err(err) => {
                error!(batch_no, error = %err, "batch commit failed; group reported as failed");
                self.progress.failed_batches += 1;
                self.progress.failed_ops += ops.len();
                self.progress
                    .failed_keys
                    .extend(ops.into_iter().map(|op| op.key().clone()));
                false
            }
        }
    }

    async fn commit_with_retry(&self, ops: &[WriteOp]) -> StoreResult<()> {
        let mut attempt = 0;
        loop {
            match timed(self.timeout, "batch commit", self.store.commit_batch(ops)).await {
                Ok(()) => return Ok(()),
                Err(err)
                    if err.disposition() == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries =>
                {
                    warn!(attempt, error = %err, "batch commit failed; retrying as a unit");
                    tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn finish(mut self) -> BatchProgress {
        self.flush().await;
        self.progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn set_op(id: &str) -> WriteOp {
        WriteOp::Set {
            key: DocKey::new("charges", id),
            body: json!({"amount": 1}).as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn sequential_calls_return_consecutive_values() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let counter = SequenceCounter::new(store);
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(counter.next_value("folio_250115").await.expect("next"));
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
        assert_eq!(counter.next_value("folio_250116").await.expect("next"), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_never_share_a_value() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let counter = SequenceCounter::new(store);
        let handles = (0..64)
            .map(|_| {
                let counter = counter.clone();
                tokio::spawn(async move { counter.next_value("folio_250115").await })
            })
            .collect::<Vec<_>>();
        let mut values = Vec::new();
        for handle in handles {
            values.push(handle.await.expect("join").expect("next"));
        }
        values.sort_unstable();
        assert_eq!(values, (1..=64).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn folio_is_scoped_by_local_day_and_zero_padded() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let calendar = BillingCalendar::from_utc_offset_minutes(-360).expect("offset");
        let assigner = FolioAssigner::new(SequenceCounter::new(store), calendar, 4);
        // 02:00 UTC on the 16th is still the 15th at UTC-6.
        let created = Utc.with_ymd_and_hms(2025, 1, 16, 2, 0, 0).single().expect("ts");
        let first = assigner.assign(created).await.expect("folio");
        let second = assigner.assign(created).await.expect("folio");
        assert_eq!(first.scope, "folio_250115");
        assert_eq!(first.folio, "250115-0001");
        assert_eq!(second.folio, "250115-0002");
    }

    #[tokio::test]
    async fn aborted_transaction_leaves_document_untouched() {
        let store = MemoryStore::new();
        store.insert("counters", "x", json!({"count": 7})).await;
        let key = DocKey::new("counters", "x");
        let err = store
            .transact(&key, &|_| TxDecision::Abort("nope".into()))
            .await
            .expect_err("abort");
        assert!(matches!(err, StoreError::Aborted { .. }));
        let doc = store.get(&key).await.expect("get").expect("doc");
        assert_eq!(doc.get("count"), Some(&json!(7)));
    }

    #[tokio::test]
    async fn transaction_on_one_scope_does_not_wait_on_another() {
        let store = Arc::new(MemoryStore::new());
        let busy = DocKey::new("counters", "folio_250115");
        let held = Arc::clone(store.tx_locks.lock().await.entry(busy.clone()).or_default());
        let _guard = held.lock().await;

        let counter = SequenceCounter::new(store.clone() as Arc<dyn DocumentStore>)
            .with_timeout(Duration::from_millis(200));
        assert_eq!(counter.next_value("folio_250116").await.expect("other scope"), 1);

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            store.transact(&busy, &|_| TxDecision::Abort("unreachable".into())),
        )
        .await;
        assert!(blocked.is_err(), "same scope must wait for the holder");
    }

    #[tokio::test]
    async fn writer_splits_work_into_bounded_batches() {
        let store = Arc::new(MemoryStore::new());
        let mut writer = BatchWriter::new(store.clone(), 3).expect("writer");
        for i in 0..8 {
            writer.push(set_op(&format!("c{i}"))).await;
        }
        let progress = writer.finish().await;
        assert_eq!(progress.committed_batches, 3);
        assert_eq!(progress.committed_ops, 8);
        assert_eq!(store.commits(), 3);
        assert_eq!(store.count("charges").await, 8);
    }

    #[tokio::test]
    async fn transient_commit_failure_is_retried_as_a_unit() {
        let store = Arc::new(MemoryStore::new());
        store.fail_next_commits(2);
        let mut writer = BatchWriter::new(store.clone(), 10)
            .expect("writer")
            .with_backoff(BackoffPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            });
        writer.push(set_op("a")).await;
        writer.push(set_op("b")).await;
        let progress = writer.finish().await;
        assert_eq!(progress.committed_ops, 2);
        assert_eq!(progress.failed_ops, 0);
    }

    #[tokio::test]
    async fn rejected_batch_is_reported_and_later_batches_continue() {
        let store = Arc::new(MemoryStore::new());
        store.reject_writes_to(DocKey::new("charges", "c1")).await;
        let mut writer = BatchWriter::new(store.clone(), 2)
            .expect("writer")
            .with_backoff(BackoffPolicy::none());
        for i in 0..4 {
            writer.push(set_op(&format!("c{i}"))).await;
        }
        let progress = writer.finish().await;
        assert_eq!(progress.failed_batches, 1);
        assert_eq!(progress.failed_ops, 2);
        assert_eq!(progress.committed_ops, 2);
        assert!(progress.failed_keys.contains(&DocKey::new("charges", "c0")));
        assert_eq!(store.count("charges").await, 2);
    }

    #[tokio::test]
    async fn update_applies_sets_and_deletes() {
        let store = MemoryStore::new();
        store
            .insert("services", "s1", json!({"asesor": "Ana", "total": 10}))
            .await;
        let mut fields = BTreeMap::new();
        fields.insert("advisorName".to_string(), FieldWrite::Set(json!("Ana")));
        fields.insert("asesor".to_string(), FieldWrite::Delete);
        store
            .commit_batch(&[WriteOp::Update {
                key: DocKey::new("services", "s1"),
                fields,
            }])
            .await
            .expect("commit");
        let doc = store
            .get(&DocKey::new("services", "s1"))
            .await
            .expect("get")
            .expect("doc");
        assert_eq!(doc.get("advisorName"), Some(&json!("Ana")));
        assert!(!doc.contains_key("asesor"));
    }

    #[test]
    fn writer_rejects_ceiling_violations() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        assert!(BatchWriter::new(store.clone(), 0).is_err());
        assert!(BatchWriter::new(store.clone(), 501).is_err());
        assert!(BatchWriter::new(store, 490).is_ok());
    }

    #[tokio::test]
    async fn dry_run_counts_without_committing() {
        let store = Arc::new(MemoryStore::new());
        let mut writer = BatchWriter::new(store.clone(), 2).expect("writer").with_dry_run(true);
        writer.push(set_op("a")).await;
        writer.push(set_op("b")).await;
        writer.push(set_op("c")).await;
        let progress = writer.finish().await;
        assert_eq!(progress.dry_run_ops, 3);
        assert_eq!(store.commits(), 0);
        assert_eq!(store.count("charges").await, 0);
    }
}
