// External collaborator stores.
//
// The relay consumes three backing services: the primary datastore
// (authoritative documents plus dependent response records), the search
// index mirror, and the pending-update store backing the patch queue.
// Each is an enum with a `Postgres` variant for production and a
// `Memory` variant so tests can run several independent stores in one
// process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use formsync_common::types::FormDocument;

use crate::queue::PendingUpdate;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backing store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        StoreError::Unavailable(error.to_string())
    }
}

/// Primary datastore: authoritative form documents and their dependent
/// response records.
#[derive(Clone)]
pub enum DocumentStore {
    Postgres(PgPool),
    Memory(MemoryDocuments),
}

#[derive(Clone, Default)]
pub struct MemoryDocuments {
    docs: Arc<RwLock<HashMap<Uuid, FormDocument>>>,
    response_entries: Arc<RwLock<HashMap<Uuid, Vec<Value>>>>,
    fail_writes: Arc<AtomicBool>,
}

impl DocumentStore {
    pub fn memory() -> Self {
        Self::Memory(MemoryDocuments::default())
    }

    pub async fn get(&self, doc_id: Uuid) -> Result<Option<FormDocument>, StoreError> {
        match self {
            Self::Postgres(pool) => {
                let doc = sqlx::query_scalar::<_, Json<FormDocument>>(
                    "SELECT doc FROM forms WHERE id = $1",
                )
                .bind(doc_id)
                .fetch_optional(pool)
                .await?;
                Ok(doc.map(|json| json.0))
            }
            Self::Memory(store) => Ok(store.docs.read().await.get(&doc_id).cloned()),
        }
    }

    pub async fn insert(&self, doc: FormDocument) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO forms (id, doc, updated) VALUES ($1, $2, now()) \
                     ON CONFLICT (id) DO UPDATE SET doc = EXCLUDED.doc, updated = now()",
                )
                .bind(doc.id)
                .bind(Json(&doc))
                .execute(pool)
                .await?;
                Ok(())
            }
            Self::Memory(store) => {
                store.docs.write().await.insert(doc.id, doc);
                Ok(())
            }
        }
    }

    /// Persist a flushed document: field-set update by id.
    pub async fn write_flushed(&self, doc: &FormDocument) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query("UPDATE forms SET doc = $2, updated = now() WHERE id = $1")
                    .bind(doc.id)
                    .bind(Json(doc))
                    .execute(pool)
                    .await?;
                Ok(())
            }
            Self::Memory(store) => {
                if store.fail_writes.load(Ordering::SeqCst) {
                    return Err(StoreError::Unavailable("memory store write failure".into()));
                }
                store.docs.write().await.insert(doc.id, doc.clone());
                Ok(())
            }
        }
    }

    pub async fn delete(&self, doc_id: Uuid) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query("DELETE FROM forms WHERE id = $1").bind(doc_id).execute(pool).await?;
                Ok(())
            }
            Self::Memory(store) => {
                store.docs.write().await.remove(&doc_id);
                Ok(())
            }
        }
    }

    /// Cascade-delete dependent response records for a form.
    pub async fn delete_response_entries(&self, form_id: Uuid) -> Result<u64, StoreError> {
        match self {
            Self::Postgres(pool) => {
                let result = sqlx::query("DELETE FROM response_entries WHERE form_id = $1")
                    .bind(form_id)
                    .execute(pool)
                    .await?;
                Ok(result.rows_affected())
            }
            Self::Memory(store) => {
                let removed = store.response_entries.write().await.remove(&form_id);
                Ok(removed.map(|entries| entries.len() as u64).unwrap_or(0))
            }
        }
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub async fn insert_response_entry(&self, form_id: Uuid, entry: Value) {
        if let Self::Memory(store) = self {
            store.response_entries.write().await.entry(form_id).or_default().push(entry);
        }
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub async fn response_entry_count(&self, form_id: Uuid) -> usize {
        match self {
            Self::Memory(store) => {
                store.response_entries.read().await.get(&form_id).map_or(0, Vec::len)
            }
            Self::Postgres(_) => 0,
        }
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn set_fail_writes(&self, fail: bool) {
        if let Self::Memory(store) = self {
            store.fail_writes.store(fail, Ordering::SeqCst);
        }
    }
}

/// Search index mirror: receives partial-document updates on flush.
#[derive(Clone)]
pub enum SearchIndex {
    Postgres(PgPool),
    Memory(MemorySearchIndex),
}

#[derive(Clone, Default)]
pub struct MemorySearchIndex {
    entries: Arc<RwLock<HashMap<Uuid, Value>>>,
    fail_writes: Arc<AtomicBool>,
}

impl SearchIndex {
    pub fn memory() -> Self {
        Self::Memory(MemorySearchIndex::default())
    }

    /// Merge `fields` into the indexed document (partial update by id).
    pub async fn update_partial(&self, doc_id: Uuid, fields: &Value) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO form_search (id, fields) VALUES ($1, $2) \
                     ON CONFLICT (id) DO UPDATE SET fields = form_search.fields || EXCLUDED.fields",
                )
                .bind(doc_id)
                .bind(Json(fields))
                .execute(pool)
                .await?;
                Ok(())
            }
            Self::Memory(index) => {
                if index.fail_writes.load(Ordering::SeqCst) {
                    return Err(StoreError::Unavailable("memory index write failure".into()));
                }
                let mut entries = index.entries.write().await;
                let entry = entries.entry(doc_id).or_insert_with(|| Value::Object(Default::default()));
                if let (Value::Object(existing), Value::Object(incoming)) = (entry, fields) {
                    for (key, value) in incoming {
                        existing.insert(key.clone(), value.clone());
                    }
                }
                Ok(())
            }
        }
    }

    pub async fn delete(&self, doc_id: Uuid) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query("DELETE FROM form_search WHERE id = $1")
                    .bind(doc_id)
                    .execute(pool)
                    .await?;
                Ok(())
            }
            Self::Memory(index) => {
                index.entries.write().await.remove(&doc_id);
                Ok(())
            }
        }
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub async fn indexed_fields(&self, doc_id: Uuid) -> Option<Value> {
        match self {
            Self::Memory(index) => index.entries.read().await.get(&doc_id).cloned(),
            Self::Postgres(_) => None,
        }
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn set_fail_writes(&self, fail: bool) {
        if let Self::Memory(index) = self {
            index.fail_writes.store(fail, Ordering::SeqCst);
        }
    }
}

/// Pending-update store: one opaque buffer per document with a
/// take-and-clear primitive.
#[derive(Clone)]
pub enum PendingStore {
    Postgres(PgPool),
    Memory(MemoryPending),
}

#[derive(Clone, Default)]
pub struct MemoryPending {
    buffers: Arc<RwLock<HashMap<Uuid, PendingUpdate>>>,
    fail_writes: Arc<AtomicBool>,
}

impl PendingStore {
    pub fn memory() -> Self {
        Self::Memory(MemoryPending::default())
    }

    pub async fn get(&self, doc_id: Uuid) -> Result<Option<PendingUpdate>, StoreError> {
        match self {
            Self::Postgres(pool) => {
                let buffer = sqlx::query_scalar::<_, Json<PendingUpdate>>(
                    "SELECT payload FROM pending_updates WHERE doc_id = $1",
                )
                .bind(doc_id)
                .fetch_optional(pool)
                .await?;
                Ok(buffer.map(|json| json.0))
            }
            Self::Memory(store) => Ok(store.buffers.read().await.get(&doc_id).cloned()),
        }
    }

    /// Read-modify-write the buffer under a per-document lock.
    ///
    /// The closure sees the current buffer (or `None`) and returns the
    /// replacement; no concurrent `update` or `take` for the same
    /// document can interleave between the read and the write. On
    /// Postgres the row is locked with `SELECT ... FOR UPDATE` inside
    /// one transaction, so the guarantee holds across process
    /// instances; the memory variant holds its write lock across the
    /// closure.
    pub async fn update<F>(&self, doc_id: Uuid, f: F) -> Result<PendingUpdate, StoreError>
    where
        F: FnOnce(Option<PendingUpdate>) -> PendingUpdate,
    {
        match self {
            Self::Postgres(pool) => {
                let mut tx = pool.begin().await?;
                // Ensure the row exists so FOR UPDATE has something to
                // lock; concurrent writers then serialize on it.
                sqlx::query(
                    "INSERT INTO pending_updates (doc_id, payload) VALUES ($1, '{}'::jsonb) \
                     ON CONFLICT (doc_id) DO NOTHING",
                )
                .bind(doc_id)
                .execute(&mut *tx)
                .await?;
                let current = sqlx::query_scalar::<_, Json<PendingUpdate>>(
                    "SELECT payload FROM pending_updates WHERE doc_id = $1 FOR UPDATE",
                )
                .bind(doc_id)
                .fetch_one(&mut *tx)
                .await?
                .0;
                let current = if current.is_empty() { None } else { Some(current) };
                let replacement = f(current);
                sqlx::query("UPDATE pending_updates SET payload = $2 WHERE doc_id = $1")
                    .bind(doc_id)
                    .bind(Json(&replacement))
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok(replacement)
            }
            Self::Memory(store) => {
                if store.fail_writes.load(Ordering::SeqCst) {
                    return Err(StoreError::Unavailable("memory pending store write failure".into()));
                }
                let mut buffers = store.buffers.write().await;
                let replacement = f(buffers.get(&doc_id).cloned());
                buffers.insert(doc_id, replacement.clone());
                Ok(replacement)
            }
        }
    }

    pub async fn put(&self, doc_id: Uuid, buffer: &PendingUpdate) -> Result<(), StoreError> {
        match self {
            Self::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO pending_updates (doc_id, payload) VALUES ($1, $2) \
                     ON CONFLICT (doc_id) DO UPDATE SET payload = EXCLUDED.payload",
                )
                .bind(doc_id)
                .bind(Json(buffer))
                .execute(pool)
                .await?;
                Ok(())
            }
            Self::Memory(store) => {
                if store.fail_writes.load(Ordering::SeqCst) {
                    return Err(StoreError::Unavailable("memory pending store write failure".into()));
                }
                store.buffers.write().await.insert(doc_id, buffer.clone());
                Ok(())
            }
        }
    }

    /// Atomically read the buffer and reset it to empty.
    pub async fn take(&self, doc_id: Uuid) -> Result<Option<PendingUpdate>, StoreError> {
        match self {
            Self::Postgres(pool) => {
                let buffer = sqlx::query_scalar::<_, Json<PendingUpdate>>(
                    "DELETE FROM pending_updates WHERE doc_id = $1 RETURNING payload",
                )
                .bind(doc_id)
                .fetch_optional(pool)
                .await?;
                Ok(buffer.map(|json| json.0))
            }
            Self::Memory(store) => Ok(store.buffers.write().await.remove(&doc_id)),
        }
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn set_fail_writes(&self, fail: bool) {
        if let Self::Memory(store) = self {
            store.fail_writes.store(fail, Ordering::SeqCst);
        }
    }
}
