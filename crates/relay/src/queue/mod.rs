// Patch queue: the per-document pending-update buffer.
//
// Each document has at most one buffer in the pending store. Edits
// merge into it (last-writer-wins scalars, append-only patch logs);
// the flush scheduler drains it as a whole. The buffer is always read
// and replaced atomically, so a drain observes a consistent snapshot
// and edits racing in after the drain start the next cycle's buffer.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use formsync_common::patch::ListPatch;
use formsync_common::types::{AccessLevel, EditRequest, FileAttachment, FormItem};

use crate::store::{PendingStore, StoreError};

/// Accumulated not-yet-flushed state for one document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PendingUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multiple: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public: Option<AccessLevel>,
    #[serde(default)]
    pub responses_delta: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<ListPatch<FormItem>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<ListPatch<FileAttachment>>,
}

impl PendingUpdate {
    /// Merge a newly submitted edit into this buffer.
    ///
    /// Scalar fields are last-writer-wins; list patches append to the
    /// field's patch log in arrival order.
    pub fn merge_edit(&mut self, edit: EditRequest) {
        if let Some(name) = edit.name {
            self.name = Some(name);
        }
        if let Some(multiple) = edit.multiple {
            self.multiple = Some(multiple);
        }
        if let Some(public) = edit.public {
            self.public = Some(public);
        }
        if let Some(delta) = edit.responses_delta {
            self.responses_delta += delta;
        }
        self.items.extend(edit.items);
        self.files.extend(edit.files);
    }

    /// Merge a buffer that was enqueued *after* this one was drained.
    ///
    /// Used on flush failure: the drained buffer goes back under
    /// whatever accumulated since, so newer scalar writes still win
    /// and newer patches still apply after older ones.
    pub fn merge_newer(mut self, newer: PendingUpdate) -> PendingUpdate {
        if newer.name.is_some() {
            self.name = newer.name;
        }
        if newer.multiple.is_some() {
            self.multiple = newer.multiple;
        }
        if newer.public.is_some() {
            self.public = newer.public;
        }
        self.responses_delta += newer.responses_delta;
        self.items.extend(newer.items);
        self.files.extend(newer.files);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.multiple.is_none()
            && self.public.is_none()
            && self.responses_delta == 0
            && self.items.is_empty()
            && self.files.is_empty()
    }
}

impl From<EditRequest> for PendingUpdate {
    fn from(edit: EditRequest) -> Self {
        let mut update = PendingUpdate::default();
        update.merge_edit(edit);
        update
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// The backing store is down; the edit was NOT durably recorded
    /// and the caller must surface the failure to the client.
    #[error("pending-update buffer unavailable: {0}")]
    BufferUnavailable(#[source] StoreError),
}

/// Durable, keyed buffer of pending patches, one buffer per document.
#[derive(Clone)]
pub struct PatchQueue {
    store: PendingStore,
}

impl PatchQueue {
    pub fn new(store: PendingStore) -> Self {
        Self { store }
    }

    /// Merge `edit` into the document's buffer, creating it if absent.
    ///
    /// The merge runs under the store's per-document lock, so
    /// concurrent enqueues for one document serialize instead of
    /// overwriting each other's snapshot. Returns the merged buffer so
    /// callers can render an optimistic view of everything still
    /// pending.
    pub async fn enqueue(
        &self,
        doc_id: Uuid,
        edit: EditRequest,
    ) -> Result<PendingUpdate, QueueError> {
        self.store
            .update(doc_id, |buffer| {
                let mut buffer = buffer.unwrap_or_default();
                buffer.merge_edit(edit);
                buffer
            })
            .await
            .map_err(QueueError::BufferUnavailable)
    }

    /// Atomically take the document's buffer, leaving it empty.
    ///
    /// Edits arriving after the take start a fresh buffer for the next
    /// flush cycle; edits before it are part of the returned snapshot.
    pub async fn drain_and_clear(&self, doc_id: Uuid) -> Result<Option<PendingUpdate>, QueueError> {
        self.store.take(doc_id).await.map_err(QueueError::BufferUnavailable)
    }

    /// Put a drained buffer back after a failed flush.
    ///
    /// Anything enqueued since the drain merges *over* the returned
    /// buffer, preserving enqueue order across the retry. The merge
    /// holds the same per-document lock as `enqueue`, so an edit
    /// racing in mid-requeue is never lost or duplicated.
    pub async fn requeue(&self, doc_id: Uuid, drained: PendingUpdate) -> Result<(), QueueError> {
        let result = self
            .store
            .update(doc_id, |newer| match newer {
                Some(newer) if !newer.is_empty() => drained.merge_newer(newer),
                _ => drained,
            })
            .await;
        if let Err(error) = result {
            // Both the flush and the requeue failed; the buffer is at
            // risk until the store recovers.
            warn!(doc_id = %doc_id, error = %error, "failed to requeue drained update");
            return Err(QueueError::BufferUnavailable(error));
        }
        Ok(())
    }

    /// Peek at the buffer without clearing it.
    pub async fn pending(&self, doc_id: Uuid) -> Result<Option<PendingUpdate>, QueueError> {
        self.store.get(doc_id).await.map_err(QueueError::BufferUnavailable)
    }
}
