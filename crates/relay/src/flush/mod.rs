// Flush scheduler.
//
// Per-document state machine: Idle -> Scheduled -> Flushing -> Idle.
// An edit arms the debounce timer; expiry drains the patch queue,
// applies the buffered patches to the authoritative document, and
// persists the result to the primary store and the search index. At
// most one flush runs per document at a time; unrelated documents
// proceed independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use formsync_common::patch;
use formsync_common::types::FormDocument;

use crate::queue::{PatchQueue, PendingUpdate};
use crate::recurring;
use crate::store::{DocumentStore, SearchIndex};

/// Consecutive failures after which a buffer is dead-lettered instead
/// of retried.
const MAX_FLUSH_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushState {
    /// Debounce timer armed; `attempts` counts consecutive failures.
    Scheduled { attempts: u32 },
    /// A flush is running; `reschedule` records edits that arrived
    /// mid-flush and need another cycle.
    Flushing { reschedule: bool },
}

struct SchedulerInner {
    states: Mutex<HashMap<Uuid, FlushState>>,
    queue: PatchQueue,
    documents: DocumentStore,
    search: SearchIndex,
    debounce: Duration,
}

/// Outcome of a single flush attempt, mostly for tests and logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Buffer applied and persisted.
    Flushed,
    /// Nothing pending for this document.
    Empty,
    /// Another flush already holds this document.
    AlreadyFlushing,
    /// Transient failure; buffer re-enqueued and retry armed.
    Retrying,
    /// Retries exhausted; buffer dropped after dead-letter logging.
    DeadLettered,
    /// Authoritative document vanished mid-cycle; buffer discarded.
    DocumentVanished,
}

#[derive(Clone)]
pub struct FlushScheduler {
    inner: Arc<SchedulerInner>,
}

impl FlushScheduler {
    pub fn new(
        queue: PatchQueue,
        documents: DocumentStore,
        search: SearchIndex,
        debounce: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                states: Mutex::new(HashMap::new()),
                queue,
                documents,
                search,
                debounce,
            }),
        }
    }

    /// Record that an edit was enqueued for `doc_id`.
    ///
    /// Idle documents move to Scheduled and arm the debounce timer.
    /// Already-scheduled documents keep their existing timer, so a
    /// burst of rapid edits becomes one write. Edits landing during a
    /// flush mark the document for another cycle.
    pub async fn note_edit(&self, doc_id: Uuid) {
        let mut states = self.inner.states.lock().await;
        match states.get_mut(&doc_id) {
            None => {
                states.insert(doc_id, FlushState::Scheduled { attempts: 0 });
                drop(states);
                self.arm_timer(doc_id);
            }
            Some(FlushState::Scheduled { .. }) => {}
            Some(FlushState::Flushing { reschedule }) => *reschedule = true,
        }
    }

    /// Flush one document now, regardless of its debounce timer.
    ///
    /// Exactly one caller wins the Scheduled -> Flushing transition;
    /// overlapping attempts for the same document return
    /// [`FlushOutcome::AlreadyFlushing`].
    pub async fn flush_now(&self, doc_id: Uuid) -> FlushOutcome {
        let attempts = {
            let mut states = self.inner.states.lock().await;
            match states.get(&doc_id).copied() {
                Some(FlushState::Flushing { .. }) => return FlushOutcome::AlreadyFlushing,
                Some(FlushState::Scheduled { attempts }) => {
                    states.insert(doc_id, FlushState::Flushing { reschedule: false });
                    attempts
                }
                None => {
                    // Direct trigger (sweep, tests) without a noted
                    // edit; still serialize against other flushes.
                    states.insert(doc_id, FlushState::Flushing { reschedule: false });
                    0
                }
            }
        };

        let outcome = self.run_flush(doc_id, attempts).await;
        self.finish(doc_id, &outcome, attempts).await;
        outcome
    }

    /// Flush every document currently awaiting one. Used by the
    /// periodic sweep as a catch-all behind the debounce timers.
    pub async fn sweep(&self) -> anyhow::Result<()> {
        let scheduled: Vec<Uuid> = {
            let states = self.inner.states.lock().await;
            states
                .iter()
                .filter_map(|(doc_id, state)| {
                    matches!(state, FlushState::Scheduled { .. }).then_some(*doc_id)
                })
                .collect()
        };

        for doc_id in scheduled {
            self.flush_now(doc_id).await;
        }
        Ok(())
    }

    /// Spawn the periodic sweep as a recurring background task.
    pub fn spawn_sweep(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let scheduler = self.clone();
        recurring::spawn_recurring("flush-sweep", interval, move || {
            let scheduler = scheduler.clone();
            async move { scheduler.sweep().await }
        })
    }

    fn arm_timer(&self, doc_id: Uuid) {
        let scheduler = self.clone();
        let debounce = self.inner.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            scheduler.flush_now(doc_id).await;
        });
    }

    async fn run_flush(&self, doc_id: Uuid, attempts: u32) -> FlushOutcome {
        let drained = match self.inner.queue.drain_and_clear(doc_id).await {
            Ok(Some(update)) if !update.is_empty() => update,
            Ok(_) => return FlushOutcome::Empty,
            Err(error) => {
                warn!(doc_id = %doc_id, error = %error, "failed to drain pending updates");
                return FlushOutcome::Retrying;
            }
        };

        let document = match self.inner.documents.get(doc_id).await {
            Ok(Some(document)) => document,
            Ok(None) => {
                // Deleted concurrently; nothing to apply the buffer to.
                warn!(doc_id = %doc_id, "document vanished mid-flush, discarding buffer");
                return FlushOutcome::DocumentVanished;
            }
            Err(error) => {
                warn!(doc_id = %doc_id, error = %error, "failed to load document for flush");
                return self.fail(doc_id, drained, attempts).await;
            }
        };

        let previous_responses = document.responses;
        let (updated, mirror) = apply_pending(document, &drained);

        if previous_responses > 0 && updated.responses == 0 {
            match self.inner.documents.delete_response_entries(doc_id).await {
                Ok(removed) => {
                    info!(doc_id = %doc_id, removed, "response count hit zero, cascaded delete");
                }
                Err(error) => {
                    warn!(doc_id = %doc_id, error = %error, "cascade delete failed");
                    return self.fail(doc_id, drained, attempts).await;
                }
            }
        }

        if let Err(error) = self.inner.search.update_partial(doc_id, &mirror).await {
            warn!(doc_id = %doc_id, error = %error, "search index update failed");
            return self.fail(doc_id, drained, attempts).await;
        }

        if let Err(error) = self.inner.documents.write_flushed(&updated).await {
            warn!(doc_id = %doc_id, error = %error, "primary datastore write failed");
            return self.fail(doc_id, drained, attempts).await;
        }

        info!(doc_id = %doc_id, "flushed pending updates");
        FlushOutcome::Flushed
    }

    /// Handle a transient flush failure: re-enqueue the drained buffer
    /// and either arm a retry or dead-letter after too many attempts.
    async fn fail(&self, doc_id: Uuid, drained: PendingUpdate, attempts: u32) -> FlushOutcome {
        if attempts + 1 >= MAX_FLUSH_ATTEMPTS {
            let payload = serde_json::to_string(&drained).unwrap_or_else(|_| "<unencodable>".into());
            error!(
                doc_id = %doc_id,
                attempts = attempts + 1,
                dead_letter = %payload,
                "flush permanently failing, dropping buffer"
            );
            return FlushOutcome::DeadLettered;
        }

        if let Err(error) = self.inner.queue.requeue(doc_id, drained).await {
            error!(doc_id = %doc_id, error = %error, "failed to requeue after flush failure");
        }
        FlushOutcome::Retrying
    }

    /// Transition out of Flushing according to the outcome.
    async fn finish(&self, doc_id: Uuid, outcome: &FlushOutcome, attempts: u32) {
        if *outcome == FlushOutcome::AlreadyFlushing {
            return;
        }

        let rearm = {
            let mut states = self.inner.states.lock().await;
            let rescheduled = matches!(
                states.get(&doc_id),
                Some(FlushState::Flushing { reschedule: true })
            );

            match outcome {
                FlushOutcome::Retrying => {
                    states.insert(doc_id, FlushState::Scheduled { attempts: attempts + 1 });
                    true
                }
                _ if rescheduled => {
                    // New edits arrived during this flush; they start a
                    // fresh cycle.
                    states.insert(doc_id, FlushState::Scheduled { attempts: 0 });
                    true
                }
                _ => {
                    states.remove(&doc_id);
                    false
                }
            }
        };

        if rearm {
            self.arm_timer(doc_id);
        }
    }
}

/// Apply a drained buffer to the authoritative document.
///
/// Returns the updated document plus the partial mirror written to the
/// search index (only the fields this flush touched).
pub(crate) fn apply_pending(
    mut document: FormDocument,
    update: &PendingUpdate,
) -> (FormDocument, serde_json::Value) {
    let mut mirror = serde_json::Map::new();

    if let Some(name) = &update.name {
        document.name = name.clone();
        mirror.insert("name".into(), json!(name));
    }
    if let Some(multiple) = update.multiple {
        document.multiple = multiple;
        mirror.insert("multiple".into(), json!(multiple));
    }
    if let Some(public) = update.public {
        document.public = public;
        mirror.insert("public".into(), json!(public));
    }
    if update.responses_delta != 0 {
        document.responses = (document.responses + update.responses_delta).max(0);
        mirror.insert("responses".into(), json!(document.responses));
    }
    if !update.items.is_empty() {
        patch::apply_all(&mut document.items, update.items.iter().cloned());
        mirror.insert("items".into(), json!(document.items));
    }
    if !update.files.is_empty() {
        patch::apply_all(&mut document.files, update.files.iter().cloned());
        mirror.insert("files".into(), json!(document.files));
    }

    document.updated = Utc::now();
    (document, serde_json::Value::Object(mirror))
}
