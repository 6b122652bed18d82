// Shared application state threaded through the router.

use std::time::Duration;

use crate::auth::capability::CapabilityTokenService;
use crate::broker::ConnectionRegistry;
use crate::flush::FlushScheduler;
use crate::queue::PatchQueue;
use crate::store::{DocumentStore, PendingStore, SearchIndex};

#[derive(Clone)]
pub struct AppState {
    pub tokens: CapabilityTokenService,
    pub registry: ConnectionRegistry,
    pub queue: PatchQueue,
    pub documents: DocumentStore,
    pub flush: FlushScheduler,
}

impl AppState {
    pub fn new(
        tokens: CapabilityTokenService,
        documents: DocumentStore,
        search: SearchIndex,
        pending: PendingStore,
        debounce: Duration,
    ) -> Self {
        let queue = PatchQueue::new(pending);
        let flush =
            FlushScheduler::new(queue.clone(), documents.clone(), search.clone(), debounce);
        Self {
            tokens,
            registry: ConnectionRegistry::new(),
            queue,
            documents,
            flush,
        }
    }

    /// Fully in-memory state for handler tests.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn in_memory(secret: &str) -> anyhow::Result<Self> {
        Ok(Self::new(
            CapabilityTokenService::new(secret)?,
            DocumentStore::memory(),
            SearchIndex::memory(),
            PendingStore::memory(),
            Duration::from_millis(50),
        ))
    }
}
