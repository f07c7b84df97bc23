// In-memory reference backend. Split into the commit/query engine and the
// session handles while keeping one module-level visibility scope.

use super::{
    CommitOutcome, MessageQuery, SessionFactory, SessionOptions, Snapshot, SnapshotSession,
    SnapshotSlot, SourceSession,
};
use crate::core::{ConflictKind, Id, Lease, Pointer, Result, StoreError, Tag, Version};
use crate::source::{MessageRecord, Source};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

include!("memory/engine.rs");
include!("memory/sessions.rs");

/// Process-local backend with the same atomicity and uniqueness guarantees a
/// real adapter must provide. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<RwLock<MemoryState>>,
    open_sessions: Arc<AtomicUsize>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions opened and not yet dropped.
    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    pub async fn message_count(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn source_count(&self) -> usize {
        self.state.read().await.sources.len()
    }

    pub async fn snapshot_keys(&self, id: Id) -> Vec<Pointer> {
        let state = self.state.read().await;
        state
            .snapshots
            .range(Pointer::latest(id)..=Pointer::new(id, Version::new(u64::MAX)))
            .map(|(key, _)| *key)
            .collect()
    }

    fn guard(&self, options: &SessionOptions) -> SessionGuard {
        SessionGuard::acquire(self.open_sessions.clone(), options)
    }
}

#[async_trait]
impl SessionFactory for InMemoryBackend {
    async fn source_session(&self, options: &SessionOptions) -> Result<Box<dyn SourceSession>> {
        Ok(Box::new(MemorySourceSession {
            state: self.state.clone(),
            guard: self.guard(options),
        }))
    }

    async fn snapshot_session(
        &self,
        options: &SessionOptions,
    ) -> Result<Box<dyn SnapshotSession>> {
        Ok(Box::new(MemorySnapshotSession {
            state: self.state.clone(),
            guard: self.guard(options),
        }))
    }
}
