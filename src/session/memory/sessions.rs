/// Counts a session as open until dropped.
struct SessionGuard {
    open_sessions: Arc<AtomicUsize>,
    read_only: bool,
    label: String,
}

impl SessionGuard {
    fn acquire(open_sessions: Arc<AtomicUsize>, options: &SessionOptions) -> Self {
        open_sessions.fetch_add(1, Ordering::SeqCst);
        Self {
            open_sessions,
            read_only: options.read_only,
            label: options.label.clone().unwrap_or_else(|| "memory".to_string()),
        }
    }

    fn ensure_writable(&self, operation: &str) -> Result<()> {
        if self.read_only {
            return Err(StoreError::ReadOnly(format!(
                "{operation} through session '{}'",
                self.label
            )));
        }
        Ok(())
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MemorySourceSession {
    state: Arc<RwLock<MemoryState>>,
    guard: SessionGuard,
}

#[async_trait]
impl SourceSession for MemorySourceSession {
    fn is_read_only(&self) -> bool {
        self.guard.read_only
    }

    async fn commit(&self, source: &Source) -> Result<CommitOutcome> {
        self.guard.ensure_writable("commit")?;
        let mut state = self.state.write().await;
        if let Some(conflict) = state.find_conflict(source)? {
            log::debug!(
                "Session '{}' rejected source {}: {}",
                self.guard.label,
                source.id,
                conflict
            );
            return Ok(CommitOutcome::Conflict(conflict));
        }
        state.apply(source);
        Ok(CommitOutcome::Committed)
    }

    async fn messages(&self, query: &MessageQuery) -> Result<Vec<MessageRecord>> {
        Ok(self.state.read().await.query(query))
    }

    async fn lease(&self, lease: &Lease) -> Result<Option<Pointer>> {
        Ok(self.state.read().await.leases.get(lease).copied())
    }

    async fn tagged(&self, tag: &Tag) -> Result<Vec<Pointer>> {
        let state = self.state.read().await;
        Ok(state
            .tags
            .get(tag)
            .map(|pointers| pointers.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn latest_version(&self, id: Id) -> Result<Option<Version>> {
        Ok(self.state.read().await.latest_version(id))
    }

    async fn source(&self, id: Id) -> Result<Option<Source>> {
        Ok(self.state.read().await.sources.get(&id).cloned())
    }
}

struct MemorySnapshotSession {
    state: Arc<RwLock<MemoryState>>,
    guard: SessionGuard,
}

#[async_trait]
impl SnapshotSession for MemorySnapshotSession {
    fn is_read_only(&self) -> bool {
        self.guard.read_only
    }

    async fn get(&self, key: Pointer) -> Result<Option<Snapshot>> {
        Ok(self.state.read().await.snapshots.get(&key).cloned())
    }

    async fn nearest(&self, id: Id, version: Version) -> Result<Option<Snapshot>> {
        Ok(self.state.read().await.nearest_snapshot(id, version))
    }

    async fn put(&self, slot: SnapshotSlot, snapshot: Snapshot) -> Result<()> {
        self.guard.ensure_writable("snapshot put")?;
        if snapshot.pointer.is_latest() {
            return Err(StoreError::Storage(format!(
                "snapshot of {} has no version",
                snapshot.pointer.id
            )));
        }
        let key = slot.key(snapshot.pointer);
        self.state.write().await.snapshots.insert(key, snapshot);
        Ok(())
    }

    async fn delete(&self, key: Pointer) -> Result<bool> {
        self.guard.ensure_writable("snapshot delete")?;
        Ok(self.state.write().await.snapshots.remove(&key).is_some())
    }
}
