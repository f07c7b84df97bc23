// Typed repository over one source session and one snapshot session.
// The read path and the commit path live in separate fragments that share
// this module's scope.

use super::snapshot::SnapshotStrategy;
use super::transaction::TransactionBuilder;
use super::{Entity, reduce};
use crate::core::{Id, Lease, Pointer, Result, StoreError, Tag, Version};
use crate::envelope::EnvelopeService;
use crate::session::{
    CommitOutcome, MessageQuery, SessionOptions, Snapshot, SnapshotSession, SnapshotSlot,
    SourceSession,
};
use crate::source::{AgentAccessor, MessageRecord, Source};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};

include!("repository/read_path.rs");
include!("repository/commit_path.rs");

/// Result of materializing an entity, with what it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded<E> {
    pub entity: E,
    /// Version of the snapshot used as the replay baseline, if any.
    pub snapshot_version: Option<Version>,
    pub replayed: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry<D> {
    pub source_id: Id,
    pub timestamp: DateTime<Utc>,
    pub pointer: Pointer,
    pub delta: D,
}

/// Reads and commits one entity type.
///
/// Holds its sessions for its whole lifetime; dropping the repository releases them.
pub struct EntityRepository<E: Entity> {
    envelopes: EnvelopeService,
    agent: Arc<dyn AgentAccessor>,
    strategy: Arc<dyn SnapshotStrategy<E>>,
    sources: Box<dyn SourceSession>,
    snapshots: Box<dyn SnapshotSession>,
    options: SessionOptions,
}

impl<E: Entity> EntityRepository<E> {
    pub fn new(
        envelopes: EnvelopeService,
        agent: Arc<dyn AgentAccessor>,
        strategy: Arc<dyn SnapshotStrategy<E>>,
        sources: Box<dyn SourceSession>,
        snapshots: Box<dyn SnapshotSession>,
        options: SessionOptions,
    ) -> Self {
        Self {
            envelopes,
            agent,
            strategy,
            sources,
            snapshots,
            options,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.options.read_only
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// A fresh builder bound to this repository's envelopes and agent.
    pub fn transaction(&self) -> TransactionBuilder<E> {
        TransactionBuilder::new(self.envelopes.clone(), self.agent.clone())
    }

    fn ensure_writable(&self, operation: &str) -> Result<()> {
        if self.is_read_only() {
            return Err(StoreError::ReadOnly(format!(
                "{operation} on {} repository",
                E::member_name()
            )));
        }
        Ok(())
    }

    fn decode_snapshot(&self, snapshot: &Snapshot) -> Result<E> {
        let entity: E = self.envelopes.deserialize(&snapshot.value)?;
        if entity.id() != snapshot.pointer.id || entity.version() != snapshot.pointer.version {
            return Err(StoreError::Storage(format!(
                "snapshot stored at {} holds {}@{}",
                snapshot.pointer,
                entity.id(),
                entity.version()
            )));
        }
        Ok(entity)
    }

    fn snapshot_of(&self, entity: &E) -> Result<Snapshot> {
        Ok(Snapshot {
            pointer: Pointer::new(entity.id(), entity.version()),
            value: self.envelopes.serialize(entity)?,
        })
    }

    async fn write_snapshots(&self, writes: Vec<(SnapshotSlot, Snapshot)>) -> Result<usize> {
        let count = writes.len();
        try_join_all(
            writes
                .into_iter()
                .map(|(slot, snapshot)| self.snapshots.put(slot, snapshot)),
        )
        .await?;
        Ok(count)
    }
}
