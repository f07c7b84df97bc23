// ============================================================================
// sourcedb Library
// ============================================================================

pub mod config;
pub mod core;
pub mod entity;
pub mod envelope;
pub mod session;
pub mod source;
pub mod store;
pub mod stream;

// Re-export main types for convenience
pub use config::{EnvelopeConfig, StoreConfig, StreamConfig};
pub use crate::core::{ConflictKind, Id, Lease, Pointer, Result, StoreError, Tag, Version};
pub use entity::{
    DeltaEffects, Entity, EntityRepository, HistoryEntry, LatestOnly, Loaded, NoSnapshots,
    SnapshotPolicy, SnapshotStrategy, TransactionBuilder, reduce, reduce_all,
};
pub use envelope::{
    Envelope, EnvelopeCodec, EnvelopeHeaders, EnvelopeService, EnvelopeValue, Resolvable,
    ResolvedValue, TypeKey, TypeRegistry, TypeResolver, TypeResolverChain,
};
pub use session::{
    CommitOutcome, InMemoryBackend, MessageQuery, SessionFactory, SessionOptions, Snapshot,
    SnapshotSession, SnapshotSlot, SourceSession,
};
pub use source::{AgentAccessor, AgentStamp, Message, MessageRecord, Source};
pub use store::{SourceStore, SourceStoreBuilder};
pub use stream::StreamRepository;

// Cancellation signal accepted by retrying operations.
pub use tokio_util::sync::CancellationToken;
