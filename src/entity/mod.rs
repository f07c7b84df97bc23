//! Typed aggregates and the reduction pipeline that produces them.

pub mod repository;
pub mod snapshot;
pub mod transaction;

pub use repository::{EntityRepository, HistoryEntry, Loaded};
pub use snapshot::{LatestOnly, NoSnapshots, SnapshotPolicy, SnapshotStrategy};
pub use transaction::TransactionBuilder;

use crate::core::{Id, Lease, Tag, Version};
use crate::envelope::Resolvable;

/// A domain aggregate rebuilt by folding its deltas.
///
/// Entities are values. `apply` consumes the previous state and returns the next
/// one; the pipeline, not the entity, advances the version.
pub trait Entity: Resolvable + Clone {
    type Delta: Resolvable + DeltaEffects<Self> + Clone;

    /// Zero-value entity at `Version::ZERO`.
    fn construct(id: Id) -> Self;

    fn id(&self) -> Id;

    fn version(&self) -> Version;

    fn with_version(self, version: Version) -> Self;

    /// Must be deterministic: same state plus same delta gives the same result.
    fn apply(self, delta: &Self::Delta) -> Self;
}

/// Lease and tag mutations a delta carries, computed against the state it produced.
pub trait DeltaEffects<E> {
    fn add_leases(&self, _entity: &E) -> Vec<Lease> {
        Vec::new()
    }

    fn add_tags(&self, _entity: &E) -> Vec<Tag> {
        Vec::new()
    }

    fn delete_leases(&self, _entity: &E) -> Vec<Lease> {
        Vec::new()
    }

    fn delete_tags(&self, _entity: &E) -> Vec<Tag> {
        Vec::new()
    }
}

pub fn reduce<E: Entity>(entity: E, delta: &E::Delta) -> E {
    let next = entity.version().next();
    entity.apply(delta).with_version(next)
}

pub fn reduce_all<'a, E, I>(entity: E, deltas: I) -> E
where
    E: Entity,
    I: IntoIterator<Item = &'a E::Delta>,
{
    deltas.into_iter().fold(entity, reduce::<E>)
}
