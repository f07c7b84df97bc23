use super::Entity;
use serde::{Deserialize, Serialize};

/// Decides which produced versions get materialized.
///
/// `should_record` keeps a versioned snapshot for point-in-time reads.
/// `should_record_as_latest` governs the single per-entity "latest" slot.
pub trait SnapshotStrategy<E>: Send + Sync {
    fn should_record(&self, entity: &E) -> bool;

    fn should_record_as_latest(&self, previous_latest: Option<&E>, next: &E) -> bool;
}

/// Interval-based strategy.
///
/// `record_every = 10` keeps versions 10, 20, 30... (`0` keeps none).
/// `latest_every = 1` refreshes the latest slot on every version, `n` only once
/// the slot is at least `n` versions behind, `0` never.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SnapshotPolicy {
    pub record_every: u64,
    pub latest_every: u64,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            record_every: 0,
            latest_every: 1,
        }
    }
}

impl SnapshotPolicy {
    pub fn every(record_every: u64) -> Self {
        Self {
            record_every,
            ..Self::default()
        }
    }

    pub fn with_latest_every(mut self, latest_every: u64) -> Self {
        self.latest_every = latest_every;
        self
    }
}

impl<E: Entity> SnapshotStrategy<E> for SnapshotPolicy {
    fn should_record(&self, entity: &E) -> bool {
        let version = entity.version().value();
        self.record_every > 0 && version > 0 && version % self.record_every == 0
    }

    fn should_record_as_latest(&self, previous_latest: Option<&E>, next: &E) -> bool {
        if self.latest_every == 0 {
            return false;
        }
        let behind = previous_latest.map_or(0, |prev| prev.version().value());
        next.version().value().saturating_sub(behind) >= self.latest_every
    }
}

/// Always replay from genesis.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSnapshots;

impl<E> SnapshotStrategy<E> for NoSnapshots {
    fn should_record(&self, _entity: &E) -> bool {
        false
    }

    fn should_record_as_latest(&self, _previous_latest: Option<&E>, _next: &E) -> bool {
        false
    }
}

/// Only the latest slot, refreshed on every version.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatestOnly;

impl<E: Entity> SnapshotStrategy<E> for LatestOnly {
    fn should_record(&self, _entity: &E) -> bool {
        false
    }

    fn should_record_as_latest(&self, previous_latest: Option<&E>, next: &E) -> bool {
        previous_latest.is_none_or(|prev| next.version() > prev.version())
    }
}
