mod common;

use async_trait::async_trait;
use common::{NumberBox, NumberDelta, name_lease, store, store_with};
use sourcedb::{
    AgentStamp, CommitOutcome, Entity, EntityRepository, EnvelopeCodec, Id, LatestOnly, Lease,
    Message, MessageQuery, MessageRecord, NoSnapshots, Pointer, SessionFactory, SessionOptions,
    Snapshot, SnapshotPolicy, SnapshotSession, SnapshotSlot, SnapshotStrategy, Source,
    SourceSession, StoreConfig, StoreError, Tag, Version, reduce_all,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// Keeps a versioned snapshot at exactly one version and never touches the latest slot.
struct RecordAt(u64);

impl SnapshotStrategy<NumberBox> for RecordAt {
    fn should_record(&self, entity: &NumberBox) -> bool {
        entity.version() == Version::new(self.0)
    }

    fn should_record_as_latest(&self, _previous: Option<&NumberBox>, _next: &NumberBox) -> bool {
        false
    }
}

#[tokio::test]
async fn store_number_reads_version_two_from_version_one_snapshot() {
    let (backend, store) = store();
    let repo = store
        .entity_repository_with::<NumberBox, _>(SessionOptions::default(), RecordAt(1))
        .await
        .unwrap();
    let id = Id::new();

    let mut tx = repo.transaction();
    let after_first = tx.append(id, NumberDelta::StoreNumber(5)).unwrap().clone();
    assert_eq!(after_first.version(), Version::new(1));
    assert_eq!(after_first.value, 5);
    let after_second = tx.append(id, NumberDelta::StoreNumber(7)).unwrap().clone();
    assert_eq!(after_second.version(), Version::new(2));
    assert_eq!(after_second.value, 7);

    let source = tx.build(Id::new()).unwrap();
    assert!(tx.is_empty());
    assert!(repo.commit(&source).await.unwrap());
    assert_eq!(
        backend.snapshot_keys(id).await,
        vec![Pointer::new(id, Version::new(1))]
    );

    let loaded = repo.load(Pointer::new(id, Version::new(2))).await.unwrap();
    assert_eq!(loaded.snapshot_version, Some(Version::new(1)));
    assert_eq!(loaded.replayed, 1);
    assert_eq!(loaded.entity.value, 7);
    assert_eq!(loaded.entity.version(), Version::new(2));

    let first = repo.get(Pointer::new(id, Version::new(1))).await.unwrap();
    assert_eq!(first.value, 5);
}

#[tokio::test]
async fn every_tenth_snapshot_bounds_replay() {
    let config = StoreConfig {
        snapshot: SnapshotPolicy::every(10).with_latest_every(0),
        ..StoreConfig::default()
    };
    let (_backend, store) = store_with(config);
    let repo = store.entity_repository::<NumberBox>().await.unwrap();
    let id = Id::new();

    let deltas: Vec<NumberDelta> = (1..=35).map(|n| NumberDelta::Add(n * 3 - 7)).collect();
    for chunk in deltas.chunks(5) {
        let mut tx = repo.transaction();
        if let Some(current) = repo.try_get(id).await.unwrap() {
            tx.load(current).unwrap();
        }
        for delta in chunk {
            tx.append(id, delta.clone()).unwrap();
        }
        let source = tx.build(Id::new()).unwrap();
        assert!(repo.commit(&source).await.unwrap());
    }

    let genesis = NumberBox::construct(id);
    for version in 1..=35u64 {
        let loaded = repo.load(Pointer::new(id, Version::new(version))).await.unwrap();
        let expected = reduce_all(genesis.clone(), &deltas[..version as usize]);
        assert_eq!(loaded.entity, expected, "state at version {version}");
        assert!(
            loaded.replayed <= 9,
            "version {version} replayed {} messages",
            loaded.replayed
        );
        let expected_snapshot = Some(version / 10 * 10).filter(|v| *v > 0);
        assert_eq!(loaded.snapshot_version.map(|v| v.value()), expected_snapshot);
    }
}

#[tokio::test]
async fn latest_slot_serves_current_state() {
    let (backend, store) = store();
    let repo = store.entity_repository::<NumberBox>().await.unwrap();
    let id = Id::new();

    let mut tx = repo.transaction();
    tx.append(id, NumberDelta::StoreNumber(1)).unwrap();
    tx.append(id, NumberDelta::Add(41)).unwrap();
    assert!(repo.commit(&tx.build(Id::new()).unwrap()).await.unwrap());

    assert!(backend.snapshot_keys(id).await.contains(&Pointer::latest(id)));
    let loaded = repo.load(Pointer::latest(id)).await.unwrap();
    assert_eq!(loaded.replayed, 0);
    assert_eq!(loaded.snapshot_version, Some(Version::new(2)));
    assert_eq!(loaded.entity.value, 42);

    let deleted = repo.delete_snapshots(&[Pointer::latest(id)]).await.unwrap();
    assert_eq!(deleted, 1);
    let replayed = repo.load(Pointer::latest(id)).await.unwrap();
    assert_eq!(replayed.replayed, 2);
    assert_eq!(replayed.entity.value, 42);
    // The read re-populated the latest slot.
    assert!(backend.snapshot_keys(id).await.contains(&Pointer::latest(id)));
}

#[tokio::test]
async fn concurrent_builders_one_wins() {
    let (backend, store) = store();
    let repo = store
        .entity_repository_with::<NumberBox, _>(SessionOptions::default(), NoSnapshots)
        .await
        .unwrap();
    let id = Id::new();

    let mut seed = repo.transaction();
    seed.append(id, NumberDelta::StoreNumber(10)).unwrap();
    assert!(repo.commit(&seed.build(Id::new()).unwrap()).await.unwrap());

    let current = repo.get(id).await.unwrap();
    let mut left = repo.transaction();
    let mut right = repo.transaction();
    left.load(current.clone()).unwrap();
    right.load(current).unwrap();
    left.append(id, NumberDelta::Add(1)).unwrap();
    right.append(id, NumberDelta::Add(100)).unwrap();
    let left_source = left.build(Id::new()).unwrap();
    let right_source = right.build(Id::new()).unwrap();

    let (left_ok, right_ok) =
        futures::future::join(repo.commit(&left_source), repo.commit(&right_source)).await;
    let outcomes = [left_ok.unwrap(), right_ok.unwrap()];
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);

    let winner = repo.get(id).await.unwrap();
    assert_eq!(winner.version(), Version::new(2));
    assert!(winner.value == 11 || winner.value == 110);
    assert_eq!(backend.message_count().await, 2);
    assert_eq!(backend.source_count().await, 2);
}

#[tokio::test]
async fn builder_rejects_misuse() {
    let (_backend, store) = store();
    let repo = store.entity_repository::<NumberBox>().await.unwrap();
    let id = Id::new();

    let mut tx = repo.transaction();
    tx.load(NumberBox::construct(id)).unwrap();
    let err = tx.load(NumberBox::construct(id)).unwrap_err();
    assert!(matches!(err, StoreError::EntityAlreadyKnown(known) if known == id));

    let stranger = Id::new();
    let err = tx.update(stranger, NumberDelta::Add(1)).unwrap_err();
    assert!(matches!(err, StoreError::UnknownEntity(unknown) if unknown == stranger));

    let entity = tx.update(id, NumberDelta::Add(2)).unwrap();
    assert_eq!(entity.version(), Version::new(1));
    assert_eq!(tx.len(), 1);
}

#[tokio::test]
async fn leases_are_unique_across_entities() {
    let (_backend, store) = store();
    let repo = store.entity_repository::<NumberBox>().await.unwrap();
    let alpha = Id::new();
    let beta = Id::new();

    let mut tx = repo.transaction();
    tx.append(alpha, NumberDelta::Claim("primary".into())).unwrap();
    assert!(repo.commit(&tx.build(Id::new()).unwrap()).await.unwrap());

    let mut tx = repo.transaction();
    tx.append(beta, NumberDelta::Claim("primary".into())).unwrap();
    assert!(!repo.commit(&tx.build(Id::new()).unwrap()).await.unwrap());
    assert!(repo.try_get(beta).await.unwrap().is_none());

    let holder = repo.get_by_lease(&name_lease("primary")).await.unwrap().unwrap();
    assert_eq!(holder.id, alpha);

    let mut tx = repo.transaction();
    tx.load(holder).unwrap();
    tx.update(alpha, NumberDelta::Release("primary".into())).unwrap();
    tx.append(beta, NumberDelta::Claim("primary".into())).unwrap();
    assert!(repo.commit(&tx.build(Id::new()).unwrap()).await.unwrap());

    let holder = repo.get_by_lease(&name_lease("primary")).await.unwrap().unwrap();
    assert_eq!(holder.id, beta);
    assert_eq!(repo.get(alpha).await.unwrap().name, None);
    assert!(repo.get_by_lease(&name_lease("nobody")).await.unwrap().is_none());
}

#[tokio::test]
async fn history_and_tags_follow_commits() {
    let (_backend, store) = store();
    let repo = store.entity_repository::<NumberBox>().await.unwrap();
    let id = Id::new();

    let mut tx = repo.transaction();
    tx.append(id, NumberDelta::StoreNumber(3)).unwrap();
    tx.append(id, NumberDelta::Add(4)).unwrap();
    let first_source = tx.build(Id::new()).unwrap();
    assert!(repo.commit(&first_source).await.unwrap());

    let mut tx = repo.transaction();
    tx.load(repo.get(id).await.unwrap()).unwrap();
    tx.append(id, NumberDelta::StoreNumber(9)).unwrap();
    let second_source = tx.build(Id::new()).unwrap();
    assert!(repo.commit(&second_source).await.unwrap());

    let history = repo.history(id).await.unwrap();
    let versions: Vec<u64> = history.iter().map(|entry| entry.pointer.version.value()).collect();
    assert_eq!(versions, vec![1, 2, 3]);
    assert_eq!(history[0].source_id, first_source.id);
    assert_eq!(history[2].source_id, second_source.id);
    assert_eq!(history[1].delta, NumberDelta::Add(4));

    let tagged = repo.tagged(&Tag::new("stored", "9")).await.unwrap();
    assert_eq!(tagged, vec![Pointer::new(id, Version::new(3))]);
}

#[tokio::test]
async fn missing_entities_and_future_versions_are_not_found() {
    let (_backend, store) = store();
    let repo = store.entity_repository::<NumberBox>().await.unwrap();
    let id = Id::new();

    assert!(matches!(
        repo.get(id).await.unwrap_err(),
        StoreError::EntityNotFound(_)
    ));
    assert!(repo.try_get(id).await.unwrap().is_none());

    let mut tx = repo.transaction();
    tx.append(id, NumberDelta::Add(1)).unwrap();
    assert!(repo.commit(&tx.build(Id::new()).unwrap()).await.unwrap());

    let err = repo.get(Pointer::new(id, Version::new(5))).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::EntityNotFound(pointer) if pointer.version == Version::new(5)
    ));
}

#[tokio::test]
async fn gaps_in_the_message_sequence_are_reported() {
    let (backend, store) = store();
    let repo = store
        .entity_repository_with::<NumberBox, _>(SessionOptions::default(), NoSnapshots)
        .await
        .unwrap();
    let id = Id::new();

    let delta = store.envelopes().serialize(&NumberDelta::Add(1)).unwrap();
    let stamp = AgentStamp {
        timestamp: chrono::Utc::now(),
        signature: delta.clone(),
    };
    let source = Source::new(
        Id::new(),
        stamp,
        vec![Message::new(Pointer::new(id, Version::new(2)), delta)],
    );
    let session = backend.source_session(&SessionOptions::default()).await.unwrap();
    assert!(session.commit(&source).await.unwrap().is_committed());

    let err = repo.get(id).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::VersionGap { expected, found, .. }
            if expected == Version::new(1) && found == Version::new(2)
    ));
}

#[tokio::test]
async fn read_only_repository_refuses_writes() {
    let (_backend, store) = store();
    let writer = store.entity_repository::<NumberBox>().await.unwrap();
    let reader = store
        .entity_repository_with::<NumberBox, _>(
            SessionOptions::read_only(),
            SnapshotPolicy::default(),
        )
        .await
        .unwrap();
    let id = Id::new();

    let mut tx = writer.transaction();
    tx.append(id, NumberDelta::StoreNumber(8)).unwrap();
    let source = tx.build(Id::new()).unwrap();

    let err = reader.commit(&source).await.unwrap_err();
    assert!(matches!(err, StoreError::ReadOnly(_)));
    let err = reader.delete_snapshots(&[Pointer::latest(id)]).await.unwrap_err();
    assert!(matches!(err, StoreError::ReadOnly(_)));

    assert!(writer.commit(&source).await.unwrap());
    assert_eq!(reader.get(id).await.unwrap().value, 8);
}

#[tokio::test]
async fn repositories_release_sessions_on_drop() {
    let (backend, store) = store();
    {
        let _entities = store.entity_repository::<NumberBox>().await.unwrap();
        let _stream = store.stream_repository().await.unwrap();
        assert_eq!(backend.open_sessions(), 3);
    }
    assert_eq!(backend.open_sessions(), 0);
}

#[tokio::test]
async fn message_pack_codec_round_trips_entities() {
    let mut config = StoreConfig::default();
    config.envelope.codec = EnvelopeCodec::MessagePack;
    let (_backend, store) = store_with(config);
    let repo = store.entity_repository::<NumberBox>().await.unwrap();
    let id = Id::new();

    let mut tx = repo.transaction();
    tx.append(id, NumberDelta::Claim("packed".into())).unwrap();
    tx.append(id, NumberDelta::StoreNumber(-12)).unwrap();
    let source = tx.build(Id::new()).unwrap();
    assert!(matches!(
        source.messages[0].delta.value,
        sourcedb::EnvelopeValue::MessagePack(_)
    ));
    assert!(repo.commit(&source).await.unwrap());

    let entity = tokio_test::assert_ok!(repo.get(id).await);
    assert_eq!(entity.value, -12);
    assert_eq!(entity.name.as_deref(), Some("packed"));
}

/// Counts the message records handed out for replay.
struct CountingSource {
    inner: Box<dyn SourceSession>,
    replayed: Arc<AtomicUsize>,
}

#[async_trait]
impl SourceSession for CountingSource {
    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }

    async fn commit(&self, source: &Source) -> sourcedb::Result<CommitOutcome> {
        self.inner.commit(source).await
    }

    async fn messages(&self, query: &MessageQuery) -> sourcedb::Result<Vec<MessageRecord>> {
        let records = self.inner.messages(query).await?;
        self.replayed.fetch_add(records.len(), Ordering::SeqCst);
        Ok(records)
    }

    async fn lease(&self, lease: &Lease) -> sourcedb::Result<Option<Pointer>> {
        self.inner.lease(lease).await
    }

    async fn tagged(&self, tag: &Tag) -> sourcedb::Result<Vec<Pointer>> {
        self.inner.tagged(tag).await
    }

    async fn latest_version(&self, id: Id) -> sourcedb::Result<Option<Version>> {
        self.inner.latest_version(id).await
    }

    async fn source(&self, id: Id) -> sourcedb::Result<Option<Source>> {
        self.inner.source(id).await
    }
}

/// Advances the latest slot behind the reader's back on its first `nearest` lookup.
struct RacingSnapshots {
    inner: Box<dyn SnapshotSession>,
    newer: Mutex<Option<Snapshot>>,
}

#[async_trait]
impl SnapshotSession for RacingSnapshots {
    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }

    async fn get(&self, key: Pointer) -> sourcedb::Result<Option<Snapshot>> {
        self.inner.get(key).await
    }

    async fn nearest(&self, id: Id, version: Version) -> sourcedb::Result<Option<Snapshot>> {
        if let Some(snapshot) = self.newer.lock().await.take() {
            self.inner.put(SnapshotSlot::Latest, snapshot).await?;
        }
        self.inner.nearest(id, version).await
    }

    async fn put(&self, slot: SnapshotSlot, snapshot: Snapshot) -> sourcedb::Result<()> {
        self.inner.put(slot, snapshot).await
    }

    async fn delete(&self, key: Pointer) -> sourcedb::Result<bool> {
        self.inner.delete(key).await
    }
}

/// Commits `deltas` against `id`, `size` per source, carrying the working entity along.
async fn commit_in_chunks(
    repo: &EntityRepository<NumberBox>,
    id: Id,
    deltas: &[NumberDelta],
    size: usize,
) {
    let mut current: Option<NumberBox> = None;
    for chunk in deltas.chunks(size) {
        let mut tx = repo.transaction();
        if let Some(entity) = current.take() {
            tx.load(entity).unwrap();
        }
        for delta in chunk {
            current = Some(tx.append(id, delta.clone()).unwrap().clone());
        }
        assert!(repo.commit(&tx.build(Id::new()).unwrap()).await.unwrap());
    }
}

#[tokio::test]
async fn commits_start_snapshot_planning_from_the_latest_slot() {
    let (backend, store) = store();
    let replayed = Arc::new(AtomicUsize::new(0));
    let options = SessionOptions::default();
    let repo = EntityRepository::<NumberBox>::new(
        store.envelopes().clone(),
        store.agent(),
        Arc::new(SnapshotPolicy::default()),
        Box::new(CountingSource {
            inner: backend.source_session(&options).await.unwrap(),
            replayed: replayed.clone(),
        }),
        backend.snapshot_session(&options).await.unwrap(),
        options,
    );
    let id = Id::new();

    let deltas: Vec<NumberDelta> = (1..=50).map(NumberDelta::Add).collect();
    commit_in_chunks(&repo, id, &deltas, 1).await;
    assert_eq!(replayed.load(Ordering::SeqCst), 0);

    let loaded = repo.load(Pointer::latest(id)).await.unwrap();
    assert_eq!(loaded.snapshot_version, Some(Version::new(50)));
    assert_eq!(loaded.replayed, 0);
    assert_eq!(loaded.entity.value, (1..=50).sum::<i64>());
}

#[tokio::test]
async fn latest_slot_is_refreshed_every_tenth_version() {
    let config = StoreConfig {
        snapshot: SnapshotPolicy::default().with_latest_every(10),
        ..StoreConfig::default()
    };
    let (backend, store) = store_with(config);
    let repo = store.entity_repository::<NumberBox>().await.unwrap();
    let id = Id::new();

    let deltas: Vec<NumberDelta> = (1..=25).map(NumberDelta::Add).collect();
    commit_in_chunks(&repo, id, &deltas, 5).await;
    assert_eq!(backend.snapshot_keys(id).await, vec![Pointer::latest(id)]);

    let loaded = repo.load(Pointer::latest(id)).await.unwrap();
    assert_eq!(loaded.snapshot_version, Some(Version::new(20)));
    assert_eq!(loaded.replayed, 5);
    assert_eq!(loaded.entity, reduce_all(NumberBox::construct(id), &deltas));

    // Five versions behind is not enough to move the slot on read either.
    let again = repo.load(Pointer::latest(id)).await.unwrap();
    assert_eq!(again.snapshot_version, Some(Version::new(20)));
    assert_eq!(again.replayed, 5);
}

#[tokio::test]
async fn latest_only_keeps_a_single_slot() {
    let (backend, store) = store();
    let repo = store
        .entity_repository_with::<NumberBox, _>(SessionOptions::default(), LatestOnly)
        .await
        .unwrap();
    let id = Id::new();

    let deltas: Vec<NumberDelta> = (1..=7).map(NumberDelta::Add).collect();
    commit_in_chunks(&repo, id, &deltas, 3).await;
    assert_eq!(backend.snapshot_keys(id).await, vec![Pointer::latest(id)]);

    let latest = repo.load(Pointer::latest(id)).await.unwrap();
    assert_eq!(latest.snapshot_version, Some(Version::new(7)));
    assert_eq!(latest.replayed, 0);

    let earlier = repo.load(Pointer::new(id, Version::new(4))).await.unwrap();
    assert_eq!(earlier.snapshot_version, None);
    assert_eq!(earlier.replayed, 4);
    assert_eq!(earlier.entity.value, 10);
    assert_eq!(backend.snapshot_keys(id).await, vec![Pointer::latest(id)]);
}

#[tokio::test]
async fn read_does_not_roll_back_a_newer_latest_slot() {
    let (backend, store) = store();
    let writer = store
        .entity_repository_with::<NumberBox, _>(SessionOptions::default(), NoSnapshots)
        .await
        .unwrap();
    let id = Id::new();
    let deltas: Vec<NumberDelta> = (1..=5).map(NumberDelta::Add).collect();
    commit_in_chunks(&writer, id, &deltas[..3], 3).await;

    let newer = reduce_all(NumberBox::construct(id), &deltas);
    let newer = Snapshot {
        pointer: Pointer::new(id, Version::new(5)),
        value: store.envelopes().serialize(&newer).unwrap(),
    };
    let options = SessionOptions::default();
    let reader = EntityRepository::<NumberBox>::new(
        store.envelopes().clone(),
        store.agent(),
        Arc::new(SnapshotPolicy::default()),
        backend.source_session(&options).await.unwrap(),
        Box::new(RacingSnapshots {
            inner: backend.snapshot_session(&options).await.unwrap(),
            newer: Mutex::new(Some(newer)),
        }),
        options,
    );

    let loaded = reader.load(Pointer::latest(id)).await.unwrap();
    assert_eq!(loaded.entity.version(), Version::new(3));
    assert_eq!(loaded.replayed, 3);

    let slot = backend
        .snapshot_session(&SessionOptions::read_only())
        .await
        .unwrap()
        .get(Pointer::latest(id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(slot.pointer.version, Version::new(5));
}
