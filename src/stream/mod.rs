//! Free-form append-only streams keyed by strings.
//!
//! A stream has no entity type. Its id is found through a stream-key lease
//! claimed by the first message ever written to it, and every message claims
//! an event-key lease derived from `(stream_key, message_key)`. The backend's
//! lease uniqueness is therefore the only arbiter between concurrent writers:
//! a second writer either loses the race to mint the stream id or finds the
//! event key already taken.

use crate::config::StreamConfig;
use crate::core::{Id, Lease, Pointer, Result, StoreError, Version};
use crate::envelope::{Envelope, EnvelopeService, Resolvable, ResolvedValue};
use crate::session::{CommitOutcome, MessageQuery, SourceSession};
use crate::source::{AgentAccessor, Message, Source};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, event, info_span};

pub const STREAM_SCOPE: &str = "Stream";
pub const STREAM_KEY_LABEL: &str = "StreamKey";
pub const MESSAGE_KEY_LABEL: &str = "MessageKey";

/// Lease mapping a stream key to its entity id.
pub fn stream_key_lease(stream_key: &str) -> Lease {
    Lease::new(STREAM_SCOPE, STREAM_KEY_LABEL, stream_key)
}

/// Lease making `(stream_key, message_key)` appendable once.
pub fn message_key_lease(stream_key: &str, message_key: &str) -> Lease {
    Lease::new(stream_key, MESSAGE_KEY_LABEL, message_key)
}

struct StagedMessage {
    stream_key: String,
    lease: Lease,
    delta: Envelope,
}

struct Plan {
    messages: Vec<Message>,
    minted: Vec<(String, Id)>,
}

/// Idempotent staging and retrying commit for free-form streams.
///
/// Single writer: staging and committing take `&mut self`.
pub struct StreamRepository {
    envelopes: EnvelopeService,
    agent: Arc<dyn AgentAccessor>,
    session: Box<dyn SourceSession>,
    config: StreamConfig,
    staged: Vec<StagedMessage>,
    staged_leases: HashSet<Lease>,
    known_streams: HashMap<String, Id>,
}

impl StreamRepository {
    pub fn new(
        envelopes: EnvelopeService,
        agent: Arc<dyn AgentAccessor>,
        session: Box<dyn SourceSession>,
        config: StreamConfig,
    ) -> Self {
        Self {
            envelopes,
            agent,
            session,
            config,
            staged: Vec::new(),
            staged_leases: HashSet::new(),
            known_streams: HashMap::new(),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn is_read_only(&self) -> bool {
        self.session.is_read_only()
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    /// Drops everything staged but not yet committed.
    pub fn clear(&mut self) {
        self.staged.clear();
        self.staged_leases.clear();
    }

    /// Buffers `delta` for `stream_key` unless `message_key` was already
    /// committed or staged on that stream. Returns whether it was buffered.
    pub async fn stage<D: Resolvable>(
        &mut self,
        stream_key: &str,
        message_key: &str,
        delta: &D,
    ) -> Result<bool> {
        self.ensure_writable()?;
        let lease = message_key_lease(stream_key, message_key);
        if self.staged_leases.contains(&lease) {
            return Ok(false);
        }
        if let Some(existing) = self.session.lease(&lease).await? {
            event!(
                Level::DEBUG,
                stream_key,
                message_key,
                existing = %existing,
                "duplicate stream message skipped"
            );
            return Ok(false);
        }

        let delta = self.envelopes.serialize(delta)?;
        self.staged_leases.insert(lease.clone());
        self.staged.push(StagedMessage {
            stream_key: stream_key.to_string(),
            lease,
            delta,
        });
        Ok(true)
    }

    /// [`commit_with_attempts`](Self::commit_with_attempts) using the configured attempt cap.
    pub async fn commit(&mut self, source_id: Id, cancel: &CancellationToken) -> Result<bool> {
        let max_attempts = self.config.max_attempts;
        self.commit_with_attempts(source_id, max_attempts, cancel)
            .await
    }

    /// Commits the staged messages as one source.
    ///
    /// Each attempt re-plans the source from the store's current leases, so
    /// a writer that lost the race to mint a stream id appends to the winner's
    /// stream instead, and messages another writer already committed are
    /// dropped. A conflict sleeps `backoff_step * attempt` and retries, up to
    /// `max_attempts`; then `false` is returned and the staged messages are kept.
    pub async fn commit_with_attempts(
        &mut self,
        source_id: Id,
        max_attempts: u32,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        self.ensure_writable()?;
        if self.staged.is_empty() {
            return Ok(true);
        }
        let span = info_span!(
            "stream.commit",
            source_id = %source_id,
            staged = self.staged.len(),
            max_attempts
        );
        self.commit_loop(source_id, max_attempts.max(1), cancel)
            .instrument(span)
            .await
    }

    async fn commit_loop(
        &mut self,
        source_id: Id,
        max_attempts: u32,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            attempt += 1;

            let plan = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StoreError::Cancelled),
                plan = self.plan() => plan?,
            };
            if plan.messages.is_empty() {
                event!(Level::DEBUG, "every staged message was already committed");
                self.clear();
                return Ok(true);
            }

            let stamp = self.agent.current(&self.envelopes)?;
            let source = Source::new(source_id, stamp, plan.messages);
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StoreError::Cancelled),
                outcome = self.session.commit(&source) => outcome?,
            };

            match outcome {
                CommitOutcome::Committed => {
                    event!(
                        Level::DEBUG,
                        attempt,
                        messages = source.len(),
                        "stream source committed"
                    );
                    self.known_streams.extend(plan.minted);
                    self.clear();
                    return Ok(true);
                }
                CommitOutcome::Conflict(conflict) => {
                    if attempt >= max_attempts {
                        log::warn!(
                            "Stream commit of source {} gave up after {} attempts: {}",
                            source_id,
                            attempt,
                            conflict
                        );
                        return Ok(false);
                    }
                    let delay = self.config.backoff_for_attempt(attempt);
                    log::warn!(
                        "Stream commit of source {} conflicted ({}), retrying in {:?} (attempt {}/{})",
                        source_id,
                        conflict,
                        delay,
                        attempt,
                        max_attempts
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(StoreError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Assigns pointers to the staged messages against the current store state.
    async fn plan(&self) -> Result<Plan> {
        let mut heads: HashMap<&str, Pointer> = HashMap::new();
        let mut minted = Vec::new();
        let mut messages = Vec::new();

        for staged in &self.staged {
            if self.session.lease(&staged.lease).await?.is_some() {
                continue;
            }
            let key = staged.stream_key.as_str();
            let (pointer, first) = match heads.get(key) {
                Some(head) => (head.next(), false),
                None => match self.stream_id(key).await? {
                    Some(id) => {
                        let latest = self
                            .session
                            .latest_version(id)
                            .await?
                            .unwrap_or(Version::ZERO);
                        (Pointer::new(id, latest.next()), false)
                    }
                    None => {
                        let id = Id::new();
                        minted.push((staged.stream_key.clone(), id));
                        (Pointer::new(id, Version::new(1)), true)
                    }
                },
            };
            heads.insert(key, pointer);

            let mut message =
                Message::new(pointer, staged.delta.clone()).with_add_lease(staged.lease.clone());
            if first {
                message = message.with_add_lease(stream_key_lease(key));
            }
            messages.push(message);
        }

        Ok(Plan { messages, minted })
    }

    /// Entity id behind `stream_key`, if the stream exists.
    pub async fn stream_id(&self, stream_key: &str) -> Result<Option<Id>> {
        if let Some(id) = self.known_streams.get(stream_key) {
            return Ok(Some(*id));
        }
        Ok(self
            .session
            .lease(&stream_key_lease(stream_key))
            .await?
            .map(|pointer| pointer.id))
    }

    /// Committed deltas of `stream_key`, in order.
    pub async fn read<D: Resolvable>(&self, stream_key: &str) -> Result<Vec<D>> {
        self.read_envelopes(stream_key)
            .await?
            .iter()
            .map(|envelope| self.envelopes.deserialize(envelope))
            .collect()
    }

    /// Like [`read`](Self::read) for streams holding several payload types.
    pub async fn read_any(&self, stream_key: &str) -> Result<Vec<ResolvedValue>> {
        self.read_envelopes(stream_key)
            .await?
            .iter()
            .map(|envelope| self.envelopes.deserialize_any(envelope))
            .collect()
    }

    async fn read_envelopes(&self, stream_key: &str) -> Result<Vec<Envelope>> {
        let Some(id) = self.stream_id(stream_key).await? else {
            return Ok(Vec::new());
        };
        let records = self.session.messages(&MessageQuery::for_entity(id)).await?;
        Ok(records
            .into_iter()
            .map(|record| record.message.delta)
            .collect())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.session.is_read_only() {
            return Err(StoreError::ReadOnly("stream staging".to_string()));
        }
        Ok(())
    }
}
