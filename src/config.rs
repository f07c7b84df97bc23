use crate::core::{Result, StoreError};
use crate::entity::SnapshotPolicy;
use crate::envelope::EnvelopeCodec;
use crate::session::SessionOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvelopeConfig {
    pub codec: EnvelopeCodec,
}

/// Retry policy for lease-indexed stream commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamConfig {
    pub max_attempts: u32,
    /// Sleep before retry `n` is `backoff_step_ms * n`.
    pub backoff_step_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_step_ms: 100,
        }
    }
}

impl StreamConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff_step(mut self, step: Duration) -> Self {
        self.backoff_step_ms = u64::try_from(step.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_step_ms.saturating_mul(u64::from(attempt)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub envelope: EnvelopeConfig,
    pub stream: StreamConfig,
    pub snapshot: SnapshotPolicy,
    pub session: SessionOptions,
}

impl StoreConfig {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.stream.max_attempts == 0 {
            return Err(StoreError::Config(
                "stream.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
