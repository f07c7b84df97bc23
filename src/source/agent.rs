use super::AgentStamp;
use crate::core::Result;
use crate::envelope::{Envelope, EnvelopeService, Resolvable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Supplies the timestamp and signature of the actor committing right now.
///
/// The store never looks inside the signature; it only wraps it in an envelope.
pub trait AgentAccessor: Send + Sync {
    fn current(&self, envelopes: &EnvelopeService) -> Result<AgentStamp>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSignature {
    pub host: String,
    pub process_id: u32,
    pub application: String,
}

crate::resolvable!(ProcessSignature => "sourcedb", "sourcedb::source::agent::ProcessSignature");

impl ProcessSignature {
    pub fn capture(application: impl Into<String>) -> Self {
        let host = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "localhost".to_string());
        Self {
            host,
            process_id: std::process::id(),
            application: application.into(),
        }
    }
}

/// Signs every source with the host, process id and application name.
#[derive(Debug, Clone)]
pub struct ProcessAgentAccessor {
    signature: ProcessSignature,
}

impl ProcessAgentAccessor {
    pub fn new(application: impl Into<String>) -> Self {
        Self {
            signature: ProcessSignature::capture(application),
        }
    }

    pub fn signature(&self) -> &ProcessSignature {
        &self.signature
    }
}

impl Default for ProcessAgentAccessor {
    fn default() -> Self {
        Self::new(env!("CARGO_PKG_NAME"))
    }
}

impl AgentAccessor for ProcessAgentAccessor {
    fn current(&self, envelopes: &EnvelopeService) -> Result<AgentStamp> {
        Ok(AgentStamp {
            timestamp: Utc::now(),
            signature: envelopes.serialize(&self.signature)?,
        })
    }
}

/// Same signature every time; optionally a frozen clock. For batch jobs and tests.
#[derive(Debug, Clone)]
pub struct FixedAgentAccessor {
    signature: Envelope,
    timestamp: Option<DateTime<Utc>>,
}

impl FixedAgentAccessor {
    pub fn new<S: Resolvable>(envelopes: &EnvelopeService, signature: &S) -> Result<Self> {
        Ok(Self {
            signature: envelopes.serialize(signature)?,
            timestamp: None,
        })
    }

    pub fn from_envelope(signature: Envelope) -> Self {
        Self {
            signature,
            timestamp: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

impl AgentAccessor for FixedAgentAccessor {
    fn current(&self, _envelopes: &EnvelopeService) -> Result<AgentStamp> {
        Ok(AgentStamp {
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            signature: self.signature.clone(),
        })
    }
}
