//! Patch stream client.
//!
//! One append-only, sequence-numbered log per document. The transport itself
//! is an external collaborator; this module fixes the small interface the
//! engine needs and ships two implementations: [`memory`] for tests and
//! single-process use, and [`wal`], a durable log file per document.

use crate::error::StreamError;
use crate::types::{DocumentId, PatchRecord};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

pub mod memory;
pub mod wal;

#[cfg(test)]
mod tests;

pub use memory::{MemoryLog, MemoryStreamFactory};
pub use wal::WalStreamFactory;

/// Header carrying the history epoch every publish must match.
pub const EPOCH_HEADER: &str = "history_epoch";

/// A message as handed to [`PatchStream::publish`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    pub record: PatchRecord,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// A message as stored by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub seq: u64,
    pub record: PatchRecord,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Inclusive sequence bounds for [`PatchStream::get_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeqRange {
    pub start_seq: Option<u64>,
    pub end_seq: Option<u64>,
}

impl SeqRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn from(start_seq: u64) -> Self {
        Self {
            start_seq: Some(start_seq),
            end_seq: None,
        }
    }

    pub fn contains(&self, seq: u64) -> bool {
        self.start_seq.map_or(true, |s| seq >= s) && self.end_seq.map_or(true, |e| seq <= e)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Headers every publish must carry with exactly these values.
    #[serde(default)]
    pub required_headers: BTreeMap<String, String>,
}

impl StreamConfig {
    pub fn with_epoch(epoch: u64) -> Self {
        let mut required_headers = BTreeMap::new();
        required_headers.insert(EPOCH_HEADER.to_string(), epoch.to_string());
        Self { required_headers }
    }

    /// Epoch required by this config, 0 when none is set.
    pub fn epoch(&self) -> u64 {
        self.required_headers
            .get(EPOCH_HEADER)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Reject `headers` unless every required header is present and equal.
    pub fn check(&self, headers: &BTreeMap<String, String>) -> Result<(), StreamError> {
        for (name, expected) in &self.required_headers {
            let got = headers.get(name);
            if got != Some(expected) {
                return Err(StreamError::Rejected {
                    header: name.clone(),
                    expected: expected.clone(),
                    got: got.cloned(),
                });
            }
        }
        Ok(())
    }
}

pub type MessageStream = BoxStream<'static, Result<StoredMessage, StreamError>>;

/// Handle on one document's patch stream.
#[async_trait]
pub trait PatchStream: Send + Sync {
    /// Append a message; returns the sequence number assigned to it.
    async fn publish(&self, message: StreamMessage) -> Result<u64, StreamError>;

    /// Messages within `range`, in sequence order.
    async fn get_all(&self, range: SeqRange) -> Result<MessageStream, StreamError>;

    async fn get(&self, seq: u64) -> Result<Option<StoredMessage>, StreamError>;

    /// Replace the stream config when `update` is given; returns the config
    /// now in force.
    async fn config(&self, update: Option<StreamConfig>) -> Result<StreamConfig, StreamError>;

    /// Remove every message; returns the removed sequence numbers. Sequence
    /// numbers are never reused afterwards.
    async fn delete_all(&self) -> Result<Vec<u64>, StreamError>;

    async fn close(&self) -> Result<(), StreamError>;
}

/// Opens stream handles by document identity.
#[async_trait]
pub trait StreamFactory: Send + Sync {
    async fn open(&self, doc_id: &DocumentId) -> Result<Arc<dyn PatchStream>, StreamError>;
}

/// Drain a [`MessageStream`] into memory.
pub async fn collect(mut messages: MessageStream) -> Result<Vec<StoredMessage>, StreamError> {
    let mut out = Vec::new();
    while let Some(message) = messages.next().await {
        out.push(message?);
    }
    Ok(out)
}
