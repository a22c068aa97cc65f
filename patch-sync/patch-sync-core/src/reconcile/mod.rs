//! Head/sequence reconciliation for one document.
//!
//! Decides whether a document resumes from its persisted checkpoint, replays
//! its stream from the beginning, or starts over because the stream was reset
//! underneath it; then assigns `parents`, `version` and the resume offset for
//! every patch this process publishes. One [`Reconciler`] exists per document
//! and callers serialize access to it, so every publish observes the effect of
//! the one before it.

use crate::error::{Result, StreamError, SyncError};
use crate::patch::{self, Patch};
use crate::store::WatchStore;
use crate::stream::{
    MessageStream, PatchStream, SeqRange, StoredMessage, StreamConfig, StreamMessage,
};
use crate::types::{
    content_hash, ContentEntry, DocumentId, FsHead, PatchId, PatchIdGenerator, PatchRecord,
};
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[cfg(test)]
mod tests;

/// What the stream looks like from this process after the last read.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamState {
    /// Text obtained by applying every record in sequence order.
    pub content: String,
    pub heads: Vec<PatchId>,
    pub version: u64,
    pub last_seq: Option<u64>,
    pub time: Option<PatchId>,
    pub config: StreamConfig,
}

impl StreamState {
    fn empty(config: StreamConfig) -> Self {
        Self {
            content: String::new(),
            heads: Vec::new(),
            version: 0,
            last_seq: None,
            time: None,
            config,
        }
    }

    pub fn has_history(&self) -> bool {
        self.last_seq.is_some()
    }

    /// Fold one stored record into the state.
    fn absorb(&mut self, doc_id: &DocumentId, message: &StoredMessage) {
        let record = &message.record;
        match (&record.snapshot, record.is_snapshot) {
            (Some(full), true) => self.content = full.clone(),
            _ => match patch::decompress(&record.patch) {
                Ok(p) => {
                    let applied = patch::apply(&self.content, &p);
                    if !applied.is_clean() {
                        warn!(%doc_id, seq = message.seq, flags = ?applied.applied, "record did not apply cleanly during replay");
                    }
                    self.content = applied.result;
                }
                Err(e) => warn!(%doc_id, seq = message.seq, error = %e, "skipping unreadable patch"),
            },
        }

        self.heads.retain(|h| !record.parents.contains(h));
        if !self.heads.contains(&record.time) {
            self.heads.push(record.time);
            self.heads.sort();
        }
        self.version += 1;
        self.last_seq = Some(message.seq);
        self.time = Some(record.time);
    }

    fn checkpoint(&self, doc_id: &DocumentId) -> FsHead {
        FsHead {
            doc_id: doc_id.clone(),
            heads: self.heads.clone(),
            version: self.version,
            last_seq: self.last_seq,
            time: self.time,
            content_hash: Some(content_hash(&self.content)),
        }
    }
}

/// How [`Reconciler::load`] arrived at its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// No checkpoint and an empty stream.
    Fresh,
    /// Full replay from the first message.
    Replayed,
    /// Continued from the checkpoint, reading only `start_seq` onwards.
    Resumed { start_seq: u64 },
    /// The checkpoint no longer matched the stream; started over.
    Reset,
}

/// A record accepted by the stream.
#[derive(Debug, Clone)]
pub struct Published {
    pub seq: u64,
    pub record: PatchRecord,
    /// Offset the catch-up read before this publish started from.
    pub start_seq: Option<u64>,
}

pub struct Reconciler {
    doc_id: DocumentId,
    stream: Arc<dyn PatchStream>,
    store: WatchStore,
    ids: Arc<PatchIdGenerator>,
    snapshot_interval: Option<u64>,
    state: Option<StreamState>,
    last_start_seq: Option<u64>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("doc_id", &self.doc_id)
            .field("state", &self.state)
            .finish()
    }
}

impl Reconciler {
    pub fn new(
        doc_id: DocumentId,
        stream: Arc<dyn PatchStream>,
        store: WatchStore,
        ids: Arc<PatchIdGenerator>,
    ) -> Self {
        Self {
            doc_id,
            stream,
            store,
            ids,
            snapshot_interval: None,
            state: None,
            last_start_seq: None,
        }
    }

    pub fn with_snapshot_interval(mut self, interval: Option<u64>) -> Self {
        self.snapshot_interval = interval.filter(|n| *n > 0);
        self
    }

    pub fn doc_id(&self) -> &DocumentId {
        &self.doc_id
    }

    pub fn state(&self) -> Option<&StreamState> {
        self.state.as_ref()
    }

    pub fn stream(&self) -> &Arc<dyn PatchStream> {
        &self.stream
    }

    /// Forget everything read so far; the next call reloads from the
    /// checkpoint.
    pub fn invalidate(&mut self) {
        self.state = None;
    }

    /// Establish the stream state, using `cache` as the replay seed when it is
    /// provably the content at the checkpoint.
    pub async fn load(&mut self, cache: Option<&ContentEntry>) -> Result<LoadOutcome> {
        let config = self.stream.config(None).await?;
        let head = self.store.get_fs_head(&self.doc_id)?;

        let Some(head) = head else {
            return self.replay(config).await;
        };

        let Some(last_seq) = head.last_seq else {
            return self.replay(config).await;
        };

        if head.heads.is_empty() {
            info!(doc_id = %self.doc_id, last_seq, "checkpoint has no heads, replaying stream");
            return self.replay(config).await;
        }

        let at_checkpoint = self.stream.get(last_seq).await?;
        let intact = match (&at_checkpoint, head.time) {
            (Some(message), Some(time)) => message.record.time == time,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !intact {
            info!(doc_id = %self.doc_id, last_seq, "stream no longer holds the checkpoint, starting over");
            self.store.clear_fs_head(&self.doc_id)?;
            self.replay(config).await?;
            return Ok(LoadOutcome::Reset);
        }

        let seed = cache
            .filter(|c| !c.deleted && head.content_hash == Some(c.hash))
            .map(|c| c.content.clone());
        let Some(content) = seed else {
            debug!(doc_id = %self.doc_id, "cached content does not match checkpoint, replaying");
            return self.replay(config).await;
        };

        if let Some(time) = head.time {
            self.ids.observe(time);
        }
        self.state = Some(StreamState {
            content,
            heads: head.heads,
            version: head.version,
            last_seq: Some(last_seq),
            time: head.time,
            config,
        });
        let start_seq = last_seq + 1;
        self.catch_up().await?;
        debug!(doc_id = %self.doc_id, start_seq, "resumed from checkpoint");
        Ok(LoadOutcome::Resumed { start_seq })
    }

    /// Rebuild the state from the first message in the stream.
    async fn replay(&mut self, config: StreamConfig) -> Result<LoadOutcome> {
        let mut state = StreamState::empty(config);
        self.last_start_seq = None;
        let messages = self.stream.get_all(SeqRange::all()).await?;
        self.fold(&mut state, messages).await?;
        let outcome = if state.has_history() {
            LoadOutcome::Replayed
        } else {
            LoadOutcome::Fresh
        };
        debug!(doc_id = %self.doc_id, version = state.version, last_seq = ?state.last_seq, "replayed stream");
        self.state = Some(state);
        Ok(outcome)
    }

    /// Read whatever was appended after the last observed sequence number.
    async fn catch_up(&mut self) -> Result<()> {
        let Some(mut state) = self.state.take() else {
            return Ok(());
        };
        let range = match state.last_seq {
            Some(seq) => SeqRange::from(seq + 1),
            None => SeqRange::all(),
        };
        self.last_start_seq = range.start_seq;
        let result = match self.stream.get_all(range).await {
            Ok(messages) => self.fold(&mut state, messages).await,
            Err(e) => Err(e.into()),
        };
        self.state = Some(state);
        result
    }

    async fn fold(&self, state: &mut StreamState, mut messages: MessageStream) -> Result<()> {
        while let Some(message) = messages.next().await {
            let message = message?;
            self.ids.observe(message.record.time);
            state.absorb(&self.doc_id, &message);
        }
        Ok(())
    }

    /// Publish `patch`, which turns the previous local content into `target`.
    ///
    /// If the stream turns out to have been reset (fencing rejection), the
    /// state is rebuilt from scratch and the difference between the rebuilt
    /// content and `target` is published instead. Returns `None` when there is
    /// nothing to publish.
    pub async fn publish(&mut self, patch: &Patch, target: &str) -> Result<Option<Published>> {
        self.publish_inner(Some(patch), target).await
    }

    /// Publish whatever separates the current stream content from `target`.
    /// Used when the local baseline can no longer be trusted, e.g. after a
    /// publish whose outcome is unknown.
    pub async fn sync_to(&mut self, target: &str) -> Result<Option<Published>> {
        self.publish_inner(None, target).await
    }

    async fn publish_inner(
        &mut self,
        patch: Option<&Patch>,
        target: &str,
    ) -> Result<Option<Published>> {
        if self.state.is_none() {
            self.load(None).await?;
        }
        self.catch_up().await?;

        let mut outgoing = match patch {
            Some(patch) => patch.clone(),
            None => {
                let state = self.state.as_ref().ok_or(SyncError::Closed)?;
                patch::diff(&state.content, target)
            }
        };
        let mut fenced = false;
        loop {
            if outgoing.is_empty() {
                return Ok(None);
            }
            let state = self.state.as_ref().ok_or(SyncError::Closed)?;
            let applied = patch::apply(&state.content, &outgoing);
            if !applied.is_clean() {
                warn!(doc_id = %self.doc_id, flags = ?applied.applied, "local patch does not apply cleanly to stream content");
            }
            let next_content = applied.result;
            let version = state.version + 1;
            let is_snapshot = self
                .snapshot_interval
                .map_or(false, |n| version % n == 0);
            let record = PatchRecord {
                time: self.ids.next(),
                wall: Utc::now(),
                patch: patch::compress(&outgoing)?,
                user_id: self.ids.user_id(),
                parents: state.heads.clone(),
                version,
                is_snapshot,
                snapshot: is_snapshot.then(|| next_content.clone()),
            };
            let message = StreamMessage {
                record: record.clone(),
                headers: state.config.required_headers.clone(),
            };

            match self.stream.publish(message).await {
                Ok(seq) => {
                    let state = self.state.as_mut().ok_or(SyncError::Closed)?;
                    state.content = next_content;
                    state.heads = vec![record.time];
                    state.version = version;
                    state.last_seq = Some(seq);
                    state.time = Some(record.time);
                    self.store.set_fs_head(&state.checkpoint(&self.doc_id))?;
                    debug!(doc_id = %self.doc_id, seq, version, "published patch");
                    return Ok(Some(Published {
                        seq,
                        record,
                        start_seq: self.last_start_seq,
                    }));
                }
                Err(StreamError::Rejected { header, expected, got }) if !fenced => {
                    info!(doc_id = %self.doc_id, %header, %expected, ?got, "publish fenced off, reconciling from scratch");
                    fenced = true;
                    self.store.clear_fs_head(&self.doc_id)?;
                    let config = self.stream.config(None).await?;
                    self.replay(config).await?;
                    let state = self.state.as_ref().ok_or(SyncError::Closed)?;
                    outgoing = patch::diff(&state.content, target);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
