//! In-process stream transport.
//!
//! Every handle opened for the same document shares one [`MemoryLog`], so two
//! engines built on one factory see each other's publishes the way two
//! processes would through a real transport.

use super::{
    MessageStream, PatchStream, SeqRange, StoredMessage, StreamConfig, StreamFactory,
    StreamMessage,
};
use crate::error::StreamError;
use crate::types::DocumentId;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Sequence state shared by the in-memory and file-backed transports.
#[derive(Debug, Clone)]
pub(crate) struct LogState {
    pub(crate) messages: BTreeMap<u64, StoredMessage>,
    pub(crate) next_seq: u64,
    pub(crate) config: StreamConfig,
}

impl Default for LogState {
    fn default() -> Self {
        Self {
            messages: BTreeMap::new(),
            next_seq: 1,
            config: StreamConfig::default(),
        }
    }
}

impl LogState {
    pub(crate) fn append(&mut self, message: StreamMessage) -> Result<StoredMessage, StreamError> {
        self.config.check(&message.headers)?;
        let stored = StoredMessage {
            seq: self.next_seq,
            record: message.record,
            headers: message.headers,
        };
        self.next_seq += 1;
        self.messages.insert(stored.seq, stored.clone());
        Ok(stored)
    }

    pub(crate) fn range(&self, range: SeqRange) -> Vec<StoredMessage> {
        let start = range.start_seq.unwrap_or(0);
        self.messages
            .range(start..)
            .map(|(_, m)| m)
            .take_while(|m| range.contains(m.seq))
            .cloned()
            .collect()
    }

    pub(crate) fn delete_all(&mut self) -> Vec<u64> {
        let seqs = self.messages.keys().copied().collect();
        self.messages.clear();
        seqs
    }
}

/// Shared log behind every handle for one document, with hooks for tests.
#[derive(Debug, Default)]
pub struct MemoryLog {
    state: Mutex<LogState>,
    reads: Mutex<Vec<SeqRange>>,
    failures: Mutex<VecDeque<StreamError>>,
}

impl MemoryLog {
    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn messages(&self) -> Vec<StoredMessage> {
        self.state.lock().range(SeqRange::all())
    }

    pub fn config(&self) -> StreamConfig {
        self.state.lock().config.clone()
    }

    /// Every range passed to `get_all` so far.
    pub fn reads(&self) -> Vec<SeqRange> {
        self.reads.lock().clone()
    }

    pub fn clear_reads(&self) {
        self.reads.lock().clear();
    }

    /// Make the next publish fail with `err`.
    pub fn fail_next_publish(&self, err: StreamError) {
        self.failures.lock().push_back(err);
    }

    /// Drop the stream and start over from sequence 1, as if it had been
    /// deleted and recreated outside of this process.
    pub fn recreate(&self) {
        *self.state.lock() = LogState::default();
    }
}

#[derive(Debug)]
pub struct MemoryStream {
    log: Arc<MemoryLog>,
    closed: AtomicBool,
}

impl MemoryStream {
    fn ensure_open(&self) -> Result<(), StreamError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StreamError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PatchStream for MemoryStream {
    async fn publish(&self, message: StreamMessage) -> Result<u64, StreamError> {
        self.ensure_open()?;
        if let Some(err) = self.log.failures.lock().pop_front() {
            return Err(err);
        }
        Ok(self.log.state.lock().append(message)?.seq)
    }

    async fn get_all(&self, range: SeqRange) -> Result<MessageStream, StreamError> {
        self.ensure_open()?;
        self.log.reads.lock().push(range);
        let messages = self.log.state.lock().range(range);
        Ok(futures::stream::iter(messages.into_iter().map(Ok)).boxed())
    }

    async fn get(&self, seq: u64) -> Result<Option<StoredMessage>, StreamError> {
        self.ensure_open()?;
        Ok(self.log.state.lock().messages.get(&seq).cloned())
    }

    async fn config(&self, update: Option<StreamConfig>) -> Result<StreamConfig, StreamError> {
        self.ensure_open()?;
        let mut state = self.log.state.lock();
        if let Some(config) = update {
            state.config = config;
        }
        Ok(state.config.clone())
    }

    async fn delete_all(&self) -> Result<Vec<u64>, StreamError> {
        self.ensure_open()?;
        Ok(self.log.state.lock().delete_all())
    }

    async fn close(&self) -> Result<(), StreamError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out [`MemoryStream`] handles.
#[derive(Debug, Default)]
pub struct MemoryStreamFactory {
    logs: Mutex<HashMap<DocumentId, Arc<MemoryLog>>>,
}

impl MemoryStreamFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared log for `doc_id`, created on first use.
    pub fn log(&self, doc_id: &DocumentId) -> Arc<MemoryLog> {
        self.logs
            .lock()
            .entry(doc_id.clone())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl StreamFactory for MemoryStreamFactory {
    async fn open(&self, doc_id: &DocumentId) -> Result<Arc<dyn PatchStream>, StreamError> {
        Ok(Arc::new(MemoryStream {
            log: self.log(doc_id),
            closed: AtomicBool::new(false),
        }))
    }
}
