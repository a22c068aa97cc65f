//! Durable stream transport: one append-only log file per document.
//!
//! Frames are length-prefixed and CRC-checked. A torn frame at the end of a
//! file (crash during append) is cut off on open. Purging rewrites the file
//! to a header that only remembers the config and the last sequence number
//! handed out, so sequence numbers keep increasing across purges.
//!
//! Several processes may open the same log (a watcher and a purge run from
//! the command line). Every operation takes an advisory lock and reloads the
//! file first if another process appended to it or replaced it.

use super::memory::LogState;
use super::{
    MessageStream, PatchStream, SeqRange, StoredMessage, StreamConfig, StreamFactory,
    StreamMessage,
};
use crate::error::StreamError;
use crate::types::DocumentId;
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use crc32fast::Hasher;
use fs2::FileExt;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

const MAGIC: &[u8] = b"PSYNCL01";

const FRAME_MESSAGE: u8 = 1;
const FRAME_CONFIG: u8 = 2;
const FRAME_PURGE: u8 = 3;

#[derive(Debug)]
enum Frame {
    Message(StoredMessage),
    Config(StreamConfig),
    Purge { through_seq: u64 },
}

struct WalLog {
    path: PathBuf,
    /// Advisory lock shared with every other process opening the same log.
    /// Lives in a sibling file because purging replaces the log itself.
    lock: File,
    inner: Mutex<WalInner>,
}

struct WalInner {
    file: File,
    state: LogState,
    seen: FileStamp,
}

/// Identity of the log file as last read or written by this handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    ino: u64,
    len: u64,
}

impl FileStamp {
    #[cfg(unix)]
    fn of(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            ino: meta.ino(),
            len: meta.len(),
        }
    }

    #[cfg(not(unix))]
    fn of(meta: &std::fs::Metadata) -> Self {
        Self {
            ino: 0,
            len: meta.len(),
        }
    }
}

impl WalLog {
    fn open(path: PathBuf) -> Result<Self, StreamError> {
        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path.with_extension("lock"))?;
        lock.lock_exclusive()?;
        let loaded = load(&path);
        FileExt::unlock(&lock)?;
        let inner = loaded?;
        Ok(Self {
            path,
            lock,
            inner: Mutex::new(inner),
        })
    }

    /// Run `op` holding the cross-process lock, after catching up with any
    /// change another process made to the file.
    fn locked<T>(
        &self,
        op: impl FnOnce(&mut WalInner) -> Result<T, StreamError>,
    ) -> Result<T, StreamError> {
        let mut inner = self.inner.lock();
        self.lock.lock_exclusive()?;
        let result = self.refresh(&mut inner).and_then(|()| op(&mut inner));
        FileExt::unlock(&self.lock)?;
        result
    }

    fn refresh(&self, inner: &mut WalInner) -> Result<(), StreamError> {
        let current = match std::fs::metadata(&self.path) {
            Ok(meta) => Some(FileStamp::of(&meta)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        if current == Some(inner.seen) {
            return Ok(());
        }
        debug!(path = %self.path.display(), "stream log changed on disk, reloading");
        *inner = load(&self.path)?;
        Ok(())
    }

    fn append_frame(inner: &mut WalInner, frame: &Frame) -> Result<(), StreamError> {
        let encoded = encode_frame(frame)?;
        inner.file.write_all(&encoded)?;
        inner.file.sync_data()?;
        inner.seen = FileStamp::of(&inner.file.metadata()?);
        Ok(())
    }

    fn publish(&self, message: StreamMessage) -> Result<u64, StreamError> {
        self.locked(|inner| {
            inner.state.config.check(&message.headers)?;
            let stored = StoredMessage {
                seq: inner.state.next_seq,
                record: message.record,
                headers: message.headers,
            };
            Self::append_frame(inner, &Frame::Message(stored.clone()))?;
            let seq = stored.seq;
            replay(&mut inner.state, Frame::Message(stored));
            Ok(seq)
        })
    }

    fn read<T>(&self, op: impl FnOnce(&LogState) -> T) -> Result<T, StreamError> {
        self.locked(|inner| Ok(op(&inner.state)))
    }

    fn set_config(&self, config: StreamConfig) -> Result<StreamConfig, StreamError> {
        self.locked(|inner| {
            Self::append_frame(inner, &Frame::Config(config.clone()))?;
            inner.state.config = config.clone();
            Ok(config)
        })
    }

    /// Drop every message and rewrite the file down to its header frames.
    fn delete_all(&self) -> Result<Vec<u64>, StreamError> {
        self.locked(|inner| {
            let seqs = inner.state.delete_all();
            let through_seq = inner.state.next_seq - 1;

            let temp_path = self.path.with_extension("tmp");
            {
                let mut temp = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&temp_path)?;
                temp.write_all(MAGIC)?;
                temp.write_all(&encode_frame(&Frame::Config(inner.state.config.clone()))?)?;
                temp.write_all(&encode_frame(&Frame::Purge { through_seq })?)?;
                temp.sync_all()?;
            }
            std::fs::rename(&temp_path, &self.path)?;
            inner.file = OpenOptions::new().append(true).open(&self.path)?;
            inner.seen = FileStamp::of(&inner.file.metadata()?);

            debug!(path = %self.path.display(), removed = seqs.len(), through_seq, "purged stream log");
            Ok(seqs)
        })
    }
}

/// Read the whole log, cutting off a torn tail, and open it for appending.
/// The caller holds the cross-process lock.
fn load(path: &Path) -> Result<WalInner, StreamError> {
    let mut state = LogState::default();
    let mut valid_len = MAGIC.len() as u64;

    if path.exists() {
        let mut reader = BufReader::new(File::open(path)?);
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(StreamError::Corrupt(format!(
                "{} is not a patch stream log",
                path.display()
            )));
        }
        while let Ok((frame, len)) = decode_frame(&mut reader) {
            valid_len += len;
            replay(&mut state, frame);
        }
    }

    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)?;
    let on_disk = file.metadata()?.len();
    if on_disk == 0 {
        file.write_all(MAGIC)?;
        file.sync_data()?;
    } else if on_disk > valid_len {
        warn!(path = %path.display(), on_disk, valid_len, "truncating torn tail of stream log");
        file.set_len(valid_len)?;
        file.sync_data()?;
    }
    let file = OpenOptions::new().append(true).open(path)?;
    let seen = FileStamp::of(&file.metadata()?);
    Ok(WalInner { file, state, seen })
}

fn replay(state: &mut LogState, frame: Frame) {
    match frame {
        Frame::Message(message) => {
            state.next_seq = state.next_seq.max(message.seq + 1);
            state.messages.insert(message.seq, message);
        }
        Frame::Config(config) => state.config = config,
        Frame::Purge { through_seq } => {
            state.messages.retain(|seq, _| *seq > through_seq);
            state.next_seq = state.next_seq.max(through_seq + 1);
        }
    }
}

fn encode_frame(frame: &Frame) -> Result<Vec<u8>, StreamError> {
    let mut buf = BytesMut::new();
    match frame {
        Frame::Message(message) => {
            let json = serde_json::to_vec(message).map_err(|e| StreamError::Corrupt(e.to_string()))?;
            buf.put_u8(FRAME_MESSAGE);
            buf.put_u64(message.seq);
            buf.put_u32(json.len() as u32);
            buf.put(json.as_slice());
        }
        Frame::Config(config) => {
            let json = serde_json::to_vec(config).map_err(|e| StreamError::Corrupt(e.to_string()))?;
            buf.put_u8(FRAME_CONFIG);
            buf.put_u32(json.len() as u32);
            buf.put(json.as_slice());
        }
        Frame::Purge { through_seq } => {
            buf.put_u8(FRAME_PURGE);
            buf.put_u64(*through_seq);
        }
    }

    // Length prefix and CRC
    let data = buf.freeze();
    let mut hasher = Hasher::new();
    hasher.update(&data);
    let crc = hasher.finalize();

    let mut out = BytesMut::with_capacity(data.len() + 8);
    out.put_u32(data.len() as u32 + 4);
    out.put(data);
    out.put_u32(crc);
    Ok(out.to_vec())
}

/// Decode one frame; returns it with the number of bytes consumed.
fn decode_frame<R: Read>(reader: &mut R) -> Result<(Frame, u64), StreamError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len < 5 {
        return Err(StreamError::Corrupt("frame too short".into()));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    let data_len = len - 4;
    let (data, crc_bytes) = buf.split_at(data_len);
    let crc = u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let mut hasher = Hasher::new();
    hasher.update(data);
    if hasher.finalize() != crc {
        return Err(StreamError::Corrupt("CRC mismatch".into()));
    }

    let mut cursor = data;
    let frame = match cursor.get_u8() {
        FRAME_MESSAGE if cursor.remaining() >= 12 => {
            let seq = cursor.get_u64();
            let json_len = cursor.get_u32() as usize;
            let json = cursor.get(..json_len).ok_or_else(|| StreamError::Corrupt("short message".into()))?;
            let mut message: StoredMessage =
                serde_json::from_slice(json).map_err(|e| StreamError::Corrupt(e.to_string()))?;
            message.seq = seq;
            Frame::Message(message)
        }
        FRAME_CONFIG if cursor.remaining() >= 4 => {
            let json_len = cursor.get_u32() as usize;
            let json = cursor.get(..json_len).ok_or_else(|| StreamError::Corrupt("short config".into()))?;
            Frame::Config(serde_json::from_slice(json).map_err(|e| StreamError::Corrupt(e.to_string()))?)
        }
        FRAME_PURGE if cursor.remaining() >= 8 => Frame::Purge {
            through_seq: cursor.get_u64(),
        },
        other => return Err(StreamError::Corrupt(format!("unknown frame type {other}"))),
    };
    Ok((frame, (len + 4) as u64))
}

struct WalStream {
    log: Arc<WalLog>,
    closed: AtomicBool,
}

impl WalStream {
    fn ensure_open(&self) -> Result<(), StreamError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StreamError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PatchStream for WalStream {
    async fn publish(&self, message: StreamMessage) -> Result<u64, StreamError> {
        self.ensure_open()?;
        self.log.publish(message)
    }

    async fn get_all(&self, range: SeqRange) -> Result<MessageStream, StreamError> {
        self.ensure_open()?;
        let messages = self.log.read(|state| state.range(range))?;
        Ok(futures::stream::iter(messages.into_iter().map(Ok)).boxed())
    }

    async fn get(&self, seq: u64) -> Result<Option<StoredMessage>, StreamError> {
        self.ensure_open()?;
        self.log.read(|state| state.messages.get(&seq).cloned())
    }

    async fn config(&self, update: Option<StreamConfig>) -> Result<StreamConfig, StreamError> {
        self.ensure_open()?;
        match update {
            Some(config) => self.log.set_config(config),
            None => self.log.read(|state| state.config.clone()),
        }
    }

    async fn delete_all(&self) -> Result<Vec<u64>, StreamError> {
        self.ensure_open()?;
        self.log.delete_all()
    }

    async fn close(&self) -> Result<(), StreamError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Opens file-backed streams under one directory, one file per document.
pub struct WalStreamFactory {
    dir: PathBuf,
    logs: Mutex<HashMap<DocumentId, Arc<WalLog>>>,
}

impl WalStreamFactory {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, StreamError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            logs: Mutex::new(HashMap::new()),
        })
    }

    pub fn log_path(&self, doc_id: &DocumentId) -> PathBuf {
        self.dir.join(format!("{}.log", doc_id))
    }
}

#[async_trait]
impl StreamFactory for WalStreamFactory {
    async fn open(&self, doc_id: &DocumentId) -> Result<Arc<dyn PatchStream>, StreamError> {
        let mut logs = self.logs.lock();
        let log = match logs.get(doc_id) {
            Some(log) => log.clone(),
            None => {
                let log = Arc::new(WalLog::open(self.log_path(doc_id))?);
                logs.insert(doc_id.clone(), log.clone());
                log
            }
        };
        Ok(Arc::new(WalStream {
            log,
            closed: AtomicBool::new(false),
        }))
    }
}
