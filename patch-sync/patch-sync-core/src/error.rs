use std::path::PathBuf;

/// Errors raised by a stream transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    /// The transport refused a publish because a required header did not match.
    #[error("publish rejected: header {header} expected {expected:?}, got {got:?}")]
    Rejected {
        header: String,
        expected: String,
        got: Option<String>,
    },
    #[error("stream unavailable: {0}")]
    Unavailable(String),
    #[error("stream closed")]
    Closed,
    #[error("corrupt stream entry: {0}")]
    Corrupt(String),
    #[error("stream io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::Io(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid base64 in patch: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid patch payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("patch decompression failed: {0}")]
    Inflate(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("local store error: {0}")]
    Store(String),
    #[error("registry error: {0}")]
    Registry(String),
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("permission denied: {0}")]
    Unauthorized(String),
    #[error("path is outside the sync root: {0}")]
    OutsideRoot(PathBuf),
    #[error("path is not being watched: {0}")]
    NotWatched(PathBuf),
    #[error("publish did not complete within {0:?}")]
    PublishTimeout(std::time::Duration),
    #[error("sync engine is closed")]
    Closed,
}

impl SyncError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the operation may succeed if retried after a delay.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Io { .. } | SyncError::PublishTimeout(_) => true,
            SyncError::Stream(StreamError::Unavailable(_) | StreamError::Io(_)) => true,
            _ => false,
        }
    }
}

macro_rules! store_err {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for SyncError {
                fn from(err: $ty) -> Self {
                    SyncError::Store(err.to_string())
                }
            }
        )*
    };
}

store_err!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
