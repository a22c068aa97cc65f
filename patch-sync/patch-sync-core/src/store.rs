//! Local watch store backed by a single redb file.
//!
//! Two tables: last known content per absolute path, and the resume
//! checkpoint per document. Each call runs in its own transaction; there are
//! no cross-key transactions. The store is a cache, so an entry that fails to
//! decode is reported as missing.

use crate::error::Result;
use crate::types::{ContentEntry, DocumentId, FsHead};
use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

const CONTENT_TABLE: Table = TableDefinition::new("content_by_path");
const HEAD_TABLE: Table = TableDefinition::new("fs_head_by_doc");

#[derive(Clone)]
pub struct WatchStore {
    db: Arc<Database>,
    location: PathBuf,
}

impl std::fmt::Debug for WatchStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchStore")
            .field("location", &self.location)
            .finish()
    }
}

impl WatchStore {
    /// Open or create the store file. Fails if another process holds it.
    pub fn open(location: impl AsRef<Path>) -> Result<Self> {
        let location = location.as_ref().to_path_buf();
        if let Some(parent) = location.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| crate::error::SyncError::io(parent, e))?;
            }
        }
        let db = Database::create(&location)?;

        // create both tables so read transactions never see them missing
        let tx = db.begin_write()?;
        {
            tx.open_table(CONTENT_TABLE)?;
            tx.open_table(HEAD_TABLE)?;
        }
        tx.commit()?;

        Ok(Self {
            db: Arc::new(db),
            location,
        })
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn get(&self, path: &Path) -> Result<Option<ContentEntry>> {
        self.read(CONTENT_TABLE, &path_key(path))
    }

    /// Record `content` as the current disk state of `path`, clearing any
    /// deleted marker.
    pub fn set_content(&self, path: &Path, content: &str) -> Result<ContentEntry> {
        let entry = ContentEntry::new(content.to_string());
        self.write(CONTENT_TABLE, &path_key(path), &entry)?;
        Ok(entry)
    }

    /// Mark `path` as deleted on disk. The last content is kept.
    pub fn set_deleted(&self, path: &Path) -> Result<ContentEntry> {
        let key = path_key(path);
        let mut entry = self
            .read::<ContentEntry>(CONTENT_TABLE, &key)?
            .unwrap_or_else(|| ContentEntry::new(String::new()));
        entry.deleted = true;
        entry.updated_at = Utc::now();
        self.write(CONTENT_TABLE, &key, &entry)?;
        Ok(entry)
    }

    /// Drop the cached content of `path` entirely.
    pub fn forget(&self, path: &Path) -> Result<()> {
        self.remove(CONTENT_TABLE, &path_key(path))
    }

    pub fn get_fs_head(&self, doc_id: &DocumentId) -> Result<Option<FsHead>> {
        self.read(HEAD_TABLE, doc_id.as_str())
    }

    pub fn set_fs_head(&self, head: &FsHead) -> Result<()> {
        self.write(HEAD_TABLE, head.doc_id.as_str(), head)
    }

    pub fn clear_fs_head(&self, doc_id: &DocumentId) -> Result<()> {
        self.remove(HEAD_TABLE, doc_id.as_str())
    }

    fn read<T: DeserializeOwned>(
        &self,
        table_def: Table,
        key: &str,
    ) -> Result<Option<T>> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(table_def)?;
        let Some(raw) = table.get(key)? else {
            return Ok(None);
        };
        match serde_json::from_slice(raw.value()) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(key, error = %e, "unreadable store entry treated as absent");
                Ok(None)
            }
        }
    }

    fn write<T: Serialize>(
        &self,
        table_def: Table,
        key: &str,
        value: &T,
    ) -> Result<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| crate::error::SyncError::Store(e.to_string()))?;
        self.write_raw(table_def, key, &bytes)
    }

    fn write_raw(
        &self,
        table_def: Table,
        key: &str,
        bytes: &[u8],
    ) -> Result<()> {
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(table_def)?;
            table.insert(key, bytes)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn remove(&self, table_def: Table, key: &str) -> Result<()> {
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(table_def)?;
            table.remove(key)?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
