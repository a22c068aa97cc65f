//! Document metadata registry.
//!
//! One record per document with the bookkeeping the purge service maintains.
//! The registry is an external collaborator; [`JsonRegistry`] keeps one JSON
//! file per document for the CLI and [`MemoryRegistry`] serves tests.

use crate::error::{Result, SyncError};
use crate::types::{normalize_relative, DocumentId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Free-form document settings. Known keys are typed, anything else is kept
/// as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_epoch: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_purged_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_purged_by: Option<Uuid>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncstringRecord {
    pub string_id: DocumentId,
    pub project_id: Uuid,
    pub path: String,
    #[serde(default)]
    pub last_snapshot: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_seq: Option<u64>,
    #[serde(default)]
    pub settings: DocumentSettings,
    /// Save state reported by editors, opaque here.
    #[serde(default)]
    pub save: Option<serde_json::Value>,
    #[serde(default = "default_doctype")]
    pub doctype: String,
}

fn default_doctype() -> String {
    "string".to_string()
}

impl SyncstringRecord {
    /// Default record for a document the registry has never seen.
    pub fn new(project_id: Uuid, relative_path: &Path) -> Self {
        Self {
            string_id: DocumentId::derive(project_id, relative_path),
            project_id,
            path: normalize_relative(relative_path),
            last_snapshot: None,
            last_seq: None,
            settings: DocumentSettings::default(),
            save: None,
            doctype: default_doctype(),
        }
    }

    pub fn history_epoch(&self) -> u64 {
        self.settings.history_epoch.unwrap_or(0)
    }
}

#[async_trait]
pub trait DocumentRegistry: Send + Sync {
    async fn get(&self, doc_id: &DocumentId) -> Result<Option<SyncstringRecord>>;
    async fn save(&self, record: &SyncstringRecord) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryRegistry {
    records: Mutex<HashMap<DocumentId, SyncstringRecord>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentRegistry for MemoryRegistry {
    async fn get(&self, doc_id: &DocumentId) -> Result<Option<SyncstringRecord>> {
        Ok(self.records.lock().get(doc_id).cloned())
    }

    async fn save(&self, record: &SyncstringRecord) -> Result<()> {
        self.records
            .lock()
            .insert(record.string_id.clone(), record.clone());
        Ok(())
    }
}

/// One `<string_id>.json` file per document under a directory.
#[derive(Debug, Clone)]
pub struct JsonRegistry {
    dir: PathBuf,
}

impl JsonRegistry {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SyncError::io(&dir, e))?;
        Ok(Self { dir })
    }

    fn record_path(&self, doc_id: &DocumentId) -> PathBuf {
        self.dir.join(format!("{}.json", doc_id))
    }
}

#[async_trait]
impl DocumentRegistry for JsonRegistry {
    async fn get(&self, doc_id: &DocumentId) -> Result<Option<SyncstringRecord>> {
        let path = self.record_path(doc_id);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SyncError::io(path, e)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| SyncError::Registry(format!("{}: {}", path.display(), e)))
    }

    async fn save(&self, record: &SyncstringRecord) -> Result<()> {
        let path = self.record_path(&record.string_id);
        let temp_path = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| SyncError::Registry(e.to_string()))?;
        tokio::fs::write(&temp_path, bytes)
            .await
            .map_err(|e| SyncError::io(&temp_path, e))?;
        tokio::fs::rename(&temp_path, &path)
            .await
            .map_err(|e| SyncError::io(&path, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn json_registry_round_trips_settings() {
        let dir = TempDir::new().unwrap();
        let registry = JsonRegistry::open(dir.path()).await.unwrap();
        let mut record = SyncstringRecord::new(Uuid::new_v4(), Path::new("docs/a.md"));
        assert!(registry.get(&record.string_id).await.unwrap().is_none());

        record.settings.history_epoch = Some(3);
        record
            .settings
            .extra
            .insert("spellcheck".into(), serde_json::json!(false));
        registry.save(&record).await.unwrap();

        let loaded = registry.get(&record.string_id).await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert_eq!(loaded.history_epoch(), 3);
        assert_eq!(loaded.path, "docs/a.md");
    }

    #[tokio::test]
    async fn unreadable_record_is_an_error() {
        let dir = TempDir::new().unwrap();
        let registry = JsonRegistry::open(dir.path()).await.unwrap();
        let doc = DocumentId("broken".into());
        std::fs::write(dir.path().join("broken.json"), b"{").unwrap();
        assert!(matches!(
            registry.get(&doc).await,
            Err(SyncError::Registry(_))
        ));
    }
}
