//! Shared records passed between the watcher, the reconciler and the stream.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use ring::digest;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use uuid::Uuid;

/// Stable identity of one synchronized document.
///
/// Derived from the project id and the path relative to the project root, so
/// it survives the file being moved on disk between processes that agree on
/// the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn derive(project_id: Uuid, relative_path: &Path) -> Self {
        let mut ctx = digest::Context::new(&digest::SHA256);
        ctx.update(project_id.as_bytes());
        ctx.update(&[0]);
        ctx.update(normalize_relative(relative_path).as_bytes());
        let hex = ctx
            .finish()
            .as_ref()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>();
        DocumentId(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Forward slashes, no leading `./`.
pub fn normalize_relative(path: &Path) -> String {
    let joined = path
        .components()
        .filter_map(|c| match c {
            std::path::Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>();
    joined.join("/")
}

/// Identifier of a patch: creation millisecond first, then writer, then a
/// per-writer counter for patches created within the same millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatchId {
    pub millis: i64,
    pub user_id: u32,
    pub counter: u32,
}

impl fmt::Display for PatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.millis, self.user_id, self.counter)
    }
}

/// Hands out strictly increasing patch ids for one writer.
#[derive(Debug)]
pub struct PatchIdGenerator {
    user_id: u32,
    last: Mutex<Option<PatchId>>,
}

impl PatchIdGenerator {
    pub fn new(user_id: u32) -> Self {
        Self {
            user_id,
            last: Mutex::new(None),
        }
    }

    pub fn user_id(&self) -> u32 {
        self.user_id
    }

    pub fn next(&self) -> PatchId {
        self.next_at(Utc::now().timestamp_millis())
    }

    /// Same as [`next`](Self::next) with an explicit clock reading. A clock
    /// that steps backwards keeps the previous millisecond.
    pub fn next_at(&self, now_millis: i64) -> PatchId {
        let mut last = self.last.lock();
        let id = match *last {
            Some(prev) if now_millis <= prev.millis => PatchId {
                millis: prev.millis,
                user_id: self.user_id,
                counter: prev.counter + 1,
            },
            _ => PatchId {
                millis: now_millis,
                user_id: self.user_id,
                counter: 0,
            },
        };
        *last = Some(id);
        id
    }

    /// Make sure ids handed out later sort after `seen`, e.g. after replaying
    /// records written by an earlier run of this writer.
    pub fn observe(&self, seen: PatchId) {
        let mut last = self.last.lock();
        if last.map_or(true, |l| seen >= l) {
            let mut floor = PatchId {
                millis: seen.millis,
                user_id: self.user_id,
                counter: seen.counter,
            };
            if floor <= seen {
                floor = PatchId {
                    millis: seen.millis + 1,
                    user_id: self.user_id,
                    counter: 0,
                };
            }
            *last = Some(floor);
        }
    }
}

/// Unit appended to a document's patch stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchRecord {
    pub time: PatchId,
    pub wall: DateTime<Utc>,
    /// Compressed patch as produced by [`crate::patch::compress`].
    pub patch: String,
    pub user_id: u32,
    #[serde(default)]
    pub parents: Vec<PatchId>,
    pub version: u64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_snapshot: bool,
    /// Full document content, only on snapshot records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
}

/// Resume checkpoint persisted per document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsHead {
    pub doc_id: DocumentId,
    #[serde(default)]
    pub heads: Vec<PatchId>,
    pub version: u64,
    #[serde(default)]
    pub last_seq: Option<u64>,
    #[serde(default)]
    pub time: Option<PatchId>,
    /// Hash of the stream-derived content at `last_seq`.
    #[serde(default)]
    pub content_hash: Option<u32>,
}

/// Last known disk state for one absolute path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentEntry {
    pub content: String,
    pub hash: u32,
    #[serde(default)]
    pub deleted: bool,
    pub updated_at: DateTime<Utc>,
}

impl ContentEntry {
    pub fn new(content: String) -> Self {
        Self {
            hash: content_hash(&content),
            content,
            deleted: false,
            updated_at: Utc::now(),
        }
    }

    /// The text a new patch for this path is diffed against.
    pub fn baseline(&self) -> &str {
        if self.deleted {
            ""
        } else {
            &self.content
        }
    }
}

pub fn content_hash(content: &str) -> u32 {
    crc32fast::hash(content.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn document_id_is_deterministic() {
        let project = Uuid::new_v4();
        let a = DocumentId::derive(project, Path::new("notes/a.txt"));
        let b = DocumentId::derive(project, &PathBuf::from("./notes/a.txt"));
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert_ne!(a, DocumentId::derive(project, Path::new("notes/b.txt")));
        assert_ne!(a, DocumentId::derive(Uuid::new_v4(), Path::new("notes/a.txt")));
    }

    #[test]
    fn patch_ids_increase_within_one_millisecond() {
        let ids = PatchIdGenerator::new(3);
        let a = ids.next_at(1000);
        let b = ids.next_at(1000);
        let c = ids.next_at(999);
        let d = ids.next_at(1001);
        assert!(a < b && b < c && c < d);
        assert_eq!(c.millis, 1000);
        assert_eq!(d.counter, 0);
    }

    #[test]
    fn observe_moves_generator_past_replayed_ids() {
        let seen = PatchId {
            millis: 5000,
            user_id: 9,
            counter: 4,
        };
        let low = PatchIdGenerator::new(1);
        low.observe(seen);
        assert!(low.next_at(10) > seen);

        let high = PatchIdGenerator::new(12);
        high.observe(seen);
        let next = high.next_at(10);
        assert!(next > seen);
        assert_eq!(next.millis, 5000);
    }

    #[test]
    fn deleted_entry_has_empty_baseline() {
        let mut entry = ContentEntry::new("first".into());
        assert_eq!(entry.baseline(), "first");
        entry.deleted = true;
        assert_eq!(entry.baseline(), "");
        assert_eq!(entry.content, "first");
    }
}
