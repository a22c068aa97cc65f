//! History inspection and purge.
//!
//! Purging bumps the document's history epoch, fences the stream on it, and
//! only then deletes every message. Writers still holding the previous epoch
//! have their next publish rejected and reconcile from the emptied stream.

use crate::access::AccessCheck;
use crate::error::Result;
use crate::registry::{DocumentRegistry, SyncstringRecord};
use crate::stream::{collect, PatchStream, SeqRange, StreamFactory, EPOCH_HEADER};
use crate::types::{DocumentId, PatchRecord};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// A document named by project and project-relative path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub project_id: Uuid,
    pub path: PathBuf,
}

impl DocumentRef {
    pub fn new(project_id: Uuid, path: impl Into<PathBuf>) -> Self {
        Self {
            project_id,
            path: path.into(),
        }
    }

    pub fn doc_id(&self) -> DocumentId {
        DocumentId::derive(self.project_id, &self.path)
    }
}

#[derive(Debug, Clone)]
pub struct HistoryRequest {
    pub account_id: Uuid,
    pub document: DocumentRef,
    pub start_seq: Option<u64>,
    pub end_seq: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPatch {
    pub seq: u64,
    #[serde(flatten)]
    pub record: PatchRecord,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryInfo {
    pub doc_id: DocumentId,
    pub history_epoch: u64,
    pub last_seq: Option<u64>,
    pub history_purged_at: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryResponse {
    pub patches: Vec<HistoryPatch>,
    pub info: HistoryInfo,
}

#[derive(Debug, Clone)]
pub struct PurgeRequest {
    pub account_id: Uuid,
    pub document: DocumentRef,
    /// Accepted for compatibility; the emptied stream is reseeded by the next
    /// writer that opens it.
    pub keep_current_state: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeResult {
    pub deleted: usize,
    pub seeded: bool,
    pub history_epoch: u64,
}

pub struct HistoryService {
    registry: Arc<dyn DocumentRegistry>,
    streams: Arc<dyn StreamFactory>,
    access: Arc<dyn AccessCheck>,
}

impl HistoryService {
    pub fn new(
        registry: Arc<dyn DocumentRegistry>,
        streams: Arc<dyn StreamFactory>,
        access: Arc<dyn AccessCheck>,
    ) -> Self {
        Self {
            registry,
            streams,
            access,
        }
    }

    pub async fn history(&self, request: HistoryRequest) -> Result<HistoryResponse> {
        let document = &request.document;
        self.access
            .check(request.account_id, document.project_id)
            .await?;

        let doc_id = document.doc_id();
        let record = self.registry.get(&doc_id).await?;
        let stream = self.streams.open(&doc_id).await?;
        let range = SeqRange {
            start_seq: request.start_seq,
            end_seq: request.end_seq,
        };
        let read = async {
            let config = stream.config(None).await?;
            let messages = collect(stream.get_all(range).await?).await?;
            Ok::<_, crate::error::SyncError>((config, messages))
        }
        .await;
        release(&doc_id, stream.as_ref()).await;
        let (config, messages) = read?;

        let patches: Vec<HistoryPatch> = messages
            .into_iter()
            .map(|m| HistoryPatch {
                seq: m.seq,
                record: m.record,
            })
            .collect();
        let info = HistoryInfo {
            doc_id,
            history_epoch: record
                .as_ref()
                .map_or(0, |r| r.history_epoch())
                .max(config.epoch()),
            last_seq: patches.last().map(|p| p.seq),
            history_purged_at: record.and_then(|r| r.settings.history_purged_at),
        };
        Ok(HistoryResponse { patches, info })
    }

    pub async fn purge_history(&self, request: PurgeRequest) -> Result<PurgeResult> {
        let document = &request.document;
        self.access
            .check(request.account_id, document.project_id)
            .await?;

        let doc_id = document.doc_id();
        let mut record = self
            .registry
            .get(&doc_id)
            .await?
            .unwrap_or_else(|| SyncstringRecord::new(document.project_id, &document.path));

        let stream = self.streams.open(&doc_id).await?;
        let outcome = async {
            let mut config = stream.config(None).await?;
            let history_epoch = record.history_epoch().max(config.epoch()) + 1;

            // fence before deleting so no stale writer can append in between
            config
                .required_headers
                .insert(EPOCH_HEADER.to_string(), history_epoch.to_string());
            stream.config(Some(config)).await?;
            let deleted = stream.delete_all().await?.len();

            record.last_snapshot = None;
            record.last_seq = None;
            record.settings.history_epoch = Some(history_epoch);
            record.settings.history_purged_at = Some(Utc::now());
            record.settings.history_purged_by = Some(request.account_id);
            self.registry.save(&record).await?;

            Ok::<_, crate::error::SyncError>(PurgeResult {
                deleted,
                seeded: false,
                history_epoch,
            })
        }
        .await;
        release(&doc_id, stream.as_ref()).await;

        let result = outcome?;
        info!(
            %doc_id,
            deleted = result.deleted,
            history_epoch = result.history_epoch,
            keep_current_state = request.keep_current_state,
            "purged document history"
        );
        Ok(result)
    }
}

async fn release(doc_id: &DocumentId, stream: &dyn PatchStream) {
    if let Err(e) = stream.close().await {
        warn!(%doc_id, error = %e, "failed to close stream handle");
    }
}
