//! Purging history while a watcher is live

use anyhow::Result;
use patch_sync_core::{
    access::AllowAll,
    history::{DocumentRef, HistoryRequest, PurgeRequest},
    patch,
    registry::{DocumentRegistry, MemoryRegistry},
    stream::{MemoryLog, MemoryStreamFactory, EPOCH_HEADER},
    HistoryService, SyncConfig, SyncEngine, WatchStore,
};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

fn replay(log: &MemoryLog) -> String {
    log.messages().into_iter().fold(String::new(), |content, m| {
        let p = patch::decompress(&m.record.patch).unwrap();
        patch::apply(&content, &p).result
    })
}

#[tokio::test]
async fn stale_writer_reconciles_after_purge() -> Result<()> {
    let root = TempDir::new()?;
    let state = TempDir::new()?;
    let project = Uuid::new_v4();
    let streams = Arc::new(MemoryStreamFactory::new());
    let registry = Arc::new(MemoryRegistry::new());

    let mut config = SyncConfig::for_root(project, root.path());
    config.debounce_ms = 60_000;
    let store = WatchStore::open(state.path().join("watch.redb"))?;
    let engine = SyncEngine::new(config, store, streams.clone());

    let path = root.path().join("doc.txt");
    std::fs::write(&path, "draft")?;
    engine.heartbeat(&path, true, None).await?;
    std::fs::write(&path, "draft two")?;
    engine.scan(&path).await?;
    std::fs::write(&path, "draft three")?;
    engine.scan(&path).await?;

    let document = DocumentRef::new(project, "doc.txt");
    let log = streams.log(&document.doc_id());
    assert_eq!(log.len(), 3);

    let service = HistoryService::new(registry.clone(), streams.clone(), Arc::new(AllowAll));
    let admin = Uuid::new_v4();
    let purged = service
        .purge_history(PurgeRequest {
            account_id: admin,
            document: document.clone(),
            keep_current_state: true,
        })
        .await?;
    assert_eq!(purged.deleted, 3);
    assert_eq!(purged.history_epoch, 1);
    assert!(!purged.seeded);
    assert!(log.is_empty());

    // the watcher still holds the old epoch; its next publish is fenced and
    // it starts a fresh history under epoch 1
    std::fs::write(&path, "final draft")?;
    engine.scan(&path).await?;
    let messages = log.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].seq, 4);
    assert_eq!(messages[0].record.version, 1);
    assert!(messages[0].record.parents.is_empty());
    assert_eq!(messages[0].headers[EPOCH_HEADER], "1");
    assert_eq!(replay(&log), "final draft");

    let again = service
        .purge_history(PurgeRequest {
            account_id: admin,
            document: document.clone(),
            keep_current_state: false,
        })
        .await?;
    assert_eq!(again.history_epoch, 2);
    assert_eq!(again.deleted, 1);

    std::fs::write(&path, "final draft, revised")?;
    engine.scan(&path).await?;
    let response = service
        .history(HistoryRequest {
            account_id: admin,
            document: document.clone(),
            start_seq: None,
            end_seq: None,
        })
        .await?;
    assert_eq!(response.patches.len(), 1);
    assert_eq!(response.info.history_epoch, 2);
    assert_eq!(replay(&log), "final draft, revised");
    assert_eq!(log.messages()[0].headers[EPOCH_HEADER], "2");

    let record = registry.get(&document.doc_id()).await?.unwrap();
    assert_eq!(record.settings.history_epoch, Some(2));
    assert_eq!(record.settings.history_purged_by, Some(admin));

    engine.close().await?;
    Ok(())
}
