use super::*;
use crate::types::{PatchId, PatchRecord};
use chrono::Utc;
use std::io::Write;
use tempfile::TempDir;

fn record(n: u64) -> PatchRecord {
    PatchRecord {
        time: PatchId {
            millis: 1_000 + n as i64,
            user_id: 1,
            counter: 0,
        },
        wall: Utc::now(),
        patch: String::new(),
        user_id: 1,
        parents: vec![],
        version: n,
        is_snapshot: false,
        snapshot: None,
    }
}

fn message(n: u64, epoch: Option<u64>) -> StreamMessage {
    let mut headers = BTreeMap::new();
    if let Some(epoch) = epoch {
        headers.insert(EPOCH_HEADER.to_string(), epoch.to_string());
    }
    StreamMessage {
        record: record(n),
        headers,
    }
}

async fn publish_three(stream: &Arc<dyn PatchStream>) {
    for n in 1..=3 {
        let seq = stream.publish(message(n, None)).await.unwrap();
        assert_eq!(seq, n);
    }
}

#[tokio::test]
async fn memory_range_reads_are_inclusive() {
    let factory = MemoryStreamFactory::new();
    let doc = DocumentId("doc".into());
    let stream = factory.open(&doc).await.unwrap();
    publish_three(&stream).await;

    let tail = collect(stream.get_all(SeqRange::from(2)).await.unwrap())
        .await
        .unwrap();
    assert_eq!(tail.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![2, 3]);

    let middle = SeqRange {
        start_seq: Some(2),
        end_seq: Some(2),
    };
    let one = collect(stream.get_all(middle).await.unwrap()).await.unwrap();
    assert_eq!(one.len(), 1);
    assert_eq!(factory.log(&doc).reads(), vec![SeqRange::from(2), middle]);
}

#[tokio::test]
async fn required_headers_fence_publishers() {
    let factory = MemoryStreamFactory::new();
    let stream = factory.open(&DocumentId("doc".into())).await.unwrap();
    stream.config(Some(StreamConfig::with_epoch(2))).await.unwrap();

    let err = stream.publish(message(1, Some(1))).await.unwrap_err();
    assert!(matches!(err, StreamError::Rejected { ref expected, .. } if expected == "2"));
    let err = stream.publish(message(1, None)).await.unwrap_err();
    assert!(matches!(err, StreamError::Rejected { got: None, .. }));
    assert_eq!(stream.publish(message(1, Some(2))).await.unwrap(), 1);
    assert_eq!(stream.config(None).await.unwrap().epoch(), 2);
}

#[tokio::test]
async fn closed_handle_refuses_calls() {
    let factory = MemoryStreamFactory::new();
    let doc = DocumentId("doc".into());
    let stream = factory.open(&doc).await.unwrap();
    stream.close().await.unwrap();
    assert!(matches!(stream.get(1).await, Err(StreamError::Closed)));

    // other handles on the same document are unaffected
    let other = factory.open(&doc).await.unwrap();
    assert_eq!(other.publish(message(1, None)).await.unwrap(), 1);
}

#[tokio::test]
async fn wal_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let doc = DocumentId("doc".into());
    {
        let factory = WalStreamFactory::new(dir.path()).unwrap();
        let stream = factory.open(&doc).await.unwrap();
        publish_three(&stream).await;
        stream.config(Some(StreamConfig::with_epoch(4))).await.unwrap();
    }

    let factory = WalStreamFactory::new(dir.path()).unwrap();
    let stream = factory.open(&doc).await.unwrap();
    let all = collect(stream.get_all(SeqRange::all()).await.unwrap())
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[2].record, record(3));
    assert_eq!(stream.config(None).await.unwrap().epoch(), 4);
    assert_eq!(stream.publish(message(4, Some(4))).await.unwrap(), 4);
}

#[tokio::test]
async fn wal_purge_keeps_sequence_monotonic() {
    let dir = TempDir::new().unwrap();
    let doc = DocumentId("doc".into());
    {
        let factory = WalStreamFactory::new(dir.path()).unwrap();
        let stream = factory.open(&doc).await.unwrap();
        publish_three(&stream).await;
        let removed = stream.delete_all().await.unwrap();
        assert_eq!(removed, vec![1, 2, 3]);
        assert!(stream.get(3).await.unwrap().is_none());
        assert_eq!(stream.publish(message(1, None)).await.unwrap(), 4);
    }

    let factory = WalStreamFactory::new(dir.path()).unwrap();
    let stream = factory.open(&doc).await.unwrap();
    let all = collect(stream.get_all(SeqRange::all()).await.unwrap())
        .await
        .unwrap();
    assert_eq!(all.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![4]);
    assert_eq!(stream.publish(message(2, None)).await.unwrap(), 5);
}

#[tokio::test]
async fn wal_drops_torn_tail() {
    let dir = TempDir::new().unwrap();
    let doc = DocumentId("doc".into());
    let path = {
        let factory = WalStreamFactory::new(dir.path()).unwrap();
        let stream = factory.open(&doc).await.unwrap();
        publish_three(&stream).await;
        factory.log_path(&doc)
    };

    // half-written frame from a crash mid-append
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(&[0, 0, 1, 0, 1, 2, 3]).unwrap();
    drop(file);

    let factory = WalStreamFactory::new(dir.path()).unwrap();
    let stream = factory.open(&doc).await.unwrap();
    assert_eq!(stream.publish(message(4, None)).await.unwrap(), 4);
    drop(stream);
    drop(factory);

    let factory = WalStreamFactory::new(dir.path()).unwrap();
    let stream = factory.open(&doc).await.unwrap();
    let all = collect(stream.get_all(SeqRange::all()).await.unwrap())
        .await
        .unwrap();
    assert_eq!(all.len(), 4);
}

#[tokio::test]
async fn wal_purge_from_another_handle_fences_stale_writer() {
    let dir = TempDir::new().unwrap();
    let doc = DocumentId("doc".into());
    // two factories stand in for two processes sharing the directory
    let watcher = WalStreamFactory::new(dir.path()).unwrap();
    let admin = WalStreamFactory::new(dir.path()).unwrap();

    let stale = watcher.open(&doc).await.unwrap();
    assert_eq!(stale.publish(message(1, None)).await.unwrap(), 1);

    let purger = admin.open(&doc).await.unwrap();
    purger.config(Some(StreamConfig::with_epoch(1))).await.unwrap();
    assert_eq!(purger.delete_all().await.unwrap(), vec![1]);

    let err = stale.publish(message(2, None)).await.unwrap_err();
    assert!(matches!(err, StreamError::Rejected { got: None, .. }));
    assert_eq!(stale.config(None).await.unwrap().epoch(), 1);
    assert!(stale.get(1).await.unwrap().is_none());

    // under the new epoch the old handle continues the sequence
    assert_eq!(stale.publish(message(2, Some(1))).await.unwrap(), 2);
    let seen = collect(purger.get_all(SeqRange::all()).await.unwrap())
        .await
        .unwrap();
    assert_eq!(seen.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![2]);
}

#[tokio::test]
async fn wal_appends_from_another_handle_are_visible() {
    let dir = TempDir::new().unwrap();
    let doc = DocumentId("doc".into());
    let first = WalStreamFactory::new(dir.path()).unwrap();
    let second = WalStreamFactory::new(dir.path()).unwrap();
    let a = first.open(&doc).await.unwrap();
    let b = second.open(&doc).await.unwrap();

    assert_eq!(a.publish(message(1, None)).await.unwrap(), 1);
    assert_eq!(b.publish(message(2, None)).await.unwrap(), 2);
    assert_eq!(a.publish(message(3, None)).await.unwrap(), 3);
    assert_eq!(b.get(3).await.unwrap().map(|m| m.record), Some(record(3)));
}
