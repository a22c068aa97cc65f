use super::*;
use crate::stream::{collect, MemoryLog, MemoryStreamFactory, StreamFactory, EPOCH_HEADER};
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    store: WatchStore,
    /// Checkpoints of a second writer on another machine.
    other_store: WatchStore,
    factory: MemoryStreamFactory,
    doc: DocumentId,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = WatchStore::open(dir.path().join("watch.redb")).unwrap();
        let other_store = WatchStore::open(dir.path().join("other.redb")).unwrap();
        Self {
            _dir: dir,
            store,
            other_store,
            factory: MemoryStreamFactory::new(),
            doc: DocumentId("doc-under-test".into()),
        }
    }

    async fn reconciler(&self, user_id: u32) -> Reconciler {
        self.reconciler_on(user_id, &self.store).await
    }

    async fn remote(&self, user_id: u32) -> Reconciler {
        self.reconciler_on(user_id, &self.other_store).await
    }

    async fn reconciler_on(&self, user_id: u32, store: &WatchStore) -> Reconciler {
        let stream = self.factory.open(&self.doc).await.unwrap();
        Reconciler::new(
            self.doc.clone(),
            stream,
            store.clone(),
            Arc::new(PatchIdGenerator::new(user_id)),
        )
    }

    fn log(&self) -> Arc<MemoryLog> {
        self.factory.log(&self.doc)
    }
}

async fn edit(rec: &mut Reconciler, from: &str, to: &str) -> Published {
    rec.publish(&patch::diff(from, to), to).await.unwrap().unwrap()
}

#[tokio::test]
async fn first_publish_starts_a_history() {
    let fx = Fixture::new();
    let mut rec = fx.reconciler(1).await;
    assert_eq!(rec.load(None).await.unwrap(), LoadOutcome::Fresh);

    let first = edit(&mut rec, "", "hello").await;
    assert_eq!(first.seq, 1);
    assert_eq!(first.record.version, 1);
    assert!(first.record.parents.is_empty());

    let second = edit(&mut rec, "hello", "hello world").await;
    assert_eq!(second.record.version, 2);
    assert_eq!(second.record.parents, vec![first.record.time]);
    assert!(second.record.time > first.record.time);

    let head = fx.store.get_fs_head(&fx.doc).unwrap().unwrap();
    assert_eq!(head.last_seq, Some(2));
    assert_eq!(head.heads, vec![second.record.time]);
    assert_eq!(head.version, 2);
    assert_eq!(head.content_hash, Some(content_hash("hello world")));
}

#[tokio::test]
async fn empty_patch_is_not_published() {
    let fx = Fixture::new();
    let mut rec = fx.reconciler(1).await;
    assert!(rec.publish(&Patch::default(), "").await.unwrap().is_none());
    assert!(fx.log().is_empty());
}

#[tokio::test]
async fn resume_reads_only_past_the_checkpoint() {
    let fx = Fixture::new();
    {
        let mut rec = fx.reconciler(1).await;
        edit(&mut rec, "", "one").await;
        edit(&mut rec, "one", "one two").await;
        edit(&mut rec, "one two", "one two three").await;
    }
    fx.log().clear_reads();

    let cache = ContentEntry::new("one two three".into());
    let mut rec = fx.reconciler(1).await;
    assert_eq!(
        rec.load(Some(&cache)).await.unwrap(),
        LoadOutcome::Resumed { start_seq: 4 }
    );
    let next = edit(&mut rec, "one two three", "one two three four").await;
    assert_eq!(next.seq, 4);
    assert_eq!(next.start_seq, Some(4));
    assert_eq!(next.record.version, 4);

    let reads = fx.log().reads();
    assert!(!reads.is_empty());
    assert!(reads.iter().all(|r| r.start_seq == Some(4)));
}

#[tokio::test]
async fn recreated_stream_resets_the_checkpoint() {
    let fx = Fixture::new();
    {
        let mut rec = fx.reconciler(1).await;
        edit(&mut rec, "", "a").await;
        edit(&mut rec, "a", "ab").await;
    }
    fx.log().recreate();

    let cache = ContentEntry::new("ab".into());
    let mut rec = fx.reconciler(1).await;
    assert_eq!(rec.load(Some(&cache)).await.unwrap(), LoadOutcome::Reset);
    assert!(fx.store.get_fs_head(&fx.doc).unwrap().is_none());

    let published = edit(&mut rec, "", "abc").await;
    assert_eq!(published.seq, 1);
    assert_eq!(published.start_seq, None);
    assert_eq!(published.record.version, 1);
    assert!(published.record.parents.is_empty());
}

#[tokio::test]
async fn replaced_record_at_checkpoint_counts_as_reset() {
    let fx = Fixture::new();
    {
        let mut rec = fx.reconciler(1).await;
        edit(&mut rec, "", "a").await;
    }
    fx.log().recreate();
    // a different writer fills seq 1 again
    let mut other = fx.remote(2).await;
    edit(&mut other, "", "z").await;

    let mut rec = fx.reconciler(1).await;
    let cache = ContentEntry::new("a".into());
    assert_eq!(rec.load(Some(&cache)).await.unwrap(), LoadOutcome::Reset);
    assert_eq!(rec.state().unwrap().content, "z");
}

#[tokio::test]
async fn checkpoint_without_heads_replays() {
    let fx = Fixture::new();
    {
        let mut rec = fx.reconciler(1).await;
        edit(&mut rec, "", "text").await;
    }
    let mut head = fx.store.get_fs_head(&fx.doc).unwrap().unwrap();
    head.heads.clear();
    fx.store.set_fs_head(&head).unwrap();

    let mut rec = fx.reconciler(1).await;
    let cache = ContentEntry::new("text".into());
    assert_eq!(rec.load(Some(&cache)).await.unwrap(), LoadOutcome::Replayed);
    assert_eq!(rec.state().unwrap().content, "text");
    assert_eq!(rec.state().unwrap().version, 1);
}

#[tokio::test]
async fn stale_cache_falls_back_to_replay() {
    let fx = Fixture::new();
    {
        let mut rec = fx.reconciler(1).await;
        edit(&mut rec, "", "from stream").await;
    }
    let cache = ContentEntry::new("cached but stale".into());
    let mut rec = fx.reconciler(1).await;
    assert_eq!(rec.load(Some(&cache)).await.unwrap(), LoadOutcome::Replayed);
    assert_eq!(rec.state().unwrap().content, "from stream");
}

#[tokio::test]
async fn fenced_publish_reconciles_under_new_epoch() {
    let fx = Fixture::new();
    let stream = fx.factory.open(&fx.doc).await.unwrap();
    stream.config(Some(StreamConfig::with_epoch(1))).await.unwrap();

    let mut rec = fx.reconciler(1).await;
    let first = edit(&mut rec, "", "a").await;
    assert_eq!(fx.log().messages()[0].headers[EPOCH_HEADER], "1");
    assert_eq!(first.seq, 1);

    // history purged elsewhere
    stream.delete_all().await.unwrap();
    stream.config(Some(StreamConfig::with_epoch(2))).await.unwrap();

    let after = edit(&mut rec, "a", "ab").await;
    assert_eq!(after.seq, 2);
    assert_eq!(after.record.version, 1);
    assert!(after.record.parents.is_empty());

    let messages = fx.log().messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].headers[EPOCH_HEADER], "2");
    let replayed = patch::apply("", &patch::decompress(&messages[0].record.patch).unwrap());
    assert_eq!(replayed.result, "ab");
}

#[tokio::test]
async fn second_rejection_is_returned() {
    let fx = Fixture::new();
    let mut rec = fx.reconciler(1).await;
    rec.load(None).await.unwrap();
    for _ in 0..2 {
        fx.log().fail_next_publish(StreamError::Rejected {
            header: EPOCH_HEADER.into(),
            expected: "9".into(),
            got: None,
        });
    }
    let err = rec.publish(&patch::diff("", "x"), "x").await.unwrap_err();
    assert!(matches!(err, SyncError::Stream(StreamError::Rejected { .. })));
    assert!(fx.log().is_empty());
}

#[tokio::test]
async fn snapshots_are_written_on_interval() {
    let fx = Fixture::new();
    let mut rec = fx.reconciler(1).await.with_snapshot_interval(Some(2));
    edit(&mut rec, "", "v1").await;
    let second = edit(&mut rec, "v1", "v1 v2").await;
    assert!(second.record.is_snapshot);
    assert_eq!(second.record.snapshot.as_deref(), Some("v1 v2"));
    edit(&mut rec, "v1 v2", "v1 v2 v3").await;

    let mut fresh = fx.reconciler(1).await;
    fx.store.clear_fs_head(&fx.doc).unwrap();
    assert_eq!(fresh.load(None).await.unwrap(), LoadOutcome::Replayed);
    assert_eq!(fresh.state().unwrap().content, "v1 v2 v3");
}

#[tokio::test]
async fn remote_records_become_parents() {
    let fx = Fixture::new();
    let mut local = fx.reconciler(1).await;
    let base = edit(&mut local, "", "shared text").await;

    let mut remote = fx.remote(2).await;
    let theirs = edit(&mut remote, "shared text", "shared text, remote").await;
    assert_eq!(theirs.record.parents, vec![base.record.time]);

    let ours = edit(&mut local, "shared text", "local shared text").await;
    assert_eq!(ours.record.parents, vec![theirs.record.time]);
    assert_eq!(ours.record.version, 3);
    assert_eq!(local.state().unwrap().content, "local shared text, remote");

    let stream = fx.factory.open(&fx.doc).await.unwrap();
    let all = collect(stream.get_all(SeqRange::all()).await.unwrap())
        .await
        .unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn sync_to_recovers_from_unknown_outcome() {
    let fx = Fixture::new();
    let mut rec = fx.reconciler(1).await;
    edit(&mut rec, "", "base").await;

    // transport drops the connection mid-publish
    fx.log()
        .fail_next_publish(StreamError::Unavailable("connection reset".into()));
    assert!(rec
        .publish(&patch::diff("base", "base+1"), "base+1")
        .await
        .is_err());
    rec.invalidate();

    let synced = rec.sync_to("base+1").await.unwrap().unwrap();
    assert_eq!(synced.record.version, 2);
    assert!(rec.sync_to("base+1").await.unwrap().is_none());
    assert_eq!(fx.log().len(), 2);
}
