//! Filesystem watch and diff producer.
//!
//! [`SyncEngine`] is the per-process context: it owns the local store, the
//! stream factory, one event channel per path and one watcher task per active
//! path. A watcher task listens to `notify` events on the file's parent
//! directory, debounces them, and runs a diff pass against the cached
//! baseline. Every change is emitted to subscribers first and then published
//! through the document's [`Reconciler`].

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, WatchEvent};
use crate::patch::{self, Patch};
use crate::reconcile::{LoadOutcome, Published, Reconciler};
use crate::store::WatchStore;
use crate::stream::StreamFactory;
use crate::types::{DocumentId, PatchIdGenerator};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};


/// Capacity of the channel bridging `notify` callbacks into a watcher task.
/// Overflow is harmless: one pending wake-up is enough to trigger a pass.
const NOTIFY_CHANNEL_CAPACITY: usize = 64;

/// How long `close` waits for a watcher task to finish its current pass.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Optional details supplied with a heartbeat. Only the heartbeat that
/// registers a path reads them; refreshes of an active watch ignore them.
#[derive(Debug, Clone, Default)]
pub struct WatchMeta {
    /// Writer id for patches of this document, instead of the engine's.
    pub user_id: Option<u32>,
}

/// Per-document state shared by every pass over the same document.
struct DocumentHandle {
    doc_id: DocumentId,
    reconciler: tokio::sync::Mutex<Reconciler>,
    /// Set when a publish failed; the next pass re-derives from the stream.
    resync: AtomicBool,
}

struct ActiveWatch {
    doc: Arc<DocumentHandle>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    _watcher: RecommendedWatcher,
    last_beat: Instant,
}

struct EngineInner {
    config: SyncConfig,
    root: PathBuf,
    store: WatchStore,
    streams: Arc<dyn StreamFactory>,
    ids: Arc<PatchIdGenerator>,
    documents: Mutex<HashMap<DocumentId, Arc<DocumentHandle>>>,
    watches: Mutex<HashMap<PathBuf, ActiveWatch>>,
    buses: Mutex<HashMap<PathBuf, EventBus>>,
    /// Per-path locks serializing registration and deactivation, so a path
    /// is initialized once and a drop of interest is never overtaken.
    registrations: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Watches files under one root and keeps their patch streams current.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("root", &self.inner.root)
            .field("active", &self.inner.watches.lock().len())
            .finish()
    }
}

impl SyncEngine {
    pub fn new(config: SyncConfig, store: WatchStore, streams: Arc<dyn StreamFactory>) -> Self {
        let root = std::path::absolute(&config.root).unwrap_or_else(|_| config.root.clone());
        let ids = Arc::new(PatchIdGenerator::new(config.user_id));
        Self {
            inner: Arc::new(EngineInner {
                config,
                root,
                store,
                streams,
                ids,
                documents: Mutex::new(HashMap::new()),
                watches: Mutex::new(HashMap::new()),
                buses: Mutex::new(HashMap::new()),
                registrations: Mutex::new(HashMap::new()),
                reaper: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn store(&self) -> &WatchStore {
        &self.inner.store
    }

    /// Identity of the document behind `path`.
    pub fn doc_id(&self, path: impl AsRef<Path>) -> Result<DocumentId> {
        let (_, relative) = self.inner.resolve(path.as_ref())?;
        Ok(DocumentId::derive(self.inner.config.project_id, &relative))
    }

    /// Register, refresh or drop interest in `path`.
    ///
    /// The first active heartbeat initializes the document from its stream
    /// and starts a watcher task; later ones only refresh the TTL. An inactive
    /// heartbeat stops the watcher, closes the path's event channel and drops
    /// the path's cached content and checkpoint.
    pub async fn heartbeat(
        &self,
        path: impl AsRef<Path>,
        active: bool,
        meta: Option<WatchMeta>,
    ) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let (absolute, relative) = inner.resolve(path.as_ref())?;

        if !active {
            inner.deactivate(&absolute, None).await?;
            return Ok(());
        }

        let slot = inner.registration_slot(&absolute);
        let _registering = slot.lock().await;
        if inner.refresh_beat(&absolute) {
            return Ok(());
        }
        inner.ensure_open()?;

        let doc = inner.document(&relative, meta.as_ref()).await?;
        inner
            .with_retry(&absolute, || inner.initialize(&absolute, &doc))
            .await?;

        let (wake_tx, wake_rx) = mpsc::channel(NOTIFY_CHANNEL_CAPACITY);
        let watcher = file_watcher(&absolute, wake_tx)?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_watcher(
            Arc::downgrade(&self.inner),
            absolute.clone(),
            doc.clone(),
            wake_rx,
            shutdown_rx,
        ));
        inner.watches.lock().insert(
            absolute.clone(),
            ActiveWatch {
                doc,
                shutdown,
                task,
                _watcher: watcher,
                last_beat: Instant::now(),
            },
        );
        self.ensure_reaper();
        info!(path = %absolute.display(), "watching");
        Ok(())
    }

    /// Events for `path`. The channel closes when the path is deactivated.
    pub fn subscribe(&self, path: impl AsRef<Path>) -> Result<broadcast::Receiver<WatchEvent>> {
        self.inner.ensure_open()?;
        let (absolute, _) = self.inner.resolve(path.as_ref())?;
        Ok(self.inner.bus_or_create(&absolute).subscribe())
    }

    /// Run one diff pass for an active path now. Returns the event emitted,
    /// if any.
    pub async fn scan(&self, path: impl AsRef<Path>) -> Result<Option<WatchEvent>> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let (absolute, _) = inner.resolve(path.as_ref())?;
        let doc = inner
            .watches
            .lock()
            .get(&absolute)
            .map(|w| w.doc.clone())
            .ok_or_else(|| SyncError::NotWatched(absolute.clone()))?;
        inner.scan_document(&absolute, &doc).await
    }

    pub fn active_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.inner.watches.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Deactivate every watch whose last heartbeat is older than the
    /// configured TTL. Returns the paths that were stopped.
    pub async fn expire_idle(&self) -> Vec<PathBuf> {
        self.inner.expire_idle().await
    }

    /// Stop all watchers and release stream handles. The engine refuses
    /// further calls afterwards.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(reaper) = inner.reaper.lock().take() {
            reaper.abort();
        }

        let watches: Vec<(PathBuf, ActiveWatch)> = inner.watches.lock().drain().collect();
        for (path, active) in watches {
            let _ = active.shutdown.send(true);
            drop(active._watcher);
            let mut task = active.task;
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                warn!(path = %path.display(), "watcher did not stop in time, aborting");
                task.abort();
                let _ = task.await;
            }
        }
        inner.buses.lock().clear();

        let documents: Vec<Arc<DocumentHandle>> =
            inner.documents.lock().drain().map(|(_, d)| d).collect();
        for doc in documents {
            let reconciler = doc.reconciler.lock().await;
            if let Err(e) = reconciler.stream().close().await {
                warn!(doc_id = %doc.doc_id, error = %e, "failed to close stream");
            }
        }
        info!("sync engine closed");
        Ok(())
    }

    fn ensure_reaper(&self) {
        let Some(ttl) = self.inner.config.heartbeat_ttl() else {
            return;
        };
        let mut reaper = self.inner.reaper.lock();
        if reaper.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let period = (ttl / 2).max(Duration::from_secs(1));
        *reaper = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            loop {
                ticks.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.expire_idle().await;
            }
        }));
    }
}

impl EngineInner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(SyncError::Closed)
        } else {
            Ok(())
        }
    }

    /// Absolute path plus path relative to the root.
    fn resolve(&self, path: &Path) -> Result<(PathBuf, PathBuf)> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        let relative = absolute
            .strip_prefix(&self.root)
            .map_err(|_| SyncError::OutsideRoot(absolute.clone()))?
            .to_path_buf();
        if relative.as_os_str().is_empty() {
            return Err(SyncError::OutsideRoot(absolute));
        }
        Ok((absolute, relative))
    }

    fn registration_slot(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        self.registrations
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .clone()
    }

    /// Forget the lock for `path` unless another caller is still using it.
    fn release_slot(&self, path: &Path) {
        let mut slots = self.registrations.lock();
        if slots.get(path).map_or(false, |slot| Arc::strong_count(slot) == 1) {
            slots.remove(path);
        }
    }

    /// Refresh the heartbeat of an active watch. False when `path` is not
    /// watched.
    fn refresh_beat(&self, path: &Path) -> bool {
        match self.watches.lock().get_mut(path) {
            Some(existing) => {
                existing.last_beat = Instant::now();
                true
            }
            None => false,
        }
    }

    fn bus(&self, path: &Path) -> Option<EventBus> {
        self.buses.lock().get(path).cloned()
    }

    fn bus_or_create(&self, path: &Path) -> EventBus {
        self.buses
            .lock()
            .entry(path.to_path_buf())
            .or_insert_with(|| EventBus::new(self.config.event_capacity))
            .clone()
    }

    fn emit(&self, event: WatchEvent) {
        if let Some(bus) = self.bus(event.path()) {
            bus.send(event);
        }
    }

    async fn document(
        &self,
        relative: &Path,
        meta: Option<&WatchMeta>,
    ) -> Result<Arc<DocumentHandle>> {
        let doc_id = DocumentId::derive(self.config.project_id, relative);
        if let Some(doc) = self.documents.lock().get(&doc_id) {
            return Ok(doc.clone());
        }

        let stream = self.streams.open(&doc_id).await?;
        let ids = match meta.and_then(|m| m.user_id) {
            Some(user_id) if user_id != self.ids.user_id() => {
                Arc::new(PatchIdGenerator::new(user_id))
            }
            _ => self.ids.clone(),
        };
        let reconciler = Reconciler::new(doc_id.clone(), stream, self.store.clone(), ids)
            .with_snapshot_interval(self.config.snapshot_interval);
        let doc = Arc::new(DocumentHandle {
            doc_id: doc_id.clone(),
            reconciler: tokio::sync::Mutex::new(reconciler),
            resync: AtomicBool::new(false),
        });
        Ok(self
            .documents
            .lock()
            .entry(doc_id)
            .or_insert(doc)
            .clone())
    }

    /// Establish the baseline for a newly watched path.
    async fn initialize(&self, path: &Path, doc: &DocumentHandle) -> Result<()> {
        let mut reconciler = doc.reconciler.lock().await;
        doc.resync.store(false, Ordering::SeqCst);
        let cache = self.store.get(path)?;
        let outcome = reconciler.load(cache.as_ref()).await?;
        let state = reconciler.state().cloned().ok_or(SyncError::Closed)?;
        let disk = read_disk(path).await?;
        debug!(path = %path.display(), doc_id = %doc.doc_id, ?outcome, "initializing watch");

        if !state.has_history() {
            let seed = match (&cache, &disk) {
                (Some(entry), Some(_)) if !entry.deleted => Some(entry.content.clone()),
                (_, Some(text)) => Some(text.clone()),
                _ => None,
            };
            let Some(seed) = seed else {
                if cache.is_some() {
                    self.store.set_deleted(path)?;
                }
                return Ok(());
            };
            self.store.set_content(path, &seed)?;
            let seeding = patch::diff("", &seed);
            if let Some(published) = self
                .publish(&mut reconciler, doc, path, PublishKind::Patch(&seeding), &seed)
                .await?
            {
                info!(path = %path.display(), seq = published.seq, "seeded empty stream");
            }
            if let Some(text) = disk.filter(|text| *text != seed) {
                self.apply_change(&mut reconciler, doc, path, &seed, &text).await?;
            }
            return Ok(());
        }

        if outcome == LoadOutcome::Reset {
            info!(path = %path.display(), "stream was reset, adopting its content");
        }
        // deleted while nobody watched: only a file this host knew about
        // clears the stream
        let known_here = cache.as_ref().map_or(false, |entry| !entry.deleted);
        self.store.set_content(path, &state.content)?;
        match disk {
            Some(text) if text != state.content => {
                self.apply_change(&mut reconciler, doc, path, &state.content, &text)
                    .await?;
            }
            Some(_) => {}
            None if known_here && !state.content.is_empty() => {
                self.apply_delete(&mut reconciler, doc, path, &state.content)
                    .await?;
            }
            None => {
                self.store.set_deleted(path)?;
            }
        }
        Ok(())
    }

    /// One diff pass: compare disk with the cached baseline and publish the
    /// difference.
    async fn scan_document(&self, path: &Path, doc: &DocumentHandle) -> Result<Option<WatchEvent>> {
        let mut reconciler = doc.reconciler.lock().await;
        let cache = self.store.get(path)?;
        let disk = read_disk(path).await?;

        if doc.resync.load(Ordering::SeqCst) {
            let target = disk.clone().unwrap_or_default();
            reconciler.invalidate();
            self.publish(&mut reconciler, doc, path, PublishKind::Resync, &target)
                .await?;
            doc.resync.store(false, Ordering::SeqCst);
        }

        let Some(text) = disk else {
            let Some(entry) = cache.filter(|c| !c.deleted) else {
                return Ok(None);
            };
            let event = self
                .apply_delete(&mut reconciler, doc, path, &entry.content)
                .await?;
            return Ok(Some(event));
        };

        let base = cache.as_ref().map_or("", |c| c.baseline()).to_string();
        if cache.as_ref().map_or(false, |c| !c.deleted) && base == text {
            return Ok(None);
        }
        self.apply_change(&mut reconciler, doc, path, &base, &text)
            .await
    }

    /// Record `text` as the new baseline, emit the change, then publish it.
    async fn apply_change(
        &self,
        reconciler: &mut Reconciler,
        doc: &DocumentHandle,
        path: &Path,
        base: &str,
        text: &str,
    ) -> Result<Option<WatchEvent>> {
        let change = patch::diff(base, text);
        self.store.set_content(path, text)?;
        if change.is_empty() {
            return Ok(None);
        }
        let event = WatchEvent::Change {
            path: path.to_path_buf(),
            patch: change.clone(),
        };
        self.emit(event.clone());
        self.publish(reconciler, doc, path, PublishKind::Patch(&change), text)
            .await?;
        Ok(Some(event))
    }

    /// Mark `path` deleted, emit the deletion, then publish a patch clearing
    /// `previous`.
    async fn apply_delete(
        &self,
        reconciler: &mut Reconciler,
        doc: &DocumentHandle,
        path: &Path,
        previous: &str,
    ) -> Result<WatchEvent> {
        self.store.set_deleted(path)?;
        let event = WatchEvent::Delete {
            path: path.to_path_buf(),
        };
        self.emit(event.clone());
        debug!(path = %path.display(), "file deleted");
        let clearing = patch::diff(previous, "");
        self.publish(reconciler, doc, path, PublishKind::Patch(&clearing), "")
            .await?;
        Ok(event)
    }

    /// Publish with the configured deadline. A failure is reported to
    /// subscribers and marks the document for resync before it is returned.
    async fn publish(
        &self,
        reconciler: &mut Reconciler,
        doc: &DocumentHandle,
        path: &Path,
        kind: PublishKind<'_>,
        target: &str,
    ) -> Result<Option<Published>> {
        let timeout = self.config.publish_timeout();
        let attempt = async {
            match kind {
                PublishKind::Patch(change) => reconciler.publish(change, target).await,
                PublishKind::Resync => reconciler.sync_to(target).await,
            }
        };
        let result = match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::PublishTimeout(timeout)),
        };
        match result {
            Ok(published) => {
                if let Some(p) = &published {
                    debug!(path = %path.display(), seq = p.seq, version = p.record.version, "patch published");
                }
                Ok(published)
            }
            Err(e) => {
                error!(path = %path.display(), doc_id = %doc.doc_id, error = %e, "publish failed");
                reconciler.invalidate();
                doc.resync.store(true, Ordering::SeqCst);
                self.emit(WatchEvent::PublishFailed {
                    path: path.to_path_buf(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Run `op`, retrying transient failures with exponential backoff.
    async fn with_retry<T, F, Fut>(&self, path: &Path, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.config.retry_attempts => {
                    let delay = self.config.retry_base_delay() * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    warn!(path = %path.display(), attempt, ?delay, error = %e, "transient failure, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Remove the watch for `path` and close its event channel. With a
    /// `reason` the subscribers get a `Stopped` event first. The document
    /// handle is dropped from the engine; the caller owns its release.
    fn stop_watch(&self, path: &Path, reason: Option<String>) -> Option<ActiveWatch> {
        let removed = self.watches.lock().remove(path);
        if let Some(reason) = reason {
            self.emit(WatchEvent::Stopped {
                path: path.to_path_buf(),
                reason,
            });
        }
        self.buses.lock().remove(path);
        let active = removed?;
        let _ = active.shutdown.send(true);
        self.documents.lock().remove(&active.doc.doc_id);
        debug!(path = %path.display(), "watch stopped");
        Some(active)
    }

    /// Drop interest in `path`: stop its watcher, wait for the pass in
    /// flight, forget its cached content and checkpoint, close its stream.
    async fn deactivate(&self, path: &Path, reason: Option<String>) -> Result<bool> {
        let slot = self.registration_slot(path);
        let registering = slot.lock().await;
        let stopped = match self.stop_watch(path, reason) {
            Some(active) => {
                let mut task = active.task;
                if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                    warn!(path = %path.display(), "watcher did not stop in time, aborting");
                    task.abort();
                    let _ = task.await;
                }
                let reconciler = active.doc.reconciler.lock().await;
                self.store.forget(path)?;
                self.store.clear_fs_head(&active.doc.doc_id)?;
                if let Err(e) = reconciler.stream().close().await {
                    warn!(doc_id = %active.doc.doc_id, error = %e, "failed to close stream");
                }
                true
            }
            None => false,
        };
        drop(registering);
        drop(slot);
        self.release_slot(path);
        Ok(stopped)
    }

    async fn expire_idle(&self) -> Vec<PathBuf> {
        let Some(ttl) = self.config.heartbeat_ttl() else {
            return Vec::new();
        };
        let now = Instant::now();
        let idle: Vec<PathBuf> = self
            .watches
            .lock()
            .iter()
            .filter(|(_, w)| now.duration_since(w.last_beat) >= ttl)
            .map(|(p, _)| p.clone())
            .collect();
        let mut expired = Vec::with_capacity(idle.len());
        for path in idle {
            info!(path = %path.display(), "heartbeat expired");
            match self
                .deactivate(&path, Some("heartbeat expired".to_string()))
                .await
            {
                Ok(true) => expired.push(path),
                Ok(false) => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to release expired watch");
                    expired.push(path);
                }
            }
        }
        expired
    }
}

enum PublishKind<'a> {
    Patch(&'a Patch),
    Resync,
}

/// Current disk content, `None` when the file does not exist.
async fn read_disk(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SyncError::io(path, e)),
    }
}

/// Watch the parent directory of `path` and wake the task on any event that
/// names the file.
fn file_watcher(path: &Path, wake: mpsc::Sender<()>) -> Result<RecommendedWatcher> {
    let parent = path
        .parent()
        .ok_or_else(|| SyncError::OutsideRoot(path.to_path_buf()))?
        .to_path_buf();
    let name: OsString = path
        .file_name()
        .ok_or_else(|| SyncError::OutsideRoot(path.to_path_buf()))?
        .to_os_string();

    let mut watcher = RecommendedWatcher::new(
        move |res: std::result::Result<notify::Event, notify::Error>| match res {
            Ok(event) => {
                if matches!(event.kind, EventKind::Access(_)) {
                    return;
                }
                if event.paths.iter().any(|p| p.file_name() == Some(name.as_os_str())) {
                    // a full channel already holds a pending wake-up
                    let _ = wake.try_send(());
                }
            }
            Err(e) => warn!(error = %e, "filesystem watcher error"),
        },
        notify::Config::default(),
    )
    .map_err(|e| SyncError::io(&parent, std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    watcher
        .watch(&parent, RecursiveMode::NonRecursive)
        .map_err(|e| SyncError::io(&parent, std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    Ok(watcher)
}

/// Body of one watcher task: wait for a wake-up, let the burst settle, run a
/// pass. Exits on shutdown or when the engine is gone.
async fn run_watcher(
    engine: Weak<EngineInner>,
    path: PathBuf,
    doc: Arc<DocumentHandle>,
    mut wake: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let debounce = match engine.upgrade() {
        Some(inner) => inner.config.debounce(),
        None => return,
    };

    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            woken = wake.recv() => if woken.is_none() { return },
        }

        // debounce: wait until the directory has been quiet for a full window
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(debounce) => break,
                woken = wake.recv() => if woken.is_none() { return },
            }
        }

        let Some(inner) = engine.upgrade() else {
            return;
        };
        if *shutdown.borrow() {
            return;
        }
        let pass = inner
            .with_retry(&path, || inner.scan_document(&path, &doc))
            .await;
        if let Err(e) = pass {
            error!(path = %path.display(), error = %e, "stopping watch");
            inner.stop_watch(&path, Some(e.to_string()));
            if let Err(e) = doc.reconciler.lock().await.stream().close().await {
                warn!(doc_id = %doc.doc_id, error = %e, "failed to close stream");
            }
            return;
        }
    }
}
