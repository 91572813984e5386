//! The ingestion worker keeps an [`AnnotationStore`] in sync with a set
//! of directories.
//!
//! It runs as a single tokio task that owns the store, the queue and
//! all state. Callers talk to it through a cloneable [`IngestHandle`].
//! Blocking work (stat, header reads, directory walks) runs on the
//! blocking pool and annotator calls run as separate tasks; both post
//! their completion back to the worker as an event, so at most one
//! file is in flight and every mutation happens on the worker task.
//!
//! Lifecycle:
//!
//! 1. `WaitingForAnnotators`: readiness is polled every
//!    `poll_interval` until every annotator reports ready. File events
//!    are queued meanwhile.
//! 2. `Watching`: the roots are watched (unless disabled), walked once,
//!    and stored paths whose file is gone are removed. Queued files are
//!    then processed one at a time:
//!    probe -> mtime dedup -> decode -> annotate -> write.

use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    ops::ControlFlow,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use notify::{
    EventKind,
    RecommendedWatcher,
    RecursiveMode,
    Watcher,
    event::ModifyKind,
};
use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot},
    task,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, info, trace, warn};

use crate::{
    annotation_store::{AnnotationStore, FileSearchResult, ImageInfo},
    annotator::{Annotation, Annotator, AnnotatorKind},
    config::IngestConfig,
    error::{Error, Result},
    incremental::{self, DiffResult},
    ingestion::{self, FileProbe, ImageFormat},
    walker::{self, DiscoveredFile, FileFilter},
};

const COMMAND_BUFFER: usize = 64;
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    #[default]
    Uninitialized,
    WaitingForAnnotators,
    Watching,
}

/// Pipeline step of the file currently in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Probing,
    Decoding,
    Annotating,
    Writing,
}

#[derive(Debug)]
struct InFlight {
    path: PathBuf,
    stage: Stage,
    /// Set when the path was removed while in flight; the result is
    /// then discarded instead of written.
    cancelled: bool,
}

/// Counters describing what the worker has done so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestStats {
    pub state: WorkerState,
    pub stage: Option<Stage>,
    pub queued: usize,
    /// Files that left the pipeline, whatever the outcome.
    pub processed: u64,
    /// Files whose annotations were written.
    pub annotated: u64,
    pub skipped_unchanged: u64,
    pub removed: u64,
    pub decode_failures: u64,
    pub annotator_failures: u64,
}

enum Command {
    FileChanged(PathBuf),
    Remove {
        path: PathBuf,
        reply: oneshot::Sender<Result<bool>>,
    },
    Search {
        query: String,
        max_results: usize,
        reply: oneshot::Sender<Result<Vec<FileSearchResult>>>,
    },
    FindByPath {
        path: PathBuf,
        reply: oneshot::Sender<Result<Vec<ImageInfo>>>,
    },
    GetAll {
        reply: oneshot::Sender<Result<Vec<ImageInfo>>>,
    },
    WaitIdle {
        reply: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<IngestStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Event {
    Readiness(bool),
    Fs(notify::Event),
    ScanFinished {
        diff: DiffResult,
        /// Stored modification times of the missing paths when the
        /// scan started.
        snapshot: HashMap<PathBuf, i64>,
    },
    DirectoryScanned(Vec<DiscoveredFile>),
    Probed {
        path: PathBuf,
        probe: FileProbe,
    },
    Decoded {
        path: PathBuf,
        mtime: i64,
        result: Result<Option<ImageFormat>>,
    },
    Annotated {
        path: PathBuf,
        mtime: i64,
        results: Vec<(AnnotatorKind, Result<Vec<Annotation>>)>,
    },
}

/// Handle to a running [`IngestionWorker`].
///
/// Every method fails with [`Error::WorkerGone`] once the worker has
/// stopped.
#[derive(Debug, Clone)]
pub struct IngestHandle {
    commands: mpsc::Sender<Command>,
}

impl IngestHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| Error::WorkerGone)?;
        rx.await.map_err(|_| Error::WorkerGone)
    }

    /// Queue `path` for (re-)ingestion. Deleted files are removed from
    /// the store when their turn comes.
    pub async fn file_changed(&self, path: impl Into<PathBuf>) -> Result<()> {
        self.commands
            .send(Command::FileChanged(path.into()))
            .await
            .map_err(|_| Error::WorkerGone)
    }

    pub async fn remove(&self, path: impl Into<PathBuf>) -> Result<bool> {
        let path = path.into();
        self.request(|reply| Command::Remove { path, reply }).await?
    }

    pub async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<FileSearchResult>> {
        let query = query.to_string();
        self.request(|reply| Command::Search {
            query,
            max_results,
            reply,
        })
        .await?
    }

    pub async fn find_by_path(
        &self,
        path: impl Into<PathBuf>,
    ) -> Result<Vec<ImageInfo>> {
        let path = path.into();
        self.request(|reply| Command::FindByPath { path, reply })
            .await?
    }

    pub async fn get_all(&self) -> Result<Vec<ImageInfo>> {
        self.request(|reply| Command::GetAll { reply }).await?
    }

    /// Resolve once the worker is watching, the startup scan is done,
    /// the queue is empty and nothing is in flight.
    pub async fn wait_idle(&self) -> Result<()> {
        self.request(|reply| Command::WaitIdle { reply }).await
    }

    pub async fn stats(&self) -> Result<IngestStats> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Stop the worker. Resolves after the store has been closed.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

pub struct IngestionWorker {
    store: AnnotationStore,
    config: IngestConfig,
    filter: FileFilter,
    roots: Vec<PathBuf>,
    annotators: Vec<Arc<dyn Annotator>>,

    state: WorkerState,
    queue: VecDeque<PathBuf>,
    queued: HashSet<PathBuf>,
    in_flight: Option<InFlight>,
    pending_scans: usize,
    readiness_pending: bool,
    idle_waiters: Vec<oneshot::Sender<()>>,
    stats: IngestStats,
    watcher: Option<RecommendedWatcher>,

    commands: mpsc::Receiver<Command>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
}

impl IngestionWorker {
    /// Start a worker on the current tokio runtime.
    pub fn spawn(
        store: AnnotationStore,
        config: IngestConfig,
        roots: Vec<PathBuf>,
        annotators: Vec<Arc<dyn Annotator>>,
    ) -> IngestHandle {
        let (worker, handle) = Self::new(store, config, roots, annotators);
        tokio::spawn(worker.run());
        handle
    }

    fn new(
        store: AnnotationStore,
        config: IngestConfig,
        roots: Vec<PathBuf>,
        annotators: Vec<Arc<dyn Annotator>>,
    ) -> (Self, IngestHandle) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let roots = roots
            .into_iter()
            .map(|root| root.canonicalize().unwrap_or(root))
            .collect();

        let worker = Self {
            store,
            filter: config.file_filter(),
            config,
            roots,
            annotators,
            state: WorkerState::Uninitialized,
            queue: VecDeque::new(),
            queued: HashSet::new(),
            in_flight: None,
            pending_scans: 0,
            readiness_pending: false,
            idle_waiters: Vec::new(),
            stats: IngestStats::default(),
            watcher: None,
            commands,
            events_tx,
            events_rx,
        };
        let handle = IngestHandle {
            commands: commands_tx,
        };
        (worker, handle)
    }

    async fn run(mut self) {
        self.state = WorkerState::WaitingForAnnotators;
        info!(
            roots = self.roots.len(),
            annotators = self.annotators.len(),
            "ingestion worker started"
        );
        for annotator in &self.annotators {
            let annotator = Arc::clone(annotator);
            tokio::spawn(async move {
                if let Err(e) = annotator.prepare().await {
                    warn!(
                        kind = %annotator.kind(),
                        error = %e,
                        "annotator preparation failed"
                    );
                }
            });
        }

        let mut ticker =
            time::interval(self.config.poll_interval.max(MIN_POLL_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut shutdown_reply = None;
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let ControlFlow::Break(reply) =
                            self.handle_command(command)
                        {
                            shutdown_reply = Some(reply);
                            break;
                        }
                    }
                    None => break,
                },
                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event);
                }
                _ = ticker.tick(), if self.awaiting_readiness() => {
                    self.check_readiness();
                }
            }
            self.notify_if_idle();
        }

        info!(
            annotated = self.stats.annotated,
            removed = self.stats.removed,
            "ingestion worker stopped"
        );
        drop(self);
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    fn handle_command(
        &mut self,
        command: Command,
    ) -> ControlFlow<oneshot::Sender<()>> {
        match command {
            Command::FileChanged(path) => {
                if self.filter.accepts(&path) {
                    self.enqueue(path);
                    self.start_next();
                } else {
                    trace!(path = %path.display(), "ignoring ineligible file");
                }
            }
            Command::Remove { path, reply } => {
                let _ = reply.send(self.remove_now(&path));
            }
            Command::Search {
                query,
                max_results,
                reply,
            } => {
                let _ = reply.send(self.store.search(&query, max_results));
            }
            Command::FindByPath { path, reply } => {
                let _ = reply.send(self.store.find_by_path(&path));
            }
            Command::GetAll { reply } => {
                let _ = reply.send(self.store.get_all());
            }
            Command::WaitIdle { reply } => self.idle_waiters.push(reply),
            Command::Stats { reply } => {
                let _ = reply.send(self.snapshot_stats());
            }
            Command::Shutdown { reply } => return ControlFlow::Break(reply),
        }
        ControlFlow::Continue(())
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Readiness(ready) => self.on_readiness(ready),
            Event::Fs(event) => self.on_fs_event(event),
            Event::ScanFinished { diff, snapshot } => {
                self.on_scan_finished(diff, &snapshot)
            }
            Event::DirectoryScanned(files) => {
                self.pending_scans = self.pending_scans.saturating_sub(1);
                for file in files {
                    self.enqueue(file.absolute_path);
                }
                self.start_next();
            }
            Event::Probed { path, probe } => self.on_probed(path, probe),
            Event::Decoded {
                path,
                mtime,
                result,
            } => self.on_decoded(path, mtime, result),
            Event::Annotated {
                path,
                mtime,
                results,
            } => self.on_annotated(path, mtime, results),
        }
    }

    // -- Readiness --

    fn awaiting_readiness(&self) -> bool {
        self.state == WorkerState::WaitingForAnnotators
            && !self.readiness_pending
    }

    fn check_readiness(&mut self) {
        self.readiness_pending = true;
        let annotators = self.annotators.clone();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let mut ready = true;
            for annotator in &annotators {
                if !annotator.is_ready().await {
                    trace!(kind = %annotator.kind(), "annotator not ready");
                    ready = false;
                    break;
                }
            }
            let _ = tx.send(Event::Readiness(ready));
        });
    }

    fn on_readiness(&mut self, ready: bool) {
        self.readiness_pending = false;
        if !ready || self.state != WorkerState::WaitingForAnnotators {
            return;
        }

        self.state = WorkerState::Watching;
        info!("annotators ready");
        if self.config.watch {
            match self.start_watcher() {
                Ok(watcher) => self.watcher = Some(watcher),
                Err(e) => {
                    warn!(error = %e, "cannot watch roots, changes will be missed")
                }
            }
        }
        self.start_scan();
        self.start_next();
    }

    // -- Discovery --

    fn start_watcher(&self) -> Result<RecommendedWatcher> {
        let tx = self.events_tx.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    let _ = tx.send(Event::Fs(event));
                }
                Err(e) => warn!(error = %e, "filesystem watch error"),
            },
            notify::Config::default(),
        )?;
        for root in &self.roots {
            watcher.watch(root, RecursiveMode::Recursive)?;
            debug!(root = %root.display(), "watching");
        }
        Ok(watcher)
    }

    fn start_scan(&mut self) {
        let known = self.store.modification_times().unwrap_or_else(|e| {
            warn!(error = %e, "cannot read stored modification times");
            HashMap::new()
        });
        let roots = self.roots.clone();
        let filter = self.filter.clone();
        let tx = self.events_tx.clone();

        self.pending_scans += 1;
        task::spawn_blocking(move || {
            let mut discovered = Vec::new();
            for root in &roots {
                match walker::discover_files(root, &filter) {
                    Ok(files) => discovered.extend(files),
                    Err(e) => {
                        warn!(root = %root.display(), error = %e, "cannot walk root")
                    }
                }
            }
            let diff = incremental::diff_with_store(&known, &discovered);
            let snapshot = diff
                .missing
                .iter()
                .filter_map(|path| known.get(path).map(|m| (path.clone(), *m)))
                .collect();
            let _ = tx.send(Event::ScanFinished { diff, snapshot });
        });
    }

    fn on_scan_finished(
        &mut self,
        diff: DiffResult,
        snapshot: &HashMap<PathBuf, i64>,
    ) {
        self.pending_scans = self.pending_scans.saturating_sub(1);
        info!(
            new = diff.new_files.len(),
            changed = diff.changed_files.len(),
            unchanged = diff.unchanged,
            missing = diff.missing.len(),
            "startup scan finished"
        );

        self.stats.skipped_unchanged += diff.unchanged as u64;
        for path in &diff.missing {
            if self.is_stale_removal(path, snapshot) {
                debug!(path = %path.display(), "reappeared during scan, keeping");
            } else {
                self.remove_now(path).ok();
            }
        }
        let pending: Vec<PathBuf> =
            diff.pending().map(|f| f.absolute_path.clone()).collect();
        for path in pending {
            self.enqueue(path);
        }
        self.start_next();
    }

    /// A path found missing by the startup scan has since been queued,
    /// is in flight, or was written again after the scan's snapshot.
    fn is_stale_removal(
        &self,
        path: &Path,
        snapshot: &HashMap<PathBuf, i64>,
    ) -> bool {
        if self.is_in_flight(path) || self.queued.contains(path) {
            return true;
        }
        match self.store.last_modified(path) {
            Ok(stored) => stored != snapshot.get(path).copied(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read stored modification time");
                true
            }
        }
    }

    fn scan_directory(&mut self, dir: PathBuf) {
        let filter = self.filter.clone();
        let tx = self.events_tx.clone();
        self.pending_scans += 1;
        task::spawn_blocking(move || {
            let files = walker::discover_files(&dir, &filter).unwrap_or_default();
            let _ = tx.send(Event::DirectoryScanned(files));
        });
    }

    fn on_fs_event(&mut self, event: notify::Event) {
        let structural = matches!(
            event.kind,
            EventKind::Create(_)
                | EventKind::Remove(_)
                | EventKind::Modify(ModifyKind::Name(_))
        );
        if !structural && !matches!(event.kind, EventKind::Modify(_)) {
            return;
        }

        for path in event.paths {
            if self.filter.is_excluded(&path) {
                continue;
            }
            if self.filter.has_supported_extension(&path) {
                self.enqueue(path);
            } else if structural {
                // Possibly a directory: forget what was stored below it
                // and pick up whatever it contains now.
                self.enqueue_stored_under(&path);
                if path.is_dir() {
                    self.scan_directory(path);
                }
            }
        }
        self.start_next();
    }

    fn enqueue_stored_under(&mut self, dir: &Path) {
        match self.store.all_paths() {
            Ok(paths) => {
                for path in paths.into_iter().filter(|p| p.starts_with(dir)) {
                    self.enqueue(path);
                }
            }
            Err(e) => warn!(error = %e, "cannot list stored paths"),
        }
    }

    // -- Queue --

    fn enqueue(&mut self, path: PathBuf) {
        if self.queued.insert(path.clone()) {
            trace!(path = %path.display(), "queued");
            self.queue.push_back(path);
        }
    }

    fn start_next(&mut self) {
        if self.state != WorkerState::Watching || self.in_flight.is_some() {
            return;
        }
        let Some(path) = self.queue.pop_front() else {
            return;
        };
        self.queued.remove(&path);

        self.in_flight = Some(InFlight {
            path: path.clone(),
            stage: Stage::Probing,
            cancelled: false,
        });
        let max_size = self.config.max_file_size;
        let tx = self.events_tx.clone();
        task::spawn_blocking(move || {
            let probe = ingestion::probe(&path, max_size);
            let _ = tx.send(Event::Probed { path, probe });
        });
    }

    fn is_in_flight(&self, path: &Path) -> bool {
        self.in_flight.as_ref().is_some_and(|f| f.path == path)
    }

    fn advance(&mut self, stage: Stage) {
        if let Some(in_flight) = self.in_flight.as_mut() {
            trace!(path = %in_flight.path.display(), ?stage, "advancing");
            in_flight.stage = stage;
        }
    }

    fn finish(&mut self) {
        self.in_flight = None;
        self.stats.processed += 1;
        self.start_next();
    }

    fn is_idle(&self) -> bool {
        self.state == WorkerState::Watching
            && self.pending_scans == 0
            && self.queue.is_empty()
            && self.in_flight.is_none()
    }

    fn notify_if_idle(&mut self) {
        if self.idle_waiters.is_empty() || !self.is_idle() {
            return;
        }
        for waiter in self.idle_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    // -- Pipeline --

    fn on_probed(&mut self, path: PathBuf, probe: FileProbe) {
        if !self.is_in_flight(&path) {
            return;
        }
        let FileProbe::Present { mtime, .. } = probe else {
            debug!(path = %path.display(), ?probe, "file no longer eligible");
            self.remove_now(&path).ok();
            self.finish();
            return;
        };

        match self.store.last_modified(&path) {
            Ok(Some(stored)) if stored == mtime => {
                trace!(path = %path.display(), "unchanged");
                self.stats.skipped_unchanged += 1;
                self.finish();
            }
            Ok(_) => {
                if let Err(e) = self.store.remove(&path) {
                    warn!(path = %path.display(), error = %e, "cannot drop old annotations");
                }
                self.advance(Stage::Decoding);
                let tx = self.events_tx.clone();
                task::spawn_blocking(move || {
                    let result = ingestion::decode(&path);
                    let _ = tx.send(Event::Decoded {
                        path,
                        mtime,
                        result,
                    });
                });
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read stored modification time");
                self.finish();
            }
        }
    }

    fn on_decoded(
        &mut self,
        path: PathBuf,
        mtime: i64,
        result: Result<Option<ImageFormat>>,
    ) {
        if !self.is_in_flight(&path) {
            return;
        }
        let format = match result {
            Ok(Some(format)) => format,
            Ok(None) => {
                debug!(path = %path.display(), "not a decodable image");
                self.stats.decode_failures += 1;
                self.finish();
                return;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read image");
                self.stats.decode_failures += 1;
                self.finish();
                return;
            }
        };

        trace!(path = %path.display(), ?format, "decoded");
        self.advance(Stage::Annotating);
        let annotators = self.annotators.clone();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let mut results = Vec::with_capacity(annotators.len());
            for annotator in &annotators {
                results.push((annotator.kind(), annotator.annotate(&path).await));
            }
            let _ = tx.send(Event::Annotated {
                path,
                mtime,
                results,
            });
        });
    }

    fn on_annotated(
        &mut self,
        path: PathBuf,
        mtime: i64,
        results: Vec<(AnnotatorKind, Result<Vec<Annotation>>)>,
    ) {
        if !self.is_in_flight(&path) {
            return;
        }

        let total = results.len();
        let mut failures = 0;
        let mut annotations = BTreeSet::new();
        for (kind, result) in results {
            match result {
                Ok(found) => annotations.extend(ingestion::extract_terms(
                    kind,
                    &found,
                    &self.config,
                )),
                Err(e) => {
                    failures += 1;
                    self.stats.annotator_failures += 1;
                    warn!(path = %path.display(), %kind, error = %e, "annotator failed");
                }
            }
        }

        let cancelled = self.in_flight.as_ref().is_some_and(|f| f.cancelled);
        if cancelled || (total > 0 && failures == total) {
            self.finish();
            return;
        }

        self.advance(Stage::Writing);
        let info = ImageInfo {
            path,
            last_modified: mtime,
            annotations,
        };
        match self.store.insert(&info) {
            Ok(()) => {
                self.stats.annotated += 1;
                debug!(
                    path = %info.path.display(),
                    terms = info.annotations.len(),
                    "annotated"
                );
            }
            Err(e) => {
                warn!(path = %info.path.display(), error = %e, "cannot store annotations")
            }
        }
        self.finish();
    }

    // -- Helpers --

    /// Remove `path` from the queue and the store right away.
    fn remove_now(&mut self, path: &Path) -> Result<bool> {
        if self.queued.remove(path) {
            self.queue.retain(|queued| queued != path);
        }
        if let Some(in_flight) = self.in_flight.as_mut()
            && in_flight.path == path
        {
            in_flight.cancelled = true;
        }

        let removed = self.store.remove(path);
        match &removed {
            Ok(true) => {
                self.stats.removed += 1;
                debug!(path = %path.display(), "removed");
            }
            Ok(false) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "cannot remove annotations"),
        }
        removed
    }

    fn snapshot_stats(&self) -> IngestStats {
        IngestStats {
            state: self.state,
            stage: self.in_flight.as_ref().map(|f| f.stage),
            queued: self.queue.len(),
            ..self.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use tokio::{sync::Semaphore, time::timeout};

    use super::*;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";
    const PATIENCE: Duration = Duration::from_secs(10);

    struct FakeAnnotator {
        kind: AnnotatorKind,
        output: Vec<Annotation>,
        ready: Arc<AtomicBool>,
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl FakeAnnotator {
        fn labels(output: Vec<Annotation>) -> Self {
            Self {
                kind: AnnotatorKind::Labels,
                output,
                ready: Arc::new(AtomicBool::new(true)),
                calls: Arc::new(AtomicUsize::new(0)),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl Annotator for FakeAnnotator {
        fn kind(&self) -> AnnotatorKind {
            self.kind
        }

        async fn prepare(&self) -> Result<()> {
            Ok(())
        }

        async fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        async fn annotate(&self, _path: &Path) -> Result<Vec<Annotation>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Annotator("model crashed".into()));
            }
            Ok(self.output.clone())
        }
    }

    /// Labels every image "sunset", but each call waits for a permit
    /// and the calls are recorded.
    struct GatedAnnotator {
        gate: Arc<Semaphore>,
        active: AtomicUsize,
        peak: AtomicUsize,
        order: Mutex<Vec<PathBuf>>,
    }

    impl GatedAnnotator {
        fn with_permits(permits: usize) -> Arc<Self> {
            Arc::new(Self {
                gate: Arc::new(Semaphore::new(permits)),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                order: Mutex::new(Vec::new()),
            })
        }

        fn closed() -> Arc<Self> {
            Self::with_permits(0)
        }

        fn open() -> Arc<Self> {
            Self::with_permits(Semaphore::MAX_PERMITS / 2)
        }

        fn order(&self) -> Vec<PathBuf> {
            self.order.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Annotator for GatedAnnotator {
        fn kind(&self) -> AnnotatorKind {
            AnnotatorKind::Labels
        }

        async fn prepare(&self) -> Result<()> {
            Ok(())
        }

        async fn is_ready(&self) -> bool {
            true
        }

        async fn annotate(&self, path: &Path) -> Result<Vec<Annotation>> {
            self.order.lock().unwrap().push(path.to_path_buf());
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(active, Ordering::SeqCst);

            tokio::time::sleep(Duration::from_millis(5)).await;
            self.gate.acquire().await.unwrap().forget();

            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![Annotation::with_confidence("sunset", 0.9)])
        }
    }

    async fn wait_for_stage(handle: &IngestHandle, stage: Stage) {
        timeout(PATIENCE, async {
            while handle.stats().await.unwrap().stage != Some(stage) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker never reached the stage");
    }

    fn test_config() -> IngestConfig {
        IngestConfig {
            poll_interval: Duration::from_millis(10),
            watch: false,
            ..IngestConfig::default()
        }
    }

    fn sunset() -> FakeAnnotator {
        FakeAnnotator::labels(vec![
            Annotation::with_confidence("Sunset", 0.9),
            Annotation::with_confidence("sky", 0.9),
            Annotation::with_confidence("Lowconf", 0.1),
        ])
    }

    fn root() -> (tempfile::TempDir, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        (tmp, root)
    }

    fn spawn_with(
        store: AnnotationStore,
        config: IngestConfig,
        root: &Path,
        annotators: Vec<Arc<dyn Annotator>>,
    ) -> IngestHandle {
        IngestionWorker::spawn(store, config, vec![root.to_path_buf()], annotators)
    }

    async fn idle(handle: &IngestHandle) {
        timeout(PATIENCE, handle.wait_idle())
            .await
            .expect("worker never became idle")
            .unwrap();
    }

    #[tokio::test]
    async fn startup_scan_annotates_images() {
        let (_tmp, root) = root();
        std::fs::write(root.join("a.png"), PNG).unwrap();
        std::fs::write(root.join("broken.png"), "not really a png").unwrap();
        std::fs::write(root.join("notes.txt"), "ignored").unwrap();

        let handle = spawn_with(
            AnnotationStore::open_in_memory().unwrap(),
            test_config(),
            &root,
            vec![Arc::new(sunset())],
        );
        idle(&handle).await;

        let results = handle.search("sunset", 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].path, root.join("a.png"));

        let stored = handle.find_by_path(root.join("a.png")).await.unwrap();
        assert_eq!(
            stored[0].annotations.iter().collect::<Vec<_>>(),
            vec!["sunset"]
        );

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.state, WorkerState::Watching);
        assert_eq!(stats.annotated, 1);
        assert_eq!(stats.decode_failures, 1);
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.stage, None);
    }

    #[tokio::test]
    async fn unchanged_files_are_not_reannotated() {
        let (_tmp, root) = root();
        let image = root.join("a.png");
        std::fs::write(&image, PNG).unwrap();

        let annotator = sunset();
        let calls = Arc::clone(&annotator.calls);
        let handle = spawn_with(
            AnnotationStore::open_in_memory().unwrap(),
            test_config(),
            &root,
            vec![Arc::new(annotator)],
        );
        idle(&handle).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        handle.file_changed(&image).await.unwrap();
        idle(&handle).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle.stats().await.unwrap().skipped_unchanged, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(&image, PNG).unwrap();
        handle.file_changed(&image).await.unwrap();
        idle(&handle).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(handle.stats().await.unwrap().annotated, 2);
        assert_eq!(handle.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn restart_skips_stored_files() {
        let (tmp, root) = root();
        std::fs::write(root.join("a.png"), PNG).unwrap();
        let db = tmp.path().join("annotations.sqlite");

        let handle = spawn_with(
            AnnotationStore::open(&db).unwrap(),
            test_config(),
            &root,
            vec![Arc::new(sunset())],
        );
        idle(&handle).await;
        handle.shutdown().await.unwrap();

        let annotator = sunset();
        let calls = Arc::clone(&annotator.calls);
        let handle = spawn_with(
            AnnotationStore::open(&db).unwrap(),
            test_config(),
            &root,
            vec![Arc::new(annotator)],
        );
        idle(&handle).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(handle.stats().await.unwrap().skipped_unchanged, 1);
        assert_eq!(handle.search("sunset", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deleted_files_are_removed() {
        let (_tmp, root) = root();
        let image = root.join("a.png");
        std::fs::write(&image, PNG).unwrap();

        let handle = spawn_with(
            AnnotationStore::open_in_memory().unwrap(),
            test_config(),
            &root,
            vec![Arc::new(sunset())],
        );
        idle(&handle).await;

        std::fs::remove_file(&image).unwrap();
        handle.file_changed(&image).await.unwrap();
        idle(&handle).await;

        assert!(handle.find_by_path(&image).await.unwrap().is_empty());
        assert!(handle.search("sunset", 10).await.unwrap().is_empty());
        assert_eq!(handle.stats().await.unwrap().removed, 1);
    }

    #[tokio::test]
    async fn startup_removes_vanished_files() {
        let (_tmp, root) = root();
        let ghost = root.join("ghost.png");
        let mut store = AnnotationStore::open_in_memory().unwrap();
        store
            .insert(&ImageInfo::new(&ghost, 1, ["phantom"]))
            .unwrap();

        let handle = spawn_with(store, test_config(), &root, vec![Arc::new(sunset())]);
        idle(&handle).await;

        assert!(handle.find_by_path(&ghost).await.unwrap().is_empty());
        assert_eq!(handle.stats().await.unwrap().removed, 1);
    }

    #[tokio::test]
    async fn waits_for_annotators() {
        let (_tmp, root) = root();
        std::fs::write(root.join("a.png"), PNG).unwrap();

        let annotator = sunset();
        annotator.ready.store(false, Ordering::SeqCst);
        let ready = Arc::clone(&annotator.ready);
        let handle = spawn_with(
            AnnotationStore::open_in_memory().unwrap(),
            test_config(),
            &root,
            vec![Arc::new(annotator)],
        );

        assert!(
            timeout(Duration::from_millis(200), handle.wait_idle())
                .await
                .is_err()
        );
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.state, WorkerState::WaitingForAnnotators);
        assert_eq!(stats.annotated, 0);

        ready.store(true, Ordering::SeqCst);
        idle(&handle).await;
        assert_eq!(handle.stats().await.unwrap().annotated, 1);
    }

    #[tokio::test]
    async fn annotator_failure_stores_nothing() {
        let (_tmp, root) = root();
        std::fs::write(root.join("a.png"), PNG).unwrap();

        let mut annotator = sunset();
        annotator.fail = true;
        let handle = spawn_with(
            AnnotationStore::open_in_memory().unwrap(),
            test_config(),
            &root,
            vec![Arc::new(annotator)],
        );
        idle(&handle).await;

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.annotator_failures, 1);
        assert_eq!(stats.annotated, 0);
        assert!(handle.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ocr_and_labels_are_merged() {
        let (_tmp, root) = root();
        std::fs::write(root.join("receipt.png"), PNG).unwrap();

        let ocr = FakeAnnotator {
            kind: AnnotatorKind::Ocr,
            ..FakeAnnotator::labels(vec![Annotation::new("TOTAL 12.00 Bakery")])
        };
        let labels = FakeAnnotator::labels(vec![Annotation::with_confidence(
            "Document", 0.8,
        )]);
        let handle = spawn_with(
            AnnotationStore::open_in_memory().unwrap(),
            test_config(),
            &root,
            vec![Arc::new(ocr), Arc::new(labels)],
        );
        idle(&handle).await;

        let all = handle.get_all().await.unwrap();
        assert_eq!(
            all[0].annotations.iter().collect::<Vec<_>>(),
            vec!["bakery", "document", "total"]
        );
        assert_eq!(handle.search("bakery document", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_command_and_ineligible_paths() {
        let (_tmp, root) = root();
        let image = root.join("a.png");
        std::fs::write(&image, PNG).unwrap();

        let handle = spawn_with(
            AnnotationStore::open_in_memory().unwrap(),
            test_config(),
            &root,
            vec![Arc::new(sunset())],
        );
        idle(&handle).await;

        assert!(handle.remove(&image).await.unwrap());
        assert!(!handle.remove(&image).await.unwrap());
        assert!(handle.search("sunset", 10).await.unwrap().is_empty());

        handle.file_changed(root.join("notes.txt")).await.unwrap();
        idle(&handle).await;
        assert_eq!(handle.stats().await.unwrap().queued, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn one_file_in_flight_at_a_time() {
        let (_tmp, root) = root();
        for i in 0..8 {
            std::fs::write(root.join(format!("{i}.png")), PNG).unwrap();
        }

        let annotator = GatedAnnotator::open();
        let handle = spawn_with(
            AnnotationStore::open_in_memory().unwrap(),
            test_config(),
            &root,
            vec![annotator.clone()],
        );
        idle(&handle).await;

        assert_eq!(annotator.peak.load(Ordering::SeqCst), 1);
        let mut seen = annotator.order();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 8);
        assert_eq!(handle.stats().await.unwrap().annotated, 8);
    }

    #[tokio::test]
    async fn changes_queue_behind_a_stuck_annotation() {
        let (_tmp, root) = root();
        let annotator = GatedAnnotator::closed();
        let handle = spawn_with(
            AnnotationStore::open_in_memory().unwrap(),
            test_config(),
            &root,
            vec![annotator.clone()],
        );
        idle(&handle).await;

        let paths: Vec<PathBuf> =
            ["a.png", "b.png", "c.png"].map(|name| root.join(name)).into();
        for path in &paths {
            std::fs::write(path, PNG).unwrap();
        }

        handle.file_changed(&paths[0]).await.unwrap();
        wait_for_stage(&handle, Stage::Annotating).await;
        handle.file_changed(&paths[1]).await.unwrap();
        handle.file_changed(&paths[2]).await.unwrap();
        handle.file_changed(&paths[1]).await.unwrap();

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.stage, Some(Stage::Annotating));
        assert_eq!(stats.queued, 2);
        assert_eq!(annotator.order(), vec![paths[0].clone()]);

        annotator.gate.add_permits(paths.len());
        idle(&handle).await;
        assert_eq!(annotator.order(), paths);
        assert_eq!(annotator.peak.load(Ordering::SeqCst), 1);
        assert_eq!(handle.stats().await.unwrap().annotated, 3);
    }

    #[tokio::test]
    async fn removal_during_annotation_discards_the_result() {
        let (_tmp, root) = root();
        let image = root.join("a.png");
        let annotator = GatedAnnotator::closed();
        let handle = spawn_with(
            AnnotationStore::open_in_memory().unwrap(),
            test_config(),
            &root,
            vec![annotator.clone()],
        );
        idle(&handle).await;

        std::fs::write(&image, PNG).unwrap();
        handle.file_changed(&image).await.unwrap();
        wait_for_stage(&handle, Stage::Annotating).await;
        assert!(!handle.remove(&image).await.unwrap());

        annotator.gate.add_permits(1);
        idle(&handle).await;

        assert!(handle.find_by_path(&image).await.unwrap().is_empty());
        assert!(handle.search("sunset", 10).await.unwrap().is_empty());
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.annotated, 0);
        assert_eq!(stats.processed, 1);
    }

    #[tokio::test]
    async fn scan_keeps_paths_that_reappeared() {
        let (_tmp, root) = root();
        let rewritten = root.join("rewritten.png");
        let requeued = root.join("requeued.png");
        let vanished = root.join("vanished.png");

        let mut store = AnnotationStore::open_in_memory().unwrap();
        for path in [&rewritten, &requeued, &vanished] {
            store.insert(&ImageInfo::new(path, 1, ["sunset"])).unwrap();
        }
        let snapshot: HashMap<PathBuf, i64> = [&rewritten, &requeued, &vanished]
            .into_iter()
            .map(|path| (path.clone(), 1))
            .collect();

        let (mut worker, _handle) = IngestionWorker::new(
            store,
            test_config(),
            vec![root.clone()],
            Vec::new(),
        );
        worker.store.remove(&rewritten).unwrap();
        worker
            .store
            .insert(&ImageInfo::new(&rewritten, 2, ["sunrise"]))
            .unwrap();
        worker.enqueue(requeued.clone());

        worker.on_scan_finished(
            DiffResult {
                missing: vec![rewritten.clone(), requeued.clone(), vanished.clone()],
                ..DiffResult::default()
            },
            &snapshot,
        );

        assert_eq!(worker.store.last_modified(&rewritten).unwrap(), Some(2));
        assert_eq!(worker.store.last_modified(&requeued).unwrap(), Some(1));
        assert!(worker.queued.contains(&requeued));
        assert_eq!(worker.store.last_modified(&vanished).unwrap(), None);
        assert_eq!(worker.stats.removed, 1);
    }

    #[tokio::test]
    async fn shutdown_stops_the_worker() {
        let (_tmp, root) = root();
        let handle = spawn_with(
            AnnotationStore::open_in_memory().unwrap(),
            test_config(),
            &root,
            Vec::new(),
        );
        idle(&handle).await;
        handle.shutdown().await.unwrap();
        assert!(matches!(handle.stats().await, Err(Error::WorkerGone)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn watcher_picks_up_new_files() {
        let (_tmp, root) = root();
        let handle = spawn_with(
            AnnotationStore::open_in_memory().unwrap(),
            IngestConfig {
                watch: true,
                ..test_config()
            },
            &root,
            vec![Arc::new(sunset())],
        );
        idle(&handle).await;

        std::fs::write(root.join("new.png"), PNG).unwrap();
        let found = timeout(PATIENCE, async {
            loop {
                if !handle.search("sunset", 10).await.unwrap().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        assert!(found.is_ok(), "watcher never reported the new file");
    }
}
