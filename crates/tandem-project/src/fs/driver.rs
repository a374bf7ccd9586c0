use super::ignore::IgnoreRules;
use super::watch::WatchHandle;
use crate::config::FsConfig;
use crate::error::{ProjectError, ProjectResult};
use crate::files::normalize;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tandem_core::{ChangeHash, FileContent, FileKind};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};

/// Callbacks into the host editor
pub trait EditorHooks: Send + Sync {
    /// True while the editor holds edits it has not written to disk
    fn has_unsaved_changes(&self) -> bool {
        false
    }

    fn queue_reimport(&self, _path: &str) {}

    fn queue_scene_reload(&self, _path: &str) {}
}

/// Hooks for running without an editor
pub struct NoopHooks;

impl EditorHooks for NoopHooks {}

/// The checked-out branch as seen by the driver
#[async_trait]
pub trait WorkingTree: Send + Sync {
    async fn stored_file(&self, path: &str) -> ProjectResult<Option<FileContent>>;

    async fn stored_files(&self) -> ProjectResult<BTreeMap<String, FileContent>>;

    /// Commit settled disk edits as one change; `None` content deletes
    async fn commit_local_changes(
        &self,
        changes: Vec<(String, Option<FileContent>)>,
    ) -> ProjectResult<Option<ChangeHash>>;
}

/// Result of one store-to-disk pass
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub written: Vec<String>,
    pub deleted: Vec<String>,
    pub unchanged: usize,
    /// Edited on disk since the last sync and not yet committed; left alone
    pub locally_modified: Vec<String>,
    /// Always `ProjectError::TypeMismatch`
    pub type_mismatches: Vec<ProjectError>,
    pub failures: Vec<(String, ProjectError)>,
    pub reimports: Vec<String>,
    pub reloads: Vec<String>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.type_mismatches.is_empty() && self.failures.is_empty()
    }
}

#[derive(Debug)]
pub enum SyncPassOutcome {
    Completed(ReconcileReport),
    /// A pass was already running; it will run once more when done
    Queued,
    /// The editor has unsaved state; nothing was written
    Blocked,
}

enum Job {
    Write {
        path: String,
        content: FileContent,
        /// Digest of the disk copy at its last sync, if it has one
        synced: Option<[u8; 32]>,
    },
    Delete { path: String, expected: [u8; 32] },
}

enum FileOutcome {
    Written(String, [u8; 32]),
    Unchanged(String, [u8; 32]),
    Deleted(String),
    /// Disk copy was edited since the last sync; left alone
    Kept(String),
    /// Disk copy differs from both the store and the last sync
    LocallyModified(String),
    Mismatch {
        path: String,
        stored: FileKind,
        found: FileKind,
    },
    Failed(String, std::io::Error),
}

impl Job {
    fn run(self, root: &Path) -> FileOutcome {
        match self {
            Job::Write {
                path,
                content,
                synced,
            } => {
                let target = root.join(&path);
                match std::fs::read(&target) {
                    Ok(existing) if existing == content.as_bytes() => {
                        return FileOutcome::Unchanged(path, content.digest());
                    }
                    Ok(existing) => {
                        let existing = FileContent::from_bytes(existing);
                        if synced != Some(existing.digest()) {
                            return FileOutcome::LocallyModified(path);
                        }
                        let found = existing.kind();
                        if found != content.kind() {
                            return FileOutcome::Mismatch {
                                path,
                                stored: content.kind(),
                                found,
                            };
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return FileOutcome::Failed(path, e),
                }

                let written = target
                    .parent()
                    .map_or(Ok(()), std::fs::create_dir_all)
                    .and_then(|_| std::fs::write(&target, content.as_bytes()));
                match written {
                    Ok(()) => FileOutcome::Written(path, content.digest()),
                    Err(e) => FileOutcome::Failed(path, e),
                }
            }
            Job::Delete { path, expected } => {
                let target = root.join(&path);
                match std::fs::read(&target) {
                    Ok(existing) => {
                        if FileContent::from_bytes(existing).digest() != expected {
                            return FileOutcome::Kept(path);
                        }
                        match std::fs::remove_file(&target) {
                            Ok(()) => FileOutcome::Deleted(path),
                            Err(e) => FileOutcome::Failed(path, e),
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::NotFound => FileOutcome::Deleted(path),
                    Err(e) => FileOutcome::Failed(path, e),
                }
            }
        }
    }
}

struct DriverInner {
    root: PathBuf,
    tree: Arc<dyn WorkingTree>,
    hooks: Arc<dyn EditorHooks>,
    config: FsConfig,
    ignore: Arc<IgnoreRules>,
    watch: WatchHandle,
    /// Digest of each file as of its last sync in either direction
    synced: Mutex<HashMap<String, [u8; 32]>>,
    pass_lock: tokio::sync::Mutex<()>,
    rerun: AtomicBool,
}

/// Keeps the working directory and the checked-out branch in step
pub struct FileSystemDriver {
    inner: Arc<DriverInner>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FileSystemDriver {
    /// Scan, attach an OS watcher and start the debounce loop
    pub async fn start(
        root: impl AsRef<Path>,
        tree: Arc<dyn WorkingTree>,
        hooks: Arc<dyn EditorHooks>,
        config: FsConfig,
    ) -> ProjectResult<Self> {
        Self::spawn(root.as_ref(), tree, hooks, config, true).await
    }

    /// Like `start` but without an OS watcher
    pub async fn start_detached(
        root: impl AsRef<Path>,
        tree: Arc<dyn WorkingTree>,
        hooks: Arc<dyn EditorHooks>,
        config: FsConfig,
    ) -> ProjectResult<Self> {
        Self::spawn(root.as_ref(), tree, hooks, config, false).await
    }

    async fn spawn(
        root: &Path,
        tree: Arc<dyn WorkingTree>,
        hooks: Arc<dyn EditorHooks>,
        config: FsConfig,
        attach: bool,
    ) -> ProjectResult<Self> {
        let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let (events, rx) = mpsc::unbounded_channel();
        let watcher = if attach {
            WatchHandle::start(&root, config.debounce(), events)?
        } else {
            WatchHandle::detached(&root, config.debounce(), events)?
        };
        let ignore = Arc::new(IgnoreRules::load(&root, &config.ignore));
        debug!(rules = ignore.len(), "Ignore rules loaded");

        let inner = Arc::new(DriverInner {
            root,
            tree,
            hooks,
            config,
            ignore,
            watch: watcher,
            synced: Mutex::new(HashMap::new()),
            pass_lock: tokio::sync::Mutex::new(()),
            rerun: AtomicBool::new(false),
        });

        inner.initial_scan().await?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_loop(inner.clone(), rx, shutdown_rx));
        info!(root = %inner.root.display(), watching = attach, "File system driver started");

        Ok(Self {
            inner,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn is_watching(&self) -> bool {
        self.inner.watch.is_watching()
    }

    /// Feed a path as if the watcher had reported it
    pub fn inject_event(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.inner.root.join(path)
        };
        self.inner.watch.inject(path);
    }

    /// Write the checked-out branch to disk, or queue a rerun if a pass is running
    pub async fn request_sync(&self) -> ProjectResult<SyncPassOutcome> {
        self.inner.request_sync().await
    }

    /// Flush pending edits and stop the debounce loop
    pub async fn stop(&self) -> ProjectResult<()> {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.await.map_err(|e| ProjectError::Task(e.to_string()))?;
        }
        info!(root = %self.inner.root.display(), "File system driver stopped");
        Ok(())
    }
}

impl Drop for FileSystemDriver {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

async fn run_loop(
    inner: Arc<DriverInner>,
    mut events: mpsc::UnboundedReceiver<Vec<PathBuf>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            batch = events.recv() => match batch {
                Some(paths) => {
                    let settled = inner.relative_all(paths);
                    if let Err(e) = inner.flush(settled).await {
                        error!(error = %e, "Failed to commit local changes");
                    }
                }
                None => break,
            },
        }
    }

    // Events reported before shutdown still count once they settle
    tokio::time::sleep(inner.config.debounce() * 2).await;
    let mut pending = Vec::new();
    while let Ok(paths) = events.try_recv() {
        pending.extend(paths);
    }
    let pending = inner.relative_all(pending);
    if let Err(e) = inner.flush(pending).await {
        error!(error = %e, "Failed to commit local changes on shutdown");
    }
}

fn is_scene(path: &str) -> bool {
    path.ends_with(".tscn") || path.ends_with(".tres")
}

/// Every non-ignored file under `dir`, as root-relative paths
fn walk(root: &Path, dir: &Path, ignore: &IgnoreRules, out: &mut Vec<String>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let Ok(rel) = path.strip_prefix(root) else {
            continue;
        };
        let rel = normalize(&rel.to_string_lossy());
        if ignore.is_ignored(&rel) || path.is_symlink() {
            continue;
        }
        if path.is_dir() {
            walk(root, &path, ignore, out)?;
        } else if path.is_file() {
            out.push(rel);
        }
    }
    Ok(())
}

async fn read_disk(path: &Path) -> ProjectResult<Option<FileContent>> {
    match tokio::fs::read(path).await {
        Ok(buf) => Ok(Some(FileContent::from_bytes(buf))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl DriverInner {
    /// Root-relative path, or `None` when outside the root or ignored
    fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let rel = normalize(&rel.to_string_lossy());
        if rel.is_empty() || self.ignore.is_ignored(&rel) {
            return None;
        }
        Some(rel)
    }

    fn relative_all(&self, paths: Vec<PathBuf>) -> Vec<String> {
        let mut rels: Vec<String> = paths.iter().filter_map(|path| self.relative(path)).collect();
        rels.sort();
        rels.dedup();
        rels
    }

    async fn files_under(&self, dir: &Path) -> ProjectResult<Vec<String>> {
        let root = self.root.clone();
        let dir = dir.to_path_buf();
        let ignore = self.ignore.clone();
        tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            walk(&root, &dir, &ignore, &mut out).map(|_| out)
        })
        .await
        .map_err(|e| ProjectError::Task(e.to_string()))?
        .map_err(Into::into)
    }

    /// Commit files that exist on disk but differ from the store
    async fn initial_scan(&self) -> ProjectResult<()> {
        let files = self.files_under(&self.root).await?;
        debug!(files = files.len(), "Scanning working directory");
        self.flush(files).await
    }

    /// Compare settled paths against the store and commit the differences
    async fn flush(&self, paths: Vec<String>) -> ProjectResult<()> {
        if paths.is_empty() {
            return Ok(());
        }

        let mut edits: BTreeMap<String, Option<FileContent>> = BTreeMap::new();
        for rel in paths {
            let full = self.root.join(&rel);
            if full.is_dir() {
                // A directory appeared; its files may not have been reported
                for file in self.files_under(&full).await? {
                    if let Some(content) = read_disk(&self.root.join(&file)).await? {
                        edits.insert(file, Some(content));
                    }
                }
                continue;
            }

            match read_disk(&full).await? {
                Some(content) => {
                    edits.insert(rel, Some(content));
                }
                None => {
                    // Either a file or a whole directory went away
                    let prefix = format!("{}/", rel);
                    let stored = self.tree.stored_files().await?;
                    for gone in stored.keys().filter(|p| **p == rel || p.starts_with(&prefix)) {
                        edits.insert(gone.clone(), None);
                    }
                }
            }
        }

        let mut changed = Vec::new();
        for (path, disk) in edits {
            let stored = self.tree.stored_file(&path).await?;
            let same = match (&disk, &stored) {
                (Some(a), Some(b)) => a.as_bytes() == b.as_bytes(),
                (None, None) => true,
                _ => false,
            };
            if same {
                debug!(path = %path, "Disk matches store, skipping");
                self.mark_synced(&path, disk.as_ref());
                continue;
            }
            changed.push((path, disk));
        }

        if changed.is_empty() {
            return Ok(());
        }

        let count = changed.len();
        let synced: Vec<(String, Option<[u8; 32]>)> = changed
            .iter()
            .map(|(path, content)| (path.clone(), content.as_ref().map(FileContent::digest)))
            .collect();
        let hash = self.tree.commit_local_changes(changed).await?;

        {
            let mut map = self.synced.lock();
            for (path, digest) in synced {
                match digest {
                    Some(digest) => map.insert(path, digest),
                    None => map.remove(&path),
                };
            }
        }

        info!(
            files = count,
            change = %hash.map(|h| h.short()).unwrap_or_default(),
            "Committed local changes"
        );
        Ok(())
    }

    fn mark_synced(&self, path: &str, content: Option<&FileContent>) {
        let mut map = self.synced.lock();
        match content {
            Some(content) => map.insert(path.to_string(), content.digest()),
            None => map.remove(path),
        };
    }

    async fn request_sync(&self) -> ProjectResult<SyncPassOutcome> {
        loop {
            let pass = match self.pass_lock.try_lock() {
                Ok(pass) => pass,
                Err(_) => {
                    // Whoever holds the lock checks the flag after releasing it
                    self.rerun.store(true, Ordering::SeqCst);
                    match self.pass_lock.try_lock() {
                        Ok(pass) => pass,
                        Err(_) => {
                            debug!("Sync pass already running, queued a rerun");
                            return Ok(SyncPassOutcome::Queued);
                        }
                    }
                }
            };

            self.rerun.store(false, Ordering::SeqCst);
            if self.hooks.has_unsaved_changes() {
                warn!("Editor has unsaved changes, not writing to disk");
                return Ok(SyncPassOutcome::Blocked);
            }

            let report = self.reconcile().await?;
            drop(pass);
            if !self.rerun.load(Ordering::SeqCst) {
                return Ok(SyncPassOutcome::Completed(report));
            }
            debug!("Rerunning sync pass");
        }
    }

    #[instrument(skip(self), fields(root = %self.root.display()))]
    async fn reconcile(&self) -> ProjectResult<ReconcileReport> {
        let stored = self.tree.stored_files().await?;
        let mut jobs = Vec::new();

        {
            let synced = self.synced.lock();
            for (path, expected) in synced.iter() {
                if !stored.contains_key(path) {
                    jobs.push(Job::Delete {
                        path: path.clone(),
                        expected: *expected,
                    });
                }
            }
            for (path, content) in stored {
                if self.ignore.is_ignored(&path) {
                    continue;
                }
                let last = synced.get(&path).copied();
                jobs.push(Job::Write {
                    path,
                    content,
                    synced: last,
                });
            }
        }

        let mut report = ReconcileReport::default();
        let guard = self.watch.pause();
        let workers = self.config.workers.max(1);
        let mut tasks = JoinSet::new();

        for job in jobs {
            if tasks.len() >= workers {
                if let Some(joined) = tasks.join_next().await {
                    self.record(joined, &mut report);
                }
            }
            let root = self.root.clone();
            tasks.spawn_blocking(move || job.run(&root));
        }
        while let Some(joined) = tasks.join_next().await {
            self.record(joined, &mut report);
        }
        drop(guard);
        report.written.sort();
        report.deleted.sort();
        report.locally_modified.sort();

        // Commit the local edits so the next pass sees them in the store
        for path in &report.locally_modified {
            self.watch.inject(self.root.join(path));
        }

        for path in &report.written {
            if self.root.join(format!("{}.import", path)).exists() {
                self.hooks.queue_reimport(path);
                report.reimports.push(path.clone());
            }
            if is_scene(path) {
                self.hooks.queue_scene_reload(path);
                report.reloads.push(path.clone());
            }
        }

        info!(
            written = report.written.len(),
            deleted = report.deleted.len(),
            unchanged = report.unchanged,
            locally_modified = report.locally_modified.len(),
            mismatches = report.type_mismatches.len(),
            failures = report.failures.len(),
            "Sync pass finished"
        );
        Ok(report)
    }

    fn record(
        &self,
        joined: Result<FileOutcome, tokio::task::JoinError>,
        report: &mut ReconcileReport,
    ) {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Sync worker failed");
                report
                    .failures
                    .push((String::new(), ProjectError::Task(e.to_string())));
                return;
            }
        };

        let mut synced = self.synced.lock();
        match outcome {
            FileOutcome::Written(path, digest) => {
                debug!(path = %path, "Wrote file");
                synced.insert(path.clone(), digest);
                report.written.push(path);
            }
            FileOutcome::Unchanged(path, digest) => {
                synced.insert(path, digest);
                report.unchanged += 1;
            }
            FileOutcome::Deleted(path) => {
                debug!(path = %path, "Deleted file");
                synced.remove(&path);
                report.deleted.push(path);
            }
            FileOutcome::Kept(path) => {
                debug!(path = %path, "Kept locally edited file");
                synced.remove(&path);
            }
            FileOutcome::LocallyModified(path) => {
                info!(path = %path, "Disk copy has uncommitted edits, not overwriting");
                report.locally_modified.push(path);
            }
            FileOutcome::Mismatch { path, stored, found } => {
                warn!(path = %path, %stored, %found, "Stored and disk file kinds differ, skipping");
                report
                    .type_mismatches
                    .push(ProjectError::TypeMismatch { path, stored, found });
            }
            FileOutcome::Failed(path, e) => {
                error!(path = %path, error = %e, "Failed to write file");
                report.failures.push((path, e.into()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize};
    use std::time::Duration;

    /// In-memory stand-in for a checked-out branch
    #[derive(Default)]
    struct FakeTree {
        files: Mutex<BTreeMap<String, FileContent>>,
        commits: AtomicUsize,
        /// Slows down full listings, after the snapshot is taken
        list_delay_ms: AtomicU64,
    }

    #[async_trait]
    impl WorkingTree for FakeTree {
        async fn stored_file(&self, path: &str) -> ProjectResult<Option<FileContent>> {
            Ok(self.files.lock().get(path).cloned())
        }

        async fn stored_files(&self) -> ProjectResult<BTreeMap<String, FileContent>> {
            let files = self.files.lock().clone();
            let delay = self.list_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            Ok(files)
        }

        async fn commit_local_changes(
            &self,
            changes: Vec<(String, Option<FileContent>)>,
        ) -> ProjectResult<Option<ChangeHash>> {
            let mut files = self.files.lock();
            for (path, content) in changes {
                match content {
                    Some(content) => files.insert(path, content),
                    None => files.remove(&path),
                };
            }
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    }

    #[derive(Default)]
    struct RecordingHooks {
        unsaved: AtomicBool,
        reimports: Mutex<Vec<String>>,
        reloads: Mutex<Vec<String>>,
    }

    impl EditorHooks for RecordingHooks {
        fn has_unsaved_changes(&self) -> bool {
            self.unsaved.load(Ordering::SeqCst)
        }

        fn queue_reimport(&self, path: &str) {
            self.reimports.lock().push(path.to_string());
        }

        fn queue_scene_reload(&self, path: &str) {
            self.reloads.lock().push(path.to_string());
        }
    }

    fn config() -> FsConfig {
        FsConfig {
            debounce_ms: 50,
            ..FsConfig::default()
        }
    }

    #[tokio::test]
    async fn test_initial_scan_commits_disk_files_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("art")).unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        std::fs::write(dir.path().join("art/icon.png"), [0u8, 1, 2, 3]).unwrap();
        std::fs::create_dir_all(dir.path().join(".godot")).unwrap();
        std::fs::write(dir.path().join(".godot/cache"), "x").unwrap();

        let tree = Arc::new(FakeTree::default());
        let driver = FileSystemDriver::start_detached(
            dir.path(),
            tree.clone(),
            Arc::new(NoopHooks),
            config(),
        )
        .await
        .unwrap();

        assert_eq!(tree.commits.load(Ordering::SeqCst), 1);
        let files = tree.files.lock().clone();
        assert_eq!(files.keys().collect::<Vec<_>>(), vec!["a.txt", "art/icon.png"]);
        assert_eq!(files["art/icon.png"].kind(), FileKind::Binary);
        driver.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_burst_of_events_commits_once() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Arc::new(FakeTree::default());
        let driver = FileSystemDriver::start_detached(
            dir.path(),
            tree.clone(),
            Arc::new(NoopHooks),
            config(),
        )
        .await
        .unwrap();

        for i in 0..5 {
            std::fs::write(dir.path().join("a.txt"), format!("v{}", i)).unwrap();
            driver.inject_event("a.txt");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(tree.commits.load(Ordering::SeqCst), 1);
        assert_eq!(
            tree.files.lock().get("a.txt").and_then(|c| c.as_text().map(str::to_string)),
            Some("v4".to_string())
        );

        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        driver.inject_event("b.txt");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(tree.commits.load(Ordering::SeqCst), 2);

        // Touching a file without changing it commits nothing
        driver.inject_event("b.txt");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(tree.commits.load(Ordering::SeqCst), 2);

        std::fs::remove_file(dir.path().join("b.txt")).unwrap();
        driver.inject_event("b.txt");
        driver.stop().await.unwrap();
        assert_eq!(tree.commits.load(Ordering::SeqCst), 3);
        assert!(!tree.files.lock().contains_key("b.txt"));
    }

    #[tokio::test]
    async fn test_reconcile_writes_and_hooks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("icon.png.import"), "[remap]\n").unwrap();
        let tree = Arc::new(FakeTree::default());
        let hooks = Arc::new(RecordingHooks::default());
        let driver =
            FileSystemDriver::start_detached(dir.path(), tree.clone(), hooks.clone(), config())
                .await
                .unwrap();

        {
            let mut files = tree.files.lock();
            files.insert("icon.png".into(), FileContent::from_bytes(vec![0u8, 9, 9]));
            files.insert("main.tscn".into(), FileContent::from("[gd_scene format=3]\n"));
        }

        let SyncPassOutcome::Completed(report) = driver.request_sync().await.unwrap() else {
            panic!("expected a completed pass");
        };
        // The companion .import file was committed by the initial scan
        assert_eq!(report.written, vec!["icon.png", "main.tscn"]);
        assert_eq!(report.reimports, vec!["icon.png"]);
        assert_eq!(report.reloads, vec!["main.tscn"]);
        assert_eq!(*hooks.reimports.lock(), vec!["icon.png".to_string()]);

        // Nothing to do the second time
        let SyncPassOutcome::Completed(report) = driver.request_sync().await.unwrap() else {
            panic!("expected a completed pass");
        };
        assert!(report.written.is_empty());
        assert_eq!(report.unchanged, 3);

        // Removing a synced file from the store deletes it from disk
        tree.files.lock().remove("main.tscn");
        let SyncPassOutcome::Completed(report) = driver.request_sync().await.unwrap() else {
            panic!("expected a completed pass");
        };
        assert_eq!(report.deleted, vec!["main.tscn"]);
        assert!(!dir.path().join("main.tscn").exists());

        hooks.unsaved.store(true, Ordering::SeqCst);
        assert!(matches!(
            driver.request_sync().await.unwrap(),
            SyncPassOutcome::Blocked
        ));
        driver.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.bin"), "plain text").unwrap();
        let tree = Arc::new(FakeTree::default());
        let driver = FileSystemDriver::start_detached(
            dir.path(),
            tree.clone(),
            Arc::new(NoopHooks),
            config(),
        )
        .await
        .unwrap();

        // The store now holds binary data where the synced disk copy is text
        tree.files
            .lock()
            .insert("data.bin".into(), FileContent::from_bytes(vec![0u8, 1, 2]));

        let SyncPassOutcome::Completed(report) = driver.request_sync().await.unwrap() else {
            panic!("expected a completed pass");
        };
        assert!(report.written.is_empty());
        assert_eq!(report.type_mismatches.len(), 1);
        assert!(!report.is_clean());
        assert_eq!(std::fs::read_to_string(dir.path().join("data.bin")).unwrap(), "plain text");
        driver.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_edited_file_survives_store_deletion() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "base").unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        let tree = Arc::new(FakeTree::default());
        let driver = FileSystemDriver::start_detached(
            dir.path(),
            tree.clone(),
            Arc::new(NoopHooks),
            config(),
        )
        .await
        .unwrap();

        std::fs::write(dir.path().join("a.txt"), "local edit").unwrap();
        {
            let mut files = tree.files.lock();
            files.remove("a.txt");
            files.remove("b.txt");
        }

        let SyncPassOutcome::Completed(report) = driver.request_sync().await.unwrap() else {
            panic!("expected a completed pass");
        };
        assert_eq!(report.deleted, vec!["b.txt"]);
        assert!(!dir.path().join("b.txt").exists());
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "local edit");
        driver.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsettled_local_edit_is_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "base").unwrap();
        let tree = Arc::new(FakeTree::default());
        tree.files.lock().insert("a.txt".into(), FileContent::from("base"));
        let driver = FileSystemDriver::start_detached(
            dir.path(),
            tree.clone(),
            Arc::new(NoopHooks),
            FsConfig {
                debounce_ms: 200,
                ..FsConfig::default()
            },
        )
        .await
        .unwrap();

        // Edited locally, and remotely, before the edit settled
        std::fs::write(dir.path().join("a.txt"), "local edit").unwrap();
        tree.files.lock().insert("a.txt".into(), FileContent::from("theirs"));
        tree.files.lock().insert("b.txt".into(), FileContent::from("b"));

        let SyncPassOutcome::Completed(report) = driver.request_sync().await.unwrap() else {
            panic!("expected a completed pass");
        };
        assert_eq!(report.locally_modified, vec!["a.txt"]);
        assert_eq!(report.written, vec!["b.txt"]);
        assert!(report.is_clean());
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "local edit");

        // The skipped file is committed once it settles
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(
            tree.files.lock().get("a.txt").and_then(|c| c.as_text().map(str::to_string)),
            Some("local edit".to_string())
        );
        let SyncPassOutcome::Completed(report) = driver.request_sync().await.unwrap() else {
            panic!("expected a completed pass");
        };
        assert!(report.locally_modified.is_empty());
        assert!(report.written.is_empty());
        driver.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_during_pass_is_queued_and_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let tree = Arc::new(FakeTree::default());
        let driver = Arc::new(
            FileSystemDriver::start_detached(dir.path(), tree.clone(), Arc::new(NoopHooks), config())
                .await
                .unwrap(),
        );
        tree.files.lock().insert("first.txt".into(), FileContent::from("1"));
        tree.list_delay_ms.store(200, Ordering::SeqCst);

        let running = {
            let driver = driver.clone();
            tokio::spawn(async move { driver.request_sync().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Arrives after the running pass listed the store
        tree.files.lock().insert("late.txt".into(), FileContent::from("2"));
        assert!(matches!(
            driver.request_sync().await.unwrap(),
            SyncPassOutcome::Queued
        ));

        let SyncPassOutcome::Completed(report) = running.await.unwrap().unwrap() else {
            panic!("expected a completed pass");
        };
        // The report is from the rerun, which only had the late file to write
        assert_eq!(report.written, vec!["late.txt"]);
        assert_eq!(std::fs::read_to_string(dir.path().join("first.txt")).unwrap(), "1");
        assert_eq!(std::fs::read_to_string(dir.path().join("late.txt")).unwrap(), "2");
        driver.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_ignore_file_at_root_is_honored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".tandemignore"), "exports/*\n").unwrap();
        std::fs::create_dir_all(dir.path().join("exports")).unwrap();
        std::fs::write(dir.path().join("exports/game.pck"), [0u8, 1]).unwrap();
        std::fs::write(dir.path().join("main.gd"), "extends Node\n").unwrap();

        let tree = Arc::new(FakeTree::default());
        let driver = FileSystemDriver::start_detached(
            dir.path(),
            tree.clone(),
            Arc::new(NoopHooks),
            config(),
        )
        .await
        .unwrap();

        let files = tree.files.lock().clone();
        assert_eq!(files.keys().collect::<Vec<_>>(), vec![".tandemignore", "main.gd"]);
        driver.stop().await.unwrap();
    }
}
