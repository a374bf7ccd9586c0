use crate::error::ProjectResult;
use notify::{Event, EventHandler, EventKind, RecommendedWatcher, RecursiveMode, Watcher, WatcherKind};
use notify_debouncer_mini::{new_debouncer_opt, DebounceEventResult, DebouncedEventKind, Debouncer};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

/// Raw event source under the debouncer
///
/// Forwards OS events once `watch` is called, and lets callers push paths
/// through the same handler so injected events are debounced like real ones.
pub struct SourceWatcher {
    os: RecommendedWatcher,
    handler: Arc<Mutex<Box<dyn EventHandler>>>,
}

impl SourceWatcher {
    pub fn inject(&self, path: PathBuf) {
        let event = Event::new(EventKind::Any).add_path(path);
        self.handler.lock().handle_event(Ok(event));
    }
}

impl Watcher for SourceWatcher {
    fn new<F: EventHandler>(event_handler: F, config: notify::Config) -> notify::Result<Self> {
        let handler: Arc<Mutex<Box<dyn EventHandler>>> = Arc::new(Mutex::new(Box::new(event_handler)));
        let forward = handler.clone();
        let os = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                if let Ok(event) = &res {
                    if matches!(event.kind, EventKind::Access(_)) {
                        return;
                    }
                }
                forward.lock().handle_event(res);
            },
            config,
        )?;
        Ok(Self { os, handler })
    }

    fn watch(&mut self, path: &Path, recursive_mode: RecursiveMode) -> notify::Result<()> {
        self.os.watch(path, recursive_mode)
    }

    fn unwatch(&mut self, path: &Path) -> notify::Result<()> {
        self.os.unwatch(path)
    }

    fn kind() -> WatcherKind {
        RecommendedWatcher::kind()
    }
}

/// Debounced recursive watch over the project directory
///
/// Settled paths arrive on the channel in batches, one batch per debounce tick.
pub struct WatchHandle {
    root: PathBuf,
    debouncer: Mutex<Debouncer<SourceWatcher>>,
    attached: bool,
    paused: AtomicBool,
}

impl WatchHandle {
    pub fn start(root: &Path, window: Duration, events: UnboundedSender<Vec<PathBuf>>) -> ProjectResult<Self> {
        let mut handle = Self::build(root, window, events)?;
        handle
            .debouncer
            .get_mut()
            .watcher()
            .watch(root, RecursiveMode::Recursive)?;
        handle.attached = true;
        info!(root = %root.display(), "Watching project directory");
        Ok(handle)
    }

    /// A handle with no OS watch; events only arrive by injection
    pub fn detached(root: &Path, window: Duration, events: UnboundedSender<Vec<PathBuf>>) -> ProjectResult<Self> {
        Self::build(root, window, events)
    }

    fn build(root: &Path, window: Duration, events: UnboundedSender<Vec<PathBuf>>) -> ProjectResult<Self> {
        let config = notify_debouncer_mini::Config::default()
            .with_timeout(window)
            .with_batch_mode(true)
            .with_notify_config(notify::Config::default());

        let debouncer = new_debouncer_opt::<_, SourceWatcher>(config, move |res: DebounceEventResult| match res {
            Ok(batch) => {
                // Paths still being written are reported again once quiet
                let settled: Vec<PathBuf> = batch
                    .into_iter()
                    .filter(|event| matches!(event.kind, DebouncedEventKind::Any))
                    .map(|event| event.path)
                    .collect();
                if !settled.is_empty() {
                    // Receiver gone means the driver stopped
                    let _ = events.send(settled);
                }
            }
            Err(e) => warn!(error = ?e, "File watcher error"),
        })?;

        Ok(Self {
            root: root.to_path_buf(),
            debouncer: Mutex::new(debouncer),
            attached: false,
            paused: AtomicBool::new(false),
        })
    }

    pub fn is_watching(&self) -> bool {
        self.attached && !self.paused.load(Ordering::SeqCst)
    }

    /// Feed a path into the debouncer as if the OS had reported it
    pub fn inject(&self, path: PathBuf) {
        self.debouncer.lock().watcher().inject(path);
    }

    /// Stop watching until the returned guard is dropped
    pub fn pause(&self) -> WatchGuard<'_> {
        if self.attached {
            if let Err(e) = self.debouncer.lock().watcher().unwatch(&self.root) {
                warn!(error = %e, "Failed to pause file watcher");
            }
        }
        self.paused.store(true, Ordering::SeqCst);
        debug!("File watcher paused");
        WatchGuard { handle: self }
    }
}

/// Re-arms the watcher on drop, on every exit path of the holder
pub struct WatchGuard<'a> {
    handle: &'a WatchHandle,
}

impl Drop for WatchGuard<'_> {
    fn drop(&mut self) {
        if self.handle.attached {
            let mut debouncer = self.handle.debouncer.lock();
            if let Err(e) = debouncer.watcher().watch(&self.handle.root, RecursiveMode::Recursive) {
                error!(error = %e, "Failed to resume file watcher");
            }
        }
        self.handle.paused.store(false, Ordering::SeqCst);
        debug!("File watcher resumed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    const WINDOW: Duration = Duration::from_millis(50);

    #[test]
    fn test_guard_restores_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let handle = WatchHandle::start(dir.path(), WINDOW, tx).unwrap();
        assert!(handle.is_watching());

        {
            let _guard = handle.pause();
            assert!(!handle.is_watching());
        }
        assert!(handle.is_watching());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = handle.pause();
            panic!("pass failed");
        }));
        assert!(result.is_err());
        assert!(handle.is_watching());
    }

    #[tokio::test]
    async fn test_reports_created_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = WatchHandle::start(&root, WINDOW, tx).unwrap();

        std::fs::write(root.join("hello.txt"), "hi").unwrap();
        let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(batch.iter().any(|path| path.ends_with("hello.txt")));
    }

    #[tokio::test]
    async fn test_injected_burst_settles_once() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = WatchHandle::detached(dir.path(), WINDOW, tx).unwrap();
        assert!(!handle.is_watching());

        for _ in 0..3 {
            handle.inject(dir.path().join("a.txt"));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.inject(dir.path().join("b.txt"));

        let mut seen = Vec::new();
        while let Ok(Some(batch)) = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await {
            seen.extend(batch);
        }
        seen.sort();
        assert_eq!(seen, vec![dir.path().join("a.txt"), dir.path().join("b.txt")]);
    }
}
