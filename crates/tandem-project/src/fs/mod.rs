//! File system driver
//!
//! Mirrors the working directory into the checked-out branch (debounced,
//! one change per burst) and writes the branch back to disk on demand while
//! the watcher is paused.

mod driver;
mod ignore;
mod watch;

pub use driver::{
    EditorHooks, FileSystemDriver, NoopHooks, ReconcileReport, SyncPassOutcome, WorkingTree,
};
pub use ignore::{IgnoreRules, IGNORE_FILES};
pub use watch::{SourceWatcher, WatchGuard, WatchHandle};
