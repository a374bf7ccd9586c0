//! Tandem Project - branches, working-tree sync and history
//!
//! A project is a set of branch documents plus one root document holding
//! branch records and active sessions. This crate provides:
//! - `BranchManager`: forks, checkouts, merge previews and merges
//! - `FileSystemDriver`: debounced disk-to-store commits and store-to-disk passes
//! - `SyncDriver`: per-peer acknowledgement tracking
//! - `Project`: the async facade the editor and the CLI talk to

pub mod branch;
pub mod branches;
pub mod config;
pub mod error;
pub mod files;
pub mod fs;
pub mod history;
pub mod project;
pub mod sync;

pub use branch::Branch;
pub use branches::{BranchManager, SessionRecord};
pub use config::{ProjectConfig, SessionState};
pub use error::{ErrorKind, ProjectError, ProjectResult};
pub use fs::{EditorHooks, FileSystemDriver, NoopHooks, ReconcileReport, SyncPassOutcome, WorkingTree};
pub use history::{ChangeInfo, ProjectDiff};
pub use project::{Project, ProjectEvent};
pub use sync::{SyncDriver, SyncPeerState, SyncPhase, SyncStatus};
