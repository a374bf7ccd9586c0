//! Editor-facing project handle
//!
//! `Project` owns the replica: the document store, its persistent backing,
//! the branch manager, the sync driver and (once watching) the file system
//! driver. Every mutating call persists the documents it touched and
//! announces itself on the event channel.

use crate::branch::Branch;
use crate::branches::BranchManager;
use crate::config::{ProjectConfig, SessionState, STATE_DIR, STORE_FILE};
use crate::error::{ProjectError, ProjectResult};
use crate::files::{all_files, all_files_at, file_op, normalize, read_file, read_file_at};
use crate::fs::{EditorHooks, FileSystemDriver, SyncPassOutcome, WorkingTree};
use crate::history::{self, ChangeInfo, ProjectDiff};
use crate::sync::{SyncDriver, SyncStatus};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tandem_core::{ActorId, Change, ChangeHash, DocumentId, DocumentStore, FileContent, HeadSet};
use tandem_storage::{load_document, save_document, MemoryStorage, SqliteStorage, Storage};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Notifications for the editor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectEvent {
    BranchesChanged,
    CheckedOutBranch(DocumentId),
    /// Files changed on the checked-out branch
    FilesChanged(Vec<String>),
    SyncServerConnectionInfoChanged(DocumentId),
}

/// State shared with the file system driver
struct Shared {
    store: Arc<DocumentStore>,
    storage: Arc<dyn Storage>,
    branches: BranchManager,
    events: broadcast::Sender<ProjectEvent>,
    /// Change count of each document when it was last written to storage;
    /// held across the write
    persisted: Mutex<HashMap<DocumentId, usize>>,
}

impl Shared {
    fn emit(&self, event: ProjectEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    fn current(&self) -> ProjectResult<DocumentId> {
        self.branches
            .current_branch_id()
            .ok_or_else(|| ProjectError::invalid("no branch is checked out"))
    }

    /// Write every document whose log grew, drop the ones that are gone
    ///
    /// Calls are serialized: the recorded count is the length seen before the
    /// write started, so a change that lands mid-write is picked up next time.
    async fn persist(&self) -> ProjectResult<()> {
        let mut persisted = self.persisted.lock().await;

        for meta in self.store.list(None) {
            let doc = self.store.get(&meta.id)?;
            let len = doc.len();
            let saved = persisted.get(&meta.id).copied().unwrap_or(0);
            if saved >= len {
                continue;
            }
            // Logs only grow, so everything past the saved count is new
            save_document(self.storage.as_ref(), &doc, saved).await?;
            persisted.insert(meta.id, len);
        }

        let removed: Vec<DocumentId> = persisted
            .keys()
            .filter(|id| !self.store.contains(id))
            .cloned()
            .collect();
        for id in removed {
            self.storage.delete(&id).await?;
            persisted.remove(&id);
        }
        Ok(())
    }

    /// Record file edits on the checked-out branch as one change
    async fn commit(
        &self,
        changes: Vec<(String, Option<FileContent>)>,
    ) -> ProjectResult<Option<ChangeHash>> {
        let branch = self.current()?;
        let doc = self.store.get(&branch)?;

        let changes: Vec<(String, Option<FileContent>)> = changes
            .into_iter()
            .map(|(path, content)| (normalize(&path), content))
            .filter(|(path, content)| {
                let stored = read_file(&doc, path);
                stored.as_ref().map(FileContent::as_bytes) != content.as_ref().map(FileContent::as_bytes)
            })
            .collect();
        if changes.is_empty() {
            return Ok(None);
        }

        let paths: Vec<String> = changes.iter().map(|(path, _)| path.clone()).collect();
        let ops = changes
            .iter()
            .map(|(path, content)| file_op(path, content.as_ref()))
            .collect();
        let hash = self.store.transact(
            &branch,
            self.branches.metadata(&branch).with_changed_files(paths.clone()),
            ops,
        )?;
        self.persist().await?;

        debug!(branch = %branch, files = paths.len(), change = %hash.short(), "Committed files");
        self.emit(ProjectEvent::FilesChanged(paths));
        Ok(Some(hash))
    }
}

#[async_trait]
impl WorkingTree for Shared {
    async fn stored_file(&self, path: &str) -> ProjectResult<Option<FileContent>> {
        let doc = self.store.get(&self.current()?)?;
        Ok(read_file(&doc, path))
    }

    async fn stored_files(&self) -> ProjectResult<BTreeMap<String, FileContent>> {
        let doc = self.store.get(&self.current()?)?;
        Ok(all_files(&doc))
    }

    async fn commit_local_changes(
        &self,
        changes: Vec<(String, Option<FileContent>)>,
    ) -> ProjectResult<Option<ChangeHash>> {
        self.commit(changes).await
    }
}

pub struct Project {
    shared: Arc<Shared>,
    sync: Arc<SyncDriver>,
    config: ProjectConfig,
    root: Option<PathBuf>,
    driver: RwLock<Option<FileSystemDriver>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Project {
    /// Open (or create) the project rooted at `root`, persisted in `.tandem/store.db`
    pub async fn open(root: impl AsRef<Path>) -> ProjectResult<Self> {
        let config = ProjectConfig::load(ProjectConfig::path_in(root.as_ref()))?;
        Self::open_with_config(root, config).await
    }

    /// Like `open` with an already resolved configuration
    pub async fn open_with_config(
        root: impl AsRef<Path>,
        config: ProjectConfig,
    ) -> ProjectResult<Self> {
        let root = root.as_ref().to_path_buf();
        let state_dir = root.join(STATE_DIR);
        tokio::fs::create_dir_all(&state_dir).await?;

        let storage = Arc::new(SqliteStorage::new(state_dir.join(STORE_FILE))?);
        let session = SessionState::load(SessionState::path_in(&root))?;
        let project = Self::open_with(storage, config, session, Some(root)).await?;
        project.save_session()?;
        Ok(project)
    }

    /// A volatile project with default configuration
    pub async fn in_memory() -> ProjectResult<Self> {
        Self::open_with(
            Arc::new(MemoryStorage::new()),
            ProjectConfig::default(),
            SessionState::default(),
            None,
        )
        .await
    }

    /// Open over an explicit storage backend
    pub async fn open_with(
        storage: Arc<dyn Storage>,
        config: ProjectConfig,
        session: SessionState,
        root: Option<PathBuf>,
    ) -> ProjectResult<Self> {
        let session_id = session
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let username = config.user.name.clone().or_else(|| session.username.clone());
        let tie_break = config.merge.tie_break;
        let store = Arc::new(DocumentStore::with_tie_break(
            ActorId::new(session_id.as_str()),
            tie_break,
        ));

        let mut persisted = HashMap::new();
        for id in storage.list(None).await? {
            if let Some(doc) = load_document(storage.as_ref(), &id, tie_break).await? {
                persisted.insert(id, doc.len());
                store.insert(doc)?;
            }
        }
        debug!(documents = persisted.len(), "Loaded documents from storage");

        let project_id = match session.project_id.as_deref() {
            Some(id) => Some(DocumentId::new(id)?).filter(|id| store.contains(id)),
            None => None,
        }
        .or_else(|| store.list(Some("project:*")).first().map(|m| m.id.clone()));

        let branches = match project_id {
            Some(id) => BranchManager::open(store.clone(), id, username, session_id.as_str())?,
            None => BranchManager::create_project(store.clone(), username, session_id.as_str())?,
        };

        let checkout = match session.checked_out_branch.as_deref() {
            Some(id) => Some(DocumentId::new(id)?).filter(|id| store.contains(id)),
            None => None,
        };
        let checkout = match checkout {
            Some(id) => id,
            None => branches.main_branch_id()?,
        };
        branches.checkout(&checkout)?;

        let (events, _) = broadcast::channel(256);
        let shared = Arc::new(Shared {
            store: store.clone(),
            storage,
            branches,
            events,
            persisted: Mutex::new(persisted),
        });
        shared.persist().await?;

        let sync = Arc::new(SyncDriver::new(store));
        let mut tasks = vec![sync.spawn_watch()];
        let mut sync_changes = sync.subscribe();
        let relay = shared.events.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                match sync_changes.recv().await {
                    Ok(branch) => {
                        let _ = relay.send(ProjectEvent::SyncServerConnectionInfoChanged(branch));
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        info!(
            project = %shared.branches.project_id(),
            branch = %checkout,
            session = %shared.branches.session_id(),
            "Opened project"
        );

        Ok(Self {
            shared,
            sync,
            config,
            root,
            driver: RwLock::new(None),
            tasks,
        })
    }

    pub fn project_id(&self) -> &DocumentId {
        self.shared.branches.project_id()
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn config(&self) -> &ProjectConfig {
        &self.config
    }

    pub fn session_id(&self) -> &str {
        self.shared.branches.session_id()
    }

    pub fn username(&self) -> Option<&str> {
        self.shared.branches.username()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProjectEvent> {
        self.shared.events.subscribe()
    }

    pub fn sync_driver(&self) -> &Arc<SyncDriver> {
        &self.sync
    }

    fn save_session(&self) -> ProjectResult<()> {
        let Some(root) = &self.root else {
            return Ok(());
        };
        SessionState {
            project_id: Some(self.project_id().to_string()),
            checked_out_branch: self.shared.branches.current_branch_id().map(|id| id.to_string()),
            session_id: Some(self.session_id().to_string()),
            username: self.username().map(str::to_string),
        }
        .save(SessionState::path_in(root))
    }

    /// Write the checked-out branch to disk if the driver is running
    async fn sync_to_disk(&self) -> ProjectResult<Option<SyncPassOutcome>> {
        let driver = self.driver.read().await;
        match driver.as_ref() {
            Some(driver) => Ok(Some(driver.request_sync().await?)),
            None => Ok(None),
        }
    }

    async fn switched_to(&self, branch: &Branch) -> ProjectResult<()> {
        self.shared.persist().await?;
        self.save_session()?;
        self.shared.emit(ProjectEvent::CheckedOutBranch(branch.id.clone()));
        self.sync_to_disk().await?;
        Ok(())
    }

    // Branch API

    pub async fn get_branches(&self) -> ProjectResult<Vec<Branch>> {
        self.shared.branches.get_branches()
    }

    pub async fn get_branch_by_id(&self, id: &DocumentId) -> ProjectResult<Branch> {
        self.shared.branches.get_branch(id)
    }

    pub async fn main_branch(&self) -> ProjectResult<Branch> {
        self.shared.branches.main_branch()
    }

    pub async fn current_branch(&self) -> ProjectResult<Branch> {
        self.shared.branches.current_branch()
    }

    /// Fork the checked-out branch
    pub async fn create_branch(&self, name: &str) -> ProjectResult<Branch> {
        let parent = self.shared.current()?;
        let branch = self.shared.branches.create_branch(&parent, name)?;
        self.shared.persist().await?;
        self.shared.emit(ProjectEvent::BranchesChanged);
        Ok(branch)
    }

    pub async fn checkout_branch(&self, id: &DocumentId) -> ProjectResult<Branch> {
        let branch = self.shared.branches.checkout(id)?;
        self.switched_to(&branch).await?;
        info!(branch = %branch.id, name = %branch.name, "Checked out branch");
        Ok(branch)
    }

    /// Build a merge preview of `source` into `target` and check it out
    pub async fn create_merge_preview_branch(
        &self,
        source: &DocumentId,
        target: &DocumentId,
    ) -> ProjectResult<Branch> {
        let preview = self.shared.branches.create_merge_preview(source, target)?;
        self.shared.branches.checkout(&preview.id)?;
        self.shared.emit(ProjectEvent::BranchesChanged);
        self.switched_to(&preview).await?;
        Ok(preview)
    }

    pub async fn confirm_merge_preview(&self, preview: &DocumentId) -> ProjectResult<Branch> {
        let target = self.shared.branches.confirm_merge_preview(preview)?;
        self.shared.emit(ProjectEvent::BranchesChanged);
        self.switched_to(&target).await?;
        Ok(target)
    }

    pub async fn cancel_merge_preview(&self, preview: &DocumentId) -> ProjectResult<Branch> {
        let source = self.shared.branches.cancel_merge_preview(preview)?;
        self.shared.emit(ProjectEvent::BranchesChanged);
        self.switched_to(&source).await?;
        Ok(source)
    }

    pub async fn merge_branch(
        &self,
        source: &DocumentId,
        target: &DocumentId,
    ) -> ProjectResult<ChangeHash> {
        let hash = self.shared.branches.merge_branch(source, target)?;
        self.shared.persist().await?;
        self.shared.emit(ProjectEvent::BranchesChanged);
        if self.shared.branches.current_branch_id().as_ref() == Some(target) {
            let change = self.shared.store.get(target)?.get_change(&hash);
            let files = change.map(|c| c.metadata.changed_files).unwrap_or_default();
            self.shared.emit(ProjectEvent::FilesChanged(files));
            self.sync_to_disk().await?;
        }
        Ok(hash)
    }

    pub async fn delete_branch(&self, id: &DocumentId) -> ProjectResult<()> {
        let before = self.shared.branches.current_branch_id();
        self.shared.branches.delete_branch(id)?;
        self.shared.persist().await?;
        self.shared.emit(ProjectEvent::BranchesChanged);

        let after = self.shared.branches.current_branch_id();
        if before != after {
            if let Some(after) = after {
                let branch = self.shared.branches.get_branch(&after)?;
                self.switched_to(&branch).await?;
            }
        }
        Ok(())
    }

    pub async fn is_safe_to_merge(&self, id: &DocumentId) -> ProjectResult<bool> {
        self.shared.branches.is_safe_to_merge(id)
    }

    pub async fn conflicting_files(
        &self,
        source: &DocumentId,
        target: &DocumentId,
    ) -> ProjectResult<Vec<String>> {
        self.shared.branches.conflicting_files(source, target)
    }

    // History API

    /// History of the checked-out branch, oldest first
    pub async fn get_changes(&self) -> ProjectResult<Vec<ChangeInfo>> {
        let doc = self.shared.store.get(&self.shared.current()?)?;
        let branches = &self.shared.branches;
        Ok(history::history(&doc, |id| {
            branches
                .get_branch(id)
                .map(|b| b.name)
                .unwrap_or_else(|_| id.to_string())
        }))
    }

    pub async fn get_heads(&self) -> ProjectResult<HeadSet> {
        Ok(self.shared.store.heads(&self.shared.current()?)?)
    }

    pub async fn get_all_changes_between(
        &self,
        before: &HeadSet,
        after: &HeadSet,
    ) -> ProjectResult<ProjectDiff> {
        let doc = self.shared.store.get(&self.shared.current()?)?;
        history::diff_between(&doc, before, after)
    }

    /// Files changed on the checked-out branch since `since`
    pub async fn get_changed_files(&self, since: &HeadSet) -> ProjectResult<Vec<String>> {
        let doc = self.shared.store.get(&self.shared.current()?)?;
        history::changed_files(&doc, since, &doc.heads())
    }

    /// What the checked-out branch changes relative to where it started;
    /// `None` on main
    pub async fn get_default_diff(&self) -> ProjectResult<Option<ProjectDiff>> {
        let branch = self.shared.branches.current_branch()?;
        if branch.is_main {
            return Ok(None);
        }
        let doc = self.shared.store.get(&branch.id)?;
        let base = match (&branch.merge_at, branch.is_merge_preview) {
            (Some(merge_at), true) => merge_at.clone(),
            _ => doc.known_heads(&branch.forked_at),
        };
        Ok(Some(history::diff_between(&doc, &base, &branch.heads)?))
    }

    // File API

    pub async fn save_file(
        &self,
        path: &str,
        content: impl Into<FileContent>,
    ) -> ProjectResult<Option<ChangeHash>> {
        self.save_files(vec![(path.to_string(), content.into())]).await
    }

    /// Save several files as one change
    pub async fn save_files(
        &self,
        files: Vec<(String, FileContent)>,
    ) -> ProjectResult<Option<ChangeHash>> {
        let changes = files.into_iter().map(|(path, c)| (path, Some(c))).collect();
        let hash = self.shared.commit(changes).await?;
        if hash.is_some() {
            self.sync_to_disk().await?;
        }
        Ok(hash)
    }

    pub async fn delete_file(&self, path: &str) -> ProjectResult<Option<ChangeHash>> {
        let hash = self.shared.commit(vec![(path.to_string(), None)]).await?;
        if hash.is_some() {
            self.sync_to_disk().await?;
        }
        Ok(hash)
    }

    pub async fn get_file(&self, path: &str) -> ProjectResult<Option<FileContent>> {
        let doc = self.shared.store.get(&self.shared.current()?)?;
        Ok(read_file(&doc, &normalize(path)))
    }

    pub async fn get_file_at(
        &self,
        path: &str,
        heads: &HeadSet,
    ) -> ProjectResult<Option<FileContent>> {
        let doc = self.shared.store.get(&self.shared.current()?)?;
        read_file_at(&doc, &normalize(path), heads)
    }

    pub async fn list_all_files(&self) -> ProjectResult<Vec<String>> {
        let doc = self.shared.store.get(&self.shared.current()?)?;
        Ok(all_files(&doc).into_keys().collect())
    }

    pub async fn list_files_at(&self, heads: &HeadSet) -> ProjectResult<Vec<String>> {
        let doc = self.shared.store.get(&self.shared.current()?)?;
        Ok(all_files_at(&doc, heads)?.into_keys().collect())
    }

    // Sync surface

    /// Changes of `branch` a peer at `since` is missing
    pub async fn changes_since(
        &self,
        branch: &DocumentId,
        since: &HeadSet,
    ) -> ProjectResult<Vec<Change>> {
        Ok(self.shared.store.changes_since(branch, since)?)
    }

    /// Integrate changes a peer sent for `branch`
    pub async fn apply_remote_changes(
        &self,
        branch: &DocumentId,
        changes: Vec<Change>,
    ) -> ProjectResult<usize> {
        let before = self.shared.store.heads(branch)?;
        let applied = self.shared.store.apply_remote(branch, changes)?;
        if applied == 0 {
            return Ok(0);
        }
        self.shared.persist().await?;

        if self.shared.branches.current_branch_id().as_ref() == Some(branch) {
            let doc = self.shared.store.get(branch)?;
            let files = history::changed_files(&doc, &before, &doc.heads())?;
            self.shared.emit(ProjectEvent::FilesChanged(files));
            self.sync_to_disk().await?;
        }
        Ok(applied)
    }

    pub async fn sync_status(&self) -> ProjectResult<SyncStatus> {
        Ok(self.sync.status(&self.shared.current()?))
    }

    // Working directory

    /// Mirror the project directory into the checked-out branch
    pub async fn start_watching(&self, hooks: Arc<dyn EditorHooks>) -> ProjectResult<()> {
        let root = self
            .root
            .clone()
            .ok_or_else(|| ProjectError::invalid("project has no working directory"))?;
        self.attach_driver(
            FileSystemDriver::start(&root, self.shared.clone(), hooks, self.config.fs.clone())
                .await?,
        )
        .await
    }

    /// Like `start_watching` but driven only by `inject_event`
    pub async fn start_watching_detached(
        &self,
        root: impl AsRef<Path>,
        hooks: Arc<dyn EditorHooks>,
    ) -> ProjectResult<()> {
        let driver =
            FileSystemDriver::start_detached(root, self.shared.clone(), hooks, self.config.fs.clone())
                .await?;
        self.attach_driver(driver).await
    }

    async fn attach_driver(&self, driver: FileSystemDriver) -> ProjectResult<()> {
        let previous = self.driver.write().await.replace(driver);
        if let Some(previous) = previous {
            warn!("Replacing a running file system driver");
            previous.stop().await?;
        }
        self.sync_to_disk().await?;
        Ok(())
    }

    /// Feed a path to the running driver as if the watcher reported it
    pub async fn inject_fs_event(&self, path: impl AsRef<Path>) -> ProjectResult<()> {
        let driver = self.driver.read().await;
        let driver = driver
            .as_ref()
            .ok_or_else(|| ProjectError::invalid("file system driver is not running"))?;
        driver.inject_event(path);
        Ok(())
    }

    /// Run a store-to-disk pass now
    pub async fn request_disk_sync(&self) -> ProjectResult<Option<SyncPassOutcome>> {
        self.sync_to_disk().await
    }

    pub async fn stop_watching(&self) -> ProjectResult<()> {
        let driver = self.driver.write().await.take();
        if let Some(driver) = driver {
            driver.stop().await?;
        }
        Ok(())
    }

    /// Flush everything and unregister this session
    pub async fn close(&self) -> ProjectResult<()> {
        self.stop_watching().await?;
        self.save_session()?;
        self.shared.branches.end_session()?;
        self.shared.persist().await?;
        info!(project = %self.project_id(), "Closed project");
        Ok(())
    }
}

impl Drop for Project {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserConfig;
    use crate::ErrorKind;

    async fn project(name: &str) -> Project {
        let config = ProjectConfig {
            user: UserConfig {
                name: Some(name.to_string()),
            },
            ..ProjectConfig::default()
        };
        Project::open_with(
            Arc::new(MemoryStorage::new()),
            config,
            SessionState::default(),
            None,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_save_and_read_files() {
        let project = project("alice").await;
        let mut events = project.subscribe();

        let first = project.save_file("A.txt", "1").await.unwrap();
        assert!(first.is_some());
        assert_eq!(
            events.recv().await.unwrap(),
            ProjectEvent::FilesChanged(vec!["A.txt".to_string()])
        );

        // Same content is not a change
        assert!(project.save_file("./A.txt", "1").await.unwrap().is_none());

        let before = project.get_heads().await.unwrap();
        project.save_file("A.txt", "2").await.unwrap();
        assert_eq!(
            project.get_file("A.txt").await.unwrap().unwrap().as_text(),
            Some("2")
        );
        assert_eq!(
            project.get_file_at("A.txt", &before).await.unwrap().unwrap().as_text(),
            Some("1")
        );

        project.delete_file("A.txt").await.unwrap();
        assert!(project.list_all_files().await.unwrap().is_empty());
        assert_eq!(project.list_files_at(&before).await.unwrap(), vec!["A.txt"]);

        let summaries: Vec<String> = project
            .get_changes()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.summary)
            .collect();
        assert_eq!(summaries[0], "Initialized repository");
        assert_eq!(summaries[1], "alice edited A.txt");
        assert_eq!(summaries.len(), 4);
    }

    #[tokio::test]
    async fn test_branch_lifecycle_events() {
        let project = project("alice").await;
        let main = project.main_branch().await.unwrap();
        let mut events = project.subscribe();

        let feature = project.create_branch("feature").await.unwrap();
        assert_eq!(events.recv().await.unwrap(), ProjectEvent::BranchesChanged);
        assert_eq!(feature.forked_from.as_ref(), Some(&main.id));

        project.checkout_branch(&feature.id).await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            ProjectEvent::CheckedOutBranch(feature.id.clone())
        );
        assert!(project.get_default_diff().await.unwrap().unwrap().is_empty());

        project.save_file("B.txt", "b").await.unwrap();
        let diff = project.get_default_diff().await.unwrap().unwrap();
        assert_eq!(diff.paths(), vec!["B.txt"]);

        project.merge_branch(&feature.id, &main.id).await.unwrap();
        project.checkout_branch(&main.id).await.unwrap();
        assert!(project.get_default_diff().await.unwrap().is_none());
        assert_eq!(project.list_all_files().await.unwrap(), vec!["B.txt"]);

        let changes = project.get_changes().await.unwrap();
        let last = changes.last().unwrap();
        assert!(last.is_merge);
        assert_eq!(last.summary, "alice merged feature branch");

        let err = project.delete_branch(&main.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidOperation);
        project.delete_branch(&feature.id).await.unwrap();
        assert_eq!(project.get_branches().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reopen_from_storage() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let (project_id, feature_id, session) = {
            let project = Project::open_with(
                storage.clone(),
                ProjectConfig::default(),
                SessionState::default(),
                None,
            )
            .await
            .unwrap();
            project.save_file("A.txt", "kept").await.unwrap();
            let feature = project.create_branch("feature").await.unwrap();
            project.checkout_branch(&feature.id).await.unwrap();
            let session = SessionState {
                project_id: Some(project.project_id().to_string()),
                checked_out_branch: Some(feature.id.to_string()),
                session_id: Some(project.session_id().to_string()),
                username: None,
            };
            (project.project_id().clone(), feature.id, session)
        };

        let reopened = Project::open_with(storage, ProjectConfig::default(), session, None)
            .await
            .unwrap();
        assert_eq!(reopened.project_id(), &project_id);
        assert_eq!(reopened.current_branch().await.unwrap().id, feature_id);
        assert_eq!(
            reopened.get_file("A.txt").await.unwrap().unwrap().as_text(),
            Some("kept")
        );
        assert_eq!(reopened.get_branches().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_open_on_disk_persists_session() {
        let dir = tempfile::tempdir().unwrap();
        let branch = {
            let project = Project::open(dir.path()).await.unwrap();
            project.save_file("A.txt", "on disk").await.unwrap();
            let branch = project.create_branch("work").await.unwrap();
            project.checkout_branch(&branch.id).await.unwrap();
            project.close().await.unwrap();
            branch
        };
        assert!(dir.path().join(".tandem/store.db").exists());

        let session = SessionState::load(SessionState::path_in(dir.path())).unwrap();
        assert_eq!(session.checked_out_branch, Some(branch.id.to_string()));

        let project = Project::open(dir.path()).await.unwrap();
        assert_eq!(project.current_branch().await.unwrap().id, branch.id);
        assert_eq!(
            project.get_file("A.txt").await.unwrap().unwrap().as_text(),
            Some("on disk")
        );
    }
}
