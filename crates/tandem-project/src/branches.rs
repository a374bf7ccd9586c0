//! Branch manager - forks, checkouts, merge previews and merges
//!
//! Branch records live in the project root document under
//! `branches.<id>`; every branch owns a separate document holding its file
//! history. Forks copy the parent's history up to its current heads, so a
//! merge only has to fold in the changes the target has not seen.

use crate::branch::{Branch, BRANCHES_KEY, MAIN_BRANCH_KEY, SESSIONS_KEY};
use crate::error::{ProjectError, ProjectResult};
use crate::files::{changed_paths, FILES_KEY};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tandem_core::{
    ChangeHash, ChangeMetadata, DocPath, Document, DocumentId, DocumentStore, MergeMetadata, Op,
    Value,
};
use tracing::{debug, info};

/// One editor session as recorded in the root document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: String,
    pub username: Option<String>,
    pub branch_id: Option<DocumentId>,
    pub updated_at: u64,
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub struct BranchManager {
    store: Arc<DocumentStore>,
    project_id: DocumentId,
    session_id: String,
    username: Option<String>,
    current: RwLock<Option<DocumentId>>,
}

impl BranchManager {
    /// Create a project root document and its main branch, then check it out
    pub fn create_project(
        store: Arc<DocumentStore>,
        username: Option<String>,
        session_id: impl Into<String>,
    ) -> ProjectResult<Self> {
        let project_id = DocumentId::generate("project");
        let main_id = DocumentId::generate("branch");
        store.create(project_id.clone())?;
        store.create(main_id.clone())?;

        let manager = Self {
            store,
            project_id,
            session_id: session_id.into(),
            username,
            current: RwLock::new(None),
        };

        // The main branch starts with one setup change so its heads are never empty
        manager.store.transact(
            &main_id,
            manager.metadata(&main_id).setup(),
            vec![Op::put(DocPath::root().key(FILES_KEY), Value::object())],
        )?;

        let main = Branch::main(main_id.clone(), manager.username.clone());
        manager.store.transact(
            &manager.project_id,
            manager.project_metadata().setup(),
            vec![
                Op::put(DocPath::root().key(MAIN_BRANCH_KEY), main_id.as_str()),
                Op::put(Branch::record_path(&main_id), main.to_value()),
            ],
        )?;

        manager.checkout(&main_id)?;
        info!(project = %manager.project_id, main = %main_id, "Created project");
        Ok(manager)
    }

    /// Attach to an existing project root document
    pub fn open(
        store: Arc<DocumentStore>,
        project_id: DocumentId,
        username: Option<String>,
        session_id: impl Into<String>,
    ) -> ProjectResult<Self> {
        store.get(&project_id)?;
        Ok(Self {
            store,
            project_id,
            session_id: session_id.into(),
            username,
            current: RwLock::new(None),
        })
    }

    pub fn project_id(&self) -> &DocumentId {
        &self.project_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Metadata for a change written on `branch` by this session
    pub fn metadata(&self, branch: &DocumentId) -> ChangeMetadata {
        let meta = ChangeMetadata::new().with_branch(branch.as_str());
        match &self.username {
            Some(name) => meta.with_username(name.clone()),
            None => meta,
        }
    }

    fn project_metadata(&self) -> ChangeMetadata {
        self.metadata(&self.project_id)
    }

    fn project_doc(&self) -> ProjectResult<Arc<Document>> {
        Ok(self.store.get(&self.project_id)?)
    }

    /// Fill in the fields derived from the branch document
    fn resolve(&self, mut branch: Branch) -> Branch {
        match self.store.get(&branch.id) {
            Ok(doc) => branch.heads = doc.heads(),
            Err(_) => branch.is_not_loaded = true,
        }
        branch
    }

    pub fn get_branches(&self) -> ProjectResult<Vec<Branch>> {
        let records = self.project_doc()?.get(&DocPath::root().key(BRANCHES_KEY));
        let Some(Value::Object(records)) = records else {
            return Ok(Vec::new());
        };

        let mut branches = records
            .iter()
            .map(|(id, record)| -> ProjectResult<Branch> {
                let id = DocumentId::new(id.as_str())?;
                Ok(self.resolve(Branch::from_value(id, record)?))
            })
            .collect::<ProjectResult<Vec<_>>>()?;

        branches.sort_by(|a, b| {
            b.is_main
                .cmp(&a.is_main)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(branches)
    }

    pub fn get_branch(&self, id: &DocumentId) -> ProjectResult<Branch> {
        let record = self
            .project_doc()?
            .get(&Branch::record_path(id))
            .ok_or_else(|| ProjectError::BranchNotFound(id.to_string()))?;
        Ok(self.resolve(Branch::from_value(id.clone(), &record)?))
    }

    fn loaded_branch(&self, id: &DocumentId) -> ProjectResult<Branch> {
        let branch = self.get_branch(id)?;
        if branch.is_not_loaded {
            return Err(ProjectError::BranchNotFound(format!("{} is not loaded", id)));
        }
        Ok(branch)
    }

    pub fn main_branch_id(&self) -> ProjectResult<DocumentId> {
        let id = self
            .project_doc()?
            .get(&DocPath::root().key(MAIN_BRANCH_KEY))
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| ProjectError::BranchNotFound("main".into()))?;
        Ok(DocumentId::new(id)?)
    }

    pub fn main_branch(&self) -> ProjectResult<Branch> {
        self.get_branch(&self.main_branch_id()?)
    }

    pub fn current_branch_id(&self) -> Option<DocumentId> {
        self.current.read().clone()
    }

    pub fn current_branch(&self) -> ProjectResult<Branch> {
        let id = self
            .current_branch_id()
            .ok_or_else(|| ProjectError::invalid("no branch is checked out"))?;
        self.get_branch(&id)
    }

    /// Branches forked from `id`, previews excluded
    pub fn children(&self, id: &DocumentId) -> ProjectResult<Vec<Branch>> {
        Ok(self
            .get_branches()?
            .into_iter()
            .filter(|b| b.forked_from.as_ref() == Some(id) && !b.is_merge_preview)
            .collect())
    }

    fn write_record(&self, branch: &Branch) -> ProjectResult<()> {
        self.store.transact(
            &self.project_id,
            self.project_metadata(),
            vec![Op::put(Branch::record_path(&branch.id), branch.to_value())],
        )?;
        Ok(())
    }

    /// Fork `parent` at its current heads
    pub fn create_branch(&self, parent: &DocumentId, name: &str) -> ProjectResult<Branch> {
        if name.trim().is_empty() {
            return Err(ProjectError::invalid("branch name cannot be empty"));
        }
        let parent = self.loaded_branch(parent)?;
        let parent_doc = self.store.get(&parent.id)?;

        let heads = parent_doc.heads();
        let id = DocumentId::generate("branch");
        let forked = parent_doc.fork_at(id.clone(), &heads)?;
        self.store.insert(forked)?;

        let mut branch = Branch::forked(id, name.trim(), self.username.clone(), &parent);
        branch.forked_at = heads.clone();
        branch.heads = heads;
        self.write_record(&branch)?;

        info!(
            branch = %branch.id,
            parent = %parent.id,
            name = %branch.name,
            "Created branch"
        );
        Ok(branch)
    }

    /// Make `id` the working branch of this session
    pub fn checkout(&self, id: &DocumentId) -> ProjectResult<Branch> {
        let branch = self.loaded_branch(id)?;
        *self.current.write() = Some(branch.id.clone());
        self.record_session(Some(&branch.id))?;
        debug!(branch = %branch.id, name = %branch.name, "Checked out branch");
        Ok(branch)
    }

    fn record_session(&self, branch: Option<&DocumentId>) -> ProjectResult<()> {
        let mut record = BTreeMap::new();
        if let Some(name) = &self.username {
            record.insert("username".to_string(), Value::from(name.as_str()));
        }
        if let Some(branch) = branch {
            record.insert("branch".to_string(), Value::from(branch.as_str()));
        }
        record.insert("updated_at".to_string(), Value::from(now_millis()));

        self.store.transact(
            &self.project_id,
            self.project_metadata(),
            vec![Op::put(
                DocPath::root().key(SESSIONS_KEY).key(self.session_id.as_str()),
                Value::Object(record),
            )],
        )?;
        Ok(())
    }

    /// Every session currently registered on the project
    pub fn sessions(&self) -> ProjectResult<Vec<SessionRecord>> {
        let records = self.project_doc()?.get(&DocPath::root().key(SESSIONS_KEY));
        let Some(Value::Object(records)) = records else {
            return Ok(Vec::new());
        };

        Ok(records
            .iter()
            .map(|(session_id, record)| SessionRecord {
                session_id: session_id.clone(),
                username: record
                    .get(&DocPath::root().key("username"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                branch_id: record
                    .get(&DocPath::root().key("branch"))
                    .and_then(Value::as_str)
                    .and_then(|id| DocumentId::new(id).ok()),
                updated_at: record
                    .get(&DocPath::root().key("updated_at"))
                    .and_then(Value::as_i64)
                    .unwrap_or(0) as u64,
            })
            .collect())
    }

    /// Drop this session's record from the root document
    pub fn end_session(&self) -> ProjectResult<()> {
        let path = DocPath::root().key(SESSIONS_KEY).key(self.session_id.as_str());
        if self.project_doc()?.get(&path).is_some() {
            self.store
                .transact(&self.project_id, self.project_metadata(), vec![Op::delete(path)])?;
        }
        Ok(())
    }

    /// Build a preview holding the target's history plus the source's
    pub fn create_merge_preview(
        &self,
        source: &DocumentId,
        target: &DocumentId,
    ) -> ProjectResult<Branch> {
        if source == target {
            return Err(ProjectError::invalid("cannot merge a branch into itself"));
        }
        let source = self.loaded_branch(source)?;
        let target = self.loaded_branch(target)?;
        let source_doc = self.store.get(&source.id)?;
        let target_doc = self.store.get(&target.id)?;

        let id = DocumentId::generate("branch");
        let preview_doc = target_doc.fork_at(id.clone(), &target.heads)?;
        preview_doc.merge(&source_doc)?;
        let heads = preview_doc.heads();
        self.store.insert(preview_doc)?;

        let preview = Branch {
            id,
            name: format!("{} <- {}", target.name, source.name),
            is_main: false,
            created_by: self.username.clone(),
            forked_from: Some(source.id.clone()),
            forked_at: source.heads.clone(),
            heads,
            merge_into: Some(target.id.clone()),
            merge_at: Some(target.heads.clone()),
            is_merge_preview: true,
            is_not_loaded: false,
        };
        self.write_record(&preview)?;

        info!(preview = %preview.id, name = %preview.name, "Created merge preview");
        Ok(preview)
    }

    fn preview(&self, id: &DocumentId) -> ProjectResult<Branch> {
        let preview = self.get_branch(id)?;
        if !preview.is_merge_preview {
            return Err(ProjectError::invalid(format!("{} is not a merge preview", id)));
        }
        Ok(preview)
    }

    /// Abandon a preview; the session returns to the source branch
    pub fn cancel_merge_preview(&self, id: &DocumentId) -> ProjectResult<Branch> {
        let preview = self.preview(id)?;
        let back = match &preview.forked_from {
            Some(source) => source.clone(),
            None => self.main_branch_id()?,
        };
        let branch = self.checkout(&back)?;
        self.remove_branch(&preview)?;
        info!(preview = %preview.id, "Cancelled merge preview");
        Ok(branch)
    }

    /// Merge the previewed source into its target and check the target out
    pub fn confirm_merge_preview(&self, id: &DocumentId) -> ProjectResult<Branch> {
        let preview = self.preview(id)?;
        let (Some(source), Some(target)) = (&preview.forked_from, &preview.merge_into) else {
            return Err(ProjectError::invalid(format!(
                "merge preview {} has no source or target",
                id
            )));
        };

        self.merge_branch(source, target)?;
        let branch = self.checkout(target)?;
        self.remove_branch(&preview)?;
        info!(preview = %preview.id, target = %target, "Confirmed merge preview");
        Ok(branch)
    }

    /// Fold `source` into `target` and record the merge on `target`
    pub fn merge_branch(&self, source: &DocumentId, target: &DocumentId) -> ProjectResult<ChangeHash> {
        if source == target {
            return Err(ProjectError::invalid("cannot merge a branch into itself"));
        }
        let source = self.loaded_branch(source)?;
        let target = self.loaded_branch(target)?;

        let folded = self.store.merge_documents(&target.id, &source.id)?;
        let after = self.store.heads(&target.id)?;
        let files: Vec<String> =
            changed_paths(&self.store.diff_between(&target.id, &target.heads, &after)?)
                .into_iter()
                .collect();

        let merge = MergeMetadata {
            merged_branch_id: source.id.to_string(),
            merged_at_heads: source.heads.clone(),
            forked_at_heads: source.forked_at.clone(),
        };
        let hash = self.store.transact(
            &target.id,
            self.metadata(&target.id)
                .with_merge(merge)
                .with_changed_files(files),
            Vec::new(),
        )?;

        info!(
            source = %source.id,
            target = %target.id,
            folded,
            change = %hash.short(),
            "Merged branch"
        );
        Ok(hash)
    }

    /// True while the parent has not moved since `id` was forked
    pub fn is_safe_to_merge(&self, id: &DocumentId) -> ProjectResult<bool> {
        let branch = self.get_branch(id)?;
        match &branch.forked_from {
            Some(parent) => Ok(self.get_branch(parent)?.heads == branch.forked_at),
            None => Ok(false),
        }
    }

    /// Files changed on both branches since `source` was forked
    pub fn conflicting_files(
        &self,
        source: &DocumentId,
        target: &DocumentId,
    ) -> ProjectResult<Vec<String>> {
        let source = self.loaded_branch(source)?;
        let target = self.loaded_branch(target)?;
        let source_doc = self.store.get(&source.id)?;
        let target_doc = self.store.get(&target.id)?;

        let ours = changed_paths(&source_doc.diff_between(&source.forked_at, &source.heads)?);
        let base = target_doc.known_heads(&source.forked_at);
        let theirs = changed_paths(&target_doc.diff_between(&base, &target.heads)?);

        Ok(ours.intersection(&theirs).cloned().collect())
    }

    /// Delete a branch record and its document
    pub fn delete_branch(&self, id: &DocumentId) -> ProjectResult<()> {
        let branch = self.get_branch(id)?;
        if branch.is_main {
            return Err(ProjectError::invalid("cannot delete the main branch"));
        }

        let elsewhere = self.sessions()?.into_iter().any(|s| {
            s.session_id != self.session_id && s.branch_id.as_ref() == Some(&branch.id)
        });
        if elsewhere {
            return Err(ProjectError::invalid(format!(
                "branch {} is checked out by another session",
                branch.name
            )));
        }

        if self.current_branch_id().as_ref() == Some(&branch.id) {
            let fallback = match &branch.forked_from {
                Some(parent) if self.store.contains(parent) => parent.clone(),
                _ => self.main_branch_id()?,
            };
            self.checkout(&fallback)?;
        }

        self.remove_branch(&branch)?;
        info!(branch = %branch.id, name = %branch.name, "Deleted branch");
        Ok(())
    }

    fn remove_branch(&self, branch: &Branch) -> ProjectResult<()> {
        self.store.transact(
            &self.project_id,
            self.project_metadata(),
            vec![Op::delete(Branch::record_path(&branch.id))],
        )?;
        if self.store.contains(&branch.id) {
            self.store.delete(&branch.id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::{file_op, read_file};
    use tandem_core::{ActorId, FileContent};

    fn manager() -> BranchManager {
        let store = Arc::new(DocumentStore::new(ActorId::new("alice")));
        BranchManager::create_project(store, Some("alice".into()), "session-a").unwrap()
    }

    fn write(m: &BranchManager, branch: &DocumentId, path: &str, text: &str) {
        m.store
            .transact(
                branch,
                m.metadata(branch).with_changed_files(vec![path.to_string()]),
                vec![file_op(path, Some(&FileContent::from(text)))],
            )
            .unwrap();
    }

    fn read(m: &BranchManager, branch: &DocumentId, path: &str) -> Option<String> {
        let doc = m.store.get(branch).unwrap();
        read_file(&doc, path).and_then(|c| c.as_text().map(str::to_string))
    }

    #[test]
    fn test_new_project_has_main_checked_out() {
        let m = manager();
        let main = m.main_branch().unwrap();
        assert!(main.is_main);
        assert!(main.forked_from.is_none());
        assert!(!main.heads.is_empty());
        assert_eq!(m.current_branch().unwrap().id, main.id);
        assert_eq!(m.get_branches().unwrap(), vec![main.clone()]);

        let sessions = m.sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].branch_id.as_ref(), Some(&main.id));
    }

    #[test]
    fn test_fork_starts_at_parent_heads() {
        let m = manager();
        let main = m.main_branch().unwrap();
        write(&m, &main.id, "A.txt", "1");
        let parent_heads = m.main_branch().unwrap().heads;

        let feature = m.create_branch(&main.id, "feature").unwrap();
        assert_eq!(feature.forked_from.as_ref(), Some(&main.id));
        assert_eq!(feature.forked_at, parent_heads);
        assert_eq!(feature.heads, parent_heads);
        assert_eq!(read(&m, &feature.id, "A.txt").as_deref(), Some("1"));
        assert!(m
            .store
            .diff_between(&feature.id, &parent_heads, &feature.forked_at)
            .unwrap()
            .is_empty());

        assert_eq!(m.children(&main.id).unwrap(), vec![feature.clone()]);
        assert!(m.is_safe_to_merge(&feature.id).unwrap());
        write(&m, &main.id, "B.txt", "x");
        assert!(!m.is_safe_to_merge(&feature.id).unwrap());

        assert!(m.create_branch(&main.id, "  ").is_err());
    }

    #[test]
    fn test_checkout_unknown_branch() {
        let m = manager();
        let err = m.checkout(&DocumentId::new("branch:nope").unwrap()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::NotFound);
    }

    #[test]
    fn test_merge_records_metadata_and_conflicts() {
        let m = manager();
        let main = m.main_branch().unwrap();
        write(&m, &main.id, "A.txt", "1");
        let feature = m.create_branch(&main.id, "feature").unwrap();

        write(&m, &main.id, "A.txt", "2");
        write(&m, &feature.id, "A.txt", "3");
        write(&m, &feature.id, "B.txt", "new");

        assert_eq!(m.conflicting_files(&feature.id, &main.id).unwrap(), vec!["A.txt"]);

        let hash = m.merge_branch(&feature.id, &main.id).unwrap();
        let change = m.store.get(&main.id).unwrap().get_change(&hash).unwrap();
        let merge = change.metadata.merge_metadata.unwrap();
        assert_eq!(merge.merged_branch_id, feature.id.to_string());
        assert_eq!(merge.forked_at_heads, feature.forked_at);
        assert!(change.ops.is_empty());
        assert!(change.metadata.changed_files.contains(&"B.txt".to_string()));
        assert_eq!(read(&m, &main.id, "B.txt").as_deref(), Some("new"));
    }

    #[test]
    fn test_preview_cancel_and_confirm() {
        let m = manager();
        let main = m.main_branch().unwrap();
        write(&m, &main.id, "A.txt", "1");
        let feature = m.create_branch(&main.id, "feature").unwrap();
        write(&m, &feature.id, "A.txt", "feature");
        m.checkout(&feature.id).unwrap();
        let main_heads = m.main_branch().unwrap().heads;

        let preview = m.create_merge_preview(&feature.id, &main.id).unwrap();
        assert_eq!(preview.name, "main <- feature");
        assert!(preview.is_merge_preview);
        assert_eq!(preview.merge_at.as_ref(), Some(&main_heads));
        assert_eq!(read(&m, &preview.id, "A.txt").as_deref(), Some("feature"));
        m.checkout(&preview.id).unwrap();

        let back = m.cancel_merge_preview(&preview.id).unwrap();
        assert_eq!(back.id, feature.id);
        assert!(m.get_branch(&preview.id).is_err());
        assert_eq!(m.main_branch().unwrap().heads, main_heads);
        assert_eq!(read(&m, &main.id, "A.txt").as_deref(), Some("1"));

        let preview = m.create_merge_preview(&feature.id, &main.id).unwrap();
        let target = m.confirm_merge_preview(&preview.id).unwrap();
        assert_eq!(target.id, main.id);
        assert_eq!(m.current_branch_id(), Some(main.id.clone()));
        assert_eq!(read(&m, &main.id, "A.txt").as_deref(), Some("feature"));
        assert!(!m.store.contains(&preview.id));

        assert!(m.cancel_merge_preview(&feature.id).is_err());
    }

    #[test]
    fn test_delete_rules() {
        let m = manager();
        let main = m.main_branch().unwrap();
        let feature = m.create_branch(&main.id, "feature").unwrap();
        let other = m.create_branch(&main.id, "other").unwrap();

        assert!(m.delete_branch(&main.id).is_err());

        // Deleting our own checked-out branch moves us to its parent
        m.checkout(&feature.id).unwrap();
        m.delete_branch(&feature.id).unwrap();
        assert_eq!(m.current_branch_id(), Some(main.id.clone()));
        assert!(!m.store.contains(&feature.id));

        // A second session on the same store has `other` checked out
        let second = BranchManager::open(
            m.store.clone(),
            m.project_id().clone(),
            Some("bob".into()),
            "session-b",
        )
        .unwrap();
        second.checkout(&other.id).unwrap();
        let err = m.delete_branch(&other.id).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidOperation);

        second.end_session().unwrap();
        m.delete_branch(&other.id).unwrap();
        assert_eq!(m.get_branches().unwrap().len(), 1);
    }
}
