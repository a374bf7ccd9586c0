//! Change history and structural diffs of a branch

use crate::error::ProjectResult;
use crate::files::{changed_paths, read_file_at};
use serde::Serialize;
use tandem_core::{Change, ChangeHash, Document, DocumentId, HeadSet};
use tandem_scene::{diff_files, FileDiff};
use tracing::{debug, warn};

const ANONYMOUS: &str = "Anonymous";

/// One history entry as shown to the editor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeInfo {
    pub hash: ChangeHash,
    pub username: String,
    pub summary: String,
    pub is_merge: bool,
    pub merged_branch_id: Option<DocumentId>,
    pub is_setup: bool,
    pub timestamp: u64,
    pub changed_files: Vec<String>,
}

impl ChangeInfo {
    /// Describe `change`; `branch_name` resolves merged branch ids
    pub fn describe(change: &Change, branch_name: impl Fn(&DocumentId) -> String) -> Self {
        let meta = &change.metadata;
        let username = meta
            .username
            .clone()
            .unwrap_or_else(|| ANONYMOUS.to_string());
        let merged_branch_id = meta
            .merge_metadata
            .as_ref()
            .and_then(|m| DocumentId::new(m.merged_branch_id.as_str()).ok());

        let summary = if let Some(merged) = &merged_branch_id {
            format!("{} merged {} branch", username, branch_name(merged))
        } else if meta.is_setup {
            "Initialized repository".to_string()
        } else {
            summarize(&username, &meta.changed_files)
        };

        Self {
            hash: change.hash,
            is_merge: change.is_merge(),
            merged_branch_id,
            is_setup: meta.is_setup,
            timestamp: change.timestamp,
            changed_files: meta.changed_files.clone(),
            summary,
            username,
        }
    }
}

fn summarize(author: &str, files: &[String]) -> String {
    match files {
        [] => format!("{} made some changes", author),
        [single] => format!("{} edited {}", author, single),
        many => format!("{} edited {} files", author, many.len()),
    }
}

/// Structural diff across every file changed between two head sets
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectDiff {
    pub files: Vec<FileDiff>,
    /// Files whose diff failed, with the reason
    pub errors: Vec<(String, String)>,
}

impl ProjectDiff {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.errors.is_empty()
    }

    pub fn paths(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.path.as_str()).collect()
    }
}

/// History of a branch document in causal order
pub(crate) fn history(
    doc: &Document,
    branch_name: impl Fn(&DocumentId) -> String,
) -> Vec<ChangeInfo> {
    doc.changes()
        .iter()
        .map(|change| ChangeInfo::describe(change, &branch_name))
        .collect()
}

/// Paths whose entries differ between `before` and `after`
pub(crate) fn changed_files(
    doc: &Document,
    before: &HeadSet,
    after: &HeadSet,
) -> ProjectResult<Vec<String>> {
    Ok(changed_paths(&doc.diff_between(before, after)?)
        .into_iter()
        .collect())
}

/// Diff every changed file; a file that fails is recorded and skipped
pub(crate) fn diff_between(
    doc: &Document,
    before: &HeadSet,
    after: &HeadSet,
) -> ProjectResult<ProjectDiff> {
    let mut diff = ProjectDiff::default();

    for path in changed_files(doc, before, after)? {
        let old = read_file_at(doc, &path, before)?;
        let new = read_file_at(doc, &path, after)?;

        match diff_files(&path, old.as_ref(), new.as_ref()) {
            Ok(Some(file)) => diff.files.push(file),
            Ok(None) => debug!(path = %path, "Contents equal, no diff"),
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to diff file");
                diff.errors.push((path, e.to_string()));
            }
        }
    }

    Ok(diff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::file_op;
    use tandem_core::{ActorId, ChangeMetadata, FileContent, MergeMetadata};
    use tandem_scene::ChangeType;

    fn doc() -> Document {
        Document::new(DocumentId::new("branch:history").unwrap())
    }

    fn write(doc: &Document, meta: ChangeMetadata, files: &[(&str, &str)]) -> ChangeHash {
        let ops = files
            .iter()
            .map(|(path, text)| file_op(path, Some(&FileContent::from(*text))))
            .collect();
        doc.transact(&ActorId::new("alice"), meta, ops).unwrap()
    }

    #[test]
    fn test_summaries() {
        let doc = doc();
        write(&doc, ChangeMetadata::new().with_username("alice").setup(), &[]);
        write(
            &doc,
            ChangeMetadata::new()
                .with_username("alice")
                .with_changed_files(vec!["A.txt".into()]),
            &[("A.txt", "1")],
        );
        write(
            &doc,
            ChangeMetadata::new().with_changed_files(vec!["A.txt".into(), "B.txt".into()]),
            &[("A.txt", "2"), ("B.txt", "x")],
        );
        write(
            &doc,
            ChangeMetadata::new().with_username("bob").with_merge(MergeMetadata {
                merged_branch_id: "branch:feature".into(),
                merged_at_heads: HeadSet::new(),
                forked_at_heads: HeadSet::new(),
            }),
            &[],
        );

        let infos = history(&doc, |id| {
            if id.as_str() == "branch:feature" {
                "feature".to_string()
            } else {
                id.to_string()
            }
        });
        let summaries: Vec<&str> = infos.iter().map(|c| c.summary.as_str()).collect();
        assert_eq!(
            summaries,
            vec![
                "Initialized repository",
                "alice edited A.txt",
                "Anonymous edited 2 files",
                "bob merged feature branch",
            ]
        );
        assert!(infos[0].is_setup);
        assert!(infos[3].is_merge);
        assert_eq!(infos[3].merged_branch_id.as_ref().map(|id| id.as_str()), Some("branch:feature"));
        assert_eq!(infos[2].username, "Anonymous");
    }

    #[test]
    fn test_diff_between_mixes_kinds() {
        let doc = doc();
        write(
            &doc,
            ChangeMetadata::new(),
            &[
                ("notes.txt", "a"),
                ("keep.txt", "same"),
                ("broken.tscn", "[gd_scene format=3]\n\n[node name=\"Root\" type=\"Node\"]\n"),
            ],
        );
        let before = doc.heads();

        write(
            &doc,
            ChangeMetadata::new(),
            &[
                ("notes.txt", "b"),
                ("main.tscn", "[gd_scene format=3]\n\n[node name=\"Root\" type=\"Node2D\"]\n"),
                ("broken.tscn", "value = 1\n"),
            ],
        );
        let after = doc.heads();

        assert_eq!(
            changed_files(&doc, &before, &after).unwrap(),
            vec!["broken.tscn", "main.tscn", "notes.txt"]
        );

        let diff = diff_between(&doc, &before, &after).unwrap();
        assert_eq!(diff.paths(), vec!["main.tscn", "notes.txt"]);
        assert_eq!(diff.files[0].change_type, ChangeType::Added);
        assert_eq!(diff.files[1].change_type, ChangeType::Modified);
        assert_eq!(diff.errors.len(), 1);
        assert_eq!(diff.errors[0].0, "broken.tscn");

        assert!(diff_between(&doc, &after, &after).unwrap().is_empty());
    }
}
