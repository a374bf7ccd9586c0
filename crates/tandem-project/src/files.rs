//! File entries of a branch document (`files.<path>`)

use crate::error::ProjectResult;
use std::collections::{BTreeMap, BTreeSet};
use tandem_core::{DocPath, Document, FileContent, HeadSet, Op, PathChange, Value};

pub(crate) const FILES_KEY: &str = "files";

/// Document path of one file entry
pub fn file_path(path: &str) -> DocPath {
    DocPath::root().key(FILES_KEY).key(path)
}

/// Normalize a project-relative path to forward slashes without `./`
pub fn normalize(path: &str) -> String {
    let path = path.replace('\\', "/");
    let trimmed = path.trim_start_matches("./").trim_start_matches('/');
    trimmed.to_string()
}

pub(crate) fn read_file(doc: &Document, path: &str) -> Option<FileContent> {
    doc.get(&file_path(path))
        .and_then(|v| FileContent::from_value(&v))
}

pub(crate) fn read_file_at(
    doc: &Document,
    path: &str,
    heads: &HeadSet,
) -> ProjectResult<Option<FileContent>> {
    Ok(doc
        .get_at(&file_path(path), heads)?
        .and_then(|v| FileContent::from_value(&v)))
}

fn files_in(state: &Value) -> BTreeMap<String, FileContent> {
    state
        .get(&DocPath::root().key(FILES_KEY))
        .and_then(Value::as_object)
        .map(|files| {
            files
                .iter()
                .filter_map(|(path, v)| FileContent::from_value(v).map(|c| (path.clone(), c)))
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn all_files(doc: &Document) -> BTreeMap<String, FileContent> {
    files_in(&doc.snapshot())
}

pub(crate) fn all_files_at(
    doc: &Document,
    heads: &HeadSet,
) -> ProjectResult<BTreeMap<String, FileContent>> {
    Ok(files_in(&doc.snapshot_at(heads)?))
}

/// The op writing `content` (or removing the entry) at `path`
pub(crate) fn file_op(path: &str, content: Option<&FileContent>) -> Op {
    match content {
        Some(content) => Op::put(file_path(path), content.to_value()),
        None => Op::delete(file_path(path)),
    }
}

/// File paths touched by a list of document-level changes
pub(crate) fn changed_paths(changes: &[PathChange]) -> BTreeSet<String> {
    let mut paths = BTreeSet::new();
    for change in changes.iter().filter(|c| c.path.key_at(0) == Some(FILES_KEY)) {
        match change.path.key_at(1) {
            Some(path) => {
                paths.insert(path.to_string());
            }
            // The whole `files` map appeared or vanished
            None => {
                for side in [&change.old, &change.new].into_iter().flatten() {
                    if let Some(files) = side.as_object() {
                        paths.extend(files.keys().cloned());
                    }
                }
            }
        }
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::{ActorId, ChangeMetadata, DocumentId};

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("./scenes/main.tscn"), "scenes/main.tscn");
        assert_eq!(normalize("scenes\\main.tscn"), "scenes/main.tscn");
        assert_eq!(normalize("/A.txt"), "A.txt");
    }

    #[test]
    fn test_file_entries() {
        let doc = Document::new(DocumentId::new("branch:test").unwrap());
        let actor = ActorId::new("alice");
        let before = doc.heads();

        let text = FileContent::from("hello");
        let binary = FileContent::from_bytes(vec![0u8, 159, 146, 150]);
        doc.transact(
            &actor,
            ChangeMetadata::new(),
            vec![file_op("a.txt", Some(&text)), file_op("img/b.png", Some(&binary))],
        )
        .unwrap();

        assert_eq!(read_file(&doc, "a.txt"), Some(text.clone()));
        assert_eq!(read_file(&doc, "img/b.png"), Some(binary));
        assert_eq!(all_files(&doc).len(), 2);
        assert!(all_files_at(&doc, &before).unwrap().is_empty());

        let after = doc.heads();
        doc.transact(&actor, ChangeMetadata::new(), vec![file_op("a.txt", None)])
            .unwrap();
        assert!(read_file(&doc, "a.txt").is_none());
        assert_eq!(read_file_at(&doc, "a.txt", &after).unwrap(), Some(text));

        let changed = changed_paths(&doc.diff_between(&before, &doc.heads()).unwrap());
        assert_eq!(changed.into_iter().collect::<Vec<_>>(), vec!["img/b.png".to_string()]);
    }
}
