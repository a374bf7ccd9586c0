//! Branch records kept in the project root document

use crate::error::{ProjectError, ProjectResult};
use std::collections::BTreeMap;
use tandem_core::{DocPath, DocumentId, HeadSet, Value};

/// Root-document key holding every branch record
pub(crate) const BRANCHES_KEY: &str = "branches";
pub(crate) const MAIN_BRANCH_KEY: &str = "main_branch";
pub(crate) const SESSIONS_KEY: &str = "sessions";

/// A line of history backed by its own document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    pub id: DocumentId,
    pub name: String,
    pub is_main: bool,
    pub created_by: Option<String>,
    pub forked_from: Option<DocumentId>,
    /// Parent heads at creation time; never changes
    pub forked_at: HeadSet,
    /// Current heads of the branch document
    pub heads: HeadSet,
    /// Target of a merge preview
    pub merge_into: Option<DocumentId>,
    /// Target heads when the preview was built
    pub merge_at: Option<HeadSet>,
    pub is_merge_preview: bool,
    /// The record is known but the branch document is not in the store
    pub is_not_loaded: bool,
}

impl Branch {
    pub(crate) fn main(id: DocumentId, created_by: Option<String>) -> Self {
        Self {
            id,
            name: "main".to_string(),
            is_main: true,
            created_by,
            forked_from: None,
            forked_at: HeadSet::new(),
            heads: HeadSet::new(),
            merge_into: None,
            merge_at: None,
            is_merge_preview: false,
            is_not_loaded: false,
        }
    }

    pub(crate) fn forked(
        id: DocumentId,
        name: impl Into<String>,
        created_by: Option<String>,
        parent: &Branch,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            is_main: false,
            created_by,
            forked_from: Some(parent.id.clone()),
            forked_at: parent.heads.clone(),
            heads: parent.heads.clone(),
            merge_into: None,
            merge_at: None,
            is_merge_preview: false,
            is_not_loaded: false,
        }
    }

    /// Regular branches can be checked out by users; previews are transient
    pub fn is_available(&self) -> bool {
        !self.is_merge_preview && !self.is_not_loaded
    }

    pub(crate) fn record_path(id: &DocumentId) -> DocPath {
        DocPath::root().key(BRANCHES_KEY).key(id.as_str())
    }

    /// Persisted form; `heads` and `is_not_loaded` are derived on read
    pub(crate) fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("name".to_string(), Value::from(self.name.as_str()));
        map.insert("is_main".to_string(), Value::from(self.is_main));
        map.insert("forked_at".to_string(), heads_value(&self.forked_at));
        map.insert("is_merge_preview".to_string(), Value::from(self.is_merge_preview));
        if let Some(created_by) = &self.created_by {
            map.insert("created_by".to_string(), Value::from(created_by.as_str()));
        }
        if let Some(parent) = &self.forked_from {
            map.insert("forked_from".to_string(), Value::from(parent.as_str()));
        }
        if let Some(target) = &self.merge_into {
            map.insert("merge_into".to_string(), Value::from(target.as_str()));
        }
        if let Some(heads) = &self.merge_at {
            map.insert("merge_at".to_string(), heads_value(heads));
        }
        Value::Object(map)
    }

    pub(crate) fn from_value(id: DocumentId, value: &Value) -> ProjectResult<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| corrupt(&id, "record is not an object"))?;

        let str_field = |key: &str| map.get(key).and_then(Value::as_str).map(str::to_string);
        let id_field = |key: &str| -> ProjectResult<Option<DocumentId>> {
            str_field(key).map(DocumentId::new).transpose().map_err(Into::into)
        };
        let heads_field = |key: &str| -> ProjectResult<Option<HeadSet>> {
            map.get(key).map(|v| heads_from_value(&id, v)).transpose()
        };

        Ok(Self {
            name: str_field("name").ok_or_else(|| corrupt(&id, "missing name"))?,
            is_main: map.get("is_main").and_then(Value::as_bool).unwrap_or(false),
            created_by: str_field("created_by"),
            forked_from: id_field("forked_from")?,
            forked_at: heads_field("forked_at")?.unwrap_or_default(),
            heads: HeadSet::new(),
            merge_into: id_field("merge_into")?,
            merge_at: heads_field("merge_at")?,
            is_merge_preview: map
                .get("is_merge_preview")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            is_not_loaded: false,
            id,
        })
    }
}

fn corrupt(id: &DocumentId, message: &str) -> ProjectError {
    ProjectError::InvalidOperation(format!("branch record {} is invalid: {}", id, message))
}

pub(crate) fn heads_value(heads: &HeadSet) -> Value {
    Value::from(heads.to_strings())
}

pub(crate) fn heads_from_value(id: &DocumentId, value: &Value) -> ProjectResult<HeadSet> {
    let items = value
        .as_array()
        .ok_or_else(|| corrupt(id, "heads are not a list"))?;
    let strings: Vec<&str> = items.iter().filter_map(Value::as_str).collect();
    Ok(HeadSet::from_strings(&strings)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::ChangeHash;

    #[test]
    fn test_record_round_trip() {
        let main = Branch::main(DocumentId::new("branch:main").unwrap(), Some("alice".into()));
        let mut parent = main.clone();
        parent.heads = HeadSet::single(ChangeHash::from_bytes([7; 32]));

        let mut fork = Branch::forked(
            DocumentId::new("branch:fork").unwrap(),
            "feature",
            None,
            &parent,
        );
        fork.merge_into = Some(main.id.clone());
        fork.merge_at = Some(parent.heads.clone());
        fork.is_merge_preview = true;

        let restored = Branch::from_value(fork.id.clone(), &fork.to_value()).unwrap();
        assert_eq!(restored, Branch { heads: HeadSet::new(), ..fork.clone() });
        assert_eq!(restored.forked_at, parent.heads);
        assert!(!restored.is_available());

        let restored_main = Branch::from_value(main.id.clone(), &main.to_value()).unwrap();
        assert_eq!(restored_main, main);
    }

    #[test]
    fn test_invalid_record() {
        let id = DocumentId::new("branch:bad").unwrap();
        assert!(Branch::from_value(id.clone(), &Value::from(3i64)).is_err());
        assert!(Branch::from_value(id, &Value::object()).is_err());
    }
}
