//! Structural diffs between two versions of a file
//!
//! Scenes are compared node by node (matched by path), resources property by
//! property. Reference values are resolved against each side's resources, so
//! editing a sub-resource shows up on the properties that use it. Plain text
//! gets line hunks; binary files only report the kind of change.

use crate::error::SceneResult;
use crate::tree::{is_synthetic_path, ExtResource, SceneKind, SceneNode, SceneTree, SubResource};
use crate::variant::Variant;
use serde::Serialize;
use similar::{ChangeTag, TextDiff};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tandem_core::FileContent;
use tracing::debug;

/// Unchanged lines kept around each text hunk
pub const CONTEXT_LINES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    TypeChanged,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeType::Added => "added",
            ChangeType::Removed => "removed",
            ChangeType::Modified => "modified",
            ChangeType::TypeChanged => "type_changed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyChangeType {
    Added,
    Removed,
    Changed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffFileKind {
    Scene,
    Resource,
    Text,
    Binary,
}

impl DiffFileKind {
    /// Kind of `content` stored at `path`
    pub fn classify(path: &str, content: &FileContent) -> DiffFileKind {
        match content {
            FileContent::Binary(_) => DiffFileKind::Binary,
            FileContent::Text(_) => match SceneKind::from_path(path) {
                Some(SceneKind::Scene) => DiffFileKind::Scene,
                Some(SceneKind::Resource) => DiffFileKind::Resource,
                None => DiffFileKind::Text,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LineTag {
    Equal,
    Delete,
    Insert,
}

impl LineTag {
    /// Unified diff prefix
    pub fn sign(self) -> char {
        match self {
            LineTag::Equal => ' ',
            LineTag::Delete => '-',
            LineTag::Insert => '+',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextLine {
    pub tag: LineTag,
    /// 1-based, absent for inserted lines
    pub old_line: Option<usize>,
    /// 1-based, absent for deleted lines
    pub new_line: Option<usize>,
    /// Without the line terminator
    pub content: String,
}

/// One `@@ -old_start,old_lines +new_start,new_lines @@` block
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextHunk {
    pub old_start: usize,
    pub old_lines: usize,
    pub new_start: usize,
    pub new_lines: usize,
    pub lines: Vec<TextLine>,
}

/// Line hunks turning `old` into `new`
pub fn diff_text(old: &str, new: &str) -> Vec<TextHunk> {
    let diff = TextDiff::from_lines(old, new);
    let mut unified = diff.unified_diff();
    unified.context_radius(CONTEXT_LINES);

    unified
        .iter_hunks()
        .filter_map(|hunk| {
            let ops = hunk.ops();
            let (first, last) = (ops.first()?, ops.last()?);
            let old_range = first.old_range().start..last.old_range().end;
            let new_range = first.new_range().start..last.new_range().end;
            let lines = hunk
                .iter_changes()
                .map(|change| TextLine {
                    tag: match change.tag() {
                        ChangeTag::Equal => LineTag::Equal,
                        ChangeTag::Delete => LineTag::Delete,
                        ChangeTag::Insert => LineTag::Insert,
                    },
                    old_line: change.old_index().map(|i| i + 1),
                    new_line: change.new_index().map(|i| i + 1),
                    content: change.value().trim_end_matches(&['\r', '\n'][..]).to_string(),
                })
                .collect();
            Some(TextHunk {
                old_start: old_range.start + 1,
                old_lines: old_range.len(),
                new_start: new_range.start + 1,
                new_lines: new_range.len(),
                lines,
            })
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyDiff {
    pub name: String,
    pub change_type: PropertyChangeType,
    pub old_value: Option<Variant>,
    pub new_value: Option<Variant>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeDiff {
    pub change_type: ChangeType,
    pub old_type: Option<String>,
    pub new_type: Option<String>,
    pub props: BTreeMap<String, PropertyDiff>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileDiff {
    pub path: String,
    pub change_type: ChangeType,
    pub file_kind: DiffFileKind,
    pub old_kind: Option<DiffFileKind>,
    pub new_kind: Option<DiffFileKind>,
    /// `[resource]` section of a resource file
    pub props_diff: BTreeMap<String, PropertyDiff>,
    pub node_diffs: BTreeMap<String, NodeDiff>,
    pub sub_resource_diffs: BTreeMap<String, NodeDiff>,
    /// Plain text files only
    pub text_hunks: Vec<TextHunk>,
}

impl FileDiff {
    fn new(
        path: &str,
        change_type: ChangeType,
        old_kind: Option<DiffFileKind>,
        new_kind: Option<DiffFileKind>,
    ) -> Self {
        Self {
            path: path.to_string(),
            change_type,
            file_kind: new_kind.or(old_kind).unwrap_or(DiffFileKind::Binary),
            old_kind,
            new_kind,
            props_diff: BTreeMap::new(),
            node_diffs: BTreeMap::new(),
            sub_resource_diffs: BTreeMap::new(),
            text_hunks: Vec::new(),
        }
    }
}

/// Sub and external resources of one file, keyed by id
#[derive(Debug, Clone, Default)]
pub struct ResourceTable {
    sub: BTreeMap<String, SubResource>,
    ext: BTreeMap<String, ExtResource>,
}

impl ResourceTable {
    pub fn of(tree: &SceneTree) -> Self {
        Self {
            sub: tree.sub_resources(),
            ext: tree
                .ext_resources()
                .into_iter()
                .map(|r| (r.id.clone(), r))
                .collect(),
        }
    }
}

/// Compares values from the old side against values from the new side
struct Resolver<'a> {
    old: &'a ResourceTable,
    new: &'a ResourceTable,
    /// Sub-resource pairs being compared, so reference cycles terminate
    active: BTreeSet<(String, String)>,
}

impl<'a> Resolver<'a> {
    fn new(old: &'a ResourceTable, new: &'a ResourceTable) -> Self {
        Self {
            old,
            new,
            active: BTreeSet::new(),
        }
    }

    fn equal(&mut self, a: &Variant, b: &Variant) -> bool {
        match (a, b) {
            (Variant::Float(x), Variant::Float(y)) => x.to_bits() == y.to_bits(),
            (Variant::SubResource(x), Variant::SubResource(y)) => self.same_sub_resource(x, y),
            (Variant::ExtResource(x), Variant::ExtResource(y)) => self.same_ext_resource(x, y),
            (Variant::Array(x), Variant::Array(y)) => {
                x.len() == y.len() && x.iter().zip(y).all(|(a, b)| self.equal(a, b))
            }
            (Variant::Dictionary(x), Variant::Dictionary(y)) => {
                let x: BTreeMap<String, &Variant> = x.iter().map(|(k, v)| (k.to_string(), v)).collect();
                let y: BTreeMap<String, &Variant> = y.iter().map(|(k, v)| (k.to_string(), v)).collect();
                self.equal_maps(&x, &y)
            }
            (
                Variant::Constructor {
                    name: n1,
                    type_args: t1,
                    args: a1,
                },
                Variant::Constructor {
                    name: n2,
                    type_args: t2,
                    args: a2,
                },
            ) => {
                n1 == n2
                    && t1 == t2
                    && a1.len() == a2.len()
                    && a1.iter().zip(a2).all(|(a, b)| self.equal(a, b))
            }
            (
                Variant::Object {
                    class: c1,
                    properties: p1,
                },
                Variant::Object {
                    class: c2,
                    properties: p2,
                },
            ) => {
                let p1: BTreeMap<String, &Variant> = p1.iter().map(|(k, v)| (k.clone(), v)).collect();
                let p2: BTreeMap<String, &Variant> = p2.iter().map(|(k, v)| (k.clone(), v)).collect();
                c1 == c2 && self.equal_maps(&p1, &p2)
            }
            _ if std::mem::discriminant(a) != std::mem::discriminant(b) => false,
            _ => a == b,
        }
    }

    fn equal_maps(&mut self, x: &BTreeMap<String, &Variant>, y: &BTreeMap<String, &Variant>) -> bool {
        x.len() == y.len()
            && x.iter().all(|(k, a)| match y.get(k) {
                Some(b) => self.equal(a, b),
                None => false,
            })
    }

    /// Same type and deeply equal properties; ids alone may differ
    fn same_sub_resource(&mut self, old_id: &str, new_id: &str) -> bool {
        let (old_table, new_table) = (self.old, self.new);
        let (old, new) = match (old_table.sub.get(old_id), new_table.sub.get(new_id)) {
            (None, None) => return old_id == new_id,
            (Some(old), Some(new)) => (old, new),
            _ => return false,
        };
        if old.resource_type != new.resource_type || old.properties.len() != new.properties.len() {
            return false;
        }

        let key = (old_id.to_string(), new_id.to_string());
        if !self.active.insert(key.clone()) {
            return true;
        }
        let equal = old.properties.iter().all(|(name, a)| match new.properties.get(name) {
            Some(b) => self.equal(a, b),
            None => false,
        });
        self.active.remove(&key);
        equal
    }

    /// Same target; the referenced file's contents are not compared
    fn same_ext_resource(&self, old_id: &str, new_id: &str) -> bool {
        match (self.old.ext.get(old_id), self.new.ext.get(new_id)) {
            (None, None) => old_id == new_id,
            (Some(old), Some(new)) => {
                old.resource_type == new.resource_type && old.path == new.path && old.uid == new.uid
            }
            _ => false,
        }
    }

    fn diff_properties(
        &mut self,
        old: &BTreeMap<String, Variant>,
        new: &BTreeMap<String, Variant>,
    ) -> BTreeMap<String, PropertyDiff> {
        let names: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
        let mut diffs = BTreeMap::new();

        for name in names {
            let change_type = match (old.get(name), new.get(name)) {
                (None, Some(_)) => PropertyChangeType::Added,
                (Some(_), None) => PropertyChangeType::Removed,
                (Some(a), Some(b)) if !self.equal(a, b) => PropertyChangeType::Changed,
                _ => continue,
            };
            diffs.insert(
                name.clone(),
                PropertyDiff {
                    name: name.clone(),
                    change_type,
                    old_value: old.get(name).cloned(),
                    new_value: new.get(name).cloned(),
                },
            );
        }

        diffs
    }
}

/// Structural equality: floats by bit pattern, dictionaries ignore entry order.
/// References compare by id.
pub fn deep_equal(a: &Variant, b: &Variant) -> bool {
    let empty = ResourceTable::default();
    Resolver::new(&empty, &empty).equal(a, b)
}

/// Like `deep_equal`, resolving references in `a` against `old` and in `b` against `new`
pub fn deep_equal_in(a: &Variant, b: &Variant, old: &ResourceTable, new: &ResourceTable) -> bool {
    Resolver::new(old, new).equal(a, b)
}

/// Property-name union of two property maps
pub fn diff_properties(
    old: &BTreeMap<String, Variant>,
    new: &BTreeMap<String, Variant>,
) -> BTreeMap<String, PropertyDiff> {
    let empty = ResourceTable::default();
    Resolver::new(&empty, &empty).diff_properties(old, new)
}

/// Instanced nodes have no declared type; their scene path stands in for it
fn effective_type(node: &SceneNode) -> Option<String> {
    node.node_type.clone().or_else(|| node.instance_ref.clone())
}

fn diff_node(
    resolver: &mut Resolver<'_>,
    old: Option<&SceneNode>,
    new: Option<&SceneNode>,
) -> Option<NodeDiff> {
    let empty = BTreeMap::new();
    let old_props = old.map_or(&empty, |n| &n.properties);
    let new_props = new.map_or(&empty, |n| &n.properties);
    let old_type = old.and_then(effective_type);
    let new_type = new.and_then(effective_type);

    let change_type = match (old, new) {
        (None, None) => return None,
        (None, Some(_)) => ChangeType::Added,
        (Some(_), None) => ChangeType::Removed,
        (Some(_), Some(_)) if old_type != new_type => ChangeType::TypeChanged,
        (Some(_), Some(_)) => ChangeType::Modified,
    };

    let props = resolver.diff_properties(old_props, new_props);
    if change_type == ChangeType::Modified && props.is_empty() {
        return None;
    }

    Some(NodeDiff {
        change_type,
        old_type,
        new_type,
        props,
    })
}

/// Node-by-node diff keyed by node path
pub fn diff_scene(old: &SceneTree, new: &SceneTree) -> BTreeMap<String, NodeDiff> {
    let (old_res, new_res) = (ResourceTable::of(old), ResourceTable::of(new));
    let mut resolver = Resolver::new(&old_res, &new_res);
    let paths: BTreeSet<&String> = old
        .nodes()
        .keys()
        .chain(new.nodes().keys())
        .filter(|p| !is_synthetic_path(p))
        .collect();

    paths
        .into_iter()
        .filter_map(|path| {
            diff_node(&mut resolver, old.node(path), new.node(path)).map(|diff| (path.clone(), diff))
        })
        .collect()
}

fn diff_sub_resources(resolver: &mut Resolver<'_>) -> BTreeMap<String, NodeDiff> {
    let (old, new) = (resolver.old, resolver.new);
    let ids: BTreeSet<&String> = old.sub.keys().chain(new.sub.keys()).collect();
    let empty = BTreeMap::new();
    let mut diffs = BTreeMap::new();

    for id in ids {
        let (a, b) = (old.sub.get(id), new.sub.get(id));
        let old_type = a.and_then(|r| r.resource_type.clone());
        let new_type = b.and_then(|r| r.resource_type.clone());
        let props = resolver.diff_properties(
            a.map_or(&empty, |r| &r.properties),
            b.map_or(&empty, |r| &r.properties),
        );
        let change_type = match (a, b) {
            (None, _) => ChangeType::Added,
            (_, None) => ChangeType::Removed,
            _ if old_type != new_type => ChangeType::TypeChanged,
            _ if props.is_empty() => continue,
            _ => ChangeType::Modified,
        };
        diffs.insert(
            id.clone(),
            NodeDiff {
                change_type,
                old_type,
                new_type,
                props,
            },
        );
    }

    diffs
}

fn text_of(content: Option<&FileContent>) -> &str {
    content.and_then(FileContent::as_text).unwrap_or("")
}

/// Diff two versions of one file; `None` when nothing changed
pub fn diff_files(
    path: &str,
    old: Option<&FileContent>,
    new: Option<&FileContent>,
) -> SceneResult<Option<FileDiff>> {
    let old_kind = old.map(|c| DiffFileKind::classify(path, c));
    let new_kind = new.map(|c| DiffFileKind::classify(path, c));

    let (old, new) = match (old, new) {
        (None, None) => return Ok(None),
        (Some(_), Some(_)) if old_kind != new_kind => {
            return Ok(Some(FileDiff::new(path, ChangeType::TypeChanged, old_kind, new_kind)))
        }
        (Some(a), Some(b)) if a.as_bytes() == b.as_bytes() => return Ok(None),
        (old, new) => (old, new),
    };
    let change_type = match (old, new) {
        (None, _) => ChangeType::Added,
        (_, None) => ChangeType::Removed,
        _ => ChangeType::Modified,
    };

    let mut diff = FileDiff::new(path, change_type, old_kind, new_kind);
    if diff.file_kind == DiffFileKind::Text {
        diff.text_hunks = diff_text(text_of(old), text_of(new));
    }
    if let (Some(a), Some(b)) = (old.and_then(FileContent::as_text), new.and_then(FileContent::as_text)) {
        match diff.file_kind {
            DiffFileKind::Scene => {
                let (a, b) = (SceneTree::parse(a)?, SceneTree::parse(b)?);
                diff.node_diffs = diff_scene(&a, &b);
                let (old_res, new_res) = (ResourceTable::of(&a), ResourceTable::of(&b));
                diff.sub_resource_diffs = diff_sub_resources(&mut Resolver::new(&old_res, &new_res));
            }
            DiffFileKind::Resource => {
                let (a, b) = (SceneTree::parse(a)?, SceneTree::parse(b)?);
                let (old_res, new_res) = (ResourceTable::of(&a), ResourceTable::of(&b));
                let mut resolver = Resolver::new(&old_res, &new_res);
                diff.props_diff = resolver.diff_properties(
                    &a.main_resource().unwrap_or_default(),
                    &b.main_resource().unwrap_or_default(),
                );
                diff.sub_resource_diffs = diff_sub_resources(&mut resolver);
            }
            _ => {}
        }
    }

    debug!(
        path,
        change_type = %diff.change_type,
        nodes = diff.node_diffs.len(),
        hunks = diff.text_hunks.len(),
        "Computed file diff"
    );
    Ok(Some(diff))
}
