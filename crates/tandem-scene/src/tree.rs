//! Node tree view over a parsed scene or resource file

use crate::error::{SceneError, SceneResult};
use crate::parser::{SceneDocument, Section};
use crate::variant::Variant;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Path of the root node
pub const ROOT_PATH: &str = ".";

/// Nodes created by the running editor carry this marker in their name
const SYNTHETIC_MARKER: char = '@';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SceneKind {
    /// `.tscn`, headed by `[gd_scene ...]`
    Scene,
    /// `.tres`, headed by `[gd_resource ...]`
    Resource,
}

impl SceneKind {
    /// Classify a file by extension
    pub fn from_path(path: impl AsRef<Path>) -> Option<SceneKind> {
        match path.as_ref().extension().and_then(|e| e.to_str()) {
            Some("tscn") => Some(SceneKind::Scene),
            Some("tres") => Some(SceneKind::Resource),
            _ => None,
        }
    }

    fn from_header(tag: &str) -> Option<SceneKind> {
        match tag {
            "gd_scene" => Some(SceneKind::Scene),
            "gd_resource" => Some(SceneKind::Resource),
            _ => None,
        }
    }
}

/// Whether a node path belongs to an editor-generated node
pub fn is_synthetic_path(path: &str) -> bool {
    path.contains(SYNTHETIC_MARKER)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SceneNode {
    pub path: String,
    pub name: String,
    pub node_type: Option<String>,
    /// Ext resource id of an instanced scene
    pub instance: Option<String>,
    /// `res://` path the instance id resolves to
    pub instance_ref: Option<String>,
    pub parent: Option<String>,
    pub properties: BTreeMap<String, Variant>,
    pub children: Vec<String>,
    section: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtResource {
    pub id: String,
    pub resource_type: Option<String>,
    pub path: Option<String>,
    pub uid: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubResource {
    pub id: String,
    pub resource_type: Option<String>,
    pub properties: BTreeMap<String, Variant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub signal: String,
    pub from: String,
    pub to: String,
    pub method: String,
}

/// A parsed file with its node index
#[derive(Debug, Clone, PartialEq)]
pub struct SceneTree {
    document: SceneDocument,
    kind: SceneKind,
    nodes: BTreeMap<String, SceneNode>,
    root: Option<String>,
}

fn node_path(parent: Option<&str>, name: &str) -> String {
    match parent {
        None => ROOT_PATH.to_string(),
        Some(ROOT_PATH) => name.to_string(),
        Some(parent) => format!("{}/{}", parent, name),
    }
}

fn section_properties(section: &Section) -> BTreeMap<String, Variant> {
    section
        .properties()
        .map(|p| (p.key.clone(), p.value.clone()))
        .collect()
}

impl SceneTree {
    pub fn parse(text: &str) -> SceneResult<Self> {
        Self::from_document(SceneDocument::parse(text)?)
    }

    pub fn from_document(document: SceneDocument) -> SceneResult<Self> {
        let header = document
            .sections()
            .first()
            .ok_or_else(|| SceneError::parse(1, "empty scene file"))?;
        let kind = SceneKind::from_header(&header.tag).ok_or_else(|| {
            SceneError::parse(
                header.line,
                format!("expected gd_scene or gd_resource header, found [{}]", header.tag),
            )
        })?;

        let mut tree = Self {
            document,
            kind,
            nodes: BTreeMap::new(),
            root: None,
        };
        tree.reindex()?;
        Ok(tree)
    }

    fn reindex(&mut self) -> SceneResult<()> {
        let ext_paths: HashMap<String, String> = self
            .ext_resources()
            .into_iter()
            .filter_map(|r| r.path.map(|p| (r.id, p)))
            .collect();

        let mut nodes = BTreeMap::new();
        let mut order = Vec::new();
        let mut root = None;

        for (index, section) in self.document.sections().iter().enumerate() {
            if section.tag != "node" {
                continue;
            }
            let name = section
                .attribute_str("name")
                .ok_or_else(|| SceneError::parse(section.line, "node without a name"))?;
            let parent = section.attribute_str("parent");
            let path = node_path(parent, name);

            if parent.is_none() {
                if root.is_some() {
                    return Err(SceneError::parse(section.line, "scene has more than one root node"));
                }
                root = Some(path.clone());
            }
            if nodes.contains_key(&path) {
                return Err(SceneError::parse(
                    section.line,
                    format!("duplicate node path {:?}", path),
                ));
            }

            let instance = section
                .attribute("instance")
                .and_then(Variant::ext_resource_id)
                .map(str::to_string);
            let instance_ref = instance.as_ref().and_then(|id| ext_paths.get(id).cloned());

            order.push(path.clone());
            nodes.insert(
                path.clone(),
                SceneNode {
                    path,
                    name: name.to_string(),
                    node_type: section.attribute_str("type").map(str::to_string),
                    instance,
                    instance_ref,
                    parent: parent.map(str::to_string),
                    properties: section_properties(section),
                    children: Vec::new(),
                    section: index,
                },
            );
        }

        for path in order {
            let Some(parent) = nodes.get(&path).and_then(|n| n.parent.clone()) else {
                continue;
            };
            if let Some(parent) = nodes.get_mut(&parent) {
                parent.children.push(path);
            }
        }

        self.nodes = nodes;
        self.root = root;
        Ok(())
    }

    pub fn kind(&self) -> SceneKind {
        self.kind
    }

    pub fn document(&self) -> &SceneDocument {
        &self.document
    }

    pub fn serialize(&self) -> String {
        self.document.serialize()
    }

    fn header(&self) -> Option<&Section> {
        self.document.sections().first()
    }

    pub fn uid(&self) -> Option<&str> {
        self.header().and_then(|h| h.attribute_str("uid"))
    }

    /// Declared type of a `.tres` file
    pub fn resource_type(&self) -> Option<&str> {
        self.header().and_then(|h| h.attribute_str("type"))
    }

    pub fn root(&self) -> Option<&SceneNode> {
        self.root.as_ref().and_then(|p| self.nodes.get(p))
    }

    pub fn node(&self, path: &str) -> Option<&SceneNode> {
        self.nodes.get(path)
    }

    pub fn nodes(&self) -> &BTreeMap<String, SceneNode> {
        &self.nodes
    }

    pub fn ext_resources(&self) -> Vec<ExtResource> {
        self.document
            .sections()
            .iter()
            .filter(|s| s.tag == "ext_resource")
            .filter_map(|s| {
                Some(ExtResource {
                    id: s.attribute_str("id")?.to_string(),
                    resource_type: s.attribute_str("type").map(str::to_string),
                    path: s.attribute_str("path").map(str::to_string),
                    uid: s.attribute_str("uid").map(str::to_string),
                })
            })
            .collect()
    }

    pub fn sub_resources(&self) -> BTreeMap<String, SubResource> {
        self.document
            .sections()
            .iter()
            .filter(|s| s.tag == "sub_resource")
            .filter_map(|s| {
                let id = s.attribute_str("id")?.to_string();
                Some((
                    id.clone(),
                    SubResource {
                        id,
                        resource_type: s.attribute_str("type").map(str::to_string),
                        properties: section_properties(s),
                    },
                ))
            })
            .collect()
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.document
            .sections()
            .iter()
            .filter(|s| s.tag == "connection")
            .map(|s| Connection {
                signal: s.attribute_str("signal").unwrap_or_default().to_string(),
                from: s.attribute_str("from").unwrap_or_default().to_string(),
                to: s.attribute_str("to").unwrap_or_default().to_string(),
                method: s.attribute_str("method").unwrap_or_default().to_string(),
            })
            .collect()
    }

    /// Properties of the `[resource]` section
    pub fn main_resource(&self) -> Option<BTreeMap<String, Variant>> {
        self.document.find("resource").map(section_properties)
    }

    fn node_section(&self, path: &str) -> SceneResult<usize> {
        self.nodes
            .get(path)
            .map(|n| n.section)
            .ok_or_else(|| SceneError::NodeNotFound(path.to_string()))
    }

    pub fn set_property(&mut self, node: &str, key: &str, value: Variant) -> SceneResult<()> {
        let index = self.node_section(node)?;
        if let Some(section) = self.document.section_mut(index) {
            section.set_property(key, value);
        }
        self.reindex()
    }

    pub fn remove_property(&mut self, node: &str, key: &str) -> SceneResult<Option<Variant>> {
        let index = self.node_section(node)?;
        let removed = self
            .document
            .section_mut(index)
            .and_then(|s| s.remove_property(key));
        self.reindex()?;
        Ok(removed)
    }

    /// Add a child node under `parent`, returning the new node's path
    pub fn add_node(&mut self, parent: &str, name: &str, node_type: &str) -> SceneResult<String> {
        self.node_section(parent)?;
        if name.is_empty() || name.contains('/') || name == ROOT_PATH {
            return Err(SceneError::InvalidEdit(format!("invalid node name {:?}", name)));
        }
        let path = node_path(Some(parent), name);
        if self.nodes.contains_key(&path) {
            return Err(SceneError::InvalidEdit(format!("node {:?} already exists", path)));
        }

        let section = Section::new("node")
            .with_attribute("name", Variant::from(name))
            .with_attribute("type", Variant::from(node_type))
            .with_attribute("parent", Variant::from(parent));

        let at = self
            .nodes
            .values()
            .map(|n| n.section + 1)
            .max()
            .unwrap_or(self.document.sections().len());
        self.document.insert_section(at, section);
        self.reindex()?;
        Ok(path)
    }

    /// Remove a node with its whole subtree and any connections touching it
    pub fn remove_node(&mut self, path: &str) -> SceneResult<()> {
        self.node_section(path)?;
        if self.root.as_deref() == Some(path) {
            return Err(SceneError::InvalidEdit("cannot remove the root node".into()));
        }

        let prefix = format!("{}/", path);
        let in_subtree = |p: &str| p == path || p.starts_with(&prefix);

        let mut doomed: Vec<usize> = self
            .nodes
            .values()
            .filter(|n| in_subtree(n.path.as_str()))
            .map(|n| n.section)
            .collect();
        doomed.extend(
            self.document
                .sections()
                .iter()
                .enumerate()
                .filter(|(_, s)| s.tag == "connection")
                .filter(|(_, s)| {
                    s.attribute_str("from").map_or(false, in_subtree)
                        || s.attribute_str("to").map_or(false, in_subtree)
                })
                .map(|(i, _)| i),
        );
        doomed.sort_unstable();
        doomed.dedup();

        for index in doomed.into_iter().rev() {
            self.document.remove_section(index);
        }
        self.reindex()
    }

    /// Set a property on the `[resource]` section of a resource file
    pub fn set_resource_property(&mut self, key: &str, value: Variant) -> SceneResult<()> {
        let index = self
            .document
            .sections()
            .iter()
            .position(|s| s.tag == "resource")
            .ok_or_else(|| SceneError::InvalidEdit("file has no [resource] section".into()))?;
        if let Some(section) = self.document.section_mut(index) {
            section.set_property(key, value);
        }
        Ok(())
    }
}
