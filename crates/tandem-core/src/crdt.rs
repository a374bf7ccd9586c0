//! Value model, document paths and the replay tie-break policy

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ordering applied to concurrent changes during replay.
///
/// Causality always wins; the tie-break only orders changes that are
/// ready at the same time. The later change in replay order wins on a
/// scalar field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TieBreak {
    /// Lamport counter, then actor id, then per-actor sequence
    Lamport,
    /// Wall-clock milliseconds, then actor id, then per-actor sequence
    Timestamp,
}

impl Default for TieBreak {
    fn default() -> Self {
        Self::Lamport
    }
}

impl std::fmt::Display for TieBreak {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TieBreak::Lamport => write!(f, "lamport"),
            TieBreak::Timestamp => write!(f, "timestamp"),
        }
    }
}

impl std::str::FromStr for TieBreak {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lamport" | "causal" => Ok(TieBreak::Lamport),
            "timestamp" | "wall-clock" => Ok(TieBreak::Timestamp),
            _ => Err(crate::Error::Parse(format!("Unknown tie-break policy: {}", s))),
        }
    }
}

/// A value that can be stored in a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Binary(Bytes),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// An empty object, the root of every document
    pub fn object() -> Self {
        Value::Object(BTreeMap::new())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(Number::Integer(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(Number::Float(n)) => Some(*n),
            Value::Number(Number::Integer(n)) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&Bytes> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(arr) => Some(arr),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Name of the variant, used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Binary(_) => "binary",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// Get a value at a path
    pub fn get(&self, path: &DocPath) -> Option<&Value> {
        let mut current = self;
        for segment in path.segments() {
            match segment {
                PathSegment::Key(key) => {
                    current = current.as_object()?.get(key)?;
                }
                PathSegment::Index(idx) => {
                    current = current.as_array()?.get(*idx)?;
                }
            }
        }
        Some(current)
    }

    fn get_mut(&mut self, path: &[PathSegment]) -> Option<&mut Value> {
        let mut current = self;
        for segment in path {
            current = match segment {
                PathSegment::Key(key) => match current {
                    Value::Object(map) => map.get_mut(key)?,
                    _ => return None,
                },
                PathSegment::Index(idx) => match current {
                    Value::Array(arr) => arr.get_mut(*idx)?,
                    _ => return None,
                },
            };
        }
        Some(current)
    }

    /// Set a value at a path, creating intermediate objects/arrays as needed
    pub fn set(&mut self, path: &DocPath, value: Value) {
        let segments = path.segments();
        if segments.is_empty() {
            *self = value;
            return;
        }

        let mut current = self;
        for (i, segment) in segments.iter().enumerate() {
            let is_last = i == segments.len() - 1;

            match segment {
                PathSegment::Key(key) => {
                    if !matches!(current, Value::Object(_)) {
                        *current = Value::object();
                    }

                    if let Value::Object(map) = current {
                        if is_last {
                            map.insert(key.clone(), value);
                            return;
                        }
                        current = map.entry(key.clone()).or_insert(Value::Null);
                    }
                }
                PathSegment::Index(idx) => {
                    if !matches!(current, Value::Array(_)) {
                        *current = Value::Array(Vec::new());
                    }

                    if let Value::Array(arr) = current {
                        while arr.len() <= *idx {
                            arr.push(Value::Null);
                        }
                        if is_last {
                            arr[*idx] = value;
                            return;
                        }
                        current = &mut arr[*idx];
                    }
                }
            }
        }
    }

    /// Remove the value at a path, returning it if it existed
    pub fn remove(&mut self, path: &DocPath) -> Option<Value> {
        let (last, parent) = path.segments().split_last()?;
        match (last, self.get_mut(parent)?) {
            (PathSegment::Key(key), Value::Object(map)) => map.remove(key),
            (PathSegment::Index(idx), Value::Array(arr)) if *idx < arr.len() => {
                Some(arr.remove(*idx))
            }
            _ => None,
        }
    }

    /// Append to the array at a path, creating it when absent
    pub fn push(&mut self, path: &DocPath, value: Value) -> crate::Result<()> {
        if let Some(Value::Array(arr)) = self.get_mut(path.segments()) {
            arr.push(value);
            return Ok(());
        }

        match self.get(path).map(Value::type_name) {
            None | Some("null") => {
                self.set(path, Value::Array(vec![value]));
                Ok(())
            }
            Some(other) => Err(crate::Error::InvalidPath(format!(
                "{} is a {}, not an array",
                path, other
            ))),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Number(Number::Integer(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Number(Number::Integer(v as i64))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(Number::Float(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Binary(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Object(v)
    }
}

/// Number type supporting both integers and floats
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Number {
    Integer(i64),
    Float(f64),
}

/// Path segment for navigating document structure
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// An owned path into a document.
///
/// Keys that contain separators (file paths, for example) are rendered
/// quoted: `files["scenes/main.tscn"].content`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocPath(Vec<PathSegment>);

impl DocPath {
    /// The document root
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Append a key segment
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.0.push(PathSegment::Key(key.into()));
        self
    }

    /// Append an index segment
    pub fn index(mut self, idx: usize) -> Self {
        self.0.push(PathSegment::Index(idx));
        self
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True if `self` equals `other` or lies beneath it
    pub fn starts_with(&self, other: &DocPath) -> bool {
        self.0.starts_with(&other.0)
    }

    /// The key at position `idx`, if that segment is a key
    pub fn key_at(&self, idx: usize) -> Option<&str> {
        match self.0.get(idx)? {
            PathSegment::Key(k) => Some(k),
            PathSegment::Index(_) => None,
        }
    }

    /// Parse a path string into segments
    /// Examples: "foo.bar", "items[0]", "files[\"a.txt\"].content"
    pub fn parse(path: &str) -> crate::Result<Self> {
        let invalid = || crate::Error::InvalidPath(path.to_string());
        let mut segments = Vec::new();
        let mut rest = path;

        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix('.') {
                rest = after;
                continue;
            }

            // Quoted key
            if let Some(after) = rest.strip_prefix("[\"") {
                let end = closing_quote(after).ok_or_else(invalid)?;
                segments.push(PathSegment::Key(unescape(&after[..end])));
                rest = after[end + 1..].strip_prefix(']').ok_or_else(invalid)?;
                continue;
            }

            // Array index
            if let Some(after) = rest.strip_prefix('[') {
                let end = after.find(']').ok_or_else(invalid)?;
                let idx = after[..end].trim().parse::<usize>().map_err(|_| invalid())?;
                segments.push(PathSegment::Index(idx));
                rest = &after[end + 1..];
                continue;
            }

            let end = rest
                .find(|c| c == '.' || c == '[')
                .unwrap_or(rest.len());
            segments.push(PathSegment::Key(rest[..end].to_string()));
            rest = &rest[end..];
        }

        Ok(Self(segments))
    }
}

impl std::fmt::Display for DocPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                PathSegment::Key(key) if is_bare_key(key) => {
                    if i > 0 {
                        write!(f, ".")?;
                    }
                    write!(f, "{}", key)?;
                }
                PathSegment::Key(key) => {
                    write!(f, "[\"{}\"]", key.replace('\\', "\\\\").replace('"', "\\\""))?;
                }
                PathSegment::Index(idx) => write!(f, "[{}]", idx)?,
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for DocPath {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DocPath::parse(s)
    }
}

fn is_bare_key(key: &str) -> bool {
    !key.is_empty() && !key.contains(|c| matches!(c, '.' | '[' | ']' | '"' | '\\'))
}

fn closing_quote(s: &str) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '"' => return Some(i),
            _ => {}
        }
    }
    None
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// How a path differs between two materialized states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathChangeKind {
    Added,
    Removed,
    Changed,
}

/// One leaf-level difference between two states
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathChange {
    pub path: DocPath,
    pub kind: PathChangeKind,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

/// Compare two values, descending into objects. Output follows key order.
pub fn diff_values(old: &Value, new: &Value) -> Vec<PathChange> {
    let mut out = Vec::new();
    diff_into(DocPath::root(), Some(old), Some(new), &mut out);
    out
}

fn diff_into(path: DocPath, old: Option<&Value>, new: Option<&Value>, out: &mut Vec<PathChange>) {
    match (old, new) {
        (Some(Value::Object(a)), Some(Value::Object(b))) => {
            let keys: std::collections::BTreeSet<&String> = a.keys().chain(b.keys()).collect();
            for key in keys {
                diff_into(path.clone().key(key.clone()), a.get(key), b.get(key), out);
            }
        }
        (None, None) => {}
        (a, b) if a == b => {}
        (a, b) => {
            let kind = match (a, b) {
                (None, _) => PathChangeKind::Added,
                (_, None) => PathChangeKind::Removed,
                _ => PathChangeKind::Changed,
            };
            out.push(PathChange {
                path,
                kind,
                old: a.cloned(),
                new: b.cloned(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_parsing() {
        let path = DocPath::parse("foo.bar[0].baz").unwrap();
        assert_eq!(
            path.segments(),
            &[
                PathSegment::Key("foo".into()),
                PathSegment::Key("bar".into()),
                PathSegment::Index(0),
                PathSegment::Key("baz".into()),
            ]
        );
    }

    #[test]
    fn test_quoted_keys_display_and_parse() {
        let path = DocPath::root().key("files").key("scenes/main.tscn").key("content");
        let rendered = path.to_string();
        assert_eq!(rendered, "files[\"scenes/main.tscn\"].content");
        assert_eq!(DocPath::parse(&rendered).unwrap(), path);
    }

    #[test]
    fn test_invalid_paths() {
        assert!(DocPath::parse("items[abc]").is_err());
        assert!(DocPath::parse("files[\"unterminated").is_err());
    }

    #[test]
    fn test_value_set_and_get() {
        let mut value = Value::object();
        let path = DocPath::parse("user.name").unwrap();
        value.set(&path, Value::from("Bob"));

        assert_eq!(value.get(&path), Some(&Value::String("Bob".into())));
    }

    #[test]
    fn test_value_remove() {
        let mut value = Value::object();
        let path = DocPath::parse("a.b").unwrap();
        value.set(&path, Value::from(1i64));

        assert_eq!(value.remove(&path), Some(Value::from(1i64)));
        assert!(value.get(&path).is_none());
        assert!(value.remove(&path).is_none());
    }

    #[test]
    fn test_value_push() {
        let mut value = Value::object();
        let path = DocPath::parse("items").unwrap();
        value.push(&path, Value::from("a")).unwrap();
        value.push(&path, Value::from("b")).unwrap();

        assert_eq!(value.get(&path), Some(&Value::from(vec!["a", "b"])));

        let scalar = DocPath::parse("count").unwrap();
        value.set(&scalar, Value::from(3i64));
        assert!(value.push(&scalar, Value::Null).is_err());
    }

    #[test]
    fn test_diff_values_reports_leaves() {
        let mut a = Value::object();
        a.set(&DocPath::parse("x.y").unwrap(), Value::from(1i64));
        a.set(&DocPath::parse("x.z").unwrap(), Value::from(2i64));

        let mut b = a.clone();
        b.set(&DocPath::parse("x.y").unwrap(), Value::from(5i64));
        b.remove(&DocPath::parse("x.z").unwrap());
        b.set(&DocPath::parse("w").unwrap(), Value::from(true));

        let changes = diff_values(&a, &b);
        let kinds: Vec<_> = changes.iter().map(|c| (c.path.to_string(), c.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                ("w".to_string(), PathChangeKind::Added),
                ("x.y".to_string(), PathChangeKind::Changed),
                ("x.z".to_string(), PathChangeKind::Removed),
            ]
        );
        assert!(diff_values(&a, &a).is_empty());
    }

    #[test]
    fn test_tie_break_from_str() {
        assert_eq!("lamport".parse::<TieBreak>().unwrap(), TieBreak::Lamport);
        assert_eq!("Timestamp".parse::<TieBreak>().unwrap(), TieBreak::Timestamp);
        assert!("coin-flip".parse::<TieBreak>().is_err());
    }
}
