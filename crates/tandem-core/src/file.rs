//! File content as stored in a branch document

use crate::crdt::Value;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// How many leading bytes are inspected when classifying a buffer
pub const SNIFF_LEN: usize = 8000;

/// Minimum share of printable bytes for control-heavy text to count as text
pub const PRINTABLE_RATIO: f64 = 0.95;

/// Text or binary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Text,
    Binary,
}

impl std::fmt::Display for FileKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileKind::Text => write!(f, "text"),
            FileKind::Binary => write!(f, "binary"),
        }
    }
}

/// The content of one project file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileContent {
    Text(String),
    Binary(Bytes),
}

impl FileContent {
    /// Classify raw bytes read from disk
    pub fn from_bytes(buf: impl Into<Bytes>) -> Self {
        let buf: Bytes = buf.into();
        if is_binary(&buf) {
            return FileContent::Binary(buf);
        }
        match String::from_utf8(buf.to_vec()) {
            Ok(text) => FileContent::Text(text),
            Err(_) => FileContent::Binary(buf),
        }
    }

    pub fn kind(&self) -> FileKind {
        match self {
            FileContent::Text(_) => FileKind::Text,
            FileContent::Binary(_) => FileKind::Binary,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            FileContent::Text(s) => s.as_bytes(),
            FileContent::Binary(b) => b,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FileContent::Text(s) => Some(s),
            FileContent::Binary(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// SHA-256 of the raw bytes
    pub fn digest(&self) -> [u8; 32] {
        Sha256::digest(self.as_bytes()).into()
    }

    /// The document entry: `{kind, content}`
    pub fn to_value(&self) -> Value {
        let mut entry = BTreeMap::new();
        entry.insert("kind".to_string(), Value::from(self.kind().to_string()));
        let content = match self {
            FileContent::Text(s) => Value::String(s.clone()),
            FileContent::Binary(b) => Value::Binary(b.clone()),
        };
        entry.insert("content".to_string(), content);
        Value::Object(entry)
    }

    /// Read back a document entry written by [`FileContent::to_value`]
    pub fn from_value(value: &Value) -> Option<Self> {
        let entry = value.as_object()?;
        match entry.get("content")? {
            Value::String(s) => Some(FileContent::Text(s.clone())),
            Value::Binary(b) => Some(FileContent::Binary(b.clone())),
            _ => None,
        }
    }
}

impl From<&str> for FileContent {
    fn from(s: &str) -> Self {
        FileContent::Text(s.to_string())
    }
}

impl From<String> for FileContent {
    fn from(s: String) -> Self {
        FileContent::Text(s)
    }
}

/// Binary if the sniffed prefix has a NUL byte or is not valid UTF-8.
/// Valid UTF-8 that is heavy in control characters is decided by the
/// printable-byte ratio.
pub fn is_binary(buf: &[u8]) -> bool {
    let head = &buf[..buf.len().min(SNIFF_LEN)];

    if head.contains(&0) {
        return true;
    }

    match std::str::from_utf8(head) {
        Ok(_) => {}
        // A multi-byte sequence cut off by the sniff window is still text
        Err(e) if e.error_len().is_none() && buf.len() > SNIFF_LEN => {}
        Err(_) => return true,
    }

    if !head.iter().any(|b| is_control(*b)) {
        return false;
    }
    printable_ratio(head) < PRINTABLE_RATIO
}

fn is_control(b: u8) -> bool {
    (b < 0x20 && !matches!(b, b'\n' | b'\r' | b'\t' | 0x0c)) || b == 0x7f
}

fn printable_ratio(buf: &[u8]) -> f64 {
    if buf.is_empty() {
        return 1.0;
    }
    let printable = buf.iter().filter(|b| !is_control(**b)).count();
    printable as f64 / buf.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text() {
        let content = FileContent::from_bytes(b"hello\nworld\n".to_vec());
        assert_eq!(content, FileContent::Text("hello\nworld\n".into()));
    }

    #[test]
    fn test_null_byte_is_binary() {
        let content = FileContent::from_bytes(vec![b'a', 0, b'b']);
        assert_eq!(content.kind(), FileKind::Binary);
    }

    #[test]
    fn test_invalid_utf8_is_binary() {
        let content = FileContent::from_bytes(vec![0xff, 0xfe, b'a']);
        assert_eq!(content.kind(), FileKind::Binary);
    }

    #[test]
    fn test_printable_ratio_fallback() {
        // One escape code in a long line stays text
        let mut mostly_text = b"\x1b[1m".to_vec();
        mostly_text.extend(std::iter::repeat(b'a').take(200));
        assert!(!is_binary(&mostly_text));

        // Control soup is binary
        let soup: Vec<u8> = (1u8..31).cycle().take(100).collect();
        assert!(is_binary(&soup));
    }

    #[test]
    fn test_value_round_trip() {
        let text = FileContent::from("extends Node\n");
        assert_eq!(FileContent::from_value(&text.to_value()), Some(text));

        let binary = FileContent::Binary(Bytes::from_static(&[0x89, b'P', b'N', b'G', 0]));
        assert_eq!(FileContent::from_value(&binary.to_value()), Some(binary));
    }

    #[test]
    fn test_digest_tracks_content() {
        let a = FileContent::from("1");
        let b = FileContent::from("2");
        assert_ne!(a.digest(), b.digest());
        assert_eq!(a.digest(), FileContent::from("1").digest());
    }
}
