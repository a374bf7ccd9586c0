//! Change hashes, head sets and actor ids

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// SHA-256 digest identifying a change
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeHash([u8; 32]);

impl ChangeHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight hex characters, for logs and UI labels
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Display for ChangeHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for ChangeHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChangeHash({})", self.short())
    }
}

impl std::str::FromStr for ChangeHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| Error::Parse(format!("invalid change hash {:?}: {}", s, e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Parse(format!("change hash {:?} is not 32 bytes", s)))?;
        Ok(Self(bytes))
    }
}

/// An unordered set of change hashes naming one version of a document.
///
/// An empty set is the empty document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HeadSet(BTreeSet<ChangeHash>);

impl HeadSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn single(hash: ChangeHash) -> Self {
        Self(BTreeSet::from([hash]))
    }

    pub fn insert(&mut self, hash: ChangeHash) -> bool {
        self.0.insert(hash)
    }

    pub fn remove(&mut self, hash: &ChangeHash) -> bool {
        self.0.remove(hash)
    }

    pub fn contains(&self, hash: &ChangeHash) -> bool {
        self.0.contains(hash)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChangeHash> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Hex strings, sorted
    pub fn to_strings(&self) -> Vec<String> {
        self.0.iter().map(ChangeHash::to_hex).collect()
    }

    pub fn from_strings<S: AsRef<str>>(items: &[S]) -> Result<Self> {
        items.iter().map(|s| s.as_ref().parse()).collect()
    }
}

impl std::fmt::Display for HeadSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, hash) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", hash.short())?;
        }
        write!(f, "]")
    }
}

impl FromIterator<ChangeHash> for HeadSet {
    fn from_iter<I: IntoIterator<Item = ChangeHash>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a HeadSet {
    type Item = &'a ChangeHash;
    type IntoIter = std::collections::btree_set::Iter<'a, ChangeHash>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Identifier of one replica (one editor process)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random actor id
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_hash_hex_round_trip() {
        let hash = ChangeHash::from_bytes([0xab; 32]);
        let parsed: ChangeHash = hash.to_hex().parse().unwrap();
        assert_eq!(parsed, hash);
        assert_eq!(hash.short(), "abababab");
    }

    #[test]
    fn test_change_hash_rejects_bad_input() {
        assert!("zz".parse::<ChangeHash>().is_err());
        assert!("abcd".parse::<ChangeHash>().is_err());
    }

    #[test]
    fn test_head_set_is_unordered() {
        let a = ChangeHash::from_bytes([1; 32]);
        let b = ChangeHash::from_bytes([2; 32]);
        let x: HeadSet = [a, b].into_iter().collect();
        let y: HeadSet = [b, a].into_iter().collect();
        assert_eq!(x, y);

        let strings = x.to_strings();
        assert_eq!(HeadSet::from_strings(&strings).unwrap(), x);
    }
}
