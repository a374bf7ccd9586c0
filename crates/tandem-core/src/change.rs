//! Changes: the immutable, content-addressed units of the op log

use crate::crdt::{DocPath, Value};
use crate::error::{Error, Result};
use crate::heads::{ActorId, ChangeHash, HeadSet};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// What an op does at its path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpAction {
    /// Replace the value at the path
    Put(Value),
    /// Remove the entry at the path
    Delete,
    /// Append to the list at the path
    Push(Value),
}

/// A single operation inside a change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Op {
    pub path: DocPath,
    pub action: OpAction,
}

impl Op {
    pub fn put(path: DocPath, value: impl Into<Value>) -> Self {
        Self {
            path,
            action: OpAction::Put(value.into()),
        }
    }

    pub fn delete(path: DocPath) -> Self {
        Self {
            path,
            action: OpAction::Delete,
        }
    }

    pub fn push(path: DocPath, value: impl Into<Value>) -> Self {
        Self {
            path,
            action: OpAction::Push(value.into()),
        }
    }
}

/// Recorded on the change a merge produces on its target branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeMetadata {
    pub merged_branch_id: String,
    pub merged_at_heads: HeadSet,
    pub forked_at_heads: HeadSet,
}

/// Descriptive data attached to a change
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMetadata {
    pub username: Option<String>,
    pub branch_id: Option<String>,
    pub merge_metadata: Option<MergeMetadata>,
    pub changed_files: Vec<String>,
    /// Set on the changes that bootstrap a project
    pub is_setup: bool,
    pub message: Option<String>,
}

impl ChangeMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_branch(mut self, branch_id: impl Into<String>) -> Self {
        self.branch_id = Some(branch_id.into());
        self
    }

    pub fn with_changed_files(mut self, files: Vec<String>) -> Self {
        self.changed_files = files;
        self
    }

    pub fn with_merge(mut self, merge: MergeMetadata) -> Self {
        self.merge_metadata = Some(merge);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn setup(mut self) -> Self {
        self.is_setup = true;
        self
    }
}

/// An immutable node of the change DAG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub hash: ChangeHash,
    pub parents: HeadSet,
    pub actor: ActorId,
    /// Per-actor sequence number, starting at 1
    pub seq: u64,
    /// One more than the largest lamport value among the parents
    pub lamport: u64,
    /// Wall-clock milliseconds since the Unix epoch
    pub timestamp: u64,
    pub metadata: ChangeMetadata,
    pub ops: Vec<Op>,
}

#[derive(Serialize)]
struct HashInput<'a> {
    parents: &'a HeadSet,
    actor: &'a ActorId,
    seq: u64,
    lamport: u64,
    timestamp: u64,
    metadata: &'a ChangeMetadata,
    ops: &'a [Op],
}

impl Change {
    /// Build a change and compute its hash
    pub fn new(
        parents: HeadSet,
        actor: ActorId,
        seq: u64,
        lamport: u64,
        timestamp: u64,
        metadata: ChangeMetadata,
        ops: Vec<Op>,
    ) -> Result<Self> {
        let hash = compute_hash(&parents, &actor, seq, lamport, timestamp, &metadata, &ops)?;
        Ok(Self {
            hash,
            parents,
            actor,
            seq,
            lamport,
            timestamp,
            metadata,
            ops,
        })
    }

    /// Recompute the hash and compare it with the stored one
    pub fn verify(&self) -> Result<()> {
        let expected = compute_hash(
            &self.parents,
            &self.actor,
            self.seq,
            self.lamport,
            self.timestamp,
            &self.metadata,
            &self.ops,
        )?;
        if expected != self.hash {
            return Err(Error::CorruptChange(self.hash.to_hex()));
        }
        Ok(())
    }

    pub fn is_merge(&self) -> bool {
        self.metadata.merge_metadata.is_some()
    }

    /// Compact binary form used by storage backends
    pub fn encode(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Inverse of [`Change::encode`]; rejects bytes whose hash does not match
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let change: Change =
            rmp_serde::from_slice(bytes).map_err(|e| Error::Serialization(e.to_string()))?;
        change.verify()?;
        Ok(change)
    }
}

fn compute_hash(
    parents: &HeadSet,
    actor: &ActorId,
    seq: u64,
    lamport: u64,
    timestamp: u64,
    metadata: &ChangeMetadata,
    ops: &[Op],
) -> Result<ChangeHash> {
    let input = HashInput {
        parents,
        actor,
        seq,
        lamport,
        timestamp,
        metadata,
        ops,
    };
    let bytes = rmp_serde::to_vec(&input).map_err(|e| Error::Serialization(e.to_string()))?;
    let digest = Sha256::digest(&bytes);
    Ok(ChangeHash::from_bytes(digest.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(message: &str) -> Change {
        Change::new(
            HeadSet::new(),
            ActorId::new("alice"),
            1,
            1,
            1_700_000_000_000,
            ChangeMetadata::new().with_message(message),
            vec![Op::put(DocPath::root().key("title"), "hello")],
        )
        .unwrap()
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(sample("a").hash, sample("a").hash);
        assert_ne!(sample("a").hash, sample("b").hash);
    }

    #[test]
    fn test_decode_rejects_tampered_bytes() {
        let change = sample("a");
        assert_eq!(Change::decode(&change.encode().unwrap()).unwrap(), change);

        let mut edited = change.clone();
        edited.seq = 2;
        assert!(matches!(
            Change::decode(&edited.encode().unwrap()),
            Err(Error::CorruptChange(_))
        ));
    }

    #[test]
    fn test_verify_detects_tampering() {
        let mut change = sample("a");
        assert!(change.verify().is_ok());

        change.ops.push(Op::delete(DocPath::root().key("title")));
        assert!(matches!(change.verify(), Err(Error::CorruptChange(_))));
    }
}
