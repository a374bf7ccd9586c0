//! Document types and operations
//!
//! A [`Document`] is an append-only DAG of hashed [`Change`]s. Its state at
//! any [`HeadSet`] is the replay of every op in the causal closure of those
//! heads, in a deterministic topological order. Two replicas holding the same
//! changes therefore always materialize the same value.

use crate::change::{Change, ChangeMetadata, Op, OpAction};
use crate::crdt::{diff_values, DocPath, PathChange, TieBreak, Value};
use crate::error::{Error, Result};
use crate::heads::{ActorId, ChangeHash, HeadSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

/// Document identifier - UTF-8 string, max 512 bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    /// Create a new document ID, validating the format
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();

        if id.is_empty() {
            return Err(Error::InvalidDocumentId("Document ID cannot be empty".into()));
        }

        if id.len() > 512 {
            return Err(Error::InvalidDocumentId("Document ID exceeds 512 bytes".into()));
        }

        // Validate pattern: [a-zA-Z0-9:_-]+
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == ':' || c == '_' || c == '-')
        {
            return Err(Error::InvalidDocumentId(
                "Document ID must match pattern [a-zA-Z0-9:_-]+".into(),
            ));
        }

        Ok(Self(id))
    }

    /// A fresh id of the form `<prefix>:<uuid>`
    pub fn generate(prefix: &str) -> Self {
        Self(format!("{}:{}", prefix, uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for DocumentId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        DocumentId::new(s)
    }
}

/// Document metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub id: DocumentId,
    pub created_at: u64,
    pub updated_at: u64,
    pub change_count: u64,
}

impl DocumentMeta {
    pub fn new(id: DocumentId) -> Self {
        let now = now_millis();

        Self {
            id,
            created_at: now,
            updated_at: now,
            change_count: 0,
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

type ReplayKey = (u64, ActorId, u64);

struct ChangeLog {
    changes: HashMap<ChangeHash, Change>,
    /// Insertion order; every change appears after its parents
    order: Vec<ChangeHash>,
    heads: HeadSet,
    /// Received changes whose parents have not arrived yet
    pending: Vec<Change>,
    seqs: HashMap<ActorId, u64>,
    /// Materialized state at `heads`
    state: Value,
}

impl ChangeLog {
    fn new() -> Self {
        Self {
            changes: HashMap::new(),
            order: Vec::new(),
            heads: HeadSet::new(),
            pending: Vec::new(),
            seqs: HashMap::new(),
            state: Value::object(),
        }
    }

    fn insert(&mut self, change: Change) {
        for parent in change.parents.iter() {
            self.heads.remove(parent);
        }
        self.heads.insert(change.hash);

        let seq = self.seqs.entry(change.actor.clone()).or_insert(0);
        *seq = (*seq).max(change.seq);

        self.order.push(change.hash);
        self.changes.insert(change.hash, change);
    }

    /// Every change reachable from `heads`, heads included
    fn closure(&self, heads: &HeadSet) -> Result<HashSet<ChangeHash>> {
        let mut stack = Vec::with_capacity(heads.len());
        for head in heads {
            if !self.changes.contains_key(head) {
                return Err(Error::NotFound(format!("change {}", head)));
            }
            stack.push(*head);
        }

        let mut seen = HashSet::new();
        while let Some(hash) = stack.pop() {
            if !seen.insert(hash) {
                continue;
            }
            if let Some(change) = self.changes.get(&hash) {
                stack.extend(change.parents.iter().copied());
            }
        }
        Ok(seen)
    }

    /// Kahn's algorithm over `members`; ready changes are taken in
    /// tie-break order so every replica replays identically.
    fn replay_order(&self, members: &HashSet<ChangeHash>, tie_break: TieBreak) -> Vec<&Change> {
        let key = |change: &Change| -> ReplayKey {
            let primary = match tie_break {
                TieBreak::Lamport => change.lamport,
                TieBreak::Timestamp => change.timestamp,
            };
            (primary, change.actor.clone(), change.seq)
        };

        let mut indegree: HashMap<ChangeHash, usize> = HashMap::with_capacity(members.len());
        let mut children: HashMap<ChangeHash, Vec<ChangeHash>> = HashMap::new();
        for hash in members {
            let Some(change) = self.changes.get(hash) else {
                continue;
            };
            let mut count = 0;
            for parent in change.parents.iter().filter(|p| members.contains(*p)) {
                children.entry(*parent).or_default().push(*hash);
                count += 1;
            }
            indegree.insert(*hash, count);
        }

        let mut ready: BinaryHeap<Reverse<(ReplayKey, ChangeHash)>> = indegree
            .iter()
            .filter(|(_, count)| **count == 0)
            .filter_map(|(hash, _)| self.changes.get(hash).map(|c| Reverse((key(c), *hash))))
            .collect();

        let mut out = Vec::with_capacity(members.len());
        while let Some(Reverse((_, hash))) = ready.pop() {
            let Some(change) = self.changes.get(&hash) else {
                continue;
            };
            out.push(change);

            for child in children.get(&hash).into_iter().flatten() {
                if let Some(count) = indegree.get_mut(child) {
                    *count -= 1;
                    if *count == 0 {
                        if let Some(c) = self.changes.get(child) {
                            ready.push(Reverse((key(c), *child)));
                        }
                    }
                }
            }
        }
        out
    }

    fn materialize(&self, members: &HashSet<ChangeHash>, tie_break: TieBreak) -> Value {
        let mut state = Value::object();
        for change in self.replay_order(members, tie_break) {
            for op in &change.ops {
                apply_op(&mut state, op);
            }
        }
        state
    }

    fn all_members(&self) -> HashSet<ChangeHash> {
        self.changes.keys().copied().collect()
    }

    fn state_at(&self, heads: &HeadSet, tie_break: TieBreak) -> Result<Value> {
        if *heads == self.heads {
            return Ok(self.state.clone());
        }
        let members = self.closure(heads)?;
        Ok(self.materialize(&members, tie_break))
    }
}

fn apply_op(state: &mut Value, op: &Op) {
    match &op.action {
        OpAction::Put(value) => state.set(&op.path, value.clone()),
        OpAction::Delete => {
            state.remove(&op.path);
        }
        OpAction::Push(value) => {
            // A push onto a non-list loses to whatever replaced the list
            if let Err(e) = state.push(&op.path, value.clone()) {
                trace!(error = %e, "Skipping push during replay");
            }
        }
    }
}

/// A replicated document backed by a causal op log
pub struct Document {
    meta: RwLock<DocumentMeta>,
    log: RwLock<ChangeLog>,
    tie_break: TieBreak,
}

impl Document {
    /// Create an empty document with the default tie-break policy
    pub fn new(id: DocumentId) -> Self {
        Self::with_tie_break(id, TieBreak::default())
    }

    pub fn with_tie_break(id: DocumentId, tie_break: TieBreak) -> Self {
        Self {
            meta: RwLock::new(DocumentMeta::new(id)),
            log: RwLock::new(ChangeLog::new()),
            tie_break,
        }
    }

    /// Get the document ID
    pub fn id(&self) -> DocumentId {
        self.meta.read().id.clone()
    }

    /// Get document metadata
    pub fn meta(&self) -> DocumentMeta {
        self.meta.read().clone()
    }

    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    /// Current heads
    pub fn heads(&self) -> HeadSet {
        self.log.read().heads.clone()
    }

    /// Number of changes in the log
    pub fn len(&self) -> usize {
        self.log.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.read().order.is_empty()
    }

    /// Changes received whose parents are still missing
    pub fn pending_count(&self) -> usize {
        self.log.read().pending.len()
    }

    /// Get the current value at a path
    pub fn get(&self, path: &DocPath) -> Option<Value> {
        self.log.read().state.get(path).cloned()
    }

    /// The whole current state
    pub fn snapshot(&self) -> Value {
        self.log.read().state.clone()
    }

    /// Get the value at a path as of `heads`
    pub fn get_at(&self, path: &DocPath, heads: &HeadSet) -> Result<Option<Value>> {
        let state = self.snapshot_at(heads)?;
        Ok(state.get(path).cloned())
    }

    /// The whole state as of `heads`
    pub fn snapshot_at(&self, heads: &HeadSet) -> Result<Value> {
        self.log.read().state_at(heads, self.tie_break)
    }

    /// Record one atomic change made of `ops` on top of the current heads
    pub fn transact(
        &self,
        actor: &ActorId,
        metadata: ChangeMetadata,
        ops: Vec<Op>,
    ) -> Result<ChangeHash> {
        let mut log = self.log.write();

        let parents = log.heads.clone();
        let lamport = parents
            .iter()
            .filter_map(|h| log.changes.get(h))
            .map(|c| c.lamport)
            .max()
            .unwrap_or(0)
            + 1;
        let seq = log.seqs.get(actor).copied().unwrap_or(0) + 1;

        let change = Change::new(
            parents,
            actor.clone(),
            seq,
            lamport,
            now_millis(),
            metadata,
            ops,
        )?;

        // Causally after every known change, so it replays last
        for op in &change.ops {
            apply_op(&mut log.state, op);
        }

        let hash = change.hash;
        log.insert(change);
        let count = log.order.len() as u64;
        drop(log);

        self.touch(count);
        trace!(document = %self.id(), change = %hash.short(), "Recorded local change");
        Ok(hash)
    }

    /// Set a single value
    pub fn set(
        &self,
        actor: &ActorId,
        path: DocPath,
        value: impl Into<Value>,
        metadata: ChangeMetadata,
    ) -> Result<ChangeHash> {
        self.transact(actor, metadata, vec![Op::put(path, value)])
    }

    /// Delete a single entry
    pub fn delete(
        &self,
        actor: &ActorId,
        path: DocPath,
        metadata: ChangeMetadata,
    ) -> Result<ChangeHash> {
        self.transact(actor, metadata, vec![Op::delete(path)])
    }

    /// Integrate changes from another replica.
    ///
    /// Changes are verified first; if any fails nothing is applied. Changes
    /// whose parents are unknown are buffered until the parents arrive.
    /// Returns the number of changes newly added to the log.
    pub fn apply_changes(&self, changes: Vec<Change>) -> Result<usize> {
        for change in &changes {
            change.verify()?;
        }

        let mut log = self.log.write();
        let mut queue = std::mem::take(&mut log.pending);
        queue.extend(changes);

        let mut applied = 0;
        loop {
            let mut progressed = false;
            let mut waiting = Vec::new();
            let mut waiting_hashes = HashSet::new();

            for change in queue.drain(..) {
                if log.changes.contains_key(&change.hash) {
                    continue;
                }
                if change.parents.iter().all(|p| log.changes.contains_key(p)) {
                    log.insert(change);
                    applied += 1;
                    progressed = true;
                } else if waiting_hashes.insert(change.hash) {
                    waiting.push(change);
                }
            }

            queue = waiting;
            if !progressed || queue.is_empty() {
                break;
            }
        }
        log.pending = queue;

        if applied > 0 {
            let members = log.all_members();
            log.state = log.materialize(&members, self.tie_break);
        }
        let count = log.order.len() as u64;
        let pending = log.pending.len();
        drop(log);

        if applied > 0 {
            self.touch(count);
        }
        debug!(document = %self.id(), applied, pending, "Applied changes");
        Ok(applied)
    }

    /// Fold every change of `other` into this document
    pub fn merge(&self, other: &Document) -> Result<usize> {
        let missing: Vec<Change> = {
            let theirs = other.log.read();
            let ours = self.log.read();
            theirs
                .order
                .iter()
                .filter(|h| !ours.changes.contains_key(*h))
                .filter_map(|h| theirs.changes.get(h).cloned())
                .collect()
        };
        self.apply_changes(missing)
    }

    /// All changes in causal order
    pub fn changes(&self) -> Vec<Change> {
        let log = self.log.read();
        log.order
            .iter()
            .filter_map(|h| log.changes.get(h).cloned())
            .collect()
    }

    pub fn get_change(&self, hash: &ChangeHash) -> Option<Change> {
        self.log.read().changes.get(hash).cloned()
    }

    pub fn has_change(&self, hash: &ChangeHash) -> bool {
        self.log.read().changes.contains_key(hash)
    }

    /// True if every hash in `heads` is in the log
    pub fn contains_heads(&self, heads: &HeadSet) -> bool {
        let log = self.log.read();
        heads.iter().all(|h| log.changes.contains_key(h))
    }

    /// The subset of `heads` this log knows about
    pub fn known_heads(&self, heads: &HeadSet) -> HeadSet {
        let log = self.log.read();
        heads
            .iter()
            .filter(|h| log.changes.contains_key(*h))
            .copied()
            .collect()
    }

    /// Changes not in the causal closure of `since`, in causal order
    pub fn changes_since(&self, since: &HeadSet) -> Result<Vec<Change>> {
        let log = self.log.read();
        let seen = log.closure(since)?;
        Ok(log
            .order
            .iter()
            .filter(|h| !seen.contains(*h))
            .filter_map(|h| log.changes.get(h).cloned())
            .collect())
    }

    /// Changes reachable from `to` but not from `from`, in causal order
    pub fn changes_between(&self, from: &HeadSet, to: &HeadSet) -> Result<Vec<Change>> {
        let log = self.log.read();
        let before = log.closure(from)?;
        let after = log.closure(to)?;
        Ok(log
            .order
            .iter()
            .filter(|h| after.contains(*h) && !before.contains(*h))
            .filter_map(|h| log.changes.get(h).cloned())
            .collect())
    }

    /// True if the version `ancestor` is contained in the version `heads`
    pub fn is_ancestor(&self, ancestor: &HeadSet, heads: &HeadSet) -> Result<bool> {
        let log = self.log.read();
        let older = log.closure(ancestor)?;
        let newer = log.closure(heads)?;
        Ok(older.is_subset(&newer))
    }

    /// Leaf-level differences between two versions
    pub fn diff_between(&self, a: &HeadSet, b: &HeadSet) -> Result<Vec<PathChange>> {
        let (before, after) = {
            let log = self.log.read();
            (log.state_at(a, self.tie_break)?, log.state_at(b, self.tie_break)?)
        };
        Ok(diff_values(&before, &after))
    }

    /// A new document holding exactly the history up to `heads`
    pub fn fork_at(&self, id: DocumentId, heads: &HeadSet) -> Result<Document> {
        let log = self.log.read();
        let members = log.closure(heads)?;

        let mut forked = ChangeLog::new();
        for hash in log.order.iter().filter(|h| members.contains(*h)) {
            if let Some(change) = log.changes.get(hash) {
                forked.insert(change.clone());
            }
        }
        forked.state = log.state_at(heads, self.tie_break)?;
        let count = forked.order.len() as u64;

        let doc = Document {
            meta: RwLock::new(DocumentMeta::new(id)),
            log: RwLock::new(forked),
            tie_break: self.tie_break,
        };
        doc.meta.write().change_count = count;
        Ok(doc)
    }

    fn touch(&self, change_count: u64) {
        let mut meta = self.meta.write();
        meta.change_count = change_count;
        meta.updated_at = now_millis();
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("meta", &self.meta)
            .field("heads", &self.heads())
            .finish()
    }
}
