//! Document Store - owns every document of a replica and announces head changes

use crate::change::{Change, ChangeMetadata, Op};
use crate::crdt::{DocPath, PathChange, TieBreak, Value};
use crate::document::{Document, DocumentId, DocumentMeta};
use crate::error::{Error, Result};
use crate::heads::{ActorId, ChangeHash, HeadSet};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Where a head change came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Written by this replica
    Local,
    /// Received from a peer or folded in by a merge
    Remote,
}

/// Head change sent to subscribers
#[derive(Debug, Clone)]
pub struct DocumentEvent {
    pub document_id: DocumentId,
    pub heads: HeadSet,
    pub origin: ChangeOrigin,
}

/// Document store handles all documents of one replica
pub struct DocumentStore {
    actor: ActorId,
    tie_break: TieBreak,
    /// All documents indexed by ID
    documents: DashMap<String, Arc<Document>>,
    /// Broadcast channel for head changes
    update_sender: broadcast::Sender<DocumentEvent>,
}

impl DocumentStore {
    /// Create a store writing as `actor`
    pub fn new(actor: ActorId) -> Self {
        Self::with_tie_break(actor, TieBreak::default())
    }

    pub fn with_tie_break(actor: ActorId, tie_break: TieBreak) -> Self {
        let (update_sender, _) = broadcast::channel(10000);

        Self {
            actor,
            tie_break,
            documents: DashMap::new(),
            update_sender,
        }
    }

    pub fn actor(&self) -> &ActorId {
        &self.actor
    }

    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    /// Create a new, empty document
    pub fn create(&self, id: DocumentId) -> Result<Arc<Document>> {
        let key = id.as_str().to_string();

        if self.documents.contains_key(&key) {
            return Err(Error::DocumentExists(key));
        }

        let doc = Arc::new(Document::with_tie_break(id, self.tie_break));
        self.documents.insert(key, doc.clone());

        Ok(doc)
    }

    /// Adopt an already built document (forked or loaded from storage)
    pub fn insert(&self, doc: Document) -> Result<Arc<Document>> {
        let key = doc.id().as_str().to_string();

        if self.documents.contains_key(&key) {
            return Err(Error::DocumentExists(key));
        }

        let doc = Arc::new(doc);
        self.documents.insert(key, doc.clone());
        self.publish(&doc, ChangeOrigin::Remote);
        Ok(doc)
    }

    /// Get an existing document
    pub fn get(&self, id: &DocumentId) -> Result<Arc<Document>> {
        self.documents
            .get(id.as_str())
            .map(|r| r.value().clone())
            .ok_or_else(|| Error::document_not_found(id))
    }

    pub fn contains(&self, id: &DocumentId) -> bool {
        self.documents.contains_key(id.as_str())
    }

    /// Get or create a document
    pub fn get_or_create(&self, id: DocumentId) -> Arc<Document> {
        let key = id.as_str().to_string();
        let tie_break = self.tie_break;

        self.documents
            .entry(key)
            .or_insert_with(|| Arc::new(Document::with_tie_break(id, tie_break)))
            .value()
            .clone()
    }

    /// Delete a document
    pub fn delete(&self, id: &DocumentId) -> Result<()> {
        self.documents
            .remove(id.as_str())
            .map(|_| ())
            .ok_or_else(|| Error::document_not_found(id))?;
        info!(document = %id, "Dropped document");
        Ok(())
    }

    /// List all documents matching a pattern (glob syntax)
    pub fn list(&self, pattern: Option<&str>) -> Vec<DocumentMeta> {
        let mut metas: Vec<DocumentMeta> = self
            .documents
            .iter()
            .filter(|entry| pattern.map_or(true, |p| matches_pattern(entry.key(), p)))
            .map(|entry| entry.value().meta())
            .collect();
        metas.sort_by(|a, b| a.id.cmp(&b.id));
        metas
    }

    /// Subscribe to head changes
    pub fn subscribe(&self) -> broadcast::Receiver<DocumentEvent> {
        self.update_sender.subscribe()
    }

    fn publish(&self, doc: &Document, origin: ChangeOrigin) {
        // No receivers is fine
        let _ = self.update_sender.send(DocumentEvent {
            document_id: doc.id(),
            heads: doc.heads(),
            origin,
        });
    }

    /// Read the current value at a path
    pub fn get_value(&self, id: &DocumentId, path: &DocPath) -> Result<Option<Value>> {
        Ok(self.get(id)?.get(path))
    }

    /// Write a single value as one change
    pub fn set(
        &self,
        id: &DocumentId,
        path: DocPath,
        value: impl Into<Value>,
        metadata: ChangeMetadata,
    ) -> Result<ChangeHash> {
        self.transact(id, metadata, vec![Op::put(path, value)])
    }

    /// Record several ops as one atomic change
    pub fn transact(
        &self,
        id: &DocumentId,
        metadata: ChangeMetadata,
        ops: Vec<Op>,
    ) -> Result<ChangeHash> {
        let doc = self.get(id)?;
        let hash = doc.transact(&self.actor, metadata, ops)?;
        self.publish(&doc, ChangeOrigin::Local);
        Ok(hash)
    }

    pub fn heads(&self, id: &DocumentId) -> Result<HeadSet> {
        Ok(self.get(id)?.heads())
    }

    pub fn changes_since(&self, id: &DocumentId, since: &HeadSet) -> Result<Vec<Change>> {
        self.get(id)?.changes_since(since)
    }

    pub fn diff_between(
        &self,
        id: &DocumentId,
        a: &HeadSet,
        b: &HeadSet,
    ) -> Result<Vec<PathChange>> {
        self.get(id)?.diff_between(a, b)
    }

    /// Integrate changes received from a peer
    pub fn apply_remote(&self, id: &DocumentId, changes: Vec<Change>) -> Result<usize> {
        let doc = self.get(id)?;
        let applied = doc.apply_changes(changes)?;
        if applied > 0 {
            debug!(document = %id, applied, "Applied remote changes");
            self.publish(&doc, ChangeOrigin::Remote);
        }
        Ok(applied)
    }

    /// Fold every change of `source` into `target`
    pub fn merge_documents(&self, target: &DocumentId, source: &DocumentId) -> Result<usize> {
        let target_doc = self.get(target)?;
        let source_doc = self.get(source)?;
        let applied = target_doc.merge(&source_doc)?;
        if applied > 0 {
            self.publish(&target_doc, ChangeOrigin::Remote);
        }
        Ok(applied)
    }

    /// Get statistics
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            document_count: self.documents.len(),
            change_count: self.documents.iter().map(|e| e.value().len()).sum(),
            subscriber_count: self.update_sender.receiver_count(),
        }
    }
}

/// Simple glob pattern matching: `*`, `prefix*`, `*suffix` or an exact key
pub fn matches_pattern(key: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    if let Some(prefix) = pattern.strip_suffix('*') {
        return key.starts_with(prefix);
    }

    if let Some(suffix) = pattern.strip_prefix('*') {
        return key.ends_with(suffix);
    }

    key == pattern
}

/// Store statistics
#[derive(Debug, Clone)]
pub struct StoreStats {
    pub document_count: usize,
    pub change_count: usize,
    pub subscriber_count: usize,
}
