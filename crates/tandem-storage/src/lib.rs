//! Tandem Storage Backends
//!
//! Every document is persisted as its append-only change log. Writes only
//! ever add changes, so saving a branch after an edit costs one row rather
//! than a rewrite of the whole history.
//!
//! - Memory: volatile, used by tests and in-memory projects
//! - SQLite: `.tandem/store.db` inside the project directory

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use tandem_core::{Change, Document, DocumentId, DocumentMeta, TieBreak};
use tracing::debug;

/// Change-log persistence
#[async_trait]
pub trait Storage: Send + Sync {
    /// Append `changes` to the log of `meta.id`, creating it if needed.
    ///
    /// Changes whose hash is already stored are skipped. Returns how many
    /// were new.
    async fn append(&self, meta: &DocumentMeta, changes: &[Change]) -> Result<usize, StorageError>;

    /// Metadata and every stored change, in append order
    async fn load(&self, id: &DocumentId) -> Result<Option<(DocumentMeta, Vec<Change>)>, StorageError>;

    async fn delete(&self, id: &DocumentId) -> Result<bool, StorageError>;

    /// Document ids, optionally filtered by a `prefix*` / `*suffix` pattern
    async fn list(&self, pattern: Option<&str>) -> Result<Vec<DocumentId>, StorageError>;

    async fn exists(&self, id: &DocumentId) -> Result<bool, StorageError>;

    async fn stats(&self) -> Result<StorageStats, StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The stored log cannot be replayed
    #[error("Corrupt change log for {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("IO error: {0}")]
    Io(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Core error: {0}")]
    Core(#[from] tandem_core::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub document_count: usize,
    pub change_count: usize,
    /// Encoded size of all changes
    pub total_size_bytes: usize,
}

/// Append the changes of `doc` past the first `skip` to storage
///
/// Passing the change count from the previous save writes only the new tail;
/// `0` writes everything (already stored changes are ignored by the backend).
pub async fn save_document(
    storage: &dyn Storage,
    doc: &Document,
    skip: usize,
) -> Result<usize, StorageError> {
    let changes: Vec<Change> = doc.changes().into_iter().skip(skip).collect();
    if changes.is_empty() {
        return Ok(0);
    }
    let meta = doc.meta();
    let added = storage.append(&meta, &changes).await?;
    debug!(document = %meta.id, offered = changes.len(), added, "Persisted changes");
    Ok(added)
}

/// Replay a stored change log, `None` if the document was never stored
pub async fn load_document(
    storage: &dyn Storage,
    id: &DocumentId,
    tie_break: TieBreak,
) -> Result<Option<Document>, StorageError> {
    let Some((_meta, changes)) = storage.load(id).await? else {
        return Ok(None);
    };

    let doc = Document::with_tie_break(id.clone(), tie_break);
    doc.apply_changes(changes)?;
    if doc.pending_count() > 0 {
        return Err(StorageError::Corrupt {
            id: id.to_string(),
            reason: format!("{} changes reference missing parents", doc.pending_count()),
        });
    }
    Ok(Some(doc))
}

pub use memory::MemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
