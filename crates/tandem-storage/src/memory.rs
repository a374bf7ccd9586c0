//! Volatile change-log backend

use crate::{Storage, StorageError, StorageStats};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use tandem_core::store::matches_pattern;
use tandem_core::{Change, ChangeHash, DocumentId, DocumentMeta};

/// One document's log, kept encoded so reads go through the same
/// verification as the SQLite backend
#[derive(Default)]
struct Log {
    meta: Option<DocumentMeta>,
    known: HashSet<ChangeHash>,
    entries: Vec<Vec<u8>>,
}

impl Log {
    fn size(&self) -> usize {
        self.entries.iter().map(Vec::len).sum()
    }
}

/// In-memory storage; everything is lost when the process exits
#[derive(Default)]
pub struct MemoryStorage {
    logs: DashMap<String, Log>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn append(&self, meta: &DocumentMeta, changes: &[Change]) -> Result<usize, StorageError> {
        let mut encoded = Vec::with_capacity(changes.len());
        for change in changes {
            encoded.push((change.hash, change.encode()?));
        }

        let mut log = self.logs.entry(meta.id.as_str().to_string()).or_default();
        log.meta = Some(meta.clone());
        let mut added = 0;
        for (hash, bytes) in encoded {
            if log.known.insert(hash) {
                log.entries.push(bytes);
                added += 1;
            }
        }
        Ok(added)
    }

    async fn load(&self, id: &DocumentId) -> Result<Option<(DocumentMeta, Vec<Change>)>, StorageError> {
        let Some(log) = self.logs.get(id.as_str()) else {
            return Ok(None);
        };
        let meta = log
            .meta
            .clone()
            .unwrap_or_else(|| DocumentMeta::new(id.clone()));
        let changes = log
            .entries
            .iter()
            .map(|bytes| Change::decode(bytes))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some((meta, changes)))
    }

    async fn delete(&self, id: &DocumentId) -> Result<bool, StorageError> {
        Ok(self.logs.remove(id.as_str()).is_some())
    }

    async fn list(&self, pattern: Option<&str>) -> Result<Vec<DocumentId>, StorageError> {
        let mut ids: Vec<DocumentId> = self
            .logs
            .iter()
            .filter(|entry| pattern.map_or(true, |p| matches_pattern(entry.key(), p)))
            .filter_map(|entry| DocumentId::new(entry.key().clone()).ok())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn exists(&self, id: &DocumentId) -> Result<bool, StorageError> {
        Ok(self.logs.contains_key(id.as_str()))
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        let mut stats = StorageStats::default();
        for log in self.logs.iter() {
            stats.document_count += 1;
            stats.change_count += log.entries.len();
            stats.total_size_bytes += log.size();
        }
        Ok(stats)
    }
}
