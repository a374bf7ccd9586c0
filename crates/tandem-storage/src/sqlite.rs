//! SQLite change-log backend
//!
//! `documents` holds one row of metadata per document; `changes` holds the
//! encoded changes, keyed by hash and ordered by a per-document position.

use crate::{Storage, StorageError, StorageStats};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tandem_core::{Change, DocumentId, DocumentMeta};
use tracing::info;

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

fn meta_err(e: serde_json::Error) -> StorageError {
    StorageError::Serialization(e.to_string())
}

impl SqliteStorage {
    /// Open (or create) the database at `path`
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        let storage = Self::from_connection(Connection::open(path).map_err(db_err)?)?;
        info!(path = %path.display(), "Opened SQLite store");
        Ok(storage)
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory().map_err(db_err)?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                meta TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS changes (
                doc_id TEXT NOT NULL,
                hash BLOB NOT NULL,
                position INTEGER NOT NULL,
                data BLOB NOT NULL,
                PRIMARY KEY (doc_id, hash)
            );

            CREATE INDEX IF NOT EXISTS idx_changes_position ON changes(doc_id, position);
            "#,
        )
        .map_err(db_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

/// Translate the `prefix*` / `*suffix` glob into a LIKE pattern
fn like_pattern(pattern: &str) -> String {
    let escaped = pattern
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    if pattern == "*" {
        "%".to_string()
    } else if let Some(prefix) = escaped.strip_suffix('*') {
        format!("{}%", prefix)
    } else if let Some(suffix) = escaped.strip_prefix('*') {
        format!("%{}", suffix)
    } else {
        escaped
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn append(&self, meta: &DocumentMeta, changes: &[Change]) -> Result<usize, StorageError> {
        let meta_json = serde_json::to_string(meta).map_err(meta_err)?;
        let mut encoded = Vec::with_capacity(changes.len());
        for change in changes {
            encoded.push((change.hash, change.encode()?));
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            r#"
            INSERT INTO documents (id, meta, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET meta = excluded.meta, updated_at = excluded.updated_at
            "#,
            params![meta.id.as_str(), meta_json, meta.updated_at as i64],
        )
        .map_err(db_err)?;

        let mut next: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(position), 0) + 1 FROM changes WHERE doc_id = ?1",
                params![meta.id.as_str()],
                |row| row.get(0),
            )
            .map_err(db_err)?;

        let mut added = 0;
        {
            let mut insert = tx
                .prepare(
                    "INSERT OR IGNORE INTO changes (doc_id, hash, position, data) VALUES (?1, ?2, ?3, ?4)",
                )
                .map_err(db_err)?;
            for (hash, data) in &encoded {
                let inserted = insert
                    .execute(params![meta.id.as_str(), &hash.as_bytes()[..], next, data])
                    .map_err(db_err)?;
                if inserted > 0 {
                    next += 1;
                    added += 1;
                }
            }
        }
        tx.commit().map_err(db_err)?;
        Ok(added)
    }

    async fn load(&self, id: &DocumentId) -> Result<Option<(DocumentMeta, Vec<Change>)>, StorageError> {
        let conn = self.conn.lock();

        let meta_json: Option<String> = conn
            .query_row(
                "SELECT meta FROM documents WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        let Some(meta_json) = meta_json else {
            return Ok(None);
        };
        let meta: DocumentMeta = serde_json::from_str(&meta_json).map_err(meta_err)?;

        let mut stmt = conn
            .prepare("SELECT data FROM changes WHERE doc_id = ?1 ORDER BY position")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![id.as_str()], |row| row.get::<_, Vec<u8>>(0))
            .map_err(db_err)?;

        let mut changes = Vec::new();
        for data in rows {
            let data = data.map_err(db_err)?;
            changes.push(Change::decode(&data).map_err(|e| StorageError::Corrupt {
                id: id.to_string(),
                reason: e.to_string(),
            })?);
        }
        Ok(Some((meta, changes)))
    }

    async fn delete(&self, id: &DocumentId) -> Result<bool, StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute("DELETE FROM changes WHERE doc_id = ?1", params![id.as_str()])
            .map_err(db_err)?;
        let affected = tx
            .execute("DELETE FROM documents WHERE id = ?1", params![id.as_str()])
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(affected > 0)
    }

    async fn list(&self, pattern: Option<&str>) -> Result<Vec<DocumentId>, StorageError> {
        let conn = self.conn.lock();
        let like = like_pattern(pattern.unwrap_or("*"));

        let mut stmt = conn
            .prepare("SELECT id FROM documents WHERE id LIKE ?1 ESCAPE '\\' ORDER BY id")
            .map_err(db_err)?;
        let ids = stmt
            .query_map(params![like], |row| row.get::<_, String>(0))
            .map_err(db_err)?
            .filter_map(|r| r.ok())
            .filter_map(|id| DocumentId::new(id).ok())
            .collect();
        Ok(ids)
    }

    async fn exists(&self, id: &DocumentId) -> Result<bool, StorageError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM documents WHERE id = ?1)",
            params![id.as_str()],
            |row| row.get(0),
        )
        .map_err(db_err)
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        let conn = self.conn.lock();
        let document_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))
            .map_err(db_err)?;
        let (change_count, total_size): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(LENGTH(data)), 0) FROM changes",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(db_err)?;

        Ok(StorageStats {
            document_count: document_count as usize,
            change_count: change_count as usize,
            total_size_bytes: total_size as usize,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{load_document, save_document};
    use tandem_core::{ActorId, ChangeMetadata, DocPath, Document, TieBreak, Value};

    fn document(id: &str, titles: &[&str]) -> Document {
        let doc = Document::new(DocumentId::new(id).unwrap());
        for title in titles {
            doc.set(
                &ActorId::new("alice"),
                DocPath::root().key("title"),
                *title,
                ChangeMetadata::new(),
            )
            .unwrap();
        }
        doc
    }

    #[tokio::test]
    async fn test_append_is_idempotent() {
        let storage = SqliteStorage::in_memory().unwrap();
        let doc = document("branch:sqlite", &["a", "b", "c"]);

        assert_eq!(save_document(&storage, &doc, 0).await.unwrap(), 3);
        assert_eq!(save_document(&storage, &doc, 0).await.unwrap(), 0);

        let (meta, changes) = storage.load(&doc.id()).await.unwrap().unwrap();
        assert_eq!(meta.id.as_str(), "branch:sqlite");
        assert_eq!(changes, doc.changes());

        let stats = storage.stats().await.unwrap();
        assert_eq!(stats.document_count, 1);
        assert_eq!(stats.change_count, 3);
        assert!(stats.total_size_bytes > 0);
    }

    #[tokio::test]
    async fn test_delete_removes_changes() {
        let storage = SqliteStorage::in_memory().unwrap();
        let doc = document("branch:gone", &["a"]);
        save_document(&storage, &doc, 0).await.unwrap();
        assert!(storage.exists(&doc.id()).await.unwrap());

        assert!(storage.delete(&doc.id()).await.unwrap());
        assert!(!storage.exists(&doc.id()).await.unwrap());
        assert_eq!(storage.stats().await.unwrap().change_count, 0);
        assert!(storage.load(&doc.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_list_pattern() {
        let storage = SqliteStorage::in_memory().unwrap();
        for i in 0..5 {
            save_document(&storage, &document(&format!("branch:{}", i), &["x"]), 0)
                .await
                .unwrap();
        }

        // Underscore must not act as a LIKE wildcard
        save_document(&storage, &document("branchX1", &["x"]), 0).await.unwrap();
        save_document(&storage, &document("project_1", &["x"]), 0).await.unwrap();

        assert_eq!(storage.list(Some("branch:*")).await.unwrap().len(), 5);
        assert_eq!(storage.list(Some("project_*")).await.unwrap().len(), 1);
        assert_eq!(storage.list(Some("*_1")).await.unwrap().len(), 1);
        assert_eq!(storage.list(None).await.unwrap().len(), 7);
    }

    #[tokio::test]
    async fn test_history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".tandem").join("store.db");
        let doc = document("project:1", &["first", "second"]);

        {
            let storage = SqliteStorage::new(&path).unwrap();
            save_document(&storage, &doc, 0).await.unwrap();
        }

        let reopened = SqliteStorage::new(&path).unwrap();
        let loaded = load_document(&reopened, &doc.id(), TieBreak::Lamport)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.heads(), doc.heads());
        assert_eq!(loaded.len(), 2);
        assert_eq!(
            loaded.get(&DocPath::root().key("title")),
            Some(Value::from("second"))
        );
    }
}
