//! The search index: a minimal `SearchIndex` trait the worker keeps in
//! sync, backed by SQLite FTS5.
//!
//! Query evaluation (ranking, fielded queries) is explicitly out of scope;
//! this module only implements enough to let the worker pool keep the index
//! coherent with the catalog, plus a `search` passthrough used by tests to
//! assert document counts.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection};
use tracing::{debug, warn};

use crate::error::PipelineResult;

/// Readiness of the search index, polled by the worker before each update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStatus {
    Initializing,
    Ready,
    Error,
}

/// The interface the worker pool consumes. An implementation must tolerate
/// being called with an already-indexed key (reindex) and with an absent
/// key (delete of something never indexed).
pub trait SearchIndex: Send + Sync {
    fn status(&self) -> IndexStatus;
    fn reindex(&self, relative_path: &str, id: &str, body: &str) -> PipelineResult<()>;
    fn delete(&self, relative_path: &str, id: &str) -> PipelineResult<()>;
    /// Drop every indexed document, used by the reconciliation service
    /// ahead of a full rewalk.
    fn clear_for_reindex(&self) -> PipelineResult<()>;
}

/// SQLite FTS5-backed implementation, one subtree per vault under
/// `index_path`.
pub struct SqliteSearchIndex {
    conn: Mutex<Connection>,
}

impl SqliteSearchIndex {
    pub fn open(path: impl AsRef<Path>) -> PipelineResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path.as_ref())?;
        create_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> PipelineResult<Self> {
        let conn = Connection::open_in_memory()?;
        create_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Number of indexed documents.
    pub fn document_count(&self) -> PipelineResult<u64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Rank-ordered search, exposed only so tests and an external query
    /// layer have something to call; not part of the worker's contract.
    pub fn search(&self, query: &str, limit: usize) -> PipelineResult<Vec<(String, String, f64)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT d.relative_path, d.id, bm25(documents_fts) as score
             FROM documents_fts
             JOIN documents d ON documents_fts.rowid = d.rowid
             WHERE documents_fts MATCH ?1
             ORDER BY bm25(documents_fts)
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![query, limit as i64], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, f64>(2)?.abs()))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn clear(&self) -> PipelineResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("DELETE FROM documents_fts", [])?;
        conn.execute("DELETE FROM documents", [])?;
        Ok(())
    }
}

impl SearchIndex for SqliteSearchIndex {
    fn status(&self) -> IndexStatus {
        match self.conn.lock() {
            Ok(_) => IndexStatus::Ready,
            Err(_) => IndexStatus::Error,
        }
    }

    fn reindex(&self, relative_path: &str, id: &str, body: &str) -> PipelineResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT OR REPLACE INTO documents (id, relative_path, body) VALUES (?1, ?2, ?3)",
            params![id, relative_path, body],
        )?;
        conn.execute(
            "INSERT OR REPLACE INTO documents_fts (rowid, body)
             SELECT rowid, body FROM documents WHERE id = ?1",
            params![id],
        )?;
        debug!("[DEBUG] [search_index] reindexed {}", relative_path);
        Ok(())
    }

    fn delete(&self, relative_path: &str, id: &str) -> PipelineResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("DELETE FROM documents_fts WHERE rowid = (SELECT rowid FROM documents WHERE id = ?1)", params![id])?;
        let removed = conn.execute("DELETE FROM documents WHERE id = ?1", params![id])?;
        if removed == 0 {
            warn!("[WARN] [search_index] delete of unknown document {} ({})", id, relative_path);
        }
        Ok(())
    }

    fn clear_for_reindex(&self) -> PipelineResult<()> {
        self.clear()
    }
}

fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            relative_path TEXT NOT NULL,
            body TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE VIRTUAL TABLE IF NOT EXISTS documents_fts USING fts5(
            body,
            content = 'documents',
            content_rowid = 'rowid'
        )",
        [],
    )?;
    Ok(())
}

/// Best-effort read of file contents for indexing. Binary/unreadable files
/// are indexed with an empty body rather than failing the whole worker step.
pub fn read_body_best_effort(absolute_path: &Path) -> String {
    std::fs::read_to_string(absolute_path).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reindex_then_delete_round_trips() {
        let index = SqliteSearchIndex::open_in_memory().unwrap();
        assert_eq!(index.status(), IndexStatus::Ready);

        index.reindex("a.md", "id-1", "hello world").unwrap();
        assert_eq!(index.document_count().unwrap(), 1);

        index.delete("a.md", "id-1").unwrap();
        assert_eq!(index.document_count().unwrap(), 0);
    }

    #[test]
    fn delete_of_unknown_document_is_not_an_error() {
        let index = SqliteSearchIndex::open_in_memory().unwrap();
        index.delete("missing.md", "nope").unwrap();
    }

    #[test]
    fn clear_drops_all_documents() {
        let index = SqliteSearchIndex::open_in_memory().unwrap();
        index.reindex("a.md", "id-1", "hello").unwrap();
        index.reindex("b.md", "id-2", "world").unwrap();
        index.clear().unwrap();
        assert_eq!(index.document_count().unwrap(), 0);
    }
}
