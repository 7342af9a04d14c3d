//! The catalog (C6): a durable SQLite-backed mapping of path <-> stable id.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::models::{EventKind, FileChangeEvent, FileEntry, FileStatus};
use crate::util;

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn status_to_str(status: FileStatus) -> &'static str {
    match status {
        FileStatus::Active => "ACTIVE",
        FileStatus::Deleted => "DELETED",
    }
}

fn status_from_str(value: &str) -> FileStatus {
    match value {
        "DELETED" => FileStatus::Deleted,
        _ => FileStatus::Active,
    }
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<FileEntry> {
    let status: String = row.get("status")?;
    Ok(FileEntry {
        id: row.get("id")?,
        name: row.get("name")?,
        relative_path: row.get("relative_path")?,
        parent_id: row.get("parent_id")?,
        is_directory: row.get::<_, i64>("is_directory")? != 0,
        file_type_id: row.get("file_type_id")?,
        size: row.get::<_, i64>("size")? as u64,
        created_at: row.get::<_, i64>("created_at")? as u64,
        modified_at: row.get::<_, i64>("modified_at")? as u64,
        status: status_from_str(&status),
    })
}

/// Durable store behind the service interface the pipeline requires.
pub struct Catalog {
    conn: StdMutex<Connection>,
    /// Per-`relative_path` async guards so concurrent workers touching the
    /// same path serialize their multi-statement critical section, without
    /// forcing unrelated paths to queue behind each other.
    row_locks: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    /// Guards ancestor-directory creation across the whole vault, so two
    /// workers racing on the same parent chain never create it twice.
    ancestor_lock: AsyncMutex<()>,
}

impl Catalog {
    /// Open (creating if absent) the catalog database at `path`.
    pub fn open(path: impl AsRef<Path>) -> PipelineResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path.as_ref())?;
        create_schema(&conn)?;
        info!("[INFO] [catalog] opened at {:?}", path.as_ref());
        Ok(Self {
            conn: StdMutex::new(conn),
            row_locks: StdMutex::new(HashMap::new()),
            ancestor_lock: AsyncMutex::new(()),
        })
    }

    /// An in-memory catalog, used by tests.
    pub fn open_in_memory() -> PipelineResult<Self> {
        let conn = Connection::open_in_memory()?;
        create_schema(&conn)?;
        Ok(Self {
            conn: StdMutex::new(conn),
            row_locks: StdMutex::new(HashMap::new()),
            ancestor_lock: AsyncMutex::new(()),
        })
    }

    fn row_lock_for(&self, relative_path: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.row_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(relative_path.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn with_conn<F, T>(&self, f: F) -> PipelineResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        Ok(f(&conn)?)
    }

    fn with_conn_mut<F, T>(&self, f: F) -> PipelineResult<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T>,
    {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        Ok(f(&mut conn)?)
    }

    /// Interns a file-type tag, returning its id.
    pub fn get_or_create_file_type(&self, name: &str) -> PipelineResult<i64> {
        self.with_conn(|conn| {
            if let Some(id) = conn
                .query_row(
                    "SELECT id FROM file_types WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?
            {
                return Ok(id);
            }
            conn.execute("INSERT INTO file_types (name) VALUES (?1)", params![name])?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Resolve a `file_type_id` back to its tag, used by the tree cache
    /// when projecting a [`FileEntry`] into [`crate::models::NodeMetadata`].
    pub fn file_type_name(&self, file_type_id: i64) -> PipelineResult<String> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT name FROM file_types WHERE id = ?1",
                params![file_type_id],
                |row| row.get(0),
            )
        })
    }

    /// Look up an entry by its relative path. ACTIVE only unless
    /// `include_deleted` is set.
    pub fn get_by_path(&self, relative_path: &str, include_deleted: bool) -> PipelineResult<Option<FileEntry>> {
        self.with_conn(|conn| {
            let sql = if include_deleted {
                "SELECT * FROM file_entries WHERE relative_path = ?1"
            } else {
                "SELECT * FROM file_entries WHERE relative_path = ?1 AND status = 'ACTIVE'"
            };
            conn.query_row(sql, params![relative_path], row_to_entry)
                .optional()
        })
    }

    /// Look up an entry by its stable id. Never "not found" after a delete
    /// — returns the DELETED row.
    pub fn get_by_id(&self, id: &str) -> PipelineResult<Option<FileEntry>> {
        self.with_conn(|conn| {
            conn.query_row("SELECT * FROM file_entries WHERE id = ?1", params![id], row_to_entry)
                .optional()
        })
    }

    /// Direct children of `parent_id` (or root entries when `None`). ACTIVE
    /// only, directories-first then name-ascending (case-insensitive),
    /// matching the tree cache ordering.
    pub fn children_of(&self, parent_id: Option<&str>) -> PipelineResult<Vec<FileEntry>> {
        self.with_conn(|conn| {
            let mut stmt = match parent_id {
                Some(_) => conn.prepare(
                    "SELECT * FROM file_entries WHERE parent_id = ?1 AND status = 'ACTIVE'
                     ORDER BY is_directory DESC, name COLLATE NOCASE ASC",
                )?,
                None => conn.prepare(
                    "SELECT * FROM file_entries WHERE parent_id IS NULL AND status = 'ACTIVE'
                     ORDER BY is_directory DESC, name COLLATE NOCASE ASC",
                )?,
            };
            let rows = match parent_id {
                Some(id) => stmt.query_map(params![id], row_to_entry)?,
                None => stmt.query_map([], row_to_entry)?,
            };
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
    }

    /// Ensure every ancestor directory of `relative_path` exists as an
    /// ACTIVE entry, creating missing ones under the process-wide ancestor
    /// lock so concurrent workers don't race on the same parent chain.
    async fn ensure_ancestors(&self, relative_path: &str) -> PipelineResult<Option<String>> {
        let Some((parent_path, _)) = relative_path.rsplit_once('/') else {
            return Ok(None);
        };

        let _guard = self.ancestor_lock.lock().await;

        let mut parent_id: Option<String> = None;
        let mut built = String::new();
        for segment in parent_path.split('/') {
            if !built.is_empty() {
                built.push('/');
            }
            built.push_str(segment);

            if let Some(existing) = self.get_by_path(&built, false)? {
                parent_id = Some(existing.id);
                continue;
            }

            let type_id = self.get_or_create_file_type("directory")?;
            let now = now_unix();
            let id = uuid::Uuid::new_v4().to_string();
            self.with_conn(|conn| {
                conn.execute(
                    "INSERT INTO file_entries
                        (id, name, relative_path, parent_id, is_directory, file_type_id, size, created_at, modified_at, status)
                     VALUES (?1, ?2, ?3, ?4, 1, ?5, 0, ?6, ?6, 'ACTIVE')",
                    params![
                        id,
                        segment,
                        built,
                        parent_id,
                        type_id,
                        now as i64,
                    ],
                )
            })?;
            debug!("[DEBUG] [catalog] created ancestor directory {}", built);
            parent_id = Some(id);
        }

        Ok(parent_id)
    }

    /// Apply a [`FileChangeEvent`] to the catalog and return the entry's id
    /// plus whether it is a directory. Dispatches to the
    /// Created/Modified/Deleted behavior.
    pub async fn apply(&self, event: &FileChangeEvent, relative_path: &str) -> PipelineResult<(String, bool)> {
        let lock = self.row_lock_for(relative_path);
        let _guard = lock.lock().await;

        match event.event_kind {
            EventKind::Created | EventKind::Modified => self.upsert_created_or_modified(event, relative_path).await,
            EventKind::Deleted => self.mark_deleted_locked(relative_path),
        }
    }

    async fn upsert_created_or_modified(
        &self,
        event: &FileChangeEvent,
        relative_path: &str,
    ) -> PipelineResult<(String, bool)> {
        let metadata = std::fs::metadata(&event.absolute_path)?;
        let is_directory = metadata.is_dir();
        let size = if is_directory { 0 } else { metadata.len() };
        let type_name = if is_directory { "directory" } else { util::classify_extension(relative_path) };
        let type_id = self.get_or_create_file_type(type_name)?;

        let parent_id = self.ensure_ancestors(relative_path).await?;

        let name = relative_path.rsplit('/').next().unwrap_or(relative_path).to_string();
        let now = now_unix();

        let id = self.upsert_by_path(relative_path, &name, parent_id.as_deref(), is_directory, type_id, size, now)?;
        Ok((id, is_directory))
    }

    /// Insert or update an entry by relative path: preserves `id`/`created_at`
    /// if the row already exists (even if DELETED — a recreated path
    /// resurrects the same id), refreshes `modified_at`/`size`/`file_type`
    /// and sets `status = ACTIVE`.
    pub fn upsert_by_path(
        &self,
        relative_path: &str,
        name: &str,
        parent_id: Option<&str>,
        is_directory: bool,
        file_type_id: i64,
        size: u64,
        now: u64,
    ) -> PipelineResult<String> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let existing: Option<(String, i64)> = tx
                .query_row(
                    "SELECT id, created_at FROM file_entries WHERE relative_path = ?1",
                    params![relative_path],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let id = match existing {
                Some((id, created_at)) => {
                    tx.execute(
                        "UPDATE file_entries SET name = ?1, parent_id = ?2, is_directory = ?3,
                            file_type_id = ?4, size = ?5, modified_at = ?6, status = 'ACTIVE'
                         WHERE id = ?7",
                        params![name, parent_id, is_directory as i64, file_type_id, size as i64, now as i64, id],
                    )?;
                    let _ = created_at;
                    id
                }
                None => {
                    let id = uuid::Uuid::new_v4().to_string();
                    tx.execute(
                        "INSERT INTO file_entries
                            (id, name, relative_path, parent_id, is_directory, file_type_id, size, created_at, modified_at, status)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8, 'ACTIVE')",
                        params![id, name, relative_path, parent_id, is_directory as i64, file_type_id, size as i64, now as i64],
                    )?;
                    id
                }
            };

            tx.commit()?;
            Ok(id)
        })
    }

    fn mark_deleted_locked(&self, relative_path: &str) -> PipelineResult<(String, bool)> {
        match self.mark_deleted_by_path(relative_path)? {
            Some((id, is_directory)) => Ok((id, is_directory)),
            None => Ok((String::new(), false)),
        }
    }

    /// Flip an entry's status to DELETED by relative path; no-op (not an
    /// error) if the path isn't present. Returns the id and whether the
    /// deleted entry was a directory.
    pub fn mark_deleted_by_path(&self, relative_path: &str) -> PipelineResult<Option<(String, bool)>> {
        self.with_conn(|conn| {
            let found: Option<(String, bool)> = conn
                .query_row(
                    "SELECT id, is_directory FROM file_entries WHERE relative_path = ?1 AND status = 'ACTIVE'",
                    params![relative_path],
                    |row| Ok((row.get(0)?, row.get::<_, i64>(1)? != 0)),
                )
                .optional()?;

            if let Some((id, _)) = &found {
                conn.execute("UPDATE file_entries SET status = 'DELETED' WHERE id = ?1", params![id])?;
            }

            Ok(found)
        })
    }

    /// Flip every ACTIVE entry to DELETED, used ahead of a full reindex.
    /// Status flip only, ids preserved.
    pub fn mark_all_deleted(&self) -> PipelineResult<usize> {
        self.with_conn(|conn| Ok(conn.execute("UPDATE file_entries SET status = 'DELETED' WHERE status = 'ACTIVE'", [])?))
    }
}

fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS file_types (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    // The catalog's core table gets the defensive treatment: if a prior run
    // left behind a `file_entries` table with a different shape, drop and
    // recreate it rather than limping along against a stale schema.
    let file_entries_sql = "CREATE TABLE file_entries (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            relative_path TEXT NOT NULL,
            parent_id TEXT,
            is_directory INTEGER NOT NULL,
            file_type_id INTEGER NOT NULL,
            size INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            modified_at INTEGER NOT NULL,
            status TEXT NOT NULL,
            FOREIGN KEY (parent_id) REFERENCES file_entries(id),
            FOREIGN KEY (file_type_id) REFERENCES file_types(id)
        )";
    validate_or_recreate_table(conn, "file_entries", file_entries_sql)?;

    // Partial unique indexes: uniqueness only holds among ACTIVE rows, so a
    // soft-deleted row never blocks a path or (parent, name) pair from
    // being reused.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_file_entries_active_path
         ON file_entries(relative_path) WHERE status = 'ACTIVE'",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_file_entries_active_parent_name
         ON file_entries(parent_id, name) WHERE status = 'ACTIVE'",
        [],
    )?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_file_entries_parent ON file_entries(parent_id)", [])?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_file_entries_id ON file_entries(id)", [])?;

    Ok(())
}

/// Compare the table's on-disk definition against `expected_sql`
/// (whitespace/case-normalized) and drop-and-recreate on mismatch. A fresh
/// database has no existing table, so this degenerates to plain creation.
fn validate_or_recreate_table(conn: &Connection, table_name: &str, expected_sql: &str) -> rusqlite::Result<()> {
    let actual_sql: Option<String> = {
        let mut stmt = conn.prepare("SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1")?;
        let mut rows = stmt.query(params![table_name])?;
        rows.next()?.map(|row| row.get(0)).transpose()?
    };

    let normalize = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();

    match actual_sql {
        Some(actual_sql) if normalize(&actual_sql) == normalize(expected_sql) => Ok(()),
        Some(_) => {
            warn!("[WARN] [catalog] table {} schema drifted, dropping and recreating", table_name);
            conn.execute(&format!("DROP TABLE IF EXISTS {table_name}"), [])?;
            conn.execute(expected_sql, [])?;
            Ok(())
        }
        None => {
            conn.execute(expected_sql, [])?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn touch(dir: &tempfile::TempDir, relative: &str) -> std::path::PathBuf {
        let path = dir.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "hello").unwrap();
        path
    }

    fn created_event(absolute_path: std::path::PathBuf) -> FileChangeEvent {
        FileChangeEvent {
            vault_id: "v1".into(),
            absolute_path,
            event_kind: EventKind::Created,
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn idempotent_create_produces_one_active_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = touch(&dir, "a.md");
        let catalog = Catalog::open_in_memory().unwrap();

        let event = created_event(path.clone());
        let relative = "a.md";
        let (id1, is_dir1) = catalog.apply(&event, relative).await.unwrap();
        let (id2, is_dir2) = catalog.apply(&event, relative).await.unwrap();

        assert_eq!(id1, id2);
        assert!(!is_dir1);
        assert!(!is_dir2);
        let entry = catalog.get_by_path(relative, false).unwrap().unwrap();
        assert_eq!(entry.id, id1);
        assert_eq!(entry.status, FileStatus::Active);
    }

    #[tokio::test]
    async fn delete_cancels_create_and_preserves_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = touch(&dir, "a.md");
        let catalog = Catalog::open_in_memory().unwrap();

        let create = created_event(path.clone());
        let (id, _) = catalog.apply(&create, "a.md").await.unwrap();

        let delete = FileChangeEvent {
            vault_id: "v1".into(),
            absolute_path: path,
            event_kind: EventKind::Deleted,
            timestamp: 1,
        };
        let (deleted_id, deleted_is_dir) = catalog.apply(&delete, "a.md").await.unwrap();
        assert_eq!(deleted_id, id);
        assert!(!deleted_is_dir);

        let by_id = catalog.get_by_id(&id).unwrap().unwrap();
        assert_eq!(by_id.status, FileStatus::Deleted);
        assert!(catalog.get_by_path("a.md", false).unwrap().is_none());
    }

    #[tokio::test]
    async fn round_trip_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let path = touch(&dir, "notes/a.md");
        let catalog = Catalog::open_in_memory().unwrap();

        let event = created_event(path);
        let (id, _) = catalog.apply(&event, "notes/a.md").await.unwrap();

        let entry = catalog.get_by_id(&id).unwrap().unwrap();
        assert_eq!(entry.relative_path, "notes/a.md");
    }

    #[tokio::test]
    async fn ancestor_directories_are_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = touch(&dir, "notes/sub/b.md");
        let catalog = Catalog::open_in_memory().unwrap();

        let event = created_event(path);
        catalog.apply(&event, "notes/sub/b.md").await.unwrap();

        let notes = catalog.get_by_path("notes", false).unwrap().unwrap();
        assert!(notes.is_directory);
        let sub = catalog.get_by_path("notes/sub", false).unwrap().unwrap();
        assert!(sub.is_directory);
        assert_eq!(sub.parent_id.as_deref(), Some(notes.id.as_str()));
    }

    #[test]
    fn mark_all_deleted_is_status_flip_only() {
        let catalog = Catalog::open_in_memory().unwrap();
        let type_id = catalog.get_or_create_file_type("markdown").unwrap();
        let id = catalog
            .upsert_by_path("a.md", "a.md", None, false, type_id, 5, 100)
            .unwrap();

        let affected = catalog.mark_all_deleted().unwrap();
        assert_eq!(affected, 1);

        let entry = catalog.get_by_id(&id).unwrap().unwrap();
        assert_eq!(entry.status, FileStatus::Deleted);
        assert_eq!(entry.id, id);
    }
}
