use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::metadata::{project, project_parts};
use crate::render::links::{extract_note_links, token_refers_to};
use crate::types::{Note, NoteMetadata, NotePatch};

/// Latest schema version understood by this build.
pub const SCHEMA_VERSION: i32 = 3;

/// Durable note storage. The notes cache and the import/backup layers only
/// ever talk to this trait.
#[async_trait]
pub trait NoteStore: Send + Sync {
    /// Metadata ordered by `updated_at` descending. `limit = None` returns everything.
    async fn get_notes_metadata(&self, limit: Option<usize>, offset: usize) -> Result<Vec<NoteMetadata>>;
    async fn count(&self) -> Result<usize>;
    async fn get_note(&self, id: i64) -> Result<Option<Note>>;
    async fn all_notes(&self) -> Result<Vec<Note>>;
    async fn create_note(&self, title: &str, content: &str, pinned: bool) -> Result<i64>;
    /// Insert a note from an export or backup. The id is ignored and a new one assigned.
    async fn import_note(&self, note: &Note) -> Result<i64>;
    /// Apply a patch and touch `updated_at`. Returns false if the note does not exist.
    async fn update_note(&self, id: i64, patch: &NotePatch) -> Result<bool>;
    async fn delete_note(&self, id: i64) -> Result<()>;
    /// Flip the pinned flag, returning the new value.
    async fn toggle_pin(&self, id: i64) -> Result<bool>;
    /// Two-phase search: titles first, then content for the remaining slots.
    async fn search_notes(&self, query: &str, limit: usize) -> Result<Vec<NoteMetadata>>;
    /// Notes whose content holds a `[[...]]` reference to `id`.
    async fn get_backlinks(&self, id: i64) -> Result<Vec<NoteMetadata>>;
}

/// `NoteStore` backed by a local SQLite file.
pub struct SqliteNoteStore {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
}

impl SqliteNoteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Self::from_connection(conn, Arc::new(SystemClock))
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, Arc::new(SystemClock))
    }

    pub fn open_in_memory_with_clock(clock: Arc<dyn Clock>) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, clock)
    }

    /// Wrap an existing connection, migrating it to [`SCHEMA_VERSION`] first.
    pub fn from_connection(mut conn: Connection, clock: Arc<dyn Clock>) -> Result<Self> {
        run_migrations(&mut conn)?;
        Ok(Self { conn: Mutex::new(conn), clock })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::LockPoisoned)
    }
}

pub fn schema_version(conn: &Connection) -> Result<i32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Bring the schema up to date, one version step per transaction.
fn run_migrations(conn: &mut Connection) -> Result<()> {
    let version = schema_version(conn)?;

    if version < 1 {
        let tx = conn.transaction()?;
        tx.execute_batch(
            "CREATE TABLE IF NOT EXISTS notes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL DEFAULT '',
                content TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_notes_title ON notes(title);
            CREATE INDEX IF NOT EXISTS idx_notes_created_at ON notes(created_at);
            CREATE INDEX IF NOT EXISTS idx_notes_updated_at ON notes(updated_at);",
        )?;
        tx.pragma_update(None, "user_version", 1)?;
        tx.commit()?;
    }

    if version < 2 {
        let tx = conn.transaction()?;
        tx.execute_batch(
            "ALTER TABLE notes ADD COLUMN pinned INTEGER NOT NULL DEFAULT 0;
             UPDATE notes SET pinned = 0;
             CREATE INDEX IF NOT EXISTS idx_notes_pinned ON notes(pinned);",
        )?;
        tx.pragma_update(None, "user_version", 2)?;
        tx.commit()?;
    }

    if version < 3 {
        let tx = conn.transaction()?;
        tx.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_notes_pinned_updated ON notes(pinned, updated_at);",
        )?;
        tx.pragma_update(None, "user_version", 3)?;
        tx.commit()?;
    }

    if version > 0 && version < SCHEMA_VERSION {
        tracing::info!("Migrated notes schema from v{version} to v{SCHEMA_VERSION}");
    }
    Ok(())
}

const NOTE_COLUMNS: &str = "id, title, content, created_at, updated_at, pinned";

fn note_from_row(row: &Row<'_>) -> rusqlite::Result<Note> {
    Ok(Note {
        id: row.get(0)?,
        title: row.get::<_, String>(1).unwrap_or_default(),
        content: row.get::<_, String>(2).unwrap_or_default(),
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
        pinned: row.get(5)?,
    })
}

/// Project a row straight to metadata; the content string is dropped with the row.
fn metadata_from_row(row: &Row<'_>) -> rusqlite::Result<NoteMetadata> {
    let title = row.get::<_, String>(1).unwrap_or_default();
    let content = row.get::<_, String>(2).unwrap_or_default();
    Ok(project_parts(row.get(0)?, &title, &content, row.get(3)?, row.get(4)?, row.get(5)?))
}

/// Page of metadata ordered by modification time, most recent first.
pub fn get_notes_metadata(conn: &Connection, limit: Option<usize>, offset: usize) -> Result<Vec<NoteMetadata>> {
    // SQLite treats a negative LIMIT as "no limit".
    let limit = limit.map(|l| l as i64).unwrap_or(-1);
    let mut stmt = conn.prepare(&format!(
        "SELECT {NOTE_COLUMNS} FROM notes
         ORDER BY updated_at DESC, id DESC
         LIMIT ?1 OFFSET ?2"
    ))?;
    let notes = stmt
        .query_map(params![limit, offset as i64], metadata_from_row)?
        .filter_map(|r| {
            r.map_err(|e| tracing::warn!("Skipping malformed row: {e}"))
                .ok()
        })
        .collect();
    Ok(notes)
}

pub fn count_notes(conn: &Connection) -> Result<usize> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM notes", [], |row| row.get(0))?;
    Ok(count as usize)
}

/// Fetch a single note by ID (including content). Returns None if not found.
pub fn get_note_by_id(conn: &Connection, id: i64) -> Result<Option<Note>> {
    let note = conn
        .query_row(
            &format!("SELECT {NOTE_COLUMNS} FROM notes WHERE id = ?1"),
            [id],
            note_from_row,
        )
        .optional()?;
    Ok(note)
}

/// Every note, in insertion order.
pub fn get_all_notes(conn: &Connection) -> Result<Vec<Note>> {
    let mut stmt = conn.prepare(&format!("SELECT {NOTE_COLUMNS} FROM notes ORDER BY id"))?;
    let notes = stmt
        .query_map([], note_from_row)?
        .filter_map(|r| {
            r.map_err(|e| tracing::warn!("Skipping malformed row: {e}"))
                .ok()
        })
        .collect();
    Ok(notes)
}

pub fn insert_note(conn: &Connection, note: &Note) -> Result<i64> {
    conn.execute(
        "INSERT INTO notes (title, content, created_at, updated_at, pinned)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![note.title, note.content, note.created_at, note.updated_at, note.pinned],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Apply a patch. `updated_at` never moves backwards, even if the clock does.
pub fn update_note(conn: &Connection, id: i64, patch: &NotePatch, now_ms: i64) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE notes SET
            title = COALESCE(?1, title),
            content = COALESCE(?2, content),
            pinned = COALESCE(?3, pinned),
            updated_at = MAX(updated_at, ?4)
         WHERE id = ?5",
        params![patch.title, patch.content, patch.pinned, now_ms, id],
    )?;
    Ok(changed > 0)
}

pub fn delete_note(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM notes WHERE id = ?1", [id])?;
    Ok(())
}

fn query_words(query: &str) -> Vec<String> {
    query.to_lowercase().split_whitespace().map(str::to_string).collect()
}

fn matches_any(haystack: &str, words: &[String]) -> bool {
    let haystack = haystack.to_lowercase();
    words.iter().any(|w| haystack.contains(w.as_str()))
}

/// Word-tokenized, case-insensitive substring search.
///
/// Titles are scanned first without loading content. Content is only scanned
/// when the title phase leaves free slots, and skips notes already matched.
pub fn search_notes(conn: &Connection, query: &str, limit: usize) -> Result<Vec<NoteMetadata>> {
    let words = query_words(query);
    if words.is_empty() {
        return get_notes_metadata(conn, Some(limit), 0);
    }

    let mut title_ids = Vec::new();
    {
        let mut stmt = conn.prepare("SELECT id, title FROM notes ORDER BY id")?;
        let mut rows = stmt.query([])?;
        while title_ids.len() < limit {
            let Some(row) = rows.next()? else { break };
            let title: String = row.get::<_, String>(1).unwrap_or_default();
            if matches_any(&title, &words) {
                title_ids.push(row.get::<_, i64>(0)?);
            }
        }
    }

    let mut results = Vec::with_capacity(title_ids.len());
    {
        let mut stmt = conn.prepare(&format!("SELECT {NOTE_COLUMNS} FROM notes WHERE id = ?1"))?;
        for id in &title_ids {
            if let Some(meta) = stmt.query_row([id], metadata_from_row).optional()? {
                results.push(meta);
            }
        }
    }

    if results.len() >= limit {
        return Ok(results);
    }

    let mut remaining = limit - results.len();
    let mut stmt = conn.prepare(&format!("SELECT {NOTE_COLUMNS} FROM notes ORDER BY id"))?;
    let mut rows = stmt.query([])?;
    while remaining > 0 {
        let Some(row) = rows.next()? else { break };
        let id: i64 = row.get(0)?;
        if title_ids.contains(&id) {
            continue;
        }
        let content: String = row.get::<_, String>(2).unwrap_or_default();
        if matches_any(&content, &words) {
            results.push(metadata_from_row(row)?);
            remaining -= 1;
        }
    }

    Ok(results)
}

/// Notes other than `id` that reference it by identity or by title.
pub fn get_backlinks(conn: &Connection, id: i64) -> Result<Vec<NoteMetadata>> {
    let Some(target) = get_note_by_id(conn, id)? else {
        return Ok(Vec::new());
    };

    let mut stmt = conn.prepare(&format!("SELECT {NOTE_COLUMNS} FROM notes WHERE id != ?1 ORDER BY id"))?;
    let backlinks = stmt
        .query_map([id], note_from_row)?
        .filter_map(|r| {
            r.map_err(|e| tracing::warn!("Skipping malformed row: {e}"))
                .ok()
        })
        .filter(|note| {
            extract_note_links(&note.content)
                .iter()
                .any(|token| token_refers_to(token, target.id, &target.title))
        })
        .map(|note| project(&note))
        .collect();
    Ok(backlinks)
}

#[async_trait]
impl NoteStore for SqliteNoteStore {
    async fn get_notes_metadata(&self, limit: Option<usize>, offset: usize) -> Result<Vec<NoteMetadata>> {
        get_notes_metadata(&*self.conn()?, limit, offset)
    }

    async fn count(&self) -> Result<usize> {
        count_notes(&*self.conn()?)
    }

    async fn get_note(&self, id: i64) -> Result<Option<Note>> {
        get_note_by_id(&*self.conn()?, id)
    }

    async fn all_notes(&self) -> Result<Vec<Note>> {
        get_all_notes(&*self.conn()?)
    }

    async fn create_note(&self, title: &str, content: &str, pinned: bool) -> Result<i64> {
        let now = self.clock.now_ms();
        let note = Note {
            id: 0,
            title: title.to_string(),
            content: content.to_string(),
            created_at: now,
            updated_at: now,
            pinned,
        };
        let id = insert_note(&*self.conn()?, &note)?;
        tracing::debug!(id, "Created note");
        Ok(id)
    }

    async fn import_note(&self, note: &Note) -> Result<i64> {
        let now = self.clock.now_ms();
        let mut note = note.clone();
        if note.created_at <= 0 {
            note.created_at = now;
        }
        if note.updated_at < note.created_at {
            note.updated_at = note.created_at;
        }
        insert_note(&*self.conn()?, &note)
    }

    async fn update_note(&self, id: i64, patch: &NotePatch) -> Result<bool> {
        let now = self.clock.now_ms();
        update_note(&*self.conn()?, id, patch, now)
    }

    async fn delete_note(&self, id: i64) -> Result<()> {
        delete_note(&*self.conn()?, id)
    }

    async fn toggle_pin(&self, id: i64) -> Result<bool> {
        let now = self.clock.now_ms();
        let conn = self.conn()?;
        let note = get_note_by_id(&conn, id)?.ok_or(Error::NotFound(id))?;
        let pinned = !note.pinned;
        update_note(&conn, id, &NotePatch::pinned(pinned), now)?;
        Ok(pinned)
    }

    async fn search_notes(&self, query: &str, limit: usize) -> Result<Vec<NoteMetadata>> {
        search_notes(&*self.conn()?, query, limit)
    }

    async fn get_backlinks(&self, id: i64) -> Result<Vec<NoteMetadata>> {
        get_backlinks(&*self.conn()?, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store_with_clock() -> (SqliteNoteStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = SqliteNoteStore::open_in_memory_with_clock(clock.clone()).unwrap();
        (store, clock)
    }

    #[tokio::test]
    async fn fresh_database_is_at_latest_schema() {
        let (store, _) = store_with_clock();
        let conn = store.conn().unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn v1_database_gains_pinned_column() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE notes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL DEFAULT '',
                content TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            INSERT INTO notes (title, content, created_at, updated_at) VALUES ('old', 'body', 1, 2);",
        )
        .unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();

        let store = SqliteNoteStore::from_connection(conn, Arc::new(ManualClock::new(0))).unwrap();
        let note = store.get_note(1).await.unwrap().unwrap();
        assert_eq!(note.title, "old");
        assert!(!note.pinned);
        assert_eq!(schema_version(&store.conn().unwrap()).unwrap(), SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn create_assigns_increasing_ids_and_timestamps() {
        let (store, clock) = store_with_clock();
        let a = store.create_note("A", "", false).await.unwrap();
        clock.advance(5);
        let b = store.create_note("B", "text", true).await.unwrap();
        assert!(b > a);

        let note = store.get_note(b).await.unwrap().unwrap();
        assert_eq!(note.created_at, 1_005);
        assert_eq!(note.updated_at, 1_005);
        assert!(note.pinned);
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn update_touches_only_patched_fields() {
        let (store, clock) = store_with_clock();
        let id = store.create_note("Title", "Body", false).await.unwrap();
        clock.advance(100);

        assert!(store.update_note(id, &NotePatch::content("New body")).await.unwrap());
        let note = store.get_note(id).await.unwrap().unwrap();
        assert_eq!(note.title, "Title");
        assert_eq!(note.content, "New body");
        assert_eq!(note.created_at, 1_000);
        assert_eq!(note.updated_at, 1_100);

        assert!(!store.update_note(999, &NotePatch::title("x")).await.unwrap());
    }

    #[tokio::test]
    async fn updated_at_never_moves_backwards() {
        let (store, clock) = store_with_clock();
        let id = store.create_note("T", "", false).await.unwrap();
        clock.set(500);
        store.update_note(id, &NotePatch::title("T2")).await.unwrap();
        let note = store.get_note(id).await.unwrap().unwrap();
        assert_eq!(note.updated_at, 1_000);
    }

    #[tokio::test]
    async fn metadata_pages_most_recent_first() {
        let (store, clock) = store_with_clock();
        for i in 0..5 {
            clock.advance(10);
            store.create_note(&format!("n{i}"), "some words here", false).await.unwrap();
        }
        let page = store.get_notes_metadata(Some(2), 0).await.unwrap();
        assert_eq!(page.iter().map(|m| m.title.as_str()).collect::<Vec<_>>(), ["n4", "n3"]);
        assert_eq!(page[0].word_count, 3);

        let rest = store.get_notes_metadata(Some(10), 4).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].title, "n0");

        assert_eq!(store.get_notes_metadata(None, 0).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn toggle_pin_flips_and_reports() {
        let (store, _) = store_with_clock();
        let id = store.create_note("T", "", false).await.unwrap();
        assert!(store.toggle_pin(id).await.unwrap());
        assert!(!store.toggle_pin(id).await.unwrap());
        assert!(matches!(store.toggle_pin(42).await, Err(Error::NotFound(42))));
    }

    #[tokio::test]
    async fn search_prefers_title_matches() {
        let (store, _) = store_with_clock();
        store.create_note("Groceries", "milk", false).await.unwrap(); // 1
        store.create_note("Ideas", "nothing", false).await.unwrap(); // 2
        store.create_note("Hello World", "greeting", false).await.unwrap(); // 3
        store.create_note("Misc", "other", false).await.unwrap(); // 4
        store.create_note("Chat", "say hello", false).await.unwrap(); // 5

        let results = store.search_notes("hello", 100).await.unwrap();
        assert_eq!(results.iter().map(|m| m.id).collect::<Vec<_>>(), [3, 5]);
    }

    #[tokio::test]
    async fn search_matches_any_word_and_respects_limit() {
        let (store, _) = store_with_clock();
        store.create_note("alpha", "", false).await.unwrap();
        store.create_note("beta", "", false).await.unwrap();
        store.create_note("gamma", "alpha inside", false).await.unwrap();

        let results = store.search_notes("ALPHA beta", 100).await.unwrap();
        assert_eq!(results.iter().map(|m| m.id).collect::<Vec<_>>(), [1, 2, 3]);

        let limited = store.search_notes("alpha beta", 2).await.unwrap();
        assert_eq!(limited.iter().map(|m| m.id).collect::<Vec<_>>(), [1, 2]);
    }

    #[tokio::test]
    async fn blank_search_returns_recent_notes() {
        let (store, clock) = store_with_clock();
        store.create_note("a", "", false).await.unwrap();
        clock.advance(1);
        store.create_note("b", "", false).await.unwrap();
        let results = store.search_notes("   ", 10).await.unwrap();
        assert_eq!(results[0].title, "b");
    }

    #[tokio::test]
    async fn backlinks_by_id_and_title() {
        let (store, _) = store_with_clock();
        let target = store.create_note("Project Plan", "", false).await.unwrap();
        let by_id = store.create_note("ref id", &format!("see [[{target}]]"), false).await.unwrap();
        let by_title = store.create_note("ref title", "see [[project plan]]", false).await.unwrap();
        store.create_note("unrelated", "see [[other]]", false).await.unwrap();

        let links = store.get_backlinks(target).await.unwrap();
        assert_eq!(links.iter().map(|m| m.id).collect::<Vec<_>>(), [by_id, by_title]);
        assert!(store.get_backlinks(999).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn import_keeps_timestamps_and_assigns_new_id() {
        let (store, _) = store_with_clock();
        store.create_note("existing", "", false).await.unwrap();
        let imported = Note {
            id: 1,
            title: "Imported".into(),
            content: "c".into(),
            created_at: 50,
            updated_at: 60,
            pinned: true,
        };
        let id = store.import_note(&imported).await.unwrap();
        assert_ne!(id, 1);
        let note = store.get_note(id).await.unwrap().unwrap();
        assert_eq!((note.created_at, note.updated_at, note.pinned), (50, 60, true));
    }

    #[tokio::test]
    async fn file_database_persists_between_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("notes.sqlite");
        {
            let store = SqliteNoteStore::open(&path).unwrap();
            store.create_note("kept", "on disk", false).await.unwrap();
        }
        let store = SqliteNoteStore::open(&path).unwrap();
        assert_eq!(store.all_notes().await.unwrap()[0].title, "kept");
    }
}
