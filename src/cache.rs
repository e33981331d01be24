//! In-memory, paginated projection of note metadata for list rendering.
//!
//! Edits are applied to the projection immediately and persisted to the store
//! after a quiet period. The store stays authoritative: whenever a write fails
//! the whole projection is reloaded from it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::db::NoteStore;
use crate::error::Result;
use crate::metadata::{project_parts, refresh_content_fields};
use crate::types::{Note, NoteMetadata, NotePatch};

/// Order used everywhere notes are listed: pinned first, then most recently updated.
pub fn sort_notes(notes: &mut [NoteMetadata]) {
    notes.sort_by(|a, b| b.pinned.cmp(&a.pinned).then(b.updated_at.cmp(&a.updated_at)));
}

/// Merge fetched entries into `notes`, replacing any entry with the same id.
fn merge_by_id(notes: &mut Vec<NoteMetadata>, incoming: Vec<NoteMetadata>) {
    let mut index: HashMap<i64, usize> = notes.iter().enumerate().map(|(i, m)| (m.id, i)).collect();
    for meta in incoming {
        match index.get(&meta.id) {
            Some(&i) => notes[i] = meta,
            None => {
                index.insert(meta.id, notes.len());
                notes.push(meta);
            }
        }
    }
}

fn apply_to_metadata(meta: &mut NoteMetadata, patch: &NotePatch, now_ms: i64) {
    if let Some(title) = &patch.title {
        meta.title = title.clone();
    }
    if let Some(content) = &patch.content {
        refresh_content_fields(meta, content);
    }
    if let Some(pinned) = patch.pinned {
        meta.pinned = pinned;
    }
    meta.updated_at = meta.updated_at.max(now_ms);
}

/// Everything the list UI reads.
#[derive(Debug, Clone)]
pub struct CacheState {
    /// Sorted, deduplicated metadata for the visible list.
    pub notes: Vec<NoteMetadata>,
    /// Full note currently open in the editor.
    pub current: Option<Note>,
    /// Number of notes in the store, refreshed on reset.
    pub total_count: usize,
    /// False once a page fetch returned fewer rows than the page size.
    pub has_more: bool,
    pub is_loading: bool,
    /// Active search filter. Empty means the unfiltered, paginated view.
    pub search_query: String,
    /// Number of pages fetched since the last reset.
    page: usize,
    /// Query string → (fetched at, sorted results).
    search_cache: HashMap<String, (i64, Vec<NoteMetadata>)>,
}

impl Default for CacheState {
    fn default() -> Self {
        Self {
            notes: Vec::new(),
            current: None,
            total_count: 0,
            has_more: true,
            is_loading: false,
            search_query: String::new(),
            page: 0,
            search_cache: HashMap::new(),
        }
    }
}

struct PendingWrite {
    generation: u64,
    patch: NotePatch,
    handle: JoinHandle<()>,
}

struct PendingSearch {
    handle: JoinHandle<()>,
}

struct Inner {
    store: Arc<dyn NoteStore>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    state: Mutex<CacheState>,
    /// At most one scheduled write per note id.
    pending_writes: StdMutex<HashMap<i64, PendingWrite>>,
    pending_search: StdMutex<Option<PendingSearch>>,
    generation: AtomicU64,
}

/// Cheap to clone; clones share the same state and timers.
#[derive(Clone)]
pub struct NotesCache {
    inner: Arc<Inner>,
}

fn lock_sync<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl NotesCache {
    pub fn new(store: Arc<dyn NoteStore>, clock: Arc<dyn Clock>, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                clock,
                config,
                state: Mutex::new(CacheState::default()),
                pending_writes: StdMutex::new(HashMap::new()),
                pending_search: StdMutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn NoteStore> {
        &self.inner.store
    }

    /// Copy of the current state.
    pub async fn snapshot(&self) -> CacheState {
        self.inner.state.lock().await.clone()
    }

    pub async fn notes(&self) -> Vec<NoteMetadata> {
        self.inner.state.lock().await.notes.clone()
    }

    pub async fn current(&self) -> Option<Note> {
        self.inner.state.lock().await.current.clone()
    }

    pub async fn total_count(&self) -> usize {
        self.inner.state.lock().await.total_count
    }

    pub async fn has_more(&self) -> bool {
        self.inner.state.lock().await.has_more
    }

    pub async fn is_loading(&self) -> bool {
        self.inner.state.lock().await.is_loading
    }

    pub async fn search_query(&self) -> String {
        self.inner.state.lock().await.search_query.clone()
    }

    /// Number of notes with a write still waiting for its debounce window.
    pub fn pending_write_count(&self) -> usize {
        lock_sync(&self.inner.pending_writes).len()
    }

    /// Fetch the next page (or the first page again when `reset`) and merge it in.
    pub async fn load_page(&self, reset: bool) {
        let page_size = self.inner.config.page_size;
        let (offset, refresh_count) = {
            let mut state = self.inner.state.lock().await;
            if reset {
                state.notes.clear();
                state.page = 0;
                state.has_more = true;
            }
            state.is_loading = true;
            (state.page * page_size, reset || state.notes.is_empty())
        };

        let page = self.inner.store.get_notes_metadata(Some(page_size), offset).await;
        let count = if refresh_count { Some(self.inner.store.count().await) } else { None };

        let mut state = self.inner.state.lock().await;
        state.is_loading = false;
        match page {
            Ok(mut page) => {
                let fetched = page.len();
                self.overlay_pending(&mut page);
                merge_by_id(&mut state.notes, page);
                sort_notes(&mut state.notes);
                state.page += 1;
                state.has_more = fetched >= page_size;
                tracing::debug!(fetched, offset, "Loaded notes page");
            }
            Err(e) => tracing::error!("Failed to load notes: {e}"),
        }
        match count {
            Some(Ok(total)) => state.total_count = total,
            Some(Err(e)) => tracing::error!("Failed to count notes: {e}"),
            None => {}
        }
    }

    /// Next page, unless a load is running, everything is loaded, or a filter is active.
    pub async fn load_more(&self) {
        {
            let state = self.inner.state.lock().await;
            if state.is_loading || !state.has_more || !state.search_query.is_empty() {
                return;
            }
        }
        self.load_page(false).await;
    }

    /// Drop any filter and cached search results and rebuild from the store.
    pub async fn reload(&self) {
        self.cancel_pending_search();
        {
            let mut state = self.inner.state.lock().await;
            state.search_query.clear();
            state.search_cache.clear();
        }
        self.load_page(true).await;
    }

    pub async fn open(&self, id: i64) {
        match self.inner.store.get_note(id).await {
            Ok(mut note) => {
                // A write still waiting out its debounce is newer than the store.
                if let Some(note) = note.as_mut() {
                    let pending = lock_sync(&self.inner.pending_writes);
                    if let Some(write) = pending.get(&id) {
                        write.patch.apply_to(note);
                    }
                }
                self.inner.state.lock().await.current = note;
            }
            Err(e) => tracing::error!("Failed to load note {id}: {e}"),
        }
    }

    pub async fn close(&self) {
        self.inner.state.lock().await.current = None;
    }

    /// Create a note and show it without reloading the list.
    pub async fn create(&self, title: &str, content: &str) -> Result<i64> {
        let id = self.inner.store.create_note(title, content, false).await?;

        let filtered = {
            let mut state = self.inner.state.lock().await;
            state.search_cache.clear();
            !state.search_query.is_empty()
        };
        if filtered {
            // Whether the new note matches the filter is not worth deciding here.
            self.reload().await;
            return Ok(id);
        }

        let now = self.inner.clock.now_ms();
        let meta = project_parts(id, title, content, now, now, false);
        let page_size = self.inner.config.page_size;

        let mut state = self.inner.state.lock().await;
        let visible = state.notes.len();
        state.notes.retain(|m| m.id != id);
        state.notes.push(meta);
        sort_notes(&mut state.notes);
        if state.has_more && visible > 0 && visible % page_size == 0 {
            state.notes.truncate(visible);
        }
        state.total_count += 1;
        Ok(id)
    }

    /// Apply `patch` locally right away; persist it once edits to `id` go quiet.
    pub async fn update(&self, id: i64, patch: NotePatch) {
        if patch.is_empty() {
            return;
        }
        let now = self.inner.clock.now_ms();
        {
            let mut state = self.inner.state.lock().await;
            if let Some(meta) = state.notes.iter_mut().find(|m| m.id == id) {
                apply_to_metadata(meta, &patch, now);
            }
            if let Some(current) = state.current.as_mut().filter(|n| n.id == id) {
                patch.apply_to(current);
                current.updated_at = current.updated_at.max(now);
            }
            sort_notes(&mut state.notes);
            state.search_cache.clear();
        }
        self.schedule_write(id, patch);
    }

    fn schedule_write(&self, id: i64, patch: NotePatch) {
        let mut pending = lock_sync(&self.inner.pending_writes);
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let patch = match pending.remove(&id) {
            Some(previous) => {
                previous.handle.abort();
                let mut merged = previous.patch;
                merged.merge(patch);
                merged
            }
            None => patch,
        };

        let cache = self.clone();
        let delay = self.inner.config.update_debounce();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            cache.flush_write(id, generation).await;
        });
        pending.insert(id, PendingWrite { generation, patch, handle });
    }

    async fn flush_write(&self, id: i64, generation: u64) {
        let patch = {
            let mut pending = lock_sync(&self.inner.pending_writes);
            // Superseded timers find a newer generation and leave it alone.
            if pending.get(&id).map(|w| w.generation) == Some(generation) {
                pending.remove(&id).map(|w| w.patch)
            } else {
                None
            }
        };
        let Some(patch) = patch else {
            return;
        };

        match self.inner.store.update_note(id, &patch).await {
            Ok(true) => tracing::debug!(id, "Saved note"),
            Ok(false) => tracing::warn!(id, "Note disappeared before its edits were saved"),
            Err(e) => {
                tracing::error!("Failed to update note {id}: {e}");
                self.reload().await;
            }
        }
    }

    /// Layer writes still waiting out their debounce over freshly fetched rows.
    fn overlay_pending(&self, notes: &mut [NoteMetadata]) {
        let pending = lock_sync(&self.inner.pending_writes);
        if pending.is_empty() {
            return;
        }
        let now = self.inner.clock.now_ms();
        for meta in notes.iter_mut() {
            if let Some(write) = pending.get(&meta.id) {
                apply_to_metadata(meta, &write.patch, now);
            }
        }
    }

    fn cancel_pending_write(&self, id: i64) {
        if let Some(write) = lock_sync(&self.inner.pending_writes).remove(&id) {
            write.handle.abort();
        }
    }

    /// Remove a note locally, then from the store.
    pub async fn delete(&self, id: i64) {
        self.cancel_pending_write(id);
        let was_listed = {
            let mut state = self.inner.state.lock().await;
            let before = state.notes.len();
            state.notes.retain(|m| m.id != id);
            let was_listed = state.notes.len() < before;
            if was_listed {
                state.total_count = state.total_count.saturating_sub(1);
            }
            if state.current.as_ref().is_some_and(|n| n.id == id) {
                state.current = None;
            }
            state.search_cache.clear();
            was_listed
        };

        match self.inner.store.delete_note(id).await {
            // Not on a loaded page, so the store decides whether anything went.
            Ok(()) if !was_listed => self.refresh_count().await,
            Ok(()) => {}
            Err(e) => {
                tracing::error!("Failed to delete note {id}: {e}");
                self.reload().await;
            }
        }
    }

    async fn refresh_count(&self) {
        match self.inner.store.count().await {
            Ok(total) => self.inner.state.lock().await.total_count = total,
            Err(e) => tracing::error!("Failed to count notes: {e}"),
        }
    }

    /// Flip a note's pin. The new value is written as an absolute state so a
    /// pending edit carrying `pinned` cannot undo it.
    pub async fn toggle_pin(&self, id: i64) {
        let now = self.inner.clock.now_ms();
        let listed = {
            let mut state = self.inner.state.lock().await;
            let mut pinned = None;
            if let Some(meta) = state.notes.iter_mut().find(|m| m.id == id) {
                meta.pinned = !meta.pinned;
                meta.updated_at = meta.updated_at.max(now);
                pinned = Some(meta.pinned);
            }
            if let Some(current) = state.current.as_mut().filter(|n| n.id == id) {
                current.pinned = pinned.unwrap_or(!current.pinned);
                current.updated_at = current.updated_at.max(now);
                pinned = Some(current.pinned);
            }
            sort_notes(&mut state.notes);
            state.search_cache.clear();
            pinned
        };

        let pinned = match listed {
            Some(pinned) => pinned,
            None => match self.unlisted_pin(id).await {
                Some(pinned) => !pinned,
                None => return,
            },
        };

        if let Some(write) = lock_sync(&self.inner.pending_writes).get_mut(&id) {
            if write.patch.pinned.is_some() {
                write.patch.pinned = Some(pinned);
            }
        }

        match self.inner.store.update_note(id, &NotePatch::pinned(pinned)).await {
            Ok(true) => tracing::debug!(id, pinned, "Saved pin"),
            Ok(false) => tracing::warn!(id, "Cannot pin a note that does not exist"),
            Err(e) => {
                tracing::error!("Failed to toggle pin on note {id}: {e}");
                self.reload().await;
            }
        }
    }

    /// Pin state of a note that is neither listed nor open, unsaved edits included.
    async fn unlisted_pin(&self, id: i64) -> Option<bool> {
        let pending = lock_sync(&self.inner.pending_writes).get(&id).and_then(|w| w.patch.pinned);
        if pending.is_some() {
            return pending;
        }
        match self.inner.store.get_note(id).await {
            Ok(Some(note)) => Some(note.pinned),
            Ok(None) => {
                tracing::warn!(id, "Cannot pin a note that does not exist");
                None
            }
            Err(e) => {
                tracing::error!("Failed to load note {id}: {e}");
                None
            }
        }
    }

    /// Filter the list. An empty query returns to the paginated view; anything
    /// else runs after the search debounce, newest query wins.
    pub async fn search(&self, query: &str) {
        self.cancel_pending_search();

        if query.trim().is_empty() {
            self.inner.state.lock().await.search_query.clear();
            self.load_page(true).await;
            return;
        }

        let query = query.to_string();
        self.inner.state.lock().await.search_query = query.clone();

        let cache = self.clone();
        let delay = self.inner.config.search_debounce();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            cache.run_search(query).await;
        });
        *lock_sync(&self.inner.pending_search) = Some(PendingSearch { handle });
    }

    fn cancel_pending_search(&self) {
        if let Some(search) = lock_sync(&self.inner.pending_search).take() {
            search.handle.abort();
        }
    }

    async fn run_search(&self, query: String) {
        let now = self.inner.clock.now_ms();
        {
            let mut state = self.inner.state.lock().await;
            if state.search_query != query {
                return;
            }
            let fresh = state
                .search_cache
                .get(&query)
                .filter(|(at, _)| now - at < self.inner.config.search_cache_ttl_ms)
                .map(|(_, results)| results.clone());
            if let Some(results) = fresh {
                tracing::debug!("Search cache hit");
                state.notes = results;
                state.has_more = false;
                return;
            }
            state.is_loading = true;
        }

        let results = self.inner.store.search_notes(&query, self.inner.config.search_limit).await;

        let mut state = self.inner.state.lock().await;
        state.is_loading = false;
        match results {
            Ok(mut results) => {
                self.overlay_pending(&mut results);
                sort_notes(&mut results);
                state.search_cache.insert(query.clone(), (now, results.clone()));
                if state.search_query == query {
                    state.notes = results;
                    state.has_more = false;
                }
            }
            Err(e) => tracing::error!("Search failed: {e}"),
        }
    }
}
