//! Derives list-display metadata from full notes.
//!
//! Both the store (when paging) and the cache (when applying optimistic
//! edits) call into this module, so the same content always yields the same
//! preview and counts.

use crate::types::{Note, NoteMetadata, TextStats};

/// Number of characters of content kept as the list preview.
pub const PREVIEW_CHARS: usize = 150;

pub fn text_stats(content: &str) -> TextStats {
    TextStats {
        word_count: content.split_whitespace().count(),
        char_count: content.chars().count(),
        char_count_no_spaces: content.chars().filter(|c| !c.is_whitespace()).count(),
    }
}

/// First `PREVIEW_CHARS` characters, then trimmed. Not word-boundary aware.
pub fn preview(content: &str) -> String {
    let head: String = content.chars().take(PREVIEW_CHARS).collect();
    head.trim().to_string()
}

pub fn project(note: &Note) -> NoteMetadata {
    project_parts(note.id, &note.title, &note.content, note.created_at, note.updated_at, note.pinned)
}

/// Same as [`project`] but from borrowed row fields, so callers streaming rows
/// out of the database never have to build a `Note`.
pub fn project_parts(
    id: i64,
    title: &str,
    content: &str,
    created_at: i64,
    updated_at: i64,
    pinned: bool,
) -> NoteMetadata {
    let stats = text_stats(content);
    NoteMetadata {
        id,
        title: title.to_string(),
        preview: preview(content),
        created_at,
        updated_at,
        pinned,
        word_count: stats.word_count,
        char_count: stats.char_count,
        char_count_no_spaces: stats.char_count_no_spaces,
    }
}

/// Refresh the content-derived fields of an existing metadata entry.
pub fn refresh_content_fields(meta: &mut NoteMetadata, content: &str) {
    let stats = text_stats(content);
    meta.preview = preview(content);
    meta.word_count = stats.word_count;
    meta.char_count = stats.char_count;
    meta.char_count_no_spaces = stats.char_count_no_spaces;
}
