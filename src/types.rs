use serde::{Deserialize, Serialize};

/// A full note record as held by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    /// Assigned by the store on creation. Absent in hand-written import files.
    #[serde(default)]
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub created_at: i64, // Unix timestamp in ms
    #[serde(default)]
    pub updated_at: i64, // Unix timestamp in ms
    #[serde(default)]
    pub pinned: bool,
}

/// Lightweight note metadata kept in the in-memory list cache.
/// Content is not stored; only the preview and counts derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteMetadata {
    pub id: i64,
    pub title: String,
    pub preview: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub pinned: bool,
    pub word_count: usize,
    pub char_count: usize,
    pub char_count_no_spaces: usize,
}

/// Partial update of a note. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotePatch {
    pub title: Option<String>,
    pub content: Option<String>,
    pub pinned: Option<bool>,
}

impl NotePatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self { title: Some(title.into()), ..Self::default() }
    }

    pub fn content(content: impl Into<String>) -> Self {
        Self { content: Some(content.into()), ..Self::default() }
    }

    pub fn pinned(pinned: bool) -> Self {
        Self { pinned: Some(pinned), ..Self::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.content.is_none() && self.pinned.is_none()
    }

    /// Fold a newer patch into this one; fields set in `newer` win.
    pub fn merge(&mut self, newer: NotePatch) {
        if newer.title.is_some() {
            self.title = newer.title;
        }
        if newer.content.is_some() {
            self.content = newer.content;
        }
        if newer.pinned.is_some() {
            self.pinned = newer.pinned;
        }
    }

    /// Apply the patch to a full note in place (timestamps are not touched).
    pub fn apply_to(&self, note: &mut Note) {
        if let Some(title) = &self.title {
            note.title = title.clone();
        }
        if let Some(content) = &self.content {
            note.content = content.clone();
        }
        if let Some(pinned) = self.pinned {
            note.pinned = pinned;
        }
    }
}

/// Word and character counts for a piece of note content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextStats {
    pub word_count: usize,
    pub char_count: usize,
    pub char_count_no_spaces: usize,
}

/// `{id, title}` pair used to resolve `[[...]]` references while rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteLink {
    pub id: i64,
    pub title: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_older_fields_not_overridden() {
        let mut patch = NotePatch::title("Draft");
        patch.merge(NotePatch::content("body"));
        patch.merge(NotePatch::title("Final"));

        assert_eq!(patch.title.as_deref(), Some("Final"));
        assert_eq!(patch.content.as_deref(), Some("body"));
        assert_eq!(patch.pinned, None);
    }

    #[test]
    fn note_json_uses_camel_case_and_defaults() {
        let json = r#"{"title":"T","createdAt":1,"updatedAt":2}"#;
        let note: Note = serde_json::from_str(json).unwrap();
        assert_eq!(note.id, 0);
        assert_eq!(note.content, "");
        assert!(!note.pinned);

        let out = serde_json::to_value(&note).unwrap();
        assert_eq!(out["updatedAt"], 2);
    }
}
