//! JSON and Markdown export/import of the whole note collection.

use std::sync::OnceLock;

use chrono::{DateTime, Local, SecondsFormat, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::db::NoteStore;
use crate::error::{Error, Result};
use crate::types::Note;

pub const EXPORT_VERSION: u32 = 1;

const MARKDOWN_HEADER: &str = "# MindNote Export";
const PINNED_MARKER: &str = "📌 **Pinned**";
const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportEnvelope<'a> {
    version: u32,
    export_date: String,
    notes: &'a [Note],
}

#[derive(Debug, Deserialize)]
struct ImportEnvelope {
    #[serde(default)]
    notes: Vec<Note>,
}

fn local_date(ms: i64) -> String {
    match Local.timestamp_millis_opt(ms).single() {
        Some(date) => date.format(DATE_FORMAT).to_string(),
        None => ms.to_string(),
    }
}

/// Pretty-printed `{version, exportDate, notes}` document.
pub fn notes_to_json(notes: &[Note], exported_at: DateTime<Utc>) -> Result<String> {
    let envelope = ExportEnvelope {
        version: EXPORT_VERSION,
        export_date: exported_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        notes,
    };
    Ok(serde_json::to_string_pretty(&envelope)?)
}

pub fn notes_to_markdown(notes: &[Note], exported_at: DateTime<Local>) -> String {
    let mut out = format!(
        "{MARKDOWN_HEADER}\n\nExported on: {}\n\nTotal Notes: {}\n\n---\n\n",
        exported_at.format(DATE_FORMAT),
        notes.len()
    );
    for note in notes {
        out.push_str(&format!("## {}\n\n", note.title));
        out.push_str(&format!("*Updated: {}*", local_date(note.updated_at)));
        if note.pinned {
            out.push(' ');
            out.push_str(PINNED_MARKER);
        }
        out.push_str(&format!("\n\n{}\n\n---\n\n", note.content));
    }
    out
}

/// Notes from a JSON export. Ids are dropped so the store assigns fresh ones.
pub fn notes_from_json(json: &str) -> Result<Vec<Note>> {
    let envelope: ImportEnvelope = serde_json::from_str(json).map_err(|e| {
        tracing::warn!("JSON import rejected: {e}");
        Error::InvalidImport("Invalid JSON format".into())
    })?;
    Ok(envelope
        .notes
        .into_iter()
        .map(|note| Note { id: 0, ..note })
        .collect())
}

fn section_separator() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n---\n+").expect("separator pattern is valid"))
}

fn title_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"##\s+(.+)").expect("title pattern is valid"))
}

fn content_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\*Updated:.*\*.*?\n\n([\s\S]+)").expect("content pattern is valid"))
}

/// Notes from a Markdown export. Sections without a `##` title are skipped;
/// a missing metadata line just means empty content.
pub fn notes_from_markdown(markdown: &str) -> Vec<Note> {
    let mut notes = Vec::new();
    for section in section_separator().split(markdown) {
        if section.trim().is_empty() || section.contains(MARKDOWN_HEADER) {
            continue;
        }
        let Some(title) = title_pattern().captures(section).map(|c| c[1].trim().to_string()) else {
            tracing::warn!("Skipping Markdown section without a title");
            continue;
        };
        if title.is_empty() {
            continue;
        }
        let content = content_pattern()
            .captures(section)
            .map(|c| c[1].trim().to_string())
            .unwrap_or_default();
        notes.push(Note {
            id: 0,
            title,
            content,
            created_at: 0,
            updated_at: 0,
            pinned: section.contains(PINNED_MARKER),
        });
    }
    notes
}

pub async fn export_json(store: &dyn NoteStore) -> Result<String> {
    let notes = store.all_notes().await?;
    notes_to_json(&notes, Utc::now())
}

pub async fn export_markdown(store: &dyn NoteStore) -> Result<String> {
    let notes = store.all_notes().await?;
    Ok(notes_to_markdown(&notes, Local::now()))
}

/// Import a JSON export, keeping each note's timestamps. Returns the number imported.
pub async fn import_json(store: &dyn NoteStore, json: &str) -> Result<usize> {
    let notes = notes_from_json(json)?;
    for note in &notes {
        store.import_note(note).await?;
    }
    tracing::debug!(count = notes.len(), "Imported notes from JSON");
    Ok(notes.len())
}

/// Import a Markdown export as new notes. Returns the number imported.
pub async fn import_markdown(store: &dyn NoteStore, markdown: &str) -> Result<usize> {
    let notes = notes_from_markdown(markdown);
    for note in &notes {
        store.create_note(&note.title, &note.content, note.pinned).await?;
    }
    tracing::debug!(count = notes.len(), "Imported notes from Markdown");
    Ok(notes.len())
}
