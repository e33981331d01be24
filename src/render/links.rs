//! `[[...]]` cross-note references.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use super::escape_html;
use crate::types::NoteLink;

fn link_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\[([^\]]+)\]\]").expect("link pattern is valid"))
}

/// Lookup table of `{id, title}` pairs the renderer resolves references against.
///
/// Immutable once built; callers build a new table when notes change. The
/// fingerprint lets render caches tell two tables apart without comparing them.
#[derive(Debug, Clone)]
pub struct NoteLinkTable {
    links: Vec<NoteLink>,
    by_id: HashMap<i64, usize>,
    by_title: HashMap<String, usize>,
    fingerprint: blake3::Hash,
}

impl NoteLinkTable {
    pub fn new(links: Vec<NoteLink>) -> Self {
        let mut by_id = HashMap::with_capacity(links.len());
        let mut by_title = HashMap::with_capacity(links.len());
        let mut hasher = blake3::Hasher::new();
        for (idx, link) in links.iter().enumerate() {
            by_id.entry(link.id).or_insert(idx);
            by_title.entry(link.title.to_lowercase()).or_insert(idx);
            hasher.update(&link.id.to_le_bytes());
            hasher.update(link.title.as_bytes());
            hasher.update(&[0]);
        }
        Self { links, by_id, by_title, fingerprint: hasher.finalize() }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn fingerprint(&self) -> blake3::Hash {
        self.fingerprint
    }

    /// Resolve a reference token: exact identity first, then case-insensitive title.
    pub fn resolve(&self, token: &str) -> Option<&NoteLink> {
        let by_id = token
            .parse::<i64>()
            .ok()
            .filter(|id| id.to_string() == token)
            .and_then(|id| self.by_id.get(&id));
        by_id
            .or_else(|| self.by_title.get(&token.to_lowercase()))
            .map(|&idx| &self.links[idx])
    }
}

impl Default for NoteLinkTable {
    fn default() -> Self {
        Self::empty()
    }
}

impl FromIterator<NoteLink> for NoteLinkTable {
    fn from_iter<I: IntoIterator<Item = NoteLink>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// All raw reference tokens in a Markdown source, in order of appearance.
pub fn extract_note_links(markdown: &str) -> Vec<String> {
    link_regex()
        .captures_iter(markdown)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// True when `token` points at the note `(id, title)`.
pub fn token_refers_to(token: &str, id: i64, title: &str) -> bool {
    token == id.to_string() || token.to_lowercase() == title.to_lowercase()
}

/// Escape a text run, turning every `[[token]]` into a note link or a
/// missing-reference marker. Returns `None` when the text has no references.
pub(crate) fn link_text(text: &str, table: &NoteLinkTable) -> Option<String> {
    let re = link_regex();
    if !re.is_match(text) {
        return None;
    }

    let mut out = String::with_capacity(text.len() + 64);
    let mut last = 0;
    for cap in re.captures_iter(text) {
        let (Some(whole), Some(token)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        out.push_str(&escape_html(&text[last..whole.start()]));
        let token = token.as_str();
        match table.resolve(token) {
            Some(link) => out.push_str(&format!(
                r##"<a href="#/note/{id}" class="note-link" data-note-id="{id}">{title}</a>"##,
                id = link.id,
                title = escape_html(&link.title),
            )),
            None => {
                let token = escape_html(token);
                out.push_str(&format!(
                    r#"<span class="note-link-missing" title="Note not found: {token}">[[{token}]]</span>"#
                ));
            }
        }
        last = whole.end();
    }
    out.push_str(&escape_html(&text[last..]));
    Some(out)
}
