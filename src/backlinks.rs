use crate::render::links::{extract_note_links, token_refers_to};
use crate::types::Note;

/// Notes that reference `target_id` through `[[id]]` or `[[title]]`.
///
/// Scans every note's content, so cost grows with the total amount of text.
/// Fine for a single user's local collection.
pub fn backlinks(target_id: i64, notes: &[Note]) -> Vec<&Note> {
    let Some(target) = notes.iter().find(|n| n.id == target_id) else {
        return Vec::new();
    };

    notes
        .iter()
        .filter(|note| note.id != target_id)
        .filter(|note| {
            extract_note_links(&note.content)
                .iter()
                .any(|token| token_refers_to(token, target.id, &target.title))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(id: i64, title: &str, content: &str) -> Note {
        Note {
            id,
            title: title.into(),
            content: content.into(),
            created_at: 0,
            updated_at: 0,
            pinned: false,
        }
    }

    #[test]
    fn finds_reference_by_id() {
        let notes = vec![note(1, "A", "see [[2]]"), note(2, "B", "hi")];
        let links = backlinks(2, &notes);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].id, 1);
    }

    #[test]
    fn finds_reference_by_title_case_insensitively() {
        let notes = vec![
            note(1, "Reading List", ""),
            note(2, "x", "todo: [[reading list]]"),
            note(3, "y", "[[Reading]] is not a match"),
        ];
        let ids: Vec<i64> = backlinks(1, &notes).iter().map(|n| n.id).collect();
        assert_eq!(ids, [2]);
    }

    #[test]
    fn self_references_and_unknown_targets_are_ignored() {
        let notes = vec![note(1, "A", "me: [[1]] [[A]]")];
        assert!(backlinks(1, &notes).is_empty());
        assert!(backlinks(9, &notes).is_empty());
    }
}
