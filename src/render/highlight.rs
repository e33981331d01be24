use std::sync::Arc;

use syntect::html::{ClassStyle, ClassedHTMLGenerator};
use syntect::parsing::SyntaxSet;
use syntect::util::LinesWithEndings;

use super::cache::BoundedCache;
use super::escape_html;
use crate::clock::Clock;

/// Prefix for the CSS classes emitted on highlighted spans.
pub const CLASS_PREFIX: &str = "hl-";

/// Syntax highlighting for fenced code blocks, cached by (language, code).
pub struct CodeHighlighter {
    syntax_set: SyntaxSet,
    cache: BoundedCache<(String, String), String>,
}

impl CodeHighlighter {
    pub fn new(cache_size: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            syntax_set: SyntaxSet::load_defaults_newlines(),
            cache: BoundedCache::new(cache_size, None, clock),
        }
    }

    /// Full `<pre><code>` block for a fenced code block.
    pub fn code_block(&mut self, lang: &str, code: &str) -> String {
        let body = self.highlight(lang, code);
        if lang.is_empty() {
            format!("<pre class=\"code-block\"><code>{body}</code></pre>\n")
        } else {
            format!(
                "<pre class=\"code-block\"><code class=\"language-{}\">{body}</code></pre>\n",
                escape_html(lang)
            )
        }
    }

    pub fn highlight(&mut self, lang: &str, code: &str) -> String {
        let key = (lang.to_string(), code.to_string());
        if let Some(hit) = self.cache.get(&key) {
            return hit.clone();
        }
        let html = self.highlight_uncached(lang, code);
        self.cache.insert(key, html.clone());
        html
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    fn highlight_uncached(&self, lang: &str, code: &str) -> String {
        let syntax = self
            .syntax_set
            .find_syntax_by_token(lang)
            .or_else(|| self.syntax_set.find_syntax_by_extension(lang))
            .unwrap_or_else(|| self.syntax_set.find_syntax_plain_text());

        let mut generator = ClassedHTMLGenerator::new_with_class_style(
            syntax,
            &self.syntax_set,
            ClassStyle::SpacedPrefixed { prefix: CLASS_PREFIX },
        );
        for line in LinesWithEndings::from(code) {
            if let Err(e) = generator.parse_html_for_line_which_includes_newline(line) {
                tracing::debug!("Highlighting failed for {lang}: {e}");
                return escape_html(code);
            }
        }
        generator.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn highlighter(size: usize) -> CodeHighlighter {
        CodeHighlighter::new(size, Arc::new(ManualClock::new(0)))
    }

    #[test]
    fn known_language_gets_classes() {
        let mut h = highlighter(8);
        let html = h.code_block("rust", "fn main() {}\n");
        assert!(html.starts_with("<pre class=\"code-block\"><code class=\"language-rust\">"));
        assert!(html.contains("hl-"));
        assert!(html.contains("main"));
    }

    #[test]
    fn unknown_language_is_escaped_plain_text() {
        let mut h = highlighter(8);
        let html = h.highlight("no-such-lang", "a < b\n");
        assert!(html.contains("a &lt; b"));
        assert!(!html.contains("a < b"));
    }

    #[test]
    fn cache_is_bounded() {
        let mut h = highlighter(2);
        h.highlight("txt", "one\n");
        h.highlight("txt", "two\n");
        h.highlight("txt", "three\n");
        assert_eq!(h.cached_len(), 2);
        // Same key again is a hit, so the size stays put.
        h.highlight("txt", "three\n");
        assert_eq!(h.cached_len(), 2);
    }
}
