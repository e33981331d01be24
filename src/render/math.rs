//! Math expressions: `$...$`, `$$...$$`, `\[...\]` and named environments.

use std::ops::Range;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use thiserror::Error;

use super::cache::BoundedCache;
use super::escape_html;
use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MathMode {
    Inline,
    Display,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct MathError(pub String);

/// Typesetting backend. Implementations turn a TeX expression into markup.
pub trait MathEngine: Send + Sync {
    fn render(&self, expr: &str, mode: MathMode, trust: bool) -> Result<String, MathError>;
}

/// Commands that can inject links, classes or external resources.
const UNTRUSTED_COMMANDS: &[&str] = &["\\href", "\\url", "\\includegraphics", "\\htmlClass", "\\htmlId", "\\htmlStyle", "\\htmlData"];

/// Validates TeX and emits it with standard delimiters for client-side
/// typesetting (`\(...\)` inline, `\[...\]` display).
#[derive(Debug, Default, Clone, Copy)]
pub struct DelimitedTexEngine;

impl MathEngine for DelimitedTexEngine {
    fn render(&self, expr: &str, mode: MathMode, trust: bool) -> Result<String, MathError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(MathError("empty expression".into()));
        }
        check_braces(expr)?;
        check_environments(expr)?;
        if !trust {
            if let Some(cmd) = UNTRUSTED_COMMANDS.iter().find(|cmd| expr.contains(*cmd)) {
                return Err(MathError(format!("{cmd} is not allowed in untrusted mode")));
            }
        }
        let escaped = escape_html(expr);
        Ok(match mode {
            MathMode::Inline => format!(r#"<span class="math math-inline">\({escaped}\)</span>"#),
            MathMode::Display => format!(r#"<span class="math math-display">\[{escaped}\]</span>"#),
        })
    }
}

fn check_braces(expr: &str) -> Result<(), MathError> {
    let mut depth = 0i32;
    let mut chars = expr.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth < 0 {
                    return Err(MathError("unexpected '}'".into()));
                }
            }
            _ => {}
        }
    }
    if depth > 0 {
        return Err(MathError("missing '}'".into()));
    }
    Ok(())
}

fn env_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\\(begin|end)\{([A-Za-z*]+)\}").expect("environment pattern is valid"))
}

fn check_environments(expr: &str) -> Result<(), MathError> {
    let mut open: Vec<&str> = Vec::new();
    for cap in env_regex().captures_iter(expr) {
        let name = cap.get(2).map_or("", |m| m.as_str());
        if &cap[1] == "begin" {
            open.push(name);
        } else if open.pop() != Some(name) {
            return Err(MathError(format!("unbalanced \\end{{{name}}}")));
        }
    }
    match open.pop() {
        Some(name) => Err(MathError(format!("missing \\end{{{name}}}"))),
        None => Ok(()),
    }
}

/// Caching front end over a [`MathEngine`], keyed by (expression, mode, trust).
pub struct MathRenderer {
    engine: Box<dyn MathEngine>,
    cache: BoundedCache<(String, MathMode, bool), String>,
    trust: bool,
}

impl MathRenderer {
    pub fn new(engine: Box<dyn MathEngine>, cache_size: usize, trust: bool, clock: Arc<dyn Clock>) -> Self {
        Self { engine, cache: BoundedCache::new(cache_size, None, clock), trust }
    }

    /// Render an expression. Failures become an inline error marker.
    pub fn render(&mut self, expr: &str, mode: MathMode) -> String {
        let key = (expr.to_string(), mode, self.trust);
        if let Some(hit) = self.cache.get(&key) {
            return hit.clone();
        }
        let html = match self.engine.render(expr, mode, self.trust) {
            Ok(html) => html,
            Err(e) => {
                tracing::debug!("Math render failed: {e}");
                let source = match mode {
                    MathMode::Inline => format!("${expr}$"),
                    MathMode::Display => format!("$${expr}$$"),
                };
                format!(
                    r#"<span class="math-error" title="{}">{}</span>"#,
                    escape_html(&e.0),
                    escape_html(&source)
                )
            }
        };
        self.cache.insert(key, html.clone());
        html
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

/// Environments rewritten to `$$...$$` blocks before Markdown parsing.
const BLOCK_ENVIRONMENTS: &[&str] = &[
    "align", "align*", "equation", "equation*", "gather", "gather*", "multline", "multline*",
    "matrix", "pmatrix", "bmatrix", "Bmatrix", "vmatrix", "Vmatrix", "cases",
];

fn bracket_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\\\[(.+?)\\\]").expect("bracket pattern is valid"))
}

fn begin_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\\begin\{([A-Za-z*]+)\}").expect("begin pattern is valid"))
}

/// Rewrite `\[...\]` and bare block environments as `$$...$$` so the
/// Markdown parser sees them as display math. Fenced code, indented code and
/// inline code spans are left alone.
pub fn normalize_block_math(source: &str) -> String {
    if !source.contains("\\[") && !source.contains("\\begin{") {
        return source.to_string();
    }

    let mut out = String::with_capacity(source.len() + 16);
    let mut prose = String::new();
    let mut fence: Option<&str> = None;
    let mut prev_blank = true;
    let mut indented_code = false;

    for line in source.split_inclusive('\n') {
        let trimmed = line.trim_start();
        let blank = trimmed.is_empty();
        match fence {
            Some(marker) => {
                out.push_str(line);
                if trimmed.starts_with(marker) {
                    fence = None;
                }
            }
            None if trimmed.starts_with("```") || trimmed.starts_with("~~~") => {
                out.push_str(&rewrite_prose(&prose));
                prose.clear();
                out.push_str(line);
                fence = Some(&trimmed[..3]);
                indented_code = false;
            }
            None => {
                // An indented code block cannot interrupt a paragraph.
                if !blank {
                    indented_code = is_indented(line) && (prev_blank || indented_code);
                }
                if indented_code && !blank {
                    out.push_str(&rewrite_prose(&prose));
                    prose.clear();
                    out.push_str(line);
                } else {
                    prose.push_str(line);
                }
            }
        }
        prev_blank = blank;
    }
    out.push_str(&rewrite_prose(&prose));
    out
}

fn is_indented(line: &str) -> bool {
    line.starts_with("    ") || line.starts_with('\t')
}

/// Byte ranges of backtick code spans, delimiters included. A span closes on
/// the next run of exactly as many backticks as opened it.
fn code_span_ranges(text: &str) -> Vec<Range<usize>> {
    let bytes = text.as_bytes();
    let run_end = |mut i: usize| {
        while i < bytes.len() && bytes[i] == b'`' {
            i += 1;
        }
        i
    };

    let mut ranges = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'`' {
            i += 1;
            continue;
        }
        let open = i;
        i = run_end(i);
        let width = i - open;

        let mut j = i;
        while j < bytes.len() {
            if bytes[j] != b'`' {
                j += 1;
                continue;
            }
            let close = j;
            j = run_end(j);
            if j - close == width {
                ranges.push(open..j);
                i = j;
                break;
            }
        }
    }
    ranges
}

fn in_code(ranges: &[Range<usize>], pos: usize) -> bool {
    ranges.iter().any(|r| r.contains(&pos))
}

fn rewrite_prose(prose: &str) -> String {
    if prose.is_empty() {
        return String::new();
    }
    let code = code_span_ranges(prose);
    let bracketed = bracket_regex().replace_all(prose, |caps: &regex::Captures<'_>| match caps.get(0) {
        Some(whole) if in_code(&code, whole.start()) => whole.as_str().to_string(),
        _ => format!("$${}$$", &caps[1]),
    });
    let code = code_span_ranges(&bracketed);
    wrap_environments(&bracketed, &code)
}

fn wrap_environments(text: &str, code: &[Range<usize>]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;
    while let Some(cap) = begin_regex().captures_at(text, pos) {
        let (Some(whole), Some(name)) = (cap.get(0), cap.get(1)) else { break };
        if in_code(code, whole.start()) {
            out.push_str(&text[pos..whole.end()]);
            pos = whole.end();
            continue;
        }
        let name = name.as_str();
        let end_tag = format!("\\end{{{name}}}");
        let already_math = text[..whole.start()].trim_end().ends_with('$');

        match text[whole.end()..].find(&end_tag) {
            Some(rel) if BLOCK_ENVIRONMENTS.contains(&name) && !already_math => {
                let end = whole.end() + rel + end_tag.len();
                out.push_str(&text[pos..whole.start()]);
                out.push_str("$$");
                out.push_str(&text[whole.start()..end]);
                out.push_str("$$");
                pos = end;
            }
            Some(rel) => {
                let end = whole.end() + rel + end_tag.len();
                out.push_str(&text[pos..end]);
                pos = end;
            }
            None => {
                out.push_str(&text[pos..whole.end()]);
                pos = whole.end();
            }
        }
    }
    out.push_str(&text[pos..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn renderer() -> MathRenderer {
        MathRenderer::new(Box::new(DelimitedTexEngine), 8, false, Arc::new(ManualClock::new(0)))
    }

    #[test]
    fn inline_and_display_delimiters() {
        let mut r = renderer();
        assert_eq!(r.render("x^2", MathMode::Inline), r#"<span class="math math-inline">\(x^2\)</span>"#);
        assert_eq!(r.render("a<b", MathMode::Display), r#"<span class="math math-display">\[a&lt;b\]</span>"#);
    }

    #[test]
    fn malformed_expression_renders_error_marker() {
        let mut r = renderer();
        let html = r.render(r"\frac{1}{2", MathMode::Inline);
        assert!(html.starts_with(r#"<span class="math-error" title="missing '}'">"#));
        assert!(html.contains(r"$\frac{1}{2$"));
    }

    #[test]
    fn environments_must_balance() {
        let engine = DelimitedTexEngine;
        assert!(engine.render(r"\begin{matrix}1\end{matrix}", MathMode::Display, false).is_ok());
        assert!(engine.render(r"\begin{matrix}1\end{pmatrix}", MathMode::Display, false).is_err());
        assert!(engine.render(r"\begin{cases}x", MathMode::Display, false).is_err());
    }

    #[test]
    fn trust_gates_link_commands() {
        let engine = DelimitedTexEngine;
        let expr = r"\href{https://example.com}{x}";
        assert!(engine.render(expr, MathMode::Inline, false).is_err());
        assert!(engine.render(expr, MathMode::Inline, true).is_ok());
    }

    #[test]
    fn results_are_cached_per_mode() {
        let mut r = renderer();
        r.render("x", MathMode::Inline);
        r.render("x", MathMode::Inline);
        assert_eq!(r.cached_len(), 1);
        r.render("x", MathMode::Display);
        assert_eq!(r.cached_len(), 2);
    }

    #[test]
    fn brackets_become_display_math() {
        assert_eq!(normalize_block_math(r"before \[x+1\] after"), "before $$x+1$$ after");
    }

    #[test]
    fn bare_environments_are_wrapped_once() {
        let src = "\\begin{align}\na &= b\n\\end{align}\n";
        assert_eq!(normalize_block_math(src), "$$\\begin{align}\na &= b\n\\end{align}$$\n");

        let already = "$$\\begin{matrix}1\\end{matrix}$$";
        assert_eq!(normalize_block_math(already), already);

        let unknown = "\\begin{tikzpicture}x\\end{tikzpicture}";
        assert_eq!(normalize_block_math(unknown), unknown);
    }

    #[test]
    fn fenced_code_is_untouched() {
        let src = "```\n\\[x\\]\n```\n\\[y\\]\n";
        assert_eq!(normalize_block_math(src), "```\n\\[x\\]\n```\n$$y$$\n");
    }

    #[test]
    fn inline_code_spans_are_untouched() {
        let src = "Write `\\[x\\]` for display, or ``\\begin{align}a\\end{align}``. Then \\[y\\]";
        assert_eq!(
            normalize_block_math(src),
            "Write `\\[x\\]` for display, or ``\\begin{align}a\\end{align}``. Then $$y$$"
        );
        // An unclosed backtick run is literal text.
        assert_eq!(normalize_block_math("a ` \\[z\\]"), "a ` $$z$$");
    }

    #[test]
    fn indented_code_is_untouched() {
        let src = "text\n\n    \\[x\\]\n\tmore \\[w\\]\n\n\\[y\\]\n";
        assert_eq!(normalize_block_math(src), "text\n\n    \\[x\\]\n\tmore \\[w\\]\n\n$$y$$\n");

        // A paragraph continuation line is not code.
        let lazy = "text\n    \\[x\\]\n";
        assert_eq!(normalize_block_math(lazy), "text\n    $$x$$\n");
    }

    #[test]
    fn code_span_ranges_match_run_width() {
        assert_eq!(code_span_ranges("a `b` c"), vec![2..5]);
        assert_eq!(code_span_ranges("``a`b``"), vec![0..7]);
        assert!(code_span_ranges("no `close").is_empty());
    }
}
